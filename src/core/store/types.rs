use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Canonical on-disk timestamp: RFC 3339, UTC, millisecond precision, `Z` suffix.
/// Every timestamp the kernel compares goes through this so string order is time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub fn normalize_timestamp(raw: &str) -> Option<String> {
    parse_timestamp(raw).map(format_timestamp)
}

/// Parses an absolute RFC 3339 instant, or a naive `YYYY-MM-DD[T ]HH:MM[:SS]` read in `tz`.
pub fn parse_local_datetime(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    if let Some(ts) = parse_timestamp(raw) {
        return Some(ts);
    }
    let raw = raw.trim();
    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    FORMATS.iter().find_map(|fmt| {
        let naive = NaiveDateTime::parse_from_str(raw, fmt).ok()?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|ts| ts.with_timezone(&Utc))
    })
}

/// A row of the durable message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
}

impl StoredMessage {
    pub fn cursor(&self) -> RouterCursor {
        RouterCursor {
            timestamp: self.timestamp.clone(),
            message_id: self.id.clone(),
        }
    }
}

/// Position of the last routed message. Field order gives the `(timestamp, id)`
/// lexicographic ordering through the derived `Ord`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouterCursor {
    pub timestamp: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatInfo {
    pub chat_id: String,
    pub name: String,
    pub last_message_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    Group,
    #[default]
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw.trim().to_ascii_lowercase().as_str() {
                    $($text => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(ScheduleType { Cron => "cron", Interval => "interval", Once => "once" });
text_enum!(ContextMode { Group => "group", Isolated => "isolated" });
text_enum!(TaskStatus { Active => "active", Paused => "paused", Completed => "completed" });
text_enum!(RunStatus { Success => "success", Error => "error" });

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_id: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    pub status: TaskStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRunLog {
    pub task_id: String,
    pub run_at: String,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_timestamps_sort_chronologically() {
        let a = normalize_timestamp("2024-01-01T10:00:00+02:00").unwrap();
        let b = normalize_timestamp("2024-01-01T09:30:00Z").unwrap();
        assert_eq!(a, "2024-01-01T08:00:00.000Z");
        assert!(a < b);
    }

    #[test]
    fn cursor_orders_by_timestamp_then_id() {
        let c = |ts: &str, id: &str| RouterCursor {
            timestamp: ts.to_string(),
            message_id: id.to_string(),
        };
        assert!(c("2024-01-01T00:00:00.000Z", "b") > c("2024-01-01T00:00:00.000Z", "a"));
        assert!(c("2024-01-01T00:00:01.000Z", "a") > c("2024-01-01T00:00:00.000Z", "z"));
        assert!(RouterCursor::default() < c("2024-01-01T00:00:00.000Z", ""));
    }

    #[test]
    fn local_datetime_uses_timezone() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let ts = parse_local_datetime("2024-07-01 12:00", tz).unwrap();
        assert_eq!(format_timestamp(ts), "2024-07-01T10:00:00.000Z");
        let abs = parse_local_datetime("2024-07-01T12:00:00Z", tz).unwrap();
        assert_eq!(format_timestamp(abs), "2024-07-01T12:00:00.000Z");
        assert!(parse_local_datetime("tomorrow", tz).is_none());
    }

    #[test]
    fn text_enums_parse_case_insensitively() {
        assert_eq!(ScheduleType::parse("CRON"), Some(ScheduleType::Cron));
        assert_eq!(ContextMode::parse("group"), Some(ContextMode::Group));
        assert_eq!(TaskStatus::parse("done"), None);
        assert_eq!(RunStatus::Error.to_string(), "error");
    }
}
