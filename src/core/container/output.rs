use serde::{Deserialize, Serialize};

pub const OUTPUT_START_MARKER: &str = "---KESTREL_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---KESTREL_OUTPUT_END---";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Success,
    Error,
}

/// The one structured object a worker prints on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOutput {
    pub status: WorkerStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerOutput {
    pub fn success(result: Option<&str>, new_session_id: Option<&str>) -> Self {
        Self {
            status: WorkerStatus::Success,
            result: result.map(str::to_string),
            new_session_id: new_session_id.map(str::to_string),
            error: None,
        }
    }
}

/// Extract the worker payload from stdout.
///
/// The last complete `START ... END` block wins. Without one, the last non-blank
/// line is tried. A payload without a valid `status` is a parse error.
pub fn parse_worker_output(stdout: &str) -> Result<WorkerOutput, String> {
    let candidate = match sentinel_block(stdout) {
        Some(block) => block,
        None => stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| "worker produced no output".to_string())?,
    };

    let value: serde_json::Value = serde_json::from_str(candidate)
        .map_err(|e| format!("worker output is not JSON: {}", e))?;
    if value.get("status").is_none() {
        return Err("worker output has no status field".to_string());
    }
    serde_json::from_value(value).map_err(|e| format!("worker output is malformed: {}", e))
}

fn sentinel_block(stdout: &str) -> Option<&str> {
    let start = stdout.rfind(OUTPUT_START_MARKER)?;
    let body_start = start + OUTPUT_START_MARKER.len();
    let end = stdout[body_start..].find(OUTPUT_END_MARKER)?;
    Some(stdout[body_start..body_start + end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sentinel_block_among_logs() {
        let stdout = format!(
            "booting\n{}\n{{\"status\":\"success\",\"result\":\"hi\",\"newSessionId\":\"s-2\"}}\n{}\ntrailing log\n",
            OUTPUT_START_MARKER, OUTPUT_END_MARKER
        );
        let out = parse_worker_output(&stdout).unwrap();
        assert_eq!(out, WorkerOutput::success(Some("hi"), Some("s-2")));
    }

    #[test]
    fn falls_back_to_last_non_blank_line() {
        let stdout = "log\n{\"status\":\"error\",\"result\":null,\"error\":\"boom\"}\n\n   \n";
        let out = parse_worker_output(stdout).unwrap();
        assert_eq!(out.status, WorkerStatus::Error);
        assert_eq!(out.error.as_deref(), Some("boom"));
        assert_eq!(out.result, None);
    }

    #[test]
    fn unterminated_sentinel_uses_fallback() {
        let stdout = format!("{}\n{{\"status\":\"success\"}}", OUTPUT_START_MARKER);
        assert_eq!(parse_worker_output(&stdout).unwrap().status, WorkerStatus::Success);
    }

    #[test]
    fn missing_status_is_a_parse_error() {
        let err = parse_worker_output("{\"result\":\"hi\"}").unwrap_err();
        assert!(err.contains("status"));
        assert!(parse_worker_output("{\"status\":\"maybe\"}").is_err());
        assert!(parse_worker_output("plain text").is_err());
        assert!(parse_worker_output("\n\n").is_err());
    }
}
