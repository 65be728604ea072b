use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;

/// Compiles a conversation trigger into a case-insensitive pattern anchored at the
/// start of the message. A trigger ending in a word character must also end on a
/// word boundary, so `@Andy` does not fire on `@Andyson`.
pub fn trigger_regex(trigger: &str) -> Option<Regex> {
    let trigger = trigger.trim();
    if trigger.is_empty() {
        return None;
    }
    let mut pattern = format!("^{}", regex::escape(trigger));
    if trigger
        .chars()
        .last()
        .is_some_and(|c| c.is_alphanumeric() || c == '_')
    {
        pattern.push_str(r"\b");
    }
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .ok()
}

/// Compiled triggers keyed by trigger text, so a re-registered trigger compiles fresh.
#[derive(Default)]
pub struct TriggerCache {
    compiled: Mutex<HashMap<String, Option<Regex>>>,
}

impl TriggerCache {
    pub fn matches(&self, trigger: &str, content: &str) -> bool {
        let mut compiled = self.compiled.lock();
        compiled
            .entry(trigger.to_string())
            .or_insert_with(|| trigger_regex(trigger))
            .as_ref()
            .is_some_and(|re| re.is_match(content.trim_start()))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.compiled.lock().len()
    }
}
