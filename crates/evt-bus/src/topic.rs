//! Hierarchical topic patterns

use std::fmt;

use crate::BusError;

/// Wildcard segment matching a topic and everything below it
pub const WILDCARD: &str = "#";

/// A subscription pattern
///
/// Patterns are exact by default. A trailing `/#` segment matches the prefix
/// path itself and any topic below it, so `/system/notifications/#` matches
/// `/system/notifications` and `/system/notifications/errors` but not
/// `/system/notificationsx`. A bare `#` matches every topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    prefix: Option<String>,
}

/// Add a leading `/` and strip trailing ones, so `a/b/` and `/a/b` are the same topic
pub fn normalize_topic(topic: &str) -> String {
    let trimmed = topic.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

impl TopicPattern {
    pub fn new(pattern: &str) -> Result<Self, BusError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }

        if pattern == WILDCARD || pattern == "/#" {
            return Ok(Self {
                raw: "/#".to_string(),
                prefix: Some(String::new()),
            });
        }

        if let Some(prefix) = pattern.strip_suffix("/#") {
            if prefix.contains('#') {
                return Err(BusError::InvalidPattern(pattern.to_string()));
            }
            let prefix = normalize_topic(prefix);
            return Ok(Self {
                raw: format!("{}/#", prefix),
                prefix: Some(prefix),
            });
        }

        if pattern.contains('#') {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }

        Ok(Self {
            raw: normalize_topic(pattern),
            prefix: None,
        })
    }

    pub fn is_wildcard(&self) -> bool {
        self.prefix.is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check whether a normalized topic matches this pattern
    pub fn matches(&self, topic: &str) -> bool {
        match &self.prefix {
            None => self.raw == topic,
            Some(prefix) if prefix.is_empty() => true,
            Some(prefix) => {
                topic == prefix
                    || (topic.starts_with(prefix.as_str())
                        && topic.as_bytes().get(prefix.len()) == Some(&b'/'))
            }
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
