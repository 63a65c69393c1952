//! Event identity: a namespace/name pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid event identities
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventIdError {
    #[error("event id must have the form namespace/name")]
    InvalidFormat,

    #[error("namespace cannot be empty")]
    EmptyNamespace,

    #[error("event name cannot be empty")]
    EmptyName,

    #[error("namespace cannot contain '/' or control characters")]
    InvalidNamespaceChars,

    #[error("event name cannot contain control characters")]
    InvalidNameChars,
}

/// Identity of an event: the owning namespace (module) and the event's name
///
/// The namespace may not contain `/`; the name may, so that
/// `"lights/porch/motion"` parses as namespace `lights`, name `porch/motion`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId {
    namespace: String,
    name: String,
}

impl EventId {
    /// Create a new EventId from its namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, EventIdError> {
        let namespace = namespace.into();
        let name = name.into();

        if namespace.is_empty() {
            return Err(EventIdError::EmptyNamespace);
        }
        if name.is_empty() {
            return Err(EventIdError::EmptyName);
        }
        if namespace.contains('/') || namespace.chars().any(char::is_control) {
            return Err(EventIdError::InvalidNamespaceChars);
        }
        if name.chars().any(char::is_control) {
            return Err(EventIdError::InvalidNameChars);
        }

        Ok(Self { namespace, name })
    }

    /// The owning namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The event's name within its namespace
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for EventId {
    type Err = EventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = s.split_once('/').ok_or(EventIdError::InvalidFormat)?;
        Self::new(namespace, name)
    }
}

impl TryFrom<String> for EventId {
    type Error = EventIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> String {
        id.to_string()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
