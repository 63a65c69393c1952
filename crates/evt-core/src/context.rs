//! Context type for tracking the origin and causality of fires

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::EventId;

/// Context for tracking why an action ran
///
/// Every message posted on the bus and every dispatched action carries a
/// Context. When an action posts a message, the message context is a child
/// of the action's context, so chains of fires can be traced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier for this context (ULID)
    pub id: String,

    /// Parent context ID for tracking causality chains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Event whose fire created this context (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<EventId>,
}

impl Context {
    /// Create a new context with a fresh ULID
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: None,
            origin: None,
        }
    }

    /// Create a new context with a specific ID
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            origin: None,
        }
    }

    /// Create a context for a fire of the given event
    pub fn for_event(origin: EventId) -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: None,
            origin: Some(origin),
        }
    }

    /// Create a child context with this context as parent
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: Some(self.id.clone()),
            origin: self.origin.clone(),
        }
    }

    /// Create a child context attributed to a different event
    pub fn child_for_event(&self, origin: EventId) -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: Some(self.id.clone()),
            origin: Some(origin),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_links_parent() {
        let origin = EventId::new("m", "e").unwrap();
        let root = Context::for_event(origin.clone());
        let child = root.child();

        assert_ne!(root.id, child.id);
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(child.origin, Some(origin));
        assert_eq!(child.id.len(), 26);
    }

    #[test]
    fn test_child_for_event_reattributes() {
        let root = Context::new();
        let other = EventId::new("m", "other").unwrap();
        let child = root.child_for_event(other.clone());

        assert_eq!(child.origin, Some(other));
        assert_eq!(child.parent_id, Some(root.id));
    }
}
