//! Messages carried by the in-process message bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;

/// A message posted to a topic on the message bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Hierarchical topic, e.g. `/system/notifications/errors`
    pub topic: String,

    /// The message payload
    pub payload: serde_json::Value,

    /// When the message was posted
    pub time_posted: DateTime<Utc>,

    /// Context tracking the origin and causality
    pub context: Context,
}

impl Message {
    /// Create a new message with current timestamp and a fresh context
    pub fn new(topic: impl Into<String>, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            time_posted: Utc::now(),
            context: Context::new(),
        }
    }

    /// Replace the message's context
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}
