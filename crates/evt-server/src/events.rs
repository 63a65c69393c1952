//! Event definitions loaded from YAML
//!
//! ```yaml
//! events:
//!   - id: climate/too_hot
//!     trigger: "temp > limit"
//!     action: "fan = true"
//!     setup: "limit = 28; temp = 0"
//!     priority: high
//!     rate_limit: 60
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use evt_core::{EventId, Priority};
use evt_engine::{Action, Engine, EventDefinition, EventOptions};
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Deserialize)]
pub struct EventFile {
    #[serde(default)]
    pub events: Vec<EventEntry>,
}

/// One scripted event
#[derive(Debug, Clone, Deserialize)]
pub struct EventEntry {
    pub id: EventId,
    pub trigger: String,
    /// Action script
    pub action: String,
    #[serde(default)]
    pub setup: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Seconds between fires
    #[serde(default)]
    pub rate_limit: f64,
    #[serde(default)]
    pub once: bool,
    #[serde(default)]
    pub continual: bool,
    #[serde(default)]
    pub allow_overlap: bool,
}

impl EventEntry {
    pub fn definition(&self) -> Result<EventDefinition> {
        let action = Action::script(&self.action)
            .with_context(|| format!("invalid action script for {}", self.id))?;

        let mut options = EventOptions::new()
            .priority(self.priority)
            .rate_limit_secs(self.rate_limit);
        if self.once {
            options = options.once();
        }
        if self.continual {
            options = options.continual();
        }
        if self.allow_overlap {
            options = options.allow_overlap();
        }
        if let Some(setup) = &self.setup {
            options = options.setup(setup.clone());
        }

        let definition = EventDefinition::parse(self.id.clone(), &self.trigger, action)
            .with_context(|| format!("invalid trigger for {}", self.id))?;
        Ok(definition.with_options(options))
    }
}

impl EventFile {
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading events: {:?}", path);
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Register every entry; an entry that fails is logged and skipped
    pub fn register_all(&self, engine: &Engine) -> usize {
        let mut registered = 0;
        for entry in &self.events {
            match entry
                .definition()
                .and_then(|def| engine.register(def).map_err(Into::into))
            {
                Ok(_) => registered += 1,
                Err(e) => warn!(event = %entry.id, "Skipping event: {:#}", e),
            }
        }
        info!(registered, total = self.events.len(), "Loaded events");
        registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evt_engine::EngineConfig;
    use std::time::Duration;

    const EVENTS: &str = r#"
events:
  - id: climate/too_hot
    trigger: "temp > limit"
    action: "fan = true"
    setup: "limit = 28; temp = 0"
    priority: high
    rate_limit: 60
  - id: climate/log
    trigger: "!onmsg /sensors/#"
    action: "last = message"
    allow_overlap: true
  - id: climate/broken
    trigger: "!nonsense"
    action: "x = 1"
"#;

    #[test]
    fn test_parse_entries() {
        let file = EventFile::parse(EVENTS).unwrap();
        assert_eq!(file.events.len(), 3);

        let def = file.events[0].definition().unwrap();
        assert_eq!(def.options.priority, Priority::High);
        assert_eq!(def.options.rate_limit, Duration::from_secs(60));
        assert_eq!(def.options.setup.as_deref(), Some("limit = 28; temp = 0"));
        assert!(file.events[1].definition().unwrap().options.allow_overlap);
        assert!(file.events[2].definition().is_err());
    }

    #[test]
    fn test_register_all_skips_bad_entries() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let file = EventFile::parse(EVENTS).unwrap();
        assert_eq!(file.register_all(&engine), 2);
        assert_eq!(engine.count(), 2);

        let scope = engine.scopes().get("climate").unwrap();
        assert_eq!(scope.get("limit"), Some(28.into()));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.yaml");
        fs::write(&path, EVENTS).unwrap();
        assert_eq!(EventFile::load(&path).unwrap().events.len(), 3);

        assert!(EventFile::load(dir.path().join("missing.yaml")).is_err());
        assert!(EventFile::parse("").unwrap().events.is_empty());
    }
}
