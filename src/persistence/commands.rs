//! Saved commands: named topic/payload pairs the control surface can fire.
//!
//! The catalog is read-only for the connection manager. It is loaded from the
//! application config and only consulted to look up what to publish.

use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tracing::warn;

/// Color tag shown next to a command
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ButtonColor {
    #[default]
    Primary,
    Success,
    Danger,
    Warning,
    Info,
}

impl fmt::Display for ButtonColor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ButtonColor::Primary => "primary",
            ButtonColor::Success => "success",
            ButtonColor::Danger => "danger",
            ButtonColor::Warning => "warning",
            ButtonColor::Info => "info",
        };
        write!(f, "{}", name)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SavedCommand {
    pub name: String,
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub color: ButtonColor,
}

impl SavedCommand {
    /// Creates a command, wrapping a payload that is not JSON as `{"msg": …}`.
    pub fn new(
        name: &str,
        topic: &str,
        payload: &str,
        description: &str,
        color: ButtonColor,
    ) -> Result<Self> {
        let (name, topic, payload) = (name.trim(), topic.trim(), payload.trim());
        if name.is_empty() || topic.is_empty() || payload.is_empty() {
            return Err(eyre!("Command name, topic and payload must not be empty"));
        }

        let payload = match serde_json::from_str::<Value>(payload) {
            Ok(_) => payload.to_string(),
            Err(_) => serde_json::to_string(&json!({ "msg": payload }))?,
        };

        Ok(Self {
            name: name.to_string(),
            topic: topic.to_string(),
            payload,
            description: description.trim().to_string(),
            color,
        })
    }

    /// Payload as JSON, falling back to `{"msg": payload}` for plain text.
    pub fn payload_value(&self) -> Value {
        serde_json::from_str(&self.payload).unwrap_or_else(|_| json!({ "msg": self.payload }))
    }
}

impl fmt::Display for SavedCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}] -> {}", self.name, self.color, self.topic)?;
        if !self.description.is_empty() {
            write!(f, " ({})", self.description)?;
        }
        Ok(())
    }
}

/// Commands in the order they were configured
#[derive(Clone, Debug, Default)]
pub struct CommandCatalog {
    commands: Vec<SavedCommand>,
}

impl CommandCatalog {
    /// Builds the catalog from configured entries.
    ///
    /// Every entry goes through [`SavedCommand::new`], so hand-edited plain
    /// text payloads end up wrapped as well. Entries that fail validation are
    /// logged and left out.
    pub fn new(commands: Vec<SavedCommand>) -> Self {
        let commands = commands
            .into_iter()
            .filter_map(|c| {
                match SavedCommand::new(&c.name, &c.topic, &c.payload, &c.description, c.color) {
                    Ok(command) => Some(command),
                    Err(e) => {
                        warn!("Skipping saved command '{}': {}", c.name, e);
                        None
                    }
                }
            })
            .collect();
        Self { commands }
    }

    pub fn find(&self, name: &str) -> Option<&SavedCommand> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SavedCommand> {
        self.commands.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
