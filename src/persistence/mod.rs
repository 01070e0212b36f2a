//! # Persistence Module
//!
//! Storage that lives next to the broker connection but is not owned by it:
//!
//! - [`message_log`] keeps every sent and received message as an append-only
//!   JSON-lines file and backs the manager's `MessageRecorder`.
//! - [`commands`] holds the saved-command catalog that the control surface
//!   reads to find out what to publish.
//!
//! Both follow a fail-safe approach: a missing history file reads as an empty
//! history, and a malformed line is skipped with a warning instead of making
//! the whole log unreadable.

pub mod commands;
pub mod message_log;

pub use commands::{ButtonColor, CommandCatalog, SavedCommand};
pub use message_log::JsonlMessageLog;
