//! Line based control surface.
//!
//! Reads one command per line and drives the [`ConnectionManager`]. Parsing
//! is kept separate from execution so each side can be tested on its own.

use std::ops::ControlFlow;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::mqtt::ConnectionManager;
use crate::persistence::{CommandCatalog, JsonlMessageLog};

const DEFAULT_HISTORY: usize = 20;

const HELP: &str = "\
commands:
  publish <topic> <payload>   send a message
  subscribe <topic>           subscribe to a topic filter
  unsubscribe <topic>         drop a topic filter
  status                      connection state and subscriptions
  commands                    list saved commands
  run <name>                  publish a saved command
  history [n]                 latest n messages (default 20)
  clear                       delete the message history
  help                        this text
  quit                        close the connection and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Publish { topic: String, payload: String },
    Subscribe(String),
    Unsubscribe(String),
    Status,
    Commands,
    Run(String),
    History(usize),
    Clear,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("payload must not be empty")]
    EmptyPayload,

    #[error("missing {0}")]
    MissingArgument(&'static str),

    #[error("'{0}' is not a number")]
    InvalidNumber(String),

    #[error("unknown command '{0}', try 'help'")]
    Unknown(String),
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "publish" | "pub" => {
            let (topic, payload) = match rest.split_once(char::is_whitespace) {
                Some((topic, payload)) => (topic, payload.trim()),
                None => (rest, ""),
            };
            if topic.is_empty() {
                return Err(ConsoleError::EmptyTopic);
            }
            if payload.is_empty() {
                return Err(ConsoleError::EmptyPayload);
            }
            ConsoleCommand::Publish {
                topic: topic.to_string(),
                payload: payload.to_string(),
            }
        }
        "subscribe" | "sub" => ConsoleCommand::Subscribe(topic_arg(rest)?),
        "unsubscribe" | "unsub" => ConsoleCommand::Unsubscribe(topic_arg(rest)?),
        "status" => ConsoleCommand::Status,
        "commands" | "list" => ConsoleCommand::Commands,
        "run" => {
            if rest.is_empty() {
                return Err(ConsoleError::MissingArgument("command name"));
            }
            ConsoleCommand::Run(rest.to_string())
        }
        "history" => {
            if rest.is_empty() {
                ConsoleCommand::History(DEFAULT_HISTORY)
            } else {
                let limit = rest
                    .parse()
                    .map_err(|_| ConsoleError::InvalidNumber(rest.to_string()))?;
                ConsoleCommand::History(limit)
            }
        }
        "clear" => ConsoleCommand::Clear,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(ConsoleError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn topic_arg(rest: &str) -> Result<String, ConsoleError> {
    if rest.is_empty() {
        Err(ConsoleError::EmptyTopic)
    } else {
        Ok(rest.to_string())
    }
}

pub struct Console {
    manager: ConnectionManager,
    catalog: CommandCatalog,
    log: Arc<JsonlMessageLog>,
}

impl Console {
    pub fn new(manager: ConnectionManager, catalog: CommandCatalog, log: Arc<JsonlMessageLog>) -> Self {
        Self {
            manager,
            catalog,
            log,
        }
    }

    /// Runs one command and returns the text to show, or `Break` on quit.
    pub async fn execute(&self, command: ConsoleCommand) -> ControlFlow<(), String> {
        debug!("Console command: {:?}", command);
        let reply = match command {
            ConsoleCommand::Publish { topic, payload } => {
                if self.manager.publish(&topic, payload).await {
                    "message sent".to_string()
                } else {
                    "message could not be sent".to_string()
                }
            }
            ConsoleCommand::Subscribe(topic) => {
                if self.manager.subscribe(&topic).await {
                    format!("subscribed to {}", topic)
                } else {
                    format!("subscribe to {} failed", topic)
                }
            }
            ConsoleCommand::Unsubscribe(topic) => {
                if self.manager.unsubscribe(&topic).await {
                    format!("unsubscribed from {}", topic)
                } else {
                    format!("unsubscribe from {} failed", topic)
                }
            }
            ConsoleCommand::Status => self.render_status().await,
            ConsoleCommand::Commands => {
                if self.catalog.is_empty() {
                    "no saved commands".to_string()
                } else {
                    self.catalog
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            ConsoleCommand::Run(name) => match self.catalog.find(&name) {
                Some(command) => {
                    if self
                        .manager
                        .publish(&command.topic, command.payload.as_str())
                        .await
                    {
                        format!(
                            "command \"{}\" executed: {} - {}",
                            command.name, command.topic, command.payload
                        )
                    } else {
                        format!(
                            "command \"{}\" failed, check the MQTT connection",
                            command.name
                        )
                    }
                }
                None => format!("no saved command named \"{}\"", name),
            },
            ConsoleCommand::History(limit) => match self.log.recent(limit).await {
                Ok(records) if records.is_empty() => "no messages recorded".to_string(),
                Ok(records) => records
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => {
                    warn!("Failed to read message history: {}", e);
                    format!("history unavailable: {}", e)
                }
            },
            ConsoleCommand::Clear => match self.log.clear().await {
                Ok(count) => format!("cleared {} message record(s)", count),
                Err(e) => {
                    warn!("Failed to clear message history: {}", e);
                    format!("clearing history failed: {}", e)
                }
            },
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => return ControlFlow::Break(()),
        };
        ControlFlow::Continue(reply)
    }

    async fn render_status(&self) -> String {
        let status = self.manager.status().await;
        let topics = if status.subscribed_topics.is_empty() {
            "-".to_string()
        } else {
            status
                .subscribed_topics
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };
        let last_activity = status
            .last_activity
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());

        format!(
            "connected: {} ({:?})\nsubscribed: {}\nsent: {}  received: {}\nlast activity: {}",
            if status.connected { "yes" } else { "no" },
            status.state,
            topics,
            status.messages_sent,
            status.messages_received,
            last_activity
        )
    }

    /// Reads commands until `quit` or end of input.
    pub async fn run<R, W>(&self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| eyre!("Failed to read console input: {}", e))?
        {
            let reply = match parse_line(&line) {
                Ok(None) => continue,
                Ok(Some(command)) => match self.execute(command).await {
                    ControlFlow::Continue(reply) => reply,
                    ControlFlow::Break(()) => break,
                },
                Err(e) => format!("error: {}", e),
            };
            output
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .map_err(|e| eyre!("Failed to write console output: {}", e))?;
            output
                .flush()
                .await
                .map_err(|e| eyre!("Failed to flush console output: {}", e))?;
        }
        info!("Console input finished");
        Ok(())
    }
}
