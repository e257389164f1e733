//! Remote command interpreter
//!
//! Peers drive the recorder with space-delimited text commands:
//!
//! - `raiseFramerate` / `lowerFramerate`
//! - `start <triggerMillis>` (normal mode)
//! - `start <triggerMillis> <beforeSeconds> <afterSeconds>` (impact mode)
//! - `stop`
//! - `switchMode <impact|normal>`

use crate::recorder::coordinator::{RecordController, StopHandle};
use crate::recorder::state::{RecordMode, RecordWindow, RecorderError, RecorderEvent};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartCommand {
    Normal {
        trigger_ms: u64,
    },
    Impact {
        trigger_ms: u64,
        before: Duration,
        after: Duration,
    },
}

impl StartCommand {
    pub fn mode(&self) -> RecordMode {
        match self {
            StartCommand::Normal { .. } => RecordMode::Normal,
            StartCommand::Impact { .. } => RecordMode::Impact,
        }
    }

    pub fn trigger_ms(&self) -> u64 {
        match self {
            StartCommand::Normal { trigger_ms } | StartCommand::Impact { trigger_ms, .. } => {
                *trigger_ms
            }
        }
    }

    pub fn window(&self) -> RecordWindow {
        match *self {
            StartCommand::Normal { trigger_ms } => RecordWindow::starting_at(trigger_ms),
            StartCommand::Impact {
                trigger_ms,
                before,
                after,
            } => RecordWindow::new(trigger_ms, before, after),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RemoteCommand {
    RaiseFramerate,
    LowerFramerate,
    Start(StartCommand),
    Stop,
    SwitchMode(RecordMode),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command is not valid UTF-8")]
    NotUtf8,

    #[error("Empty command")]
    Empty,

    #[error("Unrecognized command: {0}")]
    Unrecognized(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Unknown mode: {0}")]
    UnknownMode(String),

    #[error("Unexpected arguments for {0}")]
    UnexpectedArguments(&'static str),
}

fn parse_millis(field: &'static str, value: &str) -> Result<u64, CommandError> {
    value.parse().map_err(|_| CommandError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_seconds(field: &'static str, value: &str) -> Result<Duration, CommandError> {
    let invalid = || CommandError::InvalidNumber {
        field,
        value: value.to_string(),
    };
    let seconds: f64 = value.parse().map_err(|_| invalid())?;
    let duration = Duration::try_from_secs_f64(seconds).map_err(|_| invalid())?;
    // Windows are kept in u64 milliseconds.
    u64::try_from(duration.as_millis()).map_err(|_| invalid())?;
    Ok(duration)
}

fn no_more<'a>(
    command: &'static str,
    mut rest: impl Iterator<Item = &'a str>,
) -> Result<(), CommandError> {
    match rest.next() {
        Some(_) => Err(CommandError::UnexpectedArguments(command)),
        None => Ok(()),
    }
}

impl FromStr for RemoteCommand {
    type Err = CommandError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut tokens = text.split_whitespace();
        let name = tokens.next().ok_or(CommandError::Empty)?;

        match name {
            "raiseFramerate" => {
                no_more("raiseFramerate", tokens)?;
                Ok(RemoteCommand::RaiseFramerate)
            }
            "lowerFramerate" => {
                no_more("lowerFramerate", tokens)?;
                Ok(RemoteCommand::LowerFramerate)
            }
            "stop" => {
                no_more("stop", tokens)?;
                Ok(RemoteCommand::Stop)
            }
            "switchMode" => {
                let mode = tokens.next().ok_or(CommandError::MissingArgument("mode"))?;
                let mode =
                    RecordMode::parse(mode).ok_or_else(|| CommandError::UnknownMode(mode.to_string()))?;
                no_more("switchMode", tokens)?;
                Ok(RemoteCommand::SwitchMode(mode))
            }
            "start" => {
                let trigger = tokens
                    .next()
                    .ok_or(CommandError::MissingArgument("trigger timestamp"))?;
                let trigger_ms = parse_millis("trigger timestamp", trigger)?;

                let before = match tokens.next() {
                    None => return Ok(RemoteCommand::Start(StartCommand::Normal { trigger_ms })),
                    Some(before) => parse_seconds("before seconds", before)?,
                };
                let after = tokens
                    .next()
                    .ok_or(CommandError::MissingArgument("after seconds"))?;
                let after = parse_seconds("after seconds", after)?;
                no_more("start", tokens)?;

                Ok(RemoteCommand::Start(StartCommand::Impact {
                    trigger_ms,
                    before,
                    after,
                }))
            }
            other => Err(CommandError::Unrecognized(other.to_string())),
        }
    }
}

/// Decode one inbound peer message
pub fn decode(bytes: &[u8]) -> Result<RemoteCommand, CommandError> {
    std::str::from_utf8(bytes)
        .map_err(|_| CommandError::NotUtf8)?
        .parse()
}

/// Run a decoded command against the controller.
///
/// Returns the stop pipeline when the command ended a recording.
pub async fn execute(
    controller: &RecordController,
    command: RemoteCommand,
) -> Result<Option<StopHandle>, RecorderError> {
    match command {
        RemoteCommand::RaiseFramerate => {
            controller.notify(RecorderEvent::RaiseFramerate);
            Ok(None)
        }
        RemoteCommand::LowerFramerate => {
            controller.notify(RecorderEvent::LowerFramerate);
            Ok(None)
        }
        RemoteCommand::Start(start) => controller.handle_start(start).await,
        RemoteCommand::Stop => controller.handle_stop().map(Some),
        RemoteCommand::SwitchMode(mode) => controller.handle_switch_mode(mode).map(|()| None),
    }
}
