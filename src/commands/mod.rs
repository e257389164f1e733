//! Command handlers
//!
//! Text commands arriving from the peer are parsed here and dispatched to
//! the record controller.

pub mod remote;

pub use remote::{decode, execute, CommandError, RemoteCommand, StartCommand};
