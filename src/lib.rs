//! Relay Term - line-editing front-end for remote shells
//!
//! Features:
//! - Local line editing with multi-line continuation and history
//! - Locally drawn prompt per remote system flavor
//! - Remote-aware tab completion for commands and paths
//! - Full-screen program hand-off (vim, less, top, ...)
//! - File transfers over the same connection

pub mod config;
pub mod error;
pub mod shell;
pub mod transfer;
pub mod transport;

pub use config::Config;
pub use shell::driver::Driver;
pub use shell::{Effect, Session, SessionSettings};
