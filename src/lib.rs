//! turnstiled - per-user service manager supervision
//!
//! A privileged daemon that:
//! - Starts and stops per-user service manager instances as local users
//!   log in and out
//! - Publishes each user's runtime directory path back to the requesting
//!   client (typically a PAM session module)
//! - Survives transient child failures and tears logins down in order
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   turnstiled                     │
//! ├──────────────┬──────────────────┬───────────────┤
//! │ Control sock │  Login registry  │  Supervisor   │
//! ├──────────────┴──────────────────┴───────────────┤
//! │        poll event loop + signal self-pipe        │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one thread: signals become bytes on a self-pipe,
//! children are observed through SIGCHLD, and the only blocking point is
//! a single `poll`.

pub mod config;
pub mod daemon;
pub mod login;
pub mod protocol;
pub mod scaffold;
pub mod supervisor;

// Re-exports for the binary and tests
pub use config::Config;
pub use daemon::{Daemon, FatalError};
