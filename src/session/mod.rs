//! Browser session lifecycle
//!
//! A session is one browser bound to an account profile and an optional
//! proxy lease. `SessionLauncher` brings sessions up (spawned or attached);
//! `SessionHandle` owns everything that must be torn down afterwards.

mod forwarder;
mod handle;
mod launcher;

pub use forwarder::AuthForwarder;
pub use handle::{SessionHandle, SessionMeta};
pub use launcher::{LaunchMode, LaunchOptions, SessionLauncher, SessionProxy};
