//! Bugtrail recording sessions.
//!
//! [`SessionManager`] drives one recording per tab on top of the shared inspection channel and
//! produces a [`SessionReport`] holding the correlated timeline. [`BackendHub`] is the websocket
//! endpoint observed server processes forward their logs to; [`ViewportEmulation`] is a second
//! consumer of the same inspection attachment.

pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod hub;
mod pump;
pub mod session;
pub mod viewport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{HubConfig, RecorderConfig};
pub use errors::{SessionError, SessionResult};
pub use events::SessionEvent;
pub use hub::{BackendHub, BackendLogEntry};
pub use session::{SessionHandle, SessionManager, SessionManagerBuilder, SessionReport};
pub use viewport::{Viewport, ViewportEmulation};
