//! Backend log forwarding for processes observed by Bugtrail.
//!
//! Embed a [`BackendLogClient`] in the server under test and add its [`BackendLogLayer`] to the
//! process's tracing subscriber. The client registers with the backend log hub, stays idle until
//! the hub starts a recording, and forwards log events (and panics, via
//! [`install_panic_hook`]) only while one is active.
//!
//! ```no_run
//! use backend_log_client::{BackendLogClient, ClientConfig};
//! use tracing_subscriber::layer::SubscriberExt;
//!
//! # async fn wire() {
//! let client = BackendLogClient::new(ClientConfig { server_port: 8080, ..Default::default() });
//! let subscriber = tracing_subscriber::registry().with(client.layer());
//! tracing::subscriber::set_global_default(subscriber).ok();
//! backend_log_client::install_panic_hook(client.clone());
//! client.spawn();
//! # }
//! ```

pub mod client;
pub mod config;
pub mod errors;
pub mod layer;
pub mod panic;
pub mod state;
pub mod transport;

pub use client::BackendLogClient;
pub use config::ClientConfig;
pub use errors::{ClientError, ClientResult};
pub use layer::BackendLogLayer;
pub use panic::install_panic_hook;
pub use state::{Backoff, ClientState, RingBuffer};
pub use transport::{Connection, Connector, Scheduler, TokioScheduler, WsConnector};
