//! Client library for a software update daemon.
//!
//! `swc` talks to an update daemon over its local control socket: it opens
//! an update session, streams the image, and follows the daemon's progress
//! until the session succeeds, fails, or is cancelled.
//!
//! # Quick start
//!
//! ```no_run
//! use std::fs::File;
//! use std::time::Duration;
//! use swc::{Client, ClientConfig, Outcome, UpdateRequest};
//!
//! let mut client = Client::new(ClientConfig::from_env());
//! let image = File::open("update.swu")?;
//! match client.install(UpdateRequest::new(), image, Duration::from_secs(600))? {
//!     Outcome::Success { message, .. } => println!("installed: {message}"),
//!     other => eprintln!("update did not complete: {other:?}"),
//! }
//! # Ok::<(), swc::Error>(())
//! ```
//!
//! Step by step, with progress:
//!
//! ```no_run
//! # use std::time::Duration;
//! # use swc::{Client, ClientConfig, Event, UpdateRequest};
//! # fn image_chunks() -> Vec<Vec<u8>> { Vec::new() }
//! let mut client = Client::new(ClientConfig::default());
//! client.start_update(UpdateRequest::new().dry_run(true))?;
//! for chunk in image_chunks() {
//!     client.feed_chunk(&chunk)?;
//!     for event in client.drain_events()? {
//!         if let Event::Progress(p) = event {
//!             println!("{}%", p.percent);
//!         }
//!     }
//! }
//! client.finish_image()?;
//! let outcome = client.wait_until_terminal(Duration::from_secs(600))?;
//! # Ok::<(), swc::Error>(())
//! ```

#[cfg(unix)]
mod client;
mod config;
mod error;
mod machine;
mod session;
#[cfg(unix)]
mod transport;

#[cfg(unix)]
pub use client::{CancelHandle, Client};
pub use config::{ClientConfig, DEFAULT_ENDPOINT, ENV_ACK_TIMEOUT_MS, ENV_SOCKET, UnsolicitedPolicy};
pub use error::{Error, ProtocolWarning, Result};
pub use machine::Machine;
pub use session::{
    CONNECTION_CLOSED, CONNECTION_LOST, Cause, Event, Outcome, SessionId, State,
    StatusNotification, UpdateRequest, UpdateSession,
};
pub use swc_proto::{DaemonStatus, RunMode, Severity};
#[cfg(unix)]
pub use transport::{Transport, UnixTransport};
