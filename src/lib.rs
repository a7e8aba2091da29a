//! # Quay
//!
//! A cooperative AMQP-style messenger endpoint: one owner sends and
//! receives application messages across many remote peers through a
//! single blocking-with-deadline interface.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              Application Code                   │
//! │        put / send / recv / get / subscribe      │
//! ├─────────────────────────────────────────────────┤
//! │     Messenger (multiplexing, tracking)          │
//! │     • Links keyed by (host, port, path)         │
//! │     • Bounded-window delivery tracker queues    │
//! │     • Fair receive-credit distribution          │
//! ├─────────────────────────────────────────────────┤
//! │     Engine (sans-I/O state machines)            │
//! │     • Connection / session / link / delivery    │
//! │     • Frames in, frames out, no sockets         │
//! ├─────────────────────────────────────────────────┤
//! │     Driver (socket pump)                        │
//! │     • Non-blocking connectors and listeners     │
//! │     • One bounded readiness wait, no threads    │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`Messenger`] | The user-visible endpoint |
//! | [`Message`] | Application message with slice-based encoding |
//! | [`engine`] | Endpoint state machines, frames in / frames out |
//! | [`driver`] | Socket pump with a single bounded wait point |
//! | [`wire`] | Length-prefixed, checksummed frame codec |
//!
//! ## Quick start
//!
//! ```no_run
//! use quay::{Message, Messenger};
//!
//! # fn main() -> Result<(), quay::MessengerError> {
//! let mut receiver = Messenger::new("receiver");
//! receiver.set_timeout(1_000);
//! receiver.start()?;
//! receiver.subscribe("amqp://~0.0.0.0:5672")?;
//! receiver.recv(1)?;
//! if let Some(message) = receiver.get()? {
//!     println!("got {} bytes", message.body.len());
//! }
//! receiver.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! The messenger is strictly single-owner: all I/O progress happens
//! inside its operations, and nothing here spawns a thread.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Message address parsing.
pub mod address;

/// The socket pump: connectors, listeners, and the bounded wait.
pub mod driver;

/// Sans-I/O endpoint state machines.
pub mod engine;

/// Error types for the messenger surface.
pub mod error;

/// Application messages and their encoding.
pub mod message;

/// The messenger core: public operations, tracking, credit.
pub mod messenger;

/// Length-prefixed frame codec.
pub mod wire;

pub use address::{Address, AddressError};
pub use error::{MessengerError, MessengerResult};
pub use message::Message;
pub use messenger::{Messenger, MessengerConfig, Status, Tracker, CUMULATIVE};
