//! Sans-I/O endpoint state machines.
//!
//! The engine models the AMQP-style endpoint nesting (connection,
//! session, link, delivery) as a pure state machine. Each
//! [`Connection`] ingests decoded frames via `handle_frame` and emits
//! outbound frames via `take_output`; no I/O types appear anywhere in this
//! module. The driver bridges both ends to sockets, which keeps every
//! protocol rule testable with two connections wired back to back in
//! memory.
//!
//! All endpoint objects live in a single-threaded `Rc<RefCell<_>>` graph:
//! parents own children strongly, children point back through `Weak`.

mod connection;
mod delivery;
mod link;
mod sasl;
mod session;

pub use connection::Connection;
pub use delivery::{Delivery, DeliveryState};
pub use link::{Direction, Link};
pub use sasl::Sasl;
pub use session::Session;

use thiserror::Error;

/// Lifecycle state of one side of an endpoint.
///
/// States only ever advance: `Uninit` → `Active` → `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Endpoint exists but has not been opened.
    Uninit,
    /// Endpoint is open.
    Active,
    /// Endpoint has been closed.
    Closed,
}

impl EndpointState {
    fn bit(self) -> u8 {
        match self {
            EndpointState::Uninit => 0b001,
            EndpointState::Active => 0b010,
            EndpointState::Closed => 0b100,
        }
    }
}

/// A set of endpoint states, used to filter endpoint iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSet(u8);

impl StateSet {
    /// Only `Uninit`.
    pub const UNINIT: StateSet = StateSet(0b001);
    /// Only `Active`.
    pub const ACTIVE: StateSet = StateSet(0b010);
    /// Only `Closed`.
    pub const CLOSED: StateSet = StateSet(0b100);
    /// Every state.
    pub const ANY: StateSet = StateSet(0b111);

    /// Whether `state` is a member of this set.
    pub fn contains(self, state: EndpointState) -> bool {
        self.0 & state.bit() != 0
    }
}

/// Errors raised while applying an inbound frame to engine state.
///
/// These indicate a peer protocol violation; the connector logs them and
/// lets the connection continue toward close.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A frame referenced a session channel this side does not know.
    #[error("unknown channel: {0}")]
    UnknownChannel(u16),

    /// A frame referenced a link handle this side does not know.
    #[error("unknown handle {handle} on channel {channel}")]
    UnknownHandle {
        /// Channel the frame referenced.
        channel: u16,
        /// Handle the frame referenced.
        handle: u32,
    },

    /// A frame arrived that is not legal in the current state.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// The SASL handshake was refused by the peer.
    #[error("authentication failed")]
    SaslFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_set_membership() {
        assert!(StateSet::UNINIT.contains(EndpointState::Uninit));
        assert!(!StateSet::UNINIT.contains(EndpointState::Active));
        assert!(StateSet::ACTIVE.contains(EndpointState::Active));
        assert!(StateSet::CLOSED.contains(EndpointState::Closed));
    }

    #[test]
    fn test_state_set_any_contains_everything() {
        for state in [
            EndpointState::Uninit,
            EndpointState::Active,
            EndpointState::Closed,
        ] {
            assert!(StateSet::ANY.contains(state));
        }
    }
}
