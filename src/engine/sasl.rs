//! Anonymous SASL handshake.
//!
//! The handshake runs before any other frame: the server advertises its
//! mechanisms, the client picks one, the server reports the outcome. Only
//! `ANONYMOUS` is supported; a connection without a configured handshake
//! skips the exchange entirely.

use tracing::{debug, warn};

use crate::wire::Frame;

/// The mechanism this endpoint negotiates.
pub const ANONYMOUS: &str = "ANONYMOUS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// SASL handshake state machine for one connection.
#[derive(Debug)]
pub struct Sasl {
    role: Role,
    mechanisms: Vec<String>,
    mechanisms_sent: bool,
    init_pending: Option<String>,
    outcome_pending: Option<bool>,
    outcome: Option<bool>,
    done: bool,
}

impl Sasl {
    /// Configure the client side of the handshake.
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            mechanisms: vec![ANONYMOUS.to_string()],
            mechanisms_sent: false,
            init_pending: None,
            outcome_pending: None,
            outcome: None,
            done: false,
        }
    }

    /// Configure the server side of the handshake with the mechanisms it
    /// will accept.
    pub fn server(mechanisms: Vec<String>) -> Self {
        Self {
            role: Role::Server,
            mechanisms,
            mechanisms_sent: false,
            init_pending: None,
            outcome_pending: None,
            outcome: None,
            done: false,
        }
    }

    /// Whether the handshake has finished (either way).
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Whether the handshake finished in failure.
    pub fn failed(&self) -> bool {
        self.done && self.outcome != Some(true)
    }

    /// Append any handshake frames that are due.
    pub(crate) fn emit(&mut self, out: &mut Vec<Frame>) {
        if self.role == Role::Server && !self.mechanisms_sent {
            out.push(Frame::SaslMechanisms {
                mechanisms: self.mechanisms.clone(),
            });
            self.mechanisms_sent = true;
        }
        if let Some(mechanism) = self.init_pending.take() {
            out.push(Frame::SaslInit { mechanism });
        }
        if let Some(ok) = self.outcome_pending.take() {
            out.push(Frame::SaslOutcome { ok });
            self.outcome = Some(ok);
            self.done = true;
        }
    }

    /// Apply an inbound handshake frame. Returns `false` for frames that
    /// are not part of the handshake.
    pub(crate) fn handle(&mut self, frame: &Frame) -> bool {
        match frame {
            Frame::SaslMechanisms { mechanisms } => {
                if self.role == Role::Client {
                    if mechanisms.iter().any(|m| m == ANONYMOUS) {
                        self.init_pending = Some(ANONYMOUS.to_string());
                    } else {
                        warn!(?mechanisms, "peer offers no supported SASL mechanism");
                        self.outcome = Some(false);
                        self.done = true;
                    }
                }
                true
            }
            Frame::SaslInit { mechanism } => {
                if self.role == Role::Server {
                    let ok = self.mechanisms.iter().any(|m| m == mechanism);
                    if !ok {
                        warn!(mechanism, "rejecting unsupported SASL mechanism");
                    }
                    self.outcome_pending = Some(ok);
                }
                true
            }
            Frame::SaslOutcome { ok } => {
                if self.role == Role::Client {
                    debug!(ok, "SASL outcome received");
                    self.outcome = Some(*ok);
                    self.done = true;
                }
                true
            }
            _ => false,
        }
    }
}
