//! Connections: the outermost endpoint, owning sessions and the SASL gate.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::{Delivery, EndpointState, EngineError, Link, Sasl, Session, StateSet};
use crate::wire::Frame;

/// One connection to a remote container.
///
/// The connection ingests inbound frames (`handle_frame`) and emits
/// outbound frames (`take_output`); everything in between is pure state.
/// When a SASL handshake is configured, no other frame is emitted or
/// accepted until it completes.
pub struct Connection {
    this: Weak<RefCell<Connection>>,
    container: String,
    hostname: Option<String>,
    context: Option<String>,
    remote_container: Option<String>,
    local_state: EndpointState,
    remote_state: EndpointState,
    open_sent: bool,
    close_sent: bool,
    sasl: Option<Sasl>,
    sessions: Vec<Rc<RefCell<Session>>>,
    next_channel: u16,
}

impl Connection {
    /// Create a connection with the given container identity.
    pub fn create(container: impl Into<String>) -> Rc<RefCell<Connection>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Connection {
                this: this.clone(),
                container: container.into(),
                hostname: None,
                context: None,
                remote_container: None,
                local_state: EndpointState::Uninit,
                remote_state: EndpointState::Uninit,
                open_sent: false,
                close_sent: false,
                sasl: None,
                sessions: Vec::new(),
                next_channel: 0,
            })
        })
    }

    /// This endpoint's container identity.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// The peer's container identity, once its `Open` arrived.
    pub fn remote_container(&self) -> Option<&str> {
        self.remote_container.as_deref()
    }

    /// The host this connection was created toward.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Set the host this connection is directed at.
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = Some(hostname.into());
    }

    /// Opaque user slot; the messenger stores its registry key here.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Set the opaque user slot.
    pub fn set_context(&mut self, context: impl Into<String>) {
        self.context = Some(context.into());
    }

    /// Local lifecycle state.
    pub fn local_state(&self) -> EndpointState {
        self.local_state
    }

    /// Remote lifecycle state.
    pub fn remote_state(&self) -> EndpointState {
        self.remote_state
    }

    /// Open the connection locally.
    pub fn open(&mut self) {
        if self.local_state == EndpointState::Uninit {
            self.local_state = EndpointState::Active;
            debug!(container = %self.container, "connection opened");
        }
    }

    /// Close the connection locally.
    pub fn close(&mut self) {
        if self.local_state != EndpointState::Closed {
            self.local_state = EndpointState::Closed;
            debug!(container = %self.container, "connection closed");
        }
    }

    /// Record an abrupt transport-level loss of the peer.
    pub fn remote_close_abrupt(&mut self) {
        if self.remote_state != EndpointState::Closed {
            self.remote_state = EndpointState::Closed;
            debug!(container = %self.container, "remote end gone");
        }
    }

    /// Configure the client side of an anonymous SASL handshake.
    pub fn configure_sasl_client(&mut self) {
        self.sasl = Some(Sasl::client());
    }

    /// Configure the server side of the handshake with accepted mechanisms.
    pub fn configure_sasl_server(&mut self, mechanisms: Vec<String>) {
        self.sasl = Some(Sasl::server(mechanisms));
    }

    /// Whether a configured handshake ended in failure.
    pub fn sasl_failed(&self) -> bool {
        self.sasl.as_ref().is_some_and(|s| s.failed())
    }

    /// Create a new session on this connection.
    pub fn session(this: &Rc<RefCell<Connection>>) -> Rc<RefCell<Session>> {
        let mut conn = this.borrow_mut();
        let channel = conn.next_channel;
        conn.next_channel += 1;
        let session = Session::create(Rc::downgrade(this), channel, None, false);
        conn.sessions.push(session.clone());
        session
    }

    /// Sessions whose local and remote states fall in the given sets.
    pub fn sessions_in(&self, local: StateSet, remote: StateSet) -> Vec<Rc<RefCell<Session>>> {
        self.sessions
            .iter()
            .filter(|s| {
                let s = s.borrow();
                local.contains(s.local_state()) && remote.contains(s.remote_state())
            })
            .cloned()
            .collect()
    }

    /// Links (across all sessions) whose states fall in the given sets.
    pub fn links_in(&self, local: StateSet, remote: StateSet) -> Vec<Rc<RefCell<Link>>> {
        let mut out = Vec::new();
        for session in &self.sessions {
            for link in session.borrow().links() {
                let matches = {
                    let l = link.borrow();
                    local.contains(l.local_state()) && remote.contains(l.remote_state())
                };
                if matches {
                    out.push(link);
                }
            }
        }
        out
    }

    /// Deliveries with pending local action: updated sender deliveries and
    /// readable, complete receiver deliveries, in arrival order per link.
    pub fn work_deliveries(&self) -> Vec<Rc<RefCell<Delivery>>> {
        let mut out = Vec::new();
        for session in &self.sessions {
            for link in session.borrow().links() {
                link.borrow().work_deliveries(&mut out);
            }
        }
        out
    }

    fn find_session_by_local(&self, channel: u16) -> Option<Rc<RefCell<Session>>> {
        self.sessions
            .iter()
            .find(|s| s.borrow().local_channel() == channel)
            .cloned()
    }

    fn find_session_by_remote(&self, channel: u16) -> Option<Rc<RefCell<Session>>> {
        self.sessions
            .iter()
            .find(|s| s.borrow().remote_channel == Some(channel))
            .cloned()
    }

    /// Apply one inbound frame to engine state.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] on protocol violations; the connection
    /// remains usable and continues toward close.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<(), EngineError> {
        if let Some(sasl) = &mut self.sasl {
            if sasl.handle(&frame) {
                return Ok(());
            }
            if !sasl.is_done() {
                return Err(EngineError::UnexpectedFrame(format!(
                    "{:?} before SASL completion",
                    frame
                )));
            }
            if sasl.failed() {
                return Err(EngineError::SaslFailed);
            }
        }

        match frame {
            Frame::SaslMechanisms { .. } | Frame::SaslInit { .. } | Frame::SaslOutcome { .. } => {
                Err(EngineError::UnexpectedFrame(
                    "SASL frame on a connection without a handshake".to_string(),
                ))
            }
            Frame::Open {
                container,
                hostname: _,
            } => {
                self.remote_container = Some(container);
                if self.remote_state == EndpointState::Uninit {
                    self.remote_state = EndpointState::Active;
                }
                Ok(())
            }
            Frame::Close {} => {
                self.remote_state = EndpointState::Closed;
                Ok(())
            }
            Frame::Begin { channel, reply_to } => {
                match reply_to {
                    Some(local) => {
                        let session = self
                            .find_session_by_local(local)
                            .ok_or(EngineError::UnknownChannel(local))?;
                        session.borrow_mut().apply_remote_begin(channel);
                    }
                    None => {
                        let local_channel = self.next_channel;
                        self.next_channel += 1;
                        let session = Session::create(
                            self.this.clone(),
                            local_channel,
                            Some(channel),
                            true,
                        );
                        self.sessions.push(session);
                        debug!(channel, "remote session begun");
                    }
                }
                Ok(())
            }
            Frame::End { channel } => {
                let session = self
                    .find_session_by_remote(channel)
                    .ok_or(EngineError::UnknownChannel(channel))?;
                session.borrow_mut().apply_remote_end();
                Ok(())
            }
            Frame::Attach {
                channel,
                handle,
                name,
                sending,
                source,
                target,
            } => {
                let session = self
                    .find_session_by_remote(channel)
                    .ok_or(EngineError::UnknownChannel(channel))?;
                let existing = session.borrow().find_link_by_name(&name);
                let link = match existing {
                    Some(link) => link,
                    None => {
                        // The peer names its own role; ours is the mirror.
                        let link = if sending {
                            Session::receiver(&session, &name)
                        } else {
                            Session::sender(&session, &name)
                        };
                        debug!(name = %link.borrow().name(), "remote link attached");
                        link
                    }
                };
                link.borrow_mut().apply_remote_attach(handle, source, target);
                Ok(())
            }
            Frame::Detach {
                channel,
                handle,
                closed: _,
            } => {
                let link = self.resolve_link(channel, handle)?;
                link.borrow_mut().apply_remote_detach();
                Ok(())
            }
            Frame::Flow {
                channel,
                handle,
                credit,
            } => {
                let link = self.resolve_link(channel, handle)?;
                let mut l = link.borrow_mut();
                if !l.is_sender() {
                    return Err(EngineError::UnexpectedFrame(
                        "flow on a non-sending link".to_string(),
                    ));
                }
                l.apply_remote_flow(credit);
                Ok(())
            }
            Frame::Transfer {
                channel,
                handle,
                tag,
                settled,
                payload,
            } => {
                let link = self.resolve_link(channel, handle)?;
                if !link.borrow().is_receiver() {
                    return Err(EngineError::UnexpectedFrame(
                        "transfer on a non-receiving link".to_string(),
                    ));
                }
                Link::deliver_transfer(&link, tag, payload, settled);
                Ok(())
            }
            Frame::Disposition {
                channel,
                handle,
                tag,
                state,
                settled,
            } => {
                let link = self.resolve_link(channel, handle)?;
                let delivery = link.borrow().find_unsettled(&tag);
                if let Some(delivery) = delivery {
                    delivery.borrow_mut().apply_remote_disposition(state, settled);
                }
                // Dispositions for already-settled deliveries are ignored.
                Ok(())
            }
        }
    }

    fn resolve_link(&self, channel: u16, handle: u32) -> Result<Rc<RefCell<Link>>, EngineError> {
        let session = self
            .find_session_by_remote(channel)
            .ok_or(EngineError::UnknownChannel(channel))?;
        let link = session.borrow().find_link_by_remote_handle(handle);
        link.ok_or(EngineError::UnknownHandle { channel, handle })
    }

    /// Collect every outbound frame that is due.
    pub fn take_output(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();

        if let Some(sasl) = &mut self.sasl {
            sasl.emit(&mut out);
            if !sasl.is_done() || sasl.failed() {
                return out;
            }
        }

        if self.local_state == EndpointState::Active && !self.open_sent {
            out.push(Frame::Open {
                container: self.container.clone(),
                hostname: self.hostname.clone(),
            });
            self.open_sent = true;
        }
        if !self.open_sent {
            return out;
        }

        for session in self.sessions.clone() {
            session.borrow_mut().flush(&mut out);
        }

        if self.local_state == EndpointState::Closed && !self.close_sent {
            out.push(Frame::Close {});
            self.close_sent = true;
        }

        out
    }
}
