//! Sessions: channels grouping links on a connection.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::{Connection, Direction, EndpointState, Link};
use crate::wire::Frame;

/// One session on a connection.
///
/// Sessions carry a channel number per side; frames always reference the
/// sending side's channel, so each session remembers the peer's channel
/// for routing inbound frames.
pub struct Session {
    pub(super) this: Weak<RefCell<Session>>,
    connection: Weak<RefCell<Connection>>,
    local_channel: u16,
    pub(super) remote_channel: Option<u16>,
    remotely_initiated: bool,
    local_state: EndpointState,
    remote_state: EndpointState,
    begin_sent: bool,
    end_sent: bool,
    links: Vec<Rc<RefCell<Link>>>,
    next_handle: u32,
}

impl Session {
    pub(super) fn create(
        connection: Weak<RefCell<Connection>>,
        local_channel: u16,
        remote_channel: Option<u16>,
        remotely_initiated: bool,
    ) -> Rc<RefCell<Session>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Session {
                this: this.clone(),
                connection,
                local_channel,
                remote_channel,
                remotely_initiated,
                local_state: EndpointState::Uninit,
                remote_state: if remotely_initiated {
                    EndpointState::Active
                } else {
                    EndpointState::Uninit
                },
                begin_sent: false,
                end_sent: false,
                links: Vec::new(),
                next_handle: 0,
            })
        })
    }

    /// This side's channel number.
    pub fn local_channel(&self) -> u16 {
        self.local_channel
    }

    /// Local lifecycle state.
    pub fn local_state(&self) -> EndpointState {
        self.local_state
    }

    /// Remote lifecycle state.
    pub fn remote_state(&self) -> EndpointState {
        self.remote_state
    }

    /// The connection this session lives on, if it is still alive.
    pub fn connection(&self) -> Option<Rc<RefCell<Connection>>> {
        self.connection.upgrade()
    }

    /// Open the session locally.
    pub fn open(&mut self) {
        if self.local_state == EndpointState::Uninit {
            self.local_state = EndpointState::Active;
            debug!(channel = self.local_channel, "session opened");
        }
    }

    /// Close the session locally.
    pub fn close(&mut self) {
        if self.local_state != EndpointState::Closed {
            self.local_state = EndpointState::Closed;
            debug!(channel = self.local_channel, "session closed");
        }
    }

    /// Create a sender link named `name` on this session.
    pub fn sender(this: &Rc<RefCell<Session>>, name: &str) -> Rc<RefCell<Link>> {
        Self::new_link(this, name, Direction::Sender)
    }

    /// Create a receiver link named `name` on this session.
    pub fn receiver(this: &Rc<RefCell<Session>>, name: &str) -> Rc<RefCell<Link>> {
        Self::new_link(this, name, Direction::Receiver)
    }

    fn new_link(this: &Rc<RefCell<Session>>, name: &str, direction: Direction) -> Rc<RefCell<Link>> {
        let mut session = this.borrow_mut();
        let handle = session.next_handle;
        session.next_handle += 1;
        let link = Link::create(Rc::downgrade(this), name.to_string(), direction, handle);
        session.links.push(link.clone());
        link
    }

    /// All links on this session.
    pub fn links(&self) -> Vec<Rc<RefCell<Link>>> {
        self.links.clone()
    }

    pub(super) fn find_link_by_name(&self, name: &str) -> Option<Rc<RefCell<Link>>> {
        self.links
            .iter()
            .find(|l| l.borrow().name() == name)
            .cloned()
    }

    pub(super) fn find_link_by_remote_handle(&self, handle: u32) -> Option<Rc<RefCell<Link>>> {
        self.links
            .iter()
            .find(|l| l.borrow().remote_handle == Some(handle))
            .cloned()
    }

    pub(super) fn apply_remote_begin(&mut self, channel: u16) {
        self.remote_channel = Some(channel);
        if self.remote_state == EndpointState::Uninit {
            self.remote_state = EndpointState::Active;
        }
    }

    pub(super) fn apply_remote_end(&mut self) {
        self.remote_state = EndpointState::Closed;
    }

    pub(super) fn flush(&mut self, out: &mut Vec<Frame>) {
        if self.local_state == EndpointState::Active && !self.begin_sent {
            out.push(Frame::Begin {
                channel: self.local_channel,
                reply_to: if self.remotely_initiated {
                    self.remote_channel
                } else {
                    None
                },
            });
            self.begin_sent = true;
        }
        if !self.begin_sent {
            return;
        }

        for link in self.links.clone() {
            link.borrow_mut().flush(self.local_channel, out);
        }

        if self.local_state == EndpointState::Closed && !self.end_sent {
            out.push(Frame::End {
                channel: self.local_channel,
            });
            self.end_sent = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Rc<RefCell<Session>> {
        Session::create(Weak::new(), 0, None, false)
    }

    #[test]
    fn test_begin_emitted_once_after_open() {
        let s = session();
        let mut out = Vec::new();
        s.borrow_mut().flush(&mut out);
        assert!(out.is_empty(), "nothing before open");

        s.borrow_mut().open();
        s.borrow_mut().flush(&mut out);
        assert!(matches!(
            out[0],
            Frame::Begin {
                channel: 0,
                reply_to: None
            }
        ));

        out.clear();
        s.borrow_mut().flush(&mut out);
        assert!(out.is_empty(), "begin must not repeat");
    }

    #[test]
    fn test_remotely_initiated_begin_carries_reply_channel() {
        let s = Session::create(Weak::new(), 4, Some(9), true);
        s.borrow_mut().open();
        let mut out = Vec::new();
        s.borrow_mut().flush(&mut out);
        assert!(matches!(
            out[0],
            Frame::Begin {
                channel: 4,
                reply_to: Some(9)
            }
        ));
    }

    #[test]
    fn test_links_get_distinct_handles() {
        let s = session();
        let a = Session::sender(&s, "a");
        let b = Session::receiver(&s, "b");
        s.borrow_mut().open();
        a.borrow_mut().open();
        b.borrow_mut().open();

        let mut out = Vec::new();
        s.borrow_mut().flush(&mut out);
        let handles: Vec<u32> = out
            .iter()
            .filter_map(|f| match f {
                Frame::Attach { handle, .. } => Some(*handle),
                _ => None,
            })
            .collect();
        assert_eq!(handles, vec![0, 1]);
    }

    #[test]
    fn test_end_follows_close() {
        let s = session();
        s.borrow_mut().open();
        let mut out = Vec::new();
        s.borrow_mut().flush(&mut out);
        out.clear();

        s.borrow_mut().close();
        s.borrow_mut().flush(&mut out);
        assert!(matches!(out[0], Frame::End { channel: 0 }));
    }
}
