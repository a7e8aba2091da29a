//! Links: the unit over which deliveries flow.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::{Delivery, EndpointState, Session};
use crate::wire::Frame;

/// Which way deliveries flow on a link, from this endpoint's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This endpoint transfers deliveries out.
    Sender,
    /// This endpoint receives deliveries.
    Receiver,
}

/// One named, directed lane for deliveries on a session.
///
/// A sender link queues completed deliveries until the peer grants credit;
/// a receiver link queues inbound deliveries until the application reads
/// them. Deliveries that have been transferred (sender) or consumed
/// (receiver) stay in the unsettled set until they are locally settled.
pub struct Link {
    pub(super) this: Weak<RefCell<Link>>,
    session: Weak<RefCell<Session>>,
    name: String,
    direction: Direction,
    local_state: EndpointState,
    remote_state: EndpointState,
    attach_sent: bool,
    detach_sent: bool,
    handle: u32,
    pub(super) remote_handle: Option<u32>,
    local_source: Option<String>,
    local_target: Option<String>,
    remote_source: Option<String>,
    remote_target: Option<String>,
    credit: u32,
    flow_unsent: u32,
    current: Option<Rc<RefCell<Delivery>>>,
    pending: VecDeque<Rc<RefCell<Delivery>>>,
    incoming: VecDeque<Rc<RefCell<Delivery>>>,
    unsettled: Vec<Rc<RefCell<Delivery>>>,
}

impl Link {
    pub(super) fn create(
        session: Weak<RefCell<Session>>,
        name: String,
        direction: Direction,
        handle: u32,
    ) -> Rc<RefCell<Link>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Link {
                this: this.clone(),
                session,
                name,
                direction,
                local_state: EndpointState::Uninit,
                remote_state: EndpointState::Uninit,
                attach_sent: false,
                detach_sent: false,
                handle,
                remote_handle: None,
                local_source: None,
                local_target: None,
                remote_source: None,
                remote_target: None,
                credit: 0,
                flow_unsent: 0,
                current: None,
                pending: VecDeque::new(),
                incoming: VecDeque::new(),
                unsettled: Vec::new(),
            })
        })
    }

    /// The link name. Attaches are matched by name on both sides.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Which way deliveries flow on this link.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether this endpoint sends on the link.
    pub fn is_sender(&self) -> bool {
        self.direction == Direction::Sender
    }

    /// Whether this endpoint receives on the link.
    pub fn is_receiver(&self) -> bool {
        self.direction == Direction::Receiver
    }

    /// Local lifecycle state.
    pub fn local_state(&self) -> EndpointState {
        self.local_state
    }

    /// Remote lifecycle state.
    pub fn remote_state(&self) -> EndpointState {
        self.remote_state
    }

    /// The session this link lives on, if it is still alive.
    pub fn session(&self) -> Option<Rc<RefCell<Session>>> {
        self.session.upgrade()
    }

    /// Local source address.
    pub fn local_source(&self) -> Option<&str> {
        self.local_source.as_deref()
    }

    /// Local target address.
    pub fn local_target(&self) -> Option<&str> {
        self.local_target.as_deref()
    }

    /// Source address the peer advertised.
    pub fn remote_source(&self) -> Option<&str> {
        self.remote_source.as_deref()
    }

    /// Target address the peer advertised.
    pub fn remote_target(&self) -> Option<&str> {
        self.remote_target.as_deref()
    }

    /// Set the local source address (receivers name what they consume).
    pub fn set_local_source(&mut self, source: Option<String>) {
        self.local_source = source;
    }

    /// Set the local target address (senders name what they feed).
    pub fn set_local_target(&mut self, target: Option<String>) {
        self.local_target = target;
    }

    /// Open the link locally.
    pub fn open(&mut self) {
        if self.local_state == EndpointState::Uninit {
            self.local_state = EndpointState::Active;
            debug!(name = %self.name, direction = ?self.direction, "link opened");
        }
    }

    /// Close the link locally.
    pub fn close(&mut self) {
        if self.local_state != EndpointState::Closed {
            self.local_state = EndpointState::Closed;
            debug!(name = %self.name, "link closed");
        }
    }

    /// Credit currently available on this link: transfers this side may
    /// still perform (sender) or has issued and not yet consumed
    /// (receiver).
    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Grant the peer `n` more transfers. Receiver side only.
    pub fn flow(&mut self, n: u32) {
        debug_assert!(self.is_receiver());
        self.credit += n;
        self.flow_unsent += n;
    }

    /// Number of deliveries queued on this link: completed-but-unsent for
    /// senders, readable-but-unconsumed for receivers.
    pub fn queued(&self) -> usize {
        match self.direction {
            Direction::Sender => self.pending.len() + usize::from(self.current.is_some()),
            Direction::Receiver => self.incoming.len(),
        }
    }

    /// Begin a new outgoing delivery with the given tag and make it
    /// current. Sender side only.
    pub fn delivery(this: &Rc<RefCell<Link>>, tag: Vec<u8>) -> Rc<RefCell<Delivery>> {
        let delivery = Rc::new(RefCell::new(Delivery::new_outgoing(
            Rc::downgrade(this),
            tag,
        )));
        let mut link = this.borrow_mut();
        debug_assert!(link.is_sender());
        if let Some(previous) = link.current.take() {
            // An unadvanced current delivery is implicitly completed.
            previous.borrow_mut().mark_done();
            link.pending.push_back(previous);
        }
        link.current = Some(delivery.clone());
        delivery
    }

    /// Append bytes to the current outgoing delivery. Sender side only.
    pub fn send_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.is_sender());
        if let Some(current) = &self.current {
            current.borrow_mut().stage_bytes(bytes);
        }
    }

    /// Complete the current outgoing delivery, queueing it for transfer
    /// as credit allows. Sender side only.
    pub fn advance(&mut self) {
        if let Some(current) = self.current.take() {
            current.borrow_mut().mark_done();
            self.pending.push_back(current);
        }
    }

    /// Remove a consumed delivery from the readable queue, keeping it in
    /// the unsettled set until it is settled. Receiver side only.
    pub fn take_delivery(&mut self, delivery: &Rc<RefCell<Delivery>>) {
        let before = self.incoming.len();
        self.incoming.retain(|d| !Rc::ptr_eq(d, delivery));
        if self.incoming.len() != before && !delivery.borrow().is_locally_settled() {
            self.unsettled.push(delivery.clone());
        }
    }

    pub(super) fn deliver_transfer(
        this: &Rc<RefCell<Link>>,
        tag: Vec<u8>,
        payload: Vec<u8>,
        settled: bool,
    ) {
        let delivery = Rc::new(RefCell::new(Delivery::new_incoming(
            Rc::downgrade(this),
            tag,
            payload,
            settled,
        )));
        let mut link = this.borrow_mut();
        link.credit = link.credit.saturating_sub(1);
        link.incoming.push_back(delivery);
    }

    pub(super) fn apply_remote_attach(
        &mut self,
        handle: u32,
        source: Option<String>,
        target: Option<String>,
    ) {
        self.remote_handle = Some(handle);
        self.remote_source = source;
        self.remote_target = target;
        if self.remote_state == EndpointState::Uninit {
            self.remote_state = EndpointState::Active;
        }
    }

    pub(super) fn apply_remote_flow(&mut self, credit: u32) {
        debug_assert!(self.is_sender());
        self.credit += credit;
    }

    pub(super) fn apply_remote_detach(&mut self) {
        self.remote_state = EndpointState::Closed;
    }

    pub(super) fn find_unsettled(&self, tag: &[u8]) -> Option<Rc<RefCell<Delivery>>> {
        self.unsettled
            .iter()
            .chain(self.incoming.iter())
            .chain(self.pending.iter())
            .find(|d| d.borrow().tag() == tag)
            .cloned()
    }

    pub(super) fn work_deliveries(&self, out: &mut Vec<Rc<RefCell<Delivery>>>) {
        match self.direction {
            Direction::Sender => {
                for d in &self.unsettled {
                    if d.borrow().is_updated() {
                        out.push(d.clone());
                    }
                }
            }
            Direction::Receiver => {
                for d in &self.incoming {
                    let dd = d.borrow();
                    if dd.is_readable() && !dd.is_partial() {
                        out.push(d.clone());
                    }
                }
            }
        }
    }

    pub(super) fn flush(&mut self, channel: u16, out: &mut Vec<Frame>) {
        if self.local_state == EndpointState::Active && !self.attach_sent {
            out.push(Frame::Attach {
                channel,
                handle: self.handle,
                name: self.name.clone(),
                sending: self.is_sender(),
                source: self.local_source.clone(),
                target: self.local_target.clone(),
            });
            self.attach_sent = true;
        }
        if !self.attach_sent {
            return;
        }

        if self.flow_unsent > 0 {
            out.push(Frame::Flow {
                channel,
                handle: self.handle,
                credit: self.flow_unsent,
            });
            self.flow_unsent = 0;
        }

        while self.credit > 0 {
            let Some(delivery) = self.pending.front().cloned() else {
                break;
            };
            if !delivery.borrow().is_done() {
                break;
            }
            self.pending.pop_front();
            self.credit -= 1;
            let (tag, settled, payload) = {
                let d = delivery.borrow();
                (d.tag().to_vec(), d.is_locally_settled(), d.payload().to_vec())
            };
            out.push(Frame::Transfer {
                channel,
                handle: self.handle,
                tag,
                settled,
                payload,
            });
            if !settled {
                self.unsettled.push(delivery);
            }
        }

        let mut emit_dispositions = |queue: &[Rc<RefCell<Delivery>>], out: &mut Vec<Frame>| {
            for delivery in queue {
                let mut d = delivery.borrow_mut();
                if let Some((state, settled)) = d.take_dirty_disposition() {
                    out.push(Frame::Disposition {
                        channel,
                        handle: self.handle,
                        tag: d.tag().to_vec(),
                        state,
                        settled,
                    });
                }
            }
        };
        emit_dispositions(self.unsettled.as_slice(), out);
        let readable: Vec<_> = self.incoming.iter().cloned().collect();
        emit_dispositions(&readable, out);
        self.unsettled.retain(|d| !d.borrow().is_locally_settled());
        self.incoming.retain(|d| !d.borrow().is_locally_settled());

        if self.local_state == EndpointState::Closed && !self.detach_sent {
            out.push(Frame::Detach {
                channel,
                handle: self.handle,
                closed: true,
            });
            self.detach_sent = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Rc<RefCell<Link>> {
        let link = Link::create(Weak::new(), "q".to_string(), Direction::Sender, 0);
        link.borrow_mut().set_local_target(Some("q".to_string()));
        link.borrow_mut().open();
        link
    }

    fn flush(link: &Rc<RefCell<Link>>) -> Vec<Frame> {
        let mut out = Vec::new();
        link.borrow_mut().flush(0, &mut out);
        out
    }

    #[test]
    fn test_sender_holds_transfers_until_credit() {
        let link = sender();
        let delivery = Link::delivery(&link, b"1".to_vec());
        link.borrow_mut().send_bytes(b"payload");
        link.borrow_mut().advance();
        assert!(delivery.borrow().is_done());
        assert_eq!(link.borrow().queued(), 1);

        // Attach goes out, but no transfer without credit.
        let frames = flush(&link);
        assert!(matches!(frames[0], Frame::Attach { .. }));
        assert_eq!(frames.len(), 1);
        assert_eq!(link.borrow().queued(), 1);

        link.borrow_mut().apply_remote_flow(5);
        let frames = flush(&link);
        assert!(
            matches!(&frames[0], Frame::Transfer { tag, payload, settled, .. }
                if tag == b"1" && payload == b"payload" && !settled)
        );
        assert_eq!(link.borrow().queued(), 0);
        assert_eq!(link.borrow().credit(), 4);
    }

    #[test]
    fn test_receiver_flow_emits_once() {
        let link = Link::create(Weak::new(), "q".to_string(), Direction::Receiver, 0);
        link.borrow_mut().set_local_source(Some("q".to_string()));
        link.borrow_mut().open();
        link.borrow_mut().flow(10);
        assert_eq!(link.borrow().credit(), 10);

        let frames = flush(&link);
        assert!(matches!(frames[0], Frame::Attach { .. }));
        assert!(matches!(frames[1], Frame::Flow { credit: 10, .. }));

        // Nothing more pending on the next pass.
        assert!(flush(&link).is_empty());
    }

    #[test]
    fn test_transfer_consumes_receiver_credit() {
        let link = Link::create(Weak::new(), "q".to_string(), Direction::Receiver, 0);
        link.borrow_mut().open();
        link.borrow_mut().flow(2);
        let _ = flush(&link);

        Link::deliver_transfer(&link, b"1".to_vec(), b"a".to_vec(), false);
        assert_eq!(link.borrow().credit(), 1);
        assert_eq!(link.borrow().queued(), 1);
    }

    #[test]
    fn test_settled_delivery_leaves_unsettled_set() {
        let link = sender();
        let delivery = Link::delivery(&link, b"1".to_vec());
        link.borrow_mut().send_bytes(b"x");
        link.borrow_mut().advance();
        link.borrow_mut().apply_remote_flow(1);
        let _ = flush(&link);

        assert!(link.borrow().find_unsettled(b"1").is_some());
        delivery.borrow_mut().settle();
        let frames = flush(&link);
        assert!(
            matches!(&frames[0], Frame::Disposition { settled: true, .. }),
            "settlement must be flushed: {:?}",
            frames
        );
        assert!(link.borrow().find_unsettled(b"1").is_none());
    }

    #[test]
    fn test_take_delivery_moves_to_unsettled() {
        let link = Link::create(Weak::new(), "q".to_string(), Direction::Receiver, 0);
        link.borrow_mut().open();
        link.borrow_mut().flow(1);
        Link::deliver_transfer(&link, b"7".to_vec(), b"body".to_vec(), false);

        let mut work = Vec::new();
        link.borrow().work_deliveries(&mut work);
        assert_eq!(work.len(), 1);

        link.borrow_mut().take_delivery(&work[0]);
        assert_eq!(link.borrow().queued(), 0);
        assert!(link.borrow().find_unsettled(b"7").is_some());

        let mut work = Vec::new();
        link.borrow().work_deliveries(&mut work);
        assert!(work.is_empty());
    }
}
