//! Deliveries: single messages in flight, with disposition state.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use super::Link;

/// Terminal disposition of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// The receiver accepted the delivery.
    Accepted,
    /// The receiver rejected the delivery.
    Rejected,
    /// The receiver released the delivery back to the sender.
    Released,
    /// The receiver modified and released the delivery.
    Modified,
}

/// A single message in flight on a link.
///
/// Both sides hold an independent disposition (`local`/`remote` state and
/// settled flags). Setting the local disposition or settling marks the
/// delivery dirty; the owning link flushes a `Disposition` frame on the
/// next engine pass.
#[derive(Debug)]
pub struct Delivery {
    link: Weak<RefCell<Link>>,
    tag: Vec<u8>,
    payload: Vec<u8>,
    read_offset: usize,
    local_state: Option<DeliveryState>,
    remote_state: Option<DeliveryState>,
    local_settled: bool,
    remote_settled: bool,
    disposition_dirty: bool,
    updated: bool,
    readable: bool,
    partial: bool,
    aborted: bool,
    done: bool,
}

impl Delivery {
    pub(crate) fn new_outgoing(link: Weak<RefCell<Link>>, tag: Vec<u8>) -> Self {
        Self {
            link,
            tag,
            payload: Vec::new(),
            read_offset: 0,
            local_state: None,
            remote_state: None,
            local_settled: false,
            remote_settled: false,
            disposition_dirty: false,
            updated: false,
            readable: false,
            partial: false,
            aborted: false,
            done: false,
        }
    }

    pub(crate) fn new_incoming(
        link: Weak<RefCell<Link>>,
        tag: Vec<u8>,
        payload: Vec<u8>,
        remote_settled: bool,
    ) -> Self {
        Self {
            link,
            tag,
            payload,
            read_offset: 0,
            local_state: None,
            remote_state: None,
            local_settled: false,
            remote_settled,
            disposition_dirty: false,
            updated: false,
            readable: true,
            partial: false,
            aborted: false,
            done: false,
        }
    }

    /// The delivery tag.
    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    /// The link this delivery flows on, if it is still alive.
    pub fn link(&self) -> Option<Rc<RefCell<Link>>> {
        self.link.upgrade()
    }

    /// Whether this delivery carries readable message bytes.
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// Whether more transfer frames for this delivery are pending.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Whether the remote disposition changed since the last pass.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Whether the delivery was aborted by its sender.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// The disposition this side applied, if any.
    pub fn local_state(&self) -> Option<DeliveryState> {
        self.local_state
    }

    /// The disposition the peer reported, if any.
    pub fn remote_state(&self) -> Option<DeliveryState> {
        self.remote_state
    }

    /// Whether this side settled the delivery.
    pub fn is_locally_settled(&self) -> bool {
        self.local_settled
    }

    /// Whether the peer settled the delivery.
    pub fn is_remotely_settled(&self) -> bool {
        self.remote_settled
    }

    /// Apply a local disposition. No-op once the delivery is settled.
    pub fn disposition(&mut self, state: DeliveryState) {
        if self.local_settled {
            return;
        }
        self.local_state = Some(state);
        self.disposition_dirty = true;
    }

    /// Settle the delivery locally. Idempotent.
    pub fn settle(&mut self) {
        if self.local_settled {
            return;
        }
        self.local_settled = true;
        self.disposition_dirty = true;
    }

    /// Copy available payload bytes into `buf`, continuing from where the
    /// previous call stopped. Returns the number of bytes copied; zero
    /// once the payload is exhausted.
    pub fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let remaining = &self.payload[self.read_offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.read_offset += n;
        n
    }

    pub(crate) fn stage_bytes(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn mark_done(&mut self) {
        self.done = true;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn apply_remote_disposition(
        &mut self,
        state: Option<DeliveryState>,
        settled: bool,
    ) {
        if let Some(state) = state {
            self.remote_state = Some(state);
        }
        self.remote_settled |= settled;
        self.updated = true;
    }

    pub(crate) fn take_dirty_disposition(&mut self) -> Option<(Option<DeliveryState>, bool)> {
        if self.disposition_dirty {
            self.disposition_dirty = false;
            Some((self.local_state, self.local_settled))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(payload: &[u8]) -> Delivery {
        Delivery::new_incoming(Weak::new(), b"1".to_vec(), payload.to_vec(), false)
    }

    #[test]
    fn test_read_into_consumes_incrementally() {
        let mut delivery = incoming(b"hello world");
        let mut buf = [0u8; 5];

        assert_eq!(delivery.read_into(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(delivery.read_into(&mut buf), 5);
        assert_eq!(&buf, b" worl");
        assert_eq!(delivery.read_into(&mut buf), 1);
        assert_eq!(delivery.read_into(&mut buf), 0);
    }

    #[test]
    fn test_disposition_after_settle_is_ignored() {
        let mut delivery = incoming(b"x");
        delivery.settle();
        delivery.disposition(DeliveryState::Rejected);
        assert_eq!(delivery.local_state(), None);
        assert!(delivery.is_locally_settled());
    }

    #[test]
    fn test_settle_is_idempotent() {
        let mut delivery = incoming(b"x");
        delivery.settle();
        assert!(delivery.take_dirty_disposition().is_some());
        delivery.settle();
        assert!(delivery.take_dirty_disposition().is_none());
    }

    #[test]
    fn test_remote_disposition_marks_updated() {
        let mut delivery = incoming(b"x");
        assert!(!delivery.is_updated());
        delivery.apply_remote_disposition(Some(DeliveryState::Accepted), false);
        assert!(delivery.is_updated());
        assert_eq!(delivery.remote_state(), Some(DeliveryState::Accepted));
        assert!(!delivery.is_remotely_settled());

        delivery.apply_remote_disposition(None, true);
        assert!(delivery.is_remotely_settled());
        assert_eq!(delivery.remote_state(), Some(DeliveryState::Accepted));
    }
}
