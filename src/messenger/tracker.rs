//! Bounded-window queues of deliveries, addressed by opaque trackers.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::engine::{Delivery, DeliveryState};

/// Flag bit: apply a disposition operation to every live delivery from
/// the queue tail through the tracker, inclusive.
pub const CUMULATIVE: u32 = 1;

/// Delivery status as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The tracker is expired, future, or otherwise unresolvable.
    Unknown,
    /// No disposition has been applied yet.
    Pending,
    /// Accepted by the consuming side.
    Accepted,
    /// Rejected by the consuming side.
    Rejected,
    /// Released back to the sender.
    Released,
    /// Modified and released.
    Modified,
    /// Settled without a terminal state.
    Settled,
    /// Aborted by the sender.
    Aborted,
}

/// Which queue a tracker refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackDirection {
    Incoming,
    Outgoing,
}

/// An opaque reference to a past delivery in one of the tracker queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracker {
    direction: TrackDirection,
    sequence: i64,
}

impl Tracker {
    /// Whether this tracker refers to the outgoing queue.
    pub fn is_outgoing(&self) -> bool {
        self.direction == TrackDirection::Outgoing
    }

    /// The sequence number within the queue.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }
}

/// An ordered, bounded-window queue of deliveries for one direction.
///
/// The high-water mark counts every delivery ever added; sequence numbers
/// are dense and strictly increasing. When a window is set, `slide` keeps
/// at most `window` settled deliveries addressable and drops older ones.
pub struct TrackerQueue {
    direction: TrackDirection,
    deliveries: VecDeque<Rc<RefCell<Delivery>>>,
    window: usize,
    high_water_mark: u64,
}

impl TrackerQueue {
    pub(super) fn incoming() -> TrackerQueue {
        TrackerQueue::new(TrackDirection::Incoming)
    }

    pub(super) fn outgoing() -> TrackerQueue {
        TrackerQueue::new(TrackDirection::Outgoing)
    }

    fn new(direction: TrackDirection) -> TrackerQueue {
        TrackerQueue {
            direction,
            deliveries: VecDeque::new(),
            window: 0,
            high_water_mark: 0,
        }
    }

    /// The configured window.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Set the window.
    pub fn set_window(&mut self, window: usize) {
        self.window = window;
    }

    /// Count of deliveries ever added.
    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark
    }

    /// The tracker that the most recently added delivery received.
    pub fn last_tracker(&self) -> Tracker {
        Tracker {
            direction: self.direction,
            sequence: self.high_water_mark as i64 - 1,
        }
    }

    /// Append a delivery, returning its tracker.
    pub fn add(&mut self, delivery: &Rc<RefCell<Delivery>>) -> Tracker {
        let tracker = Tracker {
            direction: self.direction,
            sequence: self.high_water_mark as i64,
        };
        self.deliveries.push_back(delivery.clone());
        self.high_water_mark += 1;
        tracker
    }

    /// Number of still-live deliveries.
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    /// Whether no live deliveries remain.
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Snapshot of the still-live deliveries in insertion order.
    pub fn deliveries(&self) -> Vec<Rc<RefCell<Delivery>>> {
        self.deliveries.iter().cloned().collect()
    }

    fn base_sequence(&self) -> i64 {
        self.high_water_mark as i64 - self.deliveries.len() as i64
    }

    fn resolve(&self, tracker: Tracker) -> Option<usize> {
        if tracker.direction != self.direction {
            return None;
        }
        let base = self.base_sequence();
        if tracker.sequence < base || tracker.sequence >= self.high_water_mark as i64 {
            return None;
        }
        Some((tracker.sequence - base) as usize)
    }

    fn apply<F: FnMut(&Rc<RefCell<Delivery>>)>(&mut self, tracker: Tracker, flags: u32, mut op: F) {
        let Some(index) = self.resolve(tracker) else {
            return; // Unknown trackers are silently ignored.
        };
        let start = if flags & CUMULATIVE != 0 { 0 } else { index };
        for i in start..=index {
            if let Some(delivery) = self.deliveries.get(i) {
                op(delivery);
            }
        }
    }

    /// Accept the delivery at `tracker` (and everything older, with
    /// [`CUMULATIVE`]).
    pub fn accept(&mut self, tracker: Tracker, flags: u32) {
        self.apply(tracker, flags, |d| {
            d.borrow_mut().disposition(DeliveryState::Accepted)
        });
    }

    /// Reject the delivery at `tracker` (cumulative rule as for accept).
    pub fn reject(&mut self, tracker: Tracker, flags: u32) {
        self.apply(tracker, flags, |d| {
            d.borrow_mut().disposition(DeliveryState::Rejected)
        });
    }

    /// Settle the delivery at `tracker` (cumulative rule as for accept),
    /// then slide the window.
    pub fn settle(&mut self, tracker: Tracker, flags: u32) {
        self.apply(tracker, flags, |d| d.borrow_mut().settle());
        self.slide();
    }

    /// Status of the delivery at `tracker`; `Unknown` once it slid out.
    pub fn status(&self, tracker: Tracker) -> Status {
        let Some(index) = self.resolve(tracker) else {
            return Status::Unknown;
        };
        let Some(delivery) = self.deliveries.get(index) else {
            return Status::Unknown;
        };
        let d = delivery.borrow();
        if d.is_aborted() {
            return Status::Aborted;
        }
        // The other side's verdict matters for what we sent; our own for
        // what we received.
        let state = match self.direction {
            TrackDirection::Outgoing => d.remote_state(),
            TrackDirection::Incoming => d.local_state(),
        };
        match state {
            Some(DeliveryState::Accepted) => Status::Accepted,
            Some(DeliveryState::Rejected) => Status::Rejected,
            Some(DeliveryState::Released) => Status::Released,
            Some(DeliveryState::Modified) => Status::Modified,
            None => {
                if d.is_locally_settled() || d.is_remotely_settled() {
                    Status::Settled
                } else {
                    Status::Pending
                }
            }
        }
    }

    /// Drop settled deliveries from the head while the queue is larger
    /// than the window.
    pub fn slide(&mut self) {
        while self.deliveries.len() > self.window {
            let settled = self
                .deliveries
                .front()
                .is_some_and(|d| d.borrow().is_locally_settled());
            if !settled {
                break;
            }
            self.deliveries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Weak;

    fn delivery(tag: &[u8]) -> Rc<RefCell<Delivery>> {
        Rc::new(RefCell::new(Delivery::new_incoming(
            Weak::new(),
            tag.to_vec(),
            b"body".to_vec(),
            false,
        )))
    }

    fn queue_with(n: usize) -> (TrackerQueue, Vec<Tracker>) {
        let mut queue = TrackerQueue::outgoing();
        let trackers = (0..n)
            .map(|i| queue.add(&delivery(format!("{}", i).as_bytes())))
            .collect();
        (queue, trackers)
    }

    #[test]
    fn test_trackers_are_dense_and_increasing() {
        let (queue, trackers) = queue_with(5);
        for (i, tracker) in trackers.iter().enumerate() {
            assert_eq!(tracker.sequence(), i as i64);
        }
        assert_eq!(queue.high_water_mark(), 5);
        assert_eq!(queue.last_tracker().sequence(), 4);
    }

    #[test]
    fn test_status_of_fresh_delivery_is_pending() {
        let (queue, trackers) = queue_with(1);
        assert_eq!(queue.status(trackers[0]), Status::Pending);
    }

    #[test]
    fn test_unknown_for_future_and_foreign_trackers() {
        let (queue, _) = queue_with(1);
        let future = Tracker {
            direction: TrackDirection::Outgoing,
            sequence: 99,
        };
        assert_eq!(queue.status(future), Status::Unknown);

        let foreign = Tracker {
            direction: TrackDirection::Incoming,
            sequence: 0,
        };
        assert_eq!(queue.status(foreign), Status::Unknown);
    }

    #[test]
    fn test_accept_single_is_not_cumulative() {
        let mut queue = TrackerQueue::incoming();
        let trackers: Vec<_> = (0..3)
            .map(|i| queue.add(&delivery(format!("{}", i).as_bytes())))
            .collect();

        queue.accept(trackers[2], 0);
        assert_eq!(queue.status(trackers[0]), Status::Pending);
        assert_eq!(queue.status(trackers[1]), Status::Pending);
        assert_eq!(queue.status(trackers[2]), Status::Accepted);
    }

    #[test]
    fn test_cumulative_accept_covers_tail_through_tracker() {
        let mut queue = TrackerQueue::incoming();
        let trackers: Vec<_> = (0..3)
            .map(|i| queue.add(&delivery(format!("{}", i).as_bytes())))
            .collect();

        queue.accept(trackers[1], CUMULATIVE);
        assert_eq!(queue.status(trackers[0]), Status::Accepted);
        assert_eq!(queue.status(trackers[1]), Status::Accepted);
        assert_eq!(queue.status(trackers[2]), Status::Pending);
    }

    #[test]
    fn test_settle_twice_is_idempotent() {
        let mut queue = TrackerQueue::incoming();
        queue.set_window(1);
        let tracker = queue.add(&delivery(b"1"));
        queue.accept(tracker, 0);

        queue.settle(tracker, 0);
        let first = queue.status(tracker);
        queue.settle(tracker, 0);
        assert_eq!(queue.status(tracker), first);
        assert_eq!(first, Status::Accepted);
    }

    #[test]
    fn test_slide_keeps_window_of_settled_deliveries() {
        let mut queue = TrackerQueue::outgoing();
        queue.set_window(2);
        let trackers: Vec<_> = (0..3)
            .map(|i| queue.add(&delivery(format!("{}", i).as_bytes())))
            .collect();

        for tracker in &trackers {
            queue.settle(*tracker, 0);
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.status(trackers[0]), Status::Unknown);
        assert_ne!(queue.status(trackers[1]), Status::Unknown);
        assert_ne!(queue.status(trackers[2]), Status::Unknown);
    }

    #[test]
    fn test_slide_does_not_drop_unsettled_head() {
        let mut queue = TrackerQueue::outgoing();
        let trackers: Vec<_> = (0..3)
            .map(|i| queue.add(&delivery(format!("{}", i).as_bytes())))
            .collect();

        // Settle only the middle delivery; the unsettled head blocks the
        // slide even with a zero window.
        queue.settle(trackers[1], 0);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.status(trackers[0]), Status::Pending);
    }

    #[test]
    fn test_expired_tracker_operations_are_ignored() {
        let mut queue = TrackerQueue::outgoing();
        let tracker = queue.add(&delivery(b"1"));
        queue.settle(tracker, 0);
        assert!(queue.is_empty());

        // These must be silent no-ops.
        queue.accept(tracker, 0);
        queue.reject(tracker, CUMULATIVE);
        queue.settle(tracker, 0);
        assert_eq!(queue.status(tracker), Status::Unknown);
    }
}
