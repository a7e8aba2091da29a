//! Receive-credit distribution across active receiver links.

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::Link;

/// Per-link replenishment target for unlimited mode.
pub(super) const CREDIT_BATCH: i32 = 10;

/// Distribute the credit pool across the given receiver links.
///
/// Each receiver is topped up toward `max(1, credit / links)`; the floor
/// of one guarantees forward progress when the pool is smaller than the
/// link count. In unlimited mode the pool is first replenished to
/// `links * CREDIT_BATCH`, which refreshes every pass without growing
/// without bound.
pub(super) fn distribute(
    receivers: &[Rc<RefCell<Link>>],
    credit: &mut i32,
    distributed: &mut i32,
    unlimited: bool,
) {
    let count = receivers.len() as i32;
    if count == 0 {
        return;
    }

    if unlimited {
        *credit = count * CREDIT_BATCH;
    }
    if *credit <= 0 {
        return;
    }

    let batch = if *credit < count { 1 } else { *credit / count };
    for link in receivers {
        let have = link.borrow().credit() as i32;
        if have < batch {
            let need = batch - have;
            let amount = need.min(*credit);
            link.borrow_mut().flow(amount as u32);
            *distributed += amount;
            *credit -= amount;
            if *credit == 0 {
                return;
            }
        }
    }
}

/// Return credit held by `link` to the pool (the link's connection is
/// going away).
pub(super) fn reclaim(link: &Rc<RefCell<Link>>, credit: &mut i32, distributed: &mut i32) {
    let held = {
        let l = link.borrow();
        if l.is_receiver() { l.credit() as i32 } else { 0 }
    };
    if held > 0 {
        *credit += held;
        *distributed -= held;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Connection, Session};

    fn receivers(n: usize) -> Vec<Rc<RefCell<Link>>> {
        let connection = Connection::create("test");
        let session = Connection::session(&connection);
        (0..n)
            .map(|i| {
                let link = Session::receiver(&session, &format!("q{}", i));
                link.borrow_mut().open();
                link
            })
            .collect()
    }

    #[test]
    fn test_even_split_across_receivers() {
        let links = receivers(2);
        let mut credit = 10;
        let mut distributed = 0;

        distribute(&links, &mut credit, &mut distributed, false);

        assert_eq!(credit, 0);
        assert_eq!(distributed, 10);
        assert_eq!(links[0].borrow().credit(), 5);
        assert_eq!(links[1].borrow().credit(), 5);
    }

    #[test]
    fn test_unlimited_grants_batch_to_every_receiver() {
        let links = receivers(3);
        let mut credit = 0;
        let mut distributed = 0;

        distribute(&links, &mut credit, &mut distributed, true);

        for link in &links {
            assert!(link.borrow().credit() >= CREDIT_BATCH as u32);
        }
        assert_eq!(distributed, 3 * CREDIT_BATCH);
        assert_eq!(credit, 0);
    }

    #[test]
    fn test_unlimited_replenishes_without_unbounded_growth() {
        let links = receivers(2);
        let mut credit = 0;
        let mut distributed = 0;

        distribute(&links, &mut credit, &mut distributed, true);
        let first_round = distributed;
        // Nothing consumed: a second pass must not grant more.
        distribute(&links, &mut credit, &mut distributed, true);

        assert_eq!(distributed, first_round);
        for link in &links {
            assert_eq!(link.borrow().credit(), CREDIT_BATCH as u32);
        }
    }

    #[test]
    fn test_scarce_credit_still_makes_progress() {
        let links = receivers(4);
        let mut credit = 2;
        let mut distributed = 0;

        distribute(&links, &mut credit, &mut distributed, false);

        // batch = max(1, 2/4) = 1: the first two links get one each.
        assert_eq!(links[0].borrow().credit(), 1);
        assert_eq!(links[1].borrow().credit(), 1);
        assert_eq!(links[2].borrow().credit(), 0);
        assert_eq!(credit, 0);
        assert_eq!(distributed, 2);
    }

    #[test]
    fn test_no_receivers_leaves_pool_untouched() {
        let mut credit = 7;
        let mut distributed = 0;
        distribute(&[], &mut credit, &mut distributed, true);
        assert_eq!(credit, 7);
        assert_eq!(distributed, 0);
    }

    #[test]
    fn test_topped_up_links_are_skipped() {
        let links = receivers(2);
        links[0].borrow_mut().flow(8);
        let mut credit = 6;
        let mut distributed = 0;

        distribute(&links, &mut credit, &mut distributed, false);

        // batch = 3; the first link already holds more than that.
        assert_eq!(links[0].borrow().credit(), 8);
        assert_eq!(links[1].borrow().credit(), 3);
        assert_eq!(credit, 3);
        assert_eq!(distributed, 3);
    }

    #[test]
    fn test_reclaim_returns_held_credit() {
        let links = receivers(1);
        links[0].borrow_mut().flow(4);
        let mut credit = 0;
        let mut distributed = 4;

        reclaim(&links[0], &mut credit, &mut distributed);

        assert_eq!(credit, 4);
        assert_eq!(distributed, 0);
    }
}
