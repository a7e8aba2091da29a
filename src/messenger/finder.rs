//! Match-or-create strategies for links, keyed by address path.

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::{Link, Session};

/// Finds or creates a link of one direction for an address path.
///
/// A link matches when its direction agrees and its local terminus (the
/// target for senders, the source for receivers) equals the path; a link
/// without a terminus address matches the empty path.
pub(super) enum LinkFinder {
    /// Find or create a sending link feeding `path`.
    Sender {
        /// Address path the link targets.
        path: String,
    },
    /// Find or create a receiving link draining `path`.
    Receiver {
        /// Address path the link sources.
        path: String,
    },
}

impl LinkFinder {
    pub(super) fn sender(path: impl Into<String>) -> LinkFinder {
        LinkFinder::Sender { path: path.into() }
    }

    pub(super) fn receiver(path: impl Into<String>) -> LinkFinder {
        LinkFinder::Receiver { path: path.into() }
    }

    pub(super) fn matches(&self, link: &Rc<RefCell<Link>>) -> bool {
        let link = link.borrow();
        match self {
            LinkFinder::Sender { path } => {
                link.is_sender() && path_matches(link.local_target(), path)
            }
            LinkFinder::Receiver { path } => {
                link.is_receiver() && path_matches(link.local_source(), path)
            }
        }
    }

    pub(super) fn create(&self, session: &Rc<RefCell<Session>>) -> Rc<RefCell<Link>> {
        match self {
            LinkFinder::Sender { path } => {
                let link = Session::sender(session, path);
                link.borrow_mut().set_local_target(Some(path.clone()));
                link
            }
            LinkFinder::Receiver { path } => {
                let link = Session::receiver(session, path);
                link.borrow_mut().set_local_source(Some(path.clone()));
                link
            }
        }
    }
}

fn path_matches(address: Option<&str>, path: &str) -> bool {
    match address {
        Some(address) => address == path,
        None => path.is_empty(),
    }
}
