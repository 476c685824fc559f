//! # Membership
//!
//! Membership views: the set of reachable nodes, as seen by the group layer.
//!
//! The dispatcher does not run a membership protocol. It consumes a view and a
//! change feed, and prunes the node registry whenever the view changes.

use std::collections::HashSet;

use tokio::sync::watch;

use crate::transport::Address;

/// A source of membership views.
pub trait Membership: Send + Sync + 'static {
    fn current_members(&self) -> HashSet<Address>;

    /// A receiver that is notified on every view change.
    fn subscribe(&self) -> watch::Receiver<HashSet<Address>>;
}

/// A membership view maintained by hand (or by a transport that learns of joins and leaves).
pub struct StaticMembership {
    view: watch::Sender<HashSet<Address>>,
}

impl StaticMembership {
    pub fn new(members: impl IntoIterator<Item = Address>) -> Self {
        let (view, _) = watch::channel(members.into_iter().collect());
        Self { view }
    }

    /// Replaces the whole view.
    pub fn set(&self, members: impl IntoIterator<Item = Address>) {
        self.view.send_replace(members.into_iter().collect());
    }

    pub fn join(&self, member: Address) {
        self.view.send_if_modified(|view| view.insert(member));
    }

    pub fn leave(&self, member: &Address) {
        self.view.send_if_modified(|view| view.remove(member));
    }
}

impl Default for StaticMembership {
    fn default() -> Self {
        Self::new([])
    }
}

impl Membership for StaticMembership {
    fn current_members(&self) -> HashSet<Address> {
        self.view.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<HashSet<Address>> {
        self.view.subscribe()
    }
}
