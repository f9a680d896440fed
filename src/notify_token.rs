use std::cell::Cell;
use std::rc::Rc;

/// Receives the outcome of a notify send: called exactly once, with `true` if the remote peer
///  acknowledged the packet and `false` if it is considered lost.
#[cfg_attr(test, mockall::automock)]
pub trait NotifyCallback {
    fn notify(&mut self, delivered: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    Pending,
    Delivered,
    Lost,
}

/// A handle for polling the outcome of a notify send. Clones share the same state.
#[derive(Debug, Clone)]
pub struct NotifyToken {
    status: Rc<Cell<NotifyStatus>>,
}

impl NotifyToken {
    pub(crate) fn new() -> NotifyToken {
        NotifyToken {
            status: Rc::new(Cell::new(NotifyStatus::Pending)),
        }
    }

    pub fn status(&self) -> NotifyStatus {
        self.status.get()
    }
}

impl NotifyCallback for NotifyToken {
    fn notify(&mut self, delivered: bool) {
        assert_eq!(self.status.get(), NotifyStatus::Pending, "notify token was already notified");

        self.status.set(if delivered { NotifyStatus::Delivered } else { NotifyStatus::Lost });
    }
}

impl<F: FnMut(bool)> NotifyCallback for F {
    fn notify(&mut self, delivered: bool) {
        self(delivered)
    }
}
