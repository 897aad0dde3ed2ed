//! Host-driven network reachability signal.

use std::sync::Arc;
use tokio::sync::watch;

/// Whether the remote API is reachable, as reported by the host platform.
#[derive(Debug, Clone)]
pub struct Reachability {
    sender: Arc<watch::Sender<bool>>,
}

impl Reachability {
    pub fn new(available: bool) -> Self {
        let (sender, _) = watch::channel(available);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn is_available(&self) -> bool {
        *self.sender.borrow()
    }

    /// Update the signal. Returns true when the value changed.
    pub fn set(&self, available: bool) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == available {
                false
            } else {
                *current = available;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for Reachability {
    fn default() -> Self {
        Self::new(true)
    }
}
