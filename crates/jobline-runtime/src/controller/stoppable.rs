use std::sync::{Arc, Mutex, MutexGuard};

use jobline_core::error::Result;

use super::Controller;

/// The element controller currently executing within one traversal.
///
/// The execution task publishes a controller with [`enter`](Self::enter)
/// right before dispatch; the returned guard clears the slot when the
/// element finishes. A stop arriving while the slot is empty is picked up
/// by the traversal's next STOPPING check instead.
#[derive(Default)]
pub struct CurrentController {
    slot: Mutex<Option<Arc<Controller>>>,
}

impl CurrentController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Controller>>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enter(&self, controller: Arc<Controller>) -> SlotGuard<'_> {
        *self.lock() = Some(controller);
        SlotGuard { owner: self }
    }

    pub fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    /// Forward a stop to the running controller, if any.
    ///
    /// The stop is delivered after the lock is released, so it can reach a
    /// controller whose element finished in between. That is a no-op: a
    /// finished step has no active artifact and a joined split's branches
    /// are terminal, which the kernel's stop ignores.
    pub async fn forward_stop(&self) -> Result<()> {
        let current = self.lock().clone();
        match current {
            Some(controller) => controller.stop().await,
            None => Ok(()),
        }
    }
}

pub struct SlotGuard<'a> {
    owner: &'a CurrentController,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.owner.lock() = None;
    }
}
