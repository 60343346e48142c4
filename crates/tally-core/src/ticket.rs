use tokio::task::JoinHandle;
use tracing::warn;

/// Handle on a background remote call. Dropping it does not cancel the call.
#[derive(Debug)]
pub struct Ticket<T> {
    handle: JoinHandle<T>,
}

impl<T> Ticket<T> {
    pub(crate) fn new(handle: JoinHandle<T>) -> Self {
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the call to settle. `None` if the task panicked or the
    /// runtime shut it down.
    pub async fn wait(self) -> Option<T> {
        match self.handle.await {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "background mutation task did not complete");
                None
            }
        }
    }
}
