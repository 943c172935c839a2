//! Cross-stream events and pending device-to-host reads

use super::types::BackendFamily;
use crate::error::{BackendError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::fmt;

/// Synchronization point tied to one device.
///
/// The payload is private to the backend family that created the event;
/// contexts downcast it after checking [`Event::family`].
pub struct Event {
    device: String,
    family: BackendFamily,
    inner: Box<dyn Any + Send + Sync>,
}

impl Event {
    pub fn new(device: impl Into<String>, family: BackendFamily, inner: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            device: device.into(),
            family,
            inner,
        }
    }

    /// Name of the creating device.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn family(&self) -> BackendFamily {
        self.family
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("device", &self.device)
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

/// Result of `get_tensor_async`, available once the stream reaches the read.
#[derive(Debug)]
pub struct PendingRead {
    rx: Receiver<Result<Vec<u8>>>,
}

impl PendingRead {
    /// A read and the sender the stream completes it with.
    pub fn channel() -> (Sender<Result<Vec<u8>>>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (tx, Self { rx })
    }

    /// Already-completed read, for synchronous backends.
    pub fn ready(data: Result<Vec<u8>>) -> Self {
        let (tx, pending) = Self::channel();
        // capacity 1 and a live receiver: cannot fail
        let _ = tx.send(data);
        pending
    }

    /// Block until the bytes arrive.
    pub fn wait(self) -> Result<Vec<u8>> {
        self.rx
            .recv()
            .map_err(|_| BackendError::execution_error("command stream dropped a pending read"))?
    }

    /// Bytes, if the stream has already delivered them.
    pub fn try_take(&self) -> Option<Result<Vec<u8>>> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_read() {
        let pending = PendingRead::ready(Ok(vec![1, 2, 3]));
        assert_eq!(pending.wait().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dropped_sender_is_an_error() {
        let (tx, pending) = PendingRead::channel();
        drop(tx);
        assert!(pending.wait().is_err());
    }

    #[test]
    fn test_event_downcast() {
        let event = Event::new("GPU0", BackendFamily::Gpu, Box::new(7u32));
        assert_eq!(event.downcast_ref::<u32>(), Some(&7));
        assert!(event.downcast_ref::<u64>().is_none());
        assert_eq!(event.device(), "GPU0");
    }
}
