//! Counter-based events
//!
//! Recording an event on a stream captures `(stream, sequence number)`.
//! Waiting means waiting for that stream's completed counter to reach the
//! number. Re-recording replaces the mark.

use super::stream::{CommandStream, StreamState};
use crate::backend::{BackendFamily, Event};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct EventMark {
    stream: Arc<StreamState>,
    seq: u64,
}

impl EventMark {
    pub fn wait(&self) {
        self.stream.wait_for(self.seq);
    }

    pub fn is_reached(&self) -> bool {
        self.stream.completed() >= self.seq
    }
}

/// Payload of a GPU [`crate::backend::Event`].
#[derive(Debug, Default)]
pub struct GpuEvent {
    mark: Mutex<Option<EventMark>>,
}

impl GpuEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark everything submitted to `stream` so far.
    pub fn record(&self, stream: &CommandStream) {
        let seq = stream.submit("event_record", || Ok(()));
        *self.mark.lock() = Some(EventMark {
            stream: Arc::clone(stream.state()),
            seq,
        });
    }

    /// Last recorded mark; `None` if never recorded.
    pub fn mark(&self) -> Option<EventMark> {
        self.mark.lock().clone()
    }

    /// Block until the recorded mark is reached. Unrecorded events are
    /// already signalled.
    pub fn synchronize(&self) {
        if let Some(mark) = self.mark() {
            mark.wait();
        }
    }
}

/// The GPU payload of `event`.
///
/// # Panics
///
/// Aborts when the event was created by another backend family.
pub(crate) fn gpu_event<'a>(owner: &str, event: &'a Event) -> &'a GpuEvent {
    if event.family() != BackendFamily::Gpu {
        crate::fatal!("{owner}: foreign {:?} event from {}", event.family(), event.device());
    }
    match event.downcast_ref::<GpuEvent>() {
        Some(inner) => inner,
        None => crate::fatal!("{owner}: event from {} carries no GPU payload", event.device()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_unrecorded_event_is_signalled() {
        let event = GpuEvent::new();
        assert!(event.mark().is_none());
        event.synchronize();
    }

    #[test]
    fn test_cross_stream_wait() {
        let a = CommandStream::spawn("a").unwrap();
        let b = CommandStream::spawn("b").unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&done);
        a.submit("slow", move || {
            std::thread::sleep(Duration::from_millis(30));
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let event = GpuEvent::new();
        event.record(&a);

        let mark = event.mark().unwrap();
        let seen = Arc::new(AtomicBool::new(false));
        let (flag, observed) = (Arc::clone(&done), Arc::clone(&seen));
        b.submit("wait", move || {
            mark.wait();
            Ok(())
        });
        b.submit("observe", move || {
            observed.store(flag.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        });
        b.synchronize();
        assert!(seen.load(Ordering::SeqCst));
        assert!(event.mark().unwrap().is_reached());
    }

    #[test]
    #[should_panic(expected = "foreign Cpu event")]
    fn test_foreign_event_aborts() {
        let event = Event::new("CPU", BackendFamily::Cpu, Box::new(()));
        gpu_event("GPU0", &event);
    }
}
