//! Command streams
//!
//! A stream is a dedicated worker thread draining a `crossbeam-channel`
//! queue. Commands run strictly in submission order. Each command gets a
//! sequence number; the worker publishes the last completed number under a
//! mutex/condvar pair, which is all that synchronization and events need.
//!
//! ```text
//! host ──submit(seq n)──► [ queue ] ──► worker: run, completed = n, notify
//!   └──wait_for(n)──────────────────────────────────────┘
//! ```
//!
//! A failing command does not stop the stream. The first failure is kept as
//! a sticky error until [`CommandStream::take_error`] clears it.

use crate::error::{BackendError, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub(crate) type Command = Box<dyn FnOnce() -> Result<()> + Send>;

enum Message {
    Run { seq: u64, label: &'static str, command: Command },
    Shutdown,
}

/// Completion state shared between a stream, its worker and any event
/// recorded on it.
#[derive(Debug, Default)]
pub struct StreamState {
    completed: Mutex<u64>,
    cond: Condvar,
    error: Mutex<Option<BackendError>>,
}

impl StreamState {
    /// Block until command `seq` has run.
    pub fn wait_for(&self, seq: u64) {
        let mut completed = self.completed.lock();
        while *completed < seq {
            self.cond.wait(&mut completed);
        }
    }

    pub fn completed(&self) -> u64 {
        *self.completed.lock()
    }

    fn finish(&self, seq: u64) {
        let mut completed = self.completed.lock();
        *completed = (*completed).max(seq);
        self.cond.notify_all();
    }
}

pub struct CommandStream {
    name: String,
    tx: Sender<Message>,
    // held across seq allocation and send so queue order is seq order
    submit_lock: Mutex<()>,
    submitted: AtomicU64,
    state: Arc<StreamState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandStream {
    /// Start a stream and its worker thread.
    pub fn spawn(name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let (tx, rx) = crossbeam_channel::unbounded();
        let state = Arc::new(StreamState::default());
        let worker_state = Arc::clone(&state);
        let worker_name = name.clone();
        let worker = std::thread::Builder::new()
            .name(format!("fulcrum-{name}"))
            .spawn(move || run_worker(&worker_name, rx, &worker_state))
            .map_err(|err| BackendError::Other(format!("failed to start command stream {name}: {err}")))?;
        tracing::debug!(stream = %name, "command stream started");
        Ok(Arc::new(Self {
            name,
            tx,
            submit_lock: Mutex::new(()),
            submitted: AtomicU64::new(0),
            state,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &Arc<StreamState> {
        &self.state
    }

    /// Enqueue `command`; returns its sequence number.
    pub fn submit(&self, label: &'static str, command: impl FnOnce() -> Result<()> + Send + 'static) -> u64 {
        let command: Command = Box::new(command);
        let _order = self.submit_lock.lock();
        let seq = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(Message::Run { seq, label, command }).is_err() {
            // worker gone: nothing will ever run, so do not leave waiters hanging
            tracing::error!(stream = %self.name, label, "command stream is closed");
            self.state.finish(seq);
        }
        seq
    }

    /// Run `f` on the stream and block for its result.
    pub fn run_blocking<T: Send + 'static>(
        &self,
        label: &'static str,
        f: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit(label, move || {
            let _ = tx.send(f());
            Ok(())
        });
        rx.recv()
            .map_err(|_| BackendError::execution_error(format!("{} dropped a blocking {label}", self.name)))?
    }

    /// Sequence number of the most recent submission.
    pub fn last_submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Block until everything submitted so far has run.
    pub fn synchronize(&self) {
        self.state.wait_for(self.last_submitted());
    }

    pub fn has_error(&self) -> bool {
        self.state.error.lock().is_some()
    }

    /// Message of the sticky error, if any, without clearing it.
    pub fn error_message(&self) -> Option<String> {
        self.state.error.lock().as_ref().map(ToString::to_string)
    }

    /// Clear and return the sticky error.
    pub fn take_error(&self) -> Option<BackendError> {
        self.state.error.lock().take()
    }
}

fn run_worker(name: &str, rx: Receiver<Message>, state: &StreamState) {
    for message in rx {
        match message {
            Message::Run { seq, label, command } => {
                if let Err(err) = command() {
                    tracing::error!(stream = name, label, seq, error = %err, "command failed");
                    let mut sticky = state.error.lock();
                    if sticky.is_none() {
                        *sticky = Some(err);
                    }
                }
                state.finish(seq);
            }
            Message::Shutdown => break,
        }
    }
    tracing::debug!(stream = name, "command stream stopped");
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        self.synchronize();
        let _ = self.tx.send(Message::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!(stream = %self.name, "command stream worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStream")
            .field("name", &self.name)
            .field("submitted", &self.last_submitted())
            .field("completed", &self.state.completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_commands_run_in_order() {
        let stream = CommandStream::spawn("test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream.submit("push", move || {
                log.lock().push(i);
                Ok(())
            });
        }
        stream.synchronize();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
        assert_eq!(stream.state().completed(), 16);
    }

    #[test]
    fn test_submit_does_not_block() {
        let stream = CommandStream::spawn("slow").unwrap();
        let seq = stream.submit("sleep", || {
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        });
        assert!(stream.state().completed() < seq);
        stream.state().wait_for(seq);
        assert_eq!(stream.state().completed(), seq);
    }

    #[test]
    fn test_sticky_error() {
        let stream = CommandStream::spawn("err").unwrap();
        stream.submit("fail", || Err(BackendError::execution_error("first")));
        stream.submit("fail", || Err(BackendError::execution_error("second")));
        stream.synchronize();
        assert!(stream.has_error());
        assert!(stream.error_message().unwrap().contains("first"));
        assert!(stream.take_error().is_some());
        assert!(!stream.has_error());
    }

    #[test]
    fn test_completed_never_goes_backwards() {
        let state = StreamState::default();
        state.finish(5);
        state.finish(3);
        assert_eq!(state.completed(), 5);
    }

    /// Synchronize on another thread and fail instead of hanging.
    fn synchronize_within(stream: &Arc<CommandStream>, timeout: Duration) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let stream = Arc::clone(stream);
        std::thread::spawn(move || {
            stream.synchronize();
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(timeout).is_ok(), "synchronize did not return");
    }

    #[test]
    fn test_concurrent_submitters_keep_seq_order() {
        let stream = CommandStream::spawn("shared").unwrap();
        let threads = 8;
        let per_thread = 200;
        let barrier = Arc::new(std::sync::Barrier::new(threads));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let stream = Arc::clone(&stream);
                let barrier = Arc::clone(&barrier);
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..per_thread {
                        let seen = Arc::clone(&seen);
                        let state = Arc::clone(stream.state());
                        stream.submit("mark", move || {
                            // everything before this command has already completed
                            seen.lock().push(state.completed());
                            Ok(())
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        synchronize_within(&stream, Duration::from_secs(10));
        let total = (threads * per_thread) as u64;
        assert_eq!(stream.state().completed(), total);
        assert_eq!(*seen.lock(), (0..total).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_blocking_returns_value() {
        let stream = CommandStream::spawn("blocking").unwrap();
        assert_eq!(stream.run_blocking("answer", || Ok(42)).unwrap(), 42);
        assert!(stream.run_blocking::<()>("fail", || Err(BackendError::execution_error("no"))).is_err());
        // errors returned to the caller are not sticky
        assert!(!stream.has_error());
    }
}
