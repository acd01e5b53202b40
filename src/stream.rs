use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::error::{ShmemError, ShmemResult};

/// A unit of work executed in order on a stream
pub type StreamWork = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// An ordered execution stream: work runs in enqueue order, `synchronize`
/// blocks until everything enqueued so far has completed.
pub trait Stream: Send + Sync {
    fn enqueue(&self, work: StreamWork) -> ShmemResult<()>;
    /// reports the first failure of any work item since the last synchronize
    fn synchronize(&self) -> ShmemResult<()>;
}

#[derive(Default)]
struct StreamState {
    pending: usize,
    error: Option<anyhow::Error>,
}

/// A stream backed by one worker thread
pub struct HostStream {
    sender: Option<Sender<StreamWork>>,
    state: Arc<(Mutex<StreamState>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for HostStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStream")
            .field("pending", &self.state.0.lock().pending)
            .finish()
    }
}

impl HostStream {
    pub fn new() -> HostStream {
        let (sender, receiver) = unbounded::<StreamWork>();
        let state: Arc<(Mutex<StreamState>, Condvar)> = Arc::new(Default::default());
        let worker_state = state.clone();
        let worker = std::thread::spawn(move || {
            for work in receiver.iter() {
                let res = work();
                let (lock, cvar) = &*worker_state;
                let mut state = lock.lock();
                if let Err(err) = res {
                    warn!("stream work failed: {:?}", err);
                    if state.error.is_none() {
                        state.error = Some(err);
                    }
                }
                state.pending -= 1;
                if state.pending == 0 {
                    cvar.notify_all();
                }
            }
            trace!("stream worker exiting");
        });
        HostStream {
            sender: Some(sender),
            state,
            worker: Some(worker),
        }
    }
}

impl Default for HostStream {
    fn default() -> Self {
        HostStream::new()
    }
}

impl Stream for HostStream {
    fn enqueue(&self, work: StreamWork) -> ShmemResult<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ShmemError::Inner("stream closed".to_owned()))?;
        self.state.0.lock().pending += 1;
        if sender.send(work).is_err() {
            self.state.0.lock().pending -= 1;
            return Err(ShmemError::Inner("stream worker exited".to_owned()));
        }
        Ok(())
    }

    fn synchronize(&self) -> ShmemResult<()> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock();
        while state.pending > 0 {
            cvar.wait(&mut state);
        }
        match state.error.take() {
            Some(err) => Err(ShmemError::Inner(format!("{:#}", err))),
            None => Ok(()),
        }
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
