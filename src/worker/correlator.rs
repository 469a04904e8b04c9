//! Request/response correlation.
//!
//! A [`Correlator`] hands out time-ordered correlation ids (UUID v7), keeps one
//! completion per outstanding id and fulfils it exactly once: with the
//! matching response, or with a transport failure when the channel closes.
//! Once closed, it refuses new registrations, so no request registered after
//! the rejection sweep can be left pending.

use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};

use super::error::{WorkerError, WorkerResult};

type Completion<T> = oneshot::Sender<WorkerResult<T>>;

struct State<T> {
    pending: HashMap<String, Completion<T>>,
    closed: Option<String>,
}

pub struct Correlator<T> {
    state: Mutex<State<T>>,
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Correlator<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Register a new pending request.
    ///
    /// Returns the fresh correlation id and the receiver its completion will
    /// be delivered to.
    pub async fn register(&self) -> WorkerResult<(String, oneshot::Receiver<WorkerResult<T>>)> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.closed {
            return Err(WorkerError::closed(reason.clone()));
        }

        let mut id = uuid::Uuid::now_v7().to_string();
        while state.pending.contains_key(&id) {
            id = uuid::Uuid::now_v7().to_string();
        }

        let (tx, rx) = oneshot::channel();
        state.pending.insert(id.clone(), tx);
        Ok((id, rx))
    }

    /// Complete the request `id`. Returns `false` for unknown ids.
    pub async fn resolve(&self, id: &str, result: WorkerResult<T>) -> bool {
        let tx = self.state.lock().await.pending.remove(id);
        match tx {
            Some(tx) => {
                // The caller may have stopped waiting (timeout); nothing to do then.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the pending entry without completing it.
    pub async fn forget(&self, id: &str) {
        self.state.lock().await.pending.remove(id);
    }

    /// Reject every pending request with a transport failure and refuse new
    /// ones. Only the first call has an effect; it returns the number of
    /// rejected requests.
    pub async fn reject_all(&self, reason: &str) -> usize {
        let mut state = self.state.lock().await;
        if state.closed.is_some() {
            return 0;
        }
        state.closed = Some(reason.to_string());

        let drained: Vec<_> = state.pending.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(WorkerError::closed(reason)));
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed.is_some()
    }
}
