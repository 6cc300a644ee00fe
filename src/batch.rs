use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::BatchError;


struct BatchState {
    current: u32,
    minimum_acceptable: u32,
    next_ids: FxHashMap<u32, u32>,
    cutovers: Vec<JoinHandle<()>>,
}


/// Tracks the identifier epoch ('batch'). The current batch is used for outgoing requests; after
///  moving to a new batch, requests from older batches are still accepted for a grace period
///  and rejected as stale afterwards.
#[derive(Clone)]
pub struct BatchEpochManager {
    state: Arc<Mutex<BatchState>>,
    cutover_timeout: Duration,
}

impl BatchEpochManager {
    pub fn new(initial_batch: u32, cutover_timeout: Duration) -> BatchEpochManager {
        BatchEpochManager {
            state: Arc::new(Mutex::new(BatchState {
                current: initial_batch,
                minimum_acceptable: initial_batch,
                next_ids: FxHashMap::default(),
                cutovers: Vec::new(),
            })),
            cutover_timeout,
        }
    }

    pub async fn advance(&self, new_batch: u32) -> Result<(), BatchError> {
        let mut state = self.state.lock().await;
        if new_batch < state.current {
            return Err(BatchError::InvalidBatchTransition { current: state.current, requested: new_batch });
        }
        if new_batch == state.current {
            return Ok(());
        }

        info!("moving from batch {} to batch {}, cutover in {:?}", state.current, new_batch, self.cutover_timeout);
        state.current = new_batch;

        state.cutovers.retain(|h| !h.is_finished());

        let cloned_state = self.state.clone();
        let cutover_timeout = self.cutover_timeout;
        state.cutovers.push(tokio::spawn(async move {
            tokio::time::sleep(cutover_timeout).await;

            let mut state = cloned_state.lock().await;
            if new_batch > state.minimum_acceptable {
                debug!("batch cutover: requests from batches before {} are rejected from now on", new_batch);
                state.minimum_acceptable = new_batch;
            }
        }));
        Ok(())
    }

    /// Identifiers start at 0 per batch and wrap around at u32::MAX
    pub async fn next_identifier(&self, batch: u32) -> u32 {
        let mut state = self.state.lock().await;
        let next = state.next_ids.entry(batch).or_insert(0);
        let id = *next;
        *next = next.wrapping_add(1);
        id
    }

    pub async fn is_acceptable(&self, batch: u32) -> bool {
        batch >= self.state.lock().await.minimum_acceptable
    }

    pub async fn current(&self) -> u32 {
        self.state.lock().await.current
    }

    pub async fn minimum_acceptable(&self) -> u32 {
        self.state.lock().await.minimum_acceptable
    }

    pub async fn cancel_cutovers(&self) {
        let mut state = self.state.lock().await;
        for handle in state.cutovers.drain(..) {
            handle.abort();
        }
    }
}
