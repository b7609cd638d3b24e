//! # Serial Queue
//!
//! Coda a concorrenza 1 per le ottimizzazioni guidate da un modello esterno:
//! le richieste vengono eseguite una alla volta, in ordine di arrivo, e ogni
//! chiamante riceve il proprio risultato su un canale dedicato.

use crate::error::OptimizeError;
use crate::queue::QueueError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiRequest {
    pub id: Uuid,
    pub site_id: String,
    /// Limit the run to one page
    pub page_path: Option<String>,
    pub instructions: String,
}

impl AiRequest {
    pub fn new(site_id: &str, instructions: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            site_id: site_id.to_string(),
            page_path: None,
            instructions: instructions.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiOutcome {
    pub request_id: Uuid,
    pub summary: String,
    pub changed_paths: Vec<String>,
}

#[async_trait]
pub trait AiOptimizer: Send + Sync {
    async fn optimize(&self, request: &AiRequest) -> Result<AiOutcome, OptimizeError>;
}

pub type AiReply = oneshot::Receiver<Result<AiOutcome, OptimizeError>>;

struct Envelope {
    request: AiRequest,
    reply: oneshot::Sender<Result<AiOutcome, OptimizeError>>,
}

pub struct SerialQueue {
    sender: mpsc::UnboundedSender<Envelope>,
    pending: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl SerialQueue {
    /// Spawn the single consumer
    pub fn start(optimizer: Arc<dyn AiOptimizer>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = pending.clone();

        let handle = tokio::spawn(async move {
            while let Some(Envelope { request, reply }) = receiver.recv().await {
                info!("🤖 Running optimization request {} for {}", request.id, request.site_id);
                let result = optimizer.optimize(&request).await;
                if let Err(e) = &result {
                    warn!("⚠️  Optimization request {} failed: {}", request.id, e);
                }
                counter.fetch_sub(1, Ordering::SeqCst);
                if reply.send(result).is_err() {
                    debug!("Caller of request {} went away", request.id);
                }
            }
        });

        Self { sender, pending, handle }
    }

    pub fn submit(&self, request: AiRequest) -> Result<AiReply, QueueError> {
        let (reply, receiver) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(Envelope { request, reply }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        Ok(receiver)
    }

    /// Requests submitted and not finished yet
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Drain what is queued, then stop
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.handle.await {
            warn!("⚠️  Serial queue task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AiOptimizer for Recorder {
        async fn optimize(&self, request: &AiRequest) -> Result<AiOutcome, OptimizeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.order.lock().unwrap().push(request.instructions.clone());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if request.instructions == "fail" {
                return Err(OptimizeError::Validation("bad instructions".into()));
            }
            Ok(AiOutcome {
                request_id: request.id,
                summary: format!("done {}", request.instructions),
                changed_paths: vec!["index.html".into()],
            })
        }
    }

    #[tokio::test]
    async fn test_requests_run_one_at_a_time_in_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = SerialQueue::start(recorder.clone());

        let replies: Vec<AiReply> = ["a", "b", "fail", "c"]
            .iter()
            .map(|i| queue.submit(AiRequest::new("acme", i)).unwrap())
            .collect();

        let mut results = Vec::new();
        for reply in replies {
            results.push(reply.await.unwrap());
        }
        queue.shutdown().await;

        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.order.lock().unwrap(), vec!["a", "b", "fail", "c"]);
        assert!(results[2].is_err());
        assert_eq!(results[3].as_ref().unwrap().summary, "done c");
    }

    #[tokio::test]
    async fn test_pending_count_drops_to_zero() {
        let queue = SerialQueue::start(Arc::new(Recorder::default()));
        let reply = queue.submit(AiRequest::new("acme", "x")).unwrap();
        reply.await.unwrap().unwrap();
        assert_eq!(queue.pending(), 0);
    }
}
