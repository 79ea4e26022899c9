//! Byte-bounded ingestion queue.
//!
//! Producers enqueue without blocking; a single worker task hands items to a consumer one
//! at a time, in order. Capacity is measured in bytes, not items. Once the ceiling is hit
//! the queue refuses everything until it has drained down to the resume threshold (zero by
//! default), so producers do not flap at the boundary.

use bitcoin::Block;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Items whose queue footprint is their size in bytes
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl Weighted for Block {
    fn weight(&self) -> usize {
        self.total_size()
    }
}

/// Receives queued items on the worker task
#[async_trait::async_trait]
pub trait QueueConsumer<T>: Send + Sync {
    async fn consume(&self, item: T);

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct QueueState {
    queued_bytes: usize,
    max_reached: bool,
}

pub struct IngestionQueue<T> {
    sender: mpsc::UnboundedSender<(T, usize)>,
    state: Arc<Mutex<QueueState>>,
    queued: Arc<watch::Sender<usize>>,
    max_bytes: usize,
    resume_bytes: usize,
    worker: JoinHandle<()>,
}

impl<T: Weighted + Send + 'static> IngestionQueue<T> {
    /// Start the worker feeding `consumer`.
    ///
    /// Enqueueing is refused once `max_bytes` are queued and accepted again when no more
    /// than `resume_bytes` remain.
    pub fn spawn(
        consumer: Arc<dyn QueueConsumer<T>>,
        max_bytes: usize,
        resume_bytes: usize,
    ) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(T, usize)>();
        let queued = Arc::new(watch::Sender::new(0usize));
        let state = Arc::new(Mutex::new(QueueState::default()));

        let worker_state = state.clone();
        let worker_queued = queued.clone();
        let worker = tokio::spawn(async move {
            info!("Ingestion queue worker started for {}", consumer.name());
            while let Some((item, weight)) = receiver.recv().await {
                consumer.consume(item).await;

                {
                    let mut state = worker_state.lock().unwrap_or_else(PoisonError::into_inner);
                    state.queued_bytes = state.queued_bytes.saturating_sub(weight);
                    worker_queued.send_replace(state.queued_bytes);
                }
            }
            debug!("Ingestion queue worker for {} stopped", consumer.name());
        });

        Self {
            sender,
            state,
            queued,
            max_bytes,
            resume_bytes,
            worker,
        }
    }

    /// Queue an item. Returns `false` when the queue is full or shut down.
    pub fn try_enqueue(&self, item: T) -> bool {
        let weight = item.weight();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.max_reached {
            if state.queued_bytes > self.resume_bytes {
                return false;
            }
            info!(
                "Ingestion queue drained to {} bytes, accepting again",
                state.queued_bytes
            );
            state.max_reached = false;
        }

        if self.sender.send((item, weight)).is_err() {
            warn!("Ingestion queue worker is gone, dropping item");
            return false;
        }

        state.queued_bytes += weight;
        self.queued.send_replace(state.queued_bytes);
        if state.queued_bytes >= self.max_bytes {
            warn!(
                "Ingestion queue full at {} bytes, refusing new items",
                state.queued_bytes
            );
            state.max_reached = true;
        }
        true
    }

    pub fn queued_bytes(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queued_bytes
    }

    pub fn is_full(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .max_reached
    }

    /// Wait until every queued item has been consumed.
    pub async fn wait_drained(&self) {
        let mut queued = self.queued.subscribe();
        let _ = queued.wait_for(|bytes| *bytes == 0).await;
    }

    /// Stop accepting items, let the worker finish the backlog and wait for it.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            warn!("Ingestion queue worker failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    const MB: usize = 1024 * 1024;

    struct Item(usize);

    impl Weighted for Item {
        fn weight(&self) -> usize {
            self.0
        }
    }

    /// Consumes one item per permit.
    struct Gated {
        permits: Arc<Semaphore>,
        consumed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl QueueConsumer<Item> for Gated {
        async fn consume(&self, _item: Item) {
            self.permits.acquire().await.unwrap().forget();
            self.consumed.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &'static str {
            "gated"
        }
    }

    fn gated() -> (Arc<Gated>, Arc<Semaphore>) {
        let permits = Arc::new(Semaphore::new(0));
        let consumer = Arc::new(Gated {
            permits: permits.clone(),
            consumed: AtomicUsize::new(0),
        });
        (consumer, permits)
    }

    #[tokio::test]
    async fn refuses_at_ceiling_until_fully_drained() {
        let (consumer, permits) = gated();
        let queue = IngestionQueue::spawn(consumer.clone(), 100 * MB, 0);

        for _ in 0..4 {
            assert!(queue.try_enqueue(Item(25 * MB)));
        }
        assert_eq!(queue.queued_bytes(), 100 * MB);
        assert!(queue.is_full());
        assert!(!queue.try_enqueue(Item(1)));

        // Partially drained is still refused
        permits.add_permits(1);
        while consumer.consumed.load(Ordering::SeqCst) < 1 || queue.queued_bytes() > 75 * MB {
            tokio::task::yield_now().await;
        }
        assert!(!queue.try_enqueue(Item(1)));

        permits.add_permits(3);
        queue.wait_drained().await;
        assert!(queue.try_enqueue(Item(1)));
        assert!(!queue.is_full());

        permits.add_permits(1);
        queue.shutdown().await;
        assert_eq!(consumer.consumed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn resume_threshold_rearms_early() {
        let (consumer, permits) = gated();
        let queue = IngestionQueue::spawn(consumer.clone(), 10, 5);

        assert!(queue.try_enqueue(Item(5)));
        assert!(queue.try_enqueue(Item(5)));
        assert!(!queue.try_enqueue(Item(1)));

        permits.add_permits(1);
        while queue.queued_bytes() > 5 {
            tokio::task::yield_now().await;
        }
        assert!(queue.try_enqueue(Item(1)));

        permits.add_permits(2);
        queue.shutdown().await;
        assert_eq!(consumer.consumed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn items_are_consumed_in_order() {
        struct Order(Mutex<Vec<usize>>);

        #[async_trait::async_trait]
        impl QueueConsumer<Item> for Order {
            async fn consume(&self, item: Item) {
                self.0.lock().unwrap().push(item.0);
            }

            fn name(&self) -> &'static str {
                "order"
            }
        }

        let consumer = Arc::new(Order(Mutex::new(Vec::new())));
        let queue = IngestionQueue::spawn(consumer.clone(), usize::MAX, 0);
        for weight in 1..=5 {
            assert!(queue.try_enqueue(Item(weight)));
        }
        queue.shutdown().await;

        assert_eq!(*consumer.0.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }
}
