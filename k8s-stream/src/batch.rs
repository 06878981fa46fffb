use std::mem;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::event::EnrichedEvent;
use crate::metrics_consts::{
    BATCHES_FLUSHED, BATCH_DELIVERY_TIME, BATCH_SIZE, EVENTS_DROPPED, PENDING_EVENTS,
};
use crate::sinks::EventSink;

/// Accumulates enriched events and hands them to the sink by size or by time.
pub struct Batcher {
    run_id: String,
    batch_size: usize,
    interval: Duration,
    sink: Arc<dyn EventSink>,
    receiver: mpsc::Receiver<EnrichedEvent>,
}

impl Batcher {
    pub fn new(
        run_id: String,
        batch_size: usize,
        interval: Duration,
        sink: Arc<dyn EventSink>,
        receiver: mpsc::Receiver<EnrichedEvent>,
    ) -> Self {
        Self {
            run_id,
            batch_size,
            interval,
            sink,
            receiver,
        }
    }

    /// Consume the input channel until every sender is dropped, then flush what is left.
    pub async fn run(mut self) {
        let mut pending: Vec<EnrichedEvent> = Vec::with_capacity(self.batch_size);
        let mut in_flight: Option<JoinHandle<()>> = None;

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.receiver.recv() => {
                    let Some(event) = received else {
                        break;
                    };
                    pending.push(event);
                    gauge!(PENDING_EVENTS).set(pending.len() as f64);

                    if pending.len() >= self.batch_size {
                        self.flush(&mut pending, &mut in_flight).await;
                        // Timer counts from the last flush
                        ticker.reset();
                    }
                }
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        self.flush(&mut pending, &mut in_flight).await;
                    }
                }
            }
        }

        info!(pending = pending.len(), "input channel closed, flushing remaining events");
        if !pending.is_empty() {
            self.flush(&mut pending, &mut in_flight).await;
        }
        wait_for(in_flight.take()).await;
    }

    async fn flush(
        &self,
        pending: &mut Vec<EnrichedEvent>,
        in_flight: &mut Option<JoinHandle<()>>,
    ) {
        let batch = mem::replace(pending, Vec::with_capacity(self.batch_size));
        gauge!(PENDING_EVENTS).set(0.0);

        // One delivery at a time
        wait_for(in_flight.take()).await;

        debug!(size = batch.len(), "flushing batch");
        *in_flight = Some(tokio::spawn(deliver(
            self.sink.clone(),
            self.run_id.clone(),
            batch,
        )));
    }
}

async fn wait_for(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if let Err(error) = handle.await {
            error!("batch delivery task failed: {}", error);
        }
    }
}

async fn deliver(sink: Arc<dyn EventSink>, run_id: String, batch: Vec<EnrichedEvent>) {
    let size = batch.len();
    let start = Instant::now();

    match sink.deliver(&run_id, batch).await {
        Ok(()) => {
            counter!(BATCHES_FLUSHED).increment(1);
            histogram!(BATCH_SIZE).record(size as f64);
            histogram!(BATCH_DELIVERY_TIME).record(start.elapsed().as_secs_f64());
        }
        Err(error) => {
            error!(size, "failed to deliver batch, dropping it: {}", error);
            counter!(EVENTS_DROPPED).increment(size as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::SinkError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::sleep;

    /// Remembers when each batch arrived, relative to test start.
    struct RecordingSink {
        start: Instant,
        failing: bool,
        batches: Mutex<Vec<(u64, Vec<String>)>>,
    }

    impl RecordingSink {
        fn new(failing: bool) -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                failing,
                batches: Mutex::new(Vec::new()),
            })
        }

        fn batches(&self) -> Vec<(u64, Vec<String>)> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn deliver(&self, run_id: &str, events: Vec<EnrichedEvent>) -> Result<(), SinkError> {
            assert_eq!(run_id, "run-1");
            let ids = events.into_iter().map(|e| e.id).collect();
            self.batches
                .lock()
                .unwrap()
                .push((self.start.elapsed().as_secs(), ids));
            if self.failing {
                return Err(SinkError::AckTimeout);
            }
            Ok(())
        }
    }

    fn event(id: &str) -> EnrichedEvent {
        EnrichedEvent {
            id: id.to_owned(),
            ..Default::default()
        }
    }

    fn start(
        sink: Arc<RecordingSink>,
        batch_size: usize,
    ) -> (mpsc::Sender<EnrichedEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let batcher = Batcher::new(
            "run-1".to_owned(),
            batch_size,
            Duration::from_secs(10),
            sink,
            rx,
        );
        (tx, tokio::spawn(batcher.run()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_then_timer_flush() {
        let sink = RecordingSink::new(false);
        let (tx, handle) = start(sink.clone(), 2);

        tx.send(event("1")).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        tx.send(event("2")).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        tx.send(event("3")).await.unwrap();

        sleep(Duration::from_secs(15)).await;
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            sink.batches(),
            vec![
                (1, vec!["1".to_owned(), "2".to_owned()]),
                (11, vec!["3".to_owned()]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_never_flushes_empty_batches() {
        let sink = RecordingSink::new(false);
        let (tx, handle) = start(sink.clone(), 2);

        sleep(Duration::from_secs(45)).await;
        drop(tx);
        handle.await.unwrap();

        assert!(sink.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_close_flushes_pending() {
        let sink = RecordingSink::new(false);
        let (tx, handle) = start(sink.clone(), 10);

        tx.send(event("1")).await.unwrap();
        tx.send(event("2")).await.unwrap();
        sleep(Duration::from_secs(3)).await;
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            sink.batches(),
            vec![(3, vec!["1".to_owned(), "2".to_owned()])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_dropped() {
        let sink = RecordingSink::new(true);
        let (tx, handle) = start(sink.clone(), 1);

        tx.send(event("1")).await.unwrap();
        tx.send(event("2")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        // Each batch is attempted once, nothing is carried over.
        assert_eq!(
            sink.batches(),
            vec![(0, vec!["1".to_owned()]), (0, vec!["2".to_owned()])]
        );
    }
}
