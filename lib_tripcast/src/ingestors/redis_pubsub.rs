//! # Redis Pub/Sub Ingestor
//!
//! Subscribes to the telemetry channel and feeds every message payload into the
//! [`TelemetryPipeline`]. A lost connection is retried after a fixed delay until
//! the shutdown token is cancelled.
//!
//! The receive loop itself ([`pump`]) is independent of Redis: it drains any
//! stream of payloads, which keeps it testable without a broker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::pipeline::TelemetryPipeline;
use crate::errors::IngestError;

/// How a [`pump`] run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The shutdown token was cancelled.
    Shutdown,
    /// The payload stream ended (connection lost).
    StreamEnded,
}

/// Feeds payloads from `stream` into `pipeline` until the stream ends or
/// `shutdown` is cancelled. Malformed payloads are counted by the pipeline and
/// skipped.
pub async fn pump<S>(mut stream: S, pipeline: &TelemetryPipeline, shutdown: &CancellationToken) -> PumpExit
where
    S: Stream<Item = Vec<u8>> + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return PumpExit::Shutdown,
            next = stream.next() => match next {
                Some(payload) => {
                    // Rejections are already logged and counted by the pipeline.
                    let _ = pipeline.handle_payload(&payload);
                }
                None => return PumpExit::StreamEnded,
            }
        }
    }
}

/// Long-lived subscription to one Redis Pub/Sub channel.
pub struct RedisIngestor {
    redis_url: String,
    channel: String,
    reconnect_delay: Duration,
    pipeline: Arc<TelemetryPipeline>,
    attempts: AtomicU64,
}

impl RedisIngestor {
    /// Creates an ingestor for `channel` on the server at `redis_url`.
    pub fn new(redis_url: &str, channel: &str, reconnect_delay: Duration, pipeline: Arc<TelemetryPipeline>) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            channel: channel.to_string(),
            reconnect_delay,
            pipeline,
            attempts: AtomicU64::new(0),
        }
    }

    /// Subscription attempts made so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Subscribes once and pumps messages until the connection drops.
    async fn subscribe_once(&self, shutdown: &CancellationToken) -> Result<PumpExit, IngestError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let client = redis::Client::open(self.redis_url.as_str()).map_err(|e| IngestError::Broker(e.to_string()))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| IngestError::Broker(e.to_string()))?;
        pubsub
            .subscribe(self.channel.as_str())
            .await
            .map_err(|e| IngestError::Broker(e.to_string()))?;
        info!(url = %self.redis_url, channel = %self.channel, "subscribed to telemetry channel");

        let payloads = pubsub.on_message().map(|msg| msg.get_payload_bytes().to_vec());
        Ok(pump(Box::pin(payloads), &self.pipeline, shutdown).await)
    }

    /// # Run
    ///
    /// Keeps the subscription alive until `shutdown` is cancelled, waiting the
    /// reconnect delay between attempts.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.subscribe_once(&shutdown) => result,
            };
            match attempt {
                Ok(PumpExit::Shutdown) => break,
                Ok(PumpExit::StreamEnded) => {
                    warn!(channel = %self.channel, error = %IngestError::StreamEnded, "resubscribing");
                }
                Err(e) => {
                    error!(error = %e, "telemetry subscription failed");
                }
            }

            debug!(delay = ?self.reconnect_delay, "waiting before reconnect");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("telemetry ingestor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::classifier::{Classifier, Prediction};
    use crate::collaborators::resolver::{RoadAttribute, RoadResolver};
    use crate::collaborators::sink::DiscardSink;
    use crate::core::broadcast_hub::BroadcastHub;
    use crate::core::pipeline::PipelineParts;
    use crate::core::registry::TripRegistry;
    use crate::core::sample::{FeatureVector, Position};
    use crate::errors::ResolveError;
    use async_trait::async_trait;
    use futures_util::stream;

    struct Idle;

    impl Classifier for Idle {
        fn predict(&self, _window: &[FeatureVector]) -> Prediction {
            Prediction::Buffering
        }
    }

    #[async_trait]
    impl RoadResolver for Idle {
        async fn lookup(&self, _position: Position) -> Result<RoadAttribute, ResolveError> {
            Err(ResolveError::Status(503))
        }
    }

    fn pipeline() -> TelemetryPipeline {
        TelemetryPipeline::new(PipelineParts {
            registry: Arc::new(TripRegistry::new(4)),
            hub: Arc::new(BroadcastHub::new(8)),
            classifier: Arc::new(Idle),
            resolver: Arc::new(Idle),
            sink: Arc::new(DiscardSink),
            enrichment_interval: Duration::from_secs(10),
            speeding_tolerance_kmh: 5.0,
        })
    }

    #[tokio::test]
    async fn pump_drains_stream_and_skips_garbage() {
        let pipeline = pipeline();
        let payloads = stream::iter(vec![
            br#"{"tripId":"a"}"#.to_vec(),
            b"garbage".to_vec(),
            br#"{"tripId":"b"}"#.to_vec(),
        ]);

        let exit = pump(payloads, &pipeline, &CancellationToken::new()).await;
        assert_eq!(exit, PumpExit::StreamEnded);
        assert_eq!(pipeline.accepted(), 2);
        assert_eq!(pipeline.rejected(), 1);
        assert_eq!(pipeline.registry().list_active_trip_ids(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn pump_stops_on_shutdown() {
        let pipeline = pipeline();
        let token = CancellationToken::new();
        token.cancel();
        let exit = pump(stream::pending::<Vec<u8>>(), &pipeline, &token).await;
        assert_eq!(exit, PumpExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn run_resubscribes_after_fixed_delay_until_cancelled() {
        // An unparsable URL fails every attempt before any network IO.
        let ingestor = Arc::new(RedisIngestor::new(
            "not-a-redis-url",
            "telematics/data",
            Duration::from_secs(5),
            Arc::new(pipeline()),
        ));
        let token = CancellationToken::new();
        let handle = tokio::spawn(ingestor.clone().run(token.clone()));

        // Attempts at 0s, 5s and 10s.
        tokio::time::sleep(Duration::from_secs(12)).await;
        token.cancel();
        handle.await.unwrap();

        let attempts = ingestor.attempts();
        assert!((2..=3).contains(&attempts), "attempts = {attempts}");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ingestor.attempts(), attempts);
    }
}
