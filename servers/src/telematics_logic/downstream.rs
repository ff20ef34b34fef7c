use anyhow::Result;
use axum::{
    Json, Router,
    extract::State,
    http::header,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures_util::stream::{self, Stream, StreamExt};
use lib_tripcast::{BroadcastEvent, BroadcastHub, ConnectivityMonitor, TelemetryPipeline};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Handles the HTTP side needs to reach the engine.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub monitor: Arc<ConnectivityMonitor>,
    pub pipeline: Arc<TelemetryPipeline>,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sse", get(sse_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serves viewers on `listener` until `state.shutdown` is cancelled.
pub async fn run(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    info!("Downstream server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

/// Events for one viewer: the current device status first, then every
/// broadcast from the moment of subscription. Ends when the viewer is
/// disconnected by the hub or the server shuts down; dropping the stream
/// unregisters the viewer.
pub fn viewer_events(state: AppState) -> impl Stream<Item = Arc<BroadcastEvent>> + Send + 'static {
    let subscription = state.hub.subscribe();
    let initial = BroadcastEvent::status_update(state.monitor.status_at(Instant::now()).label());
    info!(viewer = subscription.id(), "viewer connected");

    let live = stream::unfold(subscription, |mut subscription| async move {
        match subscription.recv().await {
            Some(event) => Some((event, subscription)),
            None => {
                debug!(viewer = subscription.id(), "viewer stream closed by hub");
                None
            }
        }
    });

    stream::once(async move { Arc::new(initial) })
        .chain(live)
        .take_until(state.shutdown.cancelled_owned())
}

fn to_sse_event(event: &BroadcastEvent) -> Event {
    Event::default().event(event.kind.as_str()).data(event.data())
}

async fn sse_handler(State(state): State<AppState>) -> impl IntoResponse {
    let events = viewer_events(state).map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(health_report(&state))
}

pub fn health_report(state: &AppState) -> Value {
    json!({
        "status": "ok",
        "deviceStatus": state.monitor.current().label(),
        "subscribers": state.hub.subscriber_count(),
        "activeTrips": state.pipeline.registry().len(),
        "accepted": state.pipeline.accepted(),
        "rejected": state.pipeline.rejected(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_tripcast::core::sample::{FeatureVector, Position};
    use lib_tripcast::{
        Classifier, DiscardSink, EventKind, PipelineParts, Prediction, ResolveError, RoadAttribute, RoadResolver,
        TripRegistry,
    };
    use async_trait::async_trait;
    use std::time::Duration;

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

    fn state() -> AppState {
        let registry = Arc::new(TripRegistry::new(4));
        let hub = Arc::new(BroadcastHub::new(8));
        let monitor = Arc::new(ConnectivityMonitor::new(
            registry.clone(),
            hub.clone(),
            Duration::from_secs(5),
            Duration::from_secs(2),
        ));
        let pipeline = Arc::new(TelemetryPipeline::new(PipelineParts {
            registry,
            hub: hub.clone(),
            classifier: Arc::new(Idle),
            resolver: Arc::new(Idle),
            sink: Arc::new(DiscardSink),
            enrichment_interval: Duration::from_secs(10),
            speeding_tolerance_kmh: 5.0,
        }));
        AppState {
            hub,
            monitor,
            pipeline,
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn viewer_gets_fresh_status_then_live_events() {
        let state = state();
        state.pipeline.handle_payload(br#"{"tripId":"t1"}"#).unwrap();

        let mut events = Box::pin(viewer_events(state.clone()));
        let first = events.next().await.unwrap();
        assert_eq!(first.kind, EventKind::StatusUpdate);
        assert_eq!(first.payload["deviceStatus"], "Device Connected");

        state.hub.publish_event(BroadcastEvent::trip_list_update(&["t1".to_string()]));
        let second = events.next().await.unwrap();
        assert_eq!(second.kind, EventKind::TripListUpdate);
        assert_eq!(state.hub.subscriber_count(), 1);

        drop(events);
        assert_eq!(state.hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn viewer_stream_ends_on_shutdown() {
        let state = state();
        let mut events = Box::pin(viewer_events(state.clone()));
        assert!(events.next().await.is_some());

        state.shutdown.cancel();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn health_reports_counters() {
        let state = state();
        state.pipeline.handle_payload(br#"{"tripId":"t1"}"#).unwrap();
        state.pipeline.handle_payload(b"nope").unwrap_err();
        let _viewer = state.hub.subscribe();

        let report = health_report(&state);
        assert_eq!(report["subscribers"], 1);
        assert_eq!(report["activeTrips"], 1);
        assert_eq!(report["accepted"], 1);
        assert_eq!(report["rejected"], 1);
        assert_eq!(report["deviceStatus"], "Unknown");
    }
}
