// Request gate for the HTTP router
//
// Every request passes through `AdmissionService`. Excluded paths (and all
// paths while shedding is disabled) go straight through. While shedding, a
// governed request gets a fixed 503 before the inner service sees it. An
// admitted request carries a `CompletionGuard` whose drop records its duration.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use prometheus::IntGauge;
use tower::{Layer, Service};

use crate::control::shedder::{Admission, AdmissionController};
use crate::errors::{ErrorResponse, LookupError};

/// The fixed 503 body returned while shedding.
pub fn overloaded_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse::from(&LookupError::Overloaded)),
    )
        .into_response()
}

/// Records the completion of one admitted request when dropped.
pub struct CompletionGuard {
    controller: Arc<AdmissionController>,
    started_ms: u64,
}

impl CompletionGuard {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        let started_ms = controller.clock().now_ms();
        Self {
            controller,
            started_ms,
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let elapsed = self
            .controller
            .clock()
            .now_ms()
            .saturating_sub(self.started_ms);
        self.controller.record_completion(elapsed);
    }
}

/// Holds one unit of the in-flight gauge.
struct InFlight(IntGauge);

impl InFlight {
    fn enter(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[derive(Clone)]
pub struct AdmissionLayer {
    controller: Arc<AdmissionController>,
    in_flight: IntGauge,
}

impl AdmissionLayer {
    pub fn new(controller: Arc<AdmissionController>, in_flight: IntGauge) -> Self {
        Self {
            controller,
            in_flight,
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            controller: Arc::clone(&self.controller),
            in_flight: self.in_flight.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    controller: Arc<AdmissionController>,
    in_flight: IntGauge,
}

impl<S> Service<Request> for AdmissionService<S>
where
    S: Service<Request, Response = Response> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let completion = match self.controller.admit(req.uri().path()) {
            Admission::Rejected => return Box::pin(async { Ok(overloaded_response()) }),
            Admission::PassThrough => None,
            Admission::Admitted => Some(CompletionGuard::new(Arc::clone(&self.controller))),
        };

        let in_flight = InFlight::enter(&self.in_flight);
        let fut = self.inner.call(req);
        Box::pin(async move {
            // dropped after the response is produced, or with the future if cancelled
            let _completion = completion;
            let _in_flight = in_flight;
            fut.await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ShedderConfig;
    use crate::metrics::Metrics;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    #[derive(Clone)]
    struct Counting {
        calls: Arc<AtomicUsize>,
        clock: Arc<ManualClock>,
        cost_ms: u64,
    }

    impl Service<Request> for Counting {
        type Response = Response;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request) -> Self::Future {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.clock.advance_ms(self.cost_ms);
            Box::pin(async { Ok(StatusCode::OK.into_response()) })
        }
    }

    fn setup(cost_ms: u64) -> (Arc<AdmissionController>, Metrics, Arc<ManualClock>, Counting) {
        let clock = ManualClock::new(50_000);
        let metrics = Metrics::new().unwrap();
        let cfg = ShedderConfig {
            enabled: true,
            recent_time_window_seconds: 2,
            high_traffic_threshold_rps: 1,
            timeout_rate_percent: 50.0,
            response_time_threshold_ms: 100,
            check_interval_seconds: 1,
            trigger_consecutive_checks: 1,
            cooldown_consecutive_checks: 1,
            excluded_paths: vec!["/health".into()],
        };
        let controller = Arc::new(AdmissionController::new(cfg, metrics.clone(), clock.clone()));
        let inner = Counting {
            calls: Arc::new(AtomicUsize::new(0)),
            clock: clock.clone(),
            cost_ms,
        };
        (controller, metrics, clock, inner)
    }

    fn req(path: &str) -> Request {
        Request::builder()
            .uri(path)
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn admitted_requests_record_their_duration() {
        let (controller, metrics, _clock, inner) = setup(250);
        let layer = AdmissionLayer::new(controller.clone(), metrics.in_flight_requests.clone());
        let resp = layer.layer(inner).oneshot(req("/api/v1/products/1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        // clock started at second 50, handler moved it to 50.25
        assert_eq!(controller.window().counts_for_second(50), (1, 1));
        assert_eq!(metrics.in_flight_requests.get(), 0);
    }

    #[tokio::test]
    async fn excluded_paths_are_not_recorded() {
        let (controller, metrics, _clock, inner) = setup(250);
        let layer = AdmissionLayer::new(controller.clone(), metrics.in_flight_requests.clone());
        layer.layer(inner).oneshot(req("/health")).await.unwrap();
        assert_eq!(controller.window().counts_for_second(50), (0, 0));
    }

    #[tokio::test]
    async fn rejected_requests_never_reach_the_handler() {
        let (controller, metrics, clock, inner) = setup(250);
        let calls = inner.calls.clone();
        let layer = AdmissionLayer::new(controller.clone(), metrics.in_flight_requests.clone());

        for _ in 0..4 {
            layer.layer(inner.clone()).oneshot(req("/api/v1/products/1")).await.unwrap();
        }
        clock.advance_ms(1_000);
        controller.evaluate();
        assert!(controller.is_shedding());

        let before = calls.load(Ordering::SeqCst);
        let resp = layer.layer(inner.clone()).oneshot(req("/api/v1/products/1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), before);
        assert_eq!(metrics.shedding_rejections_total.get(), 1);

        let ok = layer.layer(inner).oneshot(req("/health")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn overloaded_body_is_fixed() {
        let resp = overloaded_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["error"], "SERVICE_OVERLOADED");
        assert_eq!(v["message"], "Server is at capacity; try again later");
    }

    #[test]
    fn dropped_guard_records_once() {
        let (controller, _metrics, clock, _inner) = setup(0);
        let guard = CompletionGuard::new(controller.clone());
        clock.advance_ms(500);
        drop(guard);
        assert_eq!(controller.window().counts_for_second(50), (1, 1));
    }
}
