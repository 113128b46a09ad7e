//! Invalidation signals and the interceptor that raises them.

use std::fmt;
use std::time::Duration;

use reqwest::Method;
use tokio::runtime::Handle;
use tracing::debug;

use crate::api::{ApiRequest, CallOutcome, InterceptError, Interceptor};
use crate::config::Config;

use super::bus::EventBus;

/// Why cached data may be out of date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationOrigin {
    /// A mutating call went through an intercepted client.
    Mutation { method: Method, path: String },
    Manual,
}

impl fmt::Display for InvalidationOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationOrigin::Mutation { method, path } => write!(f, "{} {}", method, path),
            InvalidationOrigin::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub origin: InvalidationOrigin,
}

impl Invalidation {
    pub fn mutation(method: Method, path: impl Into<String>) -> Self {
        Self {
            origin: InvalidationOrigin::Mutation {
                method,
                path: path.into(),
            },
        }
    }

    pub fn manual() -> Self {
        Self {
            origin: InvalidationOrigin::Manual,
        }
    }
}

pub type InvalidationBus = EventBus<Invalidation>;

/// Publishes an `Invalidation`, after a settle delay, for every mutating call
/// made against one collection.
///
/// Only observes: the call's result and timing are never affected.
pub struct MutationInterceptor {
    name: String,
    collection_path: String,
    methods: Vec<Method>,
    settle_delay: Duration,
    invalidate_on_failure: bool,
    bus: InvalidationBus,
}

impl MutationInterceptor {
    pub fn new(collection_path: &str, bus: InvalidationBus, settle_delay: Duration) -> Self {
        let mut collection_path = collection_path.to_string();
        if !collection_path.ends_with('/') {
            collection_path.push('/');
        }
        Self {
            name: format!("invalidate:{}@bus{}", collection_path, bus.id()),
            collection_path,
            methods: vec![Method::PATCH, Method::PUT, Method::DELETE],
            settle_delay,
            invalidate_on_failure: true,
            bus,
        }
    }

    pub fn from_config(config: &Config, bus: InvalidationBus) -> Self {
        Self::new(&config.collection_path, bus, config.sync.settle_delay())
            .with_methods(config.watched_methods())
            .with_invalidate_on_failure(config.invalidate_on_failure)
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_invalidate_on_failure(mut self, enabled: bool) -> Self {
        self.invalidate_on_failure = enabled;
        self
    }

    pub fn collection_path(&self) -> &str {
        &self.collection_path
    }

    /// Watched method, and a path equal to the collection or below it.
    /// `/api/requisitions-archive/` is not below `/api/requisitions/`.
    pub fn matches(&self, request: &ApiRequest) -> bool {
        if !self.methods.contains(&request.method) {
            return false;
        }
        let route = request.route();
        route == self.collection_path.trim_end_matches('/') || route.starts_with(&self.collection_path)
    }
}

impl Interceptor for MutationInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn after_call(&self, request: &ApiRequest, outcome: &CallOutcome<'_>) -> Result<(), InterceptError> {
        if !self.matches(request) {
            return Ok(());
        }
        if !outcome.is_success() && !self.invalidate_on_failure {
            debug!(method = %request.method, path = %request.path, "Mutation failed, not invalidating");
            return Ok(());
        }

        let runtime = Handle::try_current().map_err(|_| InterceptError::NoRuntime)?;
        let event = Invalidation::mutation(request.method.clone(), request.route());
        let bus = self.bus.clone();
        let delay = self.settle_delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let notified = bus.publish(&event);
            debug!(origin = %event.origin, subscribers = notified, "Published invalidation");
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiClient, ApiError, ApiResponse, Transport};
    use crate::cache::Subscription;
    use anyhow::Result;
    use futures::future::BoxFuture;
    use reqwest::StatusCode;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    enum Reply {
        Status(StatusCode),
        Unreachable,
    }

    struct FixedTransport(Reply);

    impl Transport for FixedTransport {
        fn send<'a>(&'a self, _request: &'a ApiRequest) -> BoxFuture<'a, Result<ApiResponse>> {
            let reply = match self.0 {
                Reply::Status(status) => Ok(ApiResponse::new(status, r#"{"id": 1}"#)),
                Reply::Unreachable => Err(anyhow::anyhow!("connection reset by peer")),
            };
            Box::pin(async move { reply })
        }
    }

    fn client(reply: Reply) -> ApiClient {
        ApiClient::with_transport(Arc::new(FixedTransport(reply)))
    }

    fn count_signals(bus: &InvalidationBus) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let subscription = bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, subscription)
    }

    fn interceptor(bus: &InvalidationBus) -> MutationInterceptor {
        MutationInterceptor::new("/api/requisitions/", bus.clone(), Duration::from_millis(500))
    }

    #[test]
    fn test_family_matching() {
        let bus = InvalidationBus::new();
        let interceptor = interceptor(&bus);

        assert!(interceptor.matches(&ApiRequest::new(Method::PATCH, "/api/requisitions/1/")));
        assert!(interceptor.matches(&ApiRequest::new(Method::DELETE, "/api/requisitions")));
        assert!(interceptor.matches(&ApiRequest::new(Method::PUT, "/api/requisitions/1/?force=1")));
        assert!(!interceptor.matches(&ApiRequest::new(Method::PATCH, "/api/requisition-items/1/")));
        assert!(!interceptor.matches(&ApiRequest::new(Method::PATCH, "/api/requisitions-archive/1/")));
        assert!(!interceptor.matches(&ApiRequest::new(Method::GET, "/api/requisitions/")));
        assert!(!interceptor.matches(&ApiRequest::new(Method::POST, "/api/requisitions/")));
    }

    #[test]
    fn test_no_runtime_is_reported() {
        let bus = InvalidationBus::new();
        let request = ApiRequest::new(Method::PATCH, "/api/requisitions/1/");
        let result = interceptor(&bus).after_call(&request, &CallOutcome::Completed(StatusCode::OK));
        assert!(matches!(result, Err(InterceptError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_after_settle_delay() {
        let bus = InvalidationBus::new();
        let (count, _sub) = count_signals(&bus);
        let client = client(Reply::Status(StatusCode::OK));
        assert!(client.install_interceptor(Arc::new(interceptor(&bus))));

        let _: Value = client
            .patch_json("/api/requisitions/1/", &serde_json::json!({"status": "accepted"}))
            .await
            .unwrap();

        sleep(Duration::from_millis(499)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_and_other_collections_are_ignored() {
        let bus = InvalidationBus::new();
        let (count, _sub) = count_signals(&bus);
        let client = client(Reply::Status(StatusCode::OK));
        client.install_interceptor(Arc::new(interceptor(&bus)));

        let _: Value = client.get_json("/api/requisitions/").await.unwrap();
        let _: Value = client.post_json("/api/requisitions/", &serde_json::json!({})).await.unwrap();
        let _: Value = client
            .patch_json("/api/requisition-items/1/", &serde_json::json!({}))
            .await
            .unwrap();

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_can_be_watched() {
        let bus = InvalidationBus::new();
        let (count, _sub) = count_signals(&bus);
        let client = client(Reply::Status(StatusCode::CREATED));
        client.install_interceptor(Arc::new(interceptor(&bus).with_methods(vec![Method::POST])));

        let _: Value = client.post_json("/api/requisitions/", &serde_json::json!({})).await.unwrap();
        sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_call_keeps_error_and_signals_once() {
        let bus = InvalidationBus::new();
        let (count, _sub) = count_signals(&bus);

        let unreachable = client(Reply::Unreachable);
        unreachable.install_interceptor(Arc::new(interceptor(&bus)));
        let err = unreachable.delete("/api/requisitions/1/").await.unwrap_err();
        assert!(format!("{:#}", err).contains("connection reset by peer"));

        sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let rejected = client(Reply::Status(StatusCode::INTERNAL_SERVER_ERROR));
        rejected.install_interceptor(Arc::new(interceptor(&bus)));
        let err = rejected
            .patch_json::<Value, _>("/api/requisitions/1/", &serde_json::json!({"status": "accepted"}))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::ServerError(_))));

        sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_can_be_ignored() {
        let bus = InvalidationBus::new();
        let (count, _sub) = count_signals(&bus);
        let client = client(Reply::Unreachable);
        client.install_interceptor(Arc::new(interceptor(&bus).with_invalidate_on_failure(false)));

        assert!(client.delete("/api/requisitions/1/").await.is_err());
        sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_install_signals_once() {
        let bus = InvalidationBus::new();
        let (count, _sub) = count_signals(&bus);
        let client = client(Reply::Status(StatusCode::NO_CONTENT));

        assert!(client.install_interceptor(Arc::new(interceptor(&bus))));
        assert!(!client.install_interceptor(Arc::new(interceptor(&bus))));

        client.delete("/api/requisitions/1/").await.unwrap();
        sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let name = format!("invalidate:/api/requisitions/@bus{}", bus.id());
        assert!(client.remove_interceptor(&name));
        client.delete("/api/requisitions/1/").await.unwrap();
        sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_bus_gets_its_own_interceptor() {
        let first = InvalidationBus::new();
        let second = InvalidationBus::new();
        let (first_count, _first_sub) = count_signals(&first);
        let (second_count, _second_sub) = count_signals(&second);
        let client = client(Reply::Status(StatusCode::NO_CONTENT));

        assert!(client.install_interceptor(Arc::new(interceptor(&first))));
        assert!(client.install_interceptor(Arc::new(interceptor(&second))));
        assert_eq!(client.interceptors().names().len(), 2);

        client.delete("/api/requisitions/1/").await.unwrap();
        sleep(Duration::from_millis(600)).await;
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_config() {
        let config = Config {
            collection_path: "/api/requisitions".to_string(),
            watched_methods: vec!["post".to_string()],
            invalidate_on_failure: false,
            ..Config::default()
        };
        let interceptor = MutationInterceptor::from_config(&config, InvalidationBus::new());
        assert!(interceptor.name().starts_with("invalidate:/api/requisitions/@bus"));
        assert!(interceptor.matches(&ApiRequest::new(Method::POST, "/api/requisitions/")));
        assert!(!interceptor.matches(&ApiRequest::new(Method::PATCH, "/api/requisitions/1/")));
    }
}
