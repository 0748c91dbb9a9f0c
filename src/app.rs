use std::{any::Any, path::PathBuf, sync::Arc};

use axum::{
    Router,
    http::{HeaderValue, Method, header::CONTENT_DISPOSITION},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::sync::Semaphore;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{self, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info};

use crate::{
    auth,
    config::{Config, normalize_origin},
    error::ApiError,
    extractor::Extractor,
    handlers,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub extractor: Arc<dyn Extractor>,
    pub download_semaphore: Arc<Semaphore>,
    pub work_dir: PathBuf,
}

impl AppState {
    pub fn new(config: Config, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            download_semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            work_dir: config.work_dir.clone(),
            config: Arc::new(config),
            extractor,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let download = Router::new()
        .route("/download", post(handlers::download))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    let mut app = Router::new()
        .route("/health", get(handlers::health))
        .merge(download)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = state.config.allowed_origins.clone().map(build_cors_layer) {
        app = app.layer(cors);
    }

    app.with_state(state)
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "request handler panicked".to_string()
    };

    error!("Request handler panicked: {message}");
    ApiError::internal(message).into_response()
}

fn build_cors_layer(allowed_origins: std::collections::HashSet<String>) -> CorsLayer {
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allowed_origins = Arc::new(allowed_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(cors::Any)
        .expose_headers([CONTENT_DISPOSITION])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{
            Request, StatusCode,
            header::{ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ORIGIN},
        },
    };
    use tower::ServiceExt;

    use crate::extractor::{ExtractError, ExtractOptions};

    struct UnusedExtractor;

    #[async_trait]
    impl Extractor for UnusedExtractor {
        async fn extract(&self, _url: &str, _options: &ExtractOptions) -> Result<(), ExtractError> {
            unreachable!("health checks never extract")
        }
    }

    fn app_with_origins(origins: &str) -> Router {
        let env = HashMap::from([("ALLOWED_ORIGINS".to_string(), origins.to_string())]);
        let config = Config::from_lookup(|name| env.get(name).cloned()).unwrap();
        router(AppState::new(config, Arc::new(UnusedExtractor)))
    }

    fn health_from(origin: &str) -> Request<Body> {
        Request::builder()
            .uri("/health")
            .header(ORIGIN, origin)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn allowed_origin_is_echoed_with_exposed_disposition() {
        let app = app_with_origins("https://app.example.com, http://localhost:5173");

        let response = app
            .clone()
            .oneshot(health_from("https://APP.example.com:443"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://APP.example.com:443"
        );
        let exposed = response.headers()[ACCESS_CONTROL_EXPOSE_HEADERS]
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(exposed.contains("content-disposition"));

        let response = app.oneshot(health_from("http://localhost:5173")).await.unwrap();
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
    }

    #[tokio::test]
    async fn foreign_origin_gets_no_cors_headers() {
        let app = app_with_origins("https://app.example.com");

        let response = app.oneshot(health_from("https://evil.example.net")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn preflight_allows_download_posts() {
        let app = app_with_origins("https://app.example.com");
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/download")
            .header(ORIGIN, "https://app.example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example.com"
        );
        let methods = response.headers()["access-control-allow-methods"]
            .to_str()
            .unwrap()
            .to_string();
        assert!(methods.contains("POST"));
    }
}
