//! HTTP server wiring.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::{admission_middleware, Admission};
use crate::error::{Result, TollgateError};

/// Guard every route of `router` with the admission layer.
pub fn apply_admission<S>(router: Router<S>, admission: Admission) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(axum::middleware::from_fn_with_state(admission, admission_middleware))
}

/// The default application: a health check and a catch-all handler, both
/// behind the admission layer.
pub fn router(admission: Admission) -> Router {
    let app = Router::new()
        .route("/health", get(health))
        .fallback(passthrough);

    apply_admission(app, admission).layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn passthrough() -> Json<serde_json::Value> {
    Json(json!({ "admitted": true }))
}

/// HTTP server for the admission layer.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The routes to serve
    router: Router,
}

impl HttpServer {
    /// Create a server serving the default application.
    pub fn new(addr: SocketAddr, admission: Admission) -> Self {
        Self::with_router(addr, router(admission))
    }

    /// Create a server for an already guarded router.
    pub fn with_router(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with admission control");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TollgateConfig;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn admission() -> Admission {
        Admission::from_config(&TollgateConfig::default(), Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_not_limited() {
        let response = router(admission())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_api_route_gets_headers() {
        let response = router(admission())
            .oneshot(Request::builder().uri("/api/videos").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "1000");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "999");
    }

    #[tokio::test]
    async fn test_server_binds_and_shuts_down() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, admission());
        server.serve_with_shutdown(async {}).await.unwrap();
    }
}
