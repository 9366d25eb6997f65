use crate::config::ApiConfig;
use crate::interceptor::Interceptor;
use crate::origin::{resolve_target, OriginRequest};
use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use reqwest::Url;
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub interceptor: Arc<Interceptor>,
    pub origin_base: Url,
    pub max_request_body_bytes: usize,
}

/// Create the proxy router. Every method and path goes to the interceptor.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .fallback(proxy)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn proxy(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    let body = match to_bytes(body, state.max_request_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, uri = %parts.uri, "Rejecting request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    let request = OriginRequest {
        method: parts.method,
        url: resolve_target(&state.origin_base, parts.uri.path(), parts.uri.query()),
        headers: parts.headers,
        body,
    };

    match state.interceptor.handle(request).await {
        Ok(intercepted) => intercepted.response.into_response(),
        Err(e) => {
            error!(error = %e, uri = %parts.uri, "Origin unreachable");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

/// Serve until `shutdown` resolves
pub async fn start_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting resize proxy");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Proxy server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::testing::StaticOrigin;
    use crate::origin::{MockOriginFetcher, TransportError};
    use crate::transcoder::tests::sample_image;
    use crate::transcoder::Transcoder;
    use axum::http::header;
    use image::{GenericImageView, ImageFormat};
    use tower::ServiceExt;

    fn router(origin: Arc<dyn crate::origin::OriginFetcher>, max_body: usize) -> Router {
        create_router(AppState {
            interceptor: Arc::new(Interceptor::new(origin, Transcoder::default(), None)),
            origin_base: Url::parse("http://minio:9000").unwrap(),
            max_request_body_bytes: max_body,
        })
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_resized_variant() {
        let origin = StaticOrigin::default().with_object(
            "/images/cat.jpg",
            "image/jpeg",
            sample_image(1000, 500, ImageFormat::Jpeg),
        );
        let response = router(Arc::new(origin), 1024)
            .oneshot(get("/images/cat.jpg_200"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        let content_length: usize = response.headers()[header::CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), content_length);
        assert_eq!(image::load_from_memory(&body).unwrap().dimensions(), (200, 100));
    }

    #[tokio::test]
    async fn test_forwards_query_to_origin() {
        let origin = Arc::new(StaticOrigin::default());
        let response = router(origin.clone(), 1024)
            .oneshot(get("/images/cat.jpg?versionId=3"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            origin.requested()[0].as_str(),
            "http://minio:9000/images/cat.jpg?versionId=3"
        );
    }

    #[tokio::test]
    async fn test_transport_error_maps_to_bad_gateway() {
        let mut origin = MockOriginFetcher::new();
        origin
            .expect_fetch()
            .returning(|_| Err(TransportError::TooLarge { limit: 10 }));

        let response = router(Arc::new(origin), 1024)
            .oneshot(get("/images/cat.jpg"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_rejects_oversized_body() {
        let origin = Arc::new(StaticOrigin::default());
        let request = Request::builder()
            .method("PUT")
            .uri("/images/upload.png")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();

        let response = router(origin.clone(), 16).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(origin.requested().is_empty());
    }
}
