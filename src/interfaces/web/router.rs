use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use super::AppState;
use super::handlers::{health, install, tokens};

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/tokens", get(tokens::get_tokens))
        .route("/install", post(install::install))
        .route("/set-tokens", post(tokens::set_tokens))
        .route("/handler", post(health::event_handler))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}
