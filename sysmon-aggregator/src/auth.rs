//! Ingest-token gating: a `tower::Layer`/`Service` pair that inspects the
//! request before it reaches the router, trading JWT decode for a
//! constant-time shared-secret compare against `X-SysMon-Token`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use tracing::warn;

/// Constant-time byte comparison: avoids leaking the token's length-prefix
/// match via timing.
fn tokens_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn unauthorized_json() -> axum::response::Response {
    axum::response::Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"error":"unauthorized"}"#))
        .unwrap()
}

#[derive(Clone)]
pub struct IngestTokenLayer {
    pub token: Arc<String>,
}

impl<S> tower::Layer<S> for IngestTokenLayer {
    type Service = IngestTokenService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        IngestTokenService { inner, token: self.token.clone() }
    }
}

#[derive(Clone)]
pub struct IngestTokenService<S> {
    inner: S,
    token: Arc<String>,
}

impl<S> tower::Service<Request> for IngestTokenService<S>
where
    S: tower::Service<Request, Response = axum::response::Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = axum::response::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Only the POST ingest endpoint is gated; GET /api/metrics and the
        // other read endpoints are open or authenticated by deployment
        // choice.
        if req.uri().path() != "/api/metrics" || req.method() != axum::http::Method::POST {
            let mut inner = self.inner.clone();
            return Box::pin(async move { inner.call(req).await });
        }

        let presented = req
            .headers()
            .get("X-SysMon-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let token = self.token.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match presented {
                Some(t) if tokens_equal(&t, &token) => inner.call(req).await,
                _ => {
                    warn!("ingest request rejected: missing or invalid token");
                    Ok(unauthorized_json())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_equal_rejects_different_lengths_and_content() {
        assert!(tokens_equal("secret", "secret"));
        assert!(!tokens_equal("secret", "secre"));
        assert!(!tokens_equal("secret", "SECRET"));
    }
}
