use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::info;

use crate::key_generator::KeyGenerator;

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = client_ip(&request);
    let started = Instant::now();

    info!(
        target: "dispatcher::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "dispatcher::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}

fn client_ip(request: &Request) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    match KeyGenerator::client_ip(request.headers(), peer) {
        Some(ip) => ip.to_string(),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_ip_from_forwarded_header() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));
        assert_eq!(client_ip(&request), "192.168.1.1");
    }

    #[test]
    fn test_client_ip_from_connection() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .extensions_mut()
            .insert(ConnectInfo("10.1.2.3:5555".parse::<SocketAddr>().unwrap()));
        assert_eq!(client_ip(&request), "10.1.2.3");
    }

    #[test]
    fn test_client_ip_fallback() {
        let request = Request::new(axum::body::Body::empty());
        assert_eq!(client_ip(&request), "unknown");
    }
}
