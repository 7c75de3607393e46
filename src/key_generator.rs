//! Subject keys for rate limiting and client address extraction.

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

use crate::rate_limiter::Dimension;
use crate::request::TranslationRequest;

/// A subject as seen by one limiter dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    pub dimension: Dimension,
    pub key: String,
}

pub struct KeyGenerator;

impl KeyGenerator {
    pub fn user_key(user_id: &str) -> String {
        format!("user:{}", Self::sanitize_key(user_id))
    }

    pub fn ip_key(ip: IpAddr) -> String {
        format!("ip:{}", ip)
    }

    pub fn global_key() -> String {
        "global".to_string()
    }

    /// Subjects a request is charged against, in evaluation order. The IP
    /// dimension is left out when the transport gave no address.
    pub fn subjects_for(user_id: &str, ip: Option<IpAddr>) -> Vec<Subject> {
        let mut subjects = Vec::with_capacity(3);
        subjects.push(Subject {
            dimension: Dimension::User,
            key: Self::user_key(user_id),
        });
        if let Some(ip) = ip {
            subjects.push(Subject {
                dimension: Dimension::Ip,
                key: Self::ip_key(ip),
            });
        }
        subjects.push(Subject {
            dimension: Dimension::Global,
            key: Self::global_key(),
        });
        subjects
    }

    pub fn subjects(request: &TranslationRequest) -> Vec<Subject> {
        Self::subjects_for(request.submitted_by(), request.source_ip())
    }

    /// Extract the client IP from forwarding headers
    pub fn extract_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        header("x-forwarded-for")
            .and_then(|xff| xff.split(',').next())
            .or_else(|| header("x-real-ip"))
            .or_else(|| header("cf-connecting-ip"))
            .and_then(|raw| raw.trim().parse().ok())
    }

    /// Forwarding headers first, then the peer address of the connection.
    pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
        Self::extract_client_ip(headers).or(peer.map(|addr| addr.ip()))
    }

    /// Keep keys to a safe alphabet for Redis and log output
    pub fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_alphanumeric() || c == ':' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}
