// src/api/auth.rs
use actix_web::http::header::{ORIGIN, REFERER};
use actix_web::HttpRequest;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::network::transport::TOKEN_HEADER;
use crate::utils::error::{AgentError, Result};

/// Gateway admission: the shared secret, or an allow-listed browser origin.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    token: String,
    allowed_hosts: Vec<String>,
}

impl AccessPolicy {
    /// `allowed_origins` may hold bare host names or full origins
    /// (`https://app.example.com`); only the host part is compared.
    pub fn new(token: impl Into<String>, allowed_origins: &[String]) -> Self {
        let allowed_hosts = allowed_origins
            .iter()
            .filter_map(|origin| {
                if origin.contains("://") {
                    host_of(origin)
                } else {
                    let host = origin.trim().to_ascii_lowercase();
                    (!host.is_empty()).then_some(host)
                }
            })
            .collect();
        Self {
            token: token.into(),
            allowed_hosts,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn has_secret(&self, req: &HttpRequest) -> bool {
        let Some(provided) = req.headers().get(TOKEN_HEADER) else {
            return false;
        };
        let expected = self.token.as_bytes();
        let provided = provided.as_bytes();
        expected.len() == provided.len() && bool::from(expected.ct_eq(provided))
    }

    pub fn origin_allowed(&self, req: &HttpRequest) -> bool {
        [ORIGIN, REFERER].iter().any(|header| {
            req.headers()
                .get(header)
                .and_then(|value| value.to_str().ok())
                .and_then(host_of)
                .is_some_and(|host| self.allowed_hosts.contains(&host))
        })
    }

    pub fn authorize(&self, req: &HttpRequest) -> Result<()> {
        if self.has_secret(req) || self.origin_allowed(req) {
            return Ok(());
        }
        debug!(path = %req.path(), "rejecting unauthenticated request");
        Err(AgentError::Unauthorized)
    }
}

fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()?
        .host_str()
        .map(str::to_ascii_lowercase)
}
