// src/network/proxy.rs
use std::time::Duration;

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use actix_web::{HttpRequest, HttpResponse};
use futures::StreamExt;
use tracing::{debug, trace};

use crate::network::transport::TOKEN_HEADER;
use crate::plugins::registry::ConnectionGuard;
use crate::utils::error::{AgentError, Result};

pub const PROXY_URL_HEADER: &str = "Proxy-Url";

/// Headers scoped to a single hop, never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Relays gateway requests to plugin endpoints.
pub struct Forwarder {
    client: reqwest::Client,
    token: String,
}

impl Forwarder {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AgentError::Config(format!("proxy client: {}", e)))?;
        Ok(Self {
            client,
            token: token.into(),
        })
    }

    /// Sends `req` to `target` and streams the plugin's answer back. `guard`
    /// stays alive until the response body is fully sent or dropped.
    pub async fn forward(
        &self,
        plugin_id: &str,
        req: &HttpRequest,
        body: Bytes,
        target: &str,
        guard: ConnectionGuard,
    ) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
            .map_err(|e| AgentError::unreachable(plugin_id, e))?;
        let conn = req.connection_info().clone();
        let proxy_url = format!("{}://{}{}", conn.scheme(), conn.host(), req.uri());
        trace!(plugin = %plugin_id, %method, %target, "forwarding request");

        let mut outbound = self.client.request(method, target);
        for (name, value) in req.headers() {
            if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case(TOKEN_HEADER) {
                continue;
            }
            outbound = outbound.header(name.as_str(), value.as_bytes());
        }
        if let Some(peer) = conn.realip_remote_addr() {
            outbound = outbound.header("X-Forwarded-For", peer);
        }
        outbound = outbound
            .header("X-Forwarded-Host", conn.host())
            .header("X-Forwarded-Proto", conn.scheme())
            .header(TOKEN_HEADER, self.token.as_str())
            .header(PROXY_URL_HEADER, proxy_url);

        let upstream = outbound
            .body(body)
            .send()
            .await
            .map_err(|e| AgentError::unreachable(plugin_id, e))?;

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .map_err(|e| AgentError::unreachable(plugin_id, e))?;
        let mut response = HttpResponse::build(status);
        for (name, value) in upstream.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response.append_header((name, value));
            }
        }

        let id = plugin_id.to_string();
        let stream = upstream.bytes_stream().map(move |chunk| {
            let _held = &guard;
            chunk.map_err(|e| {
                debug!(plugin = %id, error = %e, "plugin response aborted");
                std::io::Error::new(std::io::ErrorKind::Other, e)
            })
        });
        Ok(response.streaming(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_recognised() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-request-id"));
    }
}
