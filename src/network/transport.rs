// src/network/transport.rs
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::utils::error::{AgentError, Result};

pub const TOKEN_HEADER: &str = "Token";
pub const PLUGIN_ID_HEADER: &str = "PluginId";
/// Identity the supervisor presents to its children.
pub const MASTER_ID: &str = "main";

pub const PING_URI: &str = "ping";
pub const KILL_URI: &str = "kill";

/// Supervisor-to-child control channel.
#[async_trait]
pub trait PluginTransport: Send + Sync {
    /// `POST <endpoint>/<uri>`. Any transport failure or non-2xx reply is
    /// reported as [`AgentError::Unreachable`].
    async fn post(&self, plugin_id: &str, endpoint: &str, uri: &str) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    token: String,
}

impl HttpTransport {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            token: token.into(),
        })
    }
}

#[async_trait]
impl PluginTransport for HttpTransport {
    async fn post(&self, plugin_id: &str, endpoint: &str, uri: &str) -> Result<()> {
        if endpoint.is_empty() {
            return Err(AgentError::NotRunning(plugin_id.to_string()));
        }
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), uri);
        trace!(plugin = %plugin_id, %url, "posting to plugin");

        let response = self
            .client
            .post(&url)
            .header(TOKEN_HEADER, &self.token)
            .header(PLUGIN_ID_HEADER, MASTER_ID)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| AgentError::unreachable(plugin_id, e))?;

        if !response.status().is_success() {
            return Err(AgentError::unreachable(
                plugin_id,
                format!("{} answered {}", uri, response.status()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};

    async fn child(req: HttpRequest) -> HttpResponse {
        let token = req
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if token == Some("secret") && req.path() == "/ping" {
            HttpResponse::Ok().body("ok")
        } else {
            HttpResponse::InternalServerError().finish()
        }
    }

    #[actix_web::test]
    async fn ping_succeeds_with_token_and_fails_on_error_status() {
        let server = HttpServer::new(|| App::new().default_service(web::to(child)))
            .workers(1)
            .bind(("127.0.0.1", 0))
            .unwrap();
        let endpoint = format!("http://{}", server.addrs()[0]);
        actix_web::rt::spawn(server.run());

        let transport = HttpTransport::new("secret", Duration::from_secs(2)).unwrap();
        tokio_test::assert_ok!(transport.post("svc", &endpoint, PING_URI).await);
        assert!(matches!(
            transport.post("svc", &endpoint, KILL_URI).await,
            Err(AgentError::Unreachable { .. })
        ));
    }

    #[actix_web::test]
    async fn empty_endpoint_is_not_running() {
        let transport = HttpTransport::new("secret", Duration::from_secs(1)).unwrap();
        assert!(matches!(
            transport.post("svc", "", PING_URI).await,
            Err(AgentError::NotRunning(_))
        ));
    }

    #[actix_web::test]
    async fn refused_connection_is_unreachable() {
        let transport = HttpTransport::new("secret", Duration::from_secs(1)).unwrap();
        assert!(matches!(
            transport.post("svc", "http://127.0.0.1:1", PING_URI).await,
            Err(AgentError::Unreachable { .. })
        ));
    }
}
