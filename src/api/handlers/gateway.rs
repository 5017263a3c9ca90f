// src/api/handlers/gateway.rs
use actix_web::http::Method;
use actix_web::{web, HttpRequest, HttpResponse};
use tracing::{debug, warn};

use crate::api::handlers::GatewayState;
use crate::api::types::ApiResult;
use crate::plugins::types::{Manifest, PluginStatus};
use crate::utils::error::{AgentError, Result};

/// A child announcing its endpoint. Only the shared secret is accepted.
pub async fn register(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse> {
    if !state.access.has_secret(&req) {
        warn!(peer = ?req.peer_addr(), "registration without shared secret");
        return Err(AgentError::Unauthorized);
    }
    let manifest: Manifest = serde_json::from_slice(&body)?;
    let record = state.supervisor.register(&manifest).await?;
    Ok(HttpResponse::Ok().json(ApiResult::success(record.snapshot())))
}

/// Reverse-proxies `/<pluginId>/<rest>` to the plugin's endpoint.
pub async fn dispatch(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<GatewayState>,
) -> Result<HttpResponse> {
    if req.method() == Method::OPTIONS {
        return Ok(HttpResponse::Ok().finish());
    }
    state.access.authorize(&req)?;

    let Some((plugin_id, rest)) = split_target(req.path()) else {
        return Ok(not_found(""));
    };
    let Some(record) = state.supervisor.registry().get(plugin_id) else {
        return Ok(not_found(plugin_id));
    };
    record.touch();

    let endpoint = record.endpoint();
    if record.status() != PluginStatus::Running || endpoint.is_empty() {
        debug!(plugin = %plugin_id, status = ?record.status(), "plugin not serving");
        return Ok(not_found(plugin_id));
    }

    let guard = record.open_connection();
    let mut target = format!("{}{}", endpoint.trim_end_matches('/'), rest);
    if let Some(query) = req.uri().query() {
        target.push('?');
        target.push_str(query);
    }

    match state
        .forwarder
        .forward(plugin_id, &req, body, &target, guard)
        .await
    {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!(plugin = %plugin_id, error = %e, "proxying failed");
            Ok(HttpResponse::BadGateway().json(ApiResult::error(&e)))
        }
    }
}

fn not_found(plugin_id: &str) -> HttpResponse {
    HttpResponse::NotFound().json(ApiResult::error(&AgentError::NotFound(plugin_id.to_string())))
}

/// Splits `/id/rest` into `("id", "/rest")`; a bare `/id` maps to `/`.
fn split_target(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/')?;
    let (plugin_id, rest) = match trimmed.find('/') {
        Some(i) => trimmed.split_at(i),
        None => (trimmed, "/"),
    };
    (!plugin_id.is_empty()).then_some((plugin_id, rest))
}
