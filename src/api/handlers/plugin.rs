// src/api/handlers/plugin.rs
use actix_web::{web, HttpRequest, HttpResponse};
use tracing::{info, warn};

use crate::api::handlers::GatewayState;
use crate::api::types::{ApiResult, PluginQuery};
use crate::plugins::types::{PluginInfo, PluginStatus};
use crate::utils::error::{AgentError, Result};

type Query = web::Query<PluginQuery>;
/// Console clients may post the same parameters as a form body.
type Form = Option<web::Form<PluginQuery>>;
type State = web::Data<GatewayState>;

fn params(query: Query, form: Form) -> PluginQuery {
    query.into_inner().with_form(form.map(web::Form::into_inner))
}

pub async fn list(req: HttpRequest, state: State) -> Result<HttpResponse> {
    state.access.authorize(&req)?;
    let plugins: Vec<PluginInfo> = state
        .supervisor
        .registry()
        .list()
        .iter()
        .map(|record| record.snapshot())
        .collect();
    Ok(HttpResponse::Ok().json(ApiResult::success(plugins)))
}

pub async fn info(req: HttpRequest, query: Query, form: Form, state: State) -> Result<HttpResponse> {
    state.access.authorize(&req)?;
    let query = params(query, form);
    let plugin_id = query.require_id()?;
    let record = state
        .supervisor
        .registry()
        .get(plugin_id)
        .ok_or_else(|| AgentError::NotFound(plugin_id.to_string()))?;
    Ok(HttpResponse::Ok().json(ApiResult::success(record.snapshot())))
}

pub async fn start(req: HttpRequest, query: Query, form: Form, state: State) -> Result<HttpResponse> {
    state.access.authorize(&req)?;
    let query = params(query, form);
    let plugin_id = query.require_id()?;
    info!(plugin = %plugin_id, "start requested");
    state.supervisor.start_plugin(plugin_id).await?;
    confirmed(&state, plugin_id, PluginStatus::Running, "start").await
}

pub async fn restart(req: HttpRequest, query: Query, form: Form, state: State) -> Result<HttpResponse> {
    state.access.authorize(&req)?;
    let query = params(query, form);
    let plugin_id = query.require_id()?;
    info!(plugin = %plugin_id, "restart requested");
    state.supervisor.restart_plugin(plugin_id).await?;
    confirmed(&state, plugin_id, PluginStatus::Running, "restart").await
}

pub async fn stop(req: HttpRequest, query: Query, form: Form, state: State) -> Result<HttpResponse> {
    state.access.authorize(&req)?;
    let query = params(query, form);
    let plugin_id = query.require_id()?;
    info!(plugin = %plugin_id, "stop requested");
    state.supervisor.stop_plugin(plugin_id).await?;
    confirmed(&state, plugin_id, PluginStatus::NotStarted, "stop").await
}

pub async fn uninstall(req: HttpRequest, query: Query, form: Form, state: State) -> Result<HttpResponse> {
    state.access.authorize(&req)?;
    let query = params(query, form);
    let plugin_id = query.require_id()?;
    info!(plugin = %plugin_id, "uninstall requested");
    state.supervisor.uninstall_plugin(plugin_id).await?;
    Ok(HttpResponse::Ok().json(ApiResult::success(())))
}

pub async fn check_update(req: HttpRequest, query: Query, form: Form, state: State) -> Result<HttpResponse> {
    state.access.authorize(&req)?;
    let query = params(query, form);
    let plugin_id = query.require_id()?;
    let app_version = query.app_version.unwrap_or(state.app_version);
    let result = state.supervisor.check_update(plugin_id, app_version).await?;
    Ok(HttpResponse::Ok().json(ApiResult::success(result)))
}

/// Polls the record until it reaches `wanted`, answering with its snapshot.
async fn confirmed(
    state: &GatewayState,
    plugin_id: &str,
    wanted: PluginStatus,
    action: &str,
) -> Result<HttpResponse> {
    for attempt in 0..state.confirm_attempts {
        if let Some(record) = state.supervisor.registry().get(plugin_id) {
            if record.status() == wanted {
                return Ok(HttpResponse::Ok().json(ApiResult::success(record.snapshot())));
            }
        }
        if attempt + 1 < state.confirm_attempts {
            tokio::time::sleep(state.confirm_interval).await;
        }
    }
    warn!(plugin = %plugin_id, ?wanted, "{} not confirmed in time", action);
    Err(AgentError::Timeout(format!("{} plugin {} timeout", action, plugin_id)))
}
