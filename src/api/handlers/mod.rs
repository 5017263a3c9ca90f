pub mod gateway;
pub mod master;
pub mod plugin;

use std::sync::Arc;
use std::time::Duration;

use actix_web::{guard, web, FromRequest, Handler, HttpResponse, Resource, Responder};

use crate::api::auth::AccessPolicy;
use crate::api::types::MasterInfo;
use crate::network::proxy::Forwarder;
use crate::plugins::supervisor::PluginSupervisor;

/// Shared state behind every gateway route.
pub struct GatewayState {
    pub supervisor: Arc<PluginSupervisor>,
    pub access: AccessPolicy,
    pub forwarder: Forwarder,
    pub info: MasterInfo,
    /// Status polls after start/restart/stop before reporting a timeout.
    pub confirm_attempts: u32,
    pub confirm_interval: Duration,
    /// Default `appVersion` for update checks that omit it.
    pub app_version: i64,
    pub max_body_bytes: usize,
}

/// Registers the gateway routes. Anything else is reverse-proxied by
/// [`gateway::dispatch`], so `ping`, `info` and `plugin` are reserved ids.
pub fn configure(state: web::Data<GatewayState>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        let max_body = state.max_body_bytes;
        cfg.app_data(state)
            .app_data(web::PayloadConfig::new(max_body))
            .service(resource("/ping", master::ping))
            .service(resource("/info", master::info))
            .service(resource("/plugin/register", gateway::register))
            .service(resource("/plugin/list", plugin::list))
            .service(resource("/plugin/info", plugin::info))
            .service(resource("/plugin/start", plugin::start))
            .service(resource("/plugin/restart", plugin::restart))
            .service(resource("/plugin/stop", plugin::stop))
            .service(resource("/plugin/uninstall", plugin::uninstall))
            .service(resource("/plugin/check-update", plugin::check_update))
            .default_service(web::to(gateway::dispatch));
    }
}

/// A route answering any method, with `OPTIONS` short-circuited.
fn resource<F, Args>(path: &str, handler: F) -> Resource
where
    F: Handler<Args>,
    Args: FromRequest + 'static,
    F::Output: Responder + 'static,
{
    web::resource(path)
        .route(web::route().guard(guard::Options()).to(preflight))
        .route(web::route().to(handler))
}

pub async fn preflight() -> HttpResponse {
    HttpResponse::Ok().finish()
}
