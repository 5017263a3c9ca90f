// src/api/rest.rs
use std::net::SocketAddr;

use actix_cors::Cors;
use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use tracing::info;

use crate::api::handlers::{configure, GatewayState};
use crate::utils::error::{AgentError, Result};

pub struct RestApi {
    host: String,
    port: u16,
}

impl RestApi {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Binds the gateway. The returned server must be spawned or awaited to
    /// start serving.
    pub fn bind(&self, state: web::Data<GatewayState>) -> Result<(Server, Vec<SocketAddr>)> {
        let server = HttpServer::new(move || {
            App::new()
                .wrap(Cors::permissive())
                .configure(configure(state.clone()))
        })
        .bind((self.host.as_str(), self.port))
        .map_err(|e| {
            AgentError::Config(format!(
                "Failed to bind API server on {}:{}: {}",
                self.host, self.port, e
            ))
        })?;

        let addrs = server.addrs();
        info!(?addrs, "gateway listening");
        Ok((server.disable_signals().run(), addrs))
    }
}
