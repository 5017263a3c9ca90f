pub mod api;
pub mod network;
pub mod plugins;
pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::dev::ServerHandle;
use actix_web::web;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    api::{types::MasterInfo, GatewayState, RestApi},
    network::{health::HealthMonitor, proxy::Forwarder, transport::HttpTransport},
    plugins::{
        installer::{remove_stale_downloads, HttpInstaller},
        launcher::TokioLauncher,
        registry::PluginRegistry,
        supervisor::{Collaborators, LaunchContext, PluginSupervisor},
        update::HttpVersionApi,
    },
    utils::{
        config::Config,
        error::{AgentError, Result},
    },
};

pub struct Application {
    config: Arc<Config>,
    supervisor: Arc<PluginSupervisor>,
    health: Arc<HealthMonitor>,
    gateway: web::Data<GatewayState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    server: Mutex<Option<ServerHandle>>,
}

impl Application {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let token = Uuid::new_v4().simple().to_string();

        info!("Initializing plugin supervisor...");
        let http = reqwest::Client::builder()
            .connect_timeout(config.get_connect_timeout())
            .build()
            .map_err(|e| AgentError::Config(format!("http client: {}", e)))?;
        let collaborators = Collaborators {
            launcher: Arc::new(TokioLauncher),
            transport: Arc::new(HttpTransport::new(token.clone(), config.get_probe_timeout())?),
            installer: Arc::new(
                HttpInstaller::new(http.clone())
                    .with_stall_timeout(config.get_download_stall_timeout()),
            ),
            versions: Arc::new(
                HttpVersionApi::new(http, config.plugins.api_endpoint.clone())
                    .with_timeout(config.get_api_timeout()),
            ),
        };
        let launch = LaunchContext {
            token: token.clone(),
            namespace: config.node.namespace.clone(),
            api_endpoint: config.plugins.api_endpoint.clone(),
            master_port: config.node.port,
            debug: config.node.debug,
        };
        let supervisor = Arc::new(PluginSupervisor::new(
            Arc::new(PluginRegistry::new(config.plugins_dir())),
            collaborators,
            launch,
            config.supervisor_settings(),
        ));

        Self::with_supervisor(config, token, supervisor)
    }

    /// Builds the application around an existing supervisor, which must have
    /// been given the same `token` in its launch context.
    pub fn with_supervisor(
        config: Arc<Config>,
        token: String,
        supervisor: Arc<PluginSupervisor>,
    ) -> Result<Self> {
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&supervisor),
            config.health_settings(),
        ));

        info!("Initializing gateway...");
        let gateway = web::Data::new(GatewayState {
            supervisor: Arc::clone(&supervisor),
            access: api::auth::AccessPolicy::new(token.clone(), &config.plugins.allowed_origins),
            forwarder: Forwarder::new(token, config.get_forward_timeout())?,
            info: MasterInfo::current(config.node.namespace.clone()),
            confirm_attempts: config.supervisor.confirm_attempts,
            confirm_interval: config.get_confirm_interval(),
            app_version: config.plugins.app_version,
            max_body_bytes: config.gateway.max_body_bytes,
        });

        Ok(Self {
            config,
            supervisor,
            health,
            gateway,
            tasks: Mutex::new(Vec::new()),
            server: Mutex::new(None),
        })
    }

    pub fn supervisor(&self) -> &Arc<PluginSupervisor> {
        &self.supervisor
    }

    pub fn gateway_state(&self) -> web::Data<GatewayState> {
        self.gateway.clone()
    }

    /// Loads installed plugins, starts the health monitor and binds the
    /// gateway. Must run inside an actix system. Returns the bound addresses.
    pub async fn start(&self) -> Result<Vec<SocketAddr>> {
        info!("Loading plugins...");
        self.supervisor.load_installed().await?;
        let stale = remove_stale_downloads(&std::env::temp_dir()).await;
        if stale > 0 {
            info!(removed = stale, "removed interrupted downloads");
        }

        info!("Starting health monitor...");
        self.tasks.lock().push(Arc::clone(&self.health).start());

        info!("Starting API server...");
        let (server, addrs) =
            RestApi::new(self.config.node.host.clone(), self.config.node.port).bind(self.gateway.clone())?;
        *self.server.lock() = Some(server.handle());
        actix_web::rt::spawn(async move {
            if let Err(e) = server.await {
                error!("API server stopped with error: {}", e);
            }
        });

        info!("Application successfully started");
        Ok(addrs)
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down application...");

        let server = self.server.lock().take();
        if let Some(server) = server {
            server.stop(true).await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        info!("Stopping plugins...");
        self.supervisor.shutdown().await;

        info!("Application shutdown complete");
        Ok(())
    }
}
