//! Server runner.

use std::future::Future;
use std::sync::Arc;

use tonic::transport::server::Router;

use crate::config::GatewayConfig;
use crate::proto::{
    file_system_service_server::FileSystemServiceServer,
    scheduler_service_server::SchedulerServiceServer,
};
use crate::registry::CloseReport;
use crate::service::{FileSystemGateway, GatewayState, SchedulerGateway};

/// Server configuration and runner.
#[derive(Debug)]
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<GatewayState>,
}

impl GatewayServer {
    /// Create a server with empty registries.
    pub fn new(config: GatewayConfig) -> Self {
        let state = Arc::new(GatewayState::new(config.clone()));
        Self { config, state }
    }

    /// State shared by the services of this server.
    pub fn state(&self) -> Arc<GatewayState> {
        Arc::clone(&self.state)
    }

    /// Both services over the server's state, ready to serve.
    pub fn router(&self) -> Router {
        tonic::transport::Server::builder()
            .add_service(FileSystemServiceServer::new(FileSystemGateway::new(
                self.state(),
            )))
            .add_service(SchedulerServiceServer::new(SchedulerGateway::new(
                self.state(),
            )))
    }

    /// Run the server until a shutdown signal arrives.
    pub async fn run(self) -> Result<(), tonic::transport::Error> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the server until `shutdown` completes, then close every session
    /// still registered.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), tonic::transport::Error> {
        tracing::info!("Starting gRPC server on {}", self.config.addr);

        self.router()
            .serve_with_shutdown(self.config.addr, shutdown)
            .await?;

        tracing::info!("gRPC server shut down, closing sessions");
        let state = self.state();
        match tokio::task::spawn_blocking(move || state.close_all()).await {
            Ok((schedulers, file_systems)) => {
                log_report("scheduler", &schedulers);
                log_report("file system", &file_systems);
            }
            Err(e) => tracing::error!("Closing sessions panicked: {}", e),
        }
        Ok(())
    }
}

fn log_report(kind: &str, report: &CloseReport) {
    tracing::info!(closed = report.closed, failed = report.failures.len(), "closed {kind} sessions");
    for (id, err) in &report.failures {
        tracing::warn!(id = %id, "failed to close {kind}: {}", err);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use skiff::{Credential, Session, adaptor};

    use crate::registry::SessionRequest;

    #[test]
    fn test_shutdown_closes_open_sessions() {
        let config = GatewayConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GatewayServer::new(config);
        let state = server.state();

        let request = SessionRequest {
            adaptor: "file".to_string(),
            location: String::new(),
            credential: Credential::default(),
            properties: BTreeMap::new(),
        };
        let fs = adaptor::create_file_system("file", "", &Credential::default(), &BTreeMap::new())
            .unwrap();
        state.file_systems.put(request, Arc::clone(&fs)).unwrap();
        assert_eq!(state.file_systems.len(), 1);

        tokio_test::block_on(server.run_until(async {})).unwrap();

        assert!(state.file_systems.is_empty());
        assert!(!fs.is_open());
    }
}
