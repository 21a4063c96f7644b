//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: catalog → transport → stream service → listeners
//! - Shutdown order: listeners → stream service (access log)

use crate::adapters::stream::{Registries, StreamService};
use crate::bus::local::{AckingNode, LocalBus};
use crate::bus::NodeId;
use crate::control::groups::{GroupEvent, GroupRepository};
use crate::control::placement::NodeTable;
use crate::control::routing::EntityResolver;
use crate::control::schema::{EntityRepository, SchemaEvent};
use crate::core::config::Config;
use crate::ops::accesslog::{FileAccessLog, STREAM_INGEST_PREFIX};
use crate::ops::observability::LiaisonMetrics;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
#[cfg(feature = "grpc")]
use tokio::task::JoinHandle;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Schema, group and node registries.
    pub catalog: ComponentHealth,
    /// Stream service.
    pub service: ComponentHealth,
    /// Listener health.
    pub listeners: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            catalog: ComponentHealth::Starting,
            service: ComponentHealth::Starting,
            listeners: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.catalog == ComponentHealth::Healthy
            && self.service == ComponentHealth::Healthy
            && self.listeners == ComponentHealth::Healthy
    }
}

/// Registries and transport built from the configured catalog.
pub struct Catalog {
    pub schemas: Arc<EntityRepository>,
    pub groups: Arc<GroupRepository>,
    pub nodes: Arc<NodeTable>,
    pub bus: LocalBus,
    embedded: BTreeMap<NodeId, Arc<AckingNode>>,
}

impl Catalog {
    /// Load the catalog section into fresh registries, registering an
    /// acknowledging handler on the bus for every configured node.
    pub fn load(config: &Config) -> Result<Self> {
        let schemas = Arc::new(EntityRepository::new());
        let groups = Arc::new(GroupRepository::new());
        let nodes = Arc::new(NodeTable::new());
        let bus = LocalBus::new(config.write.batch_size);
        let mut embedded = BTreeMap::new();

        for group in &config.catalog.groups {
            groups.apply(GroupEvent::Upsert(group.clone()));
        }
        for stream in &config.catalog.streams {
            schemas
                .apply(SchemaEvent::Upsert(stream.clone()))
                .with_context(|| format!("failed to load stream {}", stream.id()))?;
        }
        for node in &config.catalog.nodes {
            let handler = Arc::new(AckingNode::new());
            bus.register(node.id.clone(), node.labels.clone(), handler.clone());
            embedded.insert(node.id.clone(), handler);
            nodes.register(node.clone());
        }

        tracing::info!(
            groups = config.catalog.groups.len(),
            streams = schemas.len(),
            nodes = config.catalog.nodes.len(),
            "catalog loaded"
        );

        Ok(Self {
            schemas,
            groups,
            nodes,
            bus,
            embedded,
        })
    }

    /// Handler serving `node` in embedded mode.
    pub fn embedded_node(&self, node: &str) -> Option<&Arc<AckingNode>> {
        self.embedded.get(node)
    }

    fn log_activity(&self) {
        for node in self.bus.node_ids() {
            if let Some(handler) = self.embedded.get(&node) {
                tracing::info!(
                    node = %node,
                    writes = handler.writes(),
                    queries = handler.queries(),
                    "embedded node activity"
                );
            }
        }
    }

    pub fn registries(&self) -> Registries {
        let resolver = EntityResolver::new(self.schemas.clone(), self.groups.clone());
        Registries {
            schemas: self.schemas.clone(),
            groups: self.groups.clone(),
            nodes: self.nodes.clone(),
            resolver: Arc::new(resolver),
        }
    }
}

/// Build the stream service described by `config` on top of `catalog`.
pub fn build_service(config: &Config, catalog: &Catalog) -> Result<StreamService> {
    let bus = Arc::new(catalog.bus.clone());
    let mut service = StreamService::new(catalog.registries(), bus.clone(), bus)
        .with_metrics(Arc::new(LiaisonMetrics::new()))
        .with_write_timeout(config.write.timeout())
        .with_query_timeout(config.query.timeout())
        .with_log_sample_every(config.telemetry.log_sample_every);

    if config.access_log.enabled {
        let log = FileAccessLog::open(
            &config.access_log.root,
            STREAM_INGEST_PREFIX,
            config.access_log.rotation(),
            config.access_log.buffer,
        )
        .context("failed to open the ingestion access log")?;
        service = service.with_access_log(Arc::new(log));
    }
    Ok(service)
}

/// Liaison runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Registries and transport, once started.
    catalog: Option<Catalog>,

    /// Stream service, once started.
    service: Option<Arc<StreamService>>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// gRPC server task handle.
    #[cfg(feature = "grpc")]
    grpc_handle: Option<JoinHandle<crate::core::error::LiaisonResult<()>>>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            catalog: None,
            service: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            #[cfg(feature = "grpc")]
            grpc_handle: None,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the stream service (if started).
    pub fn service(&self) -> Option<&Arc<StreamService>> {
        self.service.as_ref()
    }

    /// Get the loaded catalog (if started).
    pub fn catalog(&self) -> Option<&Catalog> {
        self.catalog.as_ref()
    }

    /// Current metrics of the stream service in Prometheus text format.
    pub fn metrics_text(&self) -> Option<String> {
        self.service.as_ref().map(|service| service.metrics().export())
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Build the service and start listeners.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(bind = %self.config.listeners.grpc.bind, "starting liaison runtime");

        self.init_service()?;
        self.start_listeners().await?;

        self.running.store(true, Ordering::Release);
        tracing::info!("liaison runtime started");
        Ok(())
    }

    fn init_service(&mut self) -> Result<()> {
        let catalog = Catalog::load(&self.config)?;
        self.health.catalog = ComponentHealth::Healthy;

        let service = build_service(&self.config, &catalog)?;
        self.catalog = Some(catalog);
        self.service = Some(Arc::new(service));
        self.health.service = ComponentHealth::Healthy;
        Ok(())
    }

    /// Start network listeners.
    async fn start_listeners(&mut self) -> Result<()> {
        tracing::debug!("starting network listeners");

        #[cfg(feature = "grpc")]
        {
            use crate::adapters::stream::grpc::StreamGrpcServer;

            let service = self
                .service
                .clone()
                .context("stream service is not initialized")?;
            let bind_addr: std::net::SocketAddr = self
                .config
                .listeners
                .grpc
                .bind
                .parse()
                .context("invalid gRPC bind address")?;

            let server = StreamGrpcServer::new(bind_addr, service, self.shutdown_rx.clone());
            let handle = tokio::spawn(async move { server.run().await });
            self.grpc_handle = Some(handle);
            tracing::info!(bind = %bind_addr, "gRPC listener started");
        }

        self.health.listeners = ComponentHealth::Healthy;
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        let requested = async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        };

        #[cfg(feature = "grpc")]
        {
            let server = async {
                match self.grpc_handle.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            };
            let server_exited = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("shutdown signal received (SIGINT)");
                    false
                }
                _ = requested => {
                    tracing::info!("shutdown requested by component");
                    false
                }
                result = server => {
                    match result {
                        Ok(Ok(())) => tracing::info!("gRPC server stopped normally"),
                        Ok(Err(e)) => tracing::error!(error = %e, "gRPC server failed"),
                        Err(e) => tracing::error!(error = %e, "gRPC server task panicked"),
                    }
                    true
                }
            };
            if server_exited {
                self.grpc_handle = None;
            }
        }

        #[cfg(not(feature = "grpc"))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("shutdown signal received (SIGINT)");
                }
                _ = requested => {
                    tracing::info!("shutdown requested by component");
                }
            }
        }

        self.stop().await
    }

    /// Stop listeners, then close the service.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping liaison runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        self.stop_listeners().await;

        self.health.service = ComponentHealth::Stopping;
        if let Some(service) = self.service.take() {
            service.close().context("failed to close the stream service")?;
        }
        self.health.service = ComponentHealth::Stopped;

        if let Some(catalog) = &self.catalog {
            catalog.log_activity();
        }
        tracing::info!("liaison runtime stopped");
        Ok(())
    }

    async fn stop_listeners(&mut self) {
        tracing::debug!("stopping network listeners");
        self.health.listeners = ComponentHealth::Stopping;

        #[cfg(feature = "grpc")]
        {
            if let Some(handle) = self.grpc_handle.take() {
                match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                    Ok(Ok(Ok(()))) => tracing::info!("gRPC server stopped"),
                    Ok(Ok(Err(e))) => tracing::warn!(error = %e, "gRPC server stopped with error"),
                    Ok(Err(e)) => tracing::warn!(error = %e, "gRPC server task panicked"),
                    Err(_) => tracing::warn!("gRPC server stop timed out"),
                }
            }
        }

        self.health.listeners = ComponentHealth::Stopped;
    }

    /// Build the service without listeners or signal handling.
    pub fn start_for_tests(&mut self) -> Result<()> {
        self.init_service()?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }
}
