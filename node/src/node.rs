//! The node container: lifecycle, service graph and transport bring-up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kestrel_event::EventBus;
use kestrel_rpc::transport::{http, ipc, stream, ws, ListenerHandle};
use kestrel_rpc::{Client, Server, ServerConfig};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::accounts::Accounts;
use crate::apis;
use crate::config::NodeConfig;
use crate::service::{Service, ServiceContext, ServiceFactory};
use crate::{NodeError, Result};

struct Running {
    services: Vec<Box<dyn Service>>,
    server: Arc<Server>,
    listeners: Vec<ListenerHandle>,
    stop_tx: watch::Sender<bool>,
}

/// A container on which services can be registered.
///
/// Lifecycle transitions are guarded by one mutex; [`Node::wait`] only
/// snapshots the stop channel under a read lock.
pub struct Node {
    config: Arc<NodeConfig>,
    accounts: Arc<Accounts>,
    bus: EventBus,
    factories: Mutex<Vec<ServiceFactory>>,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
    stop_watch: RwLock<Option<watch::Receiver<bool>>>,
}

impl Node {
    /// Builds a node from a frozen configuration.
    pub fn new(config: NodeConfig) -> Self {
        let accounts = Accounts::new();
        if config.dev_accounts > 0 {
            accounts.generate(config.dev_accounts);
        }
        Self {
            config: Arc::new(config),
            accounts: Arc::new(accounts),
            bus: EventBus::new(),
            factories: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(None),
            stop_watch: RwLock::new(None),
        }
    }

    /// The frozen configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The node-wide event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Opaque accounts manager handle.
    pub fn accounts(&self) -> Arc<Accounts> {
        self.accounts.clone()
    }

    /// True between a successful start and the next stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Registers a service factory. Refused once the node has started.
    pub fn register(&self, factory: ServiceFactory) -> Result<()> {
        if self.is_running() {
            return Err(NodeError::AlreadyRunning);
        }
        self.factories.lock().push(factory);
        Ok(())
    }

    /// Starts services in registration order, then transports in the
    /// fixed order in-process, IPC, HTTP, WebSocket, stream. Any failure
    /// unwinds everything already started and is returned.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.lifecycle.lock().await;
        self.start_locked(&mut guard).await
    }

    /// Stops transports in reverse bring-up order, then services in
    /// reverse construction order, then releases every waiter.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.lifecycle.lock().await;
        self.stop_locked(&mut guard).await
    }

    /// Stop followed by start under a single lifecycle lock.
    pub async fn restart(&self) -> Result<()> {
        let mut guard = self.lifecycle.lock().await;
        self.stop_locked(&mut guard).await?;
        self.start_locked(&mut guard).await
    }

    /// Blocks until the node stops; returns immediately when it is not
    /// running.
    pub async fn wait(&self) {
        let receiver = self.stop_watch.read().clone();
        let Some(mut receiver) = receiver else { return };
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// An RPC client wired straight into the in-process server.
    pub async fn attach(&self) -> Result<Client> {
        let guard = self.lifecycle.lock().await;
        match guard.as_ref() {
            Some(running) => Ok(kestrel_rpc::transport::inproc::connect(&running.server)),
            None => Err(NodeError::NotRunning),
        }
    }

    /// URLs of the listeners brought up by the last start.
    pub async fn listener_urls(&self) -> Vec<String> {
        let guard = self.lifecycle.lock().await;
        guard
            .as_ref()
            .map(|running| running.listeners.iter().map(|l| l.url().to_string()).collect())
            .unwrap_or_default()
    }

    async fn start_locked(&self, guard: &mut Option<Running>) -> Result<()> {
        if guard.is_some() {
            return Err(NodeError::AlreadyRunning);
        }
        info!(target: "kestrel::node", name = %self.config.name, "starting node");

        let ctx = ServiceContext {
            config: self.config.clone(),
            bus: self.bus.clone(),
            accounts: self.accounts.clone(),
        };

        // Construct every service; duplicates by name are a config fault.
        let factories: Vec<ServiceFactory> = self.factories.lock().clone();
        let mut services: Vec<Box<dyn Service>> = Vec::with_capacity(factories.len());
        for factory in &factories {
            let service = factory(&ctx).map_err(|source| NodeError::ServiceBuild {
                name: format!("service #{}", services.len()),
                source,
            })?;
            if services.iter().any(|s| s.name() == service.name()) {
                return Err(NodeError::DuplicateService(service.name().to_string()));
            }
            services.push(service);
        }

        // Start them in order, unwinding on the first failure.
        let mut started = 0usize;
        for service in &services {
            if let Err(source) = service.start().await {
                let name = service.name().to_string();
                Self::stop_services(&services[..started]).await;
                return Err(NodeError::ServiceStart { name, source });
            }
            debug!(target: "kestrel::node", service = service.name(), "service started");
            started += 1;
        }

        // One method table for every transport.
        let server = Server::new(ServerConfig {
            max_subscriptions_per_conn: self.config.max_subscriptions_per_conn,
            max_concurrent_requests: self.config.max_concurrent_requests,
        });
        let mut registration = services
            .iter()
            .flat_map(|service| service.apis())
            .collect::<Vec<_>>();
        registration.push(apis::admin::admin_module(
            self.config.clone(),
            Arc::downgrade(&server),
        ));
        for module in registration {
            if let Err(e) = server.register_name(module) {
                Self::stop_services(&services).await;
                return Err(e.into());
            }
        }
        debug!(target: "kestrel::node", "in-process endpoint ready");

        // Transports, in bring-up order. Failure of listener k closes
        // 0..k-1 and unwinds the services.
        let mut listeners: Vec<ListenerHandle> = Vec::new();
        let unwind = |listeners: &mut Vec<ListenerHandle>| {
            for listener in listeners.drain(..).rev() {
                listener.close();
            }
        };

        if let Some(path) = self.config.ipc_endpoint() {
            match ipc::start_ipc(server.clone(), &path).await {
                Ok(handle) => listeners.push(handle),
                Err(e) => {
                    unwind(&mut listeners);
                    Self::stop_services(&services).await;
                    return Err(e.into());
                }
            }
        }
        if let Some(http_config) = self.config.http_config() {
            match http::start_http(server.clone(), http_config).await {
                Ok(handle) => listeners.push(handle),
                Err(e) => {
                    unwind(&mut listeners);
                    Self::stop_services(&services).await;
                    return Err(e.into());
                }
            }
        }
        if let Some(ws_config) = self.config.ws_config() {
            match ws::start_ws(server.clone(), ws_config).await {
                Ok(handle) => listeners.push(handle),
                Err(e) => {
                    unwind(&mut listeners);
                    Self::stop_services(&services).await;
                    return Err(e.into());
                }
            }
        }
        if let Some(stream_config) = self.config.stream_config() {
            match stream::start_stream(server.clone(), stream_config).await {
                Ok(handle) => listeners.push(handle),
                Err(e) => {
                    unwind(&mut listeners);
                    Self::stop_services(&services).await;
                    return Err(e.into());
                }
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_watch.write() = Some(stop_rx);
        *guard = Some(Running { services, server, listeners, stop_tx });
        self.running.store(true, Ordering::SeqCst);
        info!(target: "kestrel::node", "node started");
        Ok(())
    }

    async fn stop_locked(&self, guard: &mut Option<Running>) -> Result<()> {
        let Some(running) = guard.take() else {
            return Err(NodeError::NotRunning);
        };

        for listener in running.listeners.into_iter().rev() {
            listener.close();
        }
        running.server.stop();
        Self::stop_services(&running.services).await;

        let _ = running.stop_tx.send(true);
        *self.stop_watch.write() = None;
        self.running.store(false, Ordering::SeqCst);
        info!(target: "kestrel::node", "node stopped");
        Ok(())
    }

    async fn stop_services(services: &[Box<dyn Service>]) {
        for service in services.iter().rev() {
            if let Err(e) = service.stop().await {
                warn!(target: "kestrel::node", service = service.name(), error = %e, "service stop failed");
            } else {
                debug!(target: "kestrel::node", service = service.name(), "service stopped");
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.is_running() {
            error!(target: "kestrel::node", "node dropped while running; transports leak until the runtime shuts down");
        }
    }
}
