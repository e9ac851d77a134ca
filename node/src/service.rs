//! The service abstraction.
//!
//! Services are constructed by factories registered before the node
//! starts. Each declares the RPC modules it exposes; the node wires them
//! into the shared server. Services see only the [`ServiceContext`], not
//! the node itself.

use std::sync::Arc;

use async_trait::async_trait;
use kestrel_event::EventBus;
use kestrel_rpc::ApiModule;

use crate::accounts::Accounts;
use crate::config::NodeConfig;

/// Capabilities handed to services at construction.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<NodeConfig>,
    pub bus: EventBus,
    pub accounts: Arc<Accounts>,
}

/// A node-managed component.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable name, used for logs and duplicate detection.
    fn name(&self) -> &'static str;

    /// RPC modules this service exposes. Called once per node start.
    fn apis(&self) -> Vec<ApiModule>;

    /// Brings the service up.
    async fn start(&self) -> anyhow::Result<()>;

    /// Tears the service down.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Factory producing one service instance per node start.
pub type ServiceFactory =
    Arc<dyn Fn(&ServiceContext) -> anyhow::Result<Box<dyn Service>> + Send + Sync>;
