//! Application state wiring all services together.
//!
//! The chat service is generic over its message store, and the queue over
//! its broker. [`Runtime`] pins them to the concrete infra implementations,
//! starts the background workers, and hands the HTTP layer a cloneable
//! [`AppState`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use palaver_core::chat::ChatService;
use palaver_core::llm::factory::BackendFactory;
use palaver_core::persist::BoxMessagePersister;
use palaver_core::queue::broker::Broker;
use palaver_core::queue::{
    BrokerHealth, ConnectionManager, ConsumerSettings, PUBLISH_BUFFER, QueuePersister,
    QueueProducer, spawn_consumer_pool,
};
use palaver_core::session::registry::{RegistryLimits, SessionRegistry};
use palaver_infra::broker::{SelectedBroker, broker_from_url};
use palaver_infra::llm::register_builtin_backends;
use palaver_infra::sqlite::{DatabasePool, SqliteMessageStore};
use palaver_types::config::GlobalConfig;

/// Concrete type alias for the service generic pinned to the infra store.
pub type ConcreteChatService = ChatService<SqliteMessageStore>;

/// Shared application state used by the REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ConcreteChatService>,
    pub broker: Arc<dyn BrokerHealth>,
    /// Cancelled on shutdown. Chat turns run under child tokens of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.chat_service.registry()
    }
}

/// Running application: HTTP state plus the background workers it owns.
pub struct Runtime {
    pub state: AppState,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Open storage, connect to the broker, start the consumer pool and the
    /// session sweeper, and rehydrate sessions from storage.
    ///
    /// A broker that cannot be reached here is fatal.
    pub async fn start(config: &GlobalConfig) -> anyhow::Result<Self> {
        let pool = DatabasePool::new(&config.database.url)
            .await
            .with_context(|| format!("failed to open database {}", config.database.url))?;
        let store = SqliteMessageStore::new(pool);

        let factory = BackendFactory::new();
        register_builtin_backends(&factory);

        let selected = broker_from_url(&config.broker.url)?;
        info!(broker = selected.kind(), queue = %config.broker.queue, "using broker");
        match selected {
            SelectedBroker::Amqp(broker) => Self::start_with(broker, store, factory, config).await,
            SelectedBroker::Memory(broker) => Self::start_with(broker, store, factory, config).await,
        }
    }

    /// Wire the runtime over an explicit broker, store and backend factory.
    pub async fn start_with<B: Broker>(
        broker: B,
        store: SqliteMessageStore,
        factory: BackendFactory,
        config: &GlobalConfig,
    ) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let store = Arc::new(store);

        let manager = Arc::new(ConnectionManager::new(broker));
        manager
            .connection()
            .await
            .context("broker unavailable at startup")?;

        let producer = QueueProducer::new(
            manager.clone(),
            config.broker.queue.clone(),
            &config.broker.reconnect,
        );
        let (persister, publisher) = QueuePersister::spawn(producer, PUBLISH_BUFFER, cancel.clone());
        let persister = Arc::new(BoxMessagePersister::new(persister));

        let mut tasks = Vec::new();
        tasks.push(spawn_queue_workers(
            manager.clone(),
            publisher,
            store.clone(),
            config,
            cancel.clone(),
        ));

        let registry = Arc::new(SessionRegistry::new(
            Arc::new(factory),
            persister,
            RegistryLimits::from(&config.registry),
        ));
        if config.registry.idle_ttl_secs > 0 {
            let interval = Duration::from_secs(config.registry.sweep_interval_secs.max(1));
            tasks.push(registry.clone().spawn_sweeper(interval, cancel.clone()));
        }

        let chat_service = Arc::new(ChatService::new(
            registry,
            store,
            config.backends.clone(),
            config.chat.default_model_type.clone(),
        ));
        match chat_service.restore_sessions().await {
            Ok(restored) => info!(restored, "sessions restored from storage"),
            Err(e) => warn!(error = %e, "session restore failed, starting empty"),
        }

        Ok(Self {
            state: AppState {
                chat_service,
                broker: manager,
                shutdown: cancel.clone(),
            },
            cancel,
            tasks,
        })
    }

    /// Token cancelled on shutdown.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the background workers and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("background workers stopped");
    }
}

/// Run the consumer pool; once the publisher has flushed and every consumer
/// has stopped, close the broker connection so unacknowledged deliveries
/// return to the queue.
fn spawn_queue_workers<B: Broker>(
    manager: Arc<ConnectionManager<B>>,
    publisher: JoinHandle<()>,
    store: Arc<SqliteMessageStore>,
    config: &GlobalConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let settings = ConsumerSettings::from_config(&config.broker);
    let count = config.broker.consumers;
    tokio::spawn(async move {
        let consumers = spawn_consumer_pool(count, manager.clone(), store, settings, cancel);
        if let Err(e) = publisher.await {
            warn!(error = %e, "queue publisher ended abnormally");
        }
        for consumer in consumers {
            if let Err(e) = consumer.await {
                warn!(error = %e, "queue consumer ended abnormally");
            }
        }
        if let Err(e) = manager.close().await {
            warn!(error = %e, "broker connection close failed");
        }
    })
}
