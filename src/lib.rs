pub mod api;
pub mod config;
pub mod database;
pub mod hub;
pub mod indexer;
pub mod mev;
pub mod numeric;
pub mod rpc;
pub mod source;

use anyhow::{Context, Result};
use config::AppConfig;
use database::DatabaseService;
use hub::Hub;
use indexer::IndexerService;
use mev::MevDetector;
use source::BlockSource;
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Represents the core application with all its services
pub struct App {
    pub config: AppConfig,
    pub db: Arc<DatabaseService>,
    pub source: Arc<dyn BlockSource>,
    pub hub: Hub,
    pub indexer: Arc<IndexerService>,
    pub mev: Arc<MevDetector>,
    pub shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Initialize a new application instance
    pub async fn init(config: AppConfig) -> Result<Self> {
        info!("Config loaded: {}", config);

        // Initialize database
        let db = Arc::new(DatabaseService::new(&config.database_url).await?);
        info!("Database initialized");

        // Initialize block source
        let data_source = config.data_source();
        let source = data_source
            .connect()
            .with_context(|| format!("Failed to set up {}", data_source.describe()))?;
        info!("Block source ready: {}", data_source.describe());

        Self::with_source(config, db, source)
    }

    /// Assemble the services around an existing store and source
    pub fn with_source(
        config: AppConfig,
        db: Arc<DatabaseService>,
        source: Arc<dyn BlockSource>,
    ) -> Result<Self> {
        let (hub, hub_task) = Hub::start(config.subscriber_queue_capacity);

        let indexer = Arc::new(IndexerService::new(
            db.clone(),
            source.clone(),
            hub.clone(),
            config.clone(),
        ));
        info!("Indexer service initialized");

        let mev = Arc::new(MevDetector::new(db.clone()));

        Ok(Self {
            config,
            db,
            source,
            hub,
            indexer,
            mev,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(vec![hub_task]),
        })
    }

    /// Start all application services
    pub async fn start(&self) -> Result<()> {
        let indexer = self.indexer.clone();
        let shutdown = self.shutdown.child_token();
        let handle = tokio::spawn(async move {
            indexer.start_service(shutdown).await;
        });
        self.tasks.lock().await.push(handle);

        info!("Application started successfully");
        Ok(())
    }

    /// Stop ingestion after the block in flight, close every subscriber and
    /// wait for background tasks to finish
    pub async fn stop(&self) {
        info!("Shutting down");
        self.shutdown.cancel();
        self.hub.shutdown();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task failed during shutdown: {}", e);
            }
        }
        info!("Shutdown complete");
    }
}
