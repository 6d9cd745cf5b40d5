//! Engine facade
//!
//! Wires every component around one shared registry and owns the background
//! tasks (lifecycle sweeps and registry snapshots).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::checksum::ContentHash;
use crate::clock::Clock;
use crate::config::TimescapeConfig;
use crate::db_schema::{DbSchemaManager, MigrationRunner};
use crate::diff::SchemaDiffer;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::lifecycle::{LifecycleManager, LifecycleScheduler, SweepHandle};
use crate::metrics::MetricsSink;
use crate::persistence::{SnapshotHandle, SnapshotStore, SnapshotTask};
use crate::registry::VersionRegistry;
use crate::resolver::VersionResolver;
use crate::transform::TransformerEngine;
use crate::version::{Tsv, VersionStatus};

#[derive(Default)]
struct Background {
    sweep: Option<SweepHandle>,
    snapshot: Option<SnapshotHandle>,
}

/// A fully wired Timescape instance
pub struct Timescape {
    config: TimescapeConfig,
    registry: Arc<VersionRegistry>,
    resolver: Arc<VersionResolver>,
    transformers: Arc<TransformerEngine>,
    gateway: Gateway,
    lifecycle: Arc<LifecycleManager>,
    db: Arc<DbSchemaManager>,
    differ: SchemaDiffer,
    store: Option<SnapshotStore>,
    background: Mutex<Background>,
}

impl Timescape {
    /// Build every component, restoring the registry from the configured
    /// snapshot when there is one
    pub async fn init(
        config: TimescapeConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        runner: Arc<dyn MigrationRunner>,
    ) -> Result<Self> {
        let store = config.snapshot_path().map(SnapshotStore::new);
        let registry = match &store {
            Some(store) => {
                let snapshot = store.load()?;
                tracing::info!(
                    "Loaded {} versions from {}",
                    snapshot.version_count(),
                    store.path().display()
                );
                VersionRegistry::restore(snapshot, clock)?
            }
            None => VersionRegistry::new(clock),
        };
        let registry = Arc::new(registry);

        let resolver = Arc::new(VersionResolver::new(
            registry.clone(),
            config.resolver.cache_capacity,
        ));
        let transformers = Arc::new(TransformerEngine::new(
            registry.clone(),
            config.transformer.max_chain_length,
            config.transformer.hop_timeout(),
        ));
        let db = Arc::new(DbSchemaManager::new(
            registry.clone(),
            runner,
            config.database.migration_timeout(),
            config.database.rollback_timeout(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            config.lifecycle.clone(),
            Some(db.clone()),
            metrics.clone(),
        ));
        let gateway = Gateway::new(
            registry.clone(),
            resolver.clone(),
            transformers.clone(),
            metrics,
        );

        Ok(Self {
            config,
            registry,
            resolver,
            transformers,
            gateway,
            lifecycle,
            db,
            differ: SchemaDiffer::default(),
            store,
            background: Mutex::new(Background::default()),
        })
    }

    pub fn config(&self) -> &TimescapeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<VersionRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<VersionResolver> {
        &self.resolver
    }

    pub fn transformers(&self) -> &Arc<TransformerEngine> {
        &self.transformers
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn db(&self) -> &Arc<DbSchemaManager> {
        &self.db
    }

    pub fn differ(&self) -> &SchemaDiffer {
        &self.differ
    }

    /// Register a version and take a reference on its database schema.
    ///
    /// When the migration fails the new version stays in the timeline but is
    /// deactivated, and the migration error is returned.
    pub async fn register_version(
        &self,
        handler_path: &str,
        content_hash: ContentHash,
        db_schema_version: Option<String>,
    ) -> Result<Tsv> {
        let tsv = self
            .registry
            .register_version(handler_path, content_hash, db_schema_version)?;
        if let Err(e) = self.db.activate(&tsv).await {
            tracing::warn!("Version {} registered but not activated: {}", tsv, e);
            self.registry.set_status(&tsv, VersionStatus::Deactivated)?;
            return Err(e);
        }
        Ok(tsv)
    }

    /// Start the lifecycle scheduler and the snapshot task. Calling it again
    /// while they run does nothing.
    pub fn start_background(&self) {
        let mut background = self.background.lock();
        if background.sweep.is_none() {
            background.sweep = Some(LifecycleScheduler::start(
                self.lifecycle.clone(),
                self.config.lifecycle.sweep_interval(),
            ));
        }
        if background.snapshot.is_none() {
            if let Some(store) = &self.store {
                background.snapshot = Some(SnapshotTask::start(
                    self.registry.clone(),
                    store.clone(),
                    Duration::from_secs(self.config.registry.snapshot_interval_secs),
                ));
            }
        }
    }

    /// Write a snapshot now, if persistence is configured
    pub async fn flush(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.persist_async(&self.registry).await,
            None => Ok(()),
        }
    }

    /// Stop background tasks and write a final snapshot
    pub async fn teardown(&self) -> Result<()> {
        let background = std::mem::take(&mut *self.background.lock());
        if let Some(sweep) = background.sweep {
            sweep.stop().await;
        }
        if let Some(snapshot) = background.snapshot {
            snapshot.stop().await;
        }
        self.flush().await?;
        tracing::info!("Timescape stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db_schema::{DbSchemaMetadata, LoggingRunner};
    use crate::metrics::NullSink;

    async fn engine(config: TimescapeConfig) -> Timescape {
        Timescape::init(
            config,
            Arc::new(ManualClock::new(1_000)),
            Arc::new(NullSink),
            Arc::new(LoggingRunner),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_activates_schema() {
        let ts = engine(TimescapeConfig::default()).await;
        ts.db()
            .register_schema(DbSchemaMetadata::new("s1", vec!["CREATE".into()], vec!["DROP".into()]))
            .await;
        ts.register_version("/users", ContentHash::of_str("a"), Some("s1".to_string()))
            .await
            .unwrap();
        assert_eq!(ts.db().ref_count("s1").await, 1);
    }

    #[tokio::test]
    async fn test_failed_activation_deactivates_version() {
        let ts = engine(TimescapeConfig::default()).await;
        let err = ts
            .register_version("/users", ContentHash::of_str("a"), Some("missing".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::TimescapeError::UnknownSchema(_)));
        assert!(ts.registry().latest_version("/users").is_err());
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TimescapeConfig::default();
        config.registry.snapshot_path = Some(dir.path().join("registry.json"));

        let ts = engine(config.clone()).await;
        let tsv = ts
            .register_version("/users", ContentHash::of_str("a"), None)
            .await
            .unwrap();
        ts.registry().tag_version(&tsv, "v1.0.0", "test").unwrap();
        ts.start_background();
        ts.teardown().await.unwrap();

        let restored = engine(config).await;
        assert_eq!(restored.registry().get_version_by_tag("/users", "v1.0.0"), Some(tsv));
    }
}
