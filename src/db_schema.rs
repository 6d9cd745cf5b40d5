//! Database schema versions
//!
//! A handler version may declare the database schema it needs. The manager
//! keeps one record per schema with the set of active versions holding it.
//! Migrations run when the first holder activates, rollbacks when the last
//! holder deactivates, so a schema still in use is never rolled back.
//!
//! Scripts are opaque to Timescape and are handed to a [`MigrationRunner`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Result, TimescapeError};
use crate::registry::VersionRegistry;
use crate::version::Tsv;

/// Migration and rollback scripts for one schema version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbSchemaMetadata {
    pub schema_version: String,
    #[serde(default)]
    pub migrations: Vec<String>,
    #[serde(default)]
    pub rollback: Vec<String>,
    /// Schemas whose tables this one can serve without migrating
    #[serde(default)]
    pub compatible_with: BTreeSet<String>,
}

impl DbSchemaMetadata {
    pub fn new(schema_version: &str, migrations: Vec<String>, rollback: Vec<String>) -> Self {
        Self {
            schema_version: schema_version.to_string(),
            migrations,
            rollback,
            compatible_with: BTreeSet::new(),
        }
    }
}

/// Executes migration scripts against the database
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    async fn run(&self, schema_version: &str, scripts: &[String]) -> anyhow::Result<()>;
}

/// Runner that only logs the scripts it is given
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRunner;

#[async_trait]
impl MigrationRunner for LoggingRunner {
    async fn run(&self, schema_version: &str, scripts: &[String]) -> anyhow::Result<()> {
        for script in scripts {
            tracing::info!("[{}] {}", schema_version, script);
        }
        Ok(())
    }
}

/// Where a schema stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaState {
    /// Registered, never applied
    Pending,
    Applied,
    RolledBack,
    /// A migration or rollback failed; needs [`DbSchemaManager::resolve_failure`]
    Failed,
}

/// Point-in-time view of one schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaStatus {
    pub schema_version: String,
    pub state: SchemaState,
    pub ref_count: usize,
    pub holders: Vec<Tsv>,
    /// Applied schema this one rides on instead of migrating
    pub shared_with: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

struct SchemaRecord {
    metadata: DbSchemaMetadata,
    state: SchemaState,
    holders: BTreeSet<Tsv>,
    shared_with: Option<String>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl SchemaRecord {
    fn status(&self) -> SchemaStatus {
        SchemaStatus {
            schema_version: self.metadata.schema_version.clone(),
            state: self.state,
            ref_count: self.holders.len(),
            holders: self.holders.iter().cloned().collect(),
            shared_with: self.shared_with.clone(),
            last_error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Reference-counted migration manager
pub struct DbSchemaManager {
    registry: Arc<VersionRegistry>,
    runner: Arc<dyn MigrationRunner>,
    // Held across migrations so schema operations never interleave.
    schemas: Mutex<HashMap<String, SchemaRecord>>,
    migration_timeout: Duration,
    rollback_timeout: Duration,
}

impl DbSchemaManager {
    pub fn new(
        registry: Arc<VersionRegistry>,
        runner: Arc<dyn MigrationRunner>,
        migration_timeout: Duration,
        rollback_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            runner,
            schemas: Mutex::new(HashMap::new()),
            migration_timeout,
            rollback_timeout,
        }
    }

    /// Make a schema known. Re-registering keeps its state and holders but
    /// replaces the scripts.
    pub async fn register_schema(&self, metadata: DbSchemaMetadata) {
        let now = self.registry.clock().now();
        let mut schemas = self.schemas.lock().await;
        match schemas.get_mut(&metadata.schema_version) {
            Some(record) => {
                record.metadata = metadata;
                record.updated_at = now;
            }
            None => {
                tracing::info!("Registered database schema {}", metadata.schema_version);
                schemas.insert(
                    metadata.schema_version.clone(),
                    SchemaRecord {
                        metadata,
                        state: SchemaState::Pending,
                        holders: BTreeSet::new(),
                        shared_with: None,
                        last_error: None,
                        updated_at: now,
                    },
                );
            }
        }
    }

    /// Record that two schemas can serve each other's versions
    pub async fn declare_compatible(&self, a: &str, b: &str) -> Result<()> {
        let mut schemas = self.schemas.lock().await;
        for (schema, other) in [(a, b), (b, a)] {
            schemas
                .get_mut(schema)
                .ok_or_else(|| TimescapeError::UnknownSchema(schema.to_string()))?
                .metadata
                .compatible_with
                .insert(other.to_string());
        }
        Ok(())
    }

    pub async fn is_compatible(&self, a: &str, b: &str) -> bool {
        let schemas = self.schemas.lock().await;
        compatible(&schemas, a, b)
    }

    pub async fn status(&self, schema_version: &str) -> Option<SchemaStatus> {
        self.schemas.lock().await.get(schema_version).map(SchemaRecord::status)
    }

    pub async fn ref_count(&self, schema_version: &str) -> usize {
        self.schemas
            .lock()
            .await
            .get(schema_version)
            .map(|r| r.holders.len())
            .unwrap_or(0)
    }

    /// Take a reference on `tsv`'s schema, migrating if it is the first.
    ///
    /// Versions without a schema are a no-op. A schema in the `Failed` state
    /// refuses new holders until an operator resolves it.
    pub async fn activate(&self, tsv: &Tsv) -> Result<()> {
        let (_, entry) = self.registry.locate(tsv)?;
        let Some(schema_version) = entry.db_schema_version() else {
            return Ok(());
        };
        let now = self.registry.clock().now();

        let mut schemas = self.schemas.lock().await;
        let host = applied_compatible(&schemas, schema_version);
        let record = schemas
            .get_mut(schema_version)
            .ok_or_else(|| TimescapeError::UnknownSchema(schema_version.to_string()))?;

        if record.holders.contains(tsv) {
            return Ok(());
        }
        if record.state == SchemaState::Failed {
            return Err(TimescapeError::SchemaMigration {
                schema_version: schema_version.to_string(),
                reason: format!(
                    "schema is marked failed ({}); resolve it before activating {}",
                    record.last_error.as_deref().unwrap_or("unknown error"),
                    tsv
                ),
            });
        }

        if record.state != SchemaState::Applied {
            if let Some(host) = host {
                tracing::info!("Schema {} shares tables with applied schema {}", schema_version, host);
                record.shared_with = Some(host);
            } else {
                tracing::info!(
                    "Applying {} migrations for schema {}",
                    record.metadata.migrations.len(),
                    schema_version
                );
                let outcome = run_with_timeout(
                    self.runner.as_ref(),
                    schema_version,
                    &record.metadata.migrations,
                    self.migration_timeout,
                )
                .await;
                if let Err(reason) = outcome {
                    tracing::error!("Migration of schema {} failed: {}", schema_version, reason);
                    record.state = SchemaState::Failed;
                    record.last_error = Some(reason.clone());
                    record.updated_at = now;
                    return Err(TimescapeError::SchemaMigration {
                        schema_version: schema_version.to_string(),
                        reason,
                    });
                }
                record.shared_with = None;
            }
            record.state = SchemaState::Applied;
            record.last_error = None;
        }

        record.holders.insert(tsv.clone());
        record.updated_at = now;
        Ok(())
    }

    /// Release `tsv`'s reference, rolling back when it was the last.
    ///
    /// A schema whose tables still serve a compatible schema stays applied
    /// until that schema's last holder leaves too. A failed rollback keeps
    /// the reference and marks the schema failed, so the caller can abort
    /// the deactivation.
    pub async fn deactivate(&self, tsv: &Tsv) -> Result<()> {
        let (_, entry) = self.registry.locate(tsv)?;
        let Some(schema_version) = entry.db_schema_version() else {
            return Ok(());
        };
        let now = self.registry.clock().now();

        let mut schemas = self.schemas.lock().await;
        let riders = has_riders(&schemas, schema_version, None);
        // An unregistered schema has no holders to release.
        let Some(record) = schemas.get_mut(schema_version) else {
            return Ok(());
        };
        if !record.holders.contains(tsv) {
            return Ok(());
        }
        if record.holders.len() > 1 {
            record.holders.remove(tsv);
            record.updated_at = now;
            return Ok(());
        }

        if let Some(host) = record.shared_with.clone() {
            // Rode on another schema's tables; nothing of its own to undo,
            // but the host may have been kept applied only for this one.
            let orphaned = schemas
                .get(&host)
                .is_some_and(|h| h.state == SchemaState::Applied && h.holders.is_empty())
                && !has_riders(&schemas, &host, Some(schema_version));
            if orphaned {
                if let Some(host_record) = schemas.get_mut(&host) {
                    tracing::info!("Rolling back schema {}, its last user {} retired", host, tsv);
                    self.roll_back(host_record, now).await?;
                }
            }
            if let Some(record) = schemas.get_mut(schema_version) {
                record.shared_with = None;
                record.state = SchemaState::Pending;
                record.holders.remove(tsv);
                record.updated_at = now;
            }
            return Ok(());
        }

        if riders {
            tracing::info!(
                "Keeping schema {} applied after {} retired: compatible schemas use its tables",
                schema_version,
                tsv
            );
        } else {
            tracing::info!("Rolling back schema {}, last holder {} retired", schema_version, tsv);
            self.roll_back(record, now).await?;
        }
        record.holders.remove(tsv);
        record.updated_at = now;
        Ok(())
    }

    async fn roll_back(&self, record: &mut SchemaRecord, now: DateTime<Utc>) -> Result<()> {
        let schema_version = record.metadata.schema_version.clone();
        let outcome = run_with_timeout(
            self.runner.as_ref(),
            &schema_version,
            &record.metadata.rollback,
            self.rollback_timeout,
        )
        .await;
        if let Err(reason) = outcome {
            tracing::error!("Rollback of schema {} failed: {}", schema_version, reason);
            record.state = SchemaState::Failed;
            record.last_error = Some(reason.clone());
            record.updated_at = now;
            return Err(TimescapeError::SchemaRollback { schema_version, reason });
        }
        record.state = SchemaState::RolledBack;
        record.updated_at = now;
        Ok(())
    }

    /// Operator step after a failed migration or rollback: record the state
    /// the database was left in and clear the failure.
    pub async fn resolve_failure(&self, schema_version: &str, state: SchemaState) -> Result<()> {
        let now = self.registry.clock().now();
        let mut schemas = self.schemas.lock().await;
        let record = schemas
            .get_mut(schema_version)
            .ok_or_else(|| TimescapeError::UnknownSchema(schema_version.to_string()))?;
        tracing::warn!(
            "Schema {} failure resolved by operator as {:?} (was: {})",
            schema_version,
            state,
            record.last_error.as_deref().unwrap_or("-")
        );
        record.state = state;
        record.last_error = None;
        record.updated_at = now;
        Ok(())
    }

    /// Recompute holders from the active versions in the registry, marking
    /// every held schema applied. Used after restoring a registry snapshot.
    pub async fn rebuild_from_registry(&self) {
        let now = self.registry.clock().now();
        let mut schemas = self.schemas.lock().await;
        for record in schemas.values_mut() {
            record.holders.clear();
        }
        for handler in self.registry.handlers() {
            let Some(timeline) = self.registry.timeline(&handler) else {
                continue;
            };
            for entry in timeline.entries().iter().filter(|e| e.is_active()) {
                let Some(schema_version) = entry.db_schema_version() else {
                    continue;
                };
                match schemas.get_mut(schema_version) {
                    Some(record) => {
                        record.holders.insert(entry.tsv().clone());
                    }
                    None => tracing::warn!(
                        "Version {} references unregistered schema {}",
                        entry.tsv(),
                        schema_version
                    ),
                }
            }
        }
        for record in schemas.values_mut() {
            if !record.holders.is_empty() && record.state != SchemaState::Failed {
                record.state = SchemaState::Applied;
                record.updated_at = now;
            }
        }
    }
}

fn compatible(schemas: &HashMap<String, SchemaRecord>, a: &str, b: &str) -> bool {
    a == b
        || schemas.get(a).is_some_and(|r| r.metadata.compatible_with.contains(b))
        || schemas.get(b).is_some_and(|r| r.metadata.compatible_with.contains(a))
}

/// Whether any held schema, other than `except`, rides on `host`'s tables
fn has_riders(schemas: &HashMap<String, SchemaRecord>, host: &str, except: Option<&str>) -> bool {
    schemas.iter().any(|(name, record)| {
        Some(name.as_str()) != except
            && record.shared_with.as_deref() == Some(host)
            && !record.holders.is_empty()
    })
}

/// An applied schema with its own tables that `schema_version` can use
fn applied_compatible(schemas: &HashMap<String, SchemaRecord>, schema_version: &str) -> Option<String> {
    let mut hosts: Vec<&String> = schemas
        .iter()
        .filter(|(name, record)| {
            name.as_str() != schema_version
                && record.state == SchemaState::Applied
                && record.shared_with.is_none()
                && compatible(schemas, name, schema_version)
        })
        .map(|(name, _)| name)
        .collect();
    hosts.sort();
    hosts.first().map(|h| h.to_string())
}

async fn run_with_timeout(
    runner: &dyn MigrationRunner,
    schema_version: &str,
    scripts: &[String],
    limit: Duration,
) -> std::result::Result<(), String> {
    match tokio::time::timeout(limit, runner.run(schema_version, scripts)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ContentHash;
    use crate::clock::ManualClock;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingRunner {
        runs: StdMutex<Vec<(String, Vec<String>)>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl MigrationRunner for RecordingRunner {
        async fn run(&self, schema_version: &str, scripts: &[String]) -> anyhow::Result<()> {
            if let Some(bad) = &self.fail_on {
                if scripts.iter().any(|s| s == bad) {
                    anyhow::bail!("syntax error in {}", bad);
                }
            }
            self.runs
                .lock()
                .unwrap()
                .push((schema_version.to_string(), scripts.to_vec()));
            Ok(())
        }
    }

    fn registry() -> Arc<VersionRegistry> {
        Arc::new(VersionRegistry::new(Arc::new(ManualClock::new(1_000))))
    }

    fn meta(name: &str) -> DbSchemaMetadata {
        DbSchemaMetadata::new(
            name,
            vec![format!("CREATE {}", name)],
            vec![format!("DROP {}", name)],
        )
    }

    fn manager(registry: &Arc<VersionRegistry>, runner: Arc<RecordingRunner>) -> DbSchemaManager {
        DbSchemaManager::new(
            registry.clone(),
            runner,
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn test_migrate_once_rollback_at_zero() {
        let registry = registry();
        let runner = Arc::new(RecordingRunner::default());
        let db = manager(&registry, runner.clone());
        db.register_schema(meta("s1")).await;

        let a = registry
            .register_version("/users", ContentHash::of_str("a"), Some("s1".to_string()))
            .unwrap();
        let b = registry
            .register_version("/orders", ContentHash::of_str("b"), Some("s1".to_string()))
            .unwrap();

        db.activate(&a).await.unwrap();
        db.activate(&b).await.unwrap();
        db.activate(&b).await.unwrap();
        assert_eq!(db.ref_count("s1").await, 2);
        assert_eq!(runner.runs.lock().unwrap().len(), 1);

        db.deactivate(&a).await.unwrap();
        assert_eq!(db.status("s1").await.unwrap().state, SchemaState::Applied);
        assert_eq!(runner.runs.lock().unwrap().len(), 1);

        db.deactivate(&b).await.unwrap();
        let status = db.status("s1").await.unwrap();
        assert_eq!(status.state, SchemaState::RolledBack);
        assert_eq!(status.ref_count, 0);
        let runs = runner.runs.lock().unwrap();
        assert_eq!(runs[1].1, vec!["DROP s1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_migration_needs_resolution() {
        let registry = registry();
        let runner = Arc::new(RecordingRunner {
            fail_on: Some("CREATE s1".to_string()),
            ..Default::default()
        });
        let db = manager(&registry, runner);
        db.register_schema(meta("s1")).await;
        let a = registry
            .register_version("/users", ContentHash::of_str("a"), Some("s1".to_string()))
            .unwrap();

        let err = db.activate(&a).await.unwrap_err();
        assert!(matches!(err, TimescapeError::SchemaMigration { .. }));
        let status = db.status("s1").await.unwrap();
        assert_eq!(status.state, SchemaState::Failed);
        assert!(status.last_error.unwrap().contains("syntax error"));

        // No automatic retry.
        assert!(db.activate(&a).await.is_err());

        db.resolve_failure("s1", SchemaState::Applied).await.unwrap();
        db.activate(&a).await.unwrap();
        assert_eq!(db.ref_count("s1").await, 1);
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_reference() {
        let registry = registry();
        let runner = Arc::new(RecordingRunner {
            fail_on: Some("DROP s1".to_string()),
            ..Default::default()
        });
        let db = manager(&registry, runner);
        db.register_schema(meta("s1")).await;
        let a = registry
            .register_version("/users", ContentHash::of_str("a"), Some("s1".to_string()))
            .unwrap();
        db.activate(&a).await.unwrap();

        let err = db.deactivate(&a).await.unwrap_err();
        assert!(matches!(err, TimescapeError::SchemaRollback { .. }));
        let status = db.status("s1").await.unwrap();
        assert_eq!(status.state, SchemaState::Failed);
        assert_eq!(status.ref_count, 1);
    }

    #[tokio::test]
    async fn test_compatible_schema_shares_tables() {
        let registry = registry();
        let runner = Arc::new(RecordingRunner::default());
        let db = manager(&registry, runner.clone());
        db.register_schema(meta("s1")).await;
        db.register_schema(meta("s1a")).await;
        db.declare_compatible("s1", "s1a").await.unwrap();
        assert!(db.is_compatible("s1a", "s1").await);
        assert!(!db.is_compatible("s1", "s2").await);

        let a = registry
            .register_version("/users", ContentHash::of_str("a"), Some("s1".to_string()))
            .unwrap();
        let b = registry
            .register_version("/users", ContentHash::of_str("b"), Some("s1a".to_string()))
            .unwrap();
        db.activate(&a).await.unwrap();
        db.activate(&b).await.unwrap();

        let status = db.status("s1a").await.unwrap();
        assert_eq!(status.state, SchemaState::Applied);
        assert_eq!(status.shared_with.as_deref(), Some("s1"));
        assert_eq!(runner.runs.lock().unwrap().len(), 1);

        db.deactivate(&b).await.unwrap();
        assert_eq!(runner.runs.lock().unwrap().len(), 1);
        assert_eq!(db.status("s1a").await.unwrap().state, SchemaState::Pending);
    }

    #[tokio::test]
    async fn test_host_schema_outlives_its_holders_while_shared() {
        let registry = registry();
        let runner = Arc::new(RecordingRunner::default());
        let db = manager(&registry, runner.clone());
        db.register_schema(meta("s1")).await;
        db.register_schema(meta("s1a")).await;
        db.declare_compatible("s1", "s1a").await.unwrap();

        let a = registry
            .register_version("/users", ContentHash::of_str("a"), Some("s1".to_string()))
            .unwrap();
        let b = registry
            .register_version("/users", ContentHash::of_str("b"), Some("s1a".to_string()))
            .unwrap();
        db.activate(&a).await.unwrap();
        db.activate(&b).await.unwrap();

        // s1a still runs on s1's tables.
        db.deactivate(&a).await.unwrap();
        let host = db.status("s1").await.unwrap();
        assert_eq!(host.state, SchemaState::Applied);
        assert_eq!(host.ref_count, 0);
        assert_eq!(runner.runs.lock().unwrap().len(), 1);

        db.deactivate(&b).await.unwrap();
        assert_eq!(db.status("s1").await.unwrap().state, SchemaState::RolledBack);
        assert_eq!(db.status("s1a").await.unwrap().state, SchemaState::Pending);
        let runs = runner.runs.lock().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1], ("s1".to_string(), vec!["DROP s1".to_string()]));
    }

    #[tokio::test]
    async fn test_unknown_schema() {
        let registry = registry();
        let db = manager(&registry, Arc::new(RecordingRunner::default()));
        let a = registry
            .register_version("/users", ContentHash::of_str("a"), Some("nope".to_string()))
            .unwrap();
        assert!(matches!(
            db.activate(&a).await.unwrap_err(),
            TimescapeError::UnknownSchema(_)
        ));
    }

    #[tokio::test]
    async fn test_rebuild_from_registry() {
        let registry = registry();
        let db = manager(&registry, Arc::new(RecordingRunner::default()));
        db.register_schema(meta("s1")).await;
        registry
            .register_version("/users", ContentHash::of_str("a"), Some("s1".to_string()))
            .unwrap();
        registry
            .register_version("/orders", ContentHash::of_str("b"), Some("s1".to_string()))
            .unwrap();

        db.rebuild_from_registry().await;
        let status = db.status("s1").await.unwrap();
        assert_eq!(status.ref_count, 2);
        assert_eq!(status.state, SchemaState::Applied);
    }
}
