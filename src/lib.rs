//! Timescape
//!
//! Timestamp-based API version management. Every change to a handler becomes
//! a new version on that handler's timeline; clients pin a version by tag,
//! timestamp or literal identifier, and transformer chains carry their
//! payloads to and from the version the live code runs as.
//!
//! ## Features
//!
//! - **Timelines**: Append-only, per-handler, ordered by timestamp and sequence
//! - **Tags**: Human labels (`v1.2.0`, `stable`) pointing at versions
//! - **Transformer Chains**: Immutable pairs between adjacent versions, composed on demand
//! - **Schema Diffs**: Breaking-change detection between schema snapshots
//! - **Lifecycle**: Hot/warm/cold classification and retirement of unused versions
//! - **Database Schemas**: Reference-counted migrations tied to active versions
//!
//! ## Version identifiers
//!
//! ```text
//! tsv:1704067200000-users-id-0003
//!     └ unix millis ┘ └ slug ┘ └seq┘
//! ```

pub mod cache;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod db_schema;
pub mod diff;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod tag;
pub mod timeline;
pub mod transform;
pub mod version;

pub use checksum::ContentHash;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TimescapeConfig;
pub use db_schema::{DbSchemaManager, DbSchemaMetadata, LoggingRunner, MigrationRunner, SchemaState};
pub use diff::{diff, render_text_diff, ChangeKind, SchemaChange, SchemaDiff, SchemaDiffer};
pub use engine::Timescape;
pub use error::{Result, TimescapeError};
pub use gateway::{Gateway, ServedResponse};
pub use lifecycle::{LifecycleManager, LifecycleScheduler, ManualOverride, SweepReport};
pub use metrics::{ChannelSink, MetricsEvent, MetricsSink, NullSink, TracingSink};
pub use persistence::{RegistrySnapshot, SnapshotStore};
pub use registry::VersionRegistry;
pub use resolver::{Resolution, ResolutionSource, VersionResolver, VersionToken};
pub use schema::SchemaSnapshot;
pub use tag::VersionTag;
pub use timeline::VersionTimeline;
pub use transform::{Direction, PayloadKind, TransformerChain, TransformerEngine, TransformerPair};
pub use version::{Tsv, VersionInfo, VersionStatus};
