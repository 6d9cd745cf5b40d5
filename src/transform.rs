//! Transformer Chain Engine
//!
//! A transformer pair converts payloads between two timeline-adjacent versions
//! of one handler. Pairs are immutable once registered: they are built with a
//! builder, expose no setters, and an adjacency can be filled exactly once.
//! Chains are derived from the timeline order, never from a graph, so a chain
//! is always a straight walk between two versions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::LruCache;
use crate::error::{Result, TimescapeError};
use crate::registry::VersionRegistry;
use crate::version::Tsv;

/// Which payload a transform is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Request,
    Response,
}

/// Direction of a transformation along the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Older version to newer, applied oldest pair first
    Forward,
    /// Newer version to older, applied newest pair first
    Backward,
}

impl Direction {
    /// Direction that carries a payload from `from` to `to`
    pub fn between(from: &Tsv, to: &Tsv) -> Self {
        if from.order_key() <= to.order_key() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

/// A payload conversion function
pub type TransformFn = Arc<dyn Fn(PayloadKind, Value) -> anyhow::Result<Value> + Send + Sync>;

fn identity() -> TransformFn {
    Arc::new(|_, payload| Ok(payload))
}

/// Immutable bidirectional conversion between two adjacent versions
pub struct TransformerPair {
    from: Tsv,
    to: Tsv,
    forward: TransformFn,
    backward: TransformFn,
    created_at: DateTime<Utc>,
    created_by: String,
    description: Option<String>,
}

impl TransformerPair {
    pub fn builder(from: Tsv, to: Tsv) -> TransformerPairBuilder {
        TransformerPairBuilder {
            from,
            to,
            forward: None,
            backward: None,
            created_at: None,
            created_by: "unknown".to_string(),
            description: None,
        }
    }

    /// A pair for a non-breaking change: payloads pass through unchanged
    pub fn passthrough(from: Tsv, to: Tsv, created_by: &str) -> Self {
        Self::builder(from, to)
            .created_by(created_by)
            .description("passthrough")
            .build()
    }

    pub fn from_version(&self) -> &Tsv {
        &self.from
    }

    pub fn to_version(&self) -> &Tsv {
        &self.to
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Pairs never change after construction
    pub fn is_immutable(&self) -> bool {
        true
    }

    /// Convert client-side payloads (old shape) towards the handler (new shape)
    pub fn forward(&self, kind: PayloadKind, payload: Value) -> anyhow::Result<Value> {
        (self.forward)(kind, payload)
    }

    /// Convert handler-side payloads (new shape) back to the old shape
    pub fn backward(&self, kind: PayloadKind, payload: Value) -> anyhow::Result<Value> {
        (self.backward)(kind, payload)
    }

    pub fn apply(&self, direction: Direction, kind: PayloadKind, payload: Value) -> anyhow::Result<Value> {
        match direction {
            Direction::Forward => self.forward(kind, payload),
            Direction::Backward => self.backward(kind, payload),
        }
    }
}

impl fmt::Debug for TransformerPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerPair")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("created_at", &self.created_at)
            .field("created_by", &self.created_by)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TransformerPair`]. A direction left unset passes payloads
/// through unchanged.
pub struct TransformerPairBuilder {
    from: Tsv,
    to: Tsv,
    forward: Option<TransformFn>,
    backward: Option<TransformFn>,
    created_at: Option<DateTime<Utc>>,
    created_by: String,
    description: Option<String>,
}

impl TransformerPairBuilder {
    pub fn forward<F>(mut self, f: F) -> Self
    where
        F: Fn(PayloadKind, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.forward = Some(Arc::new(f));
        self
    }

    pub fn backward<F>(mut self, f: F) -> Self
    where
        F: Fn(PayloadKind, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.backward = Some(Arc::new(f));
        self
    }

    pub fn created_by(mut self, who: &str) -> Self {
        self.created_by = who.to_string();
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.description = Some(text.to_string());
        self
    }

    pub fn build(self) -> TransformerPair {
        TransformerPair {
            from: self.from,
            to: self.to,
            forward: self.forward.unwrap_or_else(identity),
            backward: self.backward.unwrap_or_else(identity),
            created_at: self.created_at.unwrap_or_else(Utc::now),
            created_by: self.created_by,
            description: self.description,
        }
    }
}

/// Ordered pairs bridging two versions of one handler
#[derive(Debug, Clone)]
pub struct TransformerChain {
    handler_path: String,
    from: Tsv,
    to: Tsv,
    /// Oldest pair first
    pairs: Vec<Arc<TransformerPair>>,
}

impl TransformerChain {
    pub fn handler_path(&self) -> &str {
        &self.handler_path
    }

    pub fn from_version(&self) -> &Tsv {
        &self.from
    }

    pub fn to_version(&self) -> &Tsv {
        &self.to
    }

    pub fn pairs(&self) -> &[Arc<TransformerPair>] {
        &self.pairs
    }

    pub fn hops(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Stores transformer pairs and builds and runs chains
pub struct TransformerEngine {
    registry: Arc<VersionRegistry>,
    /// Pairs keyed by their `from` version; adjacency makes `from` unique
    pairs: RwLock<HashMap<Tsv, Arc<TransformerPair>>>,
    chains: Mutex<LruCache<(Tsv, Tsv), Arc<TransformerChain>>>,
    max_chain_length: usize,
    hop_timeout: Duration,
}

impl TransformerEngine {
    pub fn new(registry: Arc<VersionRegistry>, max_chain_length: usize, hop_timeout: Duration) -> Self {
        Self {
            registry,
            pairs: RwLock::new(HashMap::new()),
            chains: Mutex::new(LruCache::new(1024)),
            max_chain_length,
            hop_timeout,
        }
    }

    pub fn max_chain_length(&self) -> usize {
        self.max_chain_length
    }

    /// Register a pair for an empty adjacency
    pub fn register(&self, pair: TransformerPair) -> Result<()> {
        let (from, to) = (pair.from.clone(), pair.to.clone());
        if !self.registry.are_adjacent(&from, &to) {
            return Err(TimescapeError::NonAdjacentVersions { from, to });
        }

        let mut pairs = self.pairs.write();
        if pairs.contains_key(&from) {
            return Err(TimescapeError::DuplicatePair { from, to });
        }
        pairs.insert(from.clone(), Arc::new(pair));
        tracing::info!("Registered transformer {} -> {}", from, to);
        Ok(())
    }

    /// Replace the pair for an adjacency.
    ///
    /// Registered pairs cannot change, so this fails with
    /// `ImmutabilityViolation` whenever the adjacency is occupied and behaves
    /// like [`register`](Self::register) otherwise.
    pub fn redefine(&self, pair: TransformerPair) -> Result<()> {
        if self.pairs.read().contains_key(&pair.from) {
            tracing::warn!(
                "Rejected redefinition of transformer {} -> {}",
                pair.from,
                pair.to
            );
            return Err(TimescapeError::ImmutabilityViolation {
                from: pair.from,
                to: pair.to,
            });
        }
        self.register(pair)
    }

    /// Pair starting at `from`
    pub fn pair(&self, from: &Tsv) -> Option<Arc<TransformerPair>> {
        self.pairs.read().get(from).cloned()
    }

    /// Registered pairs of one handler, oldest first
    pub fn pairs_for(&self, handler_path: &str) -> Vec<Arc<TransformerPair>> {
        let Some(timeline) = self.registry.timeline(handler_path) else {
            return Vec::new();
        };
        let pairs = self.pairs.read();
        timeline
            .entries()
            .iter()
            .filter_map(|e| pairs.get(e.tsv()).cloned())
            .collect()
    }

    /// Chain of pairs between two versions of the same handler.
    ///
    /// The two versions may be given in either order; the chain always lists
    /// pairs oldest first. Fails when a hop has no pair or the chain is longer
    /// than the configured maximum.
    pub fn build_chain(&self, from: &Tsv, to: &Tsv) -> Result<Arc<TransformerChain>> {
        let key = (from.clone(), to.clone());
        if let Some(chain) = self.chains.lock().get(&key) {
            return Ok(chain);
        }

        let from_handler = self
            .registry
            .handler_of(from)
            .ok_or_else(|| TimescapeError::not_found(from.slug(), format!("unknown version {}", from)))?;
        let to_handler = self
            .registry
            .handler_of(to)
            .ok_or_else(|| TimescapeError::not_found(to.slug(), format!("unknown version {}", to)))?;
        if from_handler != to_handler {
            return Err(TimescapeError::CrossHandlerChain {
                from: from.clone(),
                to: to.clone(),
                from_handler,
                to_handler,
            });
        }

        let timeline = self
            .registry
            .timeline(&from_handler)
            .ok_or_else(|| TimescapeError::not_found(&from_handler, "handler has no versions"))?;
        let span = timeline
            .span(from, to)
            .ok_or_else(|| TimescapeError::not_found(&from_handler, format!("{} or {} not in timeline", from, to)))?;

        let hops = span.len() - 1;
        if hops > self.max_chain_length {
            return Err(TimescapeError::ChainLengthExceeded {
                from: from.clone(),
                to: to.clone(),
                hops,
                max: self.max_chain_length,
            });
        }

        let pairs = {
            let registered = self.pairs.read();
            let mut pairs = Vec::with_capacity(hops);
            for window in span.windows(2) {
                let (a, b) = (window[0].tsv(), window[1].tsv());
                match registered.get(a) {
                    Some(pair) if pair.to == *b => pairs.push(pair.clone()),
                    _ => {
                        return Err(TimescapeError::IncompleteChain {
                            from: from.clone(),
                            to: to.clone(),
                            missing_from: a.clone(),
                            missing_to: b.clone(),
                        })
                    }
                }
            }
            pairs
        };

        let chain = Arc::new(TransformerChain {
            handler_path: from_handler,
            from: from.clone(),
            to: to.clone(),
            pairs,
        });
        tracing::debug!("Built chain {} -> {} ({} hops)", from, to, chain.hops());
        self.chains.lock().insert(key, chain.clone());
        Ok(chain)
    }

    /// Run a payload through a chain.
    ///
    /// `Forward` applies each pair's forward function oldest first;
    /// `Backward` applies backward functions newest first. Each hop runs on
    /// the blocking pool under the hop timeout. The first failing hop fails
    /// the whole execution; hops are numbered from 1 in application order.
    pub async fn execute(
        &self,
        chain: &TransformerChain,
        payload: Value,
        direction: Direction,
        kind: PayloadKind,
    ) -> Result<Value> {
        let ordered: Vec<Arc<TransformerPair>> = match direction {
            Direction::Forward => chain.pairs.iter().cloned().collect(),
            Direction::Backward => chain.pairs.iter().rev().cloned().collect(),
        };

        let mut value = payload;
        for (index, pair) in ordered.into_iter().enumerate() {
            let hop = index + 1;
            let (from, to) = match direction {
                Direction::Forward => (pair.from.clone(), pair.to.clone()),
                Direction::Backward => (pair.to.clone(), pair.from.clone()),
            };
            let input = value;
            let task = tokio::task::spawn_blocking(move || pair.apply(direction, kind, input));

            // A timed-out hop keeps running on the blocking pool but its result
            // is discarded; only this request fails.
            value = match tokio::time::timeout(self.hop_timeout, task).await {
                Ok(Ok(Ok(next))) => next,
                Ok(Ok(Err(e))) => {
                    tracing::warn!("Transformer hop {} ({} -> {}) failed: {:#}", hop, from, to, e);
                    return Err(TimescapeError::Transformation {
                        hop,
                        from,
                        to,
                        cause: format!("{:#}", e),
                    });
                }
                Ok(Err(join)) => {
                    tracing::warn!("Transformer hop {} ({} -> {}) panicked", hop, from, to);
                    return Err(TimescapeError::Transformation {
                        hop,
                        from,
                        to,
                        cause: format!("transformer panicked: {}", join),
                    });
                }
                Err(_) => {
                    tracing::warn!("Transformer hop {} ({} -> {}) timed out", hop, from, to);
                    return Err(TimescapeError::Transformation {
                        hop,
                        from,
                        to,
                        cause: format!("timed out after {}ms", self.hop_timeout.as_millis()),
                    });
                }
            };
        }
        Ok(value)
    }

    /// Build the chain between two versions and carry `payload` from `from`
    /// to `to`. Returns the payload and the number of hops applied.
    pub async fn transform(
        &self,
        from: &Tsv,
        to: &Tsv,
        payload: Value,
        kind: PayloadKind,
    ) -> Result<(Value, usize)> {
        if from == to {
            return Ok((payload, 0));
        }
        let chain = self.build_chain(from, to)?;
        let value = self
            .execute(&chain, payload, Direction::between(from, to), kind)
            .await?;
        Ok((value, chain.hops()))
    }
}
