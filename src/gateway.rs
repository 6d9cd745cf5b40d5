//! Request integration
//!
//! Serves one request for a client pinned to some version: resolve the
//! client's version, transform the request up (or down) to the version the
//! handler runs as, invoke the handler, and transform the response back.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::error::{Result, TimescapeError};
use crate::metrics::{MetricsEvent, MetricsSink};
use crate::registry::VersionRegistry;
use crate::resolver::{Resolution, VersionResolver};
use crate::transform::{Direction, PayloadKind, TransformerChain, TransformerEngine};
use crate::version::Tsv;

/// A response shaped for the client's version
#[derive(Debug, Clone, PartialEq)]
pub struct ServedResponse {
    pub body: Value,
    pub client_version: Tsv,
    pub handler_version: Tsv,
    pub transformed: bool,
}

/// Versioned request pipeline
pub struct Gateway {
    registry: Arc<VersionRegistry>,
    resolver: Arc<VersionResolver>,
    transformers: Arc<TransformerEngine>,
    metrics: Arc<dyn MetricsSink>,
}

impl Gateway {
    pub fn new(
        registry: Arc<VersionRegistry>,
        resolver: Arc<VersionResolver>,
        transformers: Arc<TransformerEngine>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            resolver,
            transformers,
            metrics,
        }
    }

    /// Resolve and validate the client version for `handler_path`
    pub fn client_version(
        &self,
        handler_path: &str,
        query_token: Option<&str>,
        header_token: Option<&str>,
    ) -> Result<Resolution> {
        let resolution = self.resolver.resolve(handler_path, query_token, header_token)?;
        let (owner, entry) = self.registry.locate(&resolution.version)?;
        if owner != handler_path {
            return Err(TimescapeError::not_found(
                handler_path,
                format!("{} belongs to {}", resolution.version, owner),
            ));
        }
        if !entry.is_active() {
            return Err(TimescapeError::not_found(
                handler_path,
                format!("{} is deactivated", resolution.version),
            ));
        }
        Ok(resolution)
    }

    /// Serve one request.
    ///
    /// `invoke` runs the handler's live code on a payload already in the live
    /// version's shape. Its error becomes a `Handler` error; transformation
    /// failures abort the request before or after it runs.
    pub async fn serve<F, Fut, E>(
        &self,
        handler_path: &str,
        query_token: Option<&str>,
        header_token: Option<&str>,
        request: Value,
        invoke: F,
    ) -> Result<ServedResponse>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = std::result::Result<Value, E>>,
        E: Display,
    {
        let started = Instant::now();
        let client_version = self
            .client_version(handler_path, query_token, header_token)?
            .version;
        let handler_version = self.registry.live_version(handler_path)?;
        let transformed = client_version != handler_version;

        let body = if transformed {
            let chain = self.transformers.build_chain(&client_version, &handler_version)?;
            let towards_handler = Direction::between(&client_version, &handler_version);

            let request = self
                .apply(&chain, request, towards_handler, PayloadKind::Request)
                .await?;
            let response = self.call_handler(handler_path, request, invoke).await?;
            self.apply(&chain, response, towards_handler.reverse(), PayloadKind::Response)
                .await?
        } else {
            self.call_handler(handler_path, request, invoke).await?
        };

        self.registry.record_access(&client_version)?;
        self.metrics.emit(MetricsEvent::VersionRequest {
            handler_path: handler_path.to_string(),
            client_version: client_version.clone(),
            handler_version: handler_version.clone(),
            transformed,
            latency_ms: started.elapsed().as_millis() as u64,
        });

        Ok(ServedResponse {
            body,
            client_version,
            handler_version,
            transformed,
        })
    }

    async fn call_handler<F, Fut, E>(&self, handler_path: &str, request: Value, invoke: F) -> Result<Value>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = std::result::Result<Value, E>>,
        E: Display,
    {
        invoke(request).await.map_err(|e| TimescapeError::Handler {
            handler_path: handler_path.to_string(),
            message: e.to_string(),
        })
    }

    async fn apply(
        &self,
        chain: &TransformerChain,
        payload: Value,
        direction: Direction,
        kind: PayloadKind,
    ) -> Result<Value> {
        let value = self.transformers.execute(chain, payload, direction, kind).await?;
        let (from, to) = match direction {
            Direction::Forward => (chain.from_version(), chain.to_version()),
            Direction::Backward => (chain.to_version(), chain.from_version()),
        };
        self.metrics.emit(MetricsEvent::TransformApplied {
            handler_path: chain.handler_path().to_string(),
            from: from.clone(),
            to: to.clone(),
            hops: chain.hops(),
            direction,
            payload: kind,
        });
        Ok(value)
    }
}
