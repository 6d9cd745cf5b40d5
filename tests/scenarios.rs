//! End-to-end scenarios
//!
//! Drives the public API the way a host application would: registry,
//! resolver, transformer chains, gateway and lifecycle around one registry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use timescape::config::LifecycleConfig;
use timescape::{
    ContentHash, Direction, Gateway, LifecycleManager, ManualClock, NullSink, PayloadKind,
    TimescapeError, TransformerEngine, TransformerPair, Tsv, VersionRegistry, VersionResolver,
};

fn registry_with(clock: &Arc<ManualClock>, handler: &str, times: &[i64]) -> (Arc<VersionRegistry>, Vec<Tsv>) {
    let registry = Arc::new(VersionRegistry::new(clock.clone()));
    let versions = times
        .iter()
        .enumerate()
        .map(|(i, t)| {
            clock.set(*t);
            registry
                .register_version(handler, ContentHash::of_str(&format!("{}-{}", handler, i)), None)
                .unwrap()
        })
        .collect();
    (registry, versions)
}

fn engine(registry: &Arc<VersionRegistry>) -> Arc<TransformerEngine> {
    Arc::new(TransformerEngine::new(registry.clone(), 10, Duration::from_secs(1)))
}

// =============================================================================
// Resolution
// =============================================================================

#[test]
fn test_point_in_time_resolution() {
    let clock = Arc::new(ManualClock::new(0));
    let (registry, v) = registry_with(&clock, "/users", &[1000, 2000]);

    assert_eq!(registry.get_version_at("/users", 1500).unwrap(), v[0]);
    assert_eq!(registry.get_version_at("/users", 2500).unwrap(), v[1]);
    assert_eq!(registry.get_version_at("/users", 2000).unwrap(), v[1]);
    // Before the first version: the earliest one, never "not found".
    assert_eq!(registry.get_version_at("/users", 10).unwrap(), v[0]);
}

#[test]
fn test_resolution_is_monotonic() {
    let clock = Arc::new(ManualClock::new(0));
    let times = [100, 250, 250, 900, 4000];
    let (registry, v) = registry_with(&clock, "/orders", &times);

    let mut previous: Option<Tsv> = None;
    for t in (0..5000).step_by(50) {
        let resolved = registry.get_version_at("/orders", t).unwrap();
        let expected = v
            .iter()
            .filter(|tsv| tsv.timestamp_millis() <= t)
            .max()
            .unwrap_or(&v[0]);
        assert_eq!(&resolved, expected, "at t={}", t);
        if let Some(p) = &previous {
            assert!(resolved >= *p);
        }
        previous = Some(resolved);
    }
}

#[test]
fn test_unknown_handler_and_bad_tokens() {
    let clock = Arc::new(ManualClock::new(0));
    let (registry, _) = registry_with(&clock, "/users", &[1000]);
    let resolver = VersionResolver::new(registry.clone(), 32);

    let err = resolver.resolve("/nothing", None, None).unwrap_err();
    assert!(matches!(err, TimescapeError::VersionNotFound { .. }));
    let err = resolver.resolve("/users", Some("tsv:12-x"), None).unwrap_err();
    assert!(matches!(err, TimescapeError::InvalidVersionFormat { .. }));
}

// =============================================================================
// Tags
// =============================================================================

#[test]
fn test_tag_lifecycle() {
    let clock = Arc::new(ManualClock::new(0));
    let (registry, v) = registry_with(&clock, "/users", &[1000, 2000]);

    registry.tag_version(&v[1], "stable", "ops").unwrap();
    assert_eq!(registry.get_version_by_tag("/users", "stable"), Some(v[1].clone()));

    // Same version again is a no-op; another version collides.
    registry.tag_version(&v[1], "stable", "ops").unwrap();
    let err = registry.tag_version(&v[0], "stable", "ops").unwrap_err();
    assert!(matches!(err, TimescapeError::DuplicateTag { .. }));

    assert!(registry.untag_version("stable"));
    assert_eq!(registry.get_version_by_tag("/users", "stable"), None);
    assert!(!registry.untag_version("stable"));
}

// =============================================================================
// Transformers
// =============================================================================

/// T1 sends `price` as a decimal string, T2 as integer `priceInCents`
fn price_pair(from: &Tsv, to: &Tsv) -> TransformerPair {
    TransformerPair::builder(from.clone(), to.clone())
        .forward(|_, mut payload| {
            let obj = payload
                .as_object_mut()
                .ok_or_else(|| anyhow::anyhow!("expected an object"))?;
            if let Some(price) = obj.remove("price") {
                let price: f64 = price
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("price must be a string"))?
                    .parse()?;
                obj.insert("priceInCents".to_string(), json!((price * 100.0).round() as i64));
            }
            Ok(payload)
        })
        .backward(|_, mut payload| {
            let obj = payload
                .as_object_mut()
                .ok_or_else(|| anyhow::anyhow!("expected an object"))?;
            if let Some(cents) = obj.remove("priceInCents") {
                let cents = cents
                    .as_i64()
                    .ok_or_else(|| anyhow::anyhow!("priceInCents must be an integer"))?;
                obj.insert("price".to_string(), json!(format!("{}.{:02}", cents / 100, cents % 100)));
            }
            Ok(payload)
        })
        .created_by("pricing-team")
        .description("price -> priceInCents")
        .build()
}

#[tokio::test]
async fn test_breaking_change_served_through_transformer() {
    let clock = Arc::new(ManualClock::new(0));
    let (registry, v) = registry_with(&clock, "/products", &[1000, 2000]);
    registry.bind_live("/products", &v[1]).unwrap();

    let transformers = engine(&registry);
    transformers.register(price_pair(&v[0], &v[1])).unwrap();
    let resolver = Arc::new(VersionResolver::new(registry.clone(), 32));
    let gateway = Gateway::new(registry.clone(), resolver, transformers, Arc::new(NullSink));

    let served = gateway
        .serve(
            "/products",
            Some(&v[0].to_string()),
            None,
            json!({"price": "9.99"}),
            |request: Value| async move {
                assert_eq!(request, json!({"priceInCents": 999}));
                Ok::<_, String>(json!({"priceInCents": 999}))
            },
        )
        .await
        .unwrap();

    assert_eq!(served.body, json!({"price": "9.99"}));
    assert!(served.transformed);
    assert_eq!(served.handler_version, v[1]);
}

#[tokio::test]
async fn test_non_breaking_pair_round_trips() {
    let clock = Arc::new(ManualClock::new(0));
    let (registry, v) = registry_with(&clock, "/users", &[1000, 2000]);
    let transformers = engine(&registry);
    transformers
        .register(TransformerPair::passthrough(v[0].clone(), v[1].clone(), "test"))
        .unwrap();
    let chain = transformers.build_chain(&v[0], &v[1]).unwrap();

    for payload in [json!({}), json!({"id": 1, "tags": ["a"]}), json!([1, 2, 3]), Value::Null] {
        let up = transformers
            .execute(&chain, payload.clone(), Direction::Forward, PayloadKind::Request)
            .await
            .unwrap();
        let down = transformers
            .execute(&chain, up, Direction::Backward, PayloadKind::Request)
            .await
            .unwrap();
        assert_eq!(down, payload);
    }
}

#[test]
fn test_missing_hop_is_reported() {
    let clock = Arc::new(ManualClock::new(0));
    let (registry, t) = registry_with(&clock, "/users", &[1000, 2000, 3000, 4000, 5000]);
    let transformers = engine(&registry);
    for (a, b) in [(0, 1), (1, 2), (3, 4)] {
        transformers
            .register(TransformerPair::passthrough(t[a].clone(), t[b].clone(), "test"))
            .unwrap();
    }

    let err = transformers.build_chain(&t[0], &t[4]).unwrap_err();
    match &err {
        TimescapeError::IncompleteChain { missing_from, missing_to, .. } => {
            assert_eq!(missing_from, &t[2]);
            assert_eq!(missing_to, &t[3]);
        }
        other => panic!("expected IncompleteChain, got {:?}", other),
    }
    assert!(err.to_string().contains("Incomplete chain"));
}

#[test]
fn test_registered_pairs_are_immutable() {
    let clock = Arc::new(ManualClock::new(0));
    let (registry, v) = registry_with(&clock, "/users", &[1000, 2000]);
    let transformers = engine(&registry);
    transformers.register(price_pair(&v[0], &v[1])).unwrap();

    for _ in 0..3 {
        assert!(transformers
            .register(TransformerPair::passthrough(v[0].clone(), v[1].clone(), "x"))
            .is_err());
        assert!(matches!(
            transformers.redefine(price_pair(&v[0], &v[1])).unwrap_err(),
            TimescapeError::ImmutabilityViolation { .. }
        ));
    }
    assert_eq!(
        transformers.pair(&v[0]).unwrap().description(),
        Some("price -> priceInCents")
    );
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_cold_version_eligible_unless_protected() {
    let clock = Arc::new(ManualClock::new(0));
    let (registry, v) = registry_with(&clock, "/users", &[1000, 2000]);
    registry.record_access(&v[0]).unwrap();
    registry.record_access(&v[0]).unwrap();

    let config = LifecycleConfig {
        cold_threshold_ms: 0,
        min_request_count: 5,
        protected_tags: vec!["production".to_string()],
        dry_run: true,
        ..Default::default()
    };

    let lifecycle = LifecycleManager::new(registry.clone(), config.clone(), None, Arc::new(NullSink));
    let report = lifecycle.sweep().await;
    assert_eq!(report.eligible, vec![v[0].clone()]);

    registry.tag_version(&v[0], "production", "ops").unwrap();
    let lifecycle = LifecycleManager::new(registry.clone(), config, None, Arc::new(NullSink));
    assert!(lifecycle.sweep().await.eligible.is_empty());

    let err = lifecycle.deactivate(&v[0], false).await.unwrap_err();
    assert!(matches!(err, TimescapeError::ProtectedTagViolation { .. }));
    lifecycle.deactivate(&v[0], true).await.unwrap();
    assert!(!registry.info(&v[0]).unwrap().status.is_active());

    // Retired versions leave resolution but keep their place in the timeline.
    assert_eq!(registry.get_version_at("/users", 1500).unwrap(), v[1]);
    assert_eq!(registry.timeline("/users").unwrap().len(), 2);
}
