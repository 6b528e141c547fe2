//! Tests for runtime endpoint selection.

mod common;

use std::sync::Arc;

use common::FakeRuntime;
use forgerun::{ContainerRuntime, DockerCliRuntime, Error, RuntimePool};

fn unreachable(endpoint: &str) -> Arc<dyn ContainerRuntime> {
    Arc::new(
        DockerCliRuntime::new(endpoint)
            .unwrap()
            .with_binary("/nonexistent/docker"),
    )
}

#[tokio::test]
async fn test_select_reachable_skips_dead_preferred_endpoint() {
    let mut pool = RuntimePool::new();
    assert!(pool.add(unreachable("10.0.0.1:2375")));
    assert!(pool.add(Arc::new(FakeRuntime::new())));

    let chosen = pool.select_reachable(Some("10.0.0.1:2375")).await.unwrap();
    assert_eq!(chosen.endpoint(), "memory://fake");
}

#[tokio::test]
async fn test_select_reachable_prefers_named_endpoint() {
    let mut pool = RuntimePool::new();
    assert!(pool.add(unreachable("10.0.0.1:2375")));
    assert!(pool.add(Arc::new(FakeRuntime::new())));
    assert!(!pool.add(Arc::new(FakeRuntime::new())));

    let chosen = pool.select_reachable(Some("memory://fake")).await.unwrap();
    assert_eq!(chosen.endpoint(), "memory://fake");
    assert_eq!(pool.endpoints(), vec!["tcp://10.0.0.1:2375", "memory://fake"]);
}

#[tokio::test]
async fn test_select_reachable_reports_every_failure() {
    let mut pool = RuntimePool::new();
    pool.add(unreachable("10.0.0.1:2375"));
    pool.add(unreachable("10.0.0.2:2375"));

    let Err(Error::NoRuntimeEndpoint(reason)) = pool.select_reachable(None).await else {
        panic!("expected NoRuntimeEndpoint");
    };
    assert!(reason.contains("tcp://10.0.0.1:2375"));
    assert!(reason.contains("tcp://10.0.0.2:2375"));
}

#[tokio::test]
async fn test_empty_pool_has_no_endpoint() {
    let pool = RuntimePool::new();
    assert!(matches!(
        pool.select_reachable(None).await,
        Err(Error::NoRuntimeEndpoint(_))
    ));
}
