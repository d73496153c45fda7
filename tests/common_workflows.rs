//! Integration tests for common idlink workflows.
//!
//! These tests wire the workspace crates together the way a deployment does:
//! configuration from TOML, pooled connectors behind a server group, and a
//! client reaching them through a load balancer.

use async_trait::async_trait;
use idlink::rpc::{
    Connector, ConnectorConfig, ConnectorFactory, ConnectorInfo, ConnectorKey, EndpointService,
    LocalEndpoint, OperationKind, ProgressSink, RemoteEndpoint, RemoteFailure, memory,
};
use idlink::{
    BalancePolicy, ConfigError, ConnectionGroup, Endpoint, LoadBalancer, PoolConfig, RpcError,
    RuntimeConfig,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const CONFIG: &str = r#"
[pool]
max_objects = 2
max_idle = 2
min_idle = 1
max_wait_seconds = 5

[balancer]
name = "hr-sites"
policy = "failover"

[log]
level = "warn"
"#;

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    disposed: AtomicUsize,
    busy: AtomicUsize,
    peak: AtomicUsize,
}

struct HrFactory {
    site: &'static str,
    counters: Arc<Counters>,
}

struct HrConnector {
    site: &'static str,
    counters: Arc<Counters>,
}

#[async_trait]
impl Connector for HrConnector {
    async fn execute(
        &self,
        operation: OperationKind,
        args: Value,
        progress: &dyn ProgressSink,
    ) -> Result<Value, RemoteFailure> {
        let busy = self.counters.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(busy, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.counters.busy.fetch_sub(1, Ordering::SeqCst);

        match operation {
            OperationKind::Create => Ok(json!(format!("{}-1", self.site))),
            OperationKind::Sync => {
                for change in ["hired", "moved"] {
                    progress.progress(json!({ "change": change })).await;
                }
                Ok(json!({ "token": 2 }))
            }
            OperationKind::Get => Ok(json!({ "uid": args["uid"], "site": self.site })),
            _ => Ok(Value::Null),
        }
    }

    fn dispose(&self) {
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectorFactory for HrFactory {
    fn info(&self) -> ConnectorInfo {
        ConnectorInfo {
            key: hr_key(),
            display_name: "HR system".to_string(),
            default_config: ConnectorConfig::new().with_property("url", "https://hr.example.com"),
        }
    }

    fn pooling(&self) -> Option<PoolConfig> {
        Some(PoolConfig::default())
    }

    async fn create(&self, _config: &ConnectorConfig) -> Result<Box<dyn Connector>, RemoteFailure> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(HrConnector {
            site: self.site,
            counters: Arc::clone(&self.counters),
        }))
    }
}

fn hr_key() -> ConnectorKey {
    ConnectorKey::new("hr-bundle", "2.1", "HrConnector")
}

struct Site {
    local: Arc<LocalEndpoint>,
    client: Arc<ConnectionGroup>,
    counters: Arc<Counters>,
}

async fn site(name: &'static str, config: &RuntimeConfig) -> Site {
    let counters = Arc::new(Counters::default());
    let local = LocalEndpoint::builder()
        .register(HrFactory {
            site: name,
            counters: Arc::clone(&counters),
        })
        .with_pool_config(config.pool.clone())
        .build();
    let server = ConnectionGroup::with_handler(
        format!("{name}-server"),
        EndpointService::new(Arc::clone(&local)),
    );
    let client = ConnectionGroup::new(format!("{name}-client"));
    memory::connect(client.clone(), server).await;
    Site {
        local,
        client,
        counters,
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_file_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = RuntimeConfig::from_file(file.path()).unwrap();
    assert_eq!(config.pool.max_objects, 2);
    assert_eq!(config.pool.max_wait(), Duration::from_secs(5));
    assert_eq!(config.balancer.policy, BalancePolicy::Failover);
    assert_eq!(config.log_config().level, idlink::log::Level::Warn);
}

#[test]
fn test_invalid_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[pool]\nmax_objects = 0\n").unwrap();

    let err = RuntimeConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

// =============================================================================
// End to end
// =============================================================================

#[tokio::test]
async fn test_connector_lifecycle_through_balancer() {
    let config = RuntimeConfig::from_toml_str(CONFIG).unwrap();
    let primary = site("east", &config).await;
    let secondary = site("west", &config).await;

    let balancer = LoadBalancer::from_config(
        &config.balancer,
        vec![
            Endpoint::Remote(RemoteEndpoint::new(Arc::clone(&primary.client))),
            Endpoint::Remote(RemoteEndpoint::new(Arc::clone(&secondary.client))),
        ],
    );
    assert_eq!(balancer.name(), "hr-sites");

    let hr = Endpoint::Balanced(Arc::clone(&balancer))
        .new_instance(&hr_key(), |c| c.with_property("tenant", "acme"))
        .await
        .unwrap();
    assert_eq!(hr.config().property("tenant"), Some(&json!("acme")));

    assert_eq!(hr.create(json!({ "name": "Ada" })).await.unwrap(), json!("east-1"));
    assert_eq!(hr.get("east-1").await.unwrap()["site"], "east");

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    let token = hr.sync(json!(0), move |item| sink.lock().push(item)).await.unwrap();
    assert_eq!(token, json!({ "token": 2 }));
    assert_eq!(changes.lock()[1], json!({ "change": "moved" }));

    // One pool per key and configuration, reused across operations.
    assert_eq!(primary.local.pool_count(), 1);
    assert_eq!(primary.counters.created.load(Ordering::SeqCst), 1);

    // Losing the primary moves traffic to the secondary.
    primary.client.close().await;
    assert_eq!(hr.get("east-1").await.unwrap()["site"], "west");
    assert_eq!(balancer.stats().exhausted, 0);

    secondary.client.close().await;
    let err = hr.get("east-1").await.unwrap_err();
    assert_eq!(err, RpcError::AggregateFailed(Box::new(RpcError::NoDelegate)));

    primary.local.close().await;
    secondary.local.close().await;
    assert_eq!(
        primary.counters.created.load(Ordering::SeqCst),
        primary.counters.disposed.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_pool_bounds_concurrent_remote_calls() {
    let config = RuntimeConfig::from_toml_str(CONFIG).unwrap();
    let east = site("east", &config).await;
    let endpoint = Endpoint::Remote(RemoteEndpoint::new(Arc::clone(&east.client)));
    let hr = endpoint.new_instance(&hr_key(), |c| c).await.unwrap();

    let calls: Vec<_> = (0..8)
        .map(|i| {
            let hr = hr.clone();
            tokio::spawn(async move { hr.get(&format!("u{i}")).await })
        })
        .collect();
    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert!(east.counters.peak.load(Ordering::SeqCst) <= config.pool.max_objects);
    assert!(east.counters.created.load(Ordering::SeqCst) <= config.pool.max_objects);

    let stats = east.local.pool_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].active, 0);
    assert_eq!(stats[0].max_objects, 2);
}
