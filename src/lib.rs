//! # idlink
//!
//! Runtime for identity connectors.
//!
//! This crate bundles the workspace crates behind one dependency:
//!
//! - [`pool`]: bounded pools of expensive connector instances
//! - [`rpc`]: request correlation, connection groups, endpoints and load balancing
//! - [`log`]: environment-driven tracing setup
//!
//! and adds [`RuntimeConfig`], a TOML document configuring all three.
//!
//! ## Example
//!
//! ```rust,no_run
//! use idlink::RuntimeConfig;
//! use idlink::rpc::{Endpoint, LoadBalancer, LocalEndpoint};
//!
//! # fn example() -> idlink::ConfigResult<()> {
//! let config = RuntimeConfig::from_file("idlink.toml")?;
//! idlink::log::try_init(&config.log_config());
//!
//! let local = LocalEndpoint::builder()
//!     .with_pool_config(config.pool.clone())
//!     .build();
//! let balancer = LoadBalancer::from_config(&config.balancer, vec![Endpoint::Local(local)]);
//! assert!(balancer.is_operational());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod config;

pub use config::{ConfigError, ConfigResult, LogSection, RuntimeConfig};

pub use idlink_log as log;
pub use idlink_pool as pool;
pub use idlink_rpc as rpc;

pub use idlink_pool::{PoolConfig, ResourcePool};
pub use idlink_rpc::{
    BalancePolicy, BalancerConfig, ConnectionGroup, Endpoint, LoadBalancer, RpcError, RpcResult,
};
