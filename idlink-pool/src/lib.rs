//! # idlink Pool
//!
//! A bounded, concurrent pool for expensive stateful objects such as
//! connector instances holding a directory session.
//!
//! ## Features
//!
//! - Hard cap on live objects (`max_objects`), enforced by a semaphore
//! - Idle reuse before construction, oldest idle object first
//! - Eviction of idle objects above `max_idle` or older than
//!   `min_evictable_idle_millis`
//! - First/last object callbacks for shared handler state
//! - Bounded waiting with `max_wait_seconds`
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use idlink_pool::{HandlerError, ObjectPoolHandler, PoolConfig, ResourcePool};
//!
//! struct Sessions;
//!
//! #[async_trait]
//! impl ObjectPoolHandler for Sessions {
//!     type Object = String;
//!
//!     async fn make_object(&self) -> Result<String, HandlerError> {
//!         Ok("session".to_string())
//!     }
//! }
//!
//! # async fn example() -> idlink_pool::PoolResult<()> {
//! let pool = ResourcePool::new(Sessions, PoolConfig::new(4))?;
//! let session = pool.borrow().await?;
//! assert_eq!(session.as_str(), "session");
//! pool.release(session).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod config;
mod error;
mod handler;
mod pool;

pub use config::PoolConfig;
pub use error::{HandlerError, PoolError, PoolResult};
pub use handler::ObjectPoolHandler;
pub use pool::{PoolEntry, PoolStats, ResourcePool};
