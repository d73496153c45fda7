//! Handler trait that creates, tests and disposes pooled objects.

use crate::config::PoolConfig;
use crate::error::HandlerError;
use async_trait::async_trait;

/// Lifecycle callbacks for the objects held by a [`ResourcePool`](crate::ResourcePool).
///
/// The first object is built with [`make_first_object`](Self::make_first_object)
/// and the last one is torn down with
/// [`dispose_last_object`](Self::dispose_last_object), which lets a handler set
/// up and release state shared by every object of the pool.
#[async_trait]
pub trait ObjectPoolHandler: Send + Sync + 'static {
    /// The pooled object type.
    type Object: Send + Sync + 'static;

    /// Normalize or reject the configuration before the pool is built.
    fn validate(&self, config: PoolConfig) -> Result<PoolConfig, HandlerError> {
        Ok(config)
    }

    /// Create the object that brings the live set from empty to one.
    async fn make_first_object(&self) -> Result<Self::Object, HandlerError> {
        self.make_object().await
    }

    /// Create a new object.
    async fn make_object(&self) -> Result<Self::Object, HandlerError>;

    /// Check that an object is still usable.
    async fn test_object(&self, object: &Self::Object) -> Result<(), HandlerError> {
        let _ = object;
        Ok(())
    }

    /// Dispose an object.
    fn dispose_object(&self, object: Self::Object) -> Result<(), HandlerError> {
        drop(object);
        Ok(())
    }

    /// Dispose the last live object.
    fn dispose_last_object(&self, object: Self::Object) -> Result<(), HandlerError> {
        self.dispose_object(object)
    }
}
