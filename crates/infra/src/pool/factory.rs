//! External constructor/destructor for pooled engine resources.

use std::sync::Arc;

use async_trait::async_trait;

use scribeflow_core::ResourceClass;

/// Failure to construct or tear down a resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ResourceError {
    pub message: String,
}

impl ResourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Builds and releases the expensive handles the pool manages (e.g. loading a
/// model into an engine context).
///
/// Only called on a pool miss, on eviction, or on explicit invalidation.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    async fn create(&self, class: &ResourceClass) -> Result<Self::Handle, ResourceError>;

    async fn destroy(
        &self,
        class: &ResourceClass,
        handle: Arc<Self::Handle>,
    ) -> Result<(), ResourceError>;
}

#[async_trait]
impl<F> ResourceFactory for Arc<F>
where
    F: ResourceFactory + ?Sized,
{
    type Handle = F::Handle;

    async fn create(&self, class: &ResourceClass) -> Result<Self::Handle, ResourceError> {
        (**self).create(class).await
    }

    async fn destroy(
        &self,
        class: &ResourceClass,
        handle: Arc<Self::Handle>,
    ) -> Result<(), ResourceError> {
        (**self).destroy(class, handle).await
    }
}
