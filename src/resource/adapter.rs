//! The seam between the engine and the system being managed.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AdapterError, ConvergentError, Result};
use crate::job::JobContext;

use super::kind::ResourceKind;
use super::template::Resource;

/// Reads and writes one resource kind.
///
/// Adapters translate their native failures into the error taxonomy before
/// returning, and take the per-kind lock through the context for the
/// duration of one call.
#[async_trait]
pub trait ResourceAdapter<R: Resource>: Send + Sync {
    /// Reads the actual state of the resource the template identifies.
    ///
    /// A resource that is not present is returned as [`Resource::absent`].
    async fn collect(&self, template: &R, ctx: &JobContext) -> Result<R>;

    /// Brings the resource to the template's state.
    ///
    /// Applying the same template twice must be a no-op the second time.
    /// With `simulation` set nothing is changed; the adapter only logs what
    /// it would do.
    async fn configure(&self, template: &R, simulation: bool, ctx: &JobContext) -> Result<()>;
}

/// Adapters keyed by resource kind.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<ResourceKind, Arc<dyn Any + Send + Sync>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the adapter for `R`, replacing any previous one.
    pub fn register<R: Resource>(&mut self, adapter: Arc<dyn ResourceAdapter<R>>) {
        self.adapters.insert(R::KIND, Arc::new(adapter));
    }

    /// Returns the adapter for `R`.
    ///
    /// # Errors
    ///
    /// Returns `NotRegistered` if no adapter was registered for the kind.
    pub fn get<R: Resource>(&self) -> Result<Arc<dyn ResourceAdapter<R>>> {
        self.adapters
            .get(&R::KIND)
            .and_then(|entry| entry.downcast_ref::<Arc<dyn ResourceAdapter<R>>>())
            .cloned()
            .ok_or_else(|| {
                ConvergentError::Adapter(AdapterError::NotRegistered {
                    kind: R::KIND.to_string(),
                })
            })
    }

    /// Kinds with a registered adapter, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = self.adapters.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
