use crate::{ModelHandle, ModelStatusEntry, ServeError};

/// Source of model signatures and version status.
///
/// Populated by model lifecycle events outside the slot protocol; the
/// serving path only reads from it.
pub trait ModelDirectory: Send + Sync {
    /// Resolves a model and optional version to an engine handle.
    /// `None` selects the newest available version.
    fn resolve(&self, name: &str, version: Option<u64>) -> Result<ModelHandle, ServeError>;

    /// Status of every version of `name`, or of the single requested version.
    fn statuses(
        &self,
        name: &str,
        version: Option<u64>,
    ) -> Result<Vec<ModelStatusEntry>, ServeError>;
}
