//! Manager configuration.

/// Configuration for [`WorkflowManager`](crate::WorkflowManager).
///
/// # Example
///
/// ```
/// use stageflow::ManagerConfig;
///
/// let config = ManagerConfig {
///     record_narrations: false,
///     ..Default::default()
/// };
/// assert!(config.check_etag);
/// ```
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Append every persisted envelope to the mutation log.
    ///
    /// The log is what [`fetch_mutations`](crate::WorkflowManager::fetch_mutations)
    /// reads; records are written either way.
    /// Default: `true`.
    pub record_mutation_log: bool,

    /// Persist narrations alongside the batch they were produced in.
    /// Default: `true`.
    pub record_narrations: bool,

    /// Reject batches whose workflow was changed since the state was loaded.
    ///
    /// Batches that create the workflow are never checked.
    /// Default: `true`.
    pub check_etag: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            record_mutation_log: true,
            record_narrations: true,
            check_etag: true,
        }
    }
}
