use thiserror::Error;

use crate::db::DbError;

/// Failures that can stop work for a tenant or a cycle.
///
/// Only `AuthExpired` is tenant-fatal. Model failures never leave the analysis
/// service: they degrade to the deterministic fallback and exist here so the
/// degradation can be logged and reported uniformly.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("all credential grants failed for tenant {tenant_id}; tenant deactivated")]
    AuthExpired { tenant_id: String },

    #[error("mail provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("generative model rate limited")]
    ModelRateLimited,

    #[error("model output could not be parsed: {detail}")]
    MalformedModelOutput { detail: String },

    #[error("tenant not found: {0}")]
    UnknownTenant(String),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl PipelineError {
    pub fn is_tenant_fatal(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }
}
