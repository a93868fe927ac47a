//! runs::factory
//!
//! Runs API selection and creation.
//!
//! Commands use [`create_runs_api`] instead of constructing a transport
//! directly, so the engine only ever sees `Arc<dyn RunsApi>`.

use std::sync::Arc;

use super::http::HttpRunsApi;
use super::traits::{ApiError, RunsApi};
use crate::core::config::Config;

/// Create the runs API client for the configured host.
///
/// # Errors
///
/// - `ApiError::AuthRequired` if no token is configured
pub fn create_runs_api(config: &Config) -> Result<Arc<dyn RunsApi>, ApiError> {
    let token = config.token().ok_or(ApiError::AuthRequired)?;
    let hostname = config.hostname();
    tracing::debug!(%hostname, "using http runs API");
    Ok(Arc::new(HttpRunsApi::new(hostname, token)))
}
