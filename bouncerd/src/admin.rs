use async_trait::async_trait;
use reconciler::admin::{AdminError, BackendAdmin};
use std::collections::BTreeSet;
use tracing::info;

/// Logs the statements instead of running them, for deployments where the
/// backend's own operator owns users and databases.
pub struct LoggingAdmin;

#[async_trait]
impl BackendAdmin for LoggingAdmin {
    async fn ensure_auth_user(&self, username: &str, _password: &str) -> Result<(), AdminError> {
        info!(username, "ensure auth user and lookup function");
        Ok(())
    }

    async fn ensure_user(
        &self,
        username: &str,
        _password: &str,
        roles: &BTreeSet<String>,
    ) -> Result<(), AdminError> {
        info!(username, ?roles, "ensure user");
        Ok(())
    }

    async fn ensure_database(&self, database: &str, owner: &str) -> Result<(), AdminError> {
        info!(database, owner, "ensure database");
        Ok(())
    }

    async fn drop_user(&self, username: &str) -> Result<(), AdminError> {
        info!(username, "drop user");
        Ok(())
    }
}
