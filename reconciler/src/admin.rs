//! Changes the reconciler needs made inside the backend database.
//!
//! The reconciler only plans these. They run against the backend through a
//! [`BackendAdmin`] before anything is published, so a failed statement leaves
//! the published configuration untouched.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

#[derive(Clone, PartialEq, Eq)]
pub enum BackendAction {
    /// User the pooler authenticates with to run its auth query, plus the
    /// lookup function that query calls.
    EnsureAuthUser { username: String, password: String },
    EnsureUser {
        username: String,
        password: String,
        roles: BTreeSet<String>,
    },
    EnsureDatabase { database: String, owner: String },
    DropUser { username: String },
}

// Passwords stay out of logs.
impl fmt::Debug for BackendAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAction::EnsureAuthUser { username, .. } => f
                .debug_struct("EnsureAuthUser")
                .field("username", username)
                .finish_non_exhaustive(),
            BackendAction::EnsureUser {
                username, roles, ..
            } => f
                .debug_struct("EnsureUser")
                .field("username", username)
                .field("roles", roles)
                .finish_non_exhaustive(),
            BackendAction::EnsureDatabase { database, owner } => f
                .debug_struct("EnsureDatabase")
                .field("database", database)
                .field("owner", owner)
                .finish(),
            BackendAction::DropUser { username } => f
                .debug_struct("DropUser")
                .field("username", username)
                .finish(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AdminError {
    #[error("{kind} {name} does not exist")]
    NotFound { kind: &'static str, name: String },

    #[error("backend connection failed: {0}")]
    Connection(String),

    #[error("statement failed: {0}")]
    Statement(String),
}

/// Runs setup statements against the backend. Every `ensure_*` call must be
/// safe to repeat.
#[async_trait]
pub trait BackendAdmin: Send + Sync {
    async fn ensure_auth_user(&self, username: &str, password: &str) -> Result<(), AdminError>;

    async fn ensure_user(
        &self,
        username: &str,
        password: &str,
        roles: &BTreeSet<String>,
    ) -> Result<(), AdminError>;

    async fn ensure_database(&self, database: &str, owner: &str) -> Result<(), AdminError>;

    async fn drop_user(&self, username: &str) -> Result<(), AdminError>;
}

/// Runs `actions` in order, stopping at the first failure. Dropping a user
/// that is already gone counts as success.
pub async fn execute(admin: &dyn BackendAdmin, actions: &[BackendAction]) -> Result<(), AdminError> {
    for action in actions {
        debug!(?action, "running backend action");

        match action {
            BackendAction::EnsureAuthUser { username, password } => {
                admin.ensure_auth_user(username, password).await?
            }
            BackendAction::EnsureUser {
                username,
                password,
                roles,
            } => admin.ensure_user(username, password, roles).await?,
            BackendAction::EnsureDatabase { database, owner } => {
                admin.ensure_database(database, owner).await?
            }
            BackendAction::DropUser { username } => match admin.drop_user(username).await {
                Ok(()) => {}
                Err(AdminError::NotFound { .. }) => {
                    info!(username = %username, "user already absent from backend");
                }
                Err(err) => return Err(err),
            },
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingAdmin;
    use super::*;

    #[tokio::test]
    async fn test_execute_in_order() {
        let admin = RecordingAdmin::default();
        let actions = vec![
            BackendAction::EnsureUser {
                username: "relation_1".into(),
                password: "pw".into(),
                roles: BTreeSet::from(["SUPERUSER".to_string()]),
            },
            BackendAction::EnsureDatabase {
                database: "app".into(),
                owner: "relation_1".into(),
            },
        ];

        execute(&admin, &actions).await.unwrap();
        assert_eq!(
            *admin.calls.lock(),
            vec!["user relation_1 [SUPERUSER]", "database app owner relation_1"]
        );
    }

    #[tokio::test]
    async fn test_drop_missing_user_is_success() {
        let admin = RecordingAdmin::default();
        admin.missing_users.lock().insert("gone".into());

        let actions = vec![
            BackendAction::DropUser {
                username: "gone".into(),
            },
            BackendAction::DropUser {
                username: "present".into(),
            },
        ];

        execute(&admin, &actions).await.unwrap();
        assert_eq!(*admin.calls.lock(), vec!["drop present"]);
    }

    #[tokio::test]
    async fn test_connection_errors_propagate() {
        let admin = RecordingAdmin::default();
        *admin.fail_with_connection_error.lock() = true;

        let result = execute(
            &admin,
            &[BackendAction::DropUser {
                username: "u".into(),
            }],
        )
        .await;
        assert!(matches!(result, Err(AdminError::Connection(_))));
    }

    #[test]
    fn test_debug_hides_passwords() {
        let action = BackendAction::EnsureAuthUser {
            username: "auth".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{action:?}");
        assert!(rendered.contains("auth"));
        assert!(!rendered.contains("hunter2"));
    }
}
