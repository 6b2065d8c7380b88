//! Read-only views over facts published by other applications.
//!
//! The reconciler never mutates these. Snapshots are deserialized from the
//! event that delivered them and live for a single pass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

/// Opaque, stable identifier of a client relation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationId(String);

impl RelationId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        RelationId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name used for both the relation's database entry and its user.
    ///
    /// Characters outside `[A-Za-z0-9_]` become `_`, so distinct ids can map to
    /// the same name. The reconciler rejects such collisions.
    pub fn entry_name(&self) -> String {
        let sanitized: String = self
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("relation_{sanitized}")
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Topology published by the backend database cluster.
pub trait BackendFacts {
    fn connected(&self) -> bool;
    fn primary(&self) -> Option<&Endpoint>;
    /// Read replicas, in the order the backend reports them.
    fn standbys(&self) -> &[Endpoint];
    /// Database the pooler itself connects to.
    fn database(&self) -> &str;
}

/// What a client application asked for on its relation.
pub trait ClientFacts {
    fn relation_identifier(&self) -> &RelationId;
    fn requested_database_name(&self) -> Option<&str>;
    fn requested_roles(&self) -> &BTreeSet<String>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSnapshot {
    #[serde(default)]
    pub connected: bool,
    pub primary: Option<Endpoint>,
    #[serde(default)]
    pub standbys: Vec<Endpoint>,
    pub database: String,
}

impl BackendFacts for BackendSnapshot {
    fn connected(&self) -> bool {
        self.connected
    }

    fn primary(&self) -> Option<&Endpoint> {
        self.primary.as_ref()
    }

    fn standbys(&self) -> &[Endpoint] {
        &self.standbys
    }

    fn database(&self) -> &str {
        &self.database
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub relation: RelationId,
    pub database: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl ClientFacts for ClientRequest {
    fn relation_identifier(&self) -> &RelationId {
        &self.relation
    }

    fn requested_database_name(&self) -> Option<&str> {
        self.database.as_deref().filter(|name| !name.is_empty())
    }

    fn requested_roles(&self) -> &BTreeSet<String> {
        &self.roles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_name() {
        assert_eq!(RelationId::new("7").entry_name(), "relation_7");
        assert_eq!(RelationId::new("rel-7").entry_name(), "relation_rel_7");
        assert_eq!(
            RelationId::new("app:db/1").entry_name(),
            "relation_app_db_1"
        );
    }

    #[test]
    fn test_empty_database_is_not_a_request() {
        let request = ClientRequest {
            relation: RelationId::new("1"),
            database: Some(String::new()),
            roles: BTreeSet::new(),
        };
        assert_eq!(request.requested_database_name(), None);
    }

    #[test]
    fn test_backend_snapshot_deserialize() {
        let snapshot: BackendSnapshot = serde_json::from_str(
            r#"{
                "connected": true,
                "primary": {"host": "10.0.0.1", "port": 5432},
                "standbys": [{"host": "10.0.0.2", "port": 5432}],
                "database": "pgbouncer"
            }"#,
        )
        .unwrap();

        assert!(snapshot.connected());
        assert_eq!(snapshot.primary(), Some(&Endpoint::new("10.0.0.1", 5432)));
        assert_eq!(snapshot.standbys().len(), 1);
        assert_eq!(snapshot.database(), "pgbouncer");
    }
}
