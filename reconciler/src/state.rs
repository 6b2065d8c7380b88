//! Everything one reconciliation pass reads and writes, loaded fresh from the
//! fleet scope at the start of the pass.

use crate::document::{ConfigDocument, DocumentError};
use crate::facts::RelationId;
use crate::store::{ReplicatedStore, Scope, StoreError};
use crate::userlist::Userlist;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const CONFIG_KEY: &str = "pgbouncer.ini";
pub const USERLIST_KEY: &str = "userlist.txt";
pub const SECRETS_KEY: &str = "secrets.json";
pub const CLIENTS_KEY: &str = "clients.json";

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("malformed config document: {0}")]
    Document(#[from] DocumentError),

    #[error("malformed {key}: {source}")]
    Blob {
        key: &'static str,
        source: serde_json::Error,
    },
}

/// A client relation known to the fleet, keyed by its entry name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub relation: RelationId,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FleetState {
    pub doc: ConfigDocument,
    pub userlist: Userlist,
    /// Plaintext passwords by username. Hashes are re-derived from these.
    pub secrets: BTreeMap<String, String>,
    pub clients: BTreeMap<String, ClientRecord>,
}

impl FleetState {
    /// Reads the published state. A missing config falls back to `skeleton`;
    /// a malformed one is an error, never silently replaced.
    pub fn load<F>(store: &dyn ReplicatedStore, skeleton: F) -> Result<Self, StateError>
    where
        F: FnOnce() -> Result<ConfigDocument, DocumentError>,
    {
        let doc: ConfigDocument = match store.get(Scope::Fleet, CONFIG_KEY)? {
            Some(text) => text.parse()?,
            None => skeleton()?,
        };

        let userlist = store
            .get(Scope::Fleet, USERLIST_KEY)?
            .map(|text| Userlist::parse(&text))
            .unwrap_or_default();

        Ok(FleetState {
            doc,
            userlist,
            secrets: load_blob(store, SECRETS_KEY)?,
            clients: load_blob(store, CLIENTS_KEY)?,
        })
    }

    pub fn secrets_json(&self) -> Result<String, StateError> {
        serde_json::to_string(&self.secrets).map_err(|source| StateError::Blob {
            key: SECRETS_KEY,
            source,
        })
    }

    pub fn clients_json(&self) -> Result<String, StateError> {
        serde_json::to_string(&self.clients).map_err(|source| StateError::Blob {
            key: CLIENTS_KEY,
            source,
        })
    }
}

fn load_blob<T>(store: &dyn ReplicatedStore, key: &'static str) -> Result<T, StateError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match store.get(Scope::Fleet, key)? {
        Some(text) => serde_json::from_str(&text).map_err(|source| StateError::Blob { key, source }),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PGBOUNCER;
    use crate::store::MemoryStore;

    fn skeleton() -> Result<ConfigDocument, DocumentError> {
        "[pgbouncer]\nlisten_port = 6432\n".parse()
    }

    #[test]
    fn test_load_empty_store_uses_skeleton() {
        let store = MemoryStore::new();
        let state = FleetState::load(&store, skeleton).unwrap();

        assert_eq!(state.doc, skeleton().unwrap());
        assert!(state.userlist.is_empty());
        assert!(state.secrets.is_empty());
        assert!(state.clients.is_empty());
    }

    #[test]
    fn test_load_published_state() {
        let store = MemoryStore::new();
        store
            .set(Scope::Fleet, CONFIG_KEY, "[pgbouncer]\nlisten_port = 7000\n")
            .unwrap();
        store
            .set(Scope::Fleet, USERLIST_KEY, "\"u\" \"md5x\"")
            .unwrap();
        store
            .set(Scope::Fleet, SECRETS_KEY, r#"{"u":"pw"}"#)
            .unwrap();

        let state = FleetState::load(&store, skeleton).unwrap();
        assert_eq!(state.doc.get_scalar(PGBOUNCER, "listen_port"), Some("7000"));
        assert_eq!(state.userlist.get("u"), Some("md5x"));
        assert_eq!(state.secrets.get("u").map(String::as_str), Some("pw"));
    }

    #[test]
    fn test_malformed_state_is_fatal() {
        let store = MemoryStore::new();
        store
            .set(Scope::Fleet, CONFIG_KEY, "[pgbouncer\n")
            .unwrap();
        assert!(matches!(
            FleetState::load(&store, skeleton),
            Err(StateError::Document(_))
        ));

        let store = MemoryStore::new();
        store.set(Scope::Fleet, CLIENTS_KEY, "not json").unwrap();
        assert!(matches!(
            FleetState::load(&store, skeleton),
            Err(StateError::Blob {
                key: CLIENTS_KEY,
                ..
            })
        ));
    }

    #[test]
    fn test_blobs_round_trip() {
        let mut state = FleetState::default();
        state.secrets.insert("u".into(), "pw".into());
        state.clients.insert(
            "relation_1".into(),
            ClientRecord {
                relation: RelationId::new("1"),
                database: "app".into(),
                username: "relation_1".into(),
                roles: BTreeSet::from(["SUPERUSER".to_string()]),
            },
        );

        let store = MemoryStore::new();
        store
            .set(Scope::Fleet, SECRETS_KEY, &state.secrets_json().unwrap())
            .unwrap();
        store
            .set(Scope::Fleet, CLIENTS_KEY, &state.clients_json().unwrap())
            .unwrap();

        let loaded = FleetState::load(&store, || Ok(ConfigDocument::new())).unwrap();
        assert_eq!(loaded.secrets, state.secrets);
        assert_eq!(loaded.clients, state.clients);
    }
}
