//! Merges facts from the backend, client relations and operator settings into
//! the fleet state.
//!
//! Every function takes the freshly loaded [`FleetState`] and a fact snapshot
//! and edits the state in place, touching only the entries owned by that
//! fact. Nothing is written anywhere: the caller runs the returned
//! [`BackendAction`]s and then publishes the state, or drops it on failure.
//!
//! Entries owned by the reconciler:
//! - `pg_master`: the backend primary
//! - `standby_<n>`: the n-th standby reported by the backend
//! - `relation_<id>`: a client relation's database, pointing at the primary
//! - `relation_<id>_readonly`: the same database spread over all standbys
//!
//! A relation may only claim its two names while no other relation holds
//! either of them.

use crate::admin::BackendAction;
use crate::config::PoolSettings;
use crate::document::{
    ConfigDocument, DATABASES, DatabaseEntry, DocumentError, EntryError, PGBOUNCER,
    is_valid_attribute,
};
use crate::facts::{BackendFacts, ClientFacts, Endpoint, RelationId};
use crate::hashing::{AuthMode, generate_password, hash_password};
use crate::limits::PoolSizes;
use crate::state::{ClientRecord, FleetState};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const PRIMARY_ENTRY: &str = "pg_master";
const STANDBY_PREFIX: &str = "standby_";
const READONLY_SUFFIX: &str = "_readonly";
const USERLIST_FILE: &str = "userlist.txt";

/// Database names a client may not request.
const RESERVED_DATABASES: &[&str] = &["pgbouncer", "template0", "template1"];

/// Settings that only make sense while a backend is connected.
const BACKEND_SETTINGS: &[&str] = &["auth_user", "auth_query", "auth_file"];

pub fn standby_entry(index: usize) -> String {
    format!("{STANDBY_PREFIX}{index}")
}

pub fn is_standby_entry(name: &str) -> bool {
    name.strip_prefix(STANDBY_PREFIX)
        .is_some_and(|index| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
}

pub fn readonly_entry(entry: &str) -> String {
    format!("{entry}{READONLY_SUFFIX}")
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    #[error("backend is not connected yet")]
    BackendUnavailable,

    #[error("relation {0} has not requested a database yet")]
    DatabaseNotRequested(RelationId),

    #[error("no configuration has been published yet")]
    NoPublishedConfig,
}

/// Result of a reconciliation function that did not fail.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub enum Plan {
    /// The state was updated; run these backend actions, then publish.
    Apply(Vec<BackendAction>),
    /// Required facts are missing. Nothing may be published for this event.
    Defer(DeferReason),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    #[error("database name {0} is reserved")]
    ReservedDatabase(String),

    #[error("entry {entry} already belongs to relation {owner}")]
    EntryTaken { entry: String, owner: RelationId },

    #[error("database name {0:?} cannot be written to the pooler config")]
    InvalidDatabaseName(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ReconcileError {
    /// Blocks the one relation, the rest of the document is unaffected.
    #[error("relation {relation} blocked: {reason}")]
    Conflict {
        relation: RelationId,
        reason: ConflictReason,
    },

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// Backend facts that cannot be expressed as connection attributes.
    #[error("database {entry}: {source}")]
    Entry { entry: String, source: EntryError },
}

/// Where the primary and standbys currently are, as recorded in the document.
#[derive(Debug, PartialEq, Eq)]
struct Topology {
    primary: Endpoint,
    standbys: Vec<Endpoint>,
}

impl Topology {
    fn from_document(doc: &ConfigDocument) -> Option<Self> {
        let primary = endpoint_of(doc.database(PRIMARY_ENTRY)?)?;

        let mut standbys: Vec<(usize, Endpoint)> = doc
            .databases()
            .filter(|(name, _)| is_standby_entry(name))
            .filter_map(|(name, entry)| {
                let index = name[STANDBY_PREFIX.len()..].parse().ok()?;
                Some((index, endpoint_of(entry)?))
            })
            .collect();
        standbys.sort_by_key(|(index, _)| *index);

        Some(Topology {
            primary,
            standbys: standbys.into_iter().map(|(_, endpoint)| endpoint).collect(),
        })
    }
}

fn endpoint_of(entry: &DatabaseEntry) -> Option<Endpoint> {
    let host = entry.get("host")?;
    let port = entry.get("port")?.parse().ok()?;
    Some(Endpoint::new(host, port))
}

pub struct Reconciler {
    app_name: String,
    config_dir: PathBuf,
    settings: PoolSettings,
}

impl Reconciler {
    pub fn new<A, P>(app_name: A, config_dir: P, settings: PoolSettings) -> Self
    where
        A: Into<String>,
        P: Into<PathBuf>,
    {
        Reconciler {
            // Service user names end up in SQL identifiers.
            app_name: app_name.into().replace('-', "_"),
            config_dir: config_dir.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn auth_user(&self) -> String {
        format!("pgbouncer_auth_{}", self.app_name)
    }

    pub fn stats_user(&self) -> String {
        format!("pgbouncer_stats_{}", self.app_name)
    }

    pub fn admin_user(&self) -> String {
        format!("pgbouncer_admin_{}", self.app_name)
    }

    fn auth_query(&self) -> String {
        format!(
            "SELECT username, password FROM {}.get_auth($1)",
            self.auth_user()
        )
    }

    /// Document used when nothing has been published yet.
    pub fn skeleton(&self) -> Result<ConfigDocument, DocumentError> {
        let dir = self.config_dir.display();
        let mut doc = ConfigDocument::new();

        let defaults = [
            ("listen_addr", "*".to_string()),
            ("listen_port", self.settings.listen_port.to_string()),
            ("auth_type", self.settings.auth_type.as_str().to_string()),
            ("pool_mode", self.settings.pool_mode.as_str().to_string()),
            ("max_client_conn", "10000".to_string()),
            ("ignore_startup_parameters", "extra_float_digits".to_string()),
            ("server_tls_sslmode", "prefer".to_string()),
            ("so_reuseport", "1".to_string()),
            ("unix_socket_dir", dir.to_string()),
            ("logfile", format!("{dir}/pgbouncer.log")),
            ("pidfile", format!("{dir}/pgbouncer.pid")),
            ("admin_users", String::new()),
            ("stats_users", String::new()),
        ];

        doc.ensure_section(DATABASES);
        doc.ensure_section(PGBOUNCER);

        for (key, value) in defaults {
            doc.set(PGBOUNCER, key, value)?;
        }
        PoolSizes::for_limit(self.settings.max_db_connections).apply(&mut doc)?;

        Ok(doc)
    }

    /// Writes operator settings, re-hashing the auth file when the auth mode
    /// changes, and makes sure the pooler's stats and admin users exist.
    pub fn apply_settings(
        &mut self,
        state: &mut FleetState,
        settings: &PoolSettings,
    ) -> Result<Plan, ReconcileError> {
        let previous_mode = current_auth_mode(&state.doc);
        let doc = &mut state.doc;

        doc.set(PGBOUNCER, "listen_port", settings.listen_port.to_string())?;
        doc.set(PGBOUNCER, "pool_mode", settings.pool_mode.as_str())?;
        doc.set(PGBOUNCER, "auth_type", settings.auth_type.as_str())?;
        PoolSizes::for_limit(settings.max_db_connections).apply(doc)?;

        if previous_mode != Some(settings.auth_type) {
            info!(auth_type = %settings.auth_type, "re-hashing auth file");
            rehash(state, settings.auth_type);
        }

        self.settings = settings.clone();
        self.ensure_pooler_users(state)?;

        Ok(Plan::Apply(Vec::new()))
    }

    /// Records the primary and standbys, drops standbys that disappeared and
    /// re-points every client entry at the new topology.
    pub fn apply_backend(
        &self,
        state: &mut FleetState,
        backend: &dyn BackendFacts,
    ) -> Result<Plan, ReconcileError> {
        let primary = match backend.primary() {
            Some(primary) if backend.connected() => primary.clone(),
            _ => return Ok(Plan::Defer(DeferReason::BackendUnavailable)),
        };
        let database = backend.database();

        state
            .doc
            .set_database(PRIMARY_ENTRY, connection(PRIMARY_ENTRY, &primary, database)?)?;

        let mut desired = BTreeSet::new();
        for (index, standby) in backend.standbys().iter().enumerate() {
            let name = standby_entry(index);
            state
                .doc
                .set_database(&name, connection(&name, standby, database)?)?;
            desired.insert(name);
        }

        for name in state.doc.database_names() {
            if is_standby_entry(&name) && !desired.contains(&name) {
                debug!(entry = %name, "removing stale standby");
                state.doc.remove_database(&name);
            }
        }

        let topology = Topology {
            primary,
            standbys: backend.standbys().to_vec(),
        };
        for (entry, record) in &state.clients {
            point_client(&mut state.doc, entry, record, &topology)?;
        }

        let auth_user = self.auth_user();
        let password = ensure_secret(state, &auth_user);
        let mode = self.auth_mode(&state.doc);
        state
            .userlist
            .upsert(&auth_user, hash_password(mode, &auth_user, &password));

        let auth_file = self.config_dir.join(USERLIST_FILE);
        state.doc.set(PGBOUNCER, "auth_user", &auth_user)?;
        state.doc.set(PGBOUNCER, "auth_query", self.auth_query())?;
        state
            .doc
            .set(PGBOUNCER, "auth_file", auth_file.display().to_string())?;

        self.ensure_pooler_users(state)?;

        let mut actions = vec![BackendAction::EnsureAuthUser {
            username: auth_user,
            password,
        }];
        // Client users may have been planned while the backend was away.
        for record in state.clients.values() {
            if let Some(password) = state.secrets.get(&record.username) {
                actions.extend(client_actions(record, password));
            }
        }

        Ok(Plan::Apply(actions))
    }

    /// Forgets the backend: primary, standbys and client entries go, and the
    /// auth settings are cleared so the pooler does not point at a dead host.
    /// Client records and secrets are kept for when a backend returns.
    pub fn remove_backend(&self, state: &mut FleetState) -> Plan {
        for name in state.doc.database_names() {
            if name == PRIMARY_ENTRY || is_standby_entry(&name) {
                state.doc.remove_database(&name);
            }
        }

        for entry in state.clients.keys() {
            state.doc.remove_database(entry);
            state.doc.remove_database(&readonly_entry(entry));
        }

        for key in BACKEND_SETTINGS {
            state.doc.delete(PGBOUNCER, key);
        }
        state.userlist.remove(&self.auth_user());

        Plan::Apply(Vec::new())
    }

    /// Adds or updates the database and user for one client relation.
    pub fn apply_client(
        &self,
        state: &mut FleetState,
        client: &dyn ClientFacts,
    ) -> Result<Plan, ReconcileError> {
        let relation = client.relation_identifier();

        let Some(database) = client.requested_database_name() else {
            return Ok(Plan::Defer(DeferReason::DatabaseNotRequested(
                relation.clone(),
            )));
        };

        if RESERVED_DATABASES.contains(&database) {
            return Err(ReconcileError::Conflict {
                relation: relation.clone(),
                reason: ConflictReason::ReservedDatabase(database.to_string()),
            });
        }

        if !is_valid_attribute(database) || database.contains('=') {
            return Err(ReconcileError::Conflict {
                relation: relation.clone(),
                reason: ConflictReason::InvalidDatabaseName(database.to_string()),
            });
        }

        let entry = relation.entry_name();
        if let Some(owner) = overlapping_owner(&state.clients, &entry, relation) {
            return Err(ReconcileError::Conflict {
                relation: relation.clone(),
                reason: ConflictReason::EntryTaken {
                    entry,
                    owner: owner.clone(),
                },
            });
        }

        let Some(topology) = Topology::from_document(&state.doc) else {
            return Ok(Plan::Defer(DeferReason::BackendUnavailable));
        };

        // The entry name doubles as the user name.
        let username = entry.clone();
        let password = ensure_secret(state, &username);
        let mode = self.auth_mode(&state.doc);
        state
            .userlist
            .upsert(&username, hash_password(mode, &username, &password));

        let record = ClientRecord {
            relation: relation.clone(),
            database: database.to_string(),
            username,
            roles: client.requested_roles().clone(),
        };
        point_client(&mut state.doc, &entry, &record, &topology)?;

        let actions = client_actions(&record, &password);
        state.clients.insert(entry, record);

        Ok(Plan::Apply(actions))
    }

    /// Removes a client relation's entries and credentials. The backend user
    /// is dropped only while a backend is connected.
    pub fn remove_client(&self, state: &mut FleetState, relation: &RelationId) -> Plan {
        let entry = relation.entry_name();

        if let Some(owner) = overlapping_owner(&state.clients, &entry, relation) {
            warn!(%relation, %owner, entry = %entry, "entry belongs to another relation, leaving it");
            return Plan::Apply(Vec::new());
        }

        let record = state.clients.remove(&entry);
        let username = record.map_or_else(|| entry.clone(), |record| record.username);

        state.doc.remove_database(&entry);
        state.doc.remove_database(&readonly_entry(&entry));
        state.userlist.remove(&username);
        state.secrets.remove(&username);

        let mut actions = Vec::new();
        if state.doc.database(PRIMARY_ENTRY).is_some() {
            actions.push(BackendAction::DropUser { username });
        }
        Plan::Apply(actions)
    }

    fn ensure_pooler_users(&self, state: &mut FleetState) -> Result<(), ReconcileError> {
        let mode = self.auth_mode(&state.doc);

        for (username, list) in [
            (self.stats_user(), "stats_users"),
            (self.admin_user(), "admin_users"),
        ] {
            let password = ensure_secret(state, &username);
            state
                .userlist
                .upsert(&username, hash_password(mode, &username, &password));
            state.doc.add_to_list(list, &username)?;
        }
        Ok(())
    }

    fn auth_mode(&self, doc: &ConfigDocument) -> AuthMode {
        current_auth_mode(doc).unwrap_or(self.settings.auth_type)
    }
}

fn current_auth_mode(doc: &ConfigDocument) -> Option<AuthMode> {
    doc.get_scalar(PGBOUNCER, "auth_type")?.parse().ok()
}

/// The other relation already holding `entry` or its read-only companion,
/// under either of its own two names.
fn overlapping_owner<'a>(
    clients: &'a BTreeMap<String, ClientRecord>,
    entry: &str,
    relation: &RelationId,
) -> Option<&'a RelationId> {
    let wanted = [entry.to_string(), readonly_entry(entry)];
    clients
        .iter()
        .filter(|(_, record)| record.relation != *relation)
        .find(|(taken, _)| wanted.contains(taken) || wanted.contains(&readonly_entry(taken)))
        .map(|(_, record)| &record.relation)
}

fn connection(name: &str, endpoint: &Endpoint, database: &str) -> Result<DatabaseEntry, ReconcileError> {
    DatabaseEntry::new()
        .with("host", &endpoint.host)
        .and_then(|entry| entry.with("port", endpoint.port.to_string()))
        .and_then(|entry| entry.with("dbname", database))
        .map_err(|source| ReconcileError::Entry {
            entry: name.to_string(),
            source,
        })
}

fn point_client(
    doc: &mut ConfigDocument,
    entry: &str,
    record: &ClientRecord,
    topology: &Topology,
) -> Result<(), ReconcileError> {
    doc.set_database(entry, connection(entry, &topology.primary, &record.database)?)?;

    let readonly = readonly_entry(entry);
    let Some(first) = topology.standbys.first() else {
        doc.remove_database(&readonly);
        return Ok(());
    };

    // One entry carries a single port for all of its hosts.
    if topology.standbys.iter().any(|standby| standby.port != first.port) {
        warn!(entry = %readonly, "standbys listen on different ports, dropping read-only entry");
        doc.remove_database(&readonly);
        return Ok(());
    }

    let hosts: Vec<&str> = topology
        .standbys
        .iter()
        .map(|standby| standby.host.as_str())
        .collect();
    let endpoint = Endpoint::new(hosts.join(","), first.port);
    doc.set_database(&readonly, connection(&readonly, &endpoint, &record.database)?)?;
    Ok(())
}

fn client_actions(record: &ClientRecord, password: &str) -> Vec<BackendAction> {
    vec![
        BackendAction::EnsureUser {
            username: record.username.clone(),
            password: password.to_string(),
            roles: record.roles.clone(),
        },
        BackendAction::EnsureDatabase {
            database: record.database.clone(),
            owner: record.username.clone(),
        },
    ]
}

/// Returns the stored password for `username`, generating one only if none
/// exists yet.
fn ensure_secret(state: &mut FleetState, username: &str) -> String {
    state
        .secrets
        .entry(username.to_string())
        .or_insert_with(generate_password)
        .clone()
}

fn rehash(state: &mut FleetState, mode: AuthMode) {
    let usernames: Vec<String> = state.userlist.usernames().map(String::from).collect();

    for username in usernames {
        match state.secrets.get(&username) {
            Some(password) => {
                let hash = hash_password(mode, &username, password);
                state.userlist.upsert(username, hash);
            }
            None => warn!(username = %username, "no stored password, keeping existing hash"),
        }
    }
}
