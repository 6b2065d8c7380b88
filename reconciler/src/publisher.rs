//! Publishes the reconciled state: to the fleet scope of the replicated store
//! (leader only), and to the local files each pooler worker reads.
//!
//! Local files are always rendered from the fleet copy, so a leader and its
//! followers run byte-identical configurations.

use crate::document::{ConfigDocument, DocumentError, PGBOUNCER};
use crate::limits::worker_pool_sizes;
use crate::metrics_defs::{PEER_SYNC_SKIPPED, PUBLISH_RELOADS};
use crate::state::{CLIENTS_KEY, CONFIG_KEY, FleetState, SECRETS_KEY, StateError, USERLIST_KEY};
use crate::store::{ReplicatedStore, Scope, StoreError, write_atomic};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use shared::counter;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Process scope key holding the hash of the last locally rendered content.
const SYNCED_HASH_KEY: &str = "synced_hash";
const INSTANCE_PREFIX: &str = "instance_";

pub trait Election: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Leadership decided by configuration, switchable at runtime.
pub struct StaticElection {
    leader: AtomicBool,
}

impl StaticElection {
    pub fn new(leader: bool) -> Self {
        StaticElection {
            leader: AtomicBool::new(leader),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Relaxed);
    }
}

impl Election for StaticElection {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }
}

/// Proof that this process held the leadership when the pass started.
/// Required for every write to the fleet scope.
#[derive(Debug)]
pub struct LeaderWriteGate {
    _private: (),
}

impl LeaderWriteGate {
    pub fn acquire(election: &dyn Election) -> Option<Self> {
        election
            .is_leader()
            .then_some(LeaderWriteGate { _private: () })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReloadError {
    #[error("failed to start reload for instance {instance}: {source}")]
    Spawn { instance: usize, source: io::Error },

    #[error("reload for instance {instance} exited with {status}")]
    Failed { instance: usize, status: String },
}

/// Tells the local pooler workers to pick up new files.
#[async_trait]
pub trait Reloader: Send + Sync {
    async fn reload(&self, instances: usize) -> Result<(), ReloadError>;
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("replicated config is malformed: {0}")]
    Malformed(#[from] DocumentError),

    #[error("failed to write {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("reload failed: {0}")]
    Reload(#[from] ReloadError),
}

impl PublishError {
    fn io(path: &Path, source: io::Error) -> Self {
        PublishError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Published {
    Reloaded,
    /// Local files already matched, nothing was reloaded.
    Unchanged,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Synced {
    Reloaded,
    Unchanged,
    /// The leader has not published anything yet.
    NoData,
}

/// Paths of the rendered files under the config directory.
#[derive(Clone, Debug)]
pub struct Layout {
    config_dir: PathBuf,
}

impl Layout {
    pub fn new<P: Into<PathBuf>>(config_dir: P) -> Self {
        Layout {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_KEY)
    }

    pub fn userlist_path(&self) -> PathBuf {
        self.config_dir.join(USERLIST_KEY)
    }

    pub fn instance_dir(&self, instance: usize) -> PathBuf {
        self.config_dir.join(format!("{INSTANCE_PREFIX}{instance}"))
    }

    pub fn instance_config_path(&self, instance: usize) -> PathBuf {
        self.instance_dir(instance).join(CONFIG_KEY)
    }
}

pub struct Publisher {
    store: Arc<dyn ReplicatedStore>,
    layout: Layout,
    reloader: Arc<dyn Reloader>,
}

impl Publisher {
    pub fn new(store: Arc<dyn ReplicatedStore>, layout: Layout, reloader: Arc<dyn Reloader>) -> Self {
        Publisher {
            store,
            layout,
            reloader,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Replicates `state` to the fleet, then renders it locally and reloads.
    ///
    /// The config goes last, after the secrets and client registry it was
    /// derived from and the auth file it references, both in the store and on
    /// disk. A failed write therefore never leaves a new config replicated
    /// without them.
    pub async fn write(
        &self,
        _gate: &LeaderWriteGate,
        state: &FleetState,
        instances: usize,
    ) -> Result<Published, PublishError> {
        let config = state.doc.to_string();
        let userlist = state.userlist.to_string();

        self.store
            .set(Scope::Fleet, SECRETS_KEY, &state.secrets_json()?)?;
        self.store
            .set(Scope::Fleet, CLIENTS_KEY, &state.clients_json()?)?;
        self.store.set(Scope::Fleet, USERLIST_KEY, &userlist)?;
        self.store.set(Scope::Fleet, CONFIG_KEY, &config)?;

        if self.render(&state.doc, &config, &userlist, instances).await? {
            Ok(Published::Reloaded)
        } else {
            Ok(Published::Unchanged)
        }
    }

    /// Renders the fleet copy locally. Skipped when the content and the
    /// worker count match the last render.
    pub async fn sync_from_peer(&self, instances: usize) -> Result<Synced, PublishError> {
        let Some(config) = self.store.get(Scope::Fleet, CONFIG_KEY)? else {
            return Ok(Synced::NoData);
        };
        let userlist = self
            .store
            .get(Scope::Fleet, USERLIST_KEY)?
            .unwrap_or_default();

        // Validated before anything touches the local files.
        let doc: ConfigDocument = config.parse()?;

        if self.render(&doc, &config, &userlist, instances).await? {
            Ok(Synced::Reloaded)
        } else {
            counter!(PEER_SYNC_SKIPPED).increment(1);
            Ok(Synced::Unchanged)
        }
    }

    async fn render(
        &self,
        doc: &ConfigDocument,
        config: &str,
        userlist: &str,
        instances: usize,
    ) -> Result<bool, PublishError> {
        let hash = content_hash(config, userlist, instances);

        let synced = self.store.get(Scope::Process, SYNCED_HASH_KEY)?;
        if synced.as_deref() == Some(hash.as_str()) && self.layout.config_path().exists() {
            debug!(%hash, "local files up to date");
            return Ok(false);
        }

        write_file(&self.layout.userlist_path(), userlist)?;
        write_file(&self.layout.config_path(), config)?;
        self.render_workers(doc, instances)?;

        self.reloader.reload(instances).await?;
        // Recorded only after a successful reload, so a failed one is retried.
        self.store.set(Scope::Process, SYNCED_HASH_KEY, &hash)?;

        counter!(PUBLISH_RELOADS).increment(1);
        info!(%hash, instances, "published configuration");
        Ok(true)
    }

    fn render_workers(&self, doc: &ConfigDocument, instances: usize) -> Result<(), PublishError> {
        let total = doc
            .get_scalar(PGBOUNCER, "max_db_connections")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        for (instance, sizes) in worker_pool_sizes(total, instances).into_iter().enumerate() {
            let dir = self.layout.instance_dir(instance);
            let dir_name = dir.display().to_string();

            let mut worker = doc.clone();
            worker.set(PGBOUNCER, "unix_socket_dir", &dir_name)?;
            worker.set(PGBOUNCER, "pidfile", format!("{dir_name}/pgbouncer.pid"))?;
            worker.set(PGBOUNCER, "logfile", format!("{dir_name}/pgbouncer.log"))?;
            sizes.apply(&mut worker)?;

            write_file(
                &self.layout.instance_config_path(instance),
                &worker.to_string(),
            )?;
        }

        self.remove_stale_workers(instances)
    }

    fn remove_stale_workers(&self, instances: usize) -> Result<(), PublishError> {
        let dir = &self.layout.config_dir;
        let entries = fs::read_dir(dir).map_err(|err| PublishError::io(dir, err))?;

        for entry in entries {
            let entry = entry.map_err(|err| PublishError::io(dir, err))?;
            let name = entry.file_name();
            let Some(index) = name
                .to_str()
                .and_then(|name| name.strip_prefix(INSTANCE_PREFIX))
                .and_then(|index| index.parse::<usize>().ok())
            else {
                continue;
            };

            if index >= instances {
                let path = entry.path();
                debug!(path = %path.display(), "removing stale worker directory");
                fs::remove_dir_all(&path).map_err(|err| PublishError::io(&path, err))?;
            }
        }
        Ok(())
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), PublishError> {
    write_atomic(path, contents).map_err(|err| PublishError::io(path, err))
}

fn content_hash(config: &str, userlist: &str, instances: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.as_bytes());
    hasher.update(b"\0");
    hasher.update(userlist.as_bytes());
    hasher.update(b"\0");
    hasher.update(instances.to_le_bytes());
    format!("{:x}", hasher.finalize())
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingReloader;
    use super::*;
    use crate::document::DatabaseEntry;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Arc<MemoryStore>,
        reloader: Arc<RecordingReloader>,
        publisher: Publisher,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let reloader = Arc::new(RecordingReloader::default());
        let publisher = Publisher::new(store.clone(), Layout::new(dir.path()), reloader.clone());
        Fixture {
            dir,
            store,
            reloader,
            publisher,
        }
    }

    fn state() -> FleetState {
        let mut state = FleetState::default();
        let primary: DatabaseEntry = "host=10.0.0.1 port=5432 dbname=test".parse().unwrap();
        state.doc.set_database("pg_master", primary).unwrap();
        state.doc.set(PGBOUNCER, "max_db_connections", "10").unwrap();
        state.userlist.upsert("alice", "md5abc");
        state
    }

    /// Refuses every write of one fleet key.
    struct FailingStore {
        inner: MemoryStore,
        key: &'static str,
    }

    impl ReplicatedStore for FailingStore {
        fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(scope, key)
        }

        fn set(&self, scope: Scope, key: &str, value: &str) -> Result<(), StoreError> {
            if scope == Scope::Fleet && key == self.key {
                return Err(StoreError::Io(io::Error::other("disk full")));
            }
            self.inner.set(scope, key, value)
        }

        fn delete(&self, scope: Scope, key: &str) -> Result<(), StoreError> {
            self.inner.delete(scope, key)
        }
    }

    fn leader() -> LeaderWriteGate {
        LeaderWriteGate::acquire(&StaticElection::new(true)).unwrap()
    }

    #[test]
    fn test_gate_requires_leadership() {
        let election = StaticElection::new(false);
        assert!(LeaderWriteGate::acquire(&election).is_none());

        election.set_leader(true);
        assert!(LeaderWriteGate::acquire(&election).is_some());
    }

    #[tokio::test]
    async fn test_failed_store_write_keeps_published_config() {
        for key in [SECRETS_KEY, CLIENTS_KEY, USERLIST_KEY, CONFIG_KEY] {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(FailingStore {
                inner: MemoryStore::new(),
                key,
            });
            let reloader = Arc::new(RecordingReloader::default());
            let publisher = Publisher::new(store.clone(), Layout::new(dir.path()), reloader.clone());

            let mut state = state();
            state.secrets.insert("alice".into(), "secret".into());

            let result = publisher.write(&leader(), &state, 1).await;
            assert!(matches!(result, Err(PublishError::Store(_))), "{key}");

            assert_eq!(store.get(Scope::Fleet, CONFIG_KEY).unwrap(), None, "{key}");
            assert!(reloader.reloads.lock().is_empty());
            assert!(!publisher.layout().config_path().exists());

            if key == CONFIG_KEY {
                // Everything the config depends on is already replicated.
                assert_eq!(
                    store.get(Scope::Fleet, SECRETS_KEY).unwrap().as_deref(),
                    Some(r#"{"alice":"secret"}"#)
                );
                assert!(store.get(Scope::Fleet, CLIENTS_KEY).unwrap().is_some());
                assert!(store.get(Scope::Fleet, USERLIST_KEY).unwrap().is_some());
            }
        }
    }

    #[tokio::test]
    async fn test_write_publishes_everywhere() {
        let f = fixture();
        let state = state();

        let published = f.publisher.write(&leader(), &state, 4).await.unwrap();
        assert_eq!(published, Published::Reloaded);

        assert_eq!(
            f.store.get(Scope::Fleet, CONFIG_KEY).unwrap(),
            Some(state.doc.to_string())
        );
        assert_eq!(
            f.store.get(Scope::Fleet, USERLIST_KEY).unwrap().as_deref(),
            Some("\"alice\" \"md5abc\"")
        );
        assert!(f.store.get(Scope::Fleet, SECRETS_KEY).unwrap().is_some());

        let layout = f.publisher.layout();
        assert_eq!(
            fs::read_to_string(layout.config_path()).unwrap(),
            state.doc.to_string()
        );
        assert_eq!(
            fs::read_to_string(layout.userlist_path()).unwrap(),
            "\"alice\" \"md5abc\""
        );
        assert_eq!(*f.reloader.reloads.lock(), vec![4]);
    }

    #[tokio::test]
    async fn test_worker_configs() {
        let f = fixture();
        f.publisher.write(&leader(), &state(), 4).await.unwrap();

        let limits: Vec<String> = (0..4)
            .map(|i| {
                let text = fs::read_to_string(f.publisher.layout().instance_config_path(i)).unwrap();
                let doc: ConfigDocument = text.parse().unwrap();
                let socket_dir = f.dir.path().join(format!("instance_{i}"));
                assert_eq!(
                    doc.get_scalar(PGBOUNCER, "unix_socket_dir"),
                    Some(socket_dir.display().to_string().as_str())
                );
                assert!(doc.database("pg_master").is_some());
                doc.get_scalar(PGBOUNCER, "max_db_connections")
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(limits, vec!["3", "3", "2", "2"]);

        // The canonical file keeps the fleet total.
        let canonical: ConfigDocument = fs::read_to_string(f.publisher.layout().config_path())
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(canonical.get_scalar(PGBOUNCER, "max_db_connections"), Some("10"));
    }

    #[tokio::test]
    async fn test_unchanged_content_is_not_reloaded() {
        let f = fixture();
        let state = state();

        f.publisher.write(&leader(), &state, 2).await.unwrap();
        let again = f.publisher.write(&leader(), &state, 2).await.unwrap();
        assert_eq!(again, Published::Unchanged);
        assert_eq!(f.reloader.reloads.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_scale_down_removes_stale_workers() {
        let f = fixture();
        f.publisher.write(&leader(), &state(), 4).await.unwrap();
        assert_eq!(f.publisher.sync_from_peer(2).await.unwrap(), Synced::Reloaded);

        let layout = f.publisher.layout();
        assert!(layout.instance_dir(1).exists());
        assert!(!layout.instance_dir(2).exists());
        assert!(!layout.instance_dir(3).exists());
        assert_eq!(*f.reloader.reloads.lock(), vec![4, 2]);
    }

    #[tokio::test]
    async fn test_sync_from_peer() {
        let f = fixture();
        assert_eq!(f.publisher.sync_from_peer(2).await.unwrap(), Synced::NoData);

        // The leader publishes through its own store; replication copies the
        // fleet scope over.
        let leader_fixture = fixture();
        leader_fixture
            .publisher
            .write(&leader(), &state(), 2)
            .await
            .unwrap();
        for key in [CONFIG_KEY, USERLIST_KEY] {
            let value = leader_fixture.store.get(Scope::Fleet, key).unwrap().unwrap();
            f.store.set(Scope::Fleet, key, &value).unwrap();
        }

        assert_eq!(f.publisher.sync_from_peer(2).await.unwrap(), Synced::Reloaded);
        assert_eq!(f.publisher.sync_from_peer(2).await.unwrap(), Synced::Unchanged);
        assert_eq!(f.reloader.reloads.lock().len(), 1);
        assert_eq!(
            fs::read_to_string(f.publisher.layout().config_path()).unwrap(),
            state().doc.to_string()
        );
    }

    #[tokio::test]
    async fn test_malformed_peer_config_leaves_files_untouched() {
        let f = fixture();
        f.store
            .set(Scope::Fleet, CONFIG_KEY, "[databases\n")
            .unwrap();

        let result = f.publisher.sync_from_peer(2).await;
        assert!(matches!(result, Err(PublishError::Malformed(_))));
        assert!(!f.publisher.layout().config_path().exists());
        assert!(f.reloader.reloads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reload_is_retried() {
        let f = fixture();
        let state = state();
        f.reloader.fail.store(true, Ordering::Relaxed);

        let result = f.publisher.write(&leader(), &state, 2).await;
        assert!(matches!(result, Err(PublishError::Reload(_))));

        f.reloader.fail.store(false, Ordering::Relaxed);
        let published = f.publisher.write(&leader(), &state, 2).await.unwrap();
        assert_eq!(published, Published::Reloaded);
    }
}
