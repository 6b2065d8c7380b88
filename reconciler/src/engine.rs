//! Turns events into reconciliation passes, one at a time.
//!
//! Each pass loads the fleet state fresh from the store, merges the event's
//! facts, runs the planned backend actions and publishes. Any failure aborts
//! the pass before publishing, leaving the previously published state as is.

use crate::admin::{self, AdminError, BackendAdmin};
use crate::config::{EngineConfig, PoolSettings, StoreConfig};
use crate::facts::{BackendSnapshot, ClientRequest, RelationId};
use crate::metrics_defs::{
    FLEET_CLIENTS, RECONCILE_DEFERRED, RECONCILE_DURATION, RECONCILE_FAILED, RECONCILE_PASSES,
};
use crate::publisher::{
    Election, LeaderWriteGate, Layout, PublishError, Published, Publisher, Reloader,
    StaticElection, Synced,
};
use crate::reconcile::{ConflictReason, DeferReason, Plan, ReconcileError, Reconciler};
use crate::state::{FleetState, StateError};
use crate::store::{FilesystemStore, MemoryStore, ReplicatedStore};
use serde::{Deserialize, Serialize};
use shared::{counter, gauge, histogram};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Writes the configured settings and the pooler's own users.
    Bootstrap,
    BackendChanged(BackendSnapshot),
    BackendDeparted,
    ClientChanged(ClientRequest),
    ClientDeparted { relation: RelationId },
    /// The fleet copy changed.
    PeerChanged,
    ScaleChanged { instances: usize },
    SettingsChanged(PoolSettings),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Bootstrap => "bootstrap",
            Event::BackendChanged(_) => "backend_changed",
            Event::BackendDeparted => "backend_departed",
            Event::ClientChanged(_) => "client_changed",
            Event::ClientDeparted { .. } => "client_departed",
            Event::PeerChanged => "peer_changed",
            Event::ScaleChanged { .. } => "scale_changed",
            Event::SettingsChanged(_) => "settings_changed",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// New configuration rendered and workers reloaded.
    Applied,
    Unchanged,
    /// Redeliver the event once the missing facts are available.
    Deferred(DeferReason),
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("backend setup failed: {0}")]
    Backend(#[from] AdminError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("the engine has stopped")]
    Stopped,
}

impl EngineError {
    /// Whether redelivering the same event may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::State(StateError::Store(_)) => true,
            EngineError::State(_) => false,
            EngineError::Reconcile(_) => false,
            EngineError::Backend(AdminError::Connection(_)) => true,
            EngineError::Backend(_) => false,
            EngineError::Publish(PublishError::Malformed(_) | PublishError::State(_)) => false,
            EngineError::Publish(_) => true,
            EngineError::Stopped => false,
        }
    }

    /// The conflict blocking a single relation, if that is what this is.
    pub fn conflict(&self) -> Option<(&RelationId, &ConflictReason)> {
        match self {
            EngineError::Reconcile(ReconcileError::Conflict { relation, reason }) => {
                Some((relation, reason))
            }
            _ => None,
        }
    }
}

pub struct Engine {
    reconciler: Reconciler,
    publisher: Publisher,
    store: Arc<dyn ReplicatedStore>,
    election: Arc<dyn Election>,
    admin: Arc<dyn BackendAdmin>,
    instances: usize,
}

impl Engine {
    pub fn new(
        reconciler: Reconciler,
        store: Arc<dyn ReplicatedStore>,
        election: Arc<dyn Election>,
        admin: Arc<dyn BackendAdmin>,
        reloader: Arc<dyn Reloader>,
        instances: usize,
    ) -> Self {
        let layout = Layout::new(reconciler.config_dir());
        Engine {
            publisher: Publisher::new(store.clone(), layout, reloader),
            reconciler,
            store,
            election,
            admin,
            instances,
        }
    }

    /// Wires an engine from configuration. The worker count defaults to the
    /// available parallelism.
    pub fn from_config(
        config: &EngineConfig,
        admin: Arc<dyn BackendAdmin>,
        reloader: Arc<dyn Reloader>,
    ) -> Self {
        let store: Arc<dyn ReplicatedStore> = match &config.store {
            StoreConfig::Filesystem { path } => Arc::new(FilesystemStore::new(path)),
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
        };
        let instances = config.instances.unwrap_or_else(|| {
            thread::available_parallelism().map_or(1, |count| count.get())
        });

        Engine::new(
            Reconciler::new(&config.app_name, &config.config_dir, config.settings.clone()),
            store,
            Arc::new(StaticElection::new(config.leader)),
            admin,
            reloader,
            instances,
        )
    }

    pub fn instances(&self) -> usize {
        self.instances
    }

    /// Handles one event to completion.
    pub async fn handle(&mut self, event: Event) -> Result<Outcome, EngineError> {
        let kind = event.kind();
        let start = Instant::now();

        let result = self.dispatch(event).await;

        counter!(RECONCILE_PASSES, "event" => kind).increment(1);
        histogram!(RECONCILE_DURATION, "event" => kind).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(Outcome::Deferred(reason)) => {
                counter!(RECONCILE_DEFERRED, "event" => kind).increment(1);
                info!(event = kind, %reason, "deferring event");
            }
            Ok(outcome) => debug!(event = kind, ?outcome, "event handled"),
            Err(err) => {
                let retryable = if err.is_retryable() { "true" } else { "false" };
                counter!(RECONCILE_FAILED, "event" => kind, "retryable" => retryable).increment(1);
                warn!(event = kind, retryable, error = %err, "event failed");
            }
        }
        result
    }

    async fn dispatch(&mut self, event: Event) -> Result<Outcome, EngineError> {
        match event {
            Event::PeerChanged => self.sync_local().await,
            Event::ScaleChanged { instances } => {
                info!(from = self.instances, to = instances, "worker count changed");
                self.instances = instances.max(1);
                self.sync_local().await
            }
            event => self.reconcile(event).await,
        }
    }

    async fn sync_local(&self) -> Result<Outcome, EngineError> {
        match self.publisher.sync_from_peer(self.instances).await? {
            Synced::Reloaded => Ok(Outcome::Applied),
            Synced::Unchanged => Ok(Outcome::Unchanged),
            Synced::NoData => Ok(Outcome::Deferred(DeferReason::NoPublishedConfig)),
        }
    }

    async fn reconcile(&mut self, event: Event) -> Result<Outcome, EngineError> {
        // Followers only ever render what the leader published.
        let Some(gate) = LeaderWriteGate::acquire(self.election.as_ref()) else {
            debug!(event = event.kind(), "not the leader, skipping");
            return Ok(Outcome::Unchanged);
        };

        let reconciler = &mut self.reconciler;
        let mut state = FleetState::load(self.store.as_ref(), || reconciler.skeleton())?;

        let plan = match event {
            Event::Bootstrap => {
                let settings = reconciler.settings().clone();
                reconciler.apply_settings(&mut state, &settings)?
            }
            Event::SettingsChanged(settings) => reconciler.apply_settings(&mut state, &settings)?,
            Event::BackendChanged(backend) => reconciler.apply_backend(&mut state, &backend)?,
            Event::BackendDeparted => reconciler.remove_backend(&mut state),
            Event::ClientChanged(client) => reconciler.apply_client(&mut state, &client)?,
            Event::ClientDeparted { relation } => reconciler.remove_client(&mut state, &relation),
            Event::PeerChanged | Event::ScaleChanged { .. } => return Ok(Outcome::Unchanged),
        };

        let actions = match plan {
            Plan::Apply(actions) => actions,
            Plan::Defer(reason) => return Ok(Outcome::Deferred(reason)),
        };

        admin::execute(self.admin.as_ref(), &actions).await?;

        let published = self.publisher.write(&gate, &state, self.instances).await?;
        gauge!(FLEET_CLIENTS).set(state.clients.len() as f64);

        match published {
            Published::Reloaded => Ok(Outcome::Applied),
            Published::Unchanged => Ok(Outcome::Unchanged),
        }
    }

    /// Moves the engine onto a worker task that handles events in arrival
    /// order.
    pub fn spawn(mut self) -> EngineHandle {
        let (tx, mut rx) = mpsc::channel::<Command>(64);

        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Dispatch(event, reply) => {
                        let result = self.handle(event).await;
                        // The caller may have gone away.
                        let _ = reply.send(result);
                    }
                    Command::Shutdown => break,
                }
            }
            info!("engine stopped");
        });

        EngineHandle { tx, handle }
    }
}

enum Command {
    Dispatch(Event, oneshot::Sender<Result<Outcome, EngineError>>),
    Shutdown,
}

pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl EngineHandle {
    pub async fn dispatch(&self, event: Event) -> Result<Outcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Dispatch(event, reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Finishes queued events, then stops the worker.
    pub async fn shutdown(self) {
        if self.tx.send(Command::Shutdown).await.is_ok() {
            let _ = self.handle.await;
        }
    }
}
