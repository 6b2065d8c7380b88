pub mod admin;
pub mod config;
pub mod document;
pub mod engine;
pub mod facts;
pub mod hashing;
pub mod limits;
pub mod metrics_defs;
pub mod publisher;
pub mod reconcile;
pub mod state;
pub mod store;
pub mod userlist;

pub use engine::{Engine, EngineError, EngineHandle, Event, Outcome};
