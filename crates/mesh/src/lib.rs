//! The mesh store and its services.
//!
//! This crate binds the consensus engine and the registry together: the
//! [`MeshStore`] owns the observer that reconciles consensus events into
//! registry updates, tunnel peer-table refreshes, and watcher events; the
//! [`JoinService`] is the leader-only admission endpoint; the
//! [`AdminService`] covers policy object CRUD; and [`rpc`] exposes all of it
//! over length-delimited frames on any reliable byte stream.

mod admin;
mod config;
mod error;
mod join;
mod observer;
pub mod rbac;
mod reconciler;
pub mod rpc;
mod store;
mod watchers;

pub use admin::AdminService;
pub use config::{BootstrapConfig, MeshStoreConfig};
pub use error::{Code, ServiceError};
pub use join::{JoinRequest, JoinResponse, JoinService, LeaveRequest};
pub use reconciler::{NoopReconciler, PeerReconciler, ReconcilerError, RecordingReconciler};
pub use store::MeshStore;
pub use watchers::{
    BroadcastWatchers, ClusterStatus, MeshEvent, MeshEventKind, MeshWatchers, NoopWatchers,
};
