//! Dispatch - asynchronous task dispatch and result correlation
//!
//! The control plane hands deployment tasks to an executor over a message
//! bus. The executor reports progress as notifications and a final result
//! per deployment, which this crate reconciles into the deployment store.

pub mod actors;
pub mod app_state;
pub mod config;
pub mod control;
pub mod ingestion;
pub mod notifications;
pub mod rpc;
pub mod sanitizer;
pub mod server;
pub mod store;
pub mod transport;

pub use app_state::AppState;
