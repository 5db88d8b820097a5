//! Skiff gRPC Gateway
//!
//! A gRPC service that exposes skiff file system and scheduler sessions to
//! remote clients.
//!
//! # Architecture
//!
//! Clients never hold library objects. Opening a session registers it in a
//! [`HandleRegistry`] under a generated id, and every later call names the
//! session by that id. Long-running copies and jobs are indexed by an
//! [`OperationTracker`] under the session that started them. The tracker
//! keeps no progress of its own, so every status request asks the session.
//!
//! Session calls block. Services run them on blocking threads and bridge
//! file contents and job output to gRPC streams in fixed-size chunks.
//!
//! # Example Flow
//!
//! ```text
//! Client                                    Gateway
//! │                                           │
//! │  LocalScheduler()                         │
//! │ ─────────────────────────────────────────>│
//! │       Scheduler{id: "local://alice@#1"}   │
//! │<───────────────────────────────────────── │
//! │                                           │
//! │  SubmitBatchJob{scheduler, "hostname"}    │
//! │ ─────────────────────────────────────────>│
//! │       Job{id: "local-1"}                  │
//! │<───────────────────────────────────────── │
//! │                                           │
//! │  WaitUntilDone{scheduler, job}            │
//! │ ─────────────────────────────────────────>│
//! │       JobStatus{done, exit_code: 0}       │
//! │<───────────────────────────────────────── │
//! ```

pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("skiff.v1");
}

pub mod config;
pub mod convert;
pub mod deadline;
pub mod error;
pub mod forwarder;
pub mod registry;
mod server;
pub mod service;
pub mod tracker;
pub mod transfer;

pub use config::{ConfigError, GatewayConfig};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use registry::{HandleKind, HandleRegistry, SessionRequest};
pub use server::GatewayServer;
pub use service::{FileSystemGateway, GatewayState, SchedulerGateway};
pub use tracker::{OperationKind, OperationTracker};

// Re-export proto types for convenience
pub use proto::{
    file_system_service_client::FileSystemServiceClient,
    file_system_service_server::FileSystemServiceServer,
    scheduler_service_client::SchedulerServiceClient,
    scheduler_service_server::SchedulerServiceServer,
};
