//! Hub: receives uploaded segments, queues them durably, and runs the
//! single-slot processing worker over them.

pub mod cluster;
pub mod inference;
pub mod queue;
pub mod server;
pub mod worker;

pub use cluster::cluster_detections;
pub use inference::{Inference, StubInference};
pub use queue::{ClaimedJob, JobRecord, ProcessingQueue, ReceiveOutcome};
pub use server::{HubHandle, HubServer, HubServerConfig};
pub use worker::{ProcessingWorker, WorkerConfig, WorkerHandle};
