//! Stage implementations backed by external services

pub mod remote;

pub use remote::RemoteStageClient;
