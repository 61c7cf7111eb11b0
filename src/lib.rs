//! Remote job dispatch and execution.
//!
//! A [`JobRunner`] takes [`JobDescriptor`]s and runs each one on the backend
//! its destination names: a local subprocess, a grid scheduler reached
//! through DRMAA, or a remote job server spoken to over HTTP. Input and
//! output files move through pluggable [`transport`] strategies, job
//! progress is tracked in an append-only state history, and lifecycle
//! events are reported through the [`performance`] logger.

pub mod client;
pub mod command;
pub mod config;
pub mod drmaa;
pub mod environment;
pub mod performance;
pub mod runner;
pub mod test_support;
pub mod transport;

pub use client::{ClientError, CollectionReport, RemoteJobClient, RemoteStatus};
pub use config::{ConfigError, DispatchConfig, RunnerDefinition, RunnerKind, RunnersConfig};
pub use drmaa::{DrmaaError, DrmaaSessionFactory, JobTemplateAttributes};
pub use environment::{EnvironmentError, EnvironmentStatement, render_statements};
pub use performance::{PerformanceEvent, PerformanceEventKind, PerformanceLogger};
pub use runner::{
    BackendRegistry, Destination, DispatchError, JobDescriptor, JobId, JobRunner, JobState,
    JobStateHistory, RunnerError, RunnerOptions, StateUpdate, next_update,
};
pub use transport::{
    RetryPolicy, RetryingTransport, Transport, TransportError, TransportKind, build_transport,
};
