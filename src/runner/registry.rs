//! Runner name to backend lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::backend::JobBackend;
use super::drmaa::{DrmaaBackend, NATIVE_SPECIFICATION_PARAM};
use super::local::LocalBackend;
use super::remote::RemoteBackend;
use super::{Destination, DispatchError};
use crate::client::RemoteJobClient;
use crate::config::{DispatchConfig, RunnerDefinition, RunnerKind, RunnersConfig};
use crate::drmaa::DrmaaSessionFactory;
use crate::transport::{
    RemoteCopyConfig, RetryPolicy, RetryingTransport, Transport, TransportSettings,
    build_transport,
};

/// Everything needed to turn a [`RunnerDefinition`] into a backend.
#[derive(Clone, Debug)]
pub struct BackendContext {
    /// Default transfer timeout and SSH settings.
    pub transport: TransportSettings,
    /// Backoff for transient transfer failures.
    pub retry: RetryPolicy,
    /// Bound on control and status requests.
    pub request_timeout: Duration,
    /// Shared DRMAA session.
    pub drmaa: DrmaaSessionFactory,
}

impl BackendContext {
    /// Derives the context from process settings.
    #[must_use]
    pub fn from_config(
        config: &DispatchConfig,
        remote_copy: RemoteCopyConfig,
        drmaa: DrmaaSessionFactory,
    ) -> Self {
        Self {
            transport: TransportSettings {
                timeout: config.transfer_timeout(),
                remote_copy,
            },
            retry: config.retry_policy(),
            request_timeout: config.probe_timeout(),
            drmaa,
        }
    }

    /// Builds the backend described by `definition`.
    ///
    /// Remote backends stage files through a [`RetryingTransport`].
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] for incomplete remote settings and
    /// [`DispatchError::Transport`] or [`DispatchError::Client`] when the
    /// transport or HTTP client cannot be built.
    pub fn build(
        &self,
        runner: &str,
        definition: &RunnerDefinition,
    ) -> Result<Arc<dyn JobBackend>, DispatchError> {
        let backend: Arc<dyn JobBackend> = match definition.kind {
            RunnerKind::Local => Arc::new(LocalBackend::new()),
            RunnerKind::Drmaa => Arc::new(DrmaaBackend::new(
                self.drmaa.clone(),
                definition
                    .param(NATIVE_SPECIFICATION_PARAM)
                    .map(str::to_owned),
            )),
            RunnerKind::Remote => {
                let settings = definition.remote_settings(runner)?;
                let transport_settings = TransportSettings {
                    timeout: settings.timeout.unwrap_or(self.transport.timeout),
                    remote_copy: self.transport.remote_copy.clone(),
                };
                let inner = build_transport(settings.transport_kind, &transport_settings)?;
                let transport: Arc<dyn Transport> =
                    Arc::new(RetryingTransport::new(inner, self.retry));
                let client = RemoteJobClient::new(&settings, transport, self.request_timeout)?;
                Arc::new(RemoteBackend::new(client))
            }
        };
        Ok(backend)
    }
}

/// Backends keyed by runner name.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn JobBackend>>,
    definitions: HashMap<String, RunnerDefinition>,
    context: Option<BackendContext>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.backends.keys().collect();
        names.sort();
        f.debug_struct("BackendRegistry")
            .field("runners", &names)
            .finish_non_exhaustive()
    }
}

impl BackendRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one backend per runner in `runners`.
    ///
    /// # Errors
    ///
    /// Returns the first backend construction failure.
    pub fn from_config(
        runners: &RunnersConfig,
        context: BackendContext,
    ) -> Result<Self, DispatchError> {
        let mut registry = Self {
            backends: HashMap::new(),
            definitions: HashMap::new(),
            context: None,
        };
        for (name, definition) in &runners.runners {
            let backend = context.build(name, definition)?;
            registry.backends.insert(name.clone(), backend);
            registry.definitions.insert(name.clone(), definition.clone());
        }
        registry.context = Some(context);
        Ok(registry)
    }

    /// Adds or replaces a backend. Per-job overrides are ignored for
    /// backends registered this way.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn JobBackend>) {
        let name = name.into();
        self.definitions.remove(&name);
        self.backends.insert(name, backend);
    }

    /// Registered runner names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// Finds the backend for `destination`.
    ///
    /// A destination with parameter overrides on a configured runner gets a
    /// backend built from the merged definition.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownRunner`] when no runner matches, or a
    /// construction failure for overridden definitions.
    pub fn resolve(&self, destination: &Destination) -> Result<Arc<dyn JobBackend>, DispatchError> {
        let backend = self
            .backends
            .get(&destination.runner)
            .ok_or_else(|| DispatchError::UnknownRunner(destination.runner.clone()))?;
        if destination.params.is_empty() {
            return Ok(Arc::clone(backend));
        }
        match (self.definitions.get(&destination.runner), &self.context) {
            (Some(definition), Some(context)) => context.build(
                &destination.runner,
                &definition.with_overrides(&destination.params),
            ),
            _ => {
                tracing::debug!(
                    runner = %destination.runner,
                    "ignoring destination overrides for a manually registered backend"
                );
                Ok(Arc::clone(backend))
            }
        }
    }
}
