//! Serialized access to a DRMAA scheduler session.
//!
//! A [`DrmaaSessionFactory`] owns the only session in the process. The
//! scheduler library is loaded and initialised on first use, so deployments
//! without `libdrmaa` only see [`DrmaaError::BackendUnavailable`] when a job
//! is actually routed to DRMAA. Every native call runs on the blocking pool
//! while holding the factory mutex.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

mod native;
mod template;

pub use native::{DEFAULT_LIBRARY_NAME, LIBRARY_PATH_ENV, NativeDrmaaLibrary, NativeLibraryLoader};
pub use template::{ALLOWED_ATTRIBUTES, JobTemplateAttributes};

/// Errors raised by the DRMAA wrapper.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DrmaaError {
    /// Raised when the scheduler library cannot be loaded or initialised.
    #[error("DRMAA backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Raised for a template key outside the allow-list.
    #[error("unknown DRMAA template attribute: {0}")]
    UnknownAttribute(String),
    /// Raised when an allowed attribute carries an unusable value.
    #[error("invalid DRMAA template attribute: {0}")]
    InvalidAttribute(String),
    /// Raised when the scheduler does not know the job.
    #[error("invalid DRMAA job {job_id}: {message}")]
    InvalidJob {
        /// Scheduler job identifier.
        job_id: String,
        /// Diagnostic from the library.
        message: String,
    },
    /// Raised for any other non-zero library return code.
    #[error("DRMAA call {call} failed with code {code}: {message}")]
    Native {
        /// Library function that failed.
        call: &'static str,
        /// DRMAA error number.
        code: i32,
        /// Diagnostic from the library.
        message: String,
    },
    /// Raised when the session has been closed.
    #[error("DRMAA session is closed")]
    Closed,
    /// Raised when the blocking worker running a call was lost.
    #[error("DRMAA worker failed: {0}")]
    Worker(String),
}

impl DrmaaError {
    /// Returns `true` when the failure stems from a missing library.
    #[must_use]
    pub const fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

/// Opaque job template handle issued by a [`DrmaaLibrary`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TemplateHandle(pub usize);

/// Action passed to `drmaa_control`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlAction {
    /// Put a queued job on hold.
    Hold,
    /// Release a held job.
    Release,
    /// Remove the job from the scheduler.
    Terminate,
}

impl ControlAction {
    /// DRMAA constant for the action.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Hold => 2,
            Self::Release => 3,
            Self::Terminate => 4,
        }
    }
}

/// Job status reported by `drmaa_job_ps`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrmaaJobStatus {
    /// The scheduler cannot say.
    Undetermined,
    /// Queued and eligible to run.
    QueuedActive,
    /// Queued and held by the system, the user, or both.
    OnHold,
    /// Executing.
    Running,
    /// Suspended by the system, the user, or both.
    Suspended,
    /// Finished normally.
    Done,
    /// Finished abnormally.
    Failed,
}

impl DrmaaJobStatus {
    /// Maps a `drmaa_job_ps` code. Unknown codes are `Undetermined`.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0x10 => Self::QueuedActive,
            0x11..=0x13 => Self::OnHold,
            0x20 => Self::Running,
            0x21..=0x23 => Self::Suspended,
            0x30 => Self::Done,
            0x40 => Self::Failed,
            _ => Self::Undetermined,
        }
    }
}

/// Native seam over the DRMAA C API.
///
/// Implementations need not be thread-safe; the factory serializes every
/// call.
pub trait DrmaaLibrary: Send {
    /// Opens the session (`drmaa_init`).
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::Native`] when the scheduler rejects the contact.
    fn init(&mut self, contact: Option<&str>) -> Result<(), DrmaaError>;

    /// Closes the session (`drmaa_exit`).
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::Native`] on library failure.
    fn exit(&mut self) -> Result<(), DrmaaError>;

    /// Allocates an empty job template.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::Native`] on library failure.
    fn allocate_job_template(&mut self) -> Result<TemplateHandle, DrmaaError>;

    /// Sets a scalar attribute.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::Native`] on library failure.
    fn set_attribute(
        &mut self,
        template: TemplateHandle,
        name: &str,
        value: &str,
    ) -> Result<(), DrmaaError>;

    /// Sets a vector attribute.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::Native`] on library failure.
    fn set_vector_attribute(
        &mut self,
        template: TemplateHandle,
        name: &str,
        values: &[String],
    ) -> Result<(), DrmaaError>;

    /// Submits the template and returns the scheduler job id.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::Native`] when submission is refused.
    fn run_job(&mut self, template: TemplateHandle) -> Result<String, DrmaaError>;

    /// Releases a template.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::Native`] on library failure.
    fn delete_job_template(&mut self, template: TemplateHandle) -> Result<(), DrmaaError>;

    /// Applies `action` to a job.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::InvalidJob`] for unknown or finished jobs.
    fn control(&mut self, job_id: &str, action: ControlAction) -> Result<(), DrmaaError>;

    /// Reports the status of a job.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::InvalidJob`] for unknown jobs.
    fn job_ps(&mut self, job_id: &str) -> Result<DrmaaJobStatus, DrmaaError>;
}

/// Produces the library on first use.
pub trait LibraryLoader: Send + Sync {
    /// Loads the scheduler library.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::BackendUnavailable`] when it cannot be loaded.
    fn load(&self) -> Result<Box<dyn DrmaaLibrary>, DrmaaError>;
}

/// Lifecycle of the process-wide session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing loaded yet.
    Uninitialized,
    /// `drmaa_init` succeeded.
    Ready,
    /// Loading or initialisation failed; the failure is sticky.
    Unavailable,
    /// [`DrmaaSessionFactory::close`] ran.
    Closed,
}

enum SessionSlot {
    Uninitialized,
    Ready(Box<dyn DrmaaLibrary>),
    Unavailable(String),
    Closed,
}

struct FactoryInner {
    loader: Box<dyn LibraryLoader>,
    contact: Option<String>,
    slot: Mutex<SessionSlot>,
}

/// Owner of the single DRMAA session.
///
/// Cloning shares the same session.
#[derive(Clone)]
pub struct DrmaaSessionFactory {
    inner: Arc<FactoryInner>,
}

impl fmt::Debug for DrmaaSessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmaaSessionFactory")
            .field("contact", &self.inner.contact)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DrmaaSessionFactory {
    /// Creates a factory that loads `libdrmaa` from `DRMAA_LIBRARY_PATH` or
    /// the default library name.
    #[must_use]
    pub fn native(contact: Option<String>) -> Self {
        Self::new(Box::new(NativeLibraryLoader::from_env()), contact)
    }

    /// Creates a factory around `loader`. Nothing is loaded until the first
    /// call.
    #[must_use]
    pub fn new(loader: Box<dyn LibraryLoader>, contact: Option<String>) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                loader,
                contact,
                slot: Mutex::new(SessionSlot::Uninitialized),
            }),
        }
    }

    /// Current session lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        match *lock_slot(&self.inner.slot) {
            SessionSlot::Uninitialized => SessionState::Uninitialized,
            SessionSlot::Ready(_) => SessionState::Ready,
            SessionSlot::Unavailable(_) => SessionState::Unavailable,
            SessionSlot::Closed => SessionState::Closed,
        }
    }

    /// Submits a job built from `attributes`.
    ///
    /// The template is deleted before this returns, whether or not the
    /// submission succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::BackendUnavailable`] when the library is
    /// missing, or the library error from any template or submit call.
    pub async fn run_job(&self, attributes: JobTemplateAttributes) -> Result<String, DrmaaError> {
        self.blocking(move |library| {
            let mut template = TemplateGuard::allocate(library)?;
            let handle = template.handle;
            attributes.apply(template.library(), handle)?;
            let job_id = template.library().run_job(handle)?;
            tracing::info!(job_id = %job_id, "submitted DRMAA job");
            Ok(job_id)
        })
        .await
    }

    /// Terminates a job. A job the scheduler no longer knows counts as
    /// terminated.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::BackendUnavailable`] or any library error other
    /// than [`DrmaaError::InvalidJob`].
    pub async fn kill(&self, job_id: &str) -> Result<(), DrmaaError> {
        let job_id = job_id.to_owned();
        self.blocking(move |library| match library.control(&job_id, ControlAction::Terminate) {
            Err(DrmaaError::InvalidJob { message, .. }) => {
                tracing::debug!(job_id = %job_id, %message, "DRMAA job already gone");
                Ok(())
            }
            other => other,
        })
        .await
    }

    /// Reports the scheduler status of a job.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::BackendUnavailable`] or the library error.
    pub async fn job_status(&self, job_id: &str) -> Result<DrmaaJobStatus, DrmaaError> {
        let job_id = job_id.to_owned();
        self.blocking(move |library| library.job_ps(&job_id)).await
    }

    /// Exits the session. Later calls fail with [`DrmaaError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns the `drmaa_exit` failure; the session is closed regardless.
    pub async fn close(&self) -> Result<(), DrmaaError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut slot = lock_slot(&inner.slot);
            match std::mem::replace(&mut *slot, SessionSlot::Closed) {
                SessionSlot::Ready(mut library) => library.exit(),
                _ => Ok(()),
            }
        })
        .await
        .map_err(|err| DrmaaError::Worker(err.to_string()))?
    }

    async fn blocking<T, F>(&self, call: F) -> Result<T, DrmaaError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DrmaaLibrary) -> Result<T, DrmaaError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.with_session(call))
            .await
            .map_err(|err| DrmaaError::Worker(err.to_string()))?
    }
}

impl FactoryInner {
    fn with_session<T>(
        &self,
        call: impl FnOnce(&mut dyn DrmaaLibrary) -> Result<T, DrmaaError>,
    ) -> Result<T, DrmaaError> {
        let mut slot = lock_slot(&self.slot);
        if matches!(*slot, SessionSlot::Uninitialized) {
            *slot = self.open();
        }
        match &mut *slot {
            SessionSlot::Ready(library) => call(library.as_mut()),
            SessionSlot::Unavailable(reason) => Err(DrmaaError::BackendUnavailable(reason.clone())),
            SessionSlot::Closed => Err(DrmaaError::Closed),
            SessionSlot::Uninitialized => Err(DrmaaError::BackendUnavailable(String::from(
                "session was not initialised",
            ))),
        }
    }

    fn open(&self) -> SessionSlot {
        let opened = self.loader.load().and_then(|mut library| {
            library.init(self.contact.as_deref())?;
            Ok(library)
        });
        match opened {
            Ok(library) => {
                tracing::info!(contact = ?self.contact, "DRMAA session initialised");
                SessionSlot::Ready(library)
            }
            Err(err) => {
                tracing::warn!(error = %err, "DRMAA session unavailable");
                SessionSlot::Unavailable(err.to_string())
            }
        }
    }
}

fn lock_slot(slot: &Mutex<SessionSlot>) -> MutexGuard<'_, SessionSlot> {
    slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Deletes its template when dropped, including during unwinding.
struct TemplateGuard<'a> {
    library: &'a mut dyn DrmaaLibrary,
    handle: TemplateHandle,
}

impl<'a> TemplateGuard<'a> {
    fn allocate(library: &'a mut dyn DrmaaLibrary) -> Result<Self, DrmaaError> {
        let handle = library.allocate_job_template()?;
        Ok(Self { library, handle })
    }

    fn library(&mut self) -> &mut dyn DrmaaLibrary {
        &mut *self.library
    }
}

impl Drop for TemplateGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.library.delete_job_template(self.handle) {
            tracing::warn!(template = self.handle.0, error = %err, "failed to delete DRMAA job template");
        }
    }
}

#[cfg(test)]
mod tests;
