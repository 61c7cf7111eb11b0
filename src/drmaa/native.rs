//! Dynamic binding to `libdrmaa`.

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;

use libloading::Library;

use super::{
    ControlAction, DrmaaError, DrmaaJobStatus, DrmaaLibrary, LibraryLoader, TemplateHandle,
};

/// Environment variable naming the library to load.
pub const LIBRARY_PATH_ENV: &str = "DRMAA_LIBRARY_PATH";

/// Library loaded when [`LIBRARY_PATH_ENV`] is unset.
pub const DEFAULT_LIBRARY_NAME: &str = "libdrmaa.so";

const ERROR_BUFFER: usize = 1024;
const JOBNAME_BUFFER: usize = 1024;
const ERRNO_SUCCESS: c_int = 0;
const ERRNO_INVALID_JOB: c_int = 18;

type InitFn = unsafe extern "C" fn(*const c_char, *mut c_char, usize) -> c_int;
type ExitFn = unsafe extern "C" fn(*mut c_char, usize) -> c_int;
type AllocateFn = unsafe extern "C" fn(*mut *mut c_void, *mut c_char, usize) -> c_int;
type SetAttributeFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, *mut c_char, usize) -> c_int;
type SetVectorFn = unsafe extern "C" fn(
    *mut c_void,
    *const c_char,
    *const *const c_char,
    *mut c_char,
    usize,
) -> c_int;
type RunJobFn = unsafe extern "C" fn(*mut c_char, usize, *mut c_void, *mut c_char, usize) -> c_int;
type DeleteTemplateFn = unsafe extern "C" fn(*mut c_void, *mut c_char, usize) -> c_int;
type ControlFn = unsafe extern "C" fn(*const c_char, c_int, *mut c_char, usize) -> c_int;
type JobPsFn = unsafe extern "C" fn(*const c_char, *mut c_int, *mut c_char, usize) -> c_int;

/// Loads `libdrmaa` from a configured or default path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeLibraryLoader {
    path: String,
}

impl NativeLibraryLoader {
    /// Loads the library at `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Reads [`LIBRARY_PATH_ENV`], falling back to [`DEFAULT_LIBRARY_NAME`].
    #[must_use]
    pub fn from_env() -> Self {
        let path = std::env::var(LIBRARY_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LIBRARY_NAME.to_owned());
        Self::new(path)
    }

    /// Path handed to the dynamic loader.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl LibraryLoader for NativeLibraryLoader {
    fn load(&self) -> Result<Box<dyn DrmaaLibrary>, DrmaaError> {
        Ok(Box::new(NativeDrmaaLibrary::open(&self.path)?))
    }
}

/// The DRMAA 1.0 C API resolved from a shared library.
#[derive(Debug)]
pub struct NativeDrmaaLibrary {
    library: Library,
}

impl NativeDrmaaLibrary {
    /// Opens the shared library at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::BackendUnavailable`] when the library cannot be
    /// loaded.
    pub fn open(path: &str) -> Result<Self, DrmaaError> {
        // SAFETY: loading runs the library's initialisers; libdrmaa has no
        // constructor side effects beyond its own state.
        let library = unsafe { Library::new(path) }
            .map_err(|err| DrmaaError::BackendUnavailable(format!("{path}: {err}")))?;
        Ok(Self { library })
    }

    fn symbol<T: Copy>(&self, name: &'static str) -> Result<T, DrmaaError> {
        // SAFETY: every `T` used below matches the DRMAA 1.0 C prototype of
        // `name`.
        unsafe { self.library.get::<T>(name.as_bytes()) }
            .map(|symbol| *symbol)
            .map_err(|err| DrmaaError::BackendUnavailable(format!("missing symbol {name}: {err}")))
    }
}

fn c_string(value: &str) -> Result<CString, DrmaaError> {
    CString::new(value)
        .map_err(|_| DrmaaError::InvalidAttribute(format!("value contains NUL byte: {value:?}")))
}

fn check(call: &'static str, code: c_int, diagnosis: &[c_char; ERROR_BUFFER]) -> Result<(), DrmaaError> {
    if code == ERRNO_SUCCESS {
        return Ok(());
    }
    Err(DrmaaError::Native {
        call,
        code,
        message: read_buffer(diagnosis),
    })
}

fn read_buffer(buffer: &[c_char]) -> String {
    if !buffer.contains(&0) {
        return String::new();
    }
    // SAFETY: the buffer holds a NUL terminator, checked above.
    unsafe { CStr::from_ptr(buffer.as_ptr()) }
        .to_string_lossy()
        .trim()
        .to_owned()
}

fn template_ptr(template: TemplateHandle) -> *mut c_void {
    template.0 as *mut c_void
}

impl DrmaaLibrary for NativeDrmaaLibrary {
    fn init(&mut self, contact: Option<&str>) -> Result<(), DrmaaError> {
        let init: InitFn = self.symbol("drmaa_init")?;
        let contact = contact.map(c_string).transpose()?;
        let contact_ptr = contact.as_ref().map_or(ptr::null(), |value| value.as_ptr());
        let mut diagnosis = [0 as c_char; ERROR_BUFFER];
        // SAFETY: pointers are valid for the duration of the call.
        let code = unsafe { init(contact_ptr, diagnosis.as_mut_ptr(), ERROR_BUFFER) };
        check("drmaa_init", code, &diagnosis)
    }

    fn exit(&mut self) -> Result<(), DrmaaError> {
        let exit: ExitFn = self.symbol("drmaa_exit")?;
        let mut diagnosis = [0 as c_char; ERROR_BUFFER];
        // SAFETY: the diagnosis buffer outlives the call.
        let code = unsafe { exit(diagnosis.as_mut_ptr(), ERROR_BUFFER) };
        check("drmaa_exit", code, &diagnosis)
    }

    fn allocate_job_template(&mut self) -> Result<TemplateHandle, DrmaaError> {
        let allocate: AllocateFn = self.symbol("drmaa_allocate_job_template")?;
        let mut template: *mut c_void = ptr::null_mut();
        let mut diagnosis = [0 as c_char; ERROR_BUFFER];
        // SAFETY: `template` receives the library-owned handle.
        let code = unsafe { allocate(&mut template, diagnosis.as_mut_ptr(), ERROR_BUFFER) };
        check("drmaa_allocate_job_template", code, &diagnosis)?;
        Ok(TemplateHandle(template as usize))
    }

    fn set_attribute(
        &mut self,
        template: TemplateHandle,
        name: &str,
        value: &str,
    ) -> Result<(), DrmaaError> {
        let set: SetAttributeFn = self.symbol("drmaa_set_attribute")?;
        let name = c_string(name)?;
        let value = c_string(value)?;
        let mut diagnosis = [0 as c_char; ERROR_BUFFER];
        // SAFETY: the template came from `allocate_job_template` and the
        // strings outlive the call.
        let code = unsafe {
            set(
                template_ptr(template),
                name.as_ptr(),
                value.as_ptr(),
                diagnosis.as_mut_ptr(),
                ERROR_BUFFER,
            )
        };
        check("drmaa_set_attribute", code, &diagnosis)
    }

    fn set_vector_attribute(
        &mut self,
        template: TemplateHandle,
        name: &str,
        values: &[String],
    ) -> Result<(), DrmaaError> {
        let set: SetVectorFn = self.symbol("drmaa_set_vector_attribute")?;
        let name = c_string(name)?;
        let owned = values
            .iter()
            .map(|value| c_string(value))
            .collect::<Result<Vec<_>, _>>()?;
        let mut pointers: Vec<*const c_char> = owned.iter().map(|value| value.as_ptr()).collect();
        pointers.push(ptr::null());
        let mut diagnosis = [0 as c_char; ERROR_BUFFER];
        // SAFETY: `pointers` is NULL-terminated and every entry points into
        // `owned`, which outlives the call.
        let code = unsafe {
            set(
                template_ptr(template),
                name.as_ptr(),
                pointers.as_ptr(),
                diagnosis.as_mut_ptr(),
                ERROR_BUFFER,
            )
        };
        check("drmaa_set_vector_attribute", code, &diagnosis)
    }

    fn run_job(&mut self, template: TemplateHandle) -> Result<String, DrmaaError> {
        let run: RunJobFn = self.symbol("drmaa_run_job")?;
        let mut job_id = [0 as c_char; JOBNAME_BUFFER];
        let mut diagnosis = [0 as c_char; ERROR_BUFFER];
        // SAFETY: both buffers are sized as advertised.
        let code = unsafe {
            run(
                job_id.as_mut_ptr(),
                JOBNAME_BUFFER,
                template_ptr(template),
                diagnosis.as_mut_ptr(),
                ERROR_BUFFER,
            )
        };
        check("drmaa_run_job", code, &diagnosis)?;
        Ok(read_buffer(&job_id))
    }

    fn delete_job_template(&mut self, template: TemplateHandle) -> Result<(), DrmaaError> {
        let delete: DeleteTemplateFn = self.symbol("drmaa_delete_job_template")?;
        let mut diagnosis = [0 as c_char; ERROR_BUFFER];
        // SAFETY: the template came from `allocate_job_template` and is
        // deleted once.
        let code = unsafe { delete(template_ptr(template), diagnosis.as_mut_ptr(), ERROR_BUFFER) };
        check("drmaa_delete_job_template", code, &diagnosis)
    }

    fn control(&mut self, job_id: &str, action: ControlAction) -> Result<(), DrmaaError> {
        let control: ControlFn = self.symbol("drmaa_control")?;
        let id = c_string(job_id)?;
        let mut diagnosis = [0 as c_char; ERROR_BUFFER];
        // SAFETY: pointers are valid for the duration of the call.
        let code = unsafe {
            control(
                id.as_ptr(),
                action.code(),
                diagnosis.as_mut_ptr(),
                ERROR_BUFFER,
            )
        };
        if code == ERRNO_INVALID_JOB {
            return Err(DrmaaError::InvalidJob {
                job_id: job_id.to_owned(),
                message: read_buffer(&diagnosis),
            });
        }
        check("drmaa_control", code, &diagnosis)
    }

    fn job_ps(&mut self, job_id: &str) -> Result<DrmaaJobStatus, DrmaaError> {
        let job_ps: JobPsFn = self.symbol("drmaa_job_ps")?;
        let id = c_string(job_id)?;
        let mut status: c_int = 0;
        let mut diagnosis = [0 as c_char; ERROR_BUFFER];
        // SAFETY: pointers are valid for the duration of the call.
        let code = unsafe { job_ps(id.as_ptr(), &mut status, diagnosis.as_mut_ptr(), ERROR_BUFFER) };
        if code == ERRNO_INVALID_JOB {
            return Err(DrmaaError::InvalidJob {
                job_id: job_id.to_owned(),
                message: read_buffer(&diagnosis),
            });
        }
        check("drmaa_job_ps", code, &diagnosis)?;
        Ok(DrmaaJobStatus::from_code(status))
    }
}
