//! In-process job server speaking the remote dispatch HTTP protocol.
//!
//! Include from an integration test with:
//!
//! ```rust
//! #[path = "common/fake_server.rs"]
//! mod fake_server;
//! ```

#![allow(dead_code, reason = "each test binary uses a subset of the helpers")]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};

/// One request the server handled, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Submit(String),
    Status(String),
    Upload(String, String),
    Download(String, String),
    Cancel(String),
    Clean(String),
}

#[derive(Default)]
struct ServerState {
    statuses: VecDeque<&'static str>,
    files: HashMap<(String, String), Vec<u8>>,
    submissions: Vec<Value>,
    calls: Vec<Call>,
    reject_submit: Option<(StatusCode, String)>,
    assigned_id: Option<String>,
    form_file_names: Vec<Option<String>>,
}

/// Handle on a running server.
#[derive(Clone)]
pub struct FakeJobServer {
    pub base_url: String,
    state: Arc<Mutex<ServerState>>,
}

impl FakeJobServer {
    /// Binds an ephemeral port and serves until the runtime stops.
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(ServerState::default()));
        let app = Router::new()
            .route("/jobs", post(submit))
            .route("/jobs/{id}", axum::routing::delete(clean))
            .route("/jobs/{id}/status", get(status))
            .route("/jobs/{id}/cancel", post(cancel))
            .route("/jobs/{id}/files/{*path}", put(upload).get(download))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind listener: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener address: {err}"));
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                panic!("fake job server failed: {err}");
            }
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    /// Queues the next states `GET /jobs/{id}/status` reports. The last
    /// state repeats once the queue drains to one entry.
    pub fn script_statuses(&self, statuses: &[&'static str]) {
        lock(&self.state).statuses.extend(statuses.iter().copied());
    }

    /// Makes `POST /jobs` answer with `status` and `body`.
    pub fn reject_submissions(&self, status: StatusCode, body: &str) {
        lock(&self.state).reject_submit = Some((status, body.to_owned()));
    }

    /// Makes `POST /jobs` answer with `id` instead of the submitted id.
    pub fn assign_ids(&self, id: &str) {
        lock(&self.state).assigned_id = Some(id.to_owned());
    }

    /// File names of multipart uploads, in arrival order.
    pub fn form_file_names(&self) -> Vec<Option<String>> {
        lock(&self.state).form_file_names.clone()
    }

    /// Publishes an output file for `job_id`.
    pub fn put_file(&self, job_id: &str, path: &str, contents: &[u8]) {
        lock(&self.state)
            .files
            .insert((job_id.to_owned(), path.to_owned()), contents.to_vec());
    }

    /// Contents of a staged file.
    pub fn file(&self, job_id: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .files
            .get(&(job_id.to_owned(), path.to_owned()))
            .cloned()
    }

    /// Bodies of every accepted submission.
    pub fn submissions(&self) -> Vec<Value> {
        lock(&self.state).submissions.clone()
    }

    /// Every request handled so far.
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.state).calls.clone()
    }

    /// Requests matching `filter`.
    pub fn count(&self, filter: impl Fn(&Call) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|call| filter(call)).count()
    }
}

fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

type Shared = State<Arc<Mutex<ServerState>>>;

async fn submit(State(state): Shared, Json(body): Json<Value>) -> Response {
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let mut guard = lock(&state);
    guard.calls.push(Call::Submit(id.clone()));
    if let Some((status, message)) = guard.reject_submit.clone() {
        return (status, message).into_response();
    }
    guard.submissions.push(body);
    let assigned = guard.assigned_id.clone().unwrap_or(id);
    (StatusCode::CREATED, Json(json!({ "id": assigned }))).into_response()
}

async fn status(State(state): Shared, Path(id): Path<String>) -> Response {
    let mut guard = lock(&state);
    guard.calls.push(Call::Status(id));
    let current = if guard.statuses.len() > 1 {
        guard.statuses.pop_front()
    } else {
        guard.statuses.front().copied()
    };
    Json(json!({ "status": current.unwrap_or("queued") })).into_response()
}

async fn cancel(State(state): Shared, Path(id): Path<String>) -> StatusCode {
    lock(&state).calls.push(Call::Cancel(id));
    StatusCode::ACCEPTED
}

async fn clean(State(state): Shared, Path(id): Path<String>) -> StatusCode {
    let mut guard = lock(&state);
    guard.files.retain(|(job, _), _| *job != id);
    guard.calls.push(Call::Clean(id));
    StatusCode::NO_CONTENT
}

/// Accepts a raw body or a multipart form with a `file` field.
async fn upload(
    State(state): Shared,
    Path((id, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    let is_form = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));
    let received = if is_form {
        read_form(request).await.map(|(name, contents)| (Some(name), contents))
    } else {
        Bytes::from_request(request, &())
            .await
            .map(|body| (None, body.to_vec()))
            .map_err(|err| err.to_string())
    };
    let (form_name, contents) = match received {
        Ok(received) => received,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };

    let mut guard = lock(&state);
    guard.calls.push(Call::Upload(id.clone(), path.clone()));
    if let Some(name) = form_name {
        guard.form_file_names.push(name);
    }
    guard.files.insert((id, path), contents);
    StatusCode::CREATED.into_response()
}

async fn read_form(request: Request) -> Result<(Option<String>, Vec<u8>), String> {
    let mut form = Multipart::from_request(request, &())
        .await
        .map_err(|err| err.to_string())?;
    while let Some(field) = form.next_field().await.map_err(|err| err.to_string())? {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().map(str::to_owned);
        let contents = field.bytes().await.map_err(|err| err.to_string())?;
        return Ok((name, contents.to_vec()));
    }
    Err(String::from("form has no file field"))
}

async fn download(State(state): Shared, Path((id, path)): Path<(String, String)>) -> Response {
    let mut guard = lock(&state);
    guard.calls.push(Call::Download(id.clone(), path.clone()));
    match guard.files.get(&(id, path)) {
        Some(contents) => contents.clone().into_response(),
        None => (StatusCode::NOT_FOUND, "no such file").into_response(),
    }
}
