//! HTTP surface of the coordinator
//!
//! This module binds the scheduler, the task controllers, and the client
//! registry to the request router. Workers speak a deliberately small
//! protocol: they GET `/ping` and receive a single-line command, they POST
//! result uploads to `/<task>/<params>` (the params portion may contain
//! slashes), and they GET `/<task>/nothing-error/<params>` to report a
//! permanently failed job. Humans get `/manage` and `/clients`, and
//! `/quitquitquit` stops the service.
//!
//! Every piece of mutable state lives behind one mutex, so all scheduler and
//! store mutation is serialized; the only blocking operations while holding
//! it are the durable store writes.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

use crate::controller::{ControllerError, TaskController};
use crate::registry::{ClientRegistry, InvalidClientId, RegistryError};
use crate::scheduler::Scheduler;

/// Coordinator version reported on the management page
const COORDINATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Multipart field carrying the params echo of an uploaded result.
const FIELD_SID: &str = "article-sid";
/// Multipart field carrying the result payload.
const FIELD_DATA: &str = "article-data";
/// Multipart field listing fanned-out job ids discovered by an index task.
const FIELD_SIDS: &str = "sids";

/// One mounted task controller: its URL path segment, the action whose jobs
/// are seeded from this task's results (if any), and the controller itself.
pub struct ControllerEntry {
    pub path: String,
    pub fan_out: Option<String>,
    pub controller: TaskController,
}

/// Everything the handlers mutate, behind a single lock.
pub struct CoordinatorState {
    pub scheduler: Scheduler,
    pub registry: ClientRegistry,
    pub controllers: Vec<ControllerEntry>,
}

impl CoordinatorState {
    fn controller_by_path(&self, path: &str) -> Option<usize> {
        self.controllers.iter().position(|e| e.path == path)
    }

    fn controller_by_action(&self, action: &str) -> Option<usize> {
        self.controllers
            .iter()
            .position(|e| e.controller.action() == action)
    }
}

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<Mutex<CoordinatorState>>,
    /// Rearms the beat timer when the interval changes via `/manage`.
    pub interval_tx: watch::Sender<u64>,
    /// Shutdown signal, fed by `/quitquitquit` and the process signals.
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Creates the request router. Paths are part of the worker contract and
/// must not change.
pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route(shared::protocol::endpoints::PING, get(handle_ping))
        .route(
            shared::protocol::endpoints::MANAGE,
            get(handle_manage_status).post(handle_manage_update),
        )
        .route(shared::protocol::endpoints::CLIENTS, get(handle_clients))
        .route(shared::protocol::endpoints::QUITQUITQUIT, get(handle_quit))
        // The static segment wins over the upload wildcard below, so
        // `/<task>/nothing-error/...` never parses as an upload.
        .route("/{task}/nothing-error/{*params}", get(handle_nothing_error))
        .route("/{task}/{*params}", post(handle_result_upload))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// `GET /ping` - refresh the worker's liveness record and answer with the
/// next command: an assignment if work is ready, otherwise a SLEEP sized to
/// the worker's turn in the rotation.
async fn handle_ping(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<String, ApiError> {
    let mut state = app.state.lock().await;
    let client_id = state.registry.update_client_stats(&headers, false)?;
    let command = state.scheduler.ping(&client_id, false);
    Ok(command.render())
}

/// `POST /<task>/<params...>` - accept an uploaded result.
///
/// The artifact is persisted before the job is marked done, so a crash in
/// between leaves the job pending and it will simply be crawled again. A
/// duplicate upload overwrites the artifact and is answered with success.
/// The response body is the next command, always a SLEEP: a worker that just
/// hit the target site is never handed more work in the same round trip.
async fn handle_result_upload(
    State(app): State<AppState>,
    AxumPath((task, params)): AxumPath<(String, String)>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<String, ApiError> {
    // Reject unidentified workers before touching anything
    ClientRegistry::client_id(&headers)?;

    let fields = read_form(&mut multipart).await?;
    let sid = text_field(&fields, FIELD_SID)?;
    let data = fields
        .get(FIELD_DATA)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} field", FIELD_DATA)))?;
    if sid != params {
        // The form echo is authoritative; the path is informative
        warn!(task = %task, path_params = %params, sid = %sid,
            "Upload path does not match the submitted sid");
    }

    let mut state = app.state.lock().await;
    let state = &mut *state;
    let index = state
        .controller_by_path(&task)
        .ok_or_else(|| ApiError::UnknownTask(task.clone()))?;

    let first_time = !state.controllers[index].controller.is_done(&sid)?;
    state.controllers[index].controller.store_artifact(&sid, data)?;
    state.controllers[index]
        .controller
        .mark_job_done(&mut state.scheduler, &sid)?;

    // Index tasks list the jobs they discovered; seed them into the fan-out
    // controller. add_job is idempotent, so re-uploads are harmless.
    if let Some(fan_out) = state.controllers[index].fan_out.clone() {
        let sids = fields
            .get(FIELD_SIDS)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default();
        let target = state
            .controller_by_action(&fan_out)
            .ok_or_else(|| ApiError::Internal(format!("fan-out action {} not mounted", fan_out)))?;
        let mut added = 0usize;
        for new_params in sids.split_whitespace() {
            if state.controllers[target]
                .controller
                .add_job(&mut state.scheduler, new_params)?
            {
                added += 1;
            }
        }
        info!(task = %task, sid = %sid, discovered = sids.split_whitespace().count(),
            added, "Seeded fan-out jobs from uploaded result");
    }

    let client_id = state.registry.update_client_stats(&headers, first_time)?;
    info!(task = %task, sid = %sid, client_id = %client_id, "Result upload accepted");
    let command = state.scheduler.ping(&client_id, true);
    Ok(command.render())
}

/// `GET /<task>/nothing-error/<params...>` - a worker asserts the job is
/// permanently unfetchable. The job moves to the erroneous store and will
/// not be retried.
async fn handle_nothing_error(
    State(app): State<AppState>,
    AxumPath((task, params)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Result<String, ApiError> {
    ClientRegistry::client_id(&headers)?;

    let mut state = app.state.lock().await;
    let state = &mut *state;
    let index = state
        .controller_by_path(&task)
        .ok_or_else(|| ApiError::UnknownTask(task.clone()))?;
    state.controllers[index]
        .controller
        .mark_job_erroneous(&mut state.scheduler, &params)?;

    let client_id = state.registry.update_client_stats(&headers, false)?;
    warn!(task = %task, params = %params, client_id = %client_id,
        "Job reported as permanently failed");
    let command = state.scheduler.ping(&client_id, true);
    Ok(command.render())
}

#[derive(Debug, Deserialize)]
struct ManageForm {
    interval: u64,
}

/// `GET /manage` - the status page.
async fn handle_manage_status(State(app): State<AppState>) -> Result<Html<String>, ApiError> {
    let state = app.state.lock().await;
    Ok(Html(render_manage_page(&state)?))
}

/// `POST /manage` with form field `interval=<seconds>` - change the beat
/// period and rearm the beat timer.
async fn handle_manage_update(
    State(app): State<AppState>,
    Form(form): Form<ManageForm>,
) -> Result<Html<String>, ApiError> {
    if form.interval == 0 {
        return Err(ApiError::BadRequest("interval must be positive".to_string()));
    }
    let page = {
        let mut state = app.state.lock().await;
        state.scheduler.reschedule(form.interval);
        render_manage_page(&state)?
    };
    // Rearm the timer task; it beats immediately, like the legacy timer
    // restarting hot. send_replace so the new value sticks even while no
    // timer is listening (tests drive the scheduler by hand).
    app.interval_tx.send_replace(form.interval);
    Ok(Html(page))
}

/// `GET /clients` - the client registry status page.
async fn handle_clients(State(app): State<AppState>) -> Result<Html<String>, ApiError> {
    let state = app.state.lock().await;
    let page = state.registry.render(&state.scheduler)?;
    Ok(Html(page))
}

/// `GET /quitquitquit` - graceful shutdown.
async fn handle_quit(State(app): State<AppState>) -> impl IntoResponse {
    info!("Shutdown requested via /quitquitquit");
    let _ = app.shutdown_tx.send(());
    "Shutting down the coordinator.\n"
}

fn render_manage_page(state: &CoordinatorState) -> Result<String, ApiError> {
    let mut services = String::new();
    for entry in &state.controllers {
        services.push_str(&format!(
            "<h1>{} Status</h1>\n{}\n",
            entry.controller.action(),
            entry.controller.status_fragment()?
        ));
    }
    Ok(format!(
        "<html>\n<head><title>Manage Scheduler Parameters</title></head>\n<body>\n\
         <h1>Current Settings</h1>\n\
         <dl><dt>Interval</dt><dd>{interval} seconds</dd></dl>\n\
         <form action=\"manage\" method=\"post\">\n\
         New Interval: <input type=\"text\" name=\"interval\" />\n\
         <input type=\"submit\" value=\"Update\"/>\n\
         </form>\n\
         <h1>Scheduler Status</h1>\n\
         <dl>\n\
         <dt>Next beat in</dt><dd>{next_beat} seconds</dd>\n\
         <dt>Ready jobs</dt><dd>{ready}</dd>\n\
         <dt>Active jobs</dt><dd>{active}</dd>\n\
         <dt>Queued jobs</dt><dd>{queued}</dd>\n\
         <dt>Active Clients</dt><dd>{n_clients}</dd>\n\
         </dl>\n\
         {services}\
         <p><small> Coordinator v{version} </small></p>\n\
         </body>\n</html>\n",
        interval = state.scheduler.interval(),
        next_beat = state.scheduler.seconds_to_next_beat().max(0),
        ready = state.scheduler.ready_len(),
        active = state.scheduler.active_len(),
        queued = state.scheduler.queued_len(),
        n_clients = state.scheduler.peer_count(),
        services = services,
        version = COORDINATOR_VERSION,
    ))
}

/// Collect every multipart field into a name -> bytes map. Uploads are small
/// (one compressed page) so buffering them whole is fine; the router's body
/// limit bounds the worst case.
async fn read_form(multipart: &mut Multipart) -> Result<HashMap<String, Vec<u8>>, ApiError> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read field {}: {}", name, e)))?;
        fields.insert(name, data.to_vec());
    }
    Ok(fields)
}

fn text_field(fields: &HashMap<String, Vec<u8>>, name: &str) -> Result<String, ApiError> {
    let raw = fields
        .get(name)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} field", name)))?;
    String::from_utf8(raw.clone())
        .map_err(|_| ApiError::BadRequest(format!("field {} is not valid UTF-8", name)))
}

/// Errors surfaced to the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid client id")]
    InvalidClientId,
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal server error: {0}")]
    Internal(String),
}

impl From<InvalidClientId> for ApiError {
    fn from(_: InvalidClientId) -> Self {
        ApiError::InvalidClientId
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidClientId(_) => ApiError::InvalidClientId,
            RegistryError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::UnknownJob(e) => ApiError::UnknownJob(e.to_string()),
            ControllerError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidClientId => StatusCode::BAD_REQUEST,
            ApiError::UnknownTask(_) => StatusCode::NOT_FOUND,
            ApiError::UnknownJob(_) => StatusCode::BAD_REQUEST,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            warn!(error = %self, "Request rejected");
        }
        (status, self.to_string()).into_response()
    }
}
