//! HTTP route handlers for the protocol API.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use labscript::controller::{Pipeline, Session, SessionReport, run_session};
use labscript::core::budget::CancelToken;
use labscript::core::feedback::extract_feedback;
use labscript::core::types::{IterationEvent, SimulationResult};
use labscript::io::generator::CommandGenerator;
use labscript::io::reporter::{EventLog, Fanout, TracingSink};
use labscript::io::simulator::Simulator;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::sse::BroadcastSink;
use crate::state::AppState;

/// Number of trailing events returned with a failed generation.
const FAILURE_LOG_TAIL: usize = 5;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/generate-protocol-code", post(generate_protocol_code))
        .route("/simulate-protocol", post(simulate_protocol))
}

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn internal(error: &str, message: impl ToString) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({
                "error": error,
                "message": message.to_string(),
                "timestamp": timestamp(),
            }),
        }
    }

    fn bad_request(message: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({
                "error": "Invalid request",
                "message": message.to_string(),
                "timestamp": timestamp(),
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: String,
}

/// GET /api/health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: timestamp(),
    })
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub sop_markdown: String,
    pub hardware_config: String,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub success: bool,
    pub generated_code: String,
    pub attempts: u32,
    pub warnings: Vec<String>,
    pub iteration_logs: Vec<IterationEvent>,
    pub timestamp: String,
}

/// POST /api/generate-protocol-code
#[instrument(skip_all)]
async fn generate_protocol_code(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let max_attempts = request
        .max_attempts
        .unwrap_or(state.controller.default_max_attempts);
    let session = Session::new(&request.sop_markdown, &request.hardware_config, max_attempts)
        .map_err(ApiError::bad_request)?;
    let session_id = state.next_session_id();
    info!(session_id, max_attempts, "starting generation session");

    let cancel = CancelToken::new();
    // Dropping the request future (client gone) cancels the running session.
    let guard = cancel.cancel_on_drop();
    let worker_state = state.clone();
    let worker_cancel = cancel.clone();
    let joined = tokio::task::spawn_blocking(move || {
        run_generation(&worker_state, session, session_id, worker_cancel)
    })
    .await;
    guard.disarm();

    let (report, log) = joined
        .map_err(|err| ApiError::internal("Generation task failed", err))?
        .map_err(|err| ApiError::internal("Generator unavailable", format!("{err:#}")))?;
    generation_response(&report, &log, timestamp()).map(Json)
}

fn run_generation(
    state: &AppState,
    session: Session,
    session_id: u64,
    cancel: CancelToken,
) -> anyhow::Result<(SessionReport, EventLog)> {
    let generator = CommandGenerator::from_config(&state.config.generator, cancel.clone())?;
    let pipeline = Pipeline {
        generator: &generator,
        simulator: state.simulator.as_ref(),
        config: state.controller.as_ref(),
        cancel: &cancel,
    };
    let mut sink = Fanout(
        Fanout(
            EventLog::new(),
            BroadcastSink::new(session_id, state.event_tx.clone()),
        ),
        TracingSink,
    );
    let report = run_session(session, &pipeline, &mut sink);
    let Fanout(Fanout(log, _), _) = sink;
    Ok((report, log))
}

/// Map a finished session onto the response body, or a 500 carrying the
/// failure text and the last few events.
pub fn generation_response(
    report: &SessionReport,
    log: &EventLog,
    timestamp: String,
) -> Result<GenerateResponse, ApiError> {
    let attempts = report.attempts_used();
    let Some(code) = report.code() else {
        warn!(attempts, "generation failed");
        return Err(ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({
                "error": "Code generation failed",
                "details": report.render(),
                "attempts": attempts,
                "logs": log.tail(FAILURE_LOG_TAIL),
            }),
        });
    };

    let warnings = report
        .session
        .attempts()
        .last()
        .and_then(|attempt| attempt.result.as_ref())
        .filter(|result| result.has_warnings && !result.cleaned_stderr.is_empty())
        .map(|result| vec![result.cleaned_stderr.clone()])
        .unwrap_or_default();

    Ok(GenerateResponse {
        success: true,
        generated_code: code.to_string(),
        attempts,
        warnings,
        iteration_logs: log.events.clone(),
        timestamp,
    })
}

#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    pub protocol_code: String,
}

#[derive(Debug, Serialize)]
pub struct SimulateResponse {
    pub success: bool,
    pub raw_simulation_output: String,
    pub error_message: Option<String>,
    pub warnings_present: bool,
    pub warning_details: Option<String>,
    pub final_status_message: String,
    pub timestamp: String,
}

/// POST /api/simulate-protocol
#[instrument(skip_all)]
async fn simulate_protocol(
    State(state): State<AppState>,
    Json(request): Json<SimulateRequest>,
) -> Result<Json<SimulateResponse>, ApiError> {
    let cancel = CancelToken::new();
    let guard = cancel.cancel_on_drop();
    let simulator = state.simulator.clone();
    let worker_cancel = cancel.clone();
    let joined = tokio::task::spawn_blocking(move || {
        simulator.run(&request.protocol_code, &worker_cancel)
    })
    .await;
    guard.disarm();

    let result = joined
        .map_err(|err| ApiError::internal("Simulation task failed", err))?
        .map_err(|err| ApiError::internal("Simulation failed", format!("{err:#}")))?;
    info!(status = result.status_label.as_str(), "simulation finished");
    Ok(Json(simulation_response(&result, timestamp())))
}

pub fn simulation_response(result: &SimulationResult, timestamp: String) -> SimulateResponse {
    let error_message = result.error_details().map(|cleaned| {
        if cleaned.is_empty() {
            extract_feedback(&result.output_text())
        } else {
            cleaned.to_string()
        }
    });
    let warning_details = result
        .has_warnings
        .then(|| result.cleaned_stderr.clone());

    SimulateResponse {
        success: result.success,
        raw_simulation_output: result.transcript.clone(),
        error_message,
        warnings_present: result.has_warnings,
        warning_details,
        final_status_message: result.status_label.final_status_message().to_string(),
        timestamp,
    }
}
