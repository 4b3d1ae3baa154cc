use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use abtest_api::{
    AbTestApi, LayoutConfigRequest, MigrateResult, RecordedMetric, SaveOutcome,
    StatusChangeRequest, API_CONTRACT_VERSION,
};
use abtest_core::{
    Assignment, Capability, Experiment, InsightDecode, LayoutConfig, MetricEventInput,
    MetricType, NewExperiment, NewVariant, Role, Variant, VariantComparison, VariantFunnel,
    VariantStepRates,
};
use abtest_store_sqlite::ResultsRecord;
use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const ACTOR_ID_HEADER: &str = "x-actor-id";
const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[derive(Debug, Clone)]
struct ServiceState {
    api: AbTestApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

/// Caller identity forwarded by the upstream session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Actor {
    subject_id: i64,
    role: Role,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RecordMetricRequest {
    experiment_id: i64,
    variant_id: i64,
    metric_type: MetricType,
    #[serde(default)]
    metric_value: Option<f64>,
    #[serde(default)]
    metric_label: Option<String>,
    #[serde(default)]
    page_url: Option<String>,
    #[serde(default)]
    step_number: Option<u32>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DecodeInsightsRequest {
    completion: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    write_conflict_total: AtomicU64,
    schema_unavailable_total: AtomicU64,
    access_denied_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    write_conflict_total: u64,
    schema_unavailable_total: u64,
    access_denied_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessChecks {
    current_schema_version: i64,
    target_schema_version: i64,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: ReadinessChecks,
}

#[derive(Debug, Parser)]
#[command(name = "abtest-service")]
#[command(about = "Local HTTP service for layout A/B experiments")]
struct Args {
    #[arg(long, env = "ABTEST_DB", default_value = "./abtest.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "ABTEST_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "ABTEST_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Fallback log filter when `RUST_LOG` is unset.
    #[arg(long, env = "ABTEST_LOG", default_value = "info")]
    log_filter: String,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl Actor {
    fn from_headers(headers: &HeaderMap) -> Result<Self, String> {
        let raw_id = header_value(headers, ACTOR_ID_HEADER)
            .ok_or_else(|| format!("missing {ACTOR_ID_HEADER} header"))?;
        let subject_id = raw_id
            .parse::<i64>()
            .map_err(|_| format!("{ACTOR_ID_HEADER} must be an integer subject id"))?;

        let raw_role = header_value(headers, ACTOR_ROLE_HEADER)
            .ok_or_else(|| format!("missing {ACTOR_ROLE_HEADER} header"))?;
        let role = Role::parse(&raw_role.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown role: {raw_role}"))?;

        Ok(Self { subject_id, role })
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    /// Resolves the caller and checks the route's capability before any work.
    fn authorize(
        &self,
        headers: &HeaderMap,
        capability: Capability,
    ) -> Result<Actor, ServiceFailure> {
        let actor = Actor::from_headers(headers).map_err(|message| {
            self.telemetry.record_failure("unauthenticated", false);
            Self::failure(StatusCode::UNAUTHORIZED, "unauthenticated", message, None)
        })?;

        if !actor.role.allows(capability) {
            self.telemetry.record_failure("forbidden", false);
            return Err(Self::failure(
                StatusCode::FORBIDDEN,
                "forbidden",
                format!(
                    "role {} is not allowed to {}",
                    actor.role.as_str(),
                    capability.as_str()
                ),
                Some(json!({
                    "role": actor.role.as_str(),
                    "capability": capability.as_str()
                })),
            ));
        }

        Ok(actor)
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        let diagnostic = format!("{err:#}");
        let normalized = diagnostic.to_ascii_lowercase();

        if normalized.contains("not found") {
            return Self::failure(StatusCode::NOT_FOUND, "not_found", message, None);
        }

        if normalized.contains("unique constraint failed")
            || normalized.contains("foreign key constraint failed")
            || normalized.contains("already exists")
        {
            return Self::failure(StatusCode::CONFLICT, "write_conflict", message, None);
        }

        if normalized.contains("validation failed")
            || normalized.contains("invalid status transition")
            || normalized.contains("cannot be empty")
        {
            return Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None);
        }

        if normalized.contains("schema")
            || normalized.contains("no such table")
            || normalized.contains("sqlite")
            || normalized.contains("database")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "schema_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(AbTestApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let timeout_ms = self.timeout_ms();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                tracing::warn!(operation = operation_label, timeout_ms, "operation timed out");
                Self::failure(
                    default_status,
                    default_code,
                    format!("{operation_label} timed out after {timeout_ms} ms"),
                    Some(json!({ "timeout_ms": timeout_ms })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                tracing::warn!(
                    operation = operation_label,
                    code = failure.code,
                    error = %format!("{err:#}"),
                    "operation failed"
                );
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "not_found" => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "write_conflict" => {
                self.write_conflict_total.fetch_add(1, Ordering::Relaxed);
            }
            "schema_unavailable" => {
                self.schema_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "unauthenticated" | "forbidden" => {
                self.access_denied_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            write_conflict_total: self.write_conflict_total.load(Ordering::Relaxed),
            schema_unavailable_total: self.schema_unavailable_total.load(Ordering::Relaxed),
            access_denied_total: self.access_denied_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/experiments", post(experiment_create).get(experiment_list))
        .route("/v1/experiments/:experiment_id", get(experiment_show))
        .route("/v1/experiments/:experiment_id/status", post(experiment_status))
        .route("/v1/experiments/:experiment_id/variants", post(variant_create))
        .route("/v1/experiments/:experiment_id/assign", post(assign_subject))
        .route("/v1/experiments/:experiment_id/complete", post(complete_subject))
        .route("/v1/experiments/:experiment_id/layouts", post(layout_create))
        .route("/v1/experiments/:experiment_id/layout", get(layout_for_caller))
        .route("/v1/experiments/:experiment_id/comparison", get(comparison_show))
        .route("/v1/experiments/:experiment_id/results/save", post(results_save))
        .route("/v1/experiments/:experiment_id/results", get(results_show))
        .route("/v1/experiments/:experiment_id/step-rates", get(step_rates_show))
        .route("/v1/experiments/:experiment_id/funnel", get(funnel_show))
        .route(
            "/v1/experiments/:experiment_id/insights/context",
            get(insights_context),
        )
        .route(
            "/v1/experiments/:experiment_id/insights/decode",
            post(insights_decode),
        )
        .route("/v1/metrics", post(metric_record))
        .with_state(state)
}

fn init_tracing(fallback_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_filter);

    let state = ServiceState {
        api: AbTestApi::new(args.db.clone()),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %args.bind,
        db = %args.db.display(),
        operation_timeout_ms = args.operation_timeout_ms,
        "abtest service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms: state.timeout_ms(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let schema_status = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "schema_unavailable",
            "schema_status",
            |api| api.schema_status(),
        )
        .await?;

    let checks = ReadinessChecks {
        current_schema_version: schema_status.current_version,
        target_schema_version: schema_status.target_version,
    };

    if schema_status.up_to_date {
        return Ok(Json(envelope(ReadinessResponse {
            status: "ready",
            checks,
        })));
    }

    state.telemetry.record_failure("schema_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "schema_unavailable",
        "database schema is not ready; run /v1/db/migrate before serving traffic",
        Some(json!({
            "current_version": schema_status.current_version,
            "target_version": schema_status.target_version
        })),
    ))
}

async fn openapi() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/yaml; charset=utf-8")],
        OPENAPI_YAML,
    )
}

async fn db_migrate(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceFailure> {
    state.authorize(&headers, Capability::ManageExperiments)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let result = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "migration_failed",
            "migrate",
            move |api| api.migrate(request.dry_run),
        )
        .await?;
    Ok(Json(envelope(result)))
}

async fn experiment_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<NewExperiment>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Experiment>>, ServiceFailure> {
    state.authorize(&headers, Capability::ManageExperiments)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let experiment = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "experiment_create",
            move |api| api.create_experiment(&request),
        )
        .await?;
    Ok(Json(envelope(experiment)))
}

async fn experiment_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Experiment>>>, ServiceFailure> {
    state.authorize(&headers, Capability::ViewResults)?;
    let experiments = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "experiment_list",
            |api| api.list_experiments(),
        )
        .await?;
    Ok(Json(envelope(experiments)))
}

async fn experiment_show(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Experiment>>, ServiceFailure> {
    state.authorize(&headers, Capability::ViewResults)?;
    let experiment = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "experiment_show",
            move |api| api.get_experiment(experiment_id),
        )
        .await?;
    Ok(Json(envelope(experiment)))
}

async fn experiment_status(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<StatusChangeRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Experiment>>, ServiceFailure> {
    state.authorize(&headers, Capability::ManageExperiments)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let experiment = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "experiment_status",
            move |api| api.update_status(experiment_id, request.status),
        )
        .await?;
    Ok(Json(envelope(experiment)))
}

async fn variant_create(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<NewVariant>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Variant>>, ServiceFailure> {
    state.authorize(&headers, Capability::ManageExperiments)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let variant = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "variant_create",
            move |api| api.create_variant(experiment_id, &request),
        )
        .await?;
    Ok(Json(envelope(variant)))
}

async fn assign_subject(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Option<Assignment>>>, ServiceFailure> {
    let actor = state.authorize(&headers, Capability::RecordMetrics)?;
    let assignment = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "assign_subject",
            move |api| api.assign_subject(experiment_id, actor.subject_id),
        )
        .await?;
    Ok(Json(envelope(assignment)))
}

async fn complete_subject(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Option<Assignment>>>, ServiceFailure> {
    let actor = state.authorize(&headers, Capability::RecordMetrics)?;
    let assignment = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "complete_subject",
            move |api| api.mark_completed(experiment_id, actor.subject_id),
        )
        .await?;
    Ok(Json(envelope(assignment)))
}

async fn layout_create(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<LayoutConfigRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<LayoutConfig>>, ServiceFailure> {
    state.authorize(&headers, Capability::ManageExperiments)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let config = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "layout_create",
            move |api| api.create_layout_config(experiment_id, &request),
        )
        .await?;
    Ok(Json(envelope(config)))
}

async fn layout_for_caller(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Option<LayoutConfig>>>, ServiceFailure> {
    let actor = state.authorize(&headers, Capability::RecordMetrics)?;
    let config = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "layout_for_caller",
            move |api| api.layout_config_for_subject(experiment_id, actor.subject_id),
        )
        .await?;
    Ok(Json(envelope(config)))
}

async fn comparison_show(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Option<VariantComparison>>>, ServiceFailure> {
    state.authorize(&headers, Capability::ViewResults)?;
    let comparison = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "comparison_show",
            move |api| Ok(api.get_comparison(experiment_id)),
        )
        .await?;
    Ok(Json(envelope(comparison)))
}

async fn results_save(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<SaveOutcome>>, ServiceFailure> {
    state.authorize(&headers, Capability::ManageExperiments)?;
    let outcome = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "results_save",
            move |api| api.save_results(experiment_id),
        )
        .await?;
    Ok(Json(envelope(outcome)))
}

async fn results_show(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Option<ResultsRecord>>>, ServiceFailure> {
    state.authorize(&headers, Capability::ViewResults)?;
    let record = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "results_show",
            move |api| api.get_results(experiment_id),
        )
        .await?;
    Ok(Json(envelope(record)))
}

async fn step_rates_show(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<BTreeMap<i64, VariantStepRates>>>, ServiceFailure> {
    state.authorize(&headers, Capability::ViewResults)?;
    let rates = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "step_rates_show",
            move |api| Ok(api.step_completion_rates(experiment_id)),
        )
        .await?;
    Ok(Json(envelope(rates)))
}

async fn funnel_show(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<VariantFunnel>>>, ServiceFailure> {
    state.authorize(&headers, Capability::ViewResults)?;
    let funnel = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "funnel_show",
            move |api| Ok(api.conversion_funnel(experiment_id)),
        )
        .await?;
    Ok(Json(envelope(funnel)))
}

async fn insights_context(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<serde_json::Value>>, ServiceFailure> {
    state.authorize(&headers, Capability::ViewResults)?;
    let context = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "insights_context",
            move |api| api.insight_context(experiment_id),
        )
        .await?;
    Ok(Json(envelope(context)))
}

async fn insights_decode(
    State(state): State<ServiceState>,
    Path(experiment_id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<DecodeInsightsRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<InsightDecode>>, ServiceFailure> {
    state.authorize(&headers, Capability::ViewResults)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let decoded = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "insights_decode",
            move |api| api.decode_insights(experiment_id, &request.completion),
        )
        .await?;
    Ok(Json(envelope(decoded)))
}

async fn metric_record(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<RecordMetricRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<RecordedMetric>>, ServiceFailure> {
    let actor = state.authorize(&headers, Capability::RecordMetrics)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let input = MetricEventInput {
        experiment_id: request.experiment_id,
        variant_id: request.variant_id,
        subject_id: actor.subject_id,
        metric_type: request.metric_type,
        metric_value: request.metric_value,
        metric_label: request.metric_label,
        page_url: request.page_url,
        step_number: request.step_number,
        session_id: request.session_id,
    };
    let recorded = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "metric_record",
            move |api| api.record_metric(&input),
        )
        .await?;
    Ok(Json(envelope(recorded)))
}
