use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use actix_web::dev::Payload;
use actix_web::http::StatusCode;
use actix_web::{FromRequest, HttpRequest, HttpResponse, ResponseError, web};
use futures::future::{Ready, ready};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::auth::{Actor, Role, ensure_staff};
use crate::engine::{AppointmentPatch, BookingRequest, Candidate, Engine, EngineError, ListFilter};
use crate::model::{AppointmentStatus, Cabinet, SlotTime, parse_date};
use crate::observability;
use crate::tenant::ClinicManager;

pub const ACTOR_ID_HEADER: &str = "X-Actor-Id";
pub const ACTOR_ROLE_HEADER: &str = "X-Actor-Role";
pub const CLINIC_HEADER: &str = "X-Clinic";
pub const DEFAULT_CLINIC: &str = "default";

/// Shared across actix workers.
pub struct AppState {
    pub clinics: Arc<ClinicManager>,
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    Unauthorized(String),
    BadRequest(String),
    Unavailable(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Engine(e) => e.kind(),
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unavailable(_) => "unavailable",
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Engine(e) => write!(f, "{e}"),
            ApiError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            ApiError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            ApiError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflict: Option<&'a crate::engine::ConflictReport>,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Engine(e) => match e {
                EngineError::Validation(_) | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
                EngineError::Conflict(_) | EngineError::InvalidState(_) => StatusCode::CONFLICT,
                EngineError::NotFound(..) => StatusCode::NOT_FOUND,
                EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
                EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            ApiError::Engine(EngineError::Store(detail)) => {
                tracing::error!("store error: {detail}");
                "internal storage error".to_string()
            }
            ApiError::Engine(EngineError::Conflict(report)) => report.message.clone(),
            ApiError::Engine(EngineError::Validation(msg))
            | ApiError::Engine(EngineError::Forbidden(msg))
            | ApiError::Engine(EngineError::InvalidState(msg))
            | ApiError::Unauthorized(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Unavailable(msg) => msg.clone(),
            other => other.to_string(),
        };
        let conflict = match self {
            ApiError::Engine(EngineError::Conflict(report)) => Some(report),
            _ => None,
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            kind: self.kind(),
            message,
            conflict,
        })
    }
}

// ── Request context ────────────────────────────────────────────

/// The caller, as asserted by the authentication layer in front of us.
impl FromRequest for Actor {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(actor_from_headers(req).inspect_err(|_| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
        }))
    }
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn actor_from_headers(req: &HttpRequest) -> Result<Actor, ApiError> {
    let id = header(req, ACTOR_ID_HEADER)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {ACTOR_ID_HEADER} header")))?;
    let role = header(req, ACTOR_ROLE_HEADER)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {ACTOR_ROLE_HEADER} header")))?;
    let id: Ulid = id
        .parse()
        .map_err(|_| ApiError::Unauthorized(format!("invalid actor id '{id}'")))?;
    let role: Role = role.parse().map_err(ApiError::Unauthorized)?;
    Ok(Actor::new(id, role))
}

/// The engine of the clinic named by `X-Clinic`.
fn clinic(req: &HttpRequest, state: &AppState) -> Result<Arc<Engine>, ApiError> {
    let name = header(req, CLINIC_HEADER).unwrap_or(DEFAULT_CLINIC);
    state.clinics.get_or_create(name).map_err(|e| match e.kind() {
        std::io::ErrorKind::InvalidInput => ApiError::BadRequest(e.to_string()),
        _ => ApiError::Unavailable(e.to_string()),
    })
}

async fn timed<F>(operation: &'static str, handler: F) -> Result<HttpResponse, ApiError>
where
    F: Future<Output = Result<HttpResponse, ApiError>>,
{
    let started = Instant::now();
    let result = handler.await;
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    observability::record_request(operation, status, started);
    result
}

fn required_date(raw: Option<&str>) -> Result<chrono::NaiveDate, ApiError> {
    let raw = raw.ok_or_else(|| ApiError::BadRequest("date is required".into()))?;
    parse_date(raw).map_err(ApiError::BadRequest)
}

// ── Query and body types ───────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub date: Option<String>,
    #[serde(alias = "providerId")]
    pub dentist_id: Option<Ulid>,
    pub patient_id: Option<Ulid>,
    pub status: Option<AppointmentStatus>,
}

impl ListQuery {
    fn filter(&self) -> Result<ListFilter, ApiError> {
        Ok(ListFilter {
            date: self
                .date
                .as_deref()
                .map(parse_date)
                .transpose()
                .map_err(ApiError::BadRequest)?,
            provider_id: self.dentist_id,
            patient_id: self.patient_id,
            status: self.status,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityQuery {
    pub date: Option<String>,
    #[serde(alias = "providerId")]
    pub dentist_id: Option<Ulid>,
    pub time_slot: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictQuery {
    pub date: String,
    pub time_slot: String,
    pub patient_id: Option<Ulid>,
    #[serde(alias = "providerId")]
    pub dentist_id: Option<Ulid>,
    pub cabinet: Option<u8>,
    pub exclude_appointment_id: Option<Ulid>,
}

// ── Handlers ───────────────────────────────────────────────────

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

async fn list_appointments(
    req: HttpRequest,
    state: web::Data<AppState>,
    actor: Actor,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, ApiError> {
    timed("list_appointments", async move {
        let engine = clinic(&req, &state)?;
        let appointments = engine.list_appointments(&actor, query.filter()?).await?;
        Ok(HttpResponse::Ok().json(appointments))
    })
    .await
}

async fn todays_appointments(
    req: HttpRequest,
    state: web::Data<AppState>,
    actor: Actor,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, ApiError> {
    timed("todays_appointments", async move {
        let engine = clinic(&req, &state)?;
        let appointments = engine.todays_appointments(&actor, query.filter()?).await?;
        Ok(HttpResponse::Ok().json(appointments))
    })
    .await
}

async fn get_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    actor: Actor,
    id: web::Path<Ulid>,
) -> Result<HttpResponse, ApiError> {
    timed("get_appointment", async move {
        let engine = clinic(&req, &state)?;
        let appointment = engine.get_appointment(&actor, *id).await?;
        Ok(HttpResponse::Ok().json(appointment))
    })
    .await
}

async fn create_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    actor: Actor,
    body: web::Json<BookingRequest>,
) -> Result<HttpResponse, ApiError> {
    timed("create_appointment", async move {
        let engine = clinic(&req, &state)?;
        let appointment = engine.create_appointment(&actor, body.into_inner()).await?;
        Ok(HttpResponse::Created().json(appointment))
    })
    .await
}

async fn book_for_patient(
    req: HttpRequest,
    state: web::Data<AppState>,
    actor: Actor,
    body: web::Json<BookingRequest>,
) -> Result<HttpResponse, ApiError> {
    timed("book_for_patient", async move {
        let engine = clinic(&req, &state)?;
        let appointment = engine.book_for_patient(&actor, body.into_inner()).await?;
        Ok(HttpResponse::Created().json(appointment))
    })
    .await
}

async fn update_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    actor: Actor,
    id: web::Path<Ulid>,
    body: web::Json<AppointmentPatch>,
) -> Result<HttpResponse, ApiError> {
    timed("update_appointment", async move {
        let engine = clinic(&req, &state)?;
        let appointment = engine
            .update_appointment(&actor, *id, body.into_inner())
            .await?;
        Ok(HttpResponse::Ok().json(appointment))
    })
    .await
}

async fn cancel_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    actor: Actor,
    id: web::Path<Ulid>,
) -> Result<HttpResponse, ApiError> {
    timed("cancel_appointment", async move {
        let engine = clinic(&req, &state)?;
        let appointment = engine.cancel_appointment(&actor, *id).await?;
        Ok(HttpResponse::Ok().json(appointment))
    })
    .await
}

async fn complete_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    actor: Actor,
    id: web::Path<Ulid>,
) -> Result<HttpResponse, ApiError> {
    timed("complete_appointment", async move {
        let engine = clinic(&req, &state)?;
        let appointment = engine.complete_appointment(&actor, *id).await?;
        Ok(HttpResponse::Ok().json(appointment))
    })
    .await
}

async fn delete_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    actor: Actor,
    id: web::Path<Ulid>,
) -> Result<HttpResponse, ApiError> {
    timed("delete_appointment", async move {
        let engine = clinic(&req, &state)?;
        engine.delete_appointment(&actor, *id).await?;
        Ok(HttpResponse::Ok().json(serde_json::json!({ "deleted": *id })))
    })
    .await
}

async fn check_availability(
    req: HttpRequest,
    state: web::Data<AppState>,
    _actor: Actor,
    query: web::Query<AvailabilityQuery>,
) -> Result<HttpResponse, ApiError> {
    timed("check_availability", async move {
        let engine = clinic(&req, &state)?;
        let date = required_date(query.date.as_deref())?;
        let slot = query
            .time_slot
            .as_deref()
            .map(str::parse::<SlotTime>)
            .transpose()
            .map_err(ApiError::BadRequest)?;
        let overview = engine.day_overview(date, query.dentist_id, slot).await?;
        Ok(HttpResponse::Ok().json(overview))
    })
    .await
}

async fn check_conflict(
    req: HttpRequest,
    state: web::Data<AppState>,
    actor: Actor,
    body: web::Json<ConflictQuery>,
) -> Result<HttpResponse, ApiError> {
    timed("check_conflict", async move {
        ensure_staff(&actor)?;
        let engine = clinic(&req, &state)?;
        let date = parse_date(&body.date).map_err(ApiError::BadRequest)?;
        let time_slot: SlotTime = body.time_slot.parse().map_err(ApiError::BadRequest)?;
        engine.schedule().check_slot(time_slot)?;
        let candidate = Candidate {
            date,
            time_slot,
            patient_id: body.patient_id,
            provider_id: body.dentist_id,
            cabinet: body.cabinet.map(Cabinet),
        };
        let report = engine
            .preview_conflict(candidate, body.exclude_appointment_id)
            .await;
        Ok(HttpResponse::Ok().json(report))
    })
    .await
}

/// Mount every route. Fixed paths are registered before `/{id}` so they are
/// not swallowed by it.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _| ApiError::BadRequest(err.to_string()).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _| ApiError::BadRequest(err.to_string()).into()),
    )
    .app_data(
        web::PathConfig::default()
            .error_handler(|err, _| ApiError::BadRequest(err.to_string()).into()),
    )
    .route("/health", web::get().to(health))
    .service(
        web::scope("/appointments")
            .route("", web::get().to(list_appointments))
            .route("", web::post().to(create_appointment))
            .route("/today", web::get().to(todays_appointments))
            .route("/check-availability", web::get().to(check_availability))
            .route("/check-conflict", web::post().to(check_conflict))
            .route("/book", web::post().to(book_for_patient))
            .route("/{id}", web::get().to(get_appointment))
            .route("/{id}", web::put().to(update_appointment))
            .route("/{id}", web::delete().to(delete_appointment))
            .route("/{id}/cancel", web::put().to(cancel_appointment))
            .route("/{id}/complete", web::put().to(complete_appointment)),
    );
}
