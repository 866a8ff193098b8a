//! HTTP routes for the registration and login ceremonies

use crate::auth::SessionError;
use crate::models::{CeremonyId, UserId};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::security::security_headers;
use crate::AppContext;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

const USER_NOT_FOUND: &str = "user not found!";
const REGISTRATION_FAILED: &str = "could not verify!";
const LOGIN_FAILED: &str = "something went wrong!";

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    pub user_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub options: Value,
    pub ceremony_id: CeremonyId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub user_id: UserId,
    pub cred: Value,
    /// Older clients only send the user id
    #[serde(default)]
    pub ceremony_id: Option<CeremonyId>,
}

#[derive(Debug, Serialize)]
pub struct RegisterVerifyResponse {
    pub verified: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginVerifyResponse {
    pub success: bool,
    pub user_id: UserId,
}

/// `Json` body whose rejection is reported as an [`ApiError`]
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Failure of an HTTP call
#[derive(Debug)]
pub enum ApiError {
    Session(SessionError),
    NotVerified(&'static str),
    InvalidBody(JsonRejection),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidBody(rejection)
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        ApiError::Session(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotVerified(message) => (StatusCode::UNAUTHORIZED, json!({ "error": message })),
            ApiError::InvalidBody(rejection) => {
                warn!("Rejected request body: {}", rejection.body_text());
                (
                    StatusCode::BAD_REQUEST,
                    json!({ "error": rejection.body_text() }),
                )
            }
            ApiError::Session(SessionError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, json!({ "msg": USER_NOT_FOUND }))
            }
            ApiError::Session(
                e @ (SessionError::InvalidInput(_)
                | SessionError::NoChallengeIssued(_)
                | SessionError::NoCredentialEnrolled(_)
                | SessionError::MalformedResponse(_)),
            ) => {
                warn!("Rejected request: {}", e);
                (StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
            }
            ApiError::Session(e) => {
                error!("Request failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

pub fn create_router(context: AppContext) -> Router {
    let config = context.config.clone();

    let cors = match HeaderValue::from_str(&config.webauthn.rp_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]),
        Err(e) => {
            warn!("rp_origin is not a valid header value ({}), cross-origin requests disabled", e);
            CorsLayer::new()
        }
    };

    let mut ceremonies = Router::new()
        .route("/register", post(register_handler))
        .route("/register-challenge", post(register_challenge_handler))
        .route("/register-verify", post(register_verify_handler))
        .route("/login-challenge", post(login_challenge_handler))
        .route("/login-verify", post(login_verify_handler));

    if config.rate_limit.enabled {
        ceremonies = ceremonies.route_layer(middleware::from_fn_with_state(
            RateLimiter::from_config(&config.rate_limit),
            rate_limit_middleware,
        ));
    }

    Router::new()
        .merge(ceremonies)
        .route("/health", get(health_handler))
        .fallback_service(ServeDir::new(&config.static_dir))
        .layer(middleware::from_fn(security_headers))
        .layer(RequestBodyLimitLayer::new(config.body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(context)
}

async fn register_handler(
    State(ctx): State<AppContext>,
    ApiJson(body): ApiJson<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let id = ctx
        .coordinator
        .create_user(&body.username, &body.password)
        .await?;
    Ok(Json(RegisterResponse { id }))
}

async fn register_challenge_handler(
    State(ctx): State<AppContext>,
    ApiJson(body): ApiJson<ChallengeRequest>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let issued = ctx.coordinator.begin_registration(&body.user_id).await?;
    Ok(Json(ChallengeResponse {
        options: issued.options,
        ceremony_id: issued.ceremony_id,
    }))
}

async fn register_verify_handler(
    State(ctx): State<AppContext>,
    ApiJson(body): ApiJson<VerifyRequest>,
) -> Result<Json<RegisterVerifyResponse>, ApiError> {
    let verified = ctx
        .coordinator
        .complete_registration(&body.user_id, body.ceremony_id.as_ref(), &body.cred)
        .await?;

    if !verified {
        return Err(ApiError::NotVerified(REGISTRATION_FAILED));
    }
    Ok(Json(RegisterVerifyResponse { verified }))
}

async fn login_challenge_handler(
    State(ctx): State<AppContext>,
    ApiJson(body): ApiJson<ChallengeRequest>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let issued = ctx.coordinator.begin_authentication(&body.user_id).await?;
    Ok(Json(ChallengeResponse {
        options: issued.options,
        ceremony_id: issued.ceremony_id,
    }))
}

async fn login_verify_handler(
    State(ctx): State<AppContext>,
    ApiJson(body): ApiJson<VerifyRequest>,
) -> Result<Json<LoginVerifyResponse>, ApiError> {
    let outcome = ctx
        .coordinator
        .complete_authentication(&body.user_id, body.ceremony_id.as_ref(), &body.cred)
        .await?;

    if !outcome.verified {
        return Err(ApiError::NotVerified(LOGIN_FAILED));
    }
    Ok(Json(LoginVerifyResponse {
        success: true,
        user_id: outcome.user_id,
    }))
}

async fn health_handler(State(ctx): State<AppContext>) -> Result<Json<Value>, ApiError> {
    let users = ctx
        .coordinator
        .users()
        .user_count()
        .await
        .map_err(SessionError::from)?;

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "users": users,
    })))
}
