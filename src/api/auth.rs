use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::Deserialize;
use utoipa::ToSchema;

use super::JsonBody;
use crate::{
    AppState,
    auth::AuthUser,
    error::{AppError, ErrorBody},
    user::{self, LoginResponse, UserInfo},
};

#[derive(Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "Student account created", body = UserInfo),
        (status = 400, description = "Invalid input or email taken", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<RegisterRequest>,
) -> Result<Json<UserInfo>, AppError> {
    let RegisterRequest {
        name,
        email,
        password,
        phone,
    } = req;
    let user = user::register(&state.database, name, email, password, phone).await?;
    Ok(Json(user))
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let LoginRequest { email, password } = req;
    let response = user::login(&state.database, &state.tokens, &email, &password).await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "The calling user", body = UserInfo),
        (status = 401, description = "Unauthorized", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn me(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
) -> Result<Json<UserInfo>, AppError> {
    let user = user::get_user(&state.database, &caller, caller.id).await?;
    Ok(Json(user))
}

pub fn get_auth_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/auth",
        Router::new()
            .route("/register", post(register))
            .route("/login", post(login))
            .route("/me", get(me)),
    )
}
