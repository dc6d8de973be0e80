use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;
use utoipa::IntoParams;

use super::JsonBody;
use crate::{
    AppState,
    auth::{AuthUser, Role},
    error::{AppError, ErrorBody},
    user::{self, NewUser, UpdateUser, UserInfo},
};

#[derive(Deserialize, IntoParams)]
pub struct UserFilter {
    /// Only list users with this role
    pub role: Option<Role>,
}

#[utoipa::path(
    get,
    path = "/api/users",
    params(UserFilter),
    responses(
        (status = 200, description = "All users", body = Vec<UserInfo>),
        (status = 401, description = "Unauthorized", body = ErrorBody),
        (status = 403, description = "Admins only", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Query(filter): Query<UserFilter>,
) -> Result<Json<Vec<UserInfo>>, AppError> {
    let users = user::list_users(&state.database, &caller, filter.role).await?;
    Ok(Json(users))
}

#[utoipa::path(
    post,
    path = "/api/users",
    request_body = NewUser,
    responses(
        (status = 201, description = "User created", body = UserInfo),
        (status = 400, description = "Invalid input or email taken", body = ErrorBody),
        (status = 403, description = "Admins only", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    JsonBody(req): JsonBody<NewUser>,
) -> Result<(StatusCode, Json<UserInfo>), AppError> {
    caller.require(&[Role::Admin])?;
    let user = user::create_user(&state.database, req).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[utoipa::path(
    get,
    path = "/api/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "The user", body = UserInfo),
        (status = 403, description = "Not yourself", body = ErrorBody),
        (status = 404, description = "No such user", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<UserInfo>, AppError> {
    Ok(Json(user::get_user(&state.database, &caller, id).await?))
}

#[utoipa::path(
    put,
    path = "/api/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    request_body = UpdateUser,
    responses(
        (status = 200, description = "Updated user", body = UserInfo),
        (status = 400, description = "Invalid input", body = ErrorBody),
        (status = 403, description = "Not yourself, or a role change by a non-admin", body = ErrorBody),
        (status = 404, description = "No such user", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<i64>,
    JsonBody(req): JsonBody<UpdateUser>,
) -> Result<Json<UserInfo>, AppError> {
    Ok(Json(user::update_user(&state.database, &caller, id, req).await?))
}

#[utoipa::path(
    delete,
    path = "/api/users/{id}",
    params(("id" = i64, Path, description = "User id")),
    responses(
        (status = 204, description = "User deleted"),
        (status = 400, description = "User is still referenced", body = ErrorBody),
        (status = 403, description = "Admins only", body = ErrorBody),
        (status = 404, description = "No such user", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "users"
)]
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    user::delete_user(&state.database, &caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn get_user_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/users",
        Router::new()
            .route("/", get(list_users).post(create_user))
            .route("/{id}", get(get_user).put(update_user).delete(delete_user)),
    )
}
