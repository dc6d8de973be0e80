use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};

use super::JsonBody;
use crate::{
    AppState,
    auth::AuthUser,
    enrollment::{self, Enrollment, EnrollmentDetail, NewEnrollment, UpdateEnrollment},
    error::{AppError, ErrorBody},
};

#[utoipa::path(
    get,
    path = "/api/enrollments",
    responses(
        (status = 200, description = "Enrollments visible to the caller", body = Vec<EnrollmentDetail>),
        (status = 401, description = "Unauthorized", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "enrollments"
)]
pub async fn list_enrollments(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
) -> Result<Json<Vec<EnrollmentDetail>>, AppError> {
    Ok(Json(enrollment::list_enrollments(&state.database, &caller).await?))
}

#[utoipa::path(
    post,
    path = "/api/enrollments",
    request_body = NewEnrollment,
    responses(
        (status = 201, description = "Enrolled", body = Enrollment),
        (status = 400, description = "Already enrolled", body = ErrorBody),
        (status = 403, description = "Students only", body = ErrorBody),
        (status = 404, description = "No such course", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "enrollments"
)]
pub async fn create_enrollment(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    JsonBody(req): JsonBody<NewEnrollment>,
) -> Result<(StatusCode, Json<Enrollment>), AppError> {
    let enrollment = enrollment::create_enrollment(&state.database, &caller, req).await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

#[utoipa::path(
    get,
    path = "/api/enrollments/{id}",
    params(("id" = i64, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment with student and course", body = EnrollmentDetail),
        (status = 403, description = "Not visible to the caller", body = ErrorBody),
        (status = 404, description = "No such enrollment", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "enrollments"
)]
pub async fn get_enrollment(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<EnrollmentDetail>, AppError> {
    Ok(Json(enrollment::get_enrollment(&state.database, &caller, id).await?))
}

#[utoipa::path(
    put,
    path = "/api/enrollments/{id}",
    params(("id" = i64, Path, description = "Enrollment id")),
    request_body = UpdateEnrollment,
    responses(
        (status = 200, description = "Updated enrollment", body = Enrollment),
        (status = 403, description = "Admins only", body = ErrorBody),
        (status = 404, description = "No such enrollment", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "enrollments"
)]
pub async fn update_enrollment(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<i64>,
    JsonBody(req): JsonBody<UpdateEnrollment>,
) -> Result<Json<Enrollment>, AppError> {
    Ok(Json(
        enrollment::update_enrollment(&state.database, &caller, id, req).await?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/enrollments/{id}/cancel",
    params(("id" = i64, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Cancelled enrollment", body = Enrollment),
        (status = 400, description = "Already completed", body = ErrorBody),
        (status = 403, description = "Not your enrollment", body = ErrorBody),
        (status = 404, description = "No such enrollment", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "enrollments"
)]
pub async fn cancel_enrollment(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Enrollment>, AppError> {
    Ok(Json(enrollment::cancel_enrollment(&state.database, &caller, id).await?))
}

pub fn get_enrollment_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/enrollments",
        Router::new()
            .route("/", get(list_enrollments).post(create_enrollment))
            .route("/{id}", get(get_enrollment).put(update_enrollment))
            .route("/{id}/cancel", post(cancel_enrollment)),
    )
}
