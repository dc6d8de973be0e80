use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
};

use super::JsonBody;
use crate::{
    AppState,
    auth::AuthUser,
    course::{self, Course, CourseDetail, CourseModule, NewCourse, NewModule, UpdateCourse, UpdateModule},
    error::{AppError, ErrorBody},
};

#[utoipa::path(
    get,
    path = "/api/courses",
    responses((status = 200, description = "All courses", body = Vec<Course>)),
    tag = "courses"
)]
pub async fn list_courses(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Course>>, AppError> {
    Ok(Json(course::list_courses(&state.database).await?))
}

#[utoipa::path(
    post,
    path = "/api/courses",
    request_body = NewCourse,
    responses(
        (status = 201, description = "Course created", body = Course),
        (status = 400, description = "Invalid input", body = ErrorBody),
        (status = 403, description = "Admins and lecturers only", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "courses"
)]
pub async fn create_course(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    JsonBody(req): JsonBody<NewCourse>,
) -> Result<(StatusCode, Json<Course>), AppError> {
    let course = course::create_course(&state.database, &caller, req).await?;
    Ok((StatusCode::CREATED, Json(course)))
}

#[utoipa::path(
    get,
    path = "/api/courses/{id}",
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Course with lecturer and modules", body = CourseDetail),
        (status = 404, description = "No such course", body = ErrorBody)
    ),
    tag = "courses"
)]
pub async fn get_course(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<CourseDetail>, AppError> {
    Ok(Json(course::get_course_detail(&state.database, id).await?))
}

#[utoipa::path(
    put,
    path = "/api/courses/{id}",
    params(("id" = i64, Path, description = "Course id")),
    request_body = UpdateCourse,
    responses(
        (status = 200, description = "Updated course", body = Course),
        (status = 403, description = "Not your course", body = ErrorBody),
        (status = 404, description = "No such course", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "courses"
)]
pub async fn update_course(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<i64>,
    JsonBody(req): JsonBody<UpdateCourse>,
) -> Result<Json<Course>, AppError> {
    Ok(Json(course::update_course(&state.database, &caller, id, req).await?))
}

#[utoipa::path(
    delete,
    path = "/api/courses/{id}",
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 204, description = "Course deleted"),
        (status = 400, description = "Course has enrollments", body = ErrorBody),
        (status = 403, description = "Not your course", body = ErrorBody),
        (status = 404, description = "No such course", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "courses"
)]
pub async fn delete_course(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    course::delete_course(&state.database, &caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/courses/{id}/modules",
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Modules in order", body = Vec<CourseModule>),
        (status = 404, description = "No such course", body = ErrorBody)
    ),
    tag = "courses"
)]
pub async fn list_modules(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<CourseModule>>, AppError> {
    if course::find_course(&state.database, id).await?.is_none() {
        return Err(AppError::not_found("Course"));
    }
    Ok(Json(course::list_modules(&state.database, id).await?))
}

#[utoipa::path(
    post,
    path = "/api/courses/{id}/modules",
    params(("id" = i64, Path, description = "Course id")),
    request_body = NewModule,
    responses(
        (status = 201, description = "Module added", body = CourseModule),
        (status = 403, description = "Not your course", body = ErrorBody),
        (status = 404, description = "No such course", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "courses"
)]
pub async fn add_module(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<i64>,
    JsonBody(req): JsonBody<NewModule>,
) -> Result<(StatusCode, Json<CourseModule>), AppError> {
    let module = course::add_module(&state.database, &caller, id, req).await?;
    Ok((StatusCode::CREATED, Json(module)))
}

#[utoipa::path(
    put,
    path = "/api/courses/{id}/modules/{module_id}",
    params(
        ("id" = i64, Path, description = "Course id"),
        ("module_id" = i64, Path, description = "Module id")
    ),
    request_body = UpdateModule,
    responses(
        (status = 200, description = "Updated module", body = CourseModule),
        (status = 403, description = "Not your course", body = ErrorBody),
        (status = 404, description = "No such course or module", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "courses"
)]
pub async fn update_module(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path((id, module_id)): Path<(i64, i64)>,
    JsonBody(req): JsonBody<UpdateModule>,
) -> Result<Json<CourseModule>, AppError> {
    let module = course::update_module(&state.database, &caller, id, module_id, req).await?;
    Ok(Json(module))
}

#[utoipa::path(
    delete,
    path = "/api/courses/{id}/modules/{module_id}",
    params(
        ("id" = i64, Path, description = "Course id"),
        ("module_id" = i64, Path, description = "Module id")
    ),
    responses(
        (status = 204, description = "Module deleted"),
        (status = 403, description = "Not your course", body = ErrorBody),
        (status = 404, description = "No such course or module", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "courses"
)]
pub async fn delete_module(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path((id, module_id)): Path<(i64, i64)>,
) -> Result<StatusCode, AppError> {
    course::delete_module(&state.database, &caller, id, module_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn get_course_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/courses",
        Router::new()
            .route("/", get(list_courses).post(create_course))
            .route("/{id}", get(get_course).put(update_course).delete(delete_course))
            .route("/{id}/modules", get(list_modules).post(add_module))
            .route("/{id}/modules/{module_id}", put(update_module).delete(delete_module)),
    )
}
