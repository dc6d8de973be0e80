pub mod auth;
pub mod course;
pub mod enrollment;
pub mod payment;
pub mod user;

use std::{sync::Arc, time::Duration};

use axum::{Router, extract::FromRequest, http::StatusCode};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::{AppState, error::AppError};

/// `axum::Json` whose rejections are reported like every other error.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct JsonBody<T>(pub T);

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(title = "LMS API", description = "Users, courses, enrollments and OTP-confirmed payments"),
    paths(
        auth::register,
        auth::login,
        auth::me,
        user::list_users,
        user::create_user,
        user::get_user,
        user::update_user,
        user::delete_user,
        course::list_courses,
        course::create_course,
        course::get_course,
        course::update_course,
        course::delete_course,
        course::list_modules,
        course::add_module,
        course::update_module,
        course::delete_module,
        enrollment::list_enrollments,
        enrollment::create_enrollment,
        enrollment::get_enrollment,
        enrollment::update_enrollment,
        enrollment::cancel_enrollment,
        payment::generate_otp,
        payment::verify_otp,
        payment::resend_otp,
        payment::list_payments,
        payment::get_payment,
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "auth", description = "Sign-up and login"),
        (name = "users", description = "User accounts"),
        (name = "courses", description = "Courses and their modules"),
        (name = "enrollments", description = "Student enrollments"),
        (name = "payments", description = "Enrollment payments confirmed by OTP"),
    )
)]
pub struct ApiDoc;

pub fn get_openapi_json() -> anyhow::Result<String> {
    Ok(ApiDoc::openapi().to_pretty_json()?)
}

/// The whole HTTP surface: `/api/*`, the OpenAPI document and Swagger UI.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .merge(auth::get_auth_scope())
        .merge(user::get_user_scope())
        .merge(course::get_course_scope())
        .merge(enrollment::get_enrollment_scope())
        .merge(payment::get_payment_scope());
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api", api)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
