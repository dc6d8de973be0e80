use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Deserialize;
use utoipa::ToSchema;

use super::JsonBody;
use crate::{
    AppState,
    auth::AuthUser,
    error::{AppError, ErrorBody},
    payment::{OtpIssued, PaymentMethod, PaymentSummary},
};

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateOtpRequest {
    pub enrollment_id: i64,
    pub payment_method: PaymentMethod,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpRequest {
    pub payment_id: i64,
    pub otp: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResendOtpRequest {
    pub payment_id: i64,
}

#[utoipa::path(
    post,
    path = "/api/payments/generate-otp",
    request_body = GenerateOtpRequest,
    responses(
        (status = 200, description = "OTP stored and mailed", body = OtpIssued),
        (status = 400, description = "Enrollment cannot be paid", body = ErrorBody),
        (status = 403, description = "Not your enrollment", body = ErrorBody),
        (status = 404, description = "No such enrollment", body = ErrorBody),
        (status = 409, description = "Payment already completed", body = ErrorBody),
        (status = 500, description = "OTP stored but the mail could not be sent", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "payments"
)]
pub async fn generate_otp(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    JsonBody(req): JsonBody<GenerateOtpRequest>,
) -> Result<Json<OtpIssued>, AppError> {
    let issued = state
        .payments
        .issue_otp(&caller, req.enrollment_id, req.payment_method)
        .await?;
    Ok(Json(issued))
}

#[utoipa::path(
    post,
    path = "/api/payments/verify-otp",
    request_body = VerifyOtpRequest,
    responses(
        (status = 200, description = "Payment completed", body = PaymentSummary),
        (status = 400, description = "Wrong, expired or exhausted OTP; attemptsLeft is set for wrong codes", body = ErrorBody),
        (status = 403, description = "Not your payment", body = ErrorBody),
        (status = 404, description = "No such payment", body = ErrorBody),
        (status = 409, description = "The challenge changed concurrently", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "payments"
)]
pub async fn verify_otp(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    JsonBody(req): JsonBody<VerifyOtpRequest>,
) -> Result<Json<PaymentSummary>, AppError> {
    let summary = state
        .payments
        .verify_otp(&caller, req.payment_id, &req.otp)
        .await?;
    Ok(Json(summary))
}

#[utoipa::path(
    post,
    path = "/api/payments/resend-otp",
    request_body = ResendOtpRequest,
    responses(
        (status = 200, description = "New OTP stored and mailed", body = OtpIssued),
        (status = 403, description = "Not your payment", body = ErrorBody),
        (status = 404, description = "No such payment", body = ErrorBody),
        (status = 409, description = "Payment already completed", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "payments"
)]
pub async fn resend_otp(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    JsonBody(req): JsonBody<ResendOtpRequest>,
) -> Result<Json<OtpIssued>, AppError> {
    Ok(Json(state.payments.resend_otp(&caller, req.payment_id).await?))
}

#[utoipa::path(
    get,
    path = "/api/payments",
    responses(
        (status = 200, description = "Payments visible to the caller", body = Vec<PaymentSummary>),
        (status = 401, description = "Unauthorized", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "payments"
)]
pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
) -> Result<Json<Vec<PaymentSummary>>, AppError> {
    Ok(Json(state.payments.list_payments(&caller).await?))
}

#[utoipa::path(
    get,
    path = "/api/payments/{id}",
    params(("id" = i64, Path, description = "Payment id")),
    responses(
        (status = 200, description = "The payment", body = PaymentSummary),
        (status = 403, description = "Not visible to the caller", body = ErrorBody),
        (status = 404, description = "No such payment", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "payments"
)]
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    caller: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<PaymentSummary>, AppError> {
    Ok(Json(state.payments.get_payment(&caller, id).await?))
}

pub fn get_payment_scope() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/payments",
        Router::new()
            .route("/", get(list_payments))
            .route("/generate-otp", post(generate_otp))
            .route("/verify-otp", post(verify_otp))
            .route("/resend-otp", post(resend_otp))
            .route("/{id}", get(get_payment)),
    )
}
