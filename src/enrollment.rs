use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use time::{Date, OffsetDateTime};
use tracing::info;
use utoipa::ToSchema;

use crate::{
    auth::{AuthUser, Role},
    course,
    error::{AppError, is_unique_violation},
    payment,
    user::UserSummary,
    utils::now_utc,
};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Enrolled,
    Completed,
    Cancelled,
}

/// Whether the course fee has been paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
pub enum FeeStatus {
    Pending,
    Paid,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub status: EnrollmentStatus,
    pub payment_status: FeeStatus,
    pub batch: String,
    pub phone: String,
    #[serde(with = "iso_date::option", default)]
    pub starting_date: Option<Date>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CourseSummary {
    pub id: i64,
    pub title: String,
    pub price_cents: i64,
}

/// An enrollment with its student and course filled in
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EnrollmentDetail {
    #[serde(flatten)]
    pub enrollment: Enrollment,
    pub student: UserSummary,
    pub course: CourseSummary,
}

#[derive(sqlx::FromRow)]
struct EnrollmentDetailRow {
    #[sqlx(flatten)]
    enrollment: Enrollment,
    student_name: String,
    student_email: String,
    course_title: String,
    course_price_cents: i64,
}

impl From<EnrollmentDetailRow> for EnrollmentDetail {
    fn from(row: EnrollmentDetailRow) -> Self {
        Self {
            student: UserSummary {
                id: row.enrollment.student_id,
                name: row.student_name,
                email: row.student_email,
            },
            course: CourseSummary {
                id: row.enrollment.course_id,
                title: row.course_title,
                price_cents: row.course_price_cents,
            },
            enrollment: row.enrollment,
        }
    }
}

const DETAIL_SELECT: &str = "SELECT e.*, s.name AS student_name, s.email AS student_email,
        c.title AS course_title, c.price_cents AS course_price_cents
    FROM enrollment e
    JOIN user_account s ON s.id = e.student_id
    JOIN course c ON c.id = e.course_id";

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewEnrollment {
    pub course_id: i64,
    #[serde(default)]
    pub batch: String,
    #[serde(default)]
    pub phone: String,
    #[serde(with = "iso_date::option", default)]
    pub starting_date: Option<Date>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnrollment {
    pub status: Option<EnrollmentStatus>,
    pub batch: Option<String>,
    pub phone: Option<String>,
    #[serde(with = "iso_date::option", default)]
    pub starting_date: Option<Date>,
}

pub async fn find_enrollment(
    database: &SqlitePool,
    id: i64,
) -> Result<Option<Enrollment>, sqlx::Error> {
    sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollment WHERE id = ?")
        .bind(id)
        .fetch_optional(database)
        .await
}

async fn find_detail(database: &SqlitePool, id: i64) -> Result<EnrollmentDetail, AppError> {
    let row = sqlx::query_as::<_, EnrollmentDetailRow>(&format!("{DETAIL_SELECT} WHERE e.id = ?"))
        .bind(id)
        .fetch_optional(database)
        .await?
        .ok_or_else(|| AppError::not_found("Enrollment"))?;
    Ok(row.into())
}

/// The owning student, an admin, or the lecturer of the course may look.
async fn ensure_can_view(
    database: &SqlitePool,
    caller: &AuthUser,
    enrollment: &Enrollment,
) -> Result<(), AppError> {
    match caller.role {
        Role::Admin => Ok(()),
        Role::Student if enrollment.student_id == caller.id => Ok(()),
        Role::Lecturer => {
            let course = course::find_course(database, enrollment.course_id).await?;
            match course {
                Some(course) if course.lecturer_id == Some(caller.id) => Ok(()),
                _ => Err(AppError::forbidden()),
            }
        }
        Role::Student => Err(AppError::forbidden()),
    }
}

pub async fn create_enrollment(
    database: &SqlitePool,
    caller: &AuthUser,
    new: NewEnrollment,
) -> Result<Enrollment, AppError> {
    match caller.role {
        Role::Student => {}
        Role::Admin | Role::Lecturer => {
            return Err(AppError::Forbidden("Only students can enroll".to_string()));
        }
    }
    if course::find_course(database, new.course_id).await?.is_none() {
        return Err(AppError::not_found("Course"));
    }
    let now = now_utc();
    let enrollment = sqlx::query_as::<_, Enrollment>(
        "INSERT INTO enrollment (student_id, course_id, status, payment_status, batch, phone, starting_date, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(caller.id)
    .bind(new.course_id)
    .bind(EnrollmentStatus::Enrolled)
    .bind(FeeStatus::Pending)
    .bind(new.batch)
    .bind(new.phone)
    .bind(new.starting_date)
    .bind(now)
    .bind(now)
    .fetch_one(database)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::BadRequest("Already enrolled in this course".to_string())
        } else {
            e.into()
        }
    })?;
    info!(
        enrollment_id = enrollment.id,
        student_id = caller.id,
        course_id = enrollment.course_id,
        "student enrolled"
    );
    Ok(enrollment)
}

pub async fn get_enrollment(
    database: &SqlitePool,
    caller: &AuthUser,
    id: i64,
) -> Result<EnrollmentDetail, AppError> {
    let detail = find_detail(database, id).await?;
    ensure_can_view(database, caller, &detail.enrollment).await?;
    Ok(detail)
}

/// Admins see everything, lecturers the enrollments of their courses,
/// students their own.
pub async fn list_enrollments(
    database: &SqlitePool,
    caller: &AuthUser,
) -> Result<Vec<EnrollmentDetail>, AppError> {
    let rows = match caller.role {
        Role::Admin => {
            sqlx::query_as::<_, EnrollmentDetailRow>(&format!("{DETAIL_SELECT} ORDER BY e.id"))
                .fetch_all(database)
                .await?
        }
        Role::Lecturer => {
            sqlx::query_as::<_, EnrollmentDetailRow>(&format!(
                "{DETAIL_SELECT} WHERE c.lecturer_id = ? ORDER BY e.id"
            ))
            .bind(caller.id)
            .fetch_all(database)
            .await?
        }
        Role::Student => {
            sqlx::query_as::<_, EnrollmentDetailRow>(&format!(
                "{DETAIL_SELECT} WHERE e.student_id = ? ORDER BY e.id"
            ))
            .bind(caller.id)
            .fetch_all(database)
            .await?
        }
    };
    Ok(rows.into_iter().map(EnrollmentDetail::from).collect())
}

/// Admin edit. Completion only happens through a verified payment, and a
/// completed enrollment keeps its status.
pub async fn update_enrollment(
    database: &SqlitePool,
    caller: &AuthUser,
    id: i64,
    update: UpdateEnrollment,
) -> Result<Enrollment, AppError> {
    caller.require(&[Role::Admin])?;
    let mut enrollment = find_enrollment(database, id)
        .await?
        .ok_or_else(|| AppError::not_found("Enrollment"))?;
    let previous = enrollment.status;
    if let Some(status) = update.status {
        match (previous, status) {
            (from, to) if from == to => {}
            (_, EnrollmentStatus::Completed) => {
                return Err(AppError::BadRequest(
                    "Enrollments are completed by paying for them".to_string(),
                ));
            }
            (EnrollmentStatus::Completed, _) => {
                return Err(AppError::BadRequest(
                    "A completed enrollment cannot change status".to_string(),
                ));
            }
            (EnrollmentStatus::Enrolled | EnrollmentStatus::Cancelled, _) => {
                enrollment.status = status;
            }
        }
    }
    if let Some(batch) = update.batch {
        enrollment.batch = batch;
    }
    if let Some(phone) = update.phone {
        enrollment.phone = phone;
    }
    if let Some(starting_date) = update.starting_date {
        enrollment.starting_date = Some(starting_date);
    }
    let mut tx = database.begin().await?;
    let updated = sqlx::query_as::<_, Enrollment>(
        "UPDATE enrollment SET status = ?, batch = ?, phone = ?, starting_date = ?, updated_at = ?
         WHERE id = ? AND status = ?
         RETURNING *",
    )
    .bind(enrollment.status)
    .bind(&enrollment.batch)
    .bind(&enrollment.phone)
    .bind(enrollment.starting_date)
    .bind(now_utc())
    .bind(id)
    .bind(previous)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::Conflict("Enrollment changed, please try again".to_string()))?;
    if previous != EnrollmentStatus::Cancelled && updated.status == EnrollmentStatus::Cancelled {
        payment::void_open_challenge(&mut *tx, id).await?;
        info!(enrollment_id = id, "enrollment cancelled by admin");
    }
    tx.commit().await?;
    Ok(updated)
}

/// Cancelling also voids any OTP challenge still open for the enrollment.
pub async fn cancel_enrollment(
    database: &SqlitePool,
    caller: &AuthUser,
    id: i64,
) -> Result<Enrollment, AppError> {
    let enrollment = find_enrollment(database, id)
        .await?
        .ok_or_else(|| AppError::not_found("Enrollment"))?;
    caller.require_self_or_admin(enrollment.student_id)?;
    match enrollment.status {
        EnrollmentStatus::Completed => {
            return Err(AppError::BadRequest(
                "A completed enrollment cannot be cancelled".to_string(),
            ));
        }
        EnrollmentStatus::Cancelled => return Ok(enrollment),
        EnrollmentStatus::Enrolled => {}
    }
    let mut tx = database.begin().await?;
    let enrollment = sqlx::query_as::<_, Enrollment>(
        "UPDATE enrollment SET status = ?, updated_at = ? WHERE id = ? AND status = ? RETURNING *",
    )
    .bind(EnrollmentStatus::Cancelled)
    .bind(now_utc())
    .bind(id)
    .bind(EnrollmentStatus::Enrolled)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| {
        AppError::BadRequest("A completed enrollment cannot be cancelled".to_string())
    })?;
    let voided = payment::void_open_challenge(&mut *tx, id).await?;
    tx.commit().await?;
    info!(enrollment_id = id, voided, "enrollment cancelled");
    Ok(enrollment)
}

/// Side effect of a completed payment. Only an active enrollment can be
/// paid; returns false when it was cancelled in the meantime.
pub(crate) async fn mark_paid(conn: &mut SqliteConnection, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE enrollment SET status = ?, payment_status = ?, updated_at = ?
         WHERE id = ? AND status = ?",
    )
    .bind(EnrollmentStatus::Completed)
    .bind(FeeStatus::Paid)
    .bind(now_utc())
    .bind(id)
    .bind(EnrollmentStatus::Enrolled)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
