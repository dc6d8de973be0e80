use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    auth::{AuthUser, Role},
    error::{AppError, is_foreign_key_violation},
    user::{self, UserSummary},
    utils::now_utc,
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub category: Option<String>,
    pub price_cents: i64,
    pub duration_weeks: Option<i64>,
    pub lecturer_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CourseModule {
    pub id: i64,
    pub course_id: i64,
    pub title: String,
    pub description: String,
    pub position: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A course with its lecturer and modules filled in
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CourseDetail {
    #[serde(flatten)]
    pub course: Course,
    pub lecturer: Option<UserSummary>,
    pub modules: Vec<CourseModule>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewCourse {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    pub price_cents: i64,
    #[serde(default)]
    pub duration_weeks: Option<i64>,
    /// Only honoured for admins; a lecturer always teaches what they create
    #[serde(default)]
    pub lecturer_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCourse {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub price_cents: Option<i64>,
    pub duration_weeks: Option<i64>,
    pub lecturer_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewModule {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Appended after the last module when absent
    #[serde(default)]
    pub position: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateModule {
    pub title: Option<String>,
    pub description: Option<String>,
    pub position: Option<i64>,
}

fn validate_title(title: &str) -> Result<(), AppError> {
    if title.trim().is_empty() {
        return Err(AppError::BadRequest("Title is required".to_string()));
    }
    Ok(())
}

fn validate_price(price_cents: i64) -> Result<(), AppError> {
    if price_cents < 0 {
        return Err(AppError::BadRequest("Price cannot be negative".to_string()));
    }
    Ok(())
}

/// Only lecturers can be assigned to teach a course.
async fn check_lecturer(database: &SqlitePool, lecturer_id: i64) -> Result<(), AppError> {
    match user::find_user(database, lecturer_id).await? {
        Some(account) if account.role == Role::Lecturer => Ok(()),
        Some(_) => Err(AppError::BadRequest(format!(
            "User {lecturer_id} is not a lecturer"
        ))),
        None => Err(AppError::not_found("Lecturer")),
    }
}

/// Admins manage every course, lecturers only the ones they teach.
pub fn ensure_can_manage(caller: &AuthUser, course: &Course) -> Result<(), AppError> {
    match caller.role {
        Role::Admin => Ok(()),
        Role::Lecturer if course.lecturer_id == Some(caller.id) => Ok(()),
        Role::Lecturer | Role::Student => Err(AppError::forbidden()),
    }
}

pub async fn find_course(database: &SqlitePool, id: i64) -> Result<Option<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>("SELECT * FROM course WHERE id = ?")
        .bind(id)
        .fetch_optional(database)
        .await
}

async fn get_course(database: &SqlitePool, id: i64) -> Result<Course, AppError> {
    find_course(database, id)
        .await?
        .ok_or_else(|| AppError::not_found("Course"))
}

pub async fn list_courses(database: &SqlitePool) -> Result<Vec<Course>, AppError> {
    let courses = sqlx::query_as::<_, Course>("SELECT * FROM course ORDER BY id")
        .fetch_all(database)
        .await?;
    Ok(courses)
}

pub async fn get_course_detail(database: &SqlitePool, id: i64) -> Result<CourseDetail, AppError> {
    let course = get_course(database, id).await?;
    let lecturer = match course.lecturer_id {
        Some(lecturer_id) => {
            sqlx::query_as::<_, UserSummary>(
                "SELECT id, name, email FROM user_account WHERE id = ?",
            )
            .bind(lecturer_id)
            .fetch_optional(database)
            .await?
        }
        None => None,
    };
    let modules = list_modules(database, id).await?;
    Ok(CourseDetail {
        course,
        lecturer,
        modules,
    })
}

pub async fn create_course(
    database: &SqlitePool,
    caller: &AuthUser,
    new: NewCourse,
) -> Result<Course, AppError> {
    let lecturer_id = match caller.role {
        Role::Admin => new.lecturer_id,
        Role::Lecturer => Some(caller.id),
        Role::Student => return Err(AppError::forbidden()),
    };
    validate_title(&new.title)?;
    validate_price(new.price_cents)?;
    if let Some(lecturer_id) = lecturer_id {
        check_lecturer(database, lecturer_id).await?;
    }
    let now = now_utc();
    let course = sqlx::query_as::<_, Course>(
        "INSERT INTO course (title, description, category, price_cents, duration_weeks, lecturer_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(new.title.trim())
    .bind(new.description)
    .bind(new.category)
    .bind(new.price_cents)
    .bind(new.duration_weeks)
    .bind(lecturer_id)
    .bind(now)
    .bind(now)
    .fetch_one(database)
    .await?;
    info!(course_id = course.id, "course created");
    Ok(course)
}

pub async fn update_course(
    database: &SqlitePool,
    caller: &AuthUser,
    id: i64,
    update: UpdateCourse,
) -> Result<Course, AppError> {
    let mut course = get_course(database, id).await?;
    ensure_can_manage(caller, &course)?;
    if let Some(title) = update.title {
        validate_title(&title)?;
        course.title = title.trim().to_string();
    }
    if let Some(description) = update.description {
        course.description = description;
    }
    if let Some(category) = update.category {
        course.category = Some(category);
    }
    if let Some(price_cents) = update.price_cents {
        validate_price(price_cents)?;
        course.price_cents = price_cents;
    }
    if let Some(duration_weeks) = update.duration_weeks {
        course.duration_weeks = Some(duration_weeks);
    }
    if let Some(lecturer_id) = update.lecturer_id {
        if !caller.is_admin() {
            return Err(AppError::Forbidden(
                "Only admins can reassign a course".to_string(),
            ));
        }
        check_lecturer(database, lecturer_id).await?;
        course.lecturer_id = Some(lecturer_id);
    }
    let course = sqlx::query_as::<_, Course>(
        "UPDATE course
         SET title = ?, description = ?, category = ?, price_cents = ?, duration_weeks = ?, lecturer_id = ?, updated_at = ?
         WHERE id = ?
         RETURNING *",
    )
    .bind(&course.title)
    .bind(&course.description)
    .bind(&course.category)
    .bind(course.price_cents)
    .bind(course.duration_weeks)
    .bind(course.lecturer_id)
    .bind(now_utc())
    .bind(id)
    .fetch_one(database)
    .await?;
    Ok(course)
}

pub async fn delete_course(database: &SqlitePool, caller: &AuthUser, id: i64) -> Result<(), AppError> {
    let course = get_course(database, id).await?;
    ensure_can_manage(caller, &course)?;
    let enrolled: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enrollment WHERE course_id = ?")
        .bind(id)
        .fetch_one(database)
        .await?;
    if enrolled > 0 {
        return Err(AppError::BadRequest(
            "Course has enrollments and cannot be deleted".to_string(),
        ));
    }
    sqlx::query("DELETE FROM course WHERE id = ?")
        .bind(id)
        .execute(database)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                AppError::BadRequest("Course has enrollments and cannot be deleted".to_string())
            } else {
                e.into()
            }
        })?;
    info!(course_id = id, "course deleted");
    Ok(())
}

pub async fn list_modules(
    database: &SqlitePool,
    course_id: i64,
) -> Result<Vec<CourseModule>, AppError> {
    let modules = sqlx::query_as::<_, CourseModule>(
        "SELECT * FROM course_module WHERE course_id = ? ORDER BY position, id",
    )
    .bind(course_id)
    .fetch_all(database)
    .await?;
    Ok(modules)
}

pub async fn add_module(
    database: &SqlitePool,
    caller: &AuthUser,
    course_id: i64,
    new: NewModule,
) -> Result<CourseModule, AppError> {
    let course = get_course(database, course_id).await?;
    ensure_can_manage(caller, &course)?;
    validate_title(&new.title)?;
    let position = match new.position {
        Some(position) => position,
        None => {
            sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM course_module WHERE course_id = ?",
            )
            .bind(course_id)
            .fetch_one(database)
            .await?
        }
    };
    let module = sqlx::query_as::<_, CourseModule>(
        "INSERT INTO course_module (course_id, title, description, position, created_at)
         VALUES (?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(course_id)
    .bind(new.title.trim())
    .bind(new.description)
    .bind(position)
    .bind(now_utc())
    .fetch_one(database)
    .await?;
    Ok(module)
}

async fn get_module(
    database: &SqlitePool,
    course_id: i64,
    module_id: i64,
) -> Result<CourseModule, AppError> {
    sqlx::query_as::<_, CourseModule>("SELECT * FROM course_module WHERE id = ? AND course_id = ?")
        .bind(module_id)
        .bind(course_id)
        .fetch_optional(database)
        .await?
        .ok_or_else(|| AppError::not_found("Module"))
}

pub async fn update_module(
    database: &SqlitePool,
    caller: &AuthUser,
    course_id: i64,
    module_id: i64,
    update: UpdateModule,
) -> Result<CourseModule, AppError> {
    let course = get_course(database, course_id).await?;
    ensure_can_manage(caller, &course)?;
    let mut module = get_module(database, course_id, module_id).await?;
    if let Some(title) = update.title {
        validate_title(&title)?;
        module.title = title.trim().to_string();
    }
    if let Some(description) = update.description {
        module.description = description;
    }
    if let Some(position) = update.position {
        module.position = position;
    }
    let module = sqlx::query_as::<_, CourseModule>(
        "UPDATE course_module SET title = ?, description = ?, position = ?
         WHERE id = ?
         RETURNING *",
    )
    .bind(&module.title)
    .bind(&module.description)
    .bind(module.position)
    .bind(module_id)
    .fetch_one(database)
    .await?;
    Ok(module)
}

pub async fn delete_module(
    database: &SqlitePool,
    caller: &AuthUser,
    course_id: i64,
    module_id: i64,
) -> Result<(), AppError> {
    let course = get_course(database, course_id).await?;
    ensure_can_manage(caller, &course)?;
    get_module(database, course_id, module_id).await?;
    sqlx::query("DELETE FROM course_module WHERE id = ?")
        .bind(module_id)
        .execute(database)
        .await?;
    Ok(())
}
