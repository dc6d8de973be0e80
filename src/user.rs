use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    auth::{self, AuthUser, Role, TokenKeys},
    error::{AppError, is_foreign_key_violation, is_unique_violation},
    utils::now_utc,
};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    pub phone: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub phone: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            role: user.role,
            phone: user.phone,
            created_at: user.created_at,
        }
    }
}

/// Who a record belongs to, as shown inside other records
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct UserSummary {
    pub id: i64,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Fields left out are not touched
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUser {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub password: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserInfo,
}

fn validate_email(email: &str) -> Result<(), AppError> {
    email
        .parse::<lettre::Address>()
        .map(|_| ())
        .map_err(|_| AppError::BadRequest(format!("Invalid email address: {email}")))
}

fn validate_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::BadRequest("Name is required".to_string()));
    }
    Ok(())
}

pub async fn find_user(database: &SqlitePool, id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM user_account WHERE id = ?")
        .bind(id)
        .fetch_optional(database)
        .await
}

pub async fn find_user_by_email(
    database: &SqlitePool,
    email: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM user_account WHERE email = ?")
        .bind(email)
        .fetch_optional(database)
        .await
}

pub async fn create_user(database: &SqlitePool, new: NewUser) -> Result<UserInfo, AppError> {
    let email = new.email.trim().to_lowercase();
    validate_name(&new.name)?;
    validate_email(&email)?;
    validate_password(&new.password)?;
    let password_hash = auth::hash_password(&new.password)?;
    let now = now_utc();
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO user_account (name, email, password, role, phone, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(new.name.trim())
    .bind(&email)
    .bind(password_hash)
    .bind(new.role)
    .bind(new.phone)
    .bind(now)
    .bind(now)
    .fetch_one(database)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::BadRequest(format!("Email {email} is already registered"))
        } else {
            e.into()
        }
    })?;
    info!(user_id = user.id, role = ?user.role, "user created");
    Ok(user.into())
}

/// Public sign-up always yields a student account.
pub async fn register(
    database: &SqlitePool,
    name: String,
    email: String,
    password: String,
    phone: Option<String>,
) -> Result<UserInfo, AppError> {
    create_user(
        database,
        NewUser {
            name,
            email,
            password,
            role: Role::Student,
            phone,
        },
    )
    .await
}

pub async fn login(
    database: &SqlitePool,
    tokens: &TokenKeys,
    email: &str,
    password: &str,
) -> Result<LoginResponse, AppError> {
    let invalid = || AppError::Unauthorized("Invalid email or password".to_string());
    let user = find_user_by_email(database, &email.trim().to_lowercase())
        .await?
        .ok_or_else(invalid)?;
    if !auth::verify_password(password, &user.password)? {
        return Err(invalid());
    }
    let token = tokens.issue(user.id, user.role)?;
    info!(user_id = user.id, "user logged in");
    Ok(LoginResponse {
        token,
        user: user.into(),
    })
}

pub async fn get_user(
    database: &SqlitePool,
    caller: &AuthUser,
    id: i64,
) -> Result<UserInfo, AppError> {
    caller.require_self_or_admin(id)?;
    let user = find_user(database, id)
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;
    Ok(user.into())
}

pub async fn list_users(
    database: &SqlitePool,
    caller: &AuthUser,
    role: Option<Role>,
) -> Result<Vec<UserInfo>, AppError> {
    caller.require(&[Role::Admin])?;
    let users = match role {
        Some(role) => {
            sqlx::query_as::<_, User>("SELECT * FROM user_account WHERE role = ? ORDER BY id")
                .bind(role)
                .fetch_all(database)
                .await?
        }
        None => {
            sqlx::query_as::<_, User>("SELECT * FROM user_account ORDER BY id")
                .fetch_all(database)
                .await?
        }
    };
    Ok(users.into_iter().map(UserInfo::from).collect())
}

pub async fn update_user(
    database: &SqlitePool,
    caller: &AuthUser,
    id: i64,
    update: UpdateUser,
) -> Result<UserInfo, AppError> {
    caller.require_self_or_admin(id)?;
    if update.role.is_some() && !caller.is_admin() {
        return Err(AppError::Forbidden("Only admins can change roles".to_string()));
    }
    let mut user = find_user(database, id)
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;
    if let Some(name) = update.name {
        validate_name(&name)?;
        user.name = name.trim().to_string();
    }
    if let Some(phone) = update.phone {
        user.phone = Some(phone);
    }
    if let Some(password) = update.password {
        validate_password(&password)?;
        user.password = auth::hash_password(&password)?;
    }
    if let Some(role) = update.role {
        user.role = role;
    }
    let user = sqlx::query_as::<_, User>(
        "UPDATE user_account SET name = ?, phone = ?, password = ?, role = ?, updated_at = ?
         WHERE id = ?
         RETURNING *",
    )
    .bind(&user.name)
    .bind(&user.phone)
    .bind(&user.password)
    .bind(user.role)
    .bind(now_utc())
    .bind(id)
    .fetch_one(database)
    .await?;
    Ok(user.into())
}

pub async fn delete_user(database: &SqlitePool, caller: &AuthUser, id: i64) -> Result<(), AppError> {
    caller.require(&[Role::Admin])?;
    if caller.id == id {
        return Err(AppError::BadRequest("You cannot delete your own account".to_string()));
    }
    let referenced: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM enrollment WHERE student_id = ?1)
             OR EXISTS (SELECT 1 FROM course WHERE lecturer_id = ?1)",
    )
    .bind(id)
    .fetch_one(database)
    .await?;
    if referenced {
        return Err(AppError::BadRequest(
            "User still has enrollments or courses and cannot be deleted".to_string(),
        ));
    }
    let result = sqlx::query("DELETE FROM user_account WHERE id = ?")
        .bind(id)
        .execute(database)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                AppError::BadRequest(
                    "User still has enrollments or courses and cannot be deleted".to_string(),
                )
            } else {
                e.into()
            }
        })?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("User"));
    }
    info!(user_id = id, "user deleted");
    Ok(())
}

/// Create the bootstrap admin unless an account with that email exists.
pub async fn ensure_admin(database: &SqlitePool, email: &str, password: &str) -> Result<(), AppError> {
    if find_user_by_email(database, &email.trim().to_lowercase())
        .await?
        .is_some()
    {
        return Ok(());
    }
    create_user(
        database,
        NewUser {
            name: "Administrator".to_string(),
            email: email.to_string(),
            password: password.to_string(),
            role: Role::Admin,
            phone: None,
        },
    )
    .await?;
    info!("bootstrap admin {email} created");
    Ok(())
}
