#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use lms_server::{
    AppState, api,
    auth::Role,
    config::Config,
    db,
    mail::{MailError, Mailer, OutgoingMail},
    user::{self, NewUser},
};
use serde_json::Value;
use sqlx::SqlitePool;
use tower::ServiceExt;

pub const PASSWORD: &str = "password123";

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingMail>>,
}

impl RecordingMailer {
    pub fn sent_to(&self, to: &str) -> Vec<OutgoingMail> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|mail| mail.to == to)
            .cloned()
            .collect()
    }

    /// The six-digit code in the latest mail to `to`.
    pub fn last_otp(&self, to: &str) -> String {
        let mail = self.sent_to(to).pop().expect("no mail sent");
        mail.body
            .split(|c: char| !c.is_ascii_digit())
            .find(|word| word.len() == 6)
            .expect("no code in mail")
            .to_string()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub database: SqlitePool,
    pub mailer: Arc<RecordingMailer>,
}

impl TestApp {
    pub async fn new() -> Self {
        let database = db::connect_in_memory().await.unwrap();
        let mailer = Arc::new(RecordingMailer::default());
        let state = AppState::new(
            database.clone(),
            Config::default(),
            b"integration-secret",
            mailer.clone(),
        );
        Self {
            router: api::router(state),
            database,
            mailer,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(token), Some(body)).await
    }

    /// Create an account directly in the database and log in over HTTP.
    pub async fn login_as(&self, name: &str, role: Role) -> (i64, String) {
        let email = format!("{}@example.com", name.to_lowercase());
        let user = user::create_user(
            &self.database,
            NewUser {
                name: name.to_string(),
                email: email.clone(),
                password: PASSWORD.to_string(),
                role,
                phone: None,
            },
        )
        .await
        .unwrap();
        let (status, body) = self
            .request(
                Method::POST,
                "/api/auth/login",
                None,
                Some(serde_json::json!({ "email": email, "password": PASSWORD })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        (user.id, body["token"].as_str().unwrap().to_string())
    }

    /// A lecturer-owned course and a student enrolled in it.
    /// Returns `(student_token, enrollment_id)`.
    pub async fn enrolled_student(&self, price_cents: i64) -> (String, i64) {
        let (_, lecturer) = self.login_as("Lena", Role::Lecturer).await;
        let (status, course) = self
            .post(
                "/api/courses",
                &lecturer,
                serde_json::json!({ "title": "Rust for Beginners", "priceCents": price_cents }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{course}");
        let (_, student) = self.login_as("Sam", Role::Student).await;
        let (status, enrollment) = self
            .post(
                "/api/enrollments",
                &student,
                serde_json::json!({ "courseId": course["id"], "batch": "2025-A", "phone": "555-0100" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{enrollment}");
        (student, enrollment["id"].as_i64().unwrap())
    }
}
