//! Enrollment payments confirmed with an emailed one-time password.
//!
//! A payment record moves through
//! `pending -> otp_sent -> completed | failed`. Issuing (or re-issuing) a
//! challenge always lands in `otp_sent` with a fresh code, a fresh expiry
//! and a zeroed attempt counter; a burned challenge (`failed`) can only be
//! revived by issuing a new one. `completed` is terminal.
//!
//! Every transition is one conditional statement, so two requests racing
//! on the same payment cannot both win.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    auth::{AuthUser, Role},
    config::OtpConfig,
    course,
    enrollment::{self, Enrollment, EnrollmentStatus},
    error::AppError,
    mail::{self, Mailer},
    user,
    utils::now_utc,
};

pub const OTP_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    OtpSent,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Paypal,
    BankTransfer,
    Wallet,
}

/// A stored one-time password. Never printed.
#[derive(Clone, PartialEq, Eq, sqlx::Type)]
#[sqlx(transparent)]
pub struct OtpCode(String);

impl OtpCode {
    pub fn generate() -> Self {
        Self(format!("{:06}", rand::rng().random_range(0u32..1_000_000)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exactly six ASCII digits
    pub fn is_well_formed(code: &str) -> bool {
        code.len() == OTP_LEN && code.bytes().all(|b| b.is_ascii_digit())
    }
}

impl std::fmt::Debug for OtpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OtpCode([REDACTED])")
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Payment {
    pub id: i64,
    pub enrollment_id: i64,
    pub amount_cents: i64,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub otp: Option<OtpCode>,
    pub otp_expires_at: Option<OffsetDateTime>,
    pub otp_attempts: i64,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// What clients get to see of a payment
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    pub id: i64,
    pub enrollment_id: i64,
    pub course_title: String,
    pub amount_cents: i64,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub otp_expires_at: Option<OffsetDateTime>,
    pub otp_attempts: i64,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtpIssued {
    pub payment_id: i64,
    /// Seconds until the code expires
    pub expires_in: i64,
}

const SUMMARY_SELECT: &str = "SELECT p.id, p.enrollment_id, c.title AS course_title, p.amount_cents,
        p.payment_method, p.status, p.otp_expires_at, p.otp_attempts, p.paid_at, p.created_at
    FROM payment p
    JOIN enrollment e ON e.id = p.enrollment_id
    JOIN course c ON c.id = e.course_id";

fn ensure_payable(enrollment: &Enrollment) -> Result<(), AppError> {
    match enrollment.status {
        EnrollmentStatus::Cancelled => Err(AppError::BadRequest(
            "Enrollment is cancelled and cannot be paid".to_string(),
        )),
        EnrollmentStatus::Enrolled | EnrollmentStatus::Completed => Ok(()),
    }
}

/// `otp_sent -> failed` for whatever challenge the enrollment has open.
/// Runs inside the caller's transaction when an enrollment is cancelled.
pub(crate) async fn void_open_challenge(
    conn: &mut SqliteConnection,
    enrollment_id: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE payment SET status = ?1, otp = NULL, otp_expires_at = NULL, updated_at = ?2
         WHERE enrollment_id = ?3 AND status = ?4",
    )
    .bind(PaymentStatus::Failed)
    .bind(now_utc())
    .bind(enrollment_id)
    .bind(PaymentStatus::OtpSent)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Collaborators shared by the OTP operations
#[derive(Clone)]
pub struct PaymentService {
    database: SqlitePool,
    mailer: Arc<dyn Mailer>,
    otp: OtpConfig,
}

impl PaymentService {
    pub fn new(database: SqlitePool, mailer: Arc<dyn Mailer>, otp: OtpConfig) -> Self {
        Self {
            database,
            mailer,
            otp,
        }
    }

    async fn load_payment(&self, id: i64) -> Result<Payment, AppError> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payment WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.database)
            .await?
            .ok_or_else(|| AppError::not_found("Payment"))
    }

    async fn load_enrollment(&self, id: i64) -> Result<Enrollment, AppError> {
        enrollment::find_enrollment(&self.database, id)
            .await?
            .ok_or_else(|| AppError::not_found("Enrollment"))
    }

    /// Email the code to the enrolled student.
    async fn send_otp(&self, enrollment: &Enrollment, code: &OtpCode) -> Result<(), AppError> {
        let student = user::find_user(&self.database, enrollment.student_id)
            .await?
            .ok_or_else(|| AppError::not_found("Student"))?;
        let course = course::find_course(&self.database, enrollment.course_id)
            .await?
            .ok_or_else(|| AppError::not_found("Course"))?;
        let mail = mail::otp_mail(
            &student.email,
            &student.name,
            &course.title,
            code.as_str(),
            self.otp.ttl(),
        );
        self.mailer.send(mail).await?;
        Ok(())
    }

    /// Start (or restart) the OTP challenge for an enrollment.
    ///
    /// An existing, not yet completed payment for the enrollment is reused
    /// and its challenge overwritten. The code stays stored when the email
    /// cannot be sent; the caller sees the mail error and may resend.
    pub async fn issue_otp(
        &self,
        caller: &AuthUser,
        enrollment_id: i64,
        method: PaymentMethod,
    ) -> Result<OtpIssued, AppError> {
        let enrollment = self.load_enrollment(enrollment_id).await?;
        caller.require_self_or_admin(enrollment.student_id)?;
        ensure_payable(&enrollment)?;
        let course = course::find_course(&self.database, enrollment.course_id)
            .await?
            .ok_or_else(|| AppError::not_found("Course"))?;

        let code = OtpCode::generate();
        let now = now_utc();
        let payment_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO payment (enrollment_id, amount_cents, payment_method, status, otp, otp_expires_at, otp_attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)
             ON CONFLICT (enrollment_id) DO UPDATE SET
                 amount_cents = excluded.amount_cents,
                 payment_method = excluded.payment_method,
                 status = excluded.status,
                 otp = excluded.otp,
                 otp_expires_at = excluded.otp_expires_at,
                 otp_attempts = 0,
                 updated_at = excluded.updated_at
             WHERE payment.status <> ?8
             RETURNING id",
        )
        .bind(enrollment.id)
        .bind(course.price_cents)
        .bind(method)
        .bind(PaymentStatus::OtpSent)
        .bind(&code)
        .bind(now + self.otp.ttl())
        .bind(now)
        .bind(PaymentStatus::Completed)
        .fetch_optional(&self.database)
        .await?
        .ok_or_else(|| AppError::Conflict("Payment already completed".to_string()))?;
        info!(payment_id, enrollment_id, "otp issued");

        self.send_otp(&enrollment, &code).await?;
        Ok(OtpIssued {
            payment_id,
            expires_in: self.otp.ttl_secs,
        })
    }

    /// Replace the challenge of an existing payment with a new code.
    pub async fn resend_otp(&self, caller: &AuthUser, payment_id: i64) -> Result<OtpIssued, AppError> {
        let payment = self.load_payment(payment_id).await?;
        let enrollment = self.load_enrollment(payment.enrollment_id).await?;
        caller.require_self_or_admin(enrollment.student_id)?;
        if payment.status == PaymentStatus::Completed {
            return Err(AppError::Conflict("Payment already completed".to_string()));
        }
        ensure_payable(&enrollment)?;

        let code = OtpCode::generate();
        let now = now_utc();
        let result = sqlx::query(
            "UPDATE payment
             SET status = ?1, otp = ?2, otp_expires_at = ?3, otp_attempts = 0, updated_at = ?4
             WHERE id = ?5 AND status <> ?6",
        )
        .bind(PaymentStatus::OtpSent)
        .bind(&code)
        .bind(now + self.otp.ttl())
        .bind(now)
        .bind(payment_id)
        .bind(PaymentStatus::Completed)
        .execute(&self.database)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::Conflict("Payment already completed".to_string()));
        }
        info!(payment_id, "otp re-issued");

        self.send_otp(&enrollment, &code).await?;
        Ok(OtpIssued {
            payment_id,
            expires_in: self.otp.ttl_secs,
        })
    }

    /// Check a submitted code and complete the payment when it matches.
    pub async fn verify_otp(
        &self,
        caller: &AuthUser,
        payment_id: i64,
        submitted: &str,
    ) -> Result<PaymentSummary, AppError> {
        let submitted = submitted.trim();
        if !OtpCode::is_well_formed(submitted) {
            return Err(AppError::BadRequest(format!(
                "OTP must be a {OTP_LEN}-digit code"
            )));
        }
        let payment = self.load_payment(payment_id).await?;
        let enrollment = self.load_enrollment(payment.enrollment_id).await?;
        caller.require_self_or_admin(enrollment.student_id)?;
        ensure_payable(&enrollment)?;

        let max_attempts = self.otp.max_attempts;
        let (stored, expires_at) = match (payment.status, &payment.otp, payment.otp_expires_at) {
            (PaymentStatus::Completed, _, _) => {
                return Err(AppError::BadRequest("Payment already completed".to_string()));
            }
            (PaymentStatus::OtpSent, Some(stored), Some(expires_at)) => (stored, expires_at),
            (PaymentStatus::Pending | PaymentStatus::Failed | PaymentStatus::OtpSent, _, _) => {
                return Err(AppError::BadRequest(
                    "No active OTP for this payment, please request a new one".to_string(),
                ));
            }
        };
        if payment.otp_attempts >= max_attempts {
            self.burn_challenge(payment_id).await?;
            return Err(AppError::InvalidOtp {
                message: "Maximum OTP attempts exceeded, please request a new one".to_string(),
                attempts_left: 0,
            });
        }
        if now_utc() > expires_at {
            self.burn_challenge(payment_id).await?;
            info!(payment_id, "otp expired");
            return Err(AppError::BadRequest(
                "OTP has expired, please request a new one".to_string(),
            ));
        }
        if stored.as_str() != submitted {
            let attempts = self.record_failed_attempt(payment_id).await?;
            let attempts_left = (max_attempts - attempts).max(0);
            warn!(payment_id, attempts, "wrong otp submitted");
            let message = if attempts_left == 0 {
                "Invalid OTP. Maximum attempts exceeded, please request a new one".to_string()
            } else {
                "Invalid OTP".to_string()
            };
            return Err(AppError::InvalidOtp {
                message,
                attempts_left,
            });
        }

        self.complete(&payment, stored).await?;
        info!(payment_id, enrollment_id = enrollment.id, "payment completed");
        self.send_confirmation(&enrollment, payment.amount_cents).await;
        self.summary(payment_id).await
    }

    /// `otp_sent -> failed`, dropping the code.
    async fn burn_challenge(&self, payment_id: i64) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payment SET status = ?1, otp = NULL, otp_expires_at = NULL, updated_at = ?2
             WHERE id = ?3 AND status = ?4",
        )
        .bind(PaymentStatus::Failed)
        .bind(now_utc())
        .bind(payment_id)
        .bind(PaymentStatus::OtpSent)
        .execute(&self.database)
        .await?;
        Ok(())
    }

    /// Count one wrong submission and return the new attempt count. The
    /// challenge is burned in the same statement once the limit is reached.
    async fn record_failed_attempt(&self, payment_id: i64) -> Result<i64, AppError> {
        sqlx::query_scalar::<_, i64>(
            "UPDATE payment
             SET otp_attempts = otp_attempts + 1,
                 status = CASE WHEN otp_attempts + 1 >= ?2 THEN ?3 ELSE status END,
                 otp = CASE WHEN otp_attempts + 1 >= ?2 THEN NULL ELSE otp END,
                 otp_expires_at = CASE WHEN otp_attempts + 1 >= ?2 THEN NULL ELSE otp_expires_at END,
                 updated_at = ?4
             WHERE id = ?1 AND status = ?5 AND otp_attempts < ?2
             RETURNING otp_attempts",
        )
        .bind(payment_id)
        .bind(self.otp.max_attempts)
        .bind(PaymentStatus::Failed)
        .bind(now_utc())
        .bind(PaymentStatus::OtpSent)
        .fetch_optional(&self.database)
        .await?
        .ok_or_else(|| {
            AppError::Conflict("The OTP challenge changed, please try again".to_string())
        })
    }

    /// `otp_sent -> completed` together with the enrollment update.
    async fn complete(&self, payment: &Payment, code: &OtpCode) -> Result<(), AppError> {
        let now = now_utc();
        let mut tx = self.database.begin().await?;
        let result = sqlx::query(
            "UPDATE payment
             SET status = ?1, otp = NULL, otp_expires_at = NULL, paid_at = ?2, updated_at = ?2
             WHERE id = ?3 AND status = ?4 AND otp = ?5 AND otp_attempts < ?6",
        )
        .bind(PaymentStatus::Completed)
        .bind(now)
        .bind(payment.id)
        .bind(PaymentStatus::OtpSent)
        .bind(code)
        .bind(self.otp.max_attempts)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(
                "The OTP challenge changed, please try again".to_string(),
            ));
        }
        if !enrollment::mark_paid(&mut *tx, payment.enrollment_id).await? {
            return Err(AppError::BadRequest(
                "Enrollment is cancelled and cannot be paid".to_string(),
            ));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Best effort: the payment is already complete.
    async fn send_confirmation(&self, enrollment: &Enrollment, amount_cents: i64) {
        let recipient = async {
            let student = user::find_user(&self.database, enrollment.student_id).await?;
            let course = course::find_course(&self.database, enrollment.course_id).await?;
            Ok::<_, sqlx::Error>(student.zip(course))
        };
        let (student, course) = match recipient.await {
            Ok(Some(found)) => found,
            Ok(None) => return,
            Err(e) => {
                warn!(enrollment_id = enrollment.id, "confirmation mail skipped: {e}");
                return;
            }
        };
        let mail =
            mail::payment_confirmation_mail(&student.email, &student.name, &course.title, amount_cents);
        if let Err(e) = self.mailer.send(mail).await {
            warn!(enrollment_id = enrollment.id, "confirmation mail failed: {e}");
        }
    }

    async fn summary(&self, payment_id: i64) -> Result<PaymentSummary, AppError> {
        sqlx::query_as::<_, PaymentSummary>(&format!("{SUMMARY_SELECT} WHERE p.id = ?"))
            .bind(payment_id)
            .fetch_optional(&self.database)
            .await?
            .ok_or_else(|| AppError::not_found("Payment"))
    }

    pub async fn get_payment(&self, caller: &AuthUser, payment_id: i64) -> Result<PaymentSummary, AppError> {
        let payment = self.load_payment(payment_id).await?;
        let enrollment = self.load_enrollment(payment.enrollment_id).await?;
        match caller.role {
            Role::Admin => {}
            Role::Student if enrollment.student_id == caller.id => {}
            Role::Lecturer => {
                let course = course::find_course(&self.database, enrollment.course_id).await?;
                if course.and_then(|c| c.lecturer_id) != Some(caller.id) {
                    return Err(AppError::forbidden());
                }
            }
            Role::Student => return Err(AppError::forbidden()),
        }
        self.summary(payment_id).await
    }

    /// Admins see every payment, lecturers those of their courses, students
    /// their own.
    pub async fn list_payments(&self, caller: &AuthUser) -> Result<Vec<PaymentSummary>, AppError> {
        let payments = match caller.role {
            Role::Admin => {
                sqlx::query_as::<_, PaymentSummary>(&format!("{SUMMARY_SELECT} ORDER BY p.id"))
                    .fetch_all(&self.database)
                    .await?
            }
            Role::Lecturer => {
                sqlx::query_as::<_, PaymentSummary>(&format!(
                    "{SUMMARY_SELECT} WHERE c.lecturer_id = ? ORDER BY p.id"
                ))
                .bind(caller.id)
                .fetch_all(&self.database)
                .await?
            }
            Role::Student => {
                sqlx::query_as::<_, PaymentSummary>(&format!(
                    "{SUMMARY_SELECT} WHERE e.student_id = ? ORDER BY p.id"
                ))
                .bind(caller.id)
                .fetch_all(&self.database)
                .await?
            }
        };
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        enrollment::FeeStatus,
        mail::testing::{FailingMailer, RecordingMailer},
        testing,
    };

    struct Fixture {
        database: SqlitePool,
        mailer: Arc<RecordingMailer>,
        service: PaymentService,
        student: AuthUser,
        enrollment_id: i64,
    }

    async fn fixture() -> Fixture {
        let database = testing::database().await;
        let lecturer = testing::account(&database, "Lee", Role::Lecturer).await;
        let student = testing::account(&database, "Sam", Role::Student).await;
        let course_id = testing::course(&database, &lecturer, 19_900).await;
        let enrollment_id = testing::enrollment(&database, &student, course_id).await;
        let mailer = Arc::new(RecordingMailer::default());
        let service = PaymentService::new(database.clone(), mailer.clone(), OtpConfig::default());
        Fixture {
            database,
            mailer,
            service,
            student,
            enrollment_id,
        }
    }

    fn code_in_last_mail(mailer: &RecordingMailer) -> String {
        let body = mailer.last().unwrap().body;
        body.split(|c: char| !c.is_ascii_digit())
            .find(|word| word.len() == OTP_LEN)
            .unwrap()
            .to_string()
    }

    fn wrong_code(code: &str) -> String {
        let wrong = if code == "000000" { "111111" } else { "000000" };
        wrong.to_string()
    }

    async fn stored(database: &SqlitePool, id: i64) -> Payment {
        sqlx::query_as::<_, Payment>("SELECT * FROM payment WHERE id = ?")
            .bind(id)
            .fetch_one(database)
            .await
            .unwrap()
    }

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..200 {
            let code = OtpCode::generate();
            assert!(OtpCode::is_well_formed(code.as_str()), "{}", code.as_str());
        }
        assert!(!OtpCode::is_well_formed("12345"));
        assert!(!OtpCode::is_well_formed("12345a"));
        assert!(!OtpCode::is_well_formed("١٢٣٤٥٦"));
    }

    #[test]
    fn debug_hides_the_code() {
        assert_eq!(format!("{:?}", OtpCode("123456".into())), "OtpCode([REDACTED])");
    }

    #[tokio::test]
    async fn issue_stores_challenge_and_mails_it() {
        let f = fixture().await;
        let before = now_utc();
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        assert_eq!(issued.expires_in, 300);

        let payment = stored(&f.database, issued.payment_id).await;
        assert_eq!(payment.status, PaymentStatus::OtpSent);
        assert_eq!(payment.otp_attempts, 0);
        assert_eq!(payment.amount_cents, 19_900);
        let expires_at = payment.otp_expires_at.unwrap();
        assert!(expires_at >= before + time::Duration::seconds(300));
        assert!(expires_at <= now_utc() + time::Duration::seconds(300));

        assert_eq!(f.mailer.count(), 1);
        assert_eq!(f.mailer.last().unwrap().to, "sam@example.com");
        assert_eq!(code_in_last_mail(&f.mailer), payment.otp.unwrap().as_str());
    }

    #[tokio::test]
    async fn correct_code_completes_payment_and_enrollment_once() {
        let f = fixture().await;
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        let code = code_in_last_mail(&f.mailer);

        let summary = f
            .service
            .verify_otp(&f.student, issued.payment_id, &code)
            .await
            .unwrap();
        assert_eq!(summary.status, PaymentStatus::Completed);
        assert!(summary.paid_at.is_some());
        assert!(summary.otp_expires_at.is_none());

        let payment = stored(&f.database, issued.payment_id).await;
        assert!(payment.otp.is_none());
        let enrollment = enrollment::find_enrollment(&f.database, f.enrollment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert_eq!(enrollment.payment_status, FeeStatus::Paid);
        // otp mail + confirmation
        assert_eq!(f.mailer.count(), 2);

        let again = f.service.verify_otp(&f.student, issued.payment_id, &code).await;
        match again {
            Err(AppError::BadRequest(message)) => assert!(message.contains("already completed")),
            other => panic!("unexpected {other:?}"),
        }
        let reissue = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await;
        assert!(matches!(reissue, Err(AppError::Conflict(_))));
        assert!(matches!(
            f.service.resend_otp(&f.student, issued.payment_id).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn three_wrong_codes_burn_the_challenge() {
        let f = fixture().await;
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Paypal)
            .await
            .unwrap();
        let code = code_in_last_mail(&f.mailer);
        let wrong = wrong_code(&code);

        for expected_left in [2, 1, 0] {
            match f.service.verify_otp(&f.student, issued.payment_id, &wrong).await {
                Err(AppError::InvalidOtp { attempts_left, .. }) => {
                    assert_eq!(attempts_left, expected_left)
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        let payment = stored(&f.database, issued.payment_id).await;
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.otp_attempts, 3);
        assert!(payment.otp.is_none());

        let fourth = f.service.verify_otp(&f.student, issued.payment_id, &code).await;
        assert!(matches!(fourth, Err(AppError::BadRequest(_))));
        let enrollment = enrollment::find_enrollment(&f.database, f.enrollment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(enrollment.payment_status, FeeStatus::Pending);
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let f = fixture().await;
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        let code = code_in_last_mail(&f.mailer);
        sqlx::query("UPDATE payment SET otp_expires_at = ? WHERE id = ?")
            .bind(now_utc() - time::Duration::seconds(1))
            .bind(issued.payment_id)
            .execute(&f.database)
            .await
            .unwrap();

        let result = f.service.verify_otp(&f.student, issued.payment_id, &code).await;
        match result {
            Err(AppError::BadRequest(message)) => assert!(message.contains("expired")),
            other => panic!("unexpected {other:?}"),
        }
        let payment = stored(&f.database, issued.payment_id).await;
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.otp_attempts, 0);
    }

    #[tokio::test]
    async fn resend_resets_attempts_and_invalidates_old_code() {
        let f = fixture().await;
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        let first = code_in_last_mail(&f.mailer);
        let _ = f
            .service
            .verify_otp(&f.student, issued.payment_id, &wrong_code(&first))
            .await;
        assert_eq!(stored(&f.database, issued.payment_id).await.otp_attempts, 1);

        // keep resending until the new code differs from the old one
        let mut second = first.clone();
        while second == first {
            let resent = f.service.resend_otp(&f.student, issued.payment_id).await.unwrap();
            assert_eq!(resent.payment_id, issued.payment_id);
            assert_eq!(resent.expires_in, 300);
            second = code_in_last_mail(&f.mailer);
        }
        let payment = stored(&f.database, issued.payment_id).await;
        assert_eq!(payment.otp_attempts, 0);
        assert_eq!(payment.status, PaymentStatus::OtpSent);

        let stale = f.service.verify_otp(&f.student, issued.payment_id, &first).await;
        assert!(matches!(stale, Err(AppError::InvalidOtp { attempts_left: 2, .. })));
        let done = f
            .service
            .verify_otp(&f.student, issued.payment_id, &second)
            .await
            .unwrap();
        assert_eq!(done.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn reissue_overwrites_instead_of_duplicating() {
        let f = fixture().await;
        let first = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        let second = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Wallet)
            .await
            .unwrap();
        assert_eq!(first.payment_id, second.payment_id);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payment")
            .fetch_one(&f.database)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            stored(&f.database, first.payment_id).await.payment_method,
            PaymentMethod::Wallet
        );
    }

    #[tokio::test]
    async fn failed_challenge_can_be_restarted() {
        let f = fixture().await;
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        let wrong = wrong_code(&code_in_last_mail(&f.mailer));
        for _ in 0..3 {
            let _ = f.service.verify_otp(&f.student, issued.payment_id, &wrong).await;
        }
        f.service.resend_otp(&f.student, issued.payment_id).await.unwrap();
        let code = code_in_last_mail(&f.mailer);
        let done = f
            .service
            .verify_otp(&f.student, issued.payment_id, &code)
            .await
            .unwrap();
        assert_eq!(done.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn strangers_cannot_touch_a_payment() {
        let f = fixture().await;
        let other = testing::account(&f.database, "Tia", Role::Student).await;
        assert!(matches!(
            f.service.issue_otp(&other, f.enrollment_id, PaymentMethod::Card).await,
            Err(AppError::Forbidden(_))
        ));
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        assert!(matches!(
            f.service.verify_otp(&other, issued.payment_id, "123456").await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            f.service.get_payment(&other, issued.payment_id).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(f.service.list_payments(&other).await.unwrap().is_empty());
        assert_eq!(f.service.list_payments(&f.student).await.unwrap().len(), 1);
        assert!(matches!(
            f.service.verify_otp(&f.student, issued.payment_id + 1, "123456").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_code_is_not_counted() {
        let f = fixture().await;
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        for bad in ["", "12345", "1234567", "abcdef"] {
            assert!(matches!(
                f.service.verify_otp(&f.student, issued.payment_id, bad).await,
                Err(AppError::BadRequest(_))
            ));
        }
        assert_eq!(stored(&f.database, issued.payment_id).await.otp_attempts, 0);
    }

    #[tokio::test]
    async fn cancelled_enrollment_cannot_be_paid() {
        let f = fixture().await;
        enrollment::cancel_enrollment(&f.database, &f.student, f.enrollment_id)
            .await
            .unwrap();
        assert!(matches!(
            f.service.issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn mail_failure_keeps_the_stored_code() {
        let f = fixture().await;
        let service = PaymentService::new(f.database.clone(), Arc::new(FailingMailer), OtpConfig::default());
        let result = service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await;
        assert!(matches!(result, Err(AppError::Mail(_))));
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payment WHERE enrollment_id = ?")
            .bind(f.enrollment_id)
            .fetch_one(&f.database)
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::OtpSent);
        assert!(payment.otp.is_some());

        // a working mailer can deliver a fresh code afterwards
        f.service.resend_otp(&f.student, payment.id).await.unwrap();
        assert_eq!(f.mailer.count(), 1);
    }

    #[tokio::test]
    async fn confirmation_failure_does_not_revert() {
        let f = fixture().await;
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        let code = code_in_last_mail(&f.mailer);
        let failing = PaymentService::new(f.database.clone(), Arc::new(FailingMailer), OtpConfig::default());
        let done = failing
            .verify_otp(&f.student, issued.payment_id, &code)
            .await
            .unwrap();
        assert_eq!(done.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_wrong_attempts_are_all_counted() {
        let f = fixture().await;
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        let wrong = wrong_code(&code_in_last_mail(&f.mailer));
        let attempts = (0..5).map(|_| {
            let service = f.service.clone();
            let student = f.student.clone();
            let wrong = wrong.clone();
            tokio::spawn(async move { service.verify_otp(&student, issued.payment_id, &wrong).await })
        });
        for handle in attempts.collect::<Vec<_>>() {
            assert!(handle.await.unwrap().is_err());
        }
        let payment = stored(&f.database, issued.payment_id).await;
        assert_eq!(payment.otp_attempts, 3);
        assert_eq!(payment.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_enrollment_cannot_be_paid_with_a_live_code() {
        let f = fixture().await;
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        let code = code_in_last_mail(&f.mailer);
        enrollment::cancel_enrollment(&f.database, &f.student, f.enrollment_id)
            .await
            .unwrap();

        let payment = stored(&f.database, issued.payment_id).await;
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert!(payment.otp.is_none());

        match f.service.verify_otp(&f.student, issued.payment_id, &code).await {
            Err(AppError::BadRequest(message)) => assert!(message.contains("cancelled")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            f.service.resend_otp(&f.student, issued.payment_id).await,
            Err(AppError::BadRequest(_))
        ));
        let enrollment = enrollment::find_enrollment(&f.database, f.enrollment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Cancelled);
        assert_eq!(enrollment.payment_status, FeeStatus::Pending);
    }

    #[tokio::test]
    async fn completion_loses_to_a_racing_cancel() {
        let f = fixture().await;
        let issued = f
            .service
            .issue_otp(&f.student, f.enrollment_id, PaymentMethod::Card)
            .await
            .unwrap();
        let payment = stored(&f.database, issued.payment_id).await;
        let code = payment.otp.clone().unwrap();
        // the enrollment flips after verify_otp has already checked it
        sqlx::query("UPDATE enrollment SET status = 'cancelled' WHERE id = ?")
            .bind(f.enrollment_id)
            .execute(&f.database)
            .await
            .unwrap();

        let result = f.service.complete(&payment, &code).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        let payment = stored(&f.database, issued.payment_id).await;
        assert_eq!(payment.status, PaymentStatus::OtpSent);
        assert!(payment.paid_at.is_none());
        let enrollment = enrollment::find_enrollment(&f.database, f.enrollment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(enrollment.payment_status, FeeStatus::Pending);
    }
}
