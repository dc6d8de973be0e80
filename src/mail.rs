use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use tracing::info;

use crate::config::MailConfig;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound email. Sends are awaited inline by the caller.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<(), MailError>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Plain SMTP to a relay; TLS is the relay's business.
    pub fn new(host: &str, config: &MailConfig, password: Option<String>) -> Result<Self, MailError> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(config.smtp_port);
        if let (Some(username), Some(password)) = (&config.smtp_username, password) {
            builder = builder.credentials(Credentials::new(username.clone(), password));
        }
        Ok(Self {
            transport: builder.build(),
            from: config.from.parse()?,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), MailError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(mail.to.parse()?)
            .subject(mail.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body)?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// Writes mail to the log instead of sending it. Used when no SMTP relay
/// is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), MailError> {
        info!(to = %mail.to, subject = %mail.subject, "mail (not sent):\n{}", mail.body);
        Ok(())
    }
}

pub fn from_config(config: &MailConfig, password: Option<String>) -> Result<Box<dyn Mailer>, MailError> {
    match &config.smtp_host {
        Some(host) => {
            info!("sending mail through {}:{}", host, config.smtp_port);
            Ok(Box::new(SmtpMailer::new(host, config, password)?))
        }
        None => {
            info!("no smtp host configured, mail goes to the log");
            Ok(Box::new(LogMailer))
        }
    }
}

pub fn otp_mail(to: &str, name: &str, course_title: &str, code: &str, ttl: time::Duration) -> OutgoingMail {
    OutgoingMail {
        to: to.to_string(),
        subject: "Your payment verification code".to_string(),
        body: format!(
            "Hello {name},\n\n\
             Your verification code for the payment of \"{course_title}\" is {code}.\n\
             It expires in {} minutes. Do not share this code with anyone.\n",
            ttl.whole_minutes()
        ),
    }
}

pub fn payment_confirmation_mail(
    to: &str,
    name: &str,
    course_title: &str,
    amount_cents: i64,
) -> OutgoingMail {
    OutgoingMail {
        to: to.to_string(),
        subject: "Payment confirmed".to_string(),
        body: format!(
            "Hello {name},\n\n\
             We received your payment of {}.{:02} for \"{course_title}\".\n\
             Your enrollment is now complete.\n",
            amount_cents / 100,
            amount_cents % 100
        ),
    }
}
