//! Outbound email transport.
//!
//! The verification lifecycle only sees the [`EmailTransport`] trait. SMTP
//! delivery goes through lettre; without SMTP settings a logging transport
//! stands in so the rest of the service keeps working.

use crate::config::EmailConfig;
use crate::errors::{ServiceError, ServiceResult};
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::str::FromStr;
use uuid::Uuid;

/// A verification code addressed to one recipient.
#[derive(Debug, Clone)]
pub struct VerificationEmail<'a> {
    pub to: &'a str,
    pub username: &'a str,
    pub code: &'a str,
    /// How long the code stays valid.
    pub expires_in_hours: i64,
    pub unsubscribe_token: Option<&'a str>,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Delivers the message and returns the provider's message id.
    async fn send_verification_email(&self, email: &VerificationEmail<'_>) -> ServiceResult<String>;
}

pub struct SmtpEmailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    config: EmailConfig,
}

impl SmtpEmailTransport {
    pub fn new(config: EmailConfig) -> ServiceResult<Self> {
        let creds = Credentials::new(config.smtp_username.clone(), config.smtp_password.clone());

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            .map_err(|e| ServiceError::validation(format!("Invalid SMTP host: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        Ok(Self { mailer, config })
    }

    fn from_domain(&self) -> &str {
        self.config
            .from_email
            .rsplit_once('@')
            .map_or("localhost", |(_, domain)| domain)
    }

    fn unsubscribe_url(&self, token: &str) -> String {
        format!("{}/email/unsubscribe?token={token}", self.config.base_url)
    }

    fn build_verification_text(&self, email: &VerificationEmail<'_>) -> String {
        let mut text = format!(
            "Hi {},\n\nYour verification code is {}.\n\n\
             The code expires in {} hours. If you did not request it, you can ignore this email.\n",
            email.username, email.code, email.expires_in_hours
        );
        if let Some(token) = email.unsubscribe_token {
            text.push_str(&format!(
                "\nStop receiving these emails: {}\n",
                self.unsubscribe_url(token)
            ));
        }
        text
    }

    fn build_verification_html(&self, email: &VerificationEmail<'_>) -> String {
        let footer = email
            .unsubscribe_token
            .map(|token| {
                format!(
                    r#"<p style="font-size: 12px; color: #7f8c8d;"><a href="{}">Unsubscribe</a></p>"#,
                    self.unsubscribe_url(token)
                )
            })
            .unwrap_or_default();

        format!(
            r#"
            <!DOCTYPE html>
            <html>
            <head><meta charset="UTF-8"><title>Verify your email</title></head>
            <body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
                <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
                    <p>Hi {},</p>
                    <p>Your verification code is:</p>
                    <p style="font-size: 28px; letter-spacing: 6px; font-weight: bold;">{}</p>
                    <p>The code expires in {} hours. If you did not request it, you can ignore this email.</p>
                    {}
                </div>
            </body>
            </html>
            "#,
            email.username, email.code, email.expires_in_hours, footer
        )
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send_verification_email(&self, email: &VerificationEmail<'_>) -> ServiceResult<String> {
        let from_mailbox = Mailbox::from_str(&format!(
            "{} <{}>",
            self.config.from_name, self.config.from_email
        ))
        .map_err(|e| ServiceError::validation(format!("Invalid from email: {e}")))?;

        let to_mailbox = Mailbox::from_str(email.to)
            .map_err(|e| ServiceError::validation(format!("Invalid recipient email: {e}")))?;

        let message_id = format!("<{}@{}>", Uuid::now_v7(), self.from_domain());

        let message = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject("Your verification code")
            .message_id(Some(message_id.clone()))
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(self.build_verification_text(email)),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(self.build_verification_html(email)),
                    ),
            )
            .map_err(|e| ServiceError::validation(format!("Failed to build email: {e}")))?;

        self.mailer
            .send(message)
            .await
            .map_err(|e| ServiceError::external_service(format!("Failed to send email: {e}")))?;

        Ok(message_id)
    }
}

/// Used when SMTP is not configured. Records that a message would have been
/// sent; the code itself is not written anywhere.
pub struct LogEmailTransport;

#[async_trait]
impl EmailTransport for LogEmailTransport {
    async fn send_verification_email(&self, email: &VerificationEmail<'_>) -> ServiceResult<String> {
        let message_id = format!("<{}@localhost>", Uuid::now_v7());
        tracing::info!(
            to_email = %email.to,
            message_id = %message_id,
            "SMTP not configured, verification email not delivered"
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SmtpEmailTransport {
        SmtpEmailTransport::new(EmailConfig {
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
            smtp_username: "mailer".to_string(),
            smtp_password: "password".to_string(),
            from_email: "no-reply@example.com".to_string(),
            from_name: "Example".to_string(),
            base_url: "https://example.com".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_bodies_carry_code_and_unsubscribe_link() {
        let transport = transport();
        let email = VerificationEmail {
            to: "reader@example.com",
            username: "reader",
            code: "042917",
            expires_in_hours: 6,
            unsubscribe_token: Some("tok"),
        };

        let text = transport.build_verification_text(&email);
        assert!(text.contains("042917"));
        assert!(text.contains("expires in 6 hours"));
        assert!(text.contains("https://example.com/email/unsubscribe?token=tok"));

        let html = transport.build_verification_html(&email);
        assert!(html.contains("042917"));
        assert!(html.contains("expires in 6 hours"));
        assert!(html.contains("Unsubscribe"));
        assert_eq!(transport.from_domain(), "example.com");
    }
}
