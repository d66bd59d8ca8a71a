use async_trait::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, Message,
    SmtpTransport, Transport,
};
use std::time::Duration;

use crate::config::SmtpConfig;
use crate::services::ServiceError;

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_two_factor_code(&self, to_email: &str, code: &str) -> Result<(), ServiceError>;

    async fn send_welcome_email(&self, to_email: &str, username: &str)
        -> Result<(), ServiceError>;
}

#[derive(Clone)]
pub struct EmailService {
    mailer: SmtpTransport,
    from_email: String,
}

impl EmailService {
    pub fn new(config: &SmtpConfig) -> Result<Self, ServiceError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let mailer = SmtpTransport::relay(&config.host)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!(e.to_string())))?
            .credentials(creds)
            .port(587)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.host, "Email service initialized");

        Ok(Self {
            mailer,
            from_email: config.from_address.clone(),
        })
    }

    async fn send_email(
        &self,
        to_email: &str,
        subject: &str,
        plain_body: &str,
        html_body: &str,
    ) -> Result<(), ServiceError> {
        let email = Message::builder()
            .from(self.from_email.parse().map_err(
                |e: lettre::address::AddressError| ServiceError::Internal(e.into()),
            )?)
            .to(to_email.parse().map_err(
                |e: lettre::address::AddressError| ServiceError::Internal(e.into()),
            )?)
            .subject(subject)
            .multipart(
                lettre::message::MultiPart::alternative()
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain_body.to_string()),
                    )
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body.to_string()),
                    ),
            )
            .map_err(|e| ServiceError::Internal(e.into()))?;

        // Send in the blocking thread pool; the SMTP transport is sync.
        let mailer = self.mailer.clone();
        let result = tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| ServiceError::Internal(e.into()))?;

        match result {
            Ok(_) => {
                tracing::info!(to = %to_email, subject = %subject, "Email sent");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e.to_string(), to = %to_email, "Failed to send email");
                Err(ServiceError::EmailError(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl EmailProvider for EmailService {
    async fn send_two_factor_code(&self, to_email: &str, code: &str) -> Result<(), ServiceError> {
        let html_body = format!(
            r#"<html>
                <body style="font-family: Arial, sans-serif;">
                    <h2>Your sign-in code</h2>
                    <p>Enter this code to finish signing in:</p>
                    <p style="font-size: 28px; letter-spacing: 4px; font-weight: bold;">{}</p>
                    <p style="color: #666; font-size: 12px;">
                        This code expires shortly. If you didn't try to sign in, please ignore this email.
                    </p>
                </body>
            </html>"#,
            code
        );

        let plain_body = format!(
            "Your sign-in code\n\nEnter this code to finish signing in: {}\n\nThis code expires shortly. If you didn't try to sign in, please ignore this email.",
            code
        );

        self.send_email(to_email, "Your sign-in code", &plain_body, &html_body)
            .await
    }

    async fn send_welcome_email(
        &self,
        to_email: &str,
        username: &str,
    ) -> Result<(), ServiceError> {
        let html_body = format!(
            r#"<html>
                <body style="font-family: Arial, sans-serif;">
                    <h2>Welcome, {}</h2>
                    <p>Your account has been created. You can now sign in to the internal applications.</p>
                </body>
            </html>"#,
            username
        );

        let plain_body = format!(
            "Welcome, {}\n\nYour account has been created. You can now sign in to the internal applications.",
            username
        );

        self.send_email(to_email, "Welcome", &plain_body, &html_body)
            .await
    }
}

/// No-op provider for tests and local development.
#[derive(Debug, Clone, Default)]
pub struct MockEmailService;

#[async_trait]
impl EmailProvider for MockEmailService {
    async fn send_two_factor_code(&self, _to_email: &str, _code: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn send_welcome_email(
        &self,
        _to_email: &str,
        _username: &str,
    ) -> Result<(), ServiceError> {
        Ok(())
    }
}
