use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

use crate::models::SmtpConfig;

const EPUB_CONTENT_TYPE: &str = "application/epub+zip";
const IMPLICIT_TLS_PORT: u16 = 465;
const MB: f64 = 1024.0 * 1024.0;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("EPUB file not found: {0}")]
    AttachmentMissing(PathBuf),

    #[error("File too large: {:.1}MB exceeds {:.0}MB limit", megabytes(.size), megabytes(.limit))]
    AttachmentTooLarge { size: u64, limit: u64 },

    #[error("Invalid email address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error("Failed to build email: {0}")]
    Build(String),

    #[error("Cannot connect to SMTP server {host}:{port}: {reason}")]
    Connection { host: String, port: u16, reason: String },

    #[error("SMTP authentication failed for {username}@{host}: {reason}")]
    Auth {
        username: String,
        host: String,
        reason: String,
    },

    #[error("Failed to send email: {0}")]
    Send(String),
}

fn megabytes(bytes: &u64) -> f64 {
    *bytes as f64 / MB
}

/// Sends a generated EPUB to a reader's address.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        config: &SmtpConfig,
        to: &str,
        subject: &str,
        attachment: &Path,
        display_name: Option<&str>,
    ) -> Result<(), MailError>;
}

pub struct SmtpMailer {
    max_attachment_bytes: u64,
}

impl SmtpMailer {
    pub fn new(max_attachment_bytes: u64) -> Self {
        Self {
            max_attachment_bytes,
        }
    }

    /// Connect and authenticate without sending anything.
    pub async fn verify(&self, config: &SmtpConfig) -> Result<(), MailError> {
        tracing::info!("Testing SMTP connection to {}:{}", config.host, config.port);
        let transport = transport(config)?;
        match transport.test_connection().await {
            Ok(true) => {
                tracing::info!("SMTP connection test successful");
                Ok(())
            }
            Ok(false) => Err(MailError::Connection {
                host: config.host.clone(),
                port: config.port,
                reason: "server did not accept the connection".to_string(),
            }),
            Err(e) => Err(classify(config, e)),
        }
    }

    async fn build_message(
        &self,
        config: &SmtpConfig,
        to: &str,
        subject: &str,
        attachment: &Path,
        display_name: Option<&str>,
    ) -> Result<Message, MailError> {
        let size = match tokio::fs::metadata(attachment).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(MailError::AttachmentMissing(attachment.to_path_buf())),
        };
        if size > self.max_attachment_bytes {
            return Err(MailError::AttachmentTooLarge {
                size,
                limit: self.max_attachment_bytes,
            });
        }

        let from = parse_mailbox(&config.from_email)?;
        let to = parse_mailbox(to)?;

        let file_name = attachment
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "delivery.epub".to_string());
        let attachment_name = match display_name {
            // The attachment name becomes the document title on the reader.
            Some(name) if !name.trim().is_empty() => {
                format!("{}.epub", name.trim().replace(['/', '\\'], "-"))
            }
            _ => file_name.clone(),
        };

        let bytes = tokio::fs::read(attachment)
            .await
            .map_err(|_| MailError::AttachmentMissing(attachment.to_path_buf()))?;
        let content_type =
            ContentType::parse(EPUB_CONTENT_TYPE).map_err(|e| MailError::Build(e.to_string()))?;

        let body = format!(
            "Your Paperboy delivery: {}\n\nThis email was sent by Paperboy.",
            file_name
        );

        Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(body))
                    .singlepart(Attachment::new(attachment_name).body(bytes, content_type)),
            )
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        config: &SmtpConfig,
        to: &str,
        subject: &str,
        attachment: &Path,
        display_name: Option<&str>,
    ) -> Result<(), MailError> {
        let message = self
            .build_message(config, to, subject, attachment, display_name)
            .await?;

        tracing::info!("Sending email to {} via {}:{}", to, config.host, config.port);
        transport(config)?
            .send(message)
            .await
            .map_err(|e| classify(config, e))?;

        tracing::info!("Email sent successfully to {}", to);
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.trim().parse().map_err(|e: lettre::address::AddressError| MailError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

fn transport(config: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
    let builder = if config.port == IMPLICIT_TLS_PORT {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
    } else if config.use_tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
    } else {
        Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host))
    }
    .map_err(|e| MailError::Connection {
        host: config.host.clone(),
        port: config.port,
        reason: e.to_string(),
    })?;

    let credentials = Credentials::new(config.username.clone(), config.password.clone());
    Ok(builder.port(config.port).credentials(credentials).build())
}

/// 53x replies are authentication failures; no reply at all means we never
/// got a working session.
fn classify(config: &SmtpConfig, e: lettre::transport::smtp::Error) -> MailError {
    match e.status() {
        Some(code) if code.to_string().starts_with("53") => MailError::Auth {
            username: config.username.clone(),
            host: config.host.clone(),
            reason: e.to_string(),
        },
        Some(_) => MailError::Send(e.to_string()),
        None => MailError::Connection {
            host: config.host.clone(),
            port: config.port,
            reason: e.to_string(),
        },
    }
}
