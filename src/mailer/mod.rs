//! Notification Mailer
//!
//! Sends a message over SMTP to the configured recipients. Candidate
//! servers come from the configuration, or from the MX records of the first
//! recipient's domain (looked up once per [`Mailer`]). Each attempt runs the
//! whole connect, TLS, authenticate, verify and send sequence; failed
//! attempts move on to the next server and whole rounds are repeated
//! `tries` times with `delay` in between.

mod discovery;
mod message;

pub use discovery::{lookup_mx, recipient_domain};
pub use message::{MailMessage, SensitivityHeader, build_message, content_type_for};

use crate::config::MailConfig;
use crate::error::{Error, MailError, Result};
use lettre::Message;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Certificate, SmtpConnection, TlsParameters};
use lettre::transport::smtp::commands::Vrfy;
use lettre::transport::smtp::extension::ClientId;
use tokio::sync::OnceCell;

/// Where and how a message was delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailDelivery {
    /// Server that accepted the message
    pub server: String,
    /// Attempt number (1-based) across all servers
    pub attempt: u32,
    /// Recipients the server did not confirm through VRFY
    pub unverified: Vec<String>,
}

/// SMTP sender for one configuration
pub struct Mailer {
    config: MailConfig,
    default_from: String,
    discovered: OnceCell<Vec<String>>,
}

impl Mailer {
    /// Mailer sending as `config.from`, else `<sender_name>@<hostname>`
    pub fn new(config: MailConfig, sender_name: &str) -> Self {
        let host = ClientId::default().to_string();
        Self {
            config,
            default_from: format!("{sender_name}@{host}"),
            discovered: OnceCell::new(),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &MailConfig {
        &self.config
    }

    /// Whether a message would be sent at all
    pub fn is_active(&self) -> bool {
        self.config.enabled && self.config.has_recipients()
    }

    /// Configured servers, or the MX hosts of the first recipient's domain
    pub async fn candidate_servers(&self) -> Result<Vec<String>> {
        if !self.config.servers.is_empty() {
            return Ok(self.config.servers.clone());
        }
        let servers = self
            .discovered
            .get_or_try_init(|| async {
                let domain = self
                    .config
                    .to
                    .iter()
                    .chain(&self.config.cc)
                    .chain(&self.config.bcc)
                    .find_map(|address| recipient_domain(address))
                    .ok_or_else(|| MailError::NoServer("no recipient domain".to_string()))?;
                lookup_mx(&domain).await
            })
            .await?;
        Ok(servers.clone())
    }

    /// Send `message`; the error names every server tried
    pub async fn send_email(&self, message: &MailMessage) -> Result<MailDelivery> {
        if !self.config.enabled {
            return Err(MailError::Disabled.into());
        }
        if !self.config.has_recipients() {
            return Err(MailError::Compose("no recipients configured".to_string()).into());
        }
        let email = build_message(&self.config, message, &self.default_from)?;
        let servers = self.candidate_servers().await?;

        let mut attempt = 0;
        let mut last_error = String::new();
        for round in 1..=self.config.tries {
            for server in &servers {
                attempt += 1;
                let config = self.config.clone();
                let host = server.clone();
                let email = email.clone();
                let result = tokio::task::spawn_blocking(move || deliver(&host, &config, &email))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r);
                match result {
                    Ok(unverified) => {
                        tracing::info!(server = %server, attempt, subject = %message.subject, "notification sent");
                        return Ok(MailDelivery {
                            server: server.clone(),
                            attempt,
                            unverified,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(server = %server, attempt, error = %e, "notification attempt failed");
                        last_error = e;
                    }
                }
            }
            if round < self.config.tries {
                tokio::time::sleep(self.config.delay).await;
            }
        }

        Err(Error::Mail(MailError::Exhausted {
            servers,
            attempts: attempt,
            last_error,
        }))
    }
}

fn tls_parameters(server: &str, config: &MailConfig) -> std::result::Result<TlsParameters, String> {
    let mut builder = TlsParameters::builder(server.to_string());
    if let Some(path) = &config.certificate {
        let pem = std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        let certificate = Certificate::from_pem(&pem).map_err(|e| e.to_string())?;
        builder = builder.add_root_certificate(certificate);
    }
    builder.build().map_err(|e| e.to_string())
}

/// One connect-verify-send sequence; returns the unverified recipients
fn deliver(server: &str, config: &MailConfig, email: &Message) -> std::result::Result<Vec<String>, String> {
    let hello = ClientId::default();
    let tls = tls_parameters(server, config)?;
    let implicit_tls = config.ssl.then_some(&tls);
    let mut connection = SmtpConnection::connect(
        (server, config.port),
        Some(config.timeout),
        &hello,
        implicit_tls,
        None,
    )
    .map_err(|e| format!("connect: {e}"))?;

    if !config.ssl && connection.can_starttls() {
        connection
            .starttls(&tls, &hello)
            .map_err(|e| format!("STARTTLS: {e}"))?;
    }
    if let (Some(user), Some(password)) = (&config.username, &config.password) {
        let credentials = Credentials::new(user.clone(), password.clone());
        connection
            .auth(&[Mechanism::Plain, Mechanism::Login], &credentials)
            .map_err(|e| format!("authentication: {e}"))?;
    }

    // VRFY is advisory; many servers refuse it
    let mut unverified = Vec::new();
    for address in email.envelope().to() {
        match connection.command(Vrfy::new(address.to_string())) {
            Ok(response) if response.is_positive() => {}
            Ok(_) | Err(_) => unverified.push(address.to_string()),
        }
    }

    connection
        .send(email.envelope(), &email.formatted())
        .map_err(|e| format!("send: {e}"))?;
    connection.quit().ok();
    Ok(unverified)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn disabled_mailer_refuses_to_send() {
        let config = MailConfig {
            enabled: false,
            to: vec!["ops@example.com".into()],
            ..Default::default()
        };
        let mailer = Mailer::new(config, "nightly");
        assert!(!mailer.is_active());
        let err = mailer.send_email(&MailMessage::new("s", "b")).await.unwrap_err();
        assert!(matches!(err, Error::Mail(MailError::Disabled)));
    }

    #[tokio::test]
    async fn configured_servers_skip_discovery() {
        let config = MailConfig {
            servers: vec!["smtp.example.com".into()],
            to: vec!["ops@example.com".into()],
            ..Default::default()
        };
        let mailer = Mailer::new(config, "nightly");
        assert_eq!(mailer.candidate_servers().await.unwrap(), vec!["smtp.example.com"]);
    }

    #[tokio::test]
    async fn unreachable_servers_exhaust_every_attempt() {
        // port 9 on localhost refuses connections
        let config = MailConfig {
            servers: vec!["127.0.0.1".into()],
            port: 9,
            to: vec!["ops@example.com".into()],
            tries: 2,
            delay: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let mailer = Mailer::new(config, "nightly");
        let err = mailer.send_email(&MailMessage::new("s", "b")).await.unwrap_err();
        match err {
            Error::Mail(MailError::Exhausted {
                servers, attempts, ..
            }) => {
                assert_eq!(servers, vec!["127.0.0.1"]);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }
}
