use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{EmailConfig, SmtpConfig};
use crate::error::{NotifyError, Result};
use crate::metrics::{EMAIL_FALLBACK_USED, EMAIL_SUBMIT_TIME};
use crate::models::Channel;

#[derive(Debug, Clone, Default)]
pub struct EmailMessage {
    pub to: String,
    pub to_name: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub attachments: Vec<EmailAttachment>,
}

#[derive(Debug, Clone)]
pub struct EmailAttachment {
    pub name: String,
    pub content_base64: String,
}

#[derive(Debug, Clone)]
pub struct EmailReceipt {
    pub provider: &'static str,
    pub message_id: Option<String>,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn submit(&self, message: &EmailMessage) -> Result<EmailReceipt>;
}

fn transient(reason: impl Into<String>) -> NotifyError {
    NotifyError::ChannelTransient {
        channel: Channel::Email,
        reason: reason.into(),
    }
}

fn permanent(reason: impl Into<String>) -> NotifyError {
    NotifyError::ChannelPermanent {
        channel: Channel::Email,
        reason: reason.into(),
    }
}

/// Primary provider: HTTP API submission. 2xx is accepted, 4xx is a
/// permanent rejection, 5xx and network errors are transient.
pub struct HttpEmailProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from_address: String,
    from_name: String,
}

impl HttpEmailProvider {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.primary_timeout_s))
            .build()
            .map_err(|e| NotifyError::Config(format!("email http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.primary_endpoint.clone(),
            api_key: config.primary_api_key.clone(),
            from_address: config.from_address.clone(),
            from_name: config.from_name.clone(),
        })
    }

    #[cfg(test)]
    fn with_endpoint(endpoint: String, config: &EmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key: config.primary_api_key.clone(),
            from_address: config.from_address.clone(),
            from_name: config.from_name.clone(),
        }
    }
}

#[async_trait]
impl EmailTransport for HttpEmailProvider {
    async fn submit(&self, message: &EmailMessage) -> Result<EmailReceipt> {
        let mut payload = json!({
            "from": { "address": self.from_address, "name": self.from_name },
            "to": [{
                "address": message.to,
                "name": message.to_name.as_deref().unwrap_or(""),
            }],
            "subject": message.subject,
            "htmlbody": message.body_html,
            "textbody": message.body_text,
        });
        if !message.cc.is_empty() {
            payload["cc"] = message
                .cc
                .iter()
                .map(|a| json!({ "address": a, "name": "" }))
                .collect();
        }
        if !message.bcc.is_empty() {
            payload["bcc"] = message
                .bcc
                .iter()
                .map(|a| json!({ "address": a, "name": "" }))
                .collect();
        }
        if !message.attachments.is_empty() {
            payload["attachments"] = message
                .attachments
                .iter()
                .map(|a| json!({ "name": a.name, "content_base64": a.content_base64 }))
                .collect();
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transient(format!("http submit: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("message_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                });
            return Ok(EmailReceipt {
                provider: "http",
                message_id,
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(permanent(format!("provider rejected ({}): {}", status, body)))
        } else {
            Err(transient(format!("provider error ({}): {}", status, body)))
        }
    }
}

/// Fallback provider: direct SMTP submission via relay.
pub struct SmtpEmailProvider {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailProvider {
    pub fn new(smtp: &SmtpConfig, from_address: &str, from_name: &str) -> Result<Self> {
        let builder = if smtp.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
                .map_err(|e| NotifyError::Config(format!("smtp relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
        };
        let mut builder = builder.port(smtp.port);
        if !smtp.user.is_empty() {
            builder =
                builder.credentials(Credentials::new(smtp.user.clone(), smtp.password.clone()));
        }

        let from = format!("{} <{}>", from_name, from_address)
            .parse()
            .map_err(|e| NotifyError::Config(format!("from mailbox: {}", e)))?;

        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailProvider {
    async fn submit(&self, message: &EmailMessage) -> Result<EmailReceipt> {
        let to: Mailbox = match &message.to_name {
            Some(name) => format!("{} <{}>", name, message.to),
            None => message.to.clone(),
        }
        .parse()
        .map_err(|e| permanent(format!("recipient mailbox: {}", e)))?;

        let mut builder = Message::builder().from(self.from.clone()).to(to);
        for addr in &message.cc {
            let mailbox: Mailbox = addr
                .parse()
                .map_err(|e| permanent(format!("cc mailbox: {}", e)))?;
            builder = builder.cc(mailbox);
        }
        for addr in &message.bcc {
            let mailbox: Mailbox = addr
                .parse()
                .map_err(|e| permanent(format!("bcc mailbox: {}", e)))?;
            builder = builder.bcc(mailbox);
        }
        let builder = builder.subject(&message.subject);

        let body = MultiPart::alternative_plain_html(
            message.body_text.clone(),
            message.body_html.clone(),
        );
        let email = if message.attachments.is_empty() {
            builder.multipart(body)
        } else {
            let mut mixed = MultiPart::mixed().multipart(body);
            for attachment in &message.attachments {
                let bytes = BASE64_STANDARD
                    .decode(&attachment.content_base64)
                    .map_err(|e| permanent(format!("attachment {}: {}", attachment.name, e)))?;
                let content_type = ContentType::parse("application/octet-stream")
                    .map_err(|e| permanent(format!("attachment content type: {}", e)))?;
                mixed = mixed
                    .singlepart(Attachment::new(attachment.name.clone()).body(bytes, content_type));
            }
            builder.multipart(mixed)
        }
        .map_err(|e| permanent(format!("message build: {}", e)))?;

        let response = self
            .mailer
            .send(email)
            .await
            .map_err(|e| transient(format!("smtp submit: {}", e)))?;

        let message_id = response.message().next().map(str::to_string);
        Ok(EmailReceipt {
            provider: "smtp",
            message_id,
        })
    }
}

/// Primary-then-fallback submission. Transient primary failures fall
/// through to SMTP; permanent rejections do not, the message itself is
/// bad.
pub struct EmailAdapter {
    primary: Box<dyn EmailTransport>,
    fallback: Option<Box<dyn EmailTransport>>,
}

impl EmailAdapter {
    pub fn new(primary: Box<dyn EmailTransport>, fallback: Option<Box<dyn EmailTransport>>) -> Self {
        Self { primary, fallback }
    }

    pub fn from_config(config: &EmailConfig) -> Result<Self> {
        let primary = Box::new(HttpEmailProvider::new(config)?);
        let fallback: Option<Box<dyn EmailTransport>> = Some(Box::new(SmtpEmailProvider::new(
            &config.smtp,
            &config.from_address,
            &config.from_name,
        )?));
        Ok(Self::new(primary, fallback))
    }

    pub async fn send(&self, message: &EmailMessage) -> Result<EmailReceipt> {
        let timer = EMAIL_SUBMIT_TIME.start_timer();
        let result = self.send_inner(message).await;
        timer.observe_duration();
        result
    }

    async fn send_inner(&self, message: &EmailMessage) -> Result<EmailReceipt> {
        match self.primary.submit(message).await {
            Ok(receipt) => {
                info!(to = %message.to, provider = receipt.provider, "email submitted");
                Ok(receipt)
            }
            Err(err) if err.is_transient() => {
                let Some(fallback) = &self.fallback else {
                    return Err(err);
                };
                warn!(to = %message.to, error = %err, "primary email provider failed, using fallback");
                EMAIL_FALLBACK_USED.inc();
                let receipt = fallback.submit(message).await?;
                info!(to = %message.to, provider = receipt.provider, "email submitted via fallback");
                Ok(receipt)
            }
            Err(err) => Err(err),
        }
    }
}

/// In-memory transport for tests and local development: records every
/// message, optionally failing on command.
#[derive(Default)]
pub struct MemoryEmailTransport {
    sent: std::sync::Mutex<Vec<EmailMessage>>,
    fail_transient: std::sync::atomic::AtomicBool,
}

impl MemoryEmailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_transient
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailTransport for MemoryEmailTransport {
    async fn submit(&self, message: &EmailMessage) -> Result<EmailReceipt> {
        if self.fail_transient.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(transient("simulated outage"));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(EmailReceipt {
            provider: "memory",
            message_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmtpConfig;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn email_config(endpoint: String) -> EmailConfig {
        EmailConfig {
            primary_endpoint: endpoint,
            primary_api_key: "test-key".into(),
            primary_timeout_s: 5,
            from_address: "no-reply@tunedrop.io".into(),
            from_name: "TuneDrop".into(),
            smtp: SmtpConfig {
                host: "localhost".into(),
                port: 2525,
                user: String::new(),
                password: String::new(),
                tls: false,
            },
        }
    }

    fn message() -> EmailMessage {
        EmailMessage {
            to: "ada@example.com".into(),
            to_name: Some("Ada".into()),
            subject: "hello".into(),
            body_html: "<p>hi</p>".into(),
            body_text: "hi".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn http_success_returns_receipt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.1/email"))
            .and(header("Authorization", "test-key"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"message_id": "r1"})),
            )
            .mount(&server)
            .await;

        let config = email_config(format!("{}/v1.1/email", server.uri()));
        let provider = HttpEmailProvider::with_endpoint(config.primary_endpoint.clone(), &config);
        let receipt = provider.submit(&message()).await.unwrap();
        assert_eq!(receipt.provider, "http");
        assert_eq!(receipt.message_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn http_payload_matches_provider_contract() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({
                "from": { "address": "no-reply@tunedrop.io", "name": "TuneDrop" },
                "to": [{ "address": "ada@example.com", "name": "Ada" }],
                "subject": "hello",
                "htmlbody": "<p>hi</p>",
                "textbody": "hi",
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"message_id": "m1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = email_config(server.uri());
        let provider = HttpEmailProvider::with_endpoint(config.primary_endpoint.clone(), &config);
        let receipt = provider.submit(&message()).await.unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn http_payload_carries_cc_bcc_and_attachments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "cc": [{ "address": "label@example.com", "name": "" }],
                "bcc": [{ "address": "audit@example.com", "name": "" }],
                "attachments": [{ "name": "statement.pdf", "content_base64": "aGVsbG8=" }],
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"message_id": "m2"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = email_config(server.uri());
        let provider = HttpEmailProvider::with_endpoint(config.primary_endpoint.clone(), &config);
        let msg = EmailMessage {
            cc: vec!["label@example.com".into()],
            bcc: vec!["audit@example.com".into()],
            attachments: vec![EmailAttachment {
                name: "statement.pdf".into(),
                content_base64: "aGVsbG8=".into(),
            }],
            ..message()
        };
        assert!(provider.submit(&msg).await.is_ok());
    }

    #[tokio::test]
    async fn http_4xx_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let config = email_config(server.uri());
        let provider = HttpEmailProvider::with_endpoint(config.primary_endpoint.clone(), &config);
        let err = provider.submit(&message()).await.unwrap_err();
        assert!(matches!(err, NotifyError::ChannelPermanent { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn http_5xx_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = email_config(server.uri());
        let provider = HttpEmailProvider::with_endpoint(config.primary_endpoint.clone(), &config);
        let err = provider.submit(&message()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn transient_primary_failure_uses_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = email_config(server.uri());
        let primary = HttpEmailProvider::with_endpoint(config.primary_endpoint.clone(), &config);
        let fallback = std::sync::Arc::new(MemoryEmailTransport::new());

        struct Shared(std::sync::Arc<MemoryEmailTransport>);
        #[async_trait]
        impl EmailTransport for Shared {
            async fn submit(&self, m: &EmailMessage) -> Result<EmailReceipt> {
                self.0.submit(m).await
            }
        }

        let adapter = EmailAdapter::new(
            Box::new(primary),
            Some(Box::new(Shared(fallback.clone()))),
        );
        let receipt = adapter.send(&message()).await.unwrap();
        assert_eq!(receipt.provider, "memory");
        assert_eq!(fallback.sent().len(), 1);
        assert_eq!(fallback.sent()[0].to, "ada@example.com");
    }

    #[tokio::test]
    async fn permanent_rejection_skips_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let config = email_config(server.uri());
        let primary = HttpEmailProvider::with_endpoint(config.primary_endpoint.clone(), &config);
        let fallback = std::sync::Arc::new(MemoryEmailTransport::new());

        struct Shared(std::sync::Arc<MemoryEmailTransport>);
        #[async_trait]
        impl EmailTransport for Shared {
            async fn submit(&self, m: &EmailMessage) -> Result<EmailReceipt> {
                self.0.submit(m).await
            }
        }

        let adapter = EmailAdapter::new(
            Box::new(primary),
            Some(Box::new(Shared(fallback.clone()))),
        );
        assert!(adapter.send(&message()).await.is_err());
        assert!(fallback.sent().is_empty());
    }
}
