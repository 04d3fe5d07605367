//! SMTP dispatcher.
use crate::{
    ConfigureError, DispatchError, Dispatcher, default_timeout,
    template::{self, ChannelTemplate, TemplateConfig},
};
use alarm_relay_types::Notification;
use async_trait::async_trait;
use chrono::DateTime;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::header::ContentType,
    transport::smtp::authentication::Credentials,
};
use regex::Regex;
use serde::Deserialize;
use std::{sync::LazyLock, time::Duration};
use tracing::{debug, info, warn};

/// Subject used when a body template is configured without a subject template.
const DEFAULT_SUBJECT_TEMPLATE: &str = "{% if state == 'ALARM' %}*Alarm triggered*\
{% elif state == 'OK' %}Alarm cleared{% else %}Missing alarm data{% endif %} \
for {{ alarm_name }}";

static MARKDOWN_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(.*?)\]\((.*?)\)").expect("link pattern compiles"));

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct EmailConfig {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from_addr: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub template: Option<TemplateConfig>,
}

fn default_smtp_port() -> u16 {
    25
}

#[derive(Default)]
pub struct EmailDispatcher {
    config: Option<EmailConfig>,
    template: Option<ChannelTemplate>,
    subject_source: Option<String>,
    mailer: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl EmailDispatcher {
    /// Builds the transport and checks the connection. On failure the
    /// transport is discarded so the next send reconnects.
    async fn smtp_connect(&mut self) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        info!("Connecting to mail server {}", config.server);

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.server)
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout)));
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        let mailer = builder.build();

        match mailer.test_connection().await {
            Ok(true) => {
                self.mailer = Some(mailer);
                true
            }
            Ok(false) => {
                warn!("Mail server {} refused the connection", config.server);
                self.mailer = None;
                false
            }
            Err(e) => {
                warn!("Unable to connect to mail server {}: {e}", config.server);
                self.mailer = None;
                false
            }
        }
    }

    fn build_message(&self, notification: &Notification) -> Result<Message, DispatchError> {
        let config = self.config.as_ref().ok_or(DispatchError::SmtpUnavailable)?;

        let (subject, body, content_type) = match (&self.template, &self.subject_source) {
            (Some(template), Some(subject_source)) => {
                let description = format_description(
                    &notification.alarm_description,
                    template.mime_type.as_deref(),
                );
                let body = template.render(notification, &description)?;
                let subject = template::render_notification_text(
                    subject_source,
                    notification,
                    Some(&description),
                )?;
                let content_type = match template.mime_type.as_deref() {
                    Some("text/html") => ContentType::TEXT_HTML,
                    _ => ContentType::TEXT_PLAIN,
                };
                (subject, body, content_type)
            }
            _ => {
                let (subject, body) = fallback_message(notification);
                (subject, body, ContentType::TEXT_PLAIN)
            }
        };

        Ok(Message::builder()
            .from(config.from_addr.parse()?)
            .to(notification.address.parse()?)
            .subject(subject)
            .header(content_type)
            .body(body)?)
    }
}

#[async_trait]
impl Dispatcher for EmailDispatcher {
    fn kind(&self) -> &'static str {
        "email"
    }

    async fn configure(&mut self, section: &serde_yaml::Value) -> Result<(), ConfigureError> {
        let config: EmailConfig = serde_yaml::from_value(section.clone())?;
        if let Some(template_config) = &config.template {
            self.template = Some(ChannelTemplate::load(template_config)?);
            let subject_source = template_config
                .subject
                .clone()
                .unwrap_or_else(|| DEFAULT_SUBJECT_TEMPLATE.to_owned());
            template::compile_check(&subject_source)?;
            self.subject_source = Some(subject_source);
        }
        self.config = Some(config);

        if !self.smtp_connect().await {
            warn!("Mail server unavailable at configure time, will reconnect on first send");
        }
        Ok(())
    }

    async fn send_notification(
        &mut self,
        notification: &Notification,
    ) -> Result<(), DispatchError> {
        let message = self.build_message(notification)?;

        if self.mailer.is_none() && !self.smtp_connect().await {
            return Err(DispatchError::SmtpUnavailable);
        }
        let mailer = self.mailer.as_ref().ok_or(DispatchError::SmtpUnavailable)?;

        match mailer.send(message.clone()).await {
            Ok(_) => {
                debug!("Sent email to {}", notification.address);
                Ok(())
            }
            Err(e) if !e.is_permanent() => {
                // Most likely a dropped connection: reconnect and retry once.
                warn!("Mail server error ({e}), reconnecting and retrying message");
                if !self.smtp_connect().await {
                    return Err(DispatchError::SmtpUnavailable);
                }
                let mailer = self.mailer.as_ref().ok_or(DispatchError::SmtpUnavailable)?;
                mailer.send(message).await?;
                debug!("Sent email to {}", notification.address);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Formats the markdown description for the mail body: rendered to HTML for
/// HTML templates, link syntax flattened to `text (url)` for plain text.
fn format_description(text_md: &str, mime_type: Option<&str>) -> String {
    match mime_type {
        Some("text/html") => {
            let mut html = String::new();
            pulldown_cmark::html::push_html(&mut html, pulldown_cmark::Parser::new(text_md));
            html
        }
        _ => MARKDOWN_LINK.replace_all(text_md, "$1 ($2)").into_owned(),
    }
}

/// Builds the legacy untemplated message.
///
/// Notifications whose metrics carry exactly one distinct `hostname` name the
/// host (and the target host when present); everything else falls back to the
/// multi-host wording.
fn fallback_message(notification: &Notification) -> (String, String) {
    let mut hostnames: Vec<&str> = Vec::new();
    let mut target_hosts: Vec<&str> = Vec::new();
    for metric in notification.metrics() {
        if let Some(hostname) = metric.dimensions.get("hostname") {
            if !hostnames.contains(&hostname.as_str()) {
                hostnames.push(hostname.as_str());
            }
        }
        if let Some(target) = metric.dimensions.get("target_host") {
            if !target_hosts.contains(&target.as_str()) {
                target_hosts.push(target.as_str());
            }
        }
    }

    let timestamp = asctime(notification.alarm_timestamp);
    let dimensions = format_dimensions(notification);
    let message = notification.message.to_lowercase();

    match (hostnames.as_slice(), target_hosts.first()) {
        ([hostname], Some(target)) => (
            format!(
                "{} {} \"{}\" for Host: {} Target: {}",
                notification.state, notification.severity, notification.alarm_name, hostname, target
            ),
            format!(
                "On host \"{hostname}\" for target \"{target}\" {message}\n\n\
                 Alarm \"{alarm_name}\" transitioned to the {state} state at {timestamp} UTC\n\
                 alarm_id: {alarm_id}\n\
                 Lifecycle state: {lifecycle_state}\n\
                 Link: {link}\n\n\
                 With dimensions:\n{dimensions}",
                alarm_name = notification.alarm_name,
                state = notification.state,
                alarm_id = notification.alarm_id,
                lifecycle_state = notification.lifecycle_state,
                link = notification.link,
            ),
        ),
        ([hostname], None) => (
            format!(
                "{} {} \"{}\" for Host: {}",
                notification.state, notification.severity, notification.alarm_name, hostname
            ),
            format!(
                "On host \"{hostname}\" {message}\n\n\
                 Alarm \"{alarm_name}\" transitioned to the {state} state at {timestamp} UTC\n\
                 alarm_id: {alarm_id}\n\
                 Lifecycle state: {lifecycle_state}\n\
                 Link: {link}\n\n\
                 With dimensions:\n{dimensions}",
                alarm_name = notification.alarm_name,
                state = notification.state,
                alarm_id = notification.alarm_id,
                lifecycle_state = notification.lifecycle_state,
                link = notification.link,
            ),
        ),
        _ => (
            format!(
                "{} {} \"{}\" ",
                notification.state, notification.severity, notification.alarm_name
            ),
            format!(
                "On multiple hosts {message}\n\n\
                 Alarm \"{alarm_name}\" transitioned to the {state} state at {timestamp} UTC\n\
                 Alarm_id: {alarm_id}\n\
                 Lifecycle state: {lifecycle_state}\n\
                 Link: {link}\n\n\
                 With dimensions\n{dimensions}",
                alarm_name = notification.alarm_name,
                state = notification.state,
                alarm_id = notification.alarm_id,
                lifecycle_state = notification.lifecycle_state,
                link = notification.link,
            ),
        ),
    }
}

fn asctime(unix_seconds: f64) -> String {
    DateTime::from_timestamp(unix_seconds as i64, 0)
        .map(|t| t.format("%a %b %e %H:%M:%S %Y").to_string())
        .unwrap_or_default()
}

fn format_dimensions(notification: &Notification) -> String {
    let sets: Vec<String> = notification
        .metrics()
        .iter()
        .map(|metric| {
            let pairs: Vec<String> = metric
                .dimensions
                .iter()
                .map(|(key, value)| format!("    {key}: {value}"))
                .collect();
            format!("  {{\n{}\n  }}", pairs.join(",\n"))
        })
        .collect();
    format!("[\n{} \n]", sets.join(",\n"))
}
