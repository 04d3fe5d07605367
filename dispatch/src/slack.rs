//! Chat-room dispatcher.
//!
//! The notification address is the full chat API URL, carrying the channel
//! and token as query parameters, e.g.
//! `https://chat.example.org/api/chat.postMessage?token=tk&channel=#ops`.
use crate::{
    ConfigureError, DispatchError, Dispatcher, default_timeout,
    template::{ChannelTemplate, TemplateConfig},
};
use alarm_relay_types::Notification;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::{path::PathBuf, sync::LazyLock, time::Duration};
use tracing::debug;
use url::Url;

static MARKDOWN_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(.*?)\]\((.*?)\)").expect("link pattern compiles"));

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct SlackConfig {
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Disables TLS verification. Ignored when `ca_certs` is set.
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub ca_certs: Option<PathBuf>,
    /// HTTPS proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub template: Option<TemplateConfig>,
}

#[derive(Default)]
pub struct SlackDispatcher {
    template: Option<ChannelTemplate>,
    client: Option<reqwest::Client>,
}

impl SlackDispatcher {
    fn build_message(&self, notification: &Notification) -> Result<serde_json::Value, DispatchError> {
        // The channel renders links as <url|label>.
        let description = MARKDOWN_LINK
            .replace_all(&notification.alarm_description, "<$2|$1>")
            .into_owned();

        match &self.template {
            Some(template) => {
                let text = template.render(notification, &description)?;
                match template.mime_type.as_deref() {
                    Some("application/json") => Ok(serde_json::from_str(&text)?),
                    _ => Ok(json!({ "text": text })),
                }
            }
            None => Ok(json!({
                "text": format!(
                    "{} - {}: {}",
                    notification.state, description, notification.message
                )
            })),
        }
    }
}

#[async_trait]
impl Dispatcher for SlackDispatcher {
    fn kind(&self) -> &'static str {
        "slack"
    }

    async fn configure(&mut self, section: &serde_yaml::Value) -> Result<(), ConfigureError> {
        let config: SlackConfig = serde_yaml::from_value(section.clone())?;
        if let Some(template_config) = &config.template {
            self.template = Some(ChannelTemplate::load(template_config)?);
        }

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(config.timeout));
        // ca_certs means "verify against this bundle" and wins over insecure.
        if let Some(ca_certs) = &config.ca_certs {
            let pem = std::fs::read(ca_certs)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        } else if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy.as_str())?);
        }
        self.client = Some(builder.build()?);
        Ok(())
    }

    async fn send_notification(
        &mut self,
        notification: &Notification,
    ) -> Result<(), DispatchError> {
        // A chat room address starts with the reserved "#".
        let address = notification.address.replace('#', "%23");
        let url = Url::parse(&address)?;

        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let mut base = url.clone();
        base.set_query(None);

        let mut body = self.build_message(notification)?;
        let channel = query.iter().find(|(key, _)| key.as_str() == "channel");
        if let (Some((_, channel)), serde_json::Value::Object(map)) = (channel, &mut body) {
            map.insert("channel".to_owned(), channel.clone().into());
        }
        let query: Vec<&(String, String)> = query
            .iter()
            .filter(|(key, _)| key.as_str() != "channel")
            .collect();

        let client = self.client.get_or_insert_with(reqwest::Client::new);
        debug!("Posting to {base} with query {query:?}");
        let response = client.post(base).query(&query).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status(status));
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"));
        if is_json {
            let reply: serde_json::Value = response.json().await?;
            if is_truthy(reply.get("ok")) {
                Ok(())
            } else {
                let error = reply
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("no error given");
                Err(DispatchError::Rejected(error.to_owned()))
            }
        } else {
            Ok(())
        }
    }
}

fn is_truthy(value: Option<&serde_json::Value>) -> bool {
    match value {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(serde_json::Value::Number(n)) => n.as_f64() != Some(0.0),
        _ => false,
    }
}
