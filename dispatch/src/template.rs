//! Channel template handling shared by the dispatchers.
use crate::ConfigureError;
use alarm_relay_types::Notification;
use serde::Deserialize;
use std::path::PathBuf;

/// The optional `template` subsection of a channel configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct TemplateConfig {
    /// Inline template text; takes precedence over `template_file`.
    #[serde(default)]
    pub text: Option<String>,
    /// Template file, read once at configure time.
    #[serde(default)]
    pub template_file: Option<PathBuf>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Subject template; email only.
    #[serde(default)]
    pub subject: Option<String>,
}

/// A channel body template, checked at configure time.
pub(crate) struct ChannelTemplate {
    source: String,
    pub mime_type: Option<String>,
}

impl ChannelTemplate {
    pub fn load(config: &TemplateConfig) -> Result<Self, ConfigureError> {
        let source = match (&config.text, &config.template_file) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)?,
            (None, None) => String::new(),
        };
        compile_check(&source)?;
        Ok(Self {
            source,
            mime_type: config.mime_type.clone(),
        })
    }

    /// Renders the body for `notification`, with the description replaced by
    /// a channel-formatted variant.
    pub fn render(
        &self,
        notification: &Notification,
        description: &str,
    ) -> Result<String, minijinja::Error> {
        render_notification_text(&self.source, notification, Some(description))
    }
}

/// Checks that a template source compiles.
pub(crate) fn compile_check(source: &str) -> Result<(), minijinja::Error> {
    let env = minijinja::Environment::new();
    env.template_from_str(source).map(|_| ())
}

/// Renders `source` with the notification's fields as template variables,
/// plus `alarm_timestamp_utc` and, when given, an overriding description.
pub(crate) fn render_notification_text(
    source: &str,
    notification: &Notification,
    description: Option<&str>,
) -> Result<String, minijinja::Error> {
    let mut vars = serde_json::to_value(notification)
        .ok()
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default();
    vars.insert(
        "alarm_timestamp_utc".to_owned(),
        notification.alarm_timestamp_utc().into(),
    );
    if let Some(description) = description {
        vars.insert("alarm_description".to_owned(), description.into());
    }

    let env = minijinja::Environment::new();
    let template = env.template_from_str(source)?;
    template.render(&vars)
}
