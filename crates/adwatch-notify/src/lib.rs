//! Notification sinks. Delivery failures are the caller's to log and swallow;
//! nothing here aborts a reconciliation run.

use adwatch_core::Record;
use adwatch_store::{FetchError, HttpClient};
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "adwatch-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Delivery(#[from] FetchError),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Alert for one newly seen record.
    async fn notify_record(&self, record: &Record) -> Result<(), NotifyError>;

    /// One freeform message (the birthday digest case).
    async fn notify_text(&self, text: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_record(&self, record: &Record) -> Result<(), NotifyError> {
        debug!(identity = %record.identity, "noop notifier: dropping record alert");
        Ok(())
    }

    async fn notify_text(&self, _text: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Plain-text body for a new-record alert. Formatting richness is out of
/// scope; title, price and link cover what the alerts need.
pub fn render_record_message(record: &Record) -> String {
    let title = record
        .immutable
        .get("title")
        .map(String::as_str)
        .unwrap_or(record.identity.as_str());
    let mut lines = vec![format!("Tin mới: {title}")];
    if let Some(price) = record.immutable.get("price") {
        lines.push(format!("Giá: {price}"));
    }
    if let Some(location) = record.immutable.get("location") {
        lines.push(format!("Khu vực: {location}"));
    }
    lines.push(record.identity.clone());
    lines.join("\n")
}

pub struct TelegramNotifier {
    http: HttpClient,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(http: HttpClient, bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            http,
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    fn send_message_url(&self) -> String {
        format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token)
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let url = self.send_message_url();
        let form = [("chat_id", self.chat_id.as_str()), ("text", text)];
        self.http.post_form(Uuid::new_v4(), &url, &form).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_record(&self, record: &Record) -> Result<(), NotifyError> {
        self.send(&render_record_message(record)).await
    }

    async fn notify_text(&self, text: &str) -> Result<(), NotifyError> {
        self.send(text).await
    }
}
