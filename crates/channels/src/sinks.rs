//! Answer sinks — where finished turns go.
//!
//! - [`LogSink`]: structured log line per answer
//! - [`HttpReplySink`]: POSTs the answer as JSON to a reply endpoint
//! - [`ChannelSink`]: in-process mpsc, for embedding and tests

use async_trait::async_trait;
use cortex_config::{SinkConfig, SinkKind};
use cortex_core::error::ChannelError;
use cortex_core::stimulus::{AnswerSink, FinalAnswer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Build the sink selected in config.
pub fn from_config(config: &SinkConfig) -> Result<Arc<dyn AnswerSink>, ChannelError> {
    match config.kind {
        SinkKind::Log => Ok(Arc::new(LogSink)),
        SinkKind::Http => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| ChannelError::NotConfigured("sink.url is required for the http sink".into()))?;
            Ok(Arc::new(HttpReplySink::new(url)))
        }
    }
}

pub struct LogSink;

#[async_trait]
impl AnswerSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, answer: FinalAnswer) -> Result<(), ChannelError> {
        if answer.is_failure() {
            warn!(
                session = %answer.session_id,
                stimulus = %answer.stimulus_id,
                text = %answer.text(),
                "Turn failed"
            );
        } else {
            info!(
                session = %answer.session_id,
                stimulus = %answer.stimulus_id,
                text = %answer.text(),
                "Answer"
            );
        }
        Ok(())
    }
}

/// Posts `{"session_id", "stimulus_id", "status", "text"}` to a URL.
///
/// One attempt per answer; a non-2xx status is a delivery failure.
pub struct HttpReplySink {
    url: String,
    client: reqwest::Client,
}

impl HttpReplySink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl AnswerSink for HttpReplySink {
    fn name(&self) -> &str {
        "http"
    }

    async fn deliver(&self, answer: FinalAnswer) -> Result<(), ChannelError> {
        let failed = |reason: String| ChannelError::DeliveryFailed {
            sink: self.url.clone(),
            reason,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&answer)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("HTTP {status}: {body}")));
        }
        debug!(url = %self.url, session = %answer.session_id, "Answer delivered");
        Ok(())
    }
}

/// Forwards answers into an mpsc channel.
pub struct ChannelSink {
    tx: mpsc::Sender<FinalAnswer>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FinalAnswer>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AnswerSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn deliver(&self, answer: FinalAnswer) -> Result<(), ChannelError> {
        self.tx
            .send(answer)
            .await
            .map_err(|_| ChannelError::ConnectionLost("answer receiver closed".into()))
    }
}
