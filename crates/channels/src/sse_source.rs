//! Stimuli from a bridge's server-sent-events stream.
//!
//! The Telegram bridge exposes `GET /events`; every `data:` line carries a
//! JSON object:
//!
//! ```json
//! {"query": "compute 2+3", "chat_id": 42, "update_id": 1001, "sender": "ada"}
//! ```
//!
//! `query` is required. The session is `session_id`, else `telegram:<chat_id>`,
//! else the configured default. The stimulus id is `update_id` when present
//! (so redeliveries deduplicate), else a fresh UUID.
//!
//! The connection is retried forever with capped exponential backoff; the
//! task stops once the receiver is dropped.

use async_trait::async_trait;
use cortex_config::StimulusConfig;
use cortex_core::error::ChannelError;
use cortex_core::stimulus::{Stimulus, StimulusSource};
use cortex_tools::sse::SseParser;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct SseStimulusSource {
    url: String,
    default_session: String,
    initial_backoff: Duration,
    max_backoff: Duration,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct BridgeEvent {
    query: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    chat_id: Option<Value>,
    #[serde(default)]
    update_id: Option<Value>,
    #[serde(default)]
    sender: Option<String>,
}

fn id_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn one event payload into a stimulus. `Ok(None)` for a blank query.
pub fn parse_event(data: &str, default_session: &str) -> Result<Option<Stimulus>, ChannelError> {
    let event: BridgeEvent =
        serde_json::from_str(data).map_err(|e| ChannelError::InvalidPayload(e.to_string()))?;

    let text = event.query.trim();
    if text.is_empty() {
        return Ok(None);
    }

    let session_id = event
        .session_id
        .or_else(|| event.chat_id.as_ref().map(|id| format!("telegram:{}", id_text(id))))
        .unwrap_or_else(|| default_session.to_string());

    let mut stimulus = match &event.update_id {
        Some(id) => Stimulus::with_id(id_text(id), session_id, text),
        None => Stimulus::new(session_id, text),
    };
    stimulus.sender = event.sender;
    Ok(Some(stimulus))
}

impl SseStimulusSource {
    pub fn new(url: impl Into<String>, default_session: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            default_session: default_session.into(),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: Duration::from_secs(30),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &StimulusConfig) -> Result<Self, ChannelError> {
        let url = config.url.as_deref().ok_or_else(|| {
            ChannelError::NotConfigured("stimulus.url (or CORTEX_STIMULUS_URL) is not set".into())
        })?;
        Ok(Self::new(url, &config.default_session)
            .with_backoff(INITIAL_BACKOFF, Duration::from_secs(config.reconnect_max_secs.max(1))))
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn pump(self, tx: mpsc::Sender<Stimulus>) {
        let mut backoff = self.initial_backoff;
        loop {
            match self.stream_once(&tx, &mut backoff).await {
                Ok(false) => {
                    debug!("Stimulus receiver dropped, stopping stream");
                    return;
                }
                Ok(true) => warn!(url = %self.url, "Stimulus stream ended, reconnecting"),
                Err(e) => warn!(url = %self.url, error = %e, retry_in = ?backoff, "Stimulus stream unavailable"),
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = tx.closed() => return,
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Read one connection to its end. `Ok(false)` once the receiver is gone.
    async fn stream_once(
        &self,
        tx: &mpsc::Sender<Stimulus>,
        backoff: &mut Duration,
    ) -> Result<bool, ChannelError> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionLost(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChannelError::ConnectionLost(format!(
                "HTTP {}",
                response.status()
            )));
        }

        info!(url = %self.url, "Connected to stimulus stream");
        *backoff = self.initial_backoff;

        let mut body = response.bytes_stream();
        let mut parser = SseParser::new();
        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = tx.closed() => return Ok(false),
            };
            let Some(chunk) = chunk else {
                return Ok(true);
            };
            let chunk = chunk.map_err(|e| ChannelError::ConnectionLost(e.to_string()))?;

            for event in parser.feed(&chunk) {
                match parse_event(&event.data, &self.default_session) {
                    Ok(Some(stimulus)) => {
                        debug!(
                            session = %stimulus.session_id,
                            stimulus = %stimulus.stimulus_id,
                            "Stimulus received"
                        );
                        if tx.send(stimulus).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Ok(None) => debug!("Skipping event with empty query"),
                    Err(e) => warn!(error = %e, data = %event.data, "Skipping invalid stimulus event"),
                }
            }
        }
    }
}

#[async_trait]
impl StimulusSource for SseStimulusSource {
    fn name(&self) -> &str {
        "telegram_sse"
    }

    async fn start(&self) -> Result<mpsc::Receiver<Stimulus>, ChannelError> {
        info!(url = %self.url, "SSE stimulus source starting");
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(self.clone().pump(tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::response::sse::{Event, Sse};
    use axum::routing::get;
    use futures::stream::{self, Stream};
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    async fn bridge(connections: Arc<AtomicUsize>) -> String {
        async fn events(
            State(connections): State<Arc<AtomicUsize>>,
        ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
            connections.fetch_add(1, Ordering::SeqCst);
            let payloads = vec![
                r#"{"query": "compute 2+3", "chat_id": 42, "update_id": 1001, "sender": "ada"}"#,
                "not json",
                r#"{"query": "   "}"#,
                r#"{"query": "hello", "session_id": "s-9"}"#,
            ];
            Sse::new(stream::iter(
                payloads
                    .into_iter()
                    .map(|data| Ok(Event::default().data(data))),
            ))
        }

        let app = Router::new()
            .route("/events", get(events))
            .with_state(connections);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/events")
    }

    #[test]
    fn payload_fields_map_onto_stimulus() {
        let stimulus = parse_event(r#"{"query": " hi ", "chat_id": 7, "update_id": 55}"#, "default")
            .unwrap()
            .unwrap();
        assert_eq!(stimulus.text, "hi");
        assert_eq!(stimulus.session_id, "telegram:7");
        assert_eq!(stimulus.stimulus_id, "55");

        let stimulus = parse_event(r#"{"query": "hi"}"#, "default").unwrap().unwrap();
        assert_eq!(stimulus.session_id, "default");
        assert_eq!(stimulus.stimulus_id.len(), 36);

        assert!(parse_event(r#"{"query": ""}"#, "d").unwrap().is_none());
        assert!(matches!(parse_event("{}", "d"), Err(ChannelError::InvalidPayload(_))));
    }

    #[test]
    fn missing_url_is_not_configured() {
        let config = StimulusConfig {
            url: None,
            ..Default::default()
        };
        assert!(matches!(
            SseStimulusSource::from_config(&config),
            Err(ChannelError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn streams_valid_events_and_skips_the_rest() {
        let url = bridge(Arc::new(AtomicUsize::new(0))).await;
        let source = SseStimulusSource::new(url, "default");
        let mut rx = source.start().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.text, "compute 2+3");
        assert_eq!(first.session_id, "telegram:42");
        assert_eq!(first.stimulus_id, "1001");
        assert_eq!(first.sender.as_deref(), Some("ada"));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.text, "hello");
        assert_eq!(second.session_id, "s-9");
    }

    #[tokio::test]
    async fn reconnects_after_the_stream_ends() {
        let connections = Arc::new(AtomicUsize::new(0));
        let url = bridge(connections.clone()).await;
        let source = SseStimulusSource::new(url, "default")
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50));
        let mut rx = source.start().await.unwrap();

        // the bridge replays the same update after reconnecting
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap().text);
        }
        assert_eq!(seen, vec!["compute 2+3", "hello", "compute 2+3", "hello"]);
        assert!(connections.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn unreachable_bridge_keeps_retrying_until_dropped() {
        let source = SseStimulusSource::new("http://127.0.0.1:9/events", "default")
            .with_backoff(Duration::from_millis(5), Duration::from_millis(10));
        let mut rx = source.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rx.try_recv().unwrap_err(), mpsc::error::TryRecvError::Empty);
        drop(rx);
    }
}
