//! Stimulus sources and answer sinks for Cortex.
//!
//! Sources turn external events into [`cortex_core::Stimulus`] values;
//! sinks take each turn's [`cortex_core::FinalAnswer`] back out.
//!
//! Available sources:
//! - **SSE** — a bridge's `/events` stream (the Telegram bridge)
//! - **Stdin** — one stimulus per typed line
//!
//! Available sinks:
//! - **Log** — structured log line per answer
//! - **HTTP** — POST to a reply endpoint
//! - **Channel** — in-process mpsc

pub mod sinks;
pub mod sse_source;
pub mod stdin;

pub use sinks::{ChannelSink, HttpReplySink, LogSink};
pub use sse_source::SseStimulusSource;
pub use stdin::StdinStimulusSource;
