//! Stimuli typed at the terminal.
//!
//! Each non-empty line of stdin becomes one stimulus for a fixed session.
//! `exit`, `quit`, `/exit`, `/quit` or EOF (Ctrl+D) end the stream.
//! Used by `cortex run --stdin`.

use async_trait::async_trait;
use cortex_core::error::ChannelError;
use cortex_core::stimulus::{Stimulus, StimulusSource};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct StdinStimulusSource {
    session_id: String,
}

impl StdinStimulusSource {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

fn is_exit(line: &str) -> bool {
    matches!(line, "exit" | "quit" | "/exit" | "/quit")
}

async fn pump_lines<R>(reader: R, session_id: String, tx: mpsc::Sender<Stimulus>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if is_exit(line) {
                    debug!("Exit requested on stdin");
                    break;
                }
                let stimulus = Stimulus::new(&session_id, line).from_sender("local_user");
                if tx.send(stimulus).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
}

#[async_trait]
impl StimulusSource for StdinStimulusSource {
    fn name(&self) -> &str {
        "stdin"
    }

    async fn start(&self) -> Result<mpsc::Receiver<Stimulus>, ChannelError> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(pump_lines(
            BufReader::new(io::stdin()),
            self.session_id.clone(),
            tx,
        ));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_become_stimuli_until_exit() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"compute 2+3\n\n   \n/tools\nquit\nnever sent\n";
        pump_lines(input, "local".into(), tx).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.text, "compute 2+3");
        assert_eq!(first.session_id, "local");
        assert_eq!(first.sender.as_deref(), Some("local_user"));
        assert_eq!(rx.recv().await.unwrap().text, "/tools");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn eof_ends_the_stream() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"only line";
        pump_lines(input, "local".into(), tx).await;
        assert_eq!(rx.recv().await.unwrap().text, "only line");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn exit_words() {
        assert!(is_exit("quit"));
        assert!(is_exit("/exit"));
        assert!(!is_exit("quite"));
    }
}
