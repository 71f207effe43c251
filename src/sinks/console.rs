use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{encode_json_lines, Sink};
use crate::entry::Entry;
use crate::error::SinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// Writes JSON lines to stdout or stderr
#[derive(Debug)]
pub struct ConsoleSink {
    stream: ConsoleStream,
}

impl ConsoleSink {
    pub fn new(stream: ConsoleStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn emit(&self, batch: &[Entry]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let bytes = encode_json_lines(batch)?;
        match self.stream {
            ConsoleStream::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(&bytes).await?;
                out.flush().await?;
            }
            ConsoleStream::Stderr => {
                let mut out = tokio::io::stderr();
                out.write_all(&bytes).await?;
                out.flush().await?;
            }
        }
        Ok(())
    }
}
