use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{encode_json_lines, Sink};
use crate::entry::Entry;
use crate::error::SinkError;

struct FileState {
    file: Option<File>,
    written: u64,
}

/// Appends JSON lines to a file
///
/// With `max_bytes` set, the file is renamed to `<path>.1` (replacing any
/// previous rotation) once the next batch would push it past the limit.
pub struct FileSink {
    path: PathBuf,
    max_bytes: Option<u64>,
    state: Mutex<FileState>,
}

impl FileSink {
    pub fn new(path: impl AsRef<Path>, max_bytes: Option<u64>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes,
            state: Mutex::new(FileState {
                file: None,
                written: 0,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path the current file is moved to on rotation
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }

    async fn open(&self) -> Result<(File, u64), SinkError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    async fn rotate(&self, state: &mut FileState) -> Result<(), SinkError> {
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
        }

        tokio::fs::rename(&self.path, self.rotated_path()).await?;
        state.written = 0;

        tracing::debug!(
            target: "telemetry_pipeline::sinks",
            path = %self.path.display(),
            "Rotated log file"
        );
        Ok(())
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn emit(&self, batch: &[Entry]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let bytes = encode_json_lines(batch)?;
        let mut state = self.state.lock().await;

        if state.file.is_none() {
            let (file, len) = self.open().await?;
            state.file = Some(file);
            state.written = len;
        }

        if let Some(max) = self.max_bytes {
            if state.written > 0 && state.written + bytes.len() as u64 > max {
                self.rotate(&mut state).await?;
                let (file, len) = self.open().await?;
                state.file = Some(file);
                state.written = len;
            }
        }

        let Some(file) = state.file.as_mut() else {
            return Err(SinkError::Rejected("file not open".to_string()));
        };
        file.write_all(&bytes).await?;
        file.flush().await?;
        state.written += bytes.len() as u64;

        Ok(())
    }
}
