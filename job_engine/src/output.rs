//! Captured container output.

use futures_util::StreamExt;

use container_engine_interface::{OutputChunk, OutputStream};
use harness_shared_types::{EngineError, JobError};

/// Stdout and stderr buffers, optionally capped in total size.
#[derive(Debug, Default)]
pub struct OutputCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn push(&mut self, chunk: OutputChunk) {
        let room = match self.limit {
            Some(limit) => limit.saturating_sub(self.stdout.len() + self.stderr.len()),
            None => usize::MAX,
        };

        let (buf, data) = match chunk {
            OutputChunk::Stdout(data) => (&mut self.stdout, data),
            OutputChunk::Stderr(data) => (&mut self.stderr, data),
        };
        let take = room.min(data.len());
        buf.extend_from_slice(&data[..take]);
        if take < data.len() {
            self.truncated = true;
        }
    }

    /// Read `stream` to its end. Stops early only on a stream error.
    pub async fn drain(&mut self, mut stream: OutputStream) -> Result<(), EngineError> {
        while let Some(chunk) = stream.next().await {
            self.push(chunk?);
        }
        Ok(())
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// The truncation error to attach to a result, if output was capped.
    pub fn truncation_error(&self) -> Option<JobError> {
        match (self.truncated, self.limit) {
            (true, Some(limit)) => Some(JobError::OutputTruncated { limit }),
            _ => None,
        }
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout, self.stderr)
    }
}
