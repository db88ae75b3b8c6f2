//! Rotation-aware file tailing
//!
//! [`LogTailer`] owns the [`MonitorState`] of one monitored file and turns
//! appended bytes into complete lines. Each poll compares the file at the
//! configured path against the remembered identity and offset:
//!
//! - a different identity means the file was replaced (rename rotation)
//! - a length below the offset means the file was truncated in place
//!
//! Either way the handle is reopened and reading restarts at offset 0. Bytes
//! left unread in the previous file instance are not recovered.

use crate::config::StartPosition;
use crate::error::{EngineError, Result};
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

/// Identity of one file instance, stable across appends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    primary: u64,
    secondary: u64,
}

impl FileIdentity {
    /// Device and inode number
    #[cfg(unix)]
    pub fn of(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            primary: meta.dev(),
            secondary: meta.ino(),
        }
    }

    /// Creation time, the closest portable equivalent of an inode
    #[cfg(not(unix))]
    pub fn of(meta: &Metadata) -> Self {
        let created = meta
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .unwrap_or_default();
        Self {
            primary: created.as_secs(),
            secondary: u64::from(created.subsec_nanos()),
        }
    }
}

/// Lifecycle phase of a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Initializing,
    Tailing,
    Rotated,
    BackoffError,
    Stopped,
}

impl MonitorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorPhase::Initializing => "initializing",
            MonitorPhase::Tailing => "tailing",
            MonitorPhase::Rotated => "rotated",
            MonitorPhase::BackoffError => "backoff_error",
            MonitorPhase::Stopped => "stopped",
        }
    }
}

/// Runtime state of one monitor, mutated only by its poll loop
#[derive(Debug)]
pub struct MonitorState {
    pub(crate) file: Option<File>,
    pub(crate) offset: u64,
    pub(crate) identity: Option<FileIdentity>,
    pub(crate) consecutive_errors: u32,
    pub(crate) phase: MonitorPhase,
    partial: Vec<u8>,
    /// Skipping the rest of an overlong line
    discarding: bool,
    first_poll: bool,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            file: None,
            offset: 0,
            identity: None,
            consecutive_errors: 0,
            phase: MonitorPhase::Initializing,
            partial: Vec::new(),
            discarding: false,
            first_poll: true,
        }
    }
}

impl MonitorState {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }

    fn reset_to_start(&mut self) {
        self.file = None;
        self.offset = 0;
        self.partial.clear();
        self.discarding = false;
    }
}

/// Result of one successful poll
#[derive(Debug, Default)]
pub struct PollBatch {
    /// Complete lines in file order, without the line terminator
    pub lines: Vec<String>,
    /// Offset reached in the previous file instance, when a rotation was seen
    pub rotated_from: Option<u64>,
    /// Lines discarded for exceeding the line length cap
    pub dropped_lines: usize,
}

/// Read limits for one tailer
#[derive(Debug, Clone, Copy)]
pub struct TailLimits {
    pub max_read_bytes: usize,
    pub max_line_bytes: usize,
}

impl Default for TailLimits {
    fn default() -> Self {
        Self {
            max_read_bytes: 4 * 1024 * 1024,
            max_line_bytes: 64 * 1024,
        }
    }
}

/// Tails one file from a remembered offset
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    start_at: StartPosition,
    limits: TailLimits,
    state: MonitorState,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, start_at: StartPosition, limits: TailLimits) -> Self {
        Self {
            path: path.into(),
            start_at,
            limits,
            state: MonitorState::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut MonitorState {
        &mut self.state
    }

    /// Read everything appended since the last poll, up to `max_read_bytes`
    pub async fn poll(&mut self) -> Result<PollBatch> {
        let first_poll = std::mem::take(&mut self.state.first_poll);

        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) => {
                self.state.file = None;
                return Err(self.io_error(e));
            }
        };
        let identity = FileIdentity::of(&meta);
        let len = meta.len();
        let mut batch = PollBatch::default();

        match self.state.identity {
            None => {
                // Content present at startup is skipped only when the file
                // already existed on the very first poll
                self.state.offset = if first_poll && self.start_at == StartPosition::End {
                    len
                } else {
                    0
                };
            }
            Some(previous) if previous != identity || len < self.state.offset => {
                batch.rotated_from = Some(self.state.offset);
                self.state.reset_to_start();
            }
            Some(_) => {}
        }
        self.state.identity = Some(identity);

        if self.state.file.is_none() {
            let file = File::open(&self.path)
                .await
                .map_err(|e| self.io_error(e))?;
            self.state.file = Some(file);
        }

        if len <= self.state.offset {
            return Ok(batch);
        }

        let to_read = (len - self.state.offset).min(self.limits.max_read_bytes as u64);
        let buf = match self.read_chunk(to_read).await {
            Ok(buf) => buf,
            Err(e) => {
                self.state.file = None;
                return Err(self.io_error(e));
            }
        };
        self.state.offset += buf.len() as u64;

        let (lines, dropped) = self.split_lines(&buf);
        batch.lines = lines;
        batch.dropped_lines = dropped;
        Ok(batch)
    }

    async fn read_chunk(&mut self, to_read: u64) -> std::io::Result<Vec<u8>> {
        let offset = self.state.offset;
        let Some(file) = self.state.file.as_mut() else {
            return Ok(Vec::new());
        };

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(to_read as usize);
        file.take(to_read).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Split appended bytes into complete lines, carrying the unterminated tail
    fn split_lines(&mut self, buf: &[u8]) -> (Vec<String>, usize) {
        let max_line = self.limits.max_line_bytes;
        let mut lines = Vec::new();
        let mut dropped = 0;
        let mut rest = buf;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let head = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.state.discarding {
                self.state.discarding = false;
                continue;
            }

            self.state.partial.extend_from_slice(head);
            let mut line = std::mem::take(&mut self.state.partial);
            if line.len() > max_line {
                dropped += 1;
                continue;
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if !self.state.discarding {
            self.state.partial.extend_from_slice(rest);
            if self.state.partial.len() > max_line {
                self.state.partial.clear();
                self.state.discarding = true;
                dropped += 1;
            }
        }

        if dropped > 0 {
            warn!(
                path = %self.path.display(),
                dropped = dropped,
                max_line_bytes = max_line,
                "Dropped lines longer than the line length cap"
            );
        }

        (lines, dropped)
    }

    fn io_error(&self, source: std::io::Error) -> EngineError {
        EngineError::MonitorIo {
            path: self.path.clone(),
            source,
        }
    }
}
