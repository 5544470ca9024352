//! # Worker output capture and crash artifacts.
//!
//! [`OutputBuffer`] splits captured worker bytes into lines and keeps the last
//! `crashlog_limit` of them. When a slave dies abnormally the buffer is handed
//! to a [`CrashlogStore`]; persisting is best effort and failures are only logged.

use std::collections::VecDeque;

use async_trait::async_trait;

/// Collection crash artifacts are written to.
pub const CRASHLOG_COLLECTION: &str = "crashlogs";

/// External blob store for crash artifacts.
#[async_trait]
pub trait CrashlogStore: Send + Sync + 'static {
    /// Stores `lines` under `key`, tagged with `indexes`.
    async fn put(
        &self,
        collection: &str,
        key: &str,
        lines: Vec<String>,
        indexes: Vec<String>,
    ) -> anyhow::Result<()>;
}

/// Store that drops every artifact.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl CrashlogStore for NullStore {
    async fn put(&self, _: &str, key: &str, lines: Vec<String>, _: Vec<String>) -> anyhow::Result<()> {
        tracing::debug!(key, lines = lines.len(), "crashlog discarded: no store configured");
        Ok(())
    }
}

/// Line splitter feeding a bounded ring buffer.
#[derive(Debug)]
pub struct OutputBuffer {
    limit: usize,
    lines: VecDeque<String>,
    partial: Vec<u8>,
}

impl OutputBuffer {
    /// Keeps at most `limit` complete lines.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            lines: VecDeque::with_capacity(limit.min(1024)),
            partial: Vec::new(),
        }
    }

    /// Feeds raw bytes; returns the lines completed by this chunk.
    pub fn consume(&mut self, data: &[u8]) -> Vec<String> {
        let mut completed = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.partial);
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches('\r')
                    .to_string();
                self.remember(line.clone());
                completed.push(line);
            } else {
                self.partial.push(byte);
            }
        }
        completed
    }

    /// Buffered lines, oldest first, including a trailing unterminated line.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            lines.push(String::from_utf8_lossy(&self.partial).into_owned());
        }
        lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    fn remember(&mut self, line: String) {
        if self.limit == 0 {
            return;
        }
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}
