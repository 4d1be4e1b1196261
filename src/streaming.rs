//! Streaming file writes: bytes go to a `.part` file as the engine
//! produces them and the target only appears via atomic rename on
//! completion. A cancelled or failed generation leaves the `.part` file
//! behind and never the target.
//!
//! [`FenceBuffer`] sits between the token stream and the writer: tokens
//! buffer until a complete fenced block is identified, then the block is
//! flushed as one unit.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::executor::file::part_path;

pub struct StreamingWriter {
    target: PathBuf,
    part: PathBuf,
    file: File,
    bytes: usize,
}

impl StreamingWriter {
    pub async fn open(target: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let part = part_path(target);
        let file = File::create(&part).await?;
        Ok(Self {
            target: target.to_path_buf(),
            part,
            file,
            bytes: 0,
        })
    }

    pub async fn write(&mut self, chunk: &str) -> anyhow::Result<()> {
        self.file.write_all(chunk.as_bytes()).await?;
        self.bytes += chunk.len();
        Ok(())
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Flush and atomically rename `.part` into place.
    pub async fn finish(mut self) -> anyhow::Result<(PathBuf, usize)> {
        self.file.flush().await?;
        drop(self.file);
        tokio::fs::rename(&self.part, &self.target).await?;
        Ok((self.target, self.bytes))
    }

    /// Abandon the write. The `.part` file stays on disk for inspection;
    /// the target is never created.
    pub async fn abort(mut self) {
        let _ = self.file.flush().await;
    }
}

/// A block completed (or cut off) in the token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBlock {
    pub language: String,
    pub content: String,
    /// False when the stream ended before the closing fence.
    pub terminated: bool,
}

/// Buffers streamed tokens and yields fenced blocks as they complete.
#[derive(Default)]
pub struct FenceBuffer {
    pending: String,
    in_block: bool,
    language: String,
    content: String,
}

impl FenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one token; returns a block when its closing fence arrives.
    pub fn push(&mut self, token: &str) -> Option<CompletedBlock> {
        if self.in_block {
            self.content.push_str(token);
            if let Some(end) = self.content.find("```") {
                let block = CompletedBlock {
                    language: std::mem::take(&mut self.language),
                    content: self.content[..end].trim_end().to_string(),
                    terminated: true,
                };
                let remainder = self.content[end + 3..].to_string();
                self.content.clear();
                self.in_block = false;
                self.pending = remainder;
                return Some(block);
            }
            return None;
        }

        self.pending.push_str(token);
        if let Some(start) = self.pending.find("```") {
            let after = &self.pending[start + 3..];
            // The language line must be complete before content starts.
            if let Some(newline) = after.find('\n') {
                self.language = after[..newline].trim().to_string();
                self.content = after[newline + 1..].to_string();
                self.in_block = true;
                self.pending.clear();
                // The opening chunk may already carry the closing fence.
                return self.push("");
            }
        }
        None
    }

    /// Drain the buffer at end of stream. An open block is returned
    /// unterminated; leftover prose is discarded.
    pub fn finish(mut self) -> Option<CompletedBlock> {
        if self.in_block && !self.content.trim().is_empty() {
            return Some(CompletedBlock {
                language: std::mem::take(&mut self.language),
                content: self.content.trim_end().to_string(),
                terminated: false,
            });
        }
        None
    }
}
