//! JSONL session transcripts for replay.
//!
//! Every session gets `{data_dir}/transcripts/{session_id}.jsonl`. Each line
//! is a self-describing entry tagged with `event_type`.
//!
//! Uses synchronous `std::fs`: writes are small, buffered, and flushed after
//! each entry.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use super::stream_parser::StreamEvent;

/// Returns the current UTC time as an ISO 8601 string with milliseconds.
fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// One line of a transcript.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TranscriptEntry {
    /// The prompt a fresh process was launched with.
    Prompt { timestamp: String, prompt: String },

    /// A parsed stream event.
    Event {
        timestamp: String,
        event: StreamEvent,
    },

    /// A message written to a resumed process.
    Injected {
        timestamp: String,
        content: String,
        injected_by: String,
    },

    Exit {
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

/// Append-only transcript writer for one session.
pub struct TranscriptWriter {
    writer: BufWriter<fs::File>,
    path: PathBuf,
}

impl TranscriptWriter {
    pub fn transcripts_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("transcripts")
    }

    /// Open (or append to) the transcript for `session_id`.
    pub fn open(data_dir: &Path, session_id: &str) -> std::io::Result<Self> {
        let dir = Self::transcripts_dir(data_dir);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{session_id}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize an entry as a single JSON line and flush.
    pub fn write_entry(&mut self, entry: &TranscriptEntry) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    /// Like [`write_entry`](Self::write_entry), but a failure is only logged.
    /// A broken transcript never takes the agent down with it.
    pub fn record(&mut self, entry: &TranscriptEntry) {
        if let Err(e) = self.write_entry(entry) {
            tracing::warn!(path = %self.path.display(), error = %e, "transcript write failed");
        }
    }

    pub fn prompt(&mut self, prompt: &str) {
        self.record(&TranscriptEntry::Prompt {
            timestamp: now_iso(),
            prompt: prompt.to_string(),
        });
    }

    pub fn event(&mut self, event: &StreamEvent) {
        self.record(&TranscriptEntry::Event {
            timestamp: now_iso(),
            event: event.clone(),
        });
    }

    pub fn injected(&mut self, content: &str, injected_by: &str) {
        self.record(&TranscriptEntry::Injected {
            timestamp: now_iso(),
            content: content.to_string(),
            injected_by: injected_by.to_string(),
        });
    }

    pub fn exit(&mut self, code: Option<i32>, signal: Option<&str>) {
        self.record(&TranscriptEntry::Exit {
            timestamp: now_iso(),
            code,
            signal: signal.map(str::to_string),
        });
    }
}
