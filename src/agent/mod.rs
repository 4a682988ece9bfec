//! Per-agent building blocks used by the controller: decoding the CLI's
//! output stream, assembling the launch briefing and prompt, and writing
//! session transcripts.

pub mod context;
pub mod prompt;
pub mod stream_parser;
pub mod transcript;
