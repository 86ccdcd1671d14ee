//! Ingestion layer for capture sources
//!
//! Turns raw capture bytes into frames, incrementally.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────┐     ┌───────────────┐     ┌────────────┐
//! │ file / HTTP     │ ──► │ SourceReader │ ──► │ read_lines    │ ──► │ parse_line │
//! │ (byte offset)   │     │ (Range)      │     │ (cap, cancel) │     │ assembler  │
//! └─────────────────┘     └──────────────┘     └───────────────┘     └────────────┘
//!                                                                          │
//!                              ┌───────────────────────────────────────────┘
//!                              ▼
//!                    ┌──────────────────┐     ┌────────────┐
//!                    │ LiveStream       │ ──► │ FrameCache │
//!                    │ (poll, idle, end)│     └────────────┘
//!                    └──────────────────┘
//!                              │ LiveEvent
//!                              ▼
//!                            Store
//! ```

mod lines;
mod parser;
mod poller;
mod source;

pub use lines::{finish_remainder, read_lines, ByteStream, ReadSummary};
pub use parser::{parse_line, ComponentTree, FrameAssembler, ParsedLine};
pub use poller::{
    EndReason, FollowMode, LiveEvent, LiveStream, LiveStreamInfo, LiveStreamManager,
    LiveStreamState, PollOutcome, PollSchedule,
};
pub use source::{content_range_total, scan_source, ScanSummary, SourceRead, SourceReader};
