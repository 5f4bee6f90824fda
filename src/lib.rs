//! RatOS G-code post-processor
//!
//! A streaming post-processor for slicer output. It reads a G-code file
//! once, forward-only, and:
//! - Identifies the slicer that generated the file
//! - Collects per-print statistics (tool usage, first move, X extents)
//! - Rewrites per-layer tool-change blocks into atomic toolshifts for
//!   IDEX printers
//! - Stamps a "processed by" header line and a base64 analysis trailer
//!
//! Inputs reach hundreds of megabytes, so nothing buffers the whole file:
//! a sliding window gives the transform actions bounded context, and lines
//! that need information from later in the stream are padded and rewritten
//! in place once the stream has ended.

pub mod actions;
pub mod command;
pub mod error;
pub mod file;
pub mod flavor;
pub mod meta;
pub mod pipeline;
pub mod state;

// Re-exports for clean public API
pub use command::{parse_command, GcodeCommand};
pub use error::{ProcessError, Warning};
pub use file::{GcodeFile, InspectOptions, Printability, ProcessOptions, ProcessOutcome};
pub use flavor::{SlicerFlavor, SlicerFlavorSet};
pub use meta::{AnalysisResult, GcodeIdentification};
pub use pipeline::CancellationToken;
