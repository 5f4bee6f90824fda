//! File metadata: identification header and analysis trailer.
//!
//! The post-processor stamps two things into every file it touches: a
//! "processed by" line prepended to the header, and a base64 analysis
//! trailer appended after the last G-code line. This module owns both wire
//! formats.

pub mod analysis;
pub mod header;
pub mod trailer;

pub use analysis::{AnalysisResult, FullAnalysis, QuickAnalysis, ANALYSIS_SCHEMA_VERSION};
pub use header::{GcodeIdentification, ProcessedByInfo, CURRENT_FILE_FORMAT_VERSION};
pub use trailer::TrailerReadOutcome;
