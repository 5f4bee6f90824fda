//! Error taxonomy for the post-processor.
//!
//! Fatal kinds abort the stream and propagate to the file facade; warnings
//! never abort and are routed through the warning sink on the processing
//! state. `InspectionComplete` is a control signal, not a failure: the facade
//! catches it to end a quick-inspection pass early.

use std::path::PathBuf;

use thiserror::Error;

use crate::meta::header::GcodeIdentification;
use crate::pipeline::bookmark::BookmarkKey;

/// Fatal errors raised by the streaming pipeline and the file facade.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// No `; generated by ...` line was found in the file header.
    #[error("could not identify the slicer that generated this file")]
    IdentificationNotFound,

    /// The slicer was identified but its version is not on the allow-list.
    #[error("unsupported slicer: {generator} {version}")]
    SlicerNotSupported { generator: String, version: String },

    /// The header already carries a `; processed by` line. The facade
    /// translates this into a printability verdict instead of a failure.
    #[error("file was already processed by RatOS.PostProcessor")]
    AlreadyProcessed(Box<GcodeIdentification>),

    /// Malformed or unsupported G-code content, with the offending line.
    #[error("G-code error at line {line_number}: {message}: {line:?}")]
    Gcode {
        message: String,
        line_number: u64,
        line: String,
    },

    /// Control signal: quick inspection has latched every field it needs.
    #[error("inspection complete")]
    InspectionComplete,

    /// The cancellation token tripped.
    #[error("post-processing was aborted")]
    Aborted,

    /// Output path exists and overwriting was not requested.
    #[error("output file {} already exists", .0.display())]
    OutputExists(PathBuf),

    /// A retro-patch replacement is longer than the reserved byte extent.
    #[error("replacement does not fit in reserved slot: need {needed} bytes, reserved {reserved}")]
    ReplacementTooLong { needed: usize, reserved: usize },

    /// A bookmark key was assigned twice. Programmer error.
    #[error("duplicate bookmark key {0:?}")]
    DuplicateBookmark(BookmarkKey),

    /// A recorded handle points at a bookmark the encoder never saw.
    /// Programmer error, surfaced at finalisation.
    #[error("no bookmark recorded for key {0:?}")]
    BookmarkMissing(BookmarkKey),

    /// Dispatcher or window invariant violation. Programmer error.
    #[error("internal error: {0}")]
    Internal(String),

    /// A version string in the header failed semver parsing.
    #[error("invalid version in file header: {0}")]
    Version(#[from] semver::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Build a G-code error for a line seen in the window.
    pub fn gcode(message: impl Into<String>, line_number: u64, line: impl Into<String>) -> Self {
        Self::Gcode {
            message: message.into(),
            line_number,
            line: line.into(),
        }
    }
}

/// Non-fatal findings reported through the warning sink.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Warning {
    /// A heuristic scan ended without its expected sentinel.
    #[error("line {line_number}: {message}")]
    HeuristicSmell { line_number: u64, message: String },

    /// The analysis trailer failed its length or base64 checks.
    #[error("invalid analysis trailer: {0}")]
    InvalidMetadata(String),

    /// Version outside the allow-list, accepted because the caller opted in.
    #[error("proceeding with unsupported slicer version: {generator} {version}")]
    UnsupportedSlicerVersion { generator: String, version: String },
}

pub type Result<T, E = ProcessError> = std::result::Result<T, E>;
