//! The base64 analysis trailer appended to processed files.
//!
//! ```text
//! ; ratos_meta begin 156
//! ; eyJ2ZXJzaW9uIjoxLCJraW5kIjoiZnVsbCIsIn...   (78 chars of payload per line)
//! ; ...
//! ; ratos_meta end 2
//! ```
//!
//! The payload is the JSON form of [`AnalysisResult`]. A malformed trailer is
//! never fatal: readers degrade to "no analysis available" with a warning.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Result, Warning};
use crate::meta::analysis::AnalysisResult;

const BEGIN_MARKER: &str = "; ratos_meta begin ";
const END_MARKER: &str = "; ratos_meta end ";

/// Payload characters per trailer line.
const LINE_WIDTH: usize = 78;

/// How many lines the first tail probe loads.
const TAIL_PROBE_LINES: usize = 100;

/// Result of looking for a trailer at the end of a file.
#[derive(Debug, Clone, PartialEq)]
pub enum TrailerReadOutcome {
    /// A well-formed trailer was found and decoded.
    Found(AnalysisResult),
    /// A trailer is present but fails its length or base64 checks.
    Invalid(Warning),
    /// No trailer markers in the file tail.
    Absent,
}

/// Serialise the trailer block, including the final newline.
pub fn format_trailer(analysis: &AnalysisResult) -> Result<String> {
    let payload = serde_json::to_string(analysis)
        .map_err(|e| crate::error::ProcessError::Internal(format!("analysis to JSON: {e}")))?;
    let encoded = BASE64.encode(payload.as_bytes());

    let mut block = format!("{}{}\n", BEGIN_MARKER, encoded.len());
    let mut line_count = 0usize;
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let take = rest.len().min(LINE_WIDTH);
        block.push_str("; ");
        block.push_str(&rest[..take]);
        block.push('\n');
        rest = &rest[take..];
        line_count += 1;
    }
    block.push_str(&format!("{}{}\n", END_MARKER, line_count));
    Ok(block)
}

/// Parse a trailer out of a slice of tail lines.
///
/// Returns `None` when the begin marker is not within `lines` (the caller
/// may retry with a deeper tail based on the end marker's line-count hint).
pub fn parse_trailer_block(lines: &[&str]) -> Option<TrailerReadOutcome> {
    let end_index = lines
        .iter()
        .rposition(|line| line.trim_end().starts_with(END_MARKER))?;
    let begin_index = lines[..end_index]
        .iter()
        .rposition(|line| line.trim_end().starts_with(BEGIN_MARKER));

    let begin_index = match begin_index {
        Some(index) => index,
        None => return None,
    };

    let declared_chars: usize = match lines[begin_index].trim_end()[BEGIN_MARKER.len()..].parse() {
        Ok(count) => count,
        Err(_) => {
            return Some(TrailerReadOutcome::Invalid(Warning::InvalidMetadata(
                "begin marker carries no character count".into(),
            )))
        }
    };

    let mut encoded = String::with_capacity(declared_chars);
    for line in &lines[begin_index + 1..end_index] {
        let line = line.trim_end();
        match line.strip_prefix("; ") {
            Some(chunk) => encoded.push_str(chunk),
            None => {
                return Some(TrailerReadOutcome::Invalid(Warning::InvalidMetadata(
                    format!("unexpected line inside trailer: {line:?}"),
                )))
            }
        }
    }

    if encoded.len() != declared_chars {
        return Some(TrailerReadOutcome::Invalid(Warning::InvalidMetadata(
            format!(
                "trailer length mismatch: expected {declared_chars} base64 chars, found {}",
                encoded.len()
            ),
        )));
    }

    let payload = match BASE64.decode(encoded.as_bytes()) {
        Ok(payload) => payload,
        Err(e) => {
            return Some(TrailerReadOutcome::Invalid(Warning::InvalidMetadata(
                format!("trailer base64 decode failed: {e}"),
            )))
        }
    };

    match serde_json::from_slice::<AnalysisResult>(&payload) {
        Ok(analysis) => Some(TrailerReadOutcome::Found(analysis)),
        Err(e) => Some(TrailerReadOutcome::Invalid(Warning::InvalidMetadata(
            format!("trailer JSON parse failed: {e}"),
        ))),
    }
}

/// Find the end-marker line-count hint in a slice of tail lines, if any.
fn end_marker_hint(lines: &[&str]) -> Option<usize> {
    let end_line = lines
        .iter()
        .rev()
        .find(|line| line.trim_end().starts_with(END_MARKER))?;
    end_line.trim_end()[END_MARKER.len()..].parse().ok()
}

/// Load the last `max_bytes` of a file as lines.
pub async fn read_tail_lines(path: &Path, max_bytes: u64) -> Result<Vec<String>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;
    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<String> = text.lines().map(|line| line.to_string()).collect();
    // A mid-line seek leaves a partial first line; it can never be a marker
    // we care about but would corrupt a payload concatenation.
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    Ok(lines)
}

/// Look for the analysis trailer at the end of `path`.
///
/// First probes the last ~100 lines; when only the end marker is inside the
/// probe, re-reads a deeper tail sized from the end marker's line count.
pub async fn read_trailer(path: &Path) -> Result<TrailerReadOutcome> {
    let probe_bytes = (TAIL_PROBE_LINES * (LINE_WIDTH + 4)) as u64;
    let lines = read_tail_lines(path, probe_bytes).await?;
    let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();

    if let Some(outcome) = parse_trailer_block(&refs) {
        return Ok(outcome);
    }

    let has_end = refs
        .iter()
        .any(|line| line.trim_end().starts_with(END_MARKER));
    if !has_end {
        return Ok(TrailerReadOutcome::Absent);
    }

    // Only the end marker fit in the probe: retry with the declared depth
    // plus some slack for the markers and surrounding lines.
    let hint = end_marker_hint(&refs).unwrap_or(TAIL_PROBE_LINES);
    let deeper = ((hint + 16) * (LINE_WIDTH + 4)) as u64;
    let lines = read_tail_lines(path, deeper.max(probe_bytes * 2)).await?;
    let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();

    match parse_trailer_block(&refs) {
        Some(outcome) => Ok(outcome),
        None => Ok(TrailerReadOutcome::Invalid(Warning::InvalidMetadata(
            "trailer end marker present but begin marker not found".into(),
        ))),
    }
}

/// Legacy files end with a bare `; processed by RatOS` line.
pub fn is_legacy_processed(tail_lines: &[String]) -> bool {
    tail_lines
        .iter()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| {
            let lowered = line.trim().to_ascii_lowercase();
            lowered.starts_with("; processed by ratos")
                && !lowered.starts_with("; processed by ratos.postprocessor")
        })
        .unwrap_or(false)
}
