//! Identification header parsing and the "processed by" line.
//!
//! The first lines of a sliced file identify the generator:
//!
//! ```text
//! ; generated by PrusaSlicer 2.8.1 on 2024-05-01 at 10:00:00
//! ; generated by SuperSlicer 2.5.59 in RatOS dialect 0.1 on 2024-05-01 at 10:00:00
//! ```
//!
//! A file this tool already handled additionally starts with:
//!
//! ```text
//! ; processed by RatOS.PostProcessor 1.0.2 on 2024-05-01 at 10:00:01 UTC v:3 m:1a2b idex
//! ```
//!
//! Two older tail-less forms of the processed-by line are still recognised
//! so files from earlier releases classify correctly.

use std::sync::OnceLock;

use regex::Regex;
use semver::Version;

use crate::error::{ProcessError, Result};
use crate::flavor::{parse_version_lenient, SlicerFlavor};
use crate::meta::analysis::AnalysisResult;

/// File-format version written into the `v:` field of the processed-by line.
pub const CURRENT_FILE_FORMAT_VERSION: u32 = 3;

/// How many header lines identification may be spread across.
pub const HEADER_PROBE_LINES: usize = 3;

/// Everything known about a file's origin. Populated once, early in the
/// stream, then read-only.
#[derive(Debug, Clone)]
pub struct GcodeIdentification {
    /// Generator name as written in the header (e.g. "PrusaSlicer").
    pub generator: String,
    pub generator_version: Version,
    pub flavor: SlicerFlavor,
    /// Generator timestamp, verbatim ("2024-05-01 10:00:00").
    pub generated_at: String,
    /// RatOS dialect version, when the header carries the dialect token.
    pub dialect_version: Option<Version>,
    /// Post-processor fields, present when the file was already processed.
    pub postprocessor_version: Option<Version>,
    pub processed_at: Option<String>,
    pub processed_for_idex: Option<bool>,
    pub file_format_version: Option<u32>,
    /// Byte offset of the analysis trailer (`m:` field).
    pub analysis_offset: Option<u64>,
    /// Analysis result, materialised at finalisation or loaded from the trailer.
    pub analysis: Option<AnalysisResult>,
}

impl GcodeIdentification {
    pub fn was_processed(&self) -> bool {
        self.postprocessor_version.is_some()
    }
}

/// Parsed fields of a "processed by" line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedByInfo {
    pub version: Version,
    pub processed_at: Option<String>,
    pub file_format_version: Option<u32>,
    pub analysis_offset: Option<u64>,
    pub idex: bool,
}

fn generated_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^; generated (?:by|with) (\S+) (\S+?)(?: in ratos dialect (\S+))? on (\S+) at (\S+)",
        )
        .expect("generated-line regex")
    })
}

fn processed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^; processed by ratos\.postprocessor (\S+)(?: on (\S+) at (\S+) utc)?((?: \S+)*)\s*$",
        )
        .expect("processed-line regex")
    })
}

/// Parse one line as an identification line.
///
/// Returns `Ok(None)` when the line is not an identification line at all and
/// an error when it matched but carries an unparsable version.
pub fn parse_generated_line(line: &str) -> Result<Option<GcodeIdentification>> {
    let captures = match generated_re().captures(line) {
        Some(captures) => captures,
        None => return Ok(None),
    };

    let generator = captures[1].to_string();
    let generator_version = parse_version_lenient(&captures[2])?;
    let dialect_version = match captures.get(3) {
        Some(m) => Some(parse_version_lenient(m.as_str())?),
        None => None,
    };
    let generated_at = format!("{} {}", &captures[4], &captures[5]);

    let flavor = if dialect_version.is_some() {
        SlicerFlavor::RatosDialect
    } else {
        SlicerFlavor::from_generator_name(&generator)
    };

    Ok(Some(GcodeIdentification {
        generator,
        generator_version,
        flavor,
        generated_at,
        dialect_version,
        postprocessor_version: None,
        processed_at: None,
        processed_for_idex: None,
        file_format_version: None,
        analysis_offset: None,
        analysis: None,
    }))
}

/// Parse one line as a "processed by" line in any recognised form.
pub fn parse_processed_by(line: &str) -> Result<Option<ProcessedByInfo>> {
    let captures = match processed_re().captures(line) {
        Some(captures) => captures,
        None => return Ok(None),
    };

    let version = parse_version_lenient(&captures[1])?;
    let processed_at = match (captures.get(2), captures.get(3)) {
        (Some(date), Some(time)) => Some(format!("{} {}", date.as_str(), time.as_str())),
        _ => None,
    };

    let mut file_format_version = None;
    let mut analysis_offset = None;
    let mut idex = false;
    if let Some(tail) = captures.get(4) {
        for token in tail.as_str().split_ascii_whitespace() {
            if let Some(value) = token.strip_prefix("v:") {
                file_format_version = value.parse::<u32>().ok();
            } else if let Some(value) = token.strip_prefix("m:") {
                analysis_offset = u64::from_str_radix(value, 16).ok();
            } else if token.eq_ignore_ascii_case("idex") {
                idex = true;
            }
        }
    }

    Ok(Some(ProcessedByInfo {
        version,
        processed_at,
        file_format_version,
        analysis_offset,
        idex,
    }))
}

/// Examine the first header lines of a file as one unit.
///
/// The processed-by line (when present) precedes the generated-by line, but
/// either may be missing individually, so every probe line is tried against
/// both shapes.
pub fn identify_header(lines: &[&str]) -> Result<Option<GcodeIdentification>> {
    let mut identification: Option<GcodeIdentification> = None;
    let mut processed: Option<ProcessedByInfo> = None;

    for line in lines.iter().take(HEADER_PROBE_LINES + 1) {
        if processed.is_none() {
            if let Some(info) = parse_processed_by(line)? {
                processed = Some(info);
                continue;
            }
        }
        if identification.is_none() {
            if let Some(ident) = parse_generated_line(line)? {
                identification = Some(ident);
            }
        }
    }

    let mut identification = match identification {
        Some(identification) => identification,
        None => return Ok(None),
    };

    if let Some(info) = processed {
        identification.postprocessor_version = Some(info.version);
        identification.processed_at = info.processed_at;
        identification.processed_for_idex = Some(info.idex);
        identification.file_format_version = info.file_format_version;
        identification.analysis_offset = info.analysis_offset;
    }

    Ok(Some(identification))
}

/// Serialise the current-form processed-by line.
///
/// The emitted shape is byte-identical across runs for the same inputs:
/// `; processed by RatOS.PostProcessor <VERSION> on YYYY-MM-DD at HH:mm:ss UTC v:<FORMAT> m:<HEX_OFFSET>[ idex]`
pub fn format_processed_by(
    version: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
    trailer_offset: u64,
    idex: bool,
) -> String {
    let mut line = format!(
        "; processed by RatOS.PostProcessor {} on {} UTC v:{} m:{:x}",
        version,
        timestamp.format("%Y-%m-%d at %H:%M:%S"),
        CURRENT_FILE_FORMAT_VERSION,
        trailer_offset,
    );
    if idex {
        line.push_str(" idex");
    }
    line
}

/// Raise `AlreadyProcessed` when the identification says this file has been
/// through the post-processor before.
pub fn reject_processed(identification: &GcodeIdentification) -> Result<()> {
    if identification.was_processed() {
        return Err(ProcessError::AlreadyProcessed(Box::new(
            identification.clone(),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generated_by() {
        let ident = parse_generated_line(
            "; generated by PrusaSlicer 2.8.1 on 2024-05-01 at 10:00:00",
        )
        .unwrap()
        .unwrap();
        assert_eq!(ident.generator, "PrusaSlicer");
        assert_eq!(ident.generator_version, Version::new(2, 8, 1));
        assert_eq!(ident.flavor, SlicerFlavor::PrusaSlicer);
        assert_eq!(ident.generated_at, "2024-05-01 10:00:00");
        assert!(!ident.was_processed());
    }

    #[test]
    fn test_parse_generated_with_is_case_insensitive() {
        let ident = parse_generated_line(
            "; Generated with OrcaSlicer 2.1.1 on 2024-05-01 at 10:00:00",
        )
        .unwrap()
        .unwrap();
        assert_eq!(ident.flavor, SlicerFlavor::OrcaSlicer);
    }

    #[test]
    fn test_parse_ratos_dialect() {
        let ident = parse_generated_line(
            "; generated by SuperSlicer 2.5.59 in RatOS dialect 0.1 on 2024-05-01 at 10:00:00",
        )
        .unwrap()
        .unwrap();
        assert_eq!(ident.flavor, SlicerFlavor::RatosDialect);
        assert_eq!(ident.dialect_version, Some(Version::new(0, 1, 0)));
    }

    #[test]
    fn test_unknown_generator_still_identifies() {
        let ident =
            parse_generated_line("; generated by Cura 5.7.0 on 2024-05-01 at 10:00:00")
                .unwrap()
                .unwrap();
        assert_eq!(ident.flavor, SlicerFlavor::Unknown);
    }

    #[test]
    fn test_non_header_lines_miss() {
        assert!(parse_generated_line("G1 X10 Y10").unwrap().is_none());
        assert!(parse_generated_line("; thumbnail begin").unwrap().is_none());
    }

    #[test]
    fn test_bad_version_is_an_error() {
        let result =
            parse_generated_line("; generated by PrusaSlicer x.y.z on 2024-05-01 at 10:00:00");
        assert!(matches!(result, Err(ProcessError::Version(_))));
    }

    #[test]
    fn test_parse_processed_by_current_form() {
        let info = parse_processed_by(
            "; processed by RatOS.PostProcessor 1.0.2 on 2024-05-01 at 10:00:00 UTC v:3 m:1a2b idex",
        )
        .unwrap()
        .unwrap();
        assert_eq!(info.version, Version::new(1, 0, 2));
        assert_eq!(info.processed_at.as_deref(), Some("2024-05-01 10:00:00"));
        assert_eq!(info.file_format_version, Some(3));
        assert_eq!(info.analysis_offset, Some(0x1a2b));
        assert!(info.idex);
    }

    #[test]
    fn test_parse_processed_by_historical_forms() {
        let info = parse_processed_by("; processed by RatOS.PostProcessor 0.0.9")
            .unwrap()
            .unwrap();
        assert_eq!(info.version, Version::new(0, 0, 9));
        assert_eq!(info.file_format_version, None);
        assert!(!info.idex);

        let info = parse_processed_by(
            "; processed by RatOS.PostProcessor 0.1.0 on 2023-11-02 at 08:15:00 UTC",
        )
        .unwrap()
        .unwrap();
        assert_eq!(info.version, Version::new(0, 1, 0));
        assert_eq!(info.processed_at.as_deref(), Some("2023-11-02 08:15:00"));
        assert_eq!(info.analysis_offset, None);
    }

    #[test]
    fn test_identify_header_combines_both_lines() {
        let lines = [
            "; processed by RatOS.PostProcessor 1.0.0 on 2024-05-01 at 11:00:00 UTC v:3 m:ff",
            "; generated by PrusaSlicer 2.8.1 on 2024-05-01 at 10:00:00",
            "; estimated printing time 1h",
        ];
        let ident = identify_header(&lines).unwrap().unwrap();
        assert!(ident.was_processed());
        assert_eq!(ident.postprocessor_version, Some(Version::new(1, 0, 0)));
        assert_eq!(ident.processed_for_idex, Some(false));
        assert_eq!(ident.analysis_offset, Some(0xff));
        assert_eq!(ident.flavor, SlicerFlavor::PrusaSlicer);
    }

    #[test]
    fn test_identify_header_without_identification() {
        let lines = ["; thumbnail begin", "G28", "G1 X0"];
        assert!(identify_header(&lines).unwrap().is_none());
    }

    #[test]
    fn test_format_processed_by_round_trip() {
        let timestamp = chrono::DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let line = format_processed_by("1.0.2", timestamp, 0x1a2b, true);
        assert_eq!(
            line,
            "; processed by RatOS.PostProcessor 1.0.2 on 2024-05-01 at 10:00:00 UTC v:3 m:1a2b idex"
        );
        let info = parse_processed_by(&line).unwrap().unwrap();
        assert_eq!(info.version, Version::new(1, 0, 2));
        assert_eq!(info.analysis_offset, Some(0x1a2b));
        assert!(info.idex);
    }
}
