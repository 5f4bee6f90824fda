//! The file facade: inspect, analyze and transform G-code files.
//!
//! `inspect` reads only the header and tail of a file and classifies its
//! printability. `analyze` streams the whole file into a discarding sink to
//! collect statistics. `transform` streams into an output file, then
//! rewrites the bookmarked lines in place and appends the analysis trailer.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::Utc;
use semver::Version;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::actions::{build_sequence, REMOVED_BY_POST_PROCESSOR};
use crate::error::{ProcessError, Result, Warning};
use crate::flavor::{parse_version_lenient, SlicerFlavor};
use crate::meta::analysis::AnalysisResult;
use crate::meta::header::{
    format_processed_by, identify_header, GcodeIdentification, CURRENT_FILE_FORMAT_VERSION,
};
use crate::meta::trailer::{
    format_trailer, is_legacy_processed, read_tail_lines, read_trailer, TrailerReadOutcome,
};
use crate::pipeline::bookmark::BookmarkRegistry;
use crate::pipeline::encoder::BookmarkEncoder;
use crate::pipeline::window::{
    LineContext, SlidingWindow, DEFAULT_LINES_AHEAD, DEFAULT_LINES_BEHIND,
};
use crate::pipeline::CancellationToken;
use crate::state::{ProcessingState, StreamOptions, WarningSink};

/// How many header lines `inspect` reads.
const HEADER_READ_LINES: usize = 4;

/// Bytes loaded by the legacy tail probe.
const TAIL_PROBE_BYTES: u64 = 8 * 1024;

/// Lines between progress callbacks during a stream pass.
const PROGRESS_INTERVAL_LINES: u64 = 5_000;

/// Whether a file can be printed as-is or needs (re)processing first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Printability {
    Ready,
    MustProcess,
    MustReprocess,
    CouldReprocess,
    NotSupported,
    Unknown,
}

/// Options for the header/tail-only inspection pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct InspectOptions {
    /// The target printer has independent dual X carriages.
    pub idex: bool,
    pub allow_unsupported_slicer_versions: bool,
    /// Classify unidentifiable files as `Unknown` instead of failing.
    pub allow_unknown_generator: bool,
}

/// Options for the streaming passes (`analyze` and `transform`).
#[derive(Default)]
pub struct ProcessOptions {
    pub idex: bool,
    pub allow_unsupported_slicer_versions: bool,
    /// Stop an `analyze` pass at the first XY move.
    pub quick: bool,
    /// Allow `transform` to replace an existing output file.
    pub overwrite: bool,
    pub cancel: CancellationToken,
    pub on_warning: Option<WarningSink>,
    /// Called with cumulative input bytes consumed, every few thousand lines.
    pub on_progress: Option<Box<dyn FnMut(u64) + Send>>,
}

/// Result of a completed transform.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// Identification with the fresh analysis moved into it.
    pub identification: GcodeIdentification,
    pub analysis: AnalysisResult,
    pub warnings: Vec<Warning>,
    /// Stream bytes written before the trailer was appended.
    pub bytes_written: u64,
}

/// An inspected file: identification, printability and the reasons for it.
#[derive(Debug)]
pub struct GcodeFile {
    pub path: PathBuf,
    pub size: u64,
    pub identification: Option<GcodeIdentification>,
    pub printability: Printability,
    pub reasons: Vec<String>,
    /// True when the trailer can be stripped to recover the pre-processed
    /// content (current file format with a readable analysis).
    pub can_deprocess: bool,
    /// File carries the old whole-file processor's EOF marker.
    pub is_legacy_processed: bool,
    pub warnings: Vec<Warning>,
}

impl GcodeFile {
    /// Read the header and tail of `path` and classify it.
    pub async fn inspect(path: impl AsRef<Path>, options: &InspectOptions) -> Result<Self> {
        let path = path.as_ref();
        let size = tokio::fs::metadata(path).await?.len();

        let header_lines = read_header_lines(path).await?;
        let refs: Vec<&str> = header_lines.iter().map(|s| s.as_str()).collect();
        let mut identification = identify_header(&refs)?;

        let tail = read_tail_lines(path, TAIL_PROBE_BYTES).await?;
        let is_legacy = is_legacy_processed(&tail);

        let mut warnings = Vec::new();
        if let Some(ident) = identification.as_mut() {
            if ident.was_processed() {
                match read_trailer(path).await? {
                    TrailerReadOutcome::Found(analysis) => ident.analysis = Some(analysis),
                    TrailerReadOutcome::Invalid(warning) => {
                        log::warn!("{warning}");
                        warnings.push(warning);
                    }
                    TrailerReadOutcome::Absent => {}
                }
            }
        }

        let identifiable = identification
            .as_ref()
            .map(|ident| ident.flavor != SlicerFlavor::Unknown)
            .unwrap_or(false);
        if !identifiable {
            if !options.allow_unknown_generator {
                return Err(ProcessError::IdentificationNotFound);
            }
            return Ok(Self {
                path: path.to_path_buf(),
                size,
                identification,
                printability: Printability::Unknown,
                reasons: vec!["the file header does not identify a supported slicer".into()],
                can_deprocess: false,
                is_legacy_processed: is_legacy,
                warnings,
            });
        }

        let ident = identification
            .as_ref()
            .ok_or(ProcessError::IdentificationNotFound)?;
        let current = host_version().await;
        let (printability, reasons) = classify(ident, is_legacy, options, &current);
        let can_deprocess = ident.was_processed()
            && ident.file_format_version == Some(CURRENT_FILE_FORMAT_VERSION)
            && ident.analysis.is_some();

        Ok(Self {
            path: path.to_path_buf(),
            size,
            identification,
            printability,
            reasons,
            can_deprocess,
            is_legacy_processed: is_legacy,
            warnings,
        })
    }

    /// Stream the file into a discarding sink and return the analysis.
    ///
    /// With `options.quick` set the pass ends as soon as the first XY move
    /// is known and a quick analysis is returned.
    pub async fn analyze(&self, mut options: ProcessOptions) -> Result<AnalysisResult> {
        let mut state = ProcessingState::new(StreamOptions {
            idex: options.idex,
            quick_inspection: options.quick,
            allow_unsupported_slicer_versions: options.allow_unsupported_slicer_versions,
        });
        if let Some(sink) = options.on_warning.take() {
            state = state.with_warning_sink(sink);
        }

        let result = run_stream(
            &self.path,
            tokio::io::sink(),
            &mut state,
            options.cancel.clone(),
            options.on_progress.as_deref_mut(),
        )
        .await;

        match result {
            Ok(_) => {
                if state.identification.is_none() {
                    return Err(ProcessError::IdentificationNotFound);
                }
                if options.quick {
                    Ok(state.to_quick_analysis())
                } else {
                    Ok(state.to_full_analysis())
                }
            }
            Err(ProcessError::InspectionComplete) => Ok(state.to_quick_analysis()),
            Err(e) => Err(e),
        }
    }

    /// Stream the file into `output`, retro-patch the bookmarked lines and
    /// append the analysis trailer.
    ///
    /// On error the partially written output is left in place; the caller
    /// decides whether to delete it.
    pub async fn transform(
        &self,
        output: impl AsRef<Path>,
        mut options: ProcessOptions,
    ) -> Result<ProcessOutcome> {
        let output = output.as_ref();
        if !options.overwrite && tokio::fs::try_exists(output).await? {
            return Err(ProcessError::OutputExists(output.to_path_buf()));
        }

        let mut state = ProcessingState::new(StreamOptions {
            idex: options.idex,
            quick_inspection: false,
            allow_unsupported_slicer_versions: options.allow_unsupported_slicer_versions,
        });
        if let Some(sink) = options.on_warning.take() {
            state = state.with_warning_sink(sink);
        }

        let out_file = tokio::fs::File::create(output).await?;
        let (out_file, registry, bytes_written) = run_stream(
            &self.path,
            out_file,
            &mut state,
            options.cancel.clone(),
            options.on_progress.as_deref_mut(),
        )
        .await?;

        let mut identification = state
            .identification
            .clone()
            .ok_or(ProcessError::IdentificationNotFound)?;

        let analysis = finalize(
            out_file,
            &registry,
            bytes_written,
            &state,
            options.idex,
            &options.cancel,
        )
        .await?;

        identification.analysis = Some(analysis.clone());
        identification.processed_for_idex = Some(options.idex);
        identification.file_format_version = Some(CURRENT_FILE_FORMAT_VERSION);
        identification.analysis_offset = Some(bytes_written);

        Ok(ProcessOutcome {
            identification,
            analysis,
            warnings: state.warnings,
            bytes_written,
        })
    }
}

async fn read_header_lines(path: &Path) -> Result<Vec<String>> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut lines = Vec::with_capacity(HEADER_READ_LINES);
    let mut buf = String::new();
    for _ in 0..HEADER_READ_LINES {
        buf.clear();
        if reader.read_line(&mut buf).await? == 0 {
            break;
        }
        lines.push(buf.trim_end_matches(['\n', '\r']).to_string());
    }
    Ok(lines)
}

/// The printability decision table, evaluated in order; first match wins.
fn classify(
    ident: &GcodeIdentification,
    is_legacy: bool,
    options: &InspectOptions,
    current: &Version,
) -> (Printability, Vec<String>) {
    let version_supported = match ident.flavor {
        SlicerFlavor::RatosDialect => ident
            .dialect_version
            .as_ref()
            .map(SlicerFlavor::supports_dialect_version)
            .unwrap_or(false),
        flavor => flavor.supports_version(&ident.generator_version),
    };
    if !version_supported && !options.allow_unsupported_slicer_versions {
        return (
            Printability::NotSupported,
            vec![format!(
                "{} {} is not a supported slicer version",
                ident.generator, ident.generator_version
            )],
        );
    }

    if is_legacy {
        return (
            Printability::NotSupported,
            vec!["file was processed by a previous RatOS release; re-upload required".into()],
        );
    }

    if ident.was_processed() {
        let format = ident.file_format_version.unwrap_or(0);
        if format < CURRENT_FILE_FORMAT_VERSION {
            return (
                Printability::NotSupported,
                vec![format!(
                    "file format v{format} predates v{CURRENT_FILE_FORMAT_VERSION}; re-upload required"
                )],
            );
        }
        if format > CURRENT_FILE_FORMAT_VERSION {
            return (
                Printability::NotSupported,
                vec![format!(
                    "file format v{format} is newer than this host supports; update RatOS"
                )],
            );
        }

        let processed_for_idex = ident.processed_for_idex.unwrap_or(false);
        if processed_for_idex != options.idex {
            let reason = if options.idex {
                "file was processed without IDEX toolshifts but the printer is IDEX"
            } else {
                "file was processed for an IDEX printer"
            };
            return (Printability::MustReprocess, vec![reason.into()]);
        }

        let processed_by = match ident.postprocessor_version.as_ref() {
            Some(version) => version,
            None => return (Printability::MustReprocess, vec!["unknown processor version".into()]),
        };
        if processed_by == current {
            return (Printability::Ready, Vec::new());
        }
        if processed_by > current {
            return (
                Printability::MustReprocess,
                vec![format!(
                    "file was processed by a newer release ({processed_by} > {current})"
                )],
            );
        }
        if processed_by.major < current.major {
            return (
                Printability::MustReprocess,
                vec![format!(
                    "processor {processed_by} output is incompatible with {current}"
                )],
            );
        }
        return (
            Printability::CouldReprocess,
            vec![format!(
                "processor {current} has enhancements and fixes over {processed_by}"
            )],
        );
    }

    if options.idex {
        (
            Printability::MustProcess,
            vec!["IDEX printers require toolshift processing".into()],
        )
    } else {
        (Printability::Ready, Vec::new())
    }
}

/// One forward pass: line splitter, window, dispatcher, encoder.
async fn run_stream<'a, W: AsyncWrite + Unpin>(
    path: &Path,
    sink: W,
    state: &mut ProcessingState,
    cancel: CancellationToken,
    mut on_progress: Option<&'a mut (dyn FnMut(u64) + Send + 'static)>,
) -> Result<(W, BookmarkRegistry, u64)> {
    let input = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(input);
    let mut window = SlidingWindow::new(DEFAULT_LINES_BEHIND, DEFAULT_LINES_AHEAD);
    let mut encoder = BookmarkEncoder::new(sink, cancel.clone());
    let mut sequence = build_sequence();
    let mut on_line = |mut ctx: LineContext<'_>| sequence.dispatch(&mut ctx, state);

    let mut buf = String::new();
    let mut consumed: u64 = 0;
    let mut line_count: u64 = 0;
    loop {
        cancel.check()?;
        buf.clear();
        let n = reader.read_line(&mut buf).await?;
        if n == 0 {
            break;
        }
        consumed += n as u64;
        line_count += 1;
        if line_count % PROGRESS_INTERVAL_LINES == 0 {
            if let Some(progress) = on_progress.as_mut() {
                progress(consumed);
            }
        }
        let line = buf.trim_end_matches('\n').trim_end_matches('\r');
        window
            .push(line.to_string(), &mut on_line, &mut encoder)
            .await?;
    }
    window.flush(&mut on_line, &mut encoder).await?;
    encoder.finish().await
}

/// Apply the deterministic retro-patches and append the trailer.
async fn finalize(
    mut file: tokio::fs::File,
    registry: &BookmarkRegistry,
    bytes_written: u64,
    state: &ProcessingState,
    idex: bool,
    cancel: &CancellationToken,
) -> Result<AnalysisResult> {
    let analysis = state.to_full_analysis();
    let version = postprocessor_version().await;

    // 1. Prepend the "processed by" line to the padded first line.
    let first = state
        .first_line
        .as_ref()
        .ok_or_else(|| ProcessError::Internal("stream finished without a first-line handle".into()))?;
    let processed_line = format_processed_by(&version, Utc::now(), bytes_written, idex);
    write_patch(
        &mut file,
        registry,
        first.key,
        &format!("{processed_line}\n{}", first.text),
        cancel,
    )
    .await?;

    // 2. Append the collected print parameters to START_PRINT.
    if let Some(handle) = state.start_print_line.as_ref() {
        let mut line = handle.text.trim_end().to_string();
        if state.tool_change_count > 0 {
            line.push_str(&format!(" TOTAL_TOOLSHIFTS={}", state.tool_change_count - 1));
        }
        if let (Some(x), Some(y)) = (state.first_move_x, state.first_move_y) {
            line.push_str(&format!(" FIRST_X={x} FIRST_Y={y}"));
        }
        if state.min_x.is_finite() && state.max_x.is_finite() {
            line.push_str(&format!(" MIN_X={} MAX_X={}", state.min_x, state.max_x));
        }
        if !state.used_tools.is_empty() {
            line.push_str(&format!(" USED_TOOLS={}", state.used_tools.join(",")));
            if let Some(accel) = state.slicer_config.get("wipe_tower_acceleration") {
                line.push_str(&format!(" WIPE_ACCEL={accel}"));
            }
        }
        write_patch(&mut file, registry, handle.key, &line, cancel).await?;
    }

    // 3. Correct the second-layer temperatures for every used tool.
    if let (Some(marker), Some(temps)) = (
        state.layer_change_line.as_ref(),
        state.extruder_temps.as_ref(),
    ) {
        if !state.used_tools.is_empty() {
            let mut line = marker.text.clone();
            for tool in &state.used_tools {
                if let Some(temp) = tool.parse::<usize>().ok().and_then(|t| temps.get(t)) {
                    line.push_str(&format!("\nM104 S{temp} T{tool}"));
                }
            }
            write_patch(&mut file, registry, marker.key, &line, cancel).await?;

            for handle in &state.extruder_temp_lines {
                let replaced = format!("{REMOVED_BY_POST_PROCESSOR}{}", handle.text);
                write_patch(&mut file, registry, handle.key, &replaced, cancel).await?;
            }
        }
    }

    // 4. Append the analysis trailer after the streamed content.
    cancel.check()?;
    file.seek(SeekFrom::Start(bytes_written)).await?;
    let trailer = format_trailer(&analysis)?;
    file.write_all(trailer.as_bytes()).await?;
    file.flush().await?;

    Ok(analysis)
}

async fn write_patch(
    file: &mut tokio::fs::File,
    registry: &BookmarkRegistry,
    key: crate::pipeline::bookmark::BookmarkKey,
    replacement: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    cancel.check()?;
    let bookmark = registry.get(key)?;
    let patch = bookmark.fit_replacement(replacement)?;
    file.seek(SeekFrom::Start(bookmark.offset)).await?;
    file.write_all(&patch).await?;
    Ok(())
}

/// The post-processor's own version: described from the RatOS checkout when
/// `RATOS_SCRIPT_DIR` points at one, the crate version otherwise.
pub async fn postprocessor_version() -> String {
    if let Ok(dir) = std::env::var("RATOS_SCRIPT_DIR") {
        if let Some(version) = git_described_version(&dir).await {
            return version;
        }
    }
    env!("CARGO_PKG_VERSION").to_string()
}

async fn git_described_version(dir: &str) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["-C", dir, "describe", "--always", "--tags", "--long", "--dirty"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let described = String::from_utf8_lossy(&output.stdout);
    let candidate = described.trim().trim_start_matches('v').split('-').next()?;
    parse_version_lenient(candidate)
        .ok()
        .map(|version| version.to_string())
}

async fn host_version() -> Version {
    parse_version_lenient(&postprocessor_version().await)
        .unwrap_or_else(|_| Version::new(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::header::parse_generated_line;

    fn unprocessed_ident() -> GcodeIdentification {
        parse_generated_line("; generated by PrusaSlicer 2.8.1 on 2024-05-01 at 10:00:00")
            .unwrap()
            .unwrap()
    }

    fn processed_ident(
        version: &str,
        format: u32,
        idex: bool,
    ) -> GcodeIdentification {
        let mut ident = unprocessed_ident();
        ident.postprocessor_version = Some(Version::parse(version).unwrap());
        ident.processed_for_idex = Some(idex);
        ident.file_format_version = Some(format);
        ident
    }

    fn opts(idex: bool) -> InspectOptions {
        InspectOptions {
            idex,
            ..InspectOptions::default()
        }
    }

    const V: u32 = CURRENT_FILE_FORMAT_VERSION;

    #[test]
    fn test_unprocessed_idex_must_process() {
        let current = Version::new(1, 0, 2);
        let (p, _) = classify(&unprocessed_ident(), false, &opts(true), &current);
        assert_eq!(p, Printability::MustProcess);
    }

    #[test]
    fn test_unprocessed_non_idex_is_ready() {
        let current = Version::new(1, 0, 2);
        let (p, _) = classify(&unprocessed_ident(), false, &opts(false), &current);
        assert_eq!(p, Printability::Ready);
    }

    #[test]
    fn test_unsupported_version_strict_rejects() {
        let mut ident = unprocessed_ident();
        ident.generator_version = Version::new(2, 7, 4);
        let current = Version::new(1, 0, 2);
        let (p, reasons) = classify(&ident, false, &opts(false), &current);
        assert_eq!(p, Printability::NotSupported);
        assert!(reasons[0].contains("2.7.4"));

        let allowing = InspectOptions {
            allow_unsupported_slicer_versions: true,
            ..opts(false)
        };
        let (p, _) = classify(&ident, false, &allowing, &current);
        assert_eq!(p, Printability::Ready);
    }

    #[test]
    fn test_legacy_file_needs_reupload() {
        let current = Version::new(1, 0, 2);
        let (p, reasons) = classify(&unprocessed_ident(), true, &opts(false), &current);
        assert_eq!(p, Printability::NotSupported);
        assert!(reasons[0].contains("re-upload"));
    }

    #[test]
    fn test_file_format_mismatches() {
        let current = Version::new(1, 0, 2);
        let (p, reasons) = classify(
            &processed_ident("1.0.2", V - 1, false),
            false,
            &opts(false),
            &current,
        );
        assert_eq!(p, Printability::NotSupported);
        assert!(reasons[0].contains("re-upload"));

        let (p, reasons) = classify(
            &processed_ident("1.0.2", V + 1, false),
            false,
            &opts(false),
            &current,
        );
        assert_eq!(p, Printability::NotSupported);
        assert!(reasons[0].contains("update"));
    }

    #[test]
    fn test_idex_flag_mismatch_both_ways() {
        let current = Version::new(1, 0, 2);
        let (p, reasons) = classify(
            &processed_ident("1.0.2", V, false),
            false,
            &opts(true),
            &current,
        );
        assert_eq!(p, Printability::MustReprocess);
        assert!(reasons[0].contains("IDEX"));

        let (p, reasons) = classify(
            &processed_ident("1.0.2", V, true),
            false,
            &opts(false),
            &current,
        );
        assert_eq!(p, Printability::MustReprocess);
        assert!(reasons[0].contains("IDEX"));
    }

    #[test]
    fn test_same_version_is_ready() {
        let current = Version::new(1, 0, 2);
        let (p, _) = classify(
            &processed_ident("1.0.2", V, false),
            false,
            &opts(false),
            &current,
        );
        assert_eq!(p, Printability::Ready);
    }

    #[test]
    fn test_newer_processor_must_reprocess() {
        let current = Version::new(1, 0, 2);
        let (p, _) = classify(
            &processed_ident("2.0.0", V, false),
            false,
            &opts(false),
            &current,
        );
        assert_eq!(p, Printability::MustReprocess);
    }

    #[test]
    fn test_older_major_must_reprocess() {
        let current = Version::new(1, 0, 2);
        let (p, _) = classify(
            &processed_ident("0.9.0", V, false),
            false,
            &opts(false),
            &current,
        );
        assert_eq!(p, Printability::MustReprocess);
    }

    #[test]
    fn test_older_minor_could_reprocess() {
        let current = Version::new(1, 1, 0);
        let (p, reasons) = classify(
            &processed_ident("1.0.2", V, false),
            false,
            &opts(false),
            &current,
        );
        assert_eq!(p, Printability::CouldReprocess);
        assert!(reasons[0].contains("enhancements"));
    }

    #[test]
    fn test_printability_serialises_screaming() {
        assert_eq!(
            serde_json::to_string(&Printability::MustReprocess).unwrap(),
            "\"MUST_REPROCESS\""
        );
    }
}
