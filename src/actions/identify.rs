//! Generator identification, the first action in the sequence.
//!
//! Runs once against the head of the stream, examining the first three
//! lines together so a missing line does not break detection. On success it
//! pads and bookmarks the first line (the "processed by" line is prepended
//! there at finalisation) and removes itself from the sequence.

use crate::actions::{Action, Verdict};
use crate::error::{ProcessError, Result, Warning};
use crate::flavor::SlicerFlavor;
use crate::meta::header::{identify_header, reject_processed, HEADER_PROBE_LINES};
use crate::pipeline::bookmark::BookmarkedLine;
use crate::pipeline::window::LineContext;
use crate::state::ProcessingState;

/// Spaces reserved on the first line for the prepended "processed by" line.
const FIRST_LINE_PADDING: usize = 100;

pub fn identify_generator() -> Action {
    Action::new("identify-generator", run)
}

fn run(ctx: &mut LineContext<'_>, state: &mut ProcessingState) -> Result<Verdict> {
    let mut lines: Vec<&str> = vec![ctx.line()];
    for offset in 1..HEADER_PROBE_LINES as isize {
        match ctx.get_line(offset) {
            Some(line) => lines.push(line),
            None => break,
        }
    }

    let identification = identify_header(&lines)?.ok_or(ProcessError::IdentificationNotFound)?;
    reject_processed(&identification)?;

    match identification.flavor {
        SlicerFlavor::Unknown => return Err(ProcessError::IdentificationNotFound),
        SlicerFlavor::RatosDialect => {
            let supported = identification
                .dialect_version
                .as_ref()
                .map(SlicerFlavor::supports_dialect_version)
                .unwrap_or(false);
            if !supported {
                handle_unsupported(state, &identification)?;
            }
        }
        flavor => {
            if !flavor.supports_version(&identification.generator_version) {
                handle_unsupported(state, &identification)?;
            }
        }
    }

    let original = ctx.line().to_string();
    let key = state.keys.next_key();
    ctx.pad(FIRST_LINE_PADDING);
    ctx.set_bookmark(key)?;
    state.first_line = Some(BookmarkedLine {
        text: original,
        key,
    });
    state.identification = Some(identification);
    Ok(Verdict::remove_and_stop())
}

fn handle_unsupported(
    state: &mut ProcessingState,
    identification: &crate::meta::header::GcodeIdentification,
) -> Result<()> {
    let generator = identification.generator.clone();
    let version = identification.generator_version.to_string();
    if state.options.allow_unsupported_slicer_versions && state.has_warning_sink() {
        state.warn(Warning::UnsupportedSlicerVersion { generator, version });
        Ok(())
    } else {
        Err(ProcessError::SlicerNotSupported { generator, version })
    }
}
