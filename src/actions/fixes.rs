//! Flavor-specific fixes for slicer output bugs.
//!
//! SuperSlicer and OrcaSlicer set the second-layer temperature with a bare
//! `M104 S<temp>` that only addresses the active tool, leaving the idle
//! tool at first-layer temperature. The fix captures the `_ON_LAYER_CHANGE
//! LAYER=2` marker and the nearby `M104` lines; at finalisation the marker
//! gains one `M104 S<temp> T<tool>` per used tool and the originals are
//! commented out.
//!
//! OrcaSlicer emits `SET_VELOCITY_LIMIT ACCEL=<n>` which Klipper accepts
//! but RatOS macros do not track; it is rewritten to a plain `M204`.

use std::sync::OnceLock;

use regex::Regex;

use crate::actions::{
    Action, ActionFilter, Verdict, CHANGED_BY_POST_PROCESSOR, REMOVED_BY_POST_PROCESSOR,
};
use crate::error::Result;
use crate::flavor::{SlicerFlavor, SlicerFlavorSet};
use crate::pipeline::bookmark::BookmarkedLine;
use crate::pipeline::window::LineContext;
use crate::state::ProcessingState;

/// Spaces reserved on the layer-2 marker for the appended `M104` lines.
const LAYER_CHANGE_PADDING: usize = 250;

/// How far past the marker the `M104` capture looks.
const TEMP_SCAN: usize = 9;

pub fn fix_other_layer_temps() -> Action {
    Action::filtered(
        "fix-other-layer-temps",
        ActionFilter::flavors(
            SlicerFlavorSet::of(SlicerFlavor::OrcaSlicer).with(SlicerFlavor::SuperSlicer),
        ),
        run_temps,
    )
}

fn run_temps(ctx: &mut LineContext<'_>, state: &mut ProcessingState) -> Result<Verdict> {
    if state.start_print_line.is_none() || !ctx.line().starts_with("_ON_LAYER_CHANGE LAYER=2") {
        return Ok(Verdict::proceed());
    }

    let original = ctx.line().to_string();
    let key = state.keys.next_key();
    ctx.pad(LAYER_CHANGE_PADDING);
    ctx.set_bookmark(key)?;
    state.layer_change_line = Some(BookmarkedLine {
        text: original,
        key,
    });

    let limit = TEMP_SCAN.min(ctx.max_ahead());
    let mut captured = Vec::new();
    for offset in 1..=limit {
        let off = offset as isize;
        if let Some(line) = ctx.get_line(off) {
            if line.starts_with("M104 S") {
                captured.push((off, line.to_string()));
            }
        }
    }
    for (off, text) in captured {
        let key = state.keys.next_key();
        if let Some(mut neighbor) = ctx.neighbor(off) {
            neighbor.pad(REMOVED_BY_POST_PROCESSOR.len());
            neighbor.set_bookmark(key)?;
        }
        state.extruder_temp_lines.push(BookmarkedLine { text, key });
    }

    Ok(Verdict::remove_and_stop())
}

fn accel_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ACCEL=(\d+)").expect("accel regex"))
}

pub fn fix_orca_acceleration() -> Action {
    Action::filtered(
        "fix-orca-acceleration",
        ActionFilter::flavors(SlicerFlavorSet::of(SlicerFlavor::OrcaSlicer)),
        run_accel,
    )
}

fn run_accel(ctx: &mut LineContext<'_>, state: &mut ProcessingState) -> Result<Verdict> {
    if state.start_print_line.is_none() || !ctx.line().starts_with("SET_VELOCITY_LIMIT") {
        return Ok(Verdict::proceed());
    }
    let line = ctx.line().to_string();
    if let Some(captures) = accel_re().captures(&line) {
        ctx.set_line(format!(
            "M204 S{}{CHANGED_BY_POST_PROCESSOR}{line}",
            &captures[1]
        ));
    }
    Ok(Verdict::proceed())
}
