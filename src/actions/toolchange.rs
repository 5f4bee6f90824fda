//! Rewrite per-layer tool-change blocks into single toolshift commands.
//!
//! On an IDEX machine the idle carriage is already parked at the side, so
//! the retract/z-hop dance the slicer emits around a `Tn` is wasted motion.
//! The block is collapsed into one atomic `Tn X<x> Y<y> [Z<z>]` carrying the
//! destination of the next move, and the surrounding retract and z-hop
//! lines are commented out.
//!
//! When the slicer prints a purge tower the block must survive mostly
//! intact: only the `Tn` line itself gains the destination coordinates.

use crate::actions::commands::scratch_command;
use crate::actions::{comment_out, Action, Verdict};
use crate::command::parse_command;
use crate::error::{ProcessError, Result, Warning};
use crate::pipeline::window::LineContext;
use crate::state::ProcessingState;

/// How far back the purge-tower probe looks for `; CP TOOLCHANGE START`.
/// Clamped to the window's configured behind-depth.
const PURGE_TOWER_SCAN: usize = 100;

/// How far back retract/z-hop redaction walks.
const REDACTION_SCAN: usize = 19;

/// How far ahead the destination scan walks. Matches observed slicer
/// behaviour; widen deliberately, never silently.
const DESTINATION_SCAN: usize = 19;

pub fn rewrite_toolchange() -> Action {
    Action::new("rewrite-toolchange", run)
}

fn run(ctx: &mut LineContext<'_>, state: &mut ProcessingState) -> Result<Verdict> {
    let command = scratch_command(state)?;
    if !command.is_tool_change() {
        return Ok(Verdict::proceed());
    }

    state.tool_change_count += 1;
    if state.tool_change_count == 1 {
        // The slicer's initial tool selection is redundant: START_PRINT
        // receives INITIAL_TOOL and selects it itself.
        if let Some(replaced) = comment_out(ctx.line()) {
            ctx.set_line(replaced);
        }
        return Ok(Verdict::stop());
    }

    let tool = command.value.clone();
    state.record_tool(&tool);

    if state.has_purge_tower.is_none() {
        state.has_purge_tower = Some(detect_purge_tower(ctx));
    }
    let purge_tower = state.has_purge_tower == Some(true);

    if !purge_tower {
        redact_before(ctx, state);
    }

    let destination = scan_destination(ctx, state)?;

    if !purge_tower {
        for offset in destination.extrusion_offsets {
            comment_out_at(ctx, offset);
        }
        // Every Z move but the last one; the last becomes part of the
        // toolshift itself.
        if destination.z_offsets.len() > 1 {
            for offset in &destination.z_offsets[..destination.z_offsets.len() - 1] {
                comment_out_at(ctx, *offset);
            }
        }
    }

    let mut replacement = format!("T{tool} X{} Y{}", destination.x, destination.y);
    if let Some(z) = destination.z_values.last() {
        replacement.push_str(&format!(" Z{z}"));
    }
    ctx.set_line(replacement);
    Ok(Verdict::stop())
}

fn detect_purge_tower(ctx: &LineContext<'_>) -> bool {
    let limit = PURGE_TOWER_SCAN.min(ctx.max_back());
    for offset in 1..=limit {
        if let Some(line) = ctx.get_line(-(offset as isize)) {
            if line.trim_start().starts_with("; CP TOOLCHANGE START") {
                return true;
            }
        }
    }
    false
}

/// Comment out retract and z-hop moves between the previous print move and
/// the tool change.
fn redact_before(ctx: &mut LineContext<'_>, state: &mut ProcessingState) {
    enum Step {
        Skip,
        Stop,
        Redact,
    }

    let mut hit_xy_stop = false;
    let limit = REDACTION_SCAN.min(ctx.max_back());
    for offset in 1..=limit {
        let off = -(offset as isize);
        let step = match ctx.get_line(off).and_then(parse_command) {
            Some(cmd) if cmd.is_linear_move() => {
                if cmd.x.is_some() || cmd.y.is_some() {
                    Step::Stop
                } else if cmd.e.is_some() || cmd.z.is_some() {
                    Step::Redact
                } else {
                    Step::Skip
                }
            }
            _ => Step::Skip,
        };
        match step {
            Step::Stop => {
                hit_xy_stop = true;
                break;
            }
            Step::Redact => {
                // A retract right after a wipe sequence is the wipe's own
                // de-retract pairing; leave it alone.
                if !near_wipe_end(ctx, off) {
                    comment_out_at(ctx, off);
                }
            }
            Step::Skip => {}
        }
    }
    if !hit_xy_stop {
        state.warn(Warning::HeuristicSmell {
            line_number: ctx.line_number(),
            message: "retract scan before a tool change ended without an XY move".into(),
        });
    }
}

fn near_wipe_end(ctx: &LineContext<'_>, off: isize) -> bool {
    (-2isize..=2).any(|delta| {
        delta != 0
            && ctx
                .get_line(off + delta)
                .map(|line| line.trim_start().starts_with(";WIPE_END"))
                .unwrap_or(false)
    })
}

fn comment_out_at(ctx: &mut LineContext<'_>, off: isize) {
    let replaced = ctx.get_line(off).and_then(comment_out);
    if let Some(replaced) = replaced {
        if let Some(mut neighbor) = ctx.neighbor(off) {
            neighbor.set_line(replaced);
        }
    }
}

struct Destination {
    x: String,
    y: String,
    z_values: Vec<String>,
    z_offsets: Vec<isize>,
    extrusion_offsets: Vec<isize>,
}

/// Walk forward from the tool change collecting the first XY destination,
/// Z moves and pure extrusion moves.
fn scan_destination(ctx: &LineContext<'_>, state: &mut ProcessingState) -> Result<Destination> {
    let mut xy: Option<(String, String)> = None;
    let mut z_values = Vec::new();
    let mut z_offsets = Vec::new();
    let mut extrusion_offsets = Vec::new();

    let limit = DESTINATION_SCAN.min(ctx.max_ahead());
    for offset in 1..=limit {
        let off = offset as isize;
        let cmd = match ctx.get_line(off).and_then(parse_command) {
            Some(cmd) if cmd.is_linear_move() => cmd,
            _ => continue,
        };
        if xy.is_some() && (cmd.x.is_some() || cmd.y.is_some()) {
            break;
        }
        if xy.is_none() {
            if let (Some(x), Some(y)) = (cmd.x.clone(), cmd.y.clone()) {
                xy = Some((x, y));
                continue;
            }
        }
        if cmd.x.is_none() && cmd.y.is_none() {
            if let Some(z) = cmd.z {
                z_values.push(z);
                z_offsets.push(off);
            } else if cmd.e.is_some() {
                extrusion_offsets.push(off);
            }
        }
    }

    if z_values.len() > 2 {
        state.warn(Warning::HeuristicSmell {
            line_number: ctx.line_number(),
            message: format!(
                "{} Z moves within {DESTINATION_SCAN} lines after a tool change",
                z_values.len()
            ),
        });
    }

    let (x, y) = xy.ok_or_else(|| {
        ProcessError::gcode(
            "no XY move found after tool change",
            ctx.line_number(),
            ctx.line(),
        )
    })?;

    Ok(Destination {
        x,
        y,
        z_values,
        z_offsets,
        extrusion_offsets,
    })
}
