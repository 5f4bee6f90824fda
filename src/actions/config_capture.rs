//! Capture the slicer's settings dump from the file footer.
//!
//! All three supported slicers append their full configuration as comment
//! lines between a begin and an end marker. The finder action watches for
//! the begin marker and then replaces itself with the capturing action,
//! which stores every `; key = value` pair until the end marker arrives.

use std::sync::OnceLock;

use regex::Regex;

use crate::actions::{Action, Outcome, Verdict};
use crate::error::Result;
use crate::pipeline::window::LineContext;
use crate::state::ProcessingState;

const BEGIN_MARKERS: [&str; 3] = [
    "; prusaslicer_config = begin",
    "; CONFIG_BLOCK_START",
    "; SuperSlicer_config = begin",
];

const END_MARKERS: [&str; 3] = [
    "; prusaslicer_config = end",
    "; CONFIG_BLOCK_END",
    "; SuperSlicer_config = end",
];

fn config_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^; (\S+)\s=\s(.+)$").expect("config-line regex"))
}

pub fn capture_slicer_config() -> Action {
    Action::new("find-config-section", run_find)
}

fn run_find(ctx: &mut LineContext<'_>, _state: &mut ProcessingState) -> Result<Verdict> {
    let line = ctx.line().trim_end();
    if BEGIN_MARKERS.iter().any(|marker| line == *marker) {
        return Ok(Verdict::replace(
            Action::new("capture-config", run_capture),
            Outcome::Stop {
                skip_subsequence: false,
            },
        ));
    }
    Ok(Verdict::proceed())
}

fn run_capture(ctx: &mut LineContext<'_>, state: &mut ProcessingState) -> Result<Verdict> {
    let line = ctx.line().trim_end();
    if END_MARKERS.iter().any(|marker| line == *marker) {
        return Ok(Verdict::remove_and_stop());
    }
    if let Some(captures) = config_line_re().captures(line) {
        state
            .slicer_config
            .insert(captures[1].to_string(), captures[2].to_string());
        return Ok(Verdict::stop());
    }
    Ok(Verdict::proceed())
}
