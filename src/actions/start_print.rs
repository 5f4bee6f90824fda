//! Locate the `START_PRINT` (or `RMMU_START_PRINT`) macro call.
//!
//! The macro line is the anchor for most finalisation work: tool counts,
//! first-move coordinates and X extents are appended to it as parameters
//! once the stream has ended. The line is padded and bookmarked here so
//! those parameters still fit later.
//!
//! A movement or tool-change command before the macro means the file cannot
//! be driven by the RatOS start sequence, which is a hard error.

use std::sync::OnceLock;

use regex::Regex;

use crate::actions::{Action, Verdict};
use crate::command::parse_command;
use crate::error::{ProcessError, Result};
use crate::pipeline::bookmark::BookmarkedLine;
use crate::pipeline::window::LineContext;
use crate::state::ProcessingState;

/// Spaces reserved for the parameters appended at finalisation.
const START_PRINT_PADDING: usize = 250;

fn initial_tool_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"INITIAL_TOOL=(\d+)").expect("initial-tool regex"))
}

fn other_layer_temp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"EXTRUDER_OTHER_LAYER_TEMP=([\d,]+)").expect("other-layer-temp regex")
    })
}

pub fn find_start_print() -> Action {
    Action::new("find-start-print", run)
}

fn is_start_print(line: &str) -> bool {
    for macro_name in ["START_PRINT", "RMMU_START_PRINT"] {
        let (Some(head), Some(rest)) = (
            line.get(..macro_name.len()),
            line.get(macro_name.len()..),
        ) else {
            continue;
        };
        if head.eq_ignore_ascii_case(macro_name)
            && (rest.is_empty() || rest.starts_with([' ', '\t']))
        {
            return true;
        }
    }
    false
}

fn run(ctx: &mut LineContext<'_>, state: &mut ProcessingState) -> Result<Verdict> {
    let line = ctx.line();
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with(';') {
        return Ok(Verdict::proceed());
    }

    if is_start_print(trimmed) {
        // Slicer colour variables arrive as "#RRGGBB"; the printer macros
        // cannot parse the leading '#'.
        let cleaned = line.replace('#', "");

        if let Some(captures) = initial_tool_re().captures(&cleaned) {
            state.record_tool(&captures[1]);
        }
        if let Some(captures) = other_layer_temp_re().captures(&cleaned) {
            state.extruder_temps = Some(
                captures[1]
                    .split(',')
                    .map(|temp| temp.to_string())
                    .collect(),
            );
        }

        let key = state.keys.next_key();
        ctx.set_line(cleaned.clone());
        ctx.pad(START_PRINT_PADDING);
        ctx.set_bookmark(key)?;
        state.start_print_line = Some(BookmarkedLine { text: cleaned, key });
        return Ok(Verdict::remove_and_stop());
    }

    if parse_command(line).is_some() {
        return Err(ProcessError::gcode(
            "movement or tool-change command before START_PRINT",
            ctx.line_number(),
            line,
        ));
    }

    Ok(Verdict::proceed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionSequence, SequenceItem};
    use crate::pipeline::encoder::BookmarkEncoder;
    use crate::pipeline::window::SlidingWindow;
    use crate::pipeline::CancellationToken;
    use crate::state::StreamOptions;

    async fn run_action(state: &mut ProcessingState, lines: &[&str]) -> Result<Vec<u8>> {
        let mut sequence = ActionSequence::new(vec![SequenceItem::Action(find_start_print())]);
        let mut window = SlidingWindow::new(2, 2);
        let mut encoder = BookmarkEncoder::new(Vec::new(), CancellationToken::new());
        let mut on_line = |mut ctx: LineContext<'_>| sequence.dispatch(&mut ctx, state);
        for line in lines {
            window
                .push(line.to_string(), &mut on_line, &mut encoder)
                .await?;
        }
        window.flush(&mut on_line, &mut encoder).await?;
        let (sink, _, _) = encoder.finish().await?;
        Ok(sink)
    }

    #[tokio::test]
    async fn test_finds_and_pads_start_print() {
        let mut state = ProcessingState::new(StreamOptions::default());
        let out = run_action(
            &mut state,
            &[
                "; preamble comment",
                "M104 S210",
                "START_PRINT EXTRUDER_TEMP=240 BED_TEMP=85",
            ],
        )
        .await
        .unwrap();

        let handle = state.start_print_line.as_ref().unwrap();
        assert_eq!(handle.text, "START_PRINT EXTRUDER_TEMP=240 BED_TEMP=85");

        let text = String::from_utf8(out).unwrap();
        let macro_line = text.lines().nth(2).unwrap();
        assert_eq!(macro_line.len(), handle.text.len() + START_PRINT_PADDING);
    }

    #[tokio::test]
    async fn test_captures_initial_tool_and_temps() {
        let mut state = ProcessingState::new(StreamOptions::default());
        run_action(
            &mut state,
            &["START_PRINT INITIAL_TOOL=1 EXTRUDER_OTHER_LAYER_TEMP=210,215"],
        )
        .await
        .unwrap();
        assert_eq!(state.used_tools, vec!["1"]);
        assert_eq!(
            state.extruder_temps,
            Some(vec!["210".to_string(), "215".to_string()])
        );
    }

    #[tokio::test]
    async fn test_rmmu_variant_and_case_insensitivity() {
        let mut state = ProcessingState::new(StreamOptions::default());
        run_action(&mut state, &["rmmu_start_print INITIAL_TOOL=0"])
            .await
            .unwrap();
        assert!(state.start_print_line.is_some());
    }

    #[tokio::test]
    async fn test_color_variables_are_cleaned() {
        let mut state = ProcessingState::new(StreamOptions::default());
        run_action(&mut state, &["START_PRINT COLOR=#FF0000"])
            .await
            .unwrap();
        assert_eq!(
            state.start_print_line.as_ref().unwrap().text,
            "START_PRINT COLOR=FF0000"
        );
    }

    #[tokio::test]
    async fn test_movement_before_start_print_fails() {
        let mut state = ProcessingState::new(StreamOptions::default());
        let err = run_action(&mut state, &["G1 X10 Y10"]).await.unwrap_err();
        match err {
            ProcessError::Gcode {
                line_number, line, ..
            } => {
                assert_eq!(line_number, 1);
                assert_eq!(line, "G1 X10 Y10");
            }
            other => panic!("expected Gcode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_similar_macro_names_do_not_match() {
        let mut state = ProcessingState::new(StreamOptions::default());
        run_action(&mut state, &["START_PRINT_WARMUP", "START_PRINT"])
            .await
            .unwrap();
        assert_eq!(state.start_print_line.as_ref().unwrap().text, "START_PRINT");
    }
}
