//! The common-commands sub-sequence: entry gate, first-move capture and
//! X-extent tracking.
//!
//! The entry action parses the current line once and stores the record on
//! the state; the inner actions work from that scratch record instead of
//! re-parsing. Lines that are not movement or tool-change commands skip the
//! whole sub-sequence.

use crate::actions::{internal, Action, Verdict};
use crate::command::{parse_command, GcodeCommand};
use crate::error::{ProcessError, Result};
use crate::pipeline::window::LineContext;
use crate::state::ProcessingState;

/// Gate for the sub-sequence: parse the line into the per-line scratch slot.
pub fn parse_command_entry() -> Action {
    Action::new("parse-command", |ctx, state| {
        state.current_command = parse_command(ctx.line());
        if state.current_command.is_some() {
            // A command line: run the inner actions, then stop the outer
            // sequence (the remaining actions only match macro/comment lines).
            Ok(Verdict::stop())
        } else {
            Ok(Verdict::proceed_skip_subsequence())
        }
    })
}

/// Fetch the scratch command; the entry action guarantees it is present.
pub(crate) fn scratch_command(state: &ProcessingState) -> Result<GcodeCommand> {
    state
        .current_command
        .clone()
        .ok_or_else(|| internal("command action reached without a parsed command"))
}

pub(crate) fn parse_coordinate(value: &str, axis: char, ctx: &LineContext<'_>) -> Result<f64> {
    value.parse::<f64>().map_err(|_| {
        ProcessError::gcode(
            format!("invalid {axis} coordinate {value:?}"),
            ctx.line_number(),
            ctx.line(),
        )
    })
}

/// Latch the coordinates of the first XY move after START_PRINT.
pub fn capture_first_move() -> Action {
    Action::new("capture-first-move", |ctx, state| {
        let command = scratch_command(state)?;
        if !command.is_linear_move() || !command.has_xy() {
            return Ok(Verdict::proceed());
        }
        let x = parse_coordinate(command.x.as_deref().unwrap_or_default(), 'X', ctx)?;
        let y = parse_coordinate(command.y.as_deref().unwrap_or_default(), 'Y', ctx)?;
        if state.latch_first_move(x, y) {
            if state.options.quick_inspection {
                // Control signal: the facade catches this to end the pass.
                return Err(ProcessError::InspectionComplete);
            }
            return Ok(Verdict::remove_and_continue());
        }
        Ok(Verdict::proceed())
    })
}

/// Track min/max X across all moves; reject arcs.
pub fn track_extents() -> Action {
    Action::new("track-extents", |ctx, state| {
        let command = scratch_command(state)?;
        if command.is_arc() {
            return Err(ProcessError::gcode(
                "arcs are not supported (G2/G3)",
                ctx.line_number(),
                ctx.line(),
            ));
        }
        if command.is_linear_move() {
            if let Some(x) = command.x.as_deref() {
                let x = parse_coordinate(x, 'X', ctx)?;
                state.observe_x(x);
            }
        }
        Ok(Verdict::proceed())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionSequence, SequenceItem};
    use crate::pipeline::encoder::BookmarkEncoder;
    use crate::pipeline::window::SlidingWindow;
    use crate::pipeline::CancellationToken;
    use crate::state::StreamOptions;

    fn sub_sequence() -> ActionSequence {
        ActionSequence::new(vec![SequenceItem::Sub {
            entry: parse_command_entry(),
            inner: vec![
                SequenceItem::Action(capture_first_move()),
                SequenceItem::Action(track_extents()),
            ],
        }])
    }

    async fn run_lines(state: &mut ProcessingState, lines: &[&str]) -> Result<()> {
        let mut sequence = sub_sequence();
        let mut window = SlidingWindow::new(2, 2);
        let mut encoder = BookmarkEncoder::new(Vec::new(), CancellationToken::new());
        let mut on_line = |mut ctx: LineContext<'_>| sequence.dispatch(&mut ctx, state);
        for line in lines {
            window
                .push(line.to_string(), &mut on_line, &mut encoder)
                .await?;
        }
        window.flush(&mut on_line, &mut encoder).await?;
        encoder.finish().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_first_move_and_extents() {
        let mut state = ProcessingState::new(StreamOptions::default());
        run_lines(
            &mut state,
            &[
                "M104 S200",
                "G1 Z0.4 F9000",
                "G1 X50 Y40 F6000",
                "G1 X10.5 E0.3",
                "G1 X180 E0.3",
            ],
        )
        .await
        .unwrap();
        assert_eq!(state.first_move_x, Some(50.0));
        assert_eq!(state.first_move_y, Some(40.0));
        assert_eq!(state.min_x, 10.5);
        assert_eq!(state.max_x, 180.0);
    }

    #[tokio::test]
    async fn test_quick_inspection_signals_completion() {
        let options = StreamOptions {
            quick_inspection: true,
            ..StreamOptions::default()
        };
        let mut state = ProcessingState::new(options);
        let err = run_lines(&mut state, &["G1 X50 Y40 F6000", "G1 X99 Y99"])
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::InspectionComplete));
        assert_eq!(state.first_move_x, Some(50.0));
        assert_eq!(state.first_move_y, Some(40.0));
    }

    #[tokio::test]
    async fn test_arc_is_a_hard_error() {
        let mut state = ProcessingState::new(StreamOptions::default());
        let err = run_lines(&mut state, &["G1 X0 Y0", "G2 X100 Y100 I10 J0 E1"])
            .await
            .unwrap_err();
        match err {
            ProcessError::Gcode {
                message,
                line_number,
                ..
            } => {
                assert!(message.contains("arcs"));
                assert_eq!(line_number, 2);
            }
            other => panic!("expected Gcode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_command_lines_skip_the_subsequence() {
        let mut state = ProcessingState::new(StreamOptions::default());
        run_lines(&mut state, &["; comment", "M204 S5000", ""])
            .await
            .unwrap();
        assert_eq!(state.first_move_x, None);
        assert!(state.min_x.is_infinite());
    }
}
