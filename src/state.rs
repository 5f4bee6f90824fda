//! Per-stream processing state.
//!
//! Every piece of mutable data a transform action touches lives here and is
//! threaded through each dispatcher call; there is no module-level state.
//! The accumulators become the analysis result at finalisation, the
//! bookmarked-line handles drive the retro-patches.

use std::collections::BTreeMap;

use crate::command::GcodeCommand;
use crate::error::Warning;
use crate::meta::analysis::{
    AnalysisResult, FullAnalysis, QuickAnalysis, ANALYSIS_SCHEMA_VERSION,
};
use crate::meta::header::GcodeIdentification;
use crate::pipeline::bookmark::{BookmarkKeyAllocator, BookmarkedLine};

/// Immutable per-stream configuration flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// The target printer has independent dual X carriages.
    pub idex: bool,
    /// Stop the stream as soon as the first XY move is known.
    pub quick_inspection: bool,
    /// Accept slicer versions outside the allow-list (with a warning).
    pub allow_unsupported_slicer_versions: bool,
}

/// Callback invoked for every non-fatal finding.
pub type WarningSink = Box<dyn FnMut(&Warning) + Send>;

pub struct ProcessingState {
    pub options: StreamOptions,
    /// Set once by the identification action, read-only afterwards.
    pub identification: Option<GcodeIdentification>,
    pub keys: BookmarkKeyAllocator,

    // Handles for lines rewritten at finalisation.
    pub first_line: Option<BookmarkedLine>,
    pub start_print_line: Option<BookmarkedLine>,
    pub layer_change_line: Option<BookmarkedLine>,
    pub extruder_temp_lines: Vec<BookmarkedLine>,

    // Accumulated analysis.
    pub extruder_temps: Option<Vec<String>>,
    pub tool_change_count: u32,
    pub first_move_x: Option<f64>,
    pub first_move_y: Option<f64>,
    pub min_x: f64,
    pub max_x: f64,
    /// Tools in order of first use, no duplicates.
    pub used_tools: Vec<String>,
    pub has_purge_tower: Option<bool>,
    pub slicer_config: BTreeMap<String, String>,

    /// Scratch: the command parsed from the current line, reset per line.
    pub current_command: Option<GcodeCommand>,

    pub warnings: Vec<Warning>,
    warning_sink: Option<WarningSink>,
}

impl ProcessingState {
    pub fn new(options: StreamOptions) -> Self {
        Self {
            options,
            identification: None,
            keys: BookmarkKeyAllocator::new(),
            first_line: None,
            start_print_line: None,
            layer_change_line: None,
            extruder_temp_lines: Vec::new(),
            extruder_temps: None,
            tool_change_count: 0,
            first_move_x: None,
            first_move_y: None,
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            used_tools: Vec::new(),
            has_purge_tower: None,
            slicer_config: BTreeMap::new(),
            current_command: None,
            warnings: Vec::new(),
            warning_sink: None,
        }
    }

    pub fn with_warning_sink(mut self, sink: WarningSink) -> Self {
        self.warning_sink = Some(sink);
        self
    }

    pub fn has_warning_sink(&self) -> bool {
        self.warning_sink.is_some()
    }

    /// Record a non-fatal finding: logged, stored, forwarded to the sink.
    pub fn warn(&mut self, warning: Warning) {
        log::warn!("{warning}");
        if let Some(sink) = self.warning_sink.as_mut() {
            sink(&warning);
        }
        self.warnings.push(warning);
    }

    /// Append a tool to `used_tools`, keeping first-use order, no duplicates.
    pub fn record_tool(&mut self, tool: &str) {
        if !self.used_tools.iter().any(|t| t == tool) {
            self.used_tools.push(tool.to_string());
        }
    }

    /// Fold an X coordinate into the running extents.
    pub fn observe_x(&mut self, x: f64) {
        if x < self.min_x {
            self.min_x = x;
        }
        if x > self.max_x {
            self.max_x = x;
        }
    }

    /// Latch the first XY move. Returns true on the first observation.
    pub fn latch_first_move(&mut self, x: f64, y: f64) -> bool {
        if self.first_move_x.is_some() {
            return false;
        }
        self.first_move_x = Some(x);
        self.first_move_y = Some(y);
        true
    }

    fn slicer_config_option(&self) -> Option<BTreeMap<String, String>> {
        (!self.slicer_config.is_empty()).then(|| self.slicer_config.clone())
    }

    /// Materialise the quick analysis (used when the stream was cut short).
    pub fn to_quick_analysis(&self) -> AnalysisResult {
        AnalysisResult::Quick(QuickAnalysis {
            version: ANALYSIS_SCHEMA_VERSION,
            extruder_temps: self.extruder_temps.clone(),
            first_move_x: self.first_move_x,
            first_move_y: self.first_move_y,
            has_purge_tower: self.has_purge_tower,
            slicer_config: self.slicer_config_option(),
        })
    }

    /// Materialise the full analysis after a complete stream pass.
    pub fn to_full_analysis(&self) -> AnalysisResult {
        AnalysisResult::Full(FullAnalysis {
            version: ANALYSIS_SCHEMA_VERSION,
            extruder_temps: self.extruder_temps.clone(),
            first_move_x: self.first_move_x,
            first_move_y: self.first_move_y,
            has_purge_tower: self.has_purge_tower,
            slicer_config: self.slicer_config_option(),
            tool_change_count: self.tool_change_count,
            min_x: self.min_x.is_finite().then_some(self.min_x),
            max_x: self.max_x.is_finite().then_some(self.max_x),
            used_tools: self.used_tools.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extents_start_untouched() {
        let state = ProcessingState::new(StreamOptions::default());
        assert!(state.min_x.is_infinite() && state.min_x > 0.0);
        assert!(state.max_x.is_infinite() && state.max_x < 0.0);
        match state.to_full_analysis() {
            AnalysisResult::Full(full) => {
                assert_eq!(full.min_x, None);
                assert_eq!(full.max_x, None);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_extents_track_min_and_max() {
        let mut state = ProcessingState::new(StreamOptions::default());
        state.observe_x(50.0);
        state.observe_x(10.0);
        state.observe_x(120.0);
        assert_eq!(state.min_x, 10.0);
        assert_eq!(state.max_x, 120.0);
    }

    #[test]
    fn test_used_tools_order_and_dedup() {
        let mut state = ProcessingState::new(StreamOptions::default());
        state.record_tool("1");
        state.record_tool("0");
        state.record_tool("1");
        state.record_tool("2");
        assert_eq!(state.used_tools, vec!["1", "0", "2"]);
    }

    #[test]
    fn test_first_move_latches_once() {
        let mut state = ProcessingState::new(StreamOptions::default());
        assert!(state.latch_first_move(10.0, 20.0));
        assert!(!state.latch_first_move(99.0, 99.0));
        assert_eq!(state.first_move_x, Some(10.0));
        assert_eq!(state.first_move_y, Some(20.0));
    }

    #[test]
    fn test_warning_sink_receives_findings() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicUsize::new(0));
        let sink_count = count.clone();
        let mut state = ProcessingState::new(StreamOptions::default())
            .with_warning_sink(Box::new(move |_| {
                sink_count.fetch_add(1, Ordering::Relaxed);
            }));
        state.warn(Warning::HeuristicSmell {
            line_number: 42,
            message: "scan ended early".into(),
        });
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(state.warnings.len(), 1);
    }
}
