//! Transform actions and the dispatcher that runs them.
//!
//! Each input line runs through an ordered sequence of actions. An action
//! can let the sequence continue, stop it for this line, drop itself from
//! the sequence, or swap itself for another action (which is how the
//! one-shot and state-machine behaviours are built). A sub-sequence pairs a
//! gate action with an inner sequence: the gate decides per line whether
//! the inner actions run at all.
//!
//! Actions may carry a flavor filter. Until the generator is identified a
//! filtered action is never invoked; once identification is known the
//! filter is evaluated exactly once and a non-matching action is dropped
//! from the sequence for the rest of the file.

pub mod commands;
pub mod config_capture;
pub mod fixes;
pub mod identify;
pub mod start_print;
pub mod toolchange;

use semver::VersionReq;

use crate::error::{ProcessError, Result};
use crate::flavor::SlicerFlavorSet;
use crate::pipeline::window::LineContext;
use crate::state::ProcessingState;

/// Marker prepended to lines the post-processor neutralised.
pub const REMOVED_BY_POST_PROCESSOR: &str = "; Removed by RatOS post processor: ";

/// Marker appended (with the original line) to lines the post-processor
/// rewrote in place.
pub const CHANGED_BY_POST_PROCESSOR: &str = " ; Changed by RatOS post processor: ";

/// What the dispatcher does after an action returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue { skip_subsequence: bool },
    Stop { skip_subsequence: bool },
    RemoveAndContinue,
    RemoveAndStop,
}

impl Outcome {
    fn skips_subsequence(self) -> bool {
        matches!(
            self,
            Outcome::Continue {
                skip_subsequence: true
            } | Outcome::Stop {
                skip_subsequence: true
            }
        )
    }
}

/// An action's result: the outcome, plus an optional in-place replacement
/// applied before the outcome takes effect.
pub struct Verdict {
    pub outcome: Outcome,
    pub replace_with: Option<Box<Action>>,
}

impl Verdict {
    pub fn proceed() -> Self {
        Self::from(Outcome::Continue {
            skip_subsequence: false,
        })
    }

    pub fn proceed_skip_subsequence() -> Self {
        Self::from(Outcome::Continue {
            skip_subsequence: true,
        })
    }

    pub fn stop() -> Self {
        Self::from(Outcome::Stop {
            skip_subsequence: false,
        })
    }

    pub fn remove_and_continue() -> Self {
        Self::from(Outcome::RemoveAndContinue)
    }

    pub fn remove_and_stop() -> Self {
        Self::from(Outcome::RemoveAndStop)
    }

    /// Swap the current action for `action`, then apply `outcome`.
    pub fn replace(action: Action, outcome: Outcome) -> Self {
        Self {
            outcome,
            replace_with: Some(Box::new(action)),
        }
    }
}

impl From<Outcome> for Verdict {
    fn from(outcome: Outcome) -> Self {
        Self {
            outcome,
            replace_with: None,
        }
    }
}

/// Declarative gate: the action only applies to these flavors, optionally
/// narrowed to a generator version range.
#[derive(Debug, Clone)]
pub struct ActionFilter {
    pub flavors: SlicerFlavorSet,
    pub versions: Option<VersionReq>,
}

impl ActionFilter {
    pub fn flavors(flavors: SlicerFlavorSet) -> Self {
        Self {
            flavors,
            versions: None,
        }
    }

    fn matches(&self, state: &ProcessingState) -> Option<bool> {
        let identification = state.identification.as_ref()?;
        let matched = self.flavors.contains(identification.flavor)
            && self
                .versions
                .as_ref()
                .map(|req| req.matches(&identification.generator_version))
                .unwrap_or(true);
        Some(matched)
    }
}

type ActionFn = dyn FnMut(&mut LineContext<'_>, &mut ProcessingState) -> Result<Verdict> + Send;

pub struct Action {
    pub name: &'static str,
    pub filter: Option<ActionFilter>,
    run: Box<ActionFn>,
}

impl Action {
    pub fn new<F>(name: &'static str, run: F) -> Self
    where
        F: FnMut(&mut LineContext<'_>, &mut ProcessingState) -> Result<Verdict> + Send + 'static,
    {
        Self {
            name,
            filter: None,
            run: Box::new(run),
        }
    }

    pub fn filtered<F>(name: &'static str, filter: ActionFilter, run: F) -> Self
    where
        F: FnMut(&mut LineContext<'_>, &mut ProcessingState) -> Result<Verdict> + Send + 'static,
    {
        Self {
            name,
            filter: Some(filter),
            run: Box::new(run),
        }
    }

    fn invoke(
        &mut self,
        ctx: &mut LineContext<'_>,
        state: &mut ProcessingState,
    ) -> Result<Verdict> {
        log::trace!("action {} on line {}", self.name, ctx.line_number());
        (self.run)(ctx, state)
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// One entry in a sequence: a plain action or a gated sub-sequence.
#[derive(Debug)]
pub enum SequenceItem {
    Action(Action),
    Sub {
        entry: Action,
        inner: Vec<SequenceItem>,
    },
}

/// Whether the enclosing sequence keeps going after an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// How the filter disposes of an item before it runs.
enum Disposition {
    Run,
    /// Identification not yet known; leave the action in place, untouched.
    Skip,
    /// Filter evaluated and rejected; drop the action for good.
    Remove,
}

fn disposition(action: &Action, state: &ProcessingState) -> Disposition {
    match &action.filter {
        None => Disposition::Run,
        Some(filter) => match filter.matches(state) {
            None => Disposition::Skip,
            Some(true) => Disposition::Run,
            Some(false) => Disposition::Remove,
        },
    }
}

/// The ordered action sequence for one stream.
#[derive(Debug)]
pub struct ActionSequence {
    items: Vec<SequenceItem>,
}

impl ActionSequence {
    pub fn new(items: Vec<SequenceItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run the sequence for the current line.
    pub fn dispatch(
        &mut self,
        ctx: &mut LineContext<'_>,
        state: &mut ProcessingState,
    ) -> Result<()> {
        Self::dispatch_items(&mut self.items, ctx, state).map(|_| ())
    }

    fn dispatch_items(
        items: &mut Vec<SequenceItem>,
        ctx: &mut LineContext<'_>,
        state: &mut ProcessingState,
    ) -> Result<Flow> {
        let mut index = 0;
        while index < items.len() {
            let gate = match &items[index] {
                SequenceItem::Action(action) => action,
                SequenceItem::Sub { entry, .. } => entry,
            };
            match disposition(gate, state) {
                Disposition::Skip => {
                    index += 1;
                    continue;
                }
                Disposition::Remove => {
                    items.remove(index);
                    continue;
                }
                Disposition::Run => {}
            }

            let verdict = match &mut items[index] {
                SequenceItem::Action(action) => action.invoke(ctx, state)?,
                SequenceItem::Sub { entry, inner } => {
                    let verdict = entry.invoke(ctx, state)?;
                    if !verdict.outcome.skips_subsequence() {
                        Self::dispatch_items(inner, ctx, state)?;
                    }
                    verdict
                }
            };

            if let Some(replacement) = verdict.replace_with {
                match &mut items[index] {
                    SequenceItem::Action(action) => *action = *replacement,
                    SequenceItem::Sub { entry, .. } => *entry = *replacement,
                }
            }

            match verdict.outcome {
                Outcome::Continue { .. } => index += 1,
                Outcome::Stop { .. } => return Ok(Flow::Stop),
                Outcome::RemoveAndContinue => {
                    items.remove(index);
                }
                Outcome::RemoveAndStop => {
                    items.remove(index);
                    return Ok(Flow::Stop);
                }
            }
        }
        Ok(Flow::Continue)
    }
}

/// Prefix a line with the removed-by marker, exactly once.
pub(crate) fn comment_out(text: &str) -> Option<String> {
    if text.starts_with(REMOVED_BY_POST_PROCESSOR) {
        None
    } else {
        Some(format!("{REMOVED_BY_POST_PROCESSOR}{text}"))
    }
}

/// Build the dispatch sequence for one stream, in specification order.
pub fn build_sequence() -> ActionSequence {
    ActionSequence::new(vec![
        SequenceItem::Action(identify::identify_generator()),
        SequenceItem::Action(start_print::find_start_print()),
        SequenceItem::Sub {
            entry: commands::parse_command_entry(),
            inner: vec![
                SequenceItem::Action(commands::capture_first_move()),
                SequenceItem::Action(commands::track_extents()),
                SequenceItem::Action(toolchange::rewrite_toolchange()),
            ],
        },
        SequenceItem::Action(fixes::fix_other_layer_temps()),
        SequenceItem::Action(fixes::fix_orca_acceleration()),
        SequenceItem::Action(config_capture::capture_slicer_config()),
    ])
}

/// Internal-inconsistency helper for places actions must never reach.
pub(crate) fn internal(message: impl Into<String>) -> ProcessError {
    ProcessError::Internal(message.into())
}
