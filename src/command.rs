//! Minimal G-code line parser for the post-processor.
//!
//! Only the commands the transform actions care about are recognised:
//! `G0`/`G1` (collapsed to one move record), `G2`/`G3` (so they can be
//! rejected upstream) and `Tn` tool selection. Everything else, including
//! comments and empty lines, parses to `None` as cheaply as possible: the
//! overwhelming majority of input lines are movement commands, so the miss
//! path has to be branch-cheap.
//!
//! Parameter values are kept as the original text. Converting to floats and
//! back would reformat coordinates the slicer wrote, and the rewritten
//! toolshift line must splice the slicer's own text.

/// Parsed view of one recognised instruction line. Never mutated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GcodeCommand {
    /// Normalised uppercase command letter (`G` or `T`).
    pub letter: char,
    /// Short code: `"1"` for G0/G1, `"2"`/`"3"` for arcs, the tool index for `Tn`.
    pub value: String,
    pub x: Option<String>,
    pub y: Option<String>,
    pub z: Option<String>,
    pub e: Option<String>,
    pub f: Option<String>,
    pub i: Option<String>,
    pub j: Option<String>,
}

impl GcodeCommand {
    /// True for `G1` (and the collapsed `G0`) move records.
    pub fn is_linear_move(&self) -> bool {
        self.letter == 'G' && self.value == "1"
    }

    /// True for `G2`/`G3` arc records.
    pub fn is_arc(&self) -> bool {
        self.letter == 'G' && (self.value == "2" || self.value == "3")
    }

    /// True for `Tn` tool selection records.
    pub fn is_tool_change(&self) -> bool {
        self.letter == 'T'
    }

    /// True when both X and Y carry a value.
    pub fn has_xy(&self) -> bool {
        self.x.is_some() && self.y.is_some()
    }
}

/// Parse a single line (no trailing newline) into a command record.
///
/// Whitespace between parameters and parameter ordering are both accepted.
/// Text after an inline `;` is never captured as a parameter.
pub fn parse_command(line: &str) -> Option<GcodeCommand> {
    let trimmed = line.trim_start();
    let mut bytes = trimmed.bytes();

    let code = match bytes.next() {
        Some(b'G') | Some(b'g') => {
            // Only single-digit G0..G3 are interesting; G28, G90 etc. fall
            // through to the miss path on the digit check below.
            let digit = bytes.next()?;
            let terminated = matches!(bytes.next(), None | Some(b' ') | Some(b'\t') | Some(b';'));
            if !terminated {
                return None;
            }
            match digit {
                b'0' | b'1' => ('G', "1"),
                b'2' => ('G', "2"),
                b'3' => ('G', "3"),
                _ => return None,
            }
        }
        Some(b'T') | Some(b't') => {
            let index: String = trimmed[1..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if index.is_empty() {
                return None;
            }
            // Anything after the digits must be whitespace or a comment,
            // otherwise this is a macro like TIMELAPSE_TAKE_FRAME.
            let rest = &trimmed[1 + index.len()..];
            if !rest.is_empty() && !rest.starts_with([' ', '\t', ';']) {
                return None;
            }
            let mut command = GcodeCommand {
                letter: 'T',
                value: index,
                ..GcodeCommand::default()
            };
            capture_parameters(rest, &mut command);
            return Some(command);
        }
        _ => return None,
    };

    let mut command = GcodeCommand {
        letter: code.0,
        value: code.1.to_string(),
        ..GcodeCommand::default()
    };
    capture_parameters(&trimmed[2..], &mut command);
    Some(command)
}

/// Capture `X.. Y.. Z.. E.. F.. I.. J..` words from the remainder of a line.
fn capture_parameters(rest: &str, command: &mut GcodeCommand) {
    for word in rest.split_ascii_whitespace() {
        if word.starts_with(';') {
            break;
        }
        // A parameter glued to an inline comment ("X10;note") ends at the ';'.
        let word = match word.find(';') {
            Some(pos) => {
                capture_word(&word[..pos], command);
                break;
            }
            None => word,
        };
        capture_word(word, command);
    }
}

fn capture_word(word: &str, command: &mut GcodeCommand) {
    let mut chars = word.chars();
    let letter = match chars.next() {
        Some(c) => c.to_ascii_uppercase(),
        None => return,
    };
    let value = chars.as_str();
    if value.is_empty() {
        return;
    }
    let slot = match letter {
        'X' => &mut command.x,
        'Y' => &mut command.y,
        'Z' => &mut command.z,
        'E' => &mut command.e,
        'F' => &mut command.f,
        'I' => &mut command.i,
        'J' => &mut command.j,
        _ => return,
    };
    if slot.is_none() {
        *slot = Some(value.to_string());
    }
}
