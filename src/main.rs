//! The `postprocess` binary.
//!
//! Interactive mode prints a human-readable summary; `--non-interactive`
//! emits newline-delimited JSON records for the printer host:
//! `{"result": "progress" | "warning" | "error" | "success" | "waiting", ...}`.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;

use ratos_postprocess::error::ProcessError;
use ratos_postprocess::file::{
    GcodeFile, InspectOptions, Printability, ProcessOptions, ProcessOutcome,
};
use ratos_postprocess::meta::analysis::AnalysisResult;
use ratos_postprocess::meta::header::GcodeIdentification;

/// Post-process sliced G-code for RatOS printers
#[derive(Debug, Parser)]
#[command(name = "postprocess")]
#[command(about = "Analyze and transform sliced G-code for RatOS printers")]
#[command(version)]
struct Args {
    /// Emit newline-delimited JSON records instead of human-readable output
    #[arg(long)]
    non_interactive: bool,

    /// Process for an IDEX printer (rewrite tool changes into toolshifts)
    #[arg(short = 'i', long)]
    idex: bool,

    /// Overwrite the output file if it already exists
    #[arg(short = 'o', long)]
    overwrite: bool,

    /// Rewrite the input file in place
    #[arg(short = 'O', long)]
    overwrite_input: bool,

    /// Accept slicer versions outside the supported list
    #[arg(short = 'a', long)]
    allow_unsupported_slicer_versions: bool,

    /// Inspect files from unrecognised generators instead of failing
    #[arg(short = 'u', long)]
    allow_unknown_generator: bool,

    /// The sliced G-code file to process
    input: PathBuf,

    /// Where to write the processed file (defaults to in-place with -O)
    output: Option<PathBuf>,
}

#[derive(Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
enum CliRecord {
    Progress { payload: ProgressPayload },
    Warning { warning: String },
    Error { error: String },
    Success { payload: SuccessPayload },
    Waiting { payload: WaitingPayload },
}

#[derive(Serialize)]
struct ProgressPayload {
    percentage: u32,
    /// Estimated seconds remaining.
    eta: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WaitingPayload {
    waiting_for: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SuccessPayload {
    was_already_processed: bool,
    gcode_info: GcodeInfo,
    used_tools: Vec<String>,
    tool_change_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<AnalysisResult>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GcodeInfo {
    generator: String,
    generator_version: String,
    flavor: String,
}

fn emit(record: &CliRecord) {
    match serde_json::to_string(record) {
        Ok(json) => println!("{json}"),
        Err(e) => log::error!("failed to serialise CLI record: {e}"),
    }
}

fn gcode_info(identification: &GcodeIdentification) -> GcodeInfo {
    GcodeInfo {
        generator: identification.generator.clone(),
        generator_version: identification.generator_version.to_string(),
        flavor: identification.flavor.to_string(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    let non_interactive = args.non_interactive;

    match run(args).await {
        Ok(()) => {}
        Err(e) => {
            if non_interactive {
                emit(&CliRecord::Error {
                    error: format!("{e:#}"),
                });
            } else {
                eprintln!("Error: {e:#}");
            }
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let inspect_options = InspectOptions {
        idex: args.idex,
        allow_unsupported_slicer_versions: args.allow_unsupported_slicer_versions,
        allow_unknown_generator: args.allow_unknown_generator,
    };
    let file = GcodeFile::inspect(&args.input, &inspect_options)
        .await
        .with_context(|| format!("could not inspect {}", args.input.display()))?;

    if file.printability == Printability::Unknown {
        // Unknown generator, allowed through: nothing to transform, the
        // host prints the file as-is.
        report_unknown(args.non_interactive);
        return Ok(());
    }

    let (output, in_place) = resolve_output(&args)?;
    let overwrite = confirm_overwrite(&args, &output)?;

    let total_bytes = file.size.max(1);
    let started = Instant::now();
    let non_interactive = args.non_interactive;

    let mut options = ProcessOptions {
        idex: args.idex,
        allow_unsupported_slicer_versions: args.allow_unsupported_slicer_versions,
        quick: false,
        overwrite,
        ..ProcessOptions::default()
    };
    if non_interactive {
        options.on_warning = Some(Box::new(|warning| {
            emit(&CliRecord::Warning {
                warning: warning.to_string(),
            });
        }));
        options.on_progress = Some(Box::new(move |consumed| {
            let fraction = (consumed as f64 / total_bytes as f64).clamp(0.0, 1.0);
            let elapsed = started.elapsed().as_secs_f64();
            let eta = if fraction > 0.0 {
                (elapsed * (1.0 - fraction) / fraction).round() as u64
            } else {
                0
            };
            emit(&CliRecord::Progress {
                payload: ProgressPayload {
                    percentage: (fraction * 100.0).round() as u32,
                    eta,
                },
            });
        }));
    }

    match file.transform(&output, options).await {
        Ok(outcome) => {
            if in_place {
                tokio::fs::rename(&output, &args.input)
                    .await
                    .context("could not move the processed file over the input")?;
            }
            report_success(non_interactive, &outcome);
            Ok(())
        }
        Err(ProcessError::AlreadyProcessed(identification)) => {
            // Not a failure: the file can be printed as-is (or the host
            // re-inspects it for an exact printability verdict).
            let _ = tokio::fs::remove_file(&output).await;
            report_already_processed(non_interactive, &identification);
            Ok(())
        }
        Err(e) => {
            if in_place {
                let _ = tokio::fs::remove_file(&output).await;
            }
            Err(e).with_context(|| format!("could not process {}", args.input.display()))
        }
    }
}

/// Pick the output path: explicit argument, or a sibling temp file that
/// replaces the input on success.
fn resolve_output(args: &Args) -> Result<(PathBuf, bool)> {
    if let Some(output) = &args.output {
        if args.overwrite_input {
            bail!("--overwrite-input and an explicit output path are mutually exclusive");
        }
        return Ok((output.clone(), false));
    }
    if args.overwrite_input {
        let mut name = args
            .input
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".ratos-tmp");
        return Ok((args.input.with_file_name(name), true));
    }
    bail!("specify an output path or pass --overwrite-input");
}

/// Enforce the overwrite rules, asking the user when a terminal is attached.
fn confirm_overwrite(args: &Args, output: &Path) -> Result<bool> {
    if args.overwrite || args.overwrite_input || !output.exists() {
        // The in-place temp file is always ours to clobber.
        return Ok(args.overwrite || args.overwrite_input);
    }
    if args.non_interactive {
        emit(&CliRecord::Waiting {
            payload: WaitingPayload {
                waiting_for: "overwrite confirmation".into(),
            },
        });
        return Err(ProcessError::OutputExists(output.to_path_buf()).into());
    }
    print!("{} already exists. Overwrite? [y/N] ", output.display());
    std::io::stdout().flush().ok();
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    if answer.trim().eq_ignore_ascii_case("y") {
        Ok(true)
    } else {
        Err(ProcessError::OutputExists(output.to_path_buf()).into())
    }
}

fn report_success(non_interactive: bool, outcome: &ProcessOutcome) {
    if non_interactive {
        emit(&CliRecord::Success {
            payload: SuccessPayload {
                was_already_processed: false,
                gcode_info: gcode_info(&outcome.identification),
                used_tools: outcome.analysis.used_tools().to_vec(),
                tool_change_count: outcome.analysis.tool_change_count(),
                analysis: Some(outcome.analysis.clone()),
            },
        });
        return;
    }
    let ident = &outcome.identification;
    println!("Slicer: {} v{}", ident.generator, ident.generator_version);
    let tools: Vec<String> = outcome
        .analysis
        .used_tools()
        .iter()
        .map(|t| format!("T{t}"))
        .collect();
    println!("Used tools: {}", tools.join(", "));
    println!(
        "Toolshifts: {}",
        outcome.analysis.tool_change_count().saturating_sub(1)
    );
}

fn report_unknown(non_interactive: bool) {
    if non_interactive {
        emit(&CliRecord::Success {
            payload: SuccessPayload {
                was_already_processed: false,
                gcode_info: GcodeInfo {
                    generator: "unknown".into(),
                    generator_version: String::new(),
                    flavor: "unknown slicer".into(),
                },
                used_tools: Vec::new(),
                tool_change_count: 0,
                analysis: None,
            },
        });
    } else {
        println!("Unknown generator; file left untouched.");
    }
}

fn report_already_processed(non_interactive: bool, identification: &GcodeIdentification) {
    if non_interactive {
        emit(&CliRecord::Success {
            payload: SuccessPayload {
                was_already_processed: true,
                gcode_info: gcode_info(identification),
                used_tools: Vec::new(),
                tool_change_count: 0,
                analysis: identification.analysis.clone(),
            },
        });
    } else {
        println!("File already processed, continuing...");
    }
}
