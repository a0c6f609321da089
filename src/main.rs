mod aggregate;
mod callsite;
mod descriptor;
mod engine;
mod error;
mod ir;
mod knowledge;
mod opcodes;
mod permission;
mod policy;
mod reader;
mod report;
mod scan;
mod telemetry;
#[cfg(test)]
mod test_harness;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::knowledge::KnowledgeBase;
use crate::report::{OutputFormat, ReportOptions, write_report};
use crate::scan::{Artifact, Scope};
use crate::telemetry::{Phase, Telemetry, current_trace_id, init_logging, traced};

/// CLI arguments for policyextractor execution.
#[derive(Parser, Debug)]
#[command(
    name = "policyextractor",
    about = "Infer the Java security policy grants a project and its dependencies need, from bytecode.",
    version
)]
struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        help = "The project's compiled output: JAR/WAR, classes directory or class file. Accepts @file."
    )]
    project: Option<String>,
    #[arg(
        long,
        value_name = "PATH",
        num_args = 1..,
        help = "Dependency archives. Use @file to read paths (one per line)."
    )]
    dependency: Vec<String>,
    #[arg(
        long,
        value_name = "PATH",
        num_args = 1..,
        help = "Test-scoped dependency archives; never part of the project policy. Accepts @file."
    )]
    test_dependency: Vec<String>,
    #[arg(long, help = "Also scan test-scoped dependencies and list them per module.")]
    include_test_dependencies: bool,
    #[arg(
        long,
        value_name = "PATH",
        num_args = 1..,
        help = "Extra knowledge base JSON files; their entries replace built-in ones with the same key."
    )]
    knowledge_base: Vec<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Policy)]
    format: OutputFormat,
    #[arg(long, help = "Emit one grant block per module before the project block.")]
    per_module: bool,
    #[arg(
        long,
        value_name = "URL",
        help = "Source cross-reference base URL used to link project findings."
    )]
    xref: Option<String>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long, value_name = "N", help = "Worker threads (defaults to available parallelism).")]
    jobs: Option<usize>,
    #[arg(
        long,
        value_name = "URL",
        help = "OTLP HTTP collector URL (recommended: http://localhost:4318/)."
    )]
    otel: Option<String>,
    #[arg(long)]
    timing: bool,
}

/// Inputs after resolving @file references.
#[derive(Debug)]
struct ExpandedInputs {
    project: Option<Artifact>,
    dependencies: Vec<Artifact>,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            std::process::ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let inputs = expand_inputs(&cli)?;
    if let Some(jobs) = cli.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
            .context("failed to configure worker threads")?;
    }
    let telemetry = match &cli.otel {
        Some(url) => Some(Arc::new(Telemetry::connect(url)?)),
        None => None,
    };
    init_logging();

    let run_phase = Phase::Run {
        modules: inputs.dependencies.len() + usize::from(inputs.project.is_some()),
        include_test: cli.include_test_dependencies,
    };
    let result = traced(
        telemetry.as_deref(),
        run_phase,
        || -> Result<()> {
            if let Some(trace_id) = current_trace_id() {
                eprintln!("trace-id={trace_id}");
            }
            let builtin = KnowledgeBase::builtin()?;
            let extended;
            let knowledge = if cli.knowledge_base.is_empty() {
                builtin
            } else {
                extended = builtin.extended(cli.knowledge_base.as_slice())?;
                &extended
            };
            debug!(entries = knowledge.len(), "knowledge base loaded");

            let engine = Engine::new(knowledge).with_telemetry(telemetry.clone());
            let scan_started_at = Instant::now();
            let report = engine.examine_project(
                inputs.project.as_ref(),
                &inputs.dependencies,
                cli.include_test_dependencies,
            );
            let scan_duration_ms = scan_started_at.elapsed().as_millis();
            if report.policy.is_empty() {
                debug!("no security-sensitive calls found");
            }

            let options = ReportOptions {
                format: cli.format,
                per_module: cli.per_module,
                xref: cli.xref.clone(),
            };
            let report_started_at = Instant::now();
            traced(
                telemetry.as_deref(),
                Phase::Report(options.format),
                || -> Result<()> {
                    let mut writer = output_writer(cli.output.as_deref())?;
                    write_report(&mut writer, &report, &options)?;
                    writer.flush().context("failed to flush output")
                },
            )?;
            if cli.timing {
                info!(
                    scan_ms = scan_duration_ms as u64,
                    report_ms = report_started_at.elapsed().as_millis() as u64,
                    classes = report.class_count,
                    modules = report.modules.len(),
                    diagnostics = report.diagnostics.len(),
                    "timing"
                );
            }
            Ok(())
        },
    );

    if let Some(telemetry) = telemetry {
        if let Err(err) = telemetry.shutdown() {
            error!("telemetry shutdown failed: {err}");
        }
    }
    result
}

fn expand_inputs(cli: &Cli) -> Result<ExpandedInputs> {
    let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let project = match &cli.project {
        Some(arg) => {
            let paths = expand_path_args(std::slice::from_ref(arg), &base_dir)
                .context("failed to expand --project argument")?;
            let paths = require_existing("project", paths)?;
            match paths.as_slice() {
                [path] => Some(Artifact::new(path, Scope::Project)),
                _ => anyhow::bail!("--project must name exactly one path"),
            }
        }
        None => None,
    };

    let mut dependencies = Vec::new();
    let compile = expand_path_args(&cli.dependency, &base_dir)
        .context("failed to expand --dependency arguments")?;
    for path in require_existing("dependency", compile)? {
        dependencies.push(Artifact::new(path, Scope::Compile));
    }
    let test = expand_path_args(&cli.test_dependency, &base_dir)
        .context("failed to expand --test-dependency arguments")?;
    for path in require_existing("test dependency", test)? {
        dependencies.push(Artifact::new(path, Scope::Test));
    }

    if project.is_none() && dependencies.is_empty() {
        anyhow::bail!("no input paths provided; use --project, --dependency or --test-dependency");
    }
    Ok(ExpandedInputs {
        project,
        dependencies,
    })
}

fn expand_path_args(args: &[String], base_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut expanded = Vec::new();
    let mut stack = Vec::new();
    for arg in args {
        expanded.extend(expand_path_arg(arg, base_dir, &mut stack)?);
    }
    Ok(expanded)
}

fn expand_path_arg(arg: &str, base_dir: &Path, stack: &mut Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let Some(path_str) = arg.strip_prefix('@') else {
        return Ok(vec![PathBuf::from(arg)]);
    };
    if path_str.is_empty() {
        anyhow::bail!("empty @file reference");
    }
    let file_path = PathBuf::from(path_str);
    let resolved = if file_path.is_absolute() {
        file_path
    } else {
        base_dir.join(file_path)
    };
    let canonical = resolved
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", resolved.display()))?;
    if stack.contains(&canonical) {
        anyhow::bail!("circular @file reference: {}", canonical.display());
    }
    let content = fs::read_to_string(&canonical)
        .with_context(|| format!("failed to read {}", canonical.display()))?;
    stack.push(canonical.clone());
    let file_dir = canonical.parent().unwrap_or_else(|| Path::new(""));
    let mut paths = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('@') {
            paths.extend(expand_path_arg(line, file_dir, stack)?);
            continue;
        }
        let entry = PathBuf::from(line);
        paths.push(if entry.is_absolute() {
            entry
        } else {
            file_dir.join(entry)
        });
    }
    stack.pop();
    Ok(paths)
}

fn require_existing(label: &str, paths: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    for path in &paths {
        if !path.exists() {
            anyhow::bail!("{label} not found: {}", path.display());
        }
    }
    Ok(paths)
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(File::create(path).with_context(|| {
            format!("failed to open {}", path.display())
        })?)),
        None => Ok(Box::new(io::stdout())),
    }
}
