//! `sqlguard` command-line entry point.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use sqlguard_core::{
    check_sql, validate, AdapterConfig, AdapterVerdict, ConstraintValidator, GuardError, GuardFile,
    GuardSpec, ValidatorKind,
};
use sqlguard_runtime::{
    merge_summaries, write_json, BatchReport, BatchRunner, DecodeConfig, DecodeController,
    DecodeScript, RuntimeError,
};

/// Exit status for a run aborted by the external adapter's environment.
const EXIT_ADAPTER_FATAL: u8 = 3;

#[derive(Parser)]
#[command(name = "sqlguard", about = "Keep generated SQL grammatical, one fragment at a time")]
struct Cli {
    /// Print debug diagnostics
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Judge SQL text, whole or fragment by fragment
    Check {
        /// Whole text to judge
        #[arg(long, required_unless_present = "fragment", conflicts_with = "fragment")]
        sql: Option<String>,

        /// Fragments fed in order (repeatable)
        #[arg(long)]
        fragment: Vec<String>,

        #[command(flatten)]
        guard: GuardArgs,
    },

    /// External checker contract: exit 0 valid, 1 invalid, 2 environment error
    CheckSql {
        #[arg(long)]
        sql: String,

        /// Root directory of the external tool
        #[arg(long)]
        root: PathBuf,
    },

    /// Decode one scripted prompt and write its run record
    Decode {
        /// Decode script (YAML)
        #[arg(long)]
        script: PathBuf,

        #[arg(long, default_value_t = 0)]
        prompt_index: usize,

        #[arg(long, value_enum, default_value_t = ModeArg::Guarded)]
        constraint: ModeArg,

        #[arg(long, default_value_t = 1)]
        top_k: usize,

        #[arg(long, default_value_t = 64)]
        max_new_tokens: usize,

        /// Cache probe outcomes (entries)
        #[arg(long)]
        probe_cache: Option<u64>,

        #[command(flatten)]
        guard: GuardArgs,

        #[arg(long)]
        out: PathBuf,
    },

    /// Decode every scripted prompt unconstrained and guarded
    Batch {
        #[arg(long)]
        script: PathBuf,

        #[arg(long, default_value_t = 1)]
        top_k: usize,

        #[arg(long, default_value_t = 64)]
        max_new_tokens: usize,

        /// Overrides the script's batch.concurrency
        #[arg(long)]
        concurrency: Option<usize>,

        /// Overrides the script's batch.run_timeout (e.g. "30s")
        #[arg(long, value_parser = humantime::parse_duration)]
        run_timeout: Option<Duration>,

        #[arg(long)]
        probe_cache: Option<u64>,

        #[command(flatten)]
        guard: GuardArgs,

        #[arg(long)]
        out: PathBuf,
    },

    /// Merge batch reports into one table keyed by label
    Summarize {
        /// `label=path` pairs, e.g. `top_k=1=results/batch_k1.json`
        #[arg(long = "input", required = true, value_parser = parse_labeled_path)]
        inputs: Vec<(String, PathBuf)>,

        #[arg(long)]
        out: PathBuf,
    },

    /// Replay the built-in good and bad fragment sequences
    Toy {
        /// Guard config file (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "results/toy_sqlguard.json")]
        out: PathBuf,
    },
}

#[derive(Args)]
struct GuardArgs {
    /// Guard config file (YAML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ValidatorArg::Grammar)]
    validator: ValidatorArg,

    /// External tool root; enables the external validator without a config
    #[arg(long)]
    adapter_root: Option<PathBuf>,

    /// Run the external checker as a `sqlguard check-sql` subprocess per probe
    #[arg(long)]
    adapter_subprocess: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    None,
    Guarded,
}

#[derive(Clone, Copy, ValueEnum)]
enum ValidatorArg {
    Grammar,
    External,
}

impl From<ValidatorArg> for ValidatorKind {
    fn from(arg: ValidatorArg) -> Self {
        match arg {
            ValidatorArg::Grammar => ValidatorKind::Grammar,
            ValidatorArg::External => ValidatorKind::External,
        }
    }
}

impl GuardArgs {
    fn spec(&self) -> Result<GuardSpec> {
        let file = match &self.config {
            Some(path) => GuardFile::from_file(path)
                .with_context(|| format!("loading guard config {}", path.display()))?,
            None => GuardFile::default(),
        };

        let kind = ValidatorKind::from(self.validator);
        if kind == ValidatorKind::Grammar {
            return Ok(file.guard_spec(kind)?);
        }

        let mut adapter = match (&self.adapter_root, file.adapter) {
            (Some(root), Some(mut adapter)) => {
                adapter.root = root.clone();
                adapter
            }
            (Some(root), None) => AdapterConfig::in_process(root.clone()),
            (None, Some(adapter)) => adapter,
            (None, None) => bail!("external validator needs --adapter-root or an adapter config"),
        };

        if self.adapter_subprocess {
            let exe = std::env::current_exe().context("locating the sqlguard executable")?;
            adapter = AdapterConfig::subprocess(adapter.root, exe, vec!["check-sql".to_string()]);
        }

        Ok(GuardSpec::External(adapter))
    }
}

fn parse_labeled_path(raw: &str) -> Result<(String, PathBuf), String> {
    let (label, path) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected label=path, got {raw:?}"))?;
    if label.is_empty() || path.is_empty() {
        return Err(format!("expected label=path, got {raw:?}"));
    }
    Ok((label.to_string(), PathBuf::from(path)))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if is_adapter_fatal(&err) {
                ExitCode::from(EXIT_ADAPTER_FATAL)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_adapter_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<RuntimeError>()
            .is_some_and(RuntimeError::is_adapter_fatal)
            || matches!(cause.downcast_ref::<GuardError>(), Some(GuardError::Environment(_)))
    })
}

async fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Check {
            sql,
            fragment,
            guard,
        } => {
            let spec = guard.spec()?;

            let outcomes = match sql {
                Some(sql) => vec![validate(&spec, &sql)?],
                None => {
                    let mut validator = spec.build()?;
                    validator.reset();
                    let mut outcomes = Vec::with_capacity(fragment.len());
                    for piece in &fragment {
                        outcomes.push(validator.step(piece)?);
                    }
                    outcomes
                }
            };

            println!("{}", serde_json::to_string_pretty(&outcomes)?);
            Ok(ExitCode::SUCCESS)
        }

        Command::CheckSql { sql, root } => {
            let verdict = check_sql(&sql, &root);
            if verdict == AdapterVerdict::EnvironmentError {
                eprintln!("[ERR] root not found: {}", root.display());
            }
            Ok(ExitCode::from(verdict.exit_code() as u8))
        }

        Command::Decode {
            script,
            prompt_index,
            constraint,
            top_k,
            max_new_tokens,
            probe_cache,
            guard,
            out,
        } => {
            let script = load_script(&script)?;
            let prompt = script
                .prompts
                .get(prompt_index)
                .map(|p| p.prompt.clone())
                .with_context(|| format!("script has no prompt #{prompt_index}"))?;

            let mut config = match constraint {
                ModeArg::None => DecodeConfig::unconstrained(max_new_tokens, top_k),
                ModeArg::Guarded => DecodeConfig::guarded(guard.spec()?, max_new_tokens, top_k),
            };
            config.probe_cache_capacity = probe_cache;

            let source = script.source_for(prompt_index)?;
            let run = DecodeController::new(source, config).run(&prompt).await?;

            run.record.write_json(&out)?;
            tracing::info!(
                halt = ?run.record.halt_reason,
                accepted = run.record.accepted_tokens,
                rejected = run.record.rejected_tokens,
                "decode finished"
            );
            println!("[OK] wrote {}", out.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Batch {
            script,
            top_k,
            max_new_tokens,
            concurrency,
            run_timeout,
            probe_cache,
            guard,
            out,
        } => {
            let script = load_script(&script)?;

            let mut batch = script.batch.clone();
            if let Some(concurrency) = concurrency {
                batch.concurrency = concurrency;
            }
            if run_timeout.is_some() {
                batch.run_timeout = run_timeout;
            }

            let mut runner =
                BatchRunner::new(guard.spec()?, max_new_tokens, top_k).with_batch_config(batch);
            if let Some(capacity) = probe_cache {
                runner = runner.with_probe_cache(capacity);
            }

            let report = runner
                .run(&script.prompt_texts(), |i| script.source_for(i))
                .await?;

            report.write_json(&out)?;
            tracing::info!(prompts = report.per_prompt.len(), "batch finished");
            println!("[OK] wrote {}", out.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Summarize { inputs, out } => {
            let mut reports = Vec::with_capacity(inputs.len());
            for (label, path) in inputs {
                let report = BatchReport::from_json_file(&path)
                    .with_context(|| format!("reading batch report {}", path.display()))?;
                reports.push((label, report));
            }

            let merged = merge_summaries(reports.iter().map(|(label, r)| (label.as_str(), r)));
            write_json(&merged, &out)?;
            println!("[OK] wrote {}", out.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Toy { config, out } => {
            let file = match config {
                Some(path) => GuardFile::from_file(&path)
                    .with_context(|| format!("loading guard config {}", path.display()))?,
                None => GuardFile::default(),
            };

            let comparison = sqlguard_runtime::toy::compare(&file.guard)?;
            write_json(&comparison, &out)?;
            println!("[OK] wrote {}", out.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_script(path: &Path) -> Result<DecodeScript> {
    DecodeScript::from_yaml_file(path)
        .with_context(|| format!("loading decode script {}", path.display()))
}
