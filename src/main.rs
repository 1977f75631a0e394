//! dfasim CLI entrypoint.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use dfasim::{
    BatchOptions, Config, ExitStatus, PolicyKind, RecordCollisionPolicy, Reporter, RunOptions,
    ScenarioPath, TracePath,
};

#[derive(Debug, Parser)]
#[command(name = "dfasim")]
#[command(about = "turn-based Red/Blue host-state simulation driven by declarative scenarios")]
struct Cli {
    /// Path to config file. Missing configs are treated as "defaults".
    #[arg(long, global = true, default_value = dfasim::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Working directory for execution.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    /// Machine-readable output to stdout (JSON).
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write dfasim.toml and an example scenario
    Init {
        #[arg(long)]
        force: bool,
    },

    /// Run one episode of a scenario
    Run {
        scenario: PathBuf,

        /// Policy driving the Red agent.
        #[arg(long, default_value = "dfa")]
        red: PolicyKind,

        /// Policy driving the Blue agent.
        #[arg(long, default_value = "dfa")]
        blue: PolicyKind,

        /// Seed for random policies.
        #[arg(long)]
        seed: Option<u64>,

        /// Step budget (overrides the config file).
        #[arg(long)]
        max_steps: Option<u64>,

        #[arg(long)]
        reporter: Option<Reporter>,

        /// Also write the trace to this path.
        #[arg(long)]
        record: Option<PathBuf>,

        #[arg(long)]
        record_collision: Option<RecordCollisionPolicy>,
    },

    /// Run one episode per matching scenario file
    Batch {
        /// Glob patterns for scenario files (default: scenarios/**/*.{yaml,yml,json}).
        globs: Vec<String>,

        #[arg(long, default_value_t = 1)]
        jobs: usize,

        #[arg(long, default_value = "dfa")]
        red: PolicyKind,

        #[arg(long, default_value = "dfa")]
        blue: PolicyKind,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        max_steps: Option<u64>,

        #[arg(long)]
        reporter: Option<Reporter>,
    },

    /// Re-execute a recorded trace and check it still matches
    Replay {
        trace: PathBuf,

        #[arg(long)]
        reporter: Option<Reporter>,
    },

    /// Load and validate a scenario without running it
    Validate { scenario: PathBuf },

    /// List available agent policies
    Agents,

    /// Print version info
    Version,

    /// Print platform and build info
    Env,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(&cli.log) {
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    if let Some(cwd) = &cli.cwd
        && let Err(err) = std::env::set_current_dir(cwd)
    {
        return print_error_and_exit(
            &cli,
            anyhow::anyhow!(err).context(format!("failed to set cwd to {}", cwd.display())),
        );
    }

    let config = Config::load_optional(&cli.config);

    match run_command(&cli, &config) {
        Ok(code) => code,
        Err(err) => print_error_and_exit(&cli, err),
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))?;
    Ok(())
}

fn run_command(cli: &Cli, config: &Config) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Command::Init { force } => {
            let root = std::env::current_dir()?;
            let written = dfasim::init_project(config, &root, *force)?;
            if cli.json {
                print_json(&written)?;
            } else {
                for path in written {
                    println!("wrote {}", path.display());
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Run {
            scenario,
            red,
            blue,
            seed,
            max_steps,
            reporter,
            record,
            record_collision,
        } => {
            let summary = dfasim::run_episode(
                config,
                ScenarioPath::new(scenario.clone()),
                &RunOptions {
                    red: *red,
                    blue: *blue,
                    seed: *seed,
                    max_steps: *max_steps,
                    record_trace_to: record.clone(),
                    record_collision: record_collision.unwrap_or(config.record_collision),
                },
            )?;
            if wants_json(cli, *reporter, config) {
                print_json(&summary)?;
            } else {
                println!("{}", summary.pretty());
            }
            Ok(exit_code_for_status(summary.status))
        }

        Command::Batch {
            globs,
            jobs,
            red,
            blue,
            seed,
            max_steps,
            reporter,
        } => {
            let root = std::env::current_dir()?;
            let summary = dfasim::run_batch(
                config,
                globs,
                &BatchOptions {
                    run: RunOptions {
                        red: *red,
                        blue: *blue,
                        seed: *seed,
                        max_steps: *max_steps,
                        record_trace_to: None,
                        record_collision: config.record_collision,
                    },
                    jobs: *jobs,
                    root,
                },
            )?;
            if wants_json(cli, *reporter, config) {
                print_json(&summary)?;
            } else {
                println!("{}", summary.pretty());
            }
            Ok(exit_code_for_status(summary.status))
        }

        Command::Replay { trace, reporter } => {
            let summary = dfasim::replay_trace(config, TracePath::new(trace.clone()))?;
            if wants_json(cli, *reporter, config) {
                print_json(&summary)?;
            } else {
                println!("{}", summary.pretty());
            }
            Ok(exit_code_for_status(summary.status))
        }

        Command::Validate { scenario } => {
            let report = dfasim::validate_scenario(&ScenarioPath::new(scenario.clone()))?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "ok {} hosts={} states={} agents={}",
                    report.name,
                    report.hosts.len(),
                    report.states.len(),
                    report
                        .agents
                        .iter()
                        .map(|a| a.name())
                        .collect::<Vec<_>>()
                        .join(",")
                );
                for warning in &report.warnings {
                    println!("warning: {warning}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Agents => {
            let catalog = dfasim::policy_catalog();
            if cli.json {
                print_json(&catalog)?;
            } else {
                for entry in catalog {
                    println!("{:<10} {}", entry.name, entry.description);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Version => {
            let info = dfasim::version_info();
            if cli.json {
                print_json(&info)?;
            } else {
                println!("dfasim {}", info.version);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Env => {
            let info = dfasim::env_info();
            if cli.json {
                print_json(&info)?;
            } else {
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn wants_json(cli: &Cli, reporter: Option<Reporter>, config: &Config) -> bool {
    cli.json || matches!(reporter.unwrap_or(config.reporter), Reporter::Json)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_error_and_exit(cli: &Cli, err: anyhow::Error) -> ExitCode {
    let msg = format!("{err:#}");
    if cli.json {
        let out = serde_json::json!({
            "status": "error",
            "code": "error",
            "message": msg,
        });
        println!("{out}");
    } else {
        eprintln!("{msg}");
    }
    ExitCode::from(ExitStatus::Error.code())
}

fn exit_code_for_status(status: ExitStatus) -> ExitCode {
    ExitCode::from(status.code())
}
