use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use sandpit::analysis::{AnalysisKind, AnalysisRequest, PlotKind};
use sandpit::session::BackgroundSweeper;
use sandpit::supervisor::{ExecutionRequest, ExecutionResult, Supervisor};
use sandpit::{build_supervisor, Config};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sandpit")]
#[command(version)]
#[command(about = "Run untrusted Python snippets in a sandbox, with state that survives between runs.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a snippet
    Exec {
        /// Code to run; read from stdin when neither this nor --file is given
        code: Option<String>,
        /// Read the snippet from a file
        #[arg(short, long, conflicts_with = "code")]
        file: Option<PathBuf>,
        /// Persist variables under this session id
        #[arg(short, long)]
        session: Option<String>,
        /// Timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Clear the session's variables before running
        #[arg(long, requires = "session")]
        reset: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        /// Write a produced figure to this path
        #[arg(long)]
        artifact_out: Option<PathBuf>,
    },
    /// Interactive session
    Repl {
        /// Session to attach to; a new one is created when omitted
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Run a canned pandas analysis over CSV or JSON data
    Analyze {
        /// Data file, or - for stdin
        #[arg(short, long)]
        data: PathBuf,
        /// describe, correlation, plot or custom
        #[arg(short, long, default_value = "describe")]
        kind: String,
        /// Plot type for --kind plot: histogram, scatter, line, bar, box, heatmap
        #[arg(short, long, default_value = "histogram")]
        plot: String,
        /// Comma-separated column names
        #[arg(short, long)]
        columns: Option<String>,
        /// Code for --kind custom; the data is loaded as `df`
        #[arg(long)]
        code: Option<String>,
        #[arg(short, long)]
        session: Option<String>,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        artifact_out: Option<PathBuf>,
    },
    /// List a session's variables
    Vars { session: String },
    /// List sessions
    Sessions {
        /// Include inactive sessions
        #[arg(long)]
        all: bool,
    },
    /// Remove all variables from a session, keeping the session
    Clear { session: String },
    /// Delete a session and its variables
    Delete {
        session: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Apply the retention policy now
    Sweep,
    /// Show configuration
    Config,
}

fn print_result(result: &ExecutionResult, json: bool, artifact_out: Option<&Path>) -> Result<()> {
    if let (Some(path), Some(artifact)) = (artifact_out, &result.artifact) {
        std::fs::write(path, &artifact.data)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    print!("{}", result.stdout_text);
    if !result.stdout_text.is_empty() && !result.stdout_text.ends_with('\n') {
        println!();
    }
    if result.truncated {
        eprintln!("{}", "[output truncated]".dimmed());
    }
    if let Some(artifact) = &result.artifact {
        match artifact_out {
            Some(path) => eprintln!("{} {}", "figure saved to".dimmed(), path.display()),
            None => eprintln!(
                "{}",
                format!(
                    "[{} figure, {} bytes; use --artifact-out to save]",
                    artifact.extension(),
                    artifact.data.len()
                )
                .dimmed()
            ),
        }
    }
    for warning in &result.warnings {
        eprintln!("{} {}", "Warning:".yellow(), warning);
    }
    if let Some(error) = &result.error {
        eprintln!("{} {}", "Error:".red().bold(), error);
    }
    Ok(())
}

fn read_source(code: Option<String>, file: Option<PathBuf>) -> Result<String> {
    if let Some(code) = code {
        return Ok(code);
    }
    match file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display())),
        _ => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

fn run_exec(
    supervisor: &Supervisor,
    request: ExecutionRequest,
    json: bool,
    artifact_out: Option<&Path>,
) -> Result<()> {
    let result = supervisor.execute(request)?;
    print_result(&result, json, artifact_out)?;
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_repl(
    supervisor: &Supervisor,
    session: Option<String>,
    sweep_interval: Option<Duration>,
) -> Result<()> {
    let session = supervisor.store().create_session(session.as_deref())?;
    // idle sessions keep expiring while the prompt waits
    let _sweeper = sweep_interval
        .map(|interval| BackgroundSweeper::start(supervisor.store().clone(), interval));

    println!("{}", format!("sandpit v{}", env!("CARGO_PKG_VERSION")).bold());
    println!(
        "Session: {} {}",
        session.green(),
        format!("(launcher: {})", supervisor.launcher_name()).dimmed()
    );
    println!(
        "Type {} to list variables, {} to reset, {} to exit.\n",
        ":vars".cyan(),
        ":clear".cyan(),
        "Ctrl+D".dimmed()
    );

    let mut rl = rustyline::DefaultEditor::new().context("failed to initialize readline")?;
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() {
            format!("{} ", ">>>".blue().bold())
        } else {
            format!("{} ", "...".blue())
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if pending.is_empty() {
                    match trimmed {
                        "" => continue,
                        ":vars" => {
                            print_variables(supervisor, &session)?;
                            continue;
                        }
                        ":clear" => {
                            supervisor.clear_session(&session)?;
                            println!("{}", "Session cleared.".dimmed());
                            continue;
                        }
                        ":quit" | ":q" => break,
                        _ => {}
                    }
                }
                let _ = rl.add_history_entry(line.as_str());

                // Blocks continue until a blank line.
                if !pending.is_empty() || trimmed.ends_with(':') {
                    if !trimmed.is_empty() {
                        pending.push_str(&line);
                        pending.push('\n');
                        continue;
                    }
                } else {
                    pending.push_str(&line);
                }
                let code = std::mem::take(&mut pending);

                let result = supervisor.execute(ExecutionRequest::new(code).with_session(&session))?;
                print_result(&result, false, None)?;
                println!(
                    "{}",
                    format!("({:.1}s)", result.duration_ms as f64 / 1000.0).dimmed()
                );
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                pending.clear();
                println!("Use Ctrl+D to exit.");
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {}", err);
                break;
            }
        }
    }
    Ok(())
}

fn print_variables(supervisor: &Supervisor, session: &str) -> Result<()> {
    let vars = supervisor.list_variables(session)?;
    if vars.is_empty() {
        println!("{}", "(no variables)".dimmed());
        return Ok(());
    }
    let width = vars.iter().map(|v| v.name.len()).max().unwrap_or(0);
    for var in vars {
        println!(
            "  {}  {:12}  {}",
            format!("{:width$}", var.name, width = width).cyan(),
            var.type_tag,
            human_bytes(var.size_bytes).dimmed()
        );
    }
    Ok(())
}

fn print_sessions(supervisor: &Supervisor, all: bool) -> Result<()> {
    let sessions = supervisor.list_sessions(all)?;
    if sessions.is_empty() {
        println!("{}", "No sessions.".dimmed());
        return Ok(());
    }
    println!("{}", "Sessions:".bold());
    println!();
    for s in sessions {
        let state = if s.active {
            String::new()
        } else {
            format!(" {}", "(inactive)".yellow())
        };
        println!(
            "  {}{}  {} vars, {} runs, {}, last active {}",
            s.id.cyan(),
            state,
            s.variable_count,
            s.execution_count,
            human_bytes(s.total_bytes),
            s.last_active_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed()
        );
    }
    Ok(())
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn analysis_kind(kind: &str, plot: &str, code: Option<String>) -> Result<AnalysisKind> {
    Ok(match kind.trim().to_ascii_lowercase().as_str() {
        "custom" => match code {
            Some(code) => AnalysisKind::Custom(code),
            None => bail!("--kind custom needs --code"),
        },
        "plot" => AnalysisKind::Plot(plot.parse::<PlotKind>()?),
        other => other.parse()?,
    })
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load();

    if let Commands::Config = cli.command {
        println!("{}", "Current configuration:".bold());
        if let Some(path) = Config::default_path() {
            println!("{}", path.display().to_string().dimmed());
        }
        println!();
        println!("{}", cfg.to_toml()?);
        if let Err(e) = cfg.validate() {
            eprintln!("{} {}", "Invalid:".red(), e);
        }
        return Ok(());
    }

    let supervisor = build_supervisor(&cfg)?;

    match cli.command {
        Commands::Exec {
            code,
            file,
            session,
            timeout,
            reset,
            json,
            artifact_out,
        } => {
            let source = read_source(code, file)?;
            let mut request = ExecutionRequest::new(source).with_reset(reset);
            if let Some(session) = session {
                request = request.with_session(session);
            }
            if let Some(secs) = timeout {
                request = request.with_timeout_secs(secs);
            }
            run_exec(&supervisor, request, json, artifact_out.as_deref())?;
        }
        Commands::Repl { session } => {
            run_repl(&supervisor, session, cfg.store_options()?.sweep_interval)?
        }
        Commands::Analyze {
            data,
            kind,
            plot,
            columns,
            code,
            session,
            json,
            artifact_out,
        } => {
            let data = read_source(None, Some(data))?;
            let mut analysis = AnalysisRequest::new(data, analysis_kind(&kind, &plot, code)?);
            if let Some(columns) = columns {
                analysis = analysis.with_columns(AnalysisRequest::parse_columns(&columns));
            }
            let mut request = ExecutionRequest::new(analysis.build_snippet()?);
            if let Some(session) = session {
                request = request.with_session(session);
            }
            run_exec(&supervisor, request, json, artifact_out.as_deref())?;
        }
        Commands::Vars { session } => print_variables(&supervisor, &session)?,
        Commands::Sessions { all } => print_sessions(&supervisor, all)?,
        Commands::Clear { session } => {
            supervisor.clear_session(&session)?;
            println!("Cleared session {}.", session.cyan());
        }
        Commands::Delete { session, yes } => {
            let confirmed = yes
                || dialoguer::Confirm::new()
                    .with_prompt(format!("Delete session '{}' and all its variables?", session))
                    .default(false)
                    .interact()?;
            if !confirmed {
                println!("Aborted.");
                return Ok(());
            }
            supervisor.delete_session(&session)?;
            println!("Deleted session {}.", session.cyan());
        }
        Commands::Sweep => {
            let report = supervisor.store().sweep()?;
            println!(
                "Marked {} session(s) inactive, deleted {}.",
                report.marked_inactive.to_string().cyan(),
                report.deleted.len().to_string().cyan()
            );
            for id in &report.deleted {
                println!("  {} {}", "deleted".red(), id);
            }
            if report.skipped_busy > 0 {
                println!(
                    "{}",
                    format!("{} busy session(s) left for the next sweep", report.skipped_busy).dimmed()
                );
            }
        }
        Commands::Config => {}
    }
    Ok(())
}

fn main() {
    // RUST_LOG=sandpit=debug shows execution phases
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandpit=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
