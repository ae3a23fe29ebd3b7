//! CLI binary for running and checking nstrm programs.
//!
//! Programs arrive as JSON syntax trees produced by the external front end.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nstrm_types::{Expr, ExprKind, NstrmError, Program};
use nstrm_vm::builtins::{self, Console};
use nstrm_vm::{execute, Env};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nstrm", version, about = "Dataflow scripting with pipes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program
    Run {
        /// Path to the program's JSON syntax tree
        #[arg(required_unless_present = "expr")]
        program: Option<PathBuf>,

        /// Evaluate an inline JSON program instead of a file
        #[arg(short, long, conflicts_with = "program")]
        expr: Option<String>,

        /// Original source text, used to show where errors happened
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Number of runtime worker threads (0 = one per core)
        #[arg(short, long, default_value = "0")]
        procs: usize,
    },

    /// Load a program and report structural problems without running it
    Check {
        /// Path to the program's JSON syntax tree
        program: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing; RUST_LOG wins over the flag
    let default = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            program,
            expr,
            source,
            procs,
        } => cmd_run(program.as_deref(), expr.as_deref(), source.as_deref(), procs),
        Commands::Check { program } => cmd_check(&program),
    }
}

fn load(program: Option<&Path>, expr: Option<&str>) -> anyhow::Result<Program> {
    match (program, expr) {
        (_, Some(json)) => nstrm_types::parse_program(json).context("invalid inline program"),
        (Some(path), None) => nstrm_types::load_program(path)
            .with_context(|| format!("failed to load {}", path.display())),
        (None, None) => bail!("no program given"),
    }
}

fn cmd_run(
    program: Option<&Path>,
    expr: Option<&str>,
    source: Option<&Path>,
    procs: usize,
) -> anyhow::Result<()> {
    let program = load(program, expr)?;
    tracing::debug!(expressions = program.body.len(), procs, "Loaded program");
    let source = match source {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read source {}", path.display()))?,
        ),
        None => None,
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if procs > 0 {
        builder.worker_threads(procs);
    }
    let runtime = builder.build().context("failed to start runtime")?;

    let (result, faults) = runtime.block_on(async {
        let env = Env::root();
        builtins::load(&env, Console::stdout());
        builtins::load_stdin(&env);
        let faults = env.faults();
        let result = execute(&program, env).await;
        (result, faults.take())
    });
    // STDIN may still be blocked on a read nobody wants any more.
    runtime.shutdown_timeout(Duration::from_millis(100));

    let mut failed = false;
    if let Err(err) = result {
        eprintln!("{}", report(&err, source.as_deref()));
        failed = true;
    }
    for fault in &faults {
        eprintln!("{}", report(fault, source.as_deref()));
        failed = true;
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Render an error with its location when the source text is known.
fn report(err: &NstrmError, source: Option<&str>) -> String {
    match (source, err.position()) {
        (Some(source), Some(_)) => err.render(source),
        (None, Some(pos)) => format!("Error at {pos}: {err}"),
        _ => format!("Error: {err}"),
    }
}

fn cmd_check(path: &Path) -> anyhow::Result<()> {
    let program = load(Some(path), None)?;
    let problems = diagnostics(&program);

    if problems.is_empty() {
        println!("Program is valid ({} top-level expressions)", program.body.len());
        return Ok(());
    }
    for problem in &problems {
        println!("[ERROR] {problem}");
    }
    std::process::exit(1);
}

/// Structural problems the evaluator would only find at run time.
fn diagnostics(program: &Program) -> Vec<String> {
    let mut problems = Vec::new();
    for expr in &program.body {
        visit(expr, &mut problems);
    }
    problems
}

fn visit(expr: &Expr, problems: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::Pipe { args, .. } => {
            if args.len() < 2 {
                problems.push(format!(
                    "{}: pipe needs at least two operands, got {}",
                    expr.pos,
                    args.len()
                ));
            }
            args.iter().for_each(|e| visit(e, problems));
        }
        ExprKind::Block { params, body } => {
            let mut seen = std::collections::HashSet::new();
            for param in params {
                if !seen.insert(param) {
                    problems.push(format!("{}: duplicate parameter {param}", expr.pos));
                }
            }
            body.iter().for_each(|e| visit(e, problems));
        }
        ExprKind::Bind { expr: inner, .. } => visit(inner, problems),
        ExprKind::Call { args, .. } => args.iter().for_each(|e| visit(e, problems)),
        ExprKind::If {
            cond,
            then,
            otherwise,
        } => cond
            .iter()
            .chain(then)
            .chain(otherwise)
            .for_each(|e| visit(e, problems)),
        ExprKind::While { cond, body } => {
            if cond.is_empty() {
                problems.push(format!("{}: while without a condition", expr.pos));
            }
            cond.iter().chain(body).for_each(|e| visit(e, problems));
        }
        ExprKind::Array { elements } => elements.iter().for_each(|e| visit(e, problems)),
        ExprKind::Emit { values } => values.iter().for_each(|e| visit(e, problems)),
        ExprKind::Close { value: Some(inner) } => visit(inner, problems),
        ExprKind::Literal { .. }
        | ExprKind::Var { .. }
        | ExprKind::Close { value: None }
        | ExprKind::Wait
        | ExprKind::Skip => {}
    }
}
