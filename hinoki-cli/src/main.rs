//! Hinoki CLI - コマンドラインインターフェース
//!
//! 停止中のプロセスで式を評価する hinoki のREPLインターフェース

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hinoki_core::{Command, Debugger, EvaluationOutcome, StopReason};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// 履歴ファイル名（ホームディレクトリ直下）
const HISTORY_FILE: &str = ".hinoki_history";

/// Hinoki - expression evaluator for stopped processes
#[derive(Parser)]
#[command(name = "hinoki")]
#[command(version = "0.1.0")]
#[command(about = "Evaluate expressions against a stopped process", long_about = None)]
struct Cli {
    /// Log filter (e.g. `hinoki_core=debug`); falls back to RUST_LOG
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: String,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Path to the executable binary
        binary: String,

        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    println!("Hinoki - expression evaluator");
    println!("Version 0.1.0");
    println!();

    let mut debugger = init_debugger(cli.command)?;
    run_repl(&mut debugger)?;

    Ok(())
}

/// ログ出力を初期化する
///
/// `--log` が優先され、なければ `RUST_LOG`、どちらもなければ `warn`。
fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// デバッガを初期化してプロセスにアタッチまたは起動する
fn init_debugger(command: DebugCommand) -> Result<Debugger> {
    let mut debugger = Debugger::new();

    match command {
        DebugCommand::Run { binary, args } => {
            println!("Loading binary: {}", binary);
            debugger.load_binary(&binary)?;
            println!("Loaded DWARF information from {}", binary);

            debugger.spawn(&binary, &args)?;
            println!("Process spawned and stopped at first instruction");
            println!();
        }
        DebugCommand::Attach { binary, pid } => {
            println!("Loading binary: {}", binary);
            debugger.load_binary(&binary)?;
            println!("Loaded DWARF information from {}", binary);

            debugger.attach(pid)?;
            println!("Attached to process {}", pid);
            println!();
        }
    }

    Ok(debugger)
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(HISTORY_FILE))
}

/// REPLループを実行する
fn run_repl(debugger: &mut Debugger) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        // 初回起動時はファイルがない
        let _ = rl.load_history(path);
    }

    loop {
        let readline = rl.readline("(hinoki) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(debugger, line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(path) = &history {
        if let Err(e) = rl.save_history(path) {
            warn!("failed to save history to {}: {}", path.display(), e);
        }
    }

    Ok(())
}

/// コマンドを処理する。REPLを続けるなら `true`
fn handle_command(debugger: &mut Debugger, line: &str) -> Result<bool> {
    let Some(command) = Command::parse(line) else {
        println!("Unknown command: {}", line);
        println!("Type 'help' for available commands.");
        return Ok(true);
    };

    match command {
        Command::Help => print_help(),
        Command::Quit => {
            println!("Goodbye!");
            return Ok(false);
        }
        Command::Capture(expr) => handle_capture(debugger, &expr)?,
        Command::Vars => handle_vars(debugger),
        Command::Set { name, value } => {
            debugger.set_integer(&name, value)?;
            println!("{} = {}", name, value as i64);
        }
        Command::Condition(text) => handle_condition(debugger, text.as_deref()),
        Command::Continue => {
            println!("Continuing execution...");
            let reason = debugger.continue_execution()?;
            report_stop(debugger, reason)?;
        }
        Command::Step => {
            let reason = debugger.step()?;
            report_stop(debugger, reason)?;
        }
        Command::Pc => println!("pc = 0x{:x}", debugger.get_pc()?),
    }

    Ok(true)
}

fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn handle_capture(debugger: &mut Debugger, expr: &str) -> Result<()> {
    let EvaluationOutcome {
        result_name,
        result_bytes,
        info,
        ..
    } = debugger.capture(expr)?;

    match (result_name, result_bytes) {
        (Some(name), Some(bytes)) => println!("{} = [{}]", name, format_bytes(&bytes)),
        _ => println!("(no result)"),
    }
    println!(
        "  argument struct: {} member(s), {} byte(s), align {}",
        info.num_elements, info.size, info.alignment
    );
    Ok(())
}

fn handle_vars(debugger: &Debugger) {
    let vars = debugger.session().persistent_variables();
    if vars.is_empty() {
        println!("No persistent variables");
        return;
    }

    println!("Persistent variables ({}):", vars.len());
    for var in vars.iter() {
        match var.value_bytes() {
            Some(bytes) => println!("  {} ({} bytes) = [{}]", var.name, var.byte_size, format_bytes(bytes)),
            None => println!("  {} ({} bytes) = <unavailable>", var.name, var.byte_size),
        }
    }
}

fn handle_condition(debugger: &mut Debugger, text: Option<&str>) {
    debugger.set_condition(text);
    match debugger.condition().condition_text() {
        Some(text) => println!("Stop condition set: {}", text),
        None => println!("Stop condition removed"),
    }
}

/// 停止理由を表示し、条件があれば評価する
fn report_stop(debugger: &mut Debugger, reason: StopReason) -> Result<()> {
    println!();
    match reason {
        StopReason::Breakpoint | StopReason::Step => {
            let pc = debugger.get_pc()?;
            match reason {
                StopReason::Breakpoint => println!("Breakpoint hit at 0x{:x}", pc),
                _ => println!("Stepped to 0x{:x}", pc),
            }
            if let Some(name) = debugger.function_name_at(pc)? {
                println!("In function: {}", name);
            }

            if debugger.condition().condition_text().is_some() {
                match debugger.condition_says_stop() {
                    Ok(true) => println!("Condition is true"),
                    Ok(false) => println!("Condition is false"),
                    Err(e) => println!("Condition could not be evaluated: {}", e),
                }
            }
        }
        StopReason::Signal(signal) => println!("Received signal: {:?}", signal),
        StopReason::Exited(code) => println!("Process exited with code {}", code),
        StopReason::Other => println!("Process stopped (unknown reason)"),
    }
    Ok(())
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help (h, ?)          - Show this help message");
    println!("  quit/exit/q          - Exit the debugger");
    println!();
    println!("Expression commands:");
    println!("  expr <expr> (p)      - Capture the variables in <expr>; the first value becomes $N");
    println!("  vars (v)             - List persistent variables");
    println!("  set $<name> <int>    - Create an integer persistent variable");
    println!("  condition [<expr>]   - Set the stop condition (no argument removes it)");
    println!();
    println!("Execution commands:");
    println!("  continue (c)         - Continue execution");
    println!("  step (s)             - Execute one instruction");
    println!("  pc                   - Show the program counter");
    println!();
    println!("Examples:");
    println!("  expr counter");
    println!("  p $0 + counter");
    println!("  set $limit 0x10");
    println!("  condition counter");
}
