//! Ember CLI
//!
//! Command-line driver for the Ember scripting language: runs a script
//! file, drops into a line-editing REPL when given none, or emits shell
//! completion scripts.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use ember_runtime::{GcConfig, InterpretResult, Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(ClapParser)]
#[command(name = "ember")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ember - a small bytecode-interpreted scripting language", long_about = None)]
struct Cli {
    /// Script file to run. Omit to start the REPL.
    file: Option<PathBuf>,

    /// Path to an ember.toml config file (defaults to ./ember.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Exit codes spec.md §6 assigns to each interpret outcome.
const EXIT_OK: u8 = 0;
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_IO_ERROR: u8 = 74;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = cli.command {
        run_completions(shell);
        return ExitCode::from(EXIT_OK);
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    match cli.file {
        Some(path) => run_file(&path, config),
        None => run_repl(config),
    }
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}

/// Reads `ember.toml` (an explicit `--config` path, or `./ember.toml` if
/// present), then layers `EMBER_STRESS_GC`/`EMBER_GC_THRESHOLD` on top
/// (spec.md §4.5, SPEC_FULL.md §11.3).
fn load_config(explicit: Option<&Path>) -> Result<GcConfig, String> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => {
            let default = PathBuf::from("ember.toml");
            if default.is_file() {
                Some(default)
            } else {
                None
            }
        }
    };
    let base = match path {
        Some(p) => {
            let text = std::fs::read_to_string(&p)
                .map_err(|e| format!("Cannot read config '{}': {e}", p.display()))?;
            GcConfig::from_toml(&text)?
        }
        None => GcConfig::default(),
    };
    Ok(base.apply_env(|k| std::env::var(k).ok()))
}

fn run_file(path: &Path, config: GcConfig) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Cannot read '{}': {e}", path.display());
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };
    let mut vm = Vm::with_config(config);
    match vm.interpret(&source) {
        InterpretResult::Ok => ExitCode::from(EXIT_OK),
        InterpretResult::CompileError(errors) => {
            for e in &errors {
                eprintln!("{e}");
            }
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
        InterpretResult::RuntimeError(_) => ExitCode::from(EXIT_RUNTIME_ERROR),
    }
}

/// Reads a line at a time, calling `interpret` on each (spec.md §6);
/// every line runs against the same `Vm`, so globals and top-level state
/// persist across lines the way a REPL session is expected to.
fn run_repl(config: GcConfig) -> ExitCode {
    println!("Ember {}", env!("CARGO_PKG_VERSION"));
    let mut vm = Vm::with_config(config);
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Failed to start line editor: {e}");
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                vm.interpret(&line);
                let _ = std::io::stdout().flush();
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(e) => {
                eprintln!("Readline error: {e}");
                break;
            }
        }
    }
    ExitCode::from(EXIT_OK)
}
