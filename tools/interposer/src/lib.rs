pub mod call_order;
pub mod canonical;
pub mod config;
pub mod engine;
pub mod errors;
pub mod hooks;
pub mod logging;
pub mod scoped;
pub mod store;
pub mod wrapper;

pub use canonical::{Arguments, CallIdentity, Param, ParamEncoder, StandardEncoder};
pub use config::{load_config, parse_config, InterposerConfig};
pub use engine::{Interposer, InterposerBuilder, Session};
pub use errors::{CallError, InterposerError};
pub use hooks::{Hooks, NoHooks, Redactions};
pub use scoped::{with_override, Binding, OverrideGuard};
pub use store::{FormatVersion, Mode, Outcome, Store, TapeDump};
pub use wrapper::{Callable, Constructor, FnCallable, FnObject, Object, Proxy, Reply, Target, TargetKind};

use clap::{error::ErrorKind, Parser, Subcommand};
use logging::{append_run_log, init_run_logger, Level};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "interposer")]
#[command(about = "Inspect record/playback tapes")]
pub struct Cli {
    /// Append JSONL diagnostics to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Write every outcome and the call order of a tape as JSON.
    Dump {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Summarize a tape.
    Info {
        #[arg(long)]
        store: PathBuf,
    },
}

pub fn run() -> Result<i32, InterposerError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_with_output(&args, &mut out)
}

pub fn run_with_output(
    args: &[std::ffi::OsString],
    out: &mut dyn Write,
) -> Result<i32, InterposerError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                write!(out, "{error}").map_err(|e| InterposerError::Io(e.to_string()))?;
                return Ok(0);
            }
            _ => return Err(InterposerError::Cli(error.to_string())),
        },
    };

    if let Some(path) = &cli.log_file {
        init_run_logger(path)?;
    }

    match cli.command {
        Command::Dump { store, output } => {
            let dump = read_tape(&store)?;
            let text = serde_json::to_string_pretty(&dump)
                .map_err(|e| InterposerError::Io(e.to_string()))?;
            match output {
                Some(path) => {
                    std::fs::write(&path, format!("{text}\n"))
                        .map_err(|e| InterposerError::Io(e.to_string()))?;
                    append_run_log(
                        Level::Info,
                        "cli.dump.written",
                        json!({ "store": store.display().to_string(), "output": path.display().to_string() }),
                    );
                }
                None => writeln!(out, "{text}").map_err(|e| InterposerError::Io(e.to_string()))?,
            }
        }
        Command::Info { store } => {
            let dump = read_tape(&store)?;
            let calls = dump.channel_order.values().map(Vec::len).sum::<usize>();
            writeln!(
                out,
                "format_version={} hashes={} outcomes={} channels={} ordered_calls={}",
                dump.format_version,
                dump.outcomes.len(),
                dump.outcome_count(),
                dump.channel_order.len(),
                calls
            )
            .map_err(|e| InterposerError::Io(e.to_string()))?;
        }
    }
    Ok(0)
}

fn read_tape(path: &std::path::Path) -> Result<TapeDump, InterposerError> {
    let mut store = Store::open(path, Mode::Playback)?;
    let dump = store.dump()?;
    store.close()?;
    Ok(dump)
}
