use anyhow::Context;
use callprof::cli::{Cli, Command, RecordArgs};
use callprof::commands::{export, list, query, record};
use callprof::error::exit_code;
use callprof::frontend::Frontend;
use callprof::storage::Storage;
use callprof_trace::UnixChannel;
use callprof_trace::transport::SOCKET_ENV;
use clap::Parser;
use env_logger::Env;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(callprof_err) = e.downcast_ref::<callprof::Error>() {
                ExitCode::from(callprof_err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    cli.validate()
        .map_err(callprof::Error::InvalidArgument)
        .context("Invalid arguments")?;

    match cli.command {
        Command::Record(args) => {
            run_recorder(args)?;
        }
        Command::Query { file, sql } => {
            query::run(&file, &sql)?;
        }
        Command::List { dir } => {
            list::run(dir.as_deref())?;
        }
        Command::Export { file, output } => {
            let profile_path = match file {
                Some(f) => f,
                None => list::most_recent_profile(std::path::Path::new("."))?.ok_or_else(|| {
                    anyhow::anyhow!(
                        "No profiles found. Run 'callprof list' to see available profiles."
                    )
                })?,
            };
            let functions = export::run(&profile_path, &output)?;
            eprintln!(
                "Wrote {} functions from {} to {}",
                functions,
                profile_path.display(),
                output.display()
            );
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "callprof", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn run_recorder(args: RecordArgs) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl-C handler")?;

    let listener = record::bind(&args.socket)
        .with_context(|| format!("Failed to listen on {}", args.socket.display()))?;
    eprintln!(
        "Waiting for a profiled process (run it with {}={})",
        SOCKET_ENV,
        args.socket.display()
    );

    let result = record_session(&listener, &args, &running);
    if let Err(e) = std::fs::remove_file(&args.socket) {
        log::debug!("Could not remove {}: {}", args.socket.display(), e);
    }
    result
}

fn record_session(
    listener: &std::os::unix::net::UnixListener,
    args: &RecordArgs,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let stream = record::accept(listener, args.accept_timeout, running)?;
    let mut frontend = Frontend::accept_handshake(UnixChannel::new(stream), args.handshake_timeout)?;

    let process = frontend.process().clone();
    eprintln!("Attached to {} (PID {})", process.name(), process.pid);

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| list::profile_file_name(process.name()));
    eprintln!("Output: {}", output_path.display());

    let mut storage = Storage::new(&output_path, &process)?;
    let options = record::RecordOptions {
        interval: args.interval,
        duration: args.duration,
    };
    let summary = record::run(&mut frontend, &mut storage, &options, running)?;

    eprintln!(
        "\nRecording complete. Snapshots: {}, checkpoints: {}, functions: {}",
        summary.snapshots, summary.checkpoints, summary.functions
    );
    if summary.disconnected {
        eprintln!("Target disconnected before acknowledging the close");
    }
    let diagnostics = summary.diagnostics;
    if diagnostics.has_loss() || summary.missed_snapshots > 0 || summary.decode_errors > 0 {
        eprintln!(
            "Data loss: {} unbalanced exits, {} orphaned frames, {} dropped events, {} dropped snapshots, {} missed, {} undecodable",
            diagnostics.unbalanced_exits,
            diagnostics.orphaned_frames,
            diagnostics.dropped_events,
            diagnostics.dropped_snapshots,
            summary.missed_snapshots,
            summary.decode_errors
        );
    }

    Ok(())
}
