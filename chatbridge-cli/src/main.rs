//! chatbridge: line-oriented demo harness for the chatbridge C ABI.
//!
//! Architecture: **main thread = all commands**, a reader thread feeds stdin
//! lines and a signal thread feeds termination requests through one channel.
//! Events print from the library's delivery thread.

#![allow(
    missing_docs,
    missing_debug_implementations,
    clippy::print_stderr,
    clippy::print_stdout
)]

mod protocol;

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::mpsc;
use std::{process, thread};

use chatbridge::{BridgeConfig, Client, Response};
use clap::Parser;

use crate::protocol::Line;

/// Pseudo-command that uploads the file named in its params and prints progress.
const UPLOAD_PATH: &str = "upload_media_path";

/// Drive one chat instance with `<command> <json>` lines on stdin.
#[derive(Parser)]
#[command(name = "chatbridge", version, about, long_about = None)]
struct Args {
    /// Config file (default: `$CHATBRIDGE_CONFIG`, else the data directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "chatbridge_ffi=trace" (overrides the config).
    #[arg(short, long)]
    log_level: Option<String>,
}

enum Input {
    Line(String),
    Eof,
    Signal,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let path = args.config.clone().unwrap_or_else(BridgeConfig::config_path);
    let config = BridgeConfig::load_from(&path)?;
    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    chatbridge::init_logger(Some(level))?;
    tracing::debug!(path = %path.display(), version = chatbridge::version(), "Loaded config");
    chatbridge::configure(config)?;

    let mut client = Client::new()?;
    let events = client.start()?;
    let printer = thread::Builder::new()
        .name("chatbridge-print".into())
        .spawn(move || {
            for event in events {
                let _ = protocol::write_event(
                    &mut io::stdout().lock(),
                    event.command,
                    event.request_id,
                    event.data.as_bytes(),
                );
            }
        })?;

    let (tx, rx) = mpsc::channel();
    spawn_stdin_reader(tx.clone())?;
    spawn_signal_listener(tx)?;

    while let Ok(input) = rx.recv() {
        match input {
            Input::Line(line) => handle_line(&client, &line)?,
            Input::Eof => break,
            Input::Signal => {
                tracing::info!("Termination requested");
                break;
            }
        }
    }

    // Destroy before exit; this also closes the event channel.
    drop(client);
    let _ = printer.join();
    Ok(())
}

fn handle_line(client: &Client, line: &str) -> io::Result<()> {
    let (name, payload) = match protocol::parse(line) {
        Line::Blank => return Ok(()),
        Line::Invalid(diagnostic) => {
            eprintln!("{diagnostic}");
            return Ok(());
        }
        Line::Command { name, payload } => (name, payload),
    };
    let resp = if name == UPLOAD_PATH {
        client.upload_media_path(payload.as_bytes(), |p| {
            let _ = protocol::write_progress(&mut io::stdout().lock(), p);
        })
    } else {
        match client.submit(name, payload.as_bytes()) {
            Ok(resp) => resp,
            Err(e) => {
                eprintln!("{e}");
                return Ok(());
            }
        }
    };
    print_response(&resp)
}

fn print_response(resp: &Response) -> io::Result<()> {
    protocol::write_response(&mut io::stdout().lock(), resp.command(), resp.data())
}

fn spawn_stdin_reader(tx: mpsc::Sender<Input>) -> io::Result<()> {
    thread::Builder::new()
        .name("chatbridge-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(Input::Line(line)).is_err() {
                    return;
                }
            }
            let _ = tx.send(Input::Eof);
        })?;
    Ok(())
}

fn spawn_signal_listener(tx: mpsc::Sender<Input>) -> io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("chatbridge-signal".into())
        .spawn(move || {
            rt.block_on(wait_for_signal());
            let _ = tx.send(Input::Signal);
        })?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let Ok(mut term) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
