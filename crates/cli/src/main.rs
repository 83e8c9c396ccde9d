//! The main entrypoint for osdeploy, which just performs global
//! initialization, and then calls out into the library.

use std::io::Write;

use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use tokio::signal::unix::{signal, SignalKind};

use osdeploy_lib::cli::Cli;
use osdeploy_lib::Interrupt;

/// Trigger `interrupt` on the first SIGINT or SIGTERM. The running action
/// notices at its next phase boundary and unwinds its mounts.
async fn watch_signals(interrupt: Interrupt) -> Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = term.recv() => {}
    }
    tracing::warn!("Interrupted, stopping after the current step");
    interrupt.trigger();
    Ok(())
}

/// The code called after we've done process global init and created
/// an async runtime.
async fn async_main(cli: Cli) -> Result<()> {
    let interrupt = Interrupt::default();
    let watcher = tokio::spawn(watch_signals(interrupt.clone()));
    // Actions block on external commands throughout
    let r = tokio::task::spawn_blocking(move || cli.run(interrupt)).await?;
    watcher.abort();
    r
}

/// Perform process global initialization, then create an async runtime
/// and do the rest of the work there.
fn run() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.debug() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    osdeploy_utils::initialize_tracing(level);
    tracing::trace!("starting osdeploy");
    // We only use the current thread runtime for now
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main(cli))
}

fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    // This code just captures any errors.
    if let Err(e) = run() {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(osdeploy_lib::exit_code(&e));
    }
}
