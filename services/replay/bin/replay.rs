//! Entrypoint for the session replay tool.
//!
//! 1. Parses the command line and loads the controller configuration.
//! 2. Loads the recorded event log.
//! 3. Drives a voice session through it and prints updates as they happen.
//! 4. Prints the transcript and the usage record the session produced.

use anyhow::Context;
use clap::Parser;
use gymvoice_core::{ControllerConfig, SessionContext, SessionUpdate};
use gymvoice_realtime::EndpointConfig;
use gymvoice_replay::{
    cli::ReplayArgs,
    runner::{ReplayBackend, replay},
    script::{self, ReplayScript},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::StatusChanged(status) => println!("[status] {}", status),
        SessionUpdate::Transcript {
            speaker,
            text,
            is_final: true,
        } => println!("[{:?}] {}", speaker, text),
        SessionUpdate::Transcript { .. } => {}
        SessionUpdate::Error(err) => println!("[error] {}", err),
        SessionUpdate::Goodbye => println!("[goodbye]"),
        SessionUpdate::SessionCreated { session_id } => println!("[session] {}", session_id),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Arguments, Logging and Configuration ---
    let args = ReplayArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let config = ControllerConfig::from_env().context("Failed to load controller configuration")?;

    // --- 2. Event Log ---
    let steps = script::load(&args.events)?;
    info!(steps = steps.len(), speed = args.speed, "Event log loaded");
    let script = Arc::new(ReplayScript::new(steps, args.speed));

    // --- 3. Collaborators ---
    let backend = if args.submit {
        let endpoints = EndpointConfig::from_env().context("Failed to load endpoint configuration")?;
        info!(session_endpoint = %endpoints.session_endpoint, "Submitting to configured endpoints");
        ReplayBackend::http(&endpoints)?
    } else {
        ReplayBackend::local()
    };

    let context = SessionContext {
        location_slug: args.location,
        member_id: args.member,
        member_data: None,
        language_preference: args.language,
    };

    // --- 4. Replay ---
    let report = replay(script, backend, config, context, print_update).await?;

    println!();
    println!("final status: {}", report.final_status);
    for entry in &report.transcript {
        println!("  #{} {:?}: {}", entry.turn_number, entry.speaker, entry.text);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&report.usage).context("Failed to encode usage record")?
    );
    Ok(())
}
