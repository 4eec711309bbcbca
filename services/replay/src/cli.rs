use clap::Parser;
use std::path::PathBuf;

/// Replays a recorded realtime event log through the voice session controller.
#[derive(Parser, Debug)]
#[command(name = "gymvoice-replay")]
#[command(version)]
#[command(about = "Replay a captured voice session and report its transcript and usage.", long_about = None)]
pub struct ReplayArgs {
    /// JSON-lines event log (`{"offset_ms": .., "event": {..}}` per line)
    #[arg(long)]
    pub events: PathBuf,

    /// Location slug the session is attributed to
    #[arg(long, default_value = "replay")]
    pub location: String,

    /// Member id forwarded to the session issuer
    #[arg(long)]
    pub member: Option<String>,

    /// Conversation language
    #[arg(long, default_value = "fr")]
    pub language: String,

    /// Playback speed factor; 2.0 replays twice as fast
    #[arg(long, default_value_t = 1.0, value_parser = parse_speed)]
    pub speed: f64,

    /// Use the HTTP collaborators from the environment instead of log-only sinks
    #[arg(long)]
    pub submit: bool,
}

fn parse_speed(raw: &str) -> Result<f64, String> {
    let speed: f64 = raw
        .parse()
        .map_err(|_| format!("'{}' is not a number", raw))?;
    if !speed.is_finite() || speed <= 0.0 {
        return Err(format!("speed must be positive, got {}", raw));
    }
    Ok(speed)
}
