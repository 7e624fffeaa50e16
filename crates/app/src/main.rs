use std::{path::PathBuf, time::Duration};

use beat_quantizer_core::{quantize_unit, scheduled_time, AppConfig, Quantizer, QuantizerError};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod session;

use session::GameSession;

fn main() -> beat_quantizer_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            bpm,
            seconds,
        } => run_session(config.as_ref(), bpm, seconds),
        Commands::Grid {
            bpm,
            division,
            at,
            delay,
        } => print_grid(bpm, division, at, delay),
    }
}

fn run_session(
    config: Option<&PathBuf>,
    bpm: Option<f64>,
    seconds: f64,
) -> beat_quantizer_core::Result<()> {
    let mut config = match config {
        Some(path) => AppConfig::from_path(path)?,
        None => AppConfig::default(),
    };
    if let Some(bpm) = bpm {
        config.quantizer.tempo_bpm = bpm;
    }
    config.validate()?;
    let duration = session_duration(seconds)?;

    tracing::info!(tempo = config.quantizer.tempo_bpm, seconds, "starting session");

    let quantizer = Quantizer::new(config.quantizer.clone())?;
    quantizer.start(None)?;
    let session = GameSession::begin(&quantizer, &config.session)?;

    session::play_for(&quantizer, duration)?;

    let music_time = quantizer.current_music_time()?.unwrap_or_default();
    let stats = session.stats();
    let (moves, triggers, rows) = (
        stats.player_moves(),
        stats.spawn_triggers(),
        stats.rows_spawned(),
    );
    session.end(&quantizer)?;
    let pending = quantizer.pending_count()?;
    quantizer.stop()?;

    println!("music time      {music_time:.3}s");
    println!("player moves    {moves}");
    println!("spawn triggers  {triggers}");
    println!("rows spawned    {rows}");
    println!("pending at stop {pending}");
    Ok(())
}

fn session_duration(seconds: f64) -> beat_quantizer_core::Result<Duration> {
    Duration::try_from_secs_f64(seconds).map_err(|err| {
        QuantizerError::config(format!("--seconds must be a non-negative duration: {err}"))
    })
}

fn print_grid(bpm: f64, division: u32, at: f64, delay: f64) -> beat_quantizer_core::Result<()> {
    beat_quantizer_core::timeline::validate_tempo(bpm)?;
    beat_quantizer_core::timeline::validate_request(division, delay)?;
    if !(at.is_finite() && at >= 0.0) {
        return Err(QuantizerError::config("--at must be a non-negative number"));
    }

    println!("quantize unit   {:.6}s", quantize_unit(bpm, division));
    println!("scheduled time  {:.6}s", scheduled_time(at, bpm, division, delay));
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-quantized game session driver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a game session against the wall clock and report what fired.
    Run {
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Overrides the configured tempo.
        #[arg(long)]
        bpm: Option<f64>,
        /// How long to keep the session playing.
        #[arg(long, default_value_t = 8.0)]
        seconds: f64,
    },
    /// Show where a registration made at a given musical time would land.
    Grid {
        #[arg(long, default_value_t = 120.0)]
        bpm: f64,
        /// Grid steps per 4-beat measure.
        #[arg(long, default_value_t = 16)]
        division: u32,
        /// Musical time of the registration, in seconds.
        #[arg(long)]
        at: f64,
        /// Extra delay after the grid line, in seconds.
        #[arg(long, default_value_t = 0.0)]
        delay: f64,
    },
}
