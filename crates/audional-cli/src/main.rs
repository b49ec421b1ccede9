//! audional: play, bounce and inspect step sequencer projects

mod bounce;
mod config;
mod info;
mod play;
mod session;

use std::path::PathBuf;

use anyhow::Result;
use audional_core::PlayMode;
use audional_services::{AudioBackend, RealtimeBackend};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

/// Audional step sequencer
#[derive(Parser, Debug)]
#[command(name = "audional")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Play and bounce step sequencer projects", long_about = None)]
struct Args {
    /// Config file, defaults to the user config directory
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Loop the current sequence
    Single,
    /// Play every sequence in order
    All,
}

impl From<Mode> for PlayMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Single => PlayMode::Single,
            Mode::All => PlayMode::All,
        }
    }
}

#[derive(clap::Args, Debug)]
struct PlaybackArgs {
    /// Project document (JSON)
    #[arg(value_name = "PROJECT")]
    project: PathBuf,

    #[arg(short, long, value_enum, default_value_t = Mode::Single)]
    mode: Mode,

    /// Passes over the project to play
    #[arg(short, long, default_value_t = 1)]
    loops: u32,

    /// Play for this many seconds instead of whole loops
    #[arg(long)]
    seconds: Option<f64>,

    /// Override the project tempo
    #[arg(long)]
    bpm: Option<f64>,

    /// WAV files for the sample bank, after the configured ones
    #[arg(short, long = "sample", value_name = "PATH")]
    samples: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a project through the default output device
    Play(PlaybackArgs),

    /// Render a project to a WAV file
    Bounce {
        #[command(flatten)]
        playback: PlaybackArgs,

        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        #[arg(long)]
        sample_rate: Option<u32>,
    },

    /// Print sequences and step grids
    Info {
        #[arg(value_name = "PROJECT")]
        project: PathBuf,
    },

    /// Write the current config (or defaults) to the config file
    InitConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("audional=info".parse()?)
            .add_directive("audional_services=info".parse()?)
            .add_directive("audional_core=info".parse()?))
        .init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(config::config_path);
    let app_config = config::load_config(&config_path);

    match args.command {
        Commands::Play(playback) => {
            let backend = RealtimeBackend::new()?;
            let rate = backend.sample_rate();
            let (project, samples, engine, mode, seconds) = prepare(&app_config, playback, rate)?;
            play::run(backend, project, samples, engine, mode, seconds)
        }
        Commands::Bounce { playback, output, sample_rate } => {
            let rate = sample_rate.unwrap_or(app_config.bounce.sample_rate);
            let (project, samples, engine, mode, seconds) = prepare(&app_config, playback, rate)?;
            let rate = engine.sample_rate;
            let frames = bounce::render(project, samples, engine, mode, seconds)?;
            bounce::write_wav(&output, &frames, rate)
        }
        Commands::Info { project } => {
            let project = session::read_project(&project)?;
            print!("{}", info::describe(&project));
            Ok(())
        }
        Commands::InitConfig => {
            config::save_config(&app_config, &config_path)?;
            println!("{}", config_path.display());
            Ok(())
        }
    }
}

type Prepared = (
    audional_core::ProjectState,
    audional_services::SampleBank,
    audional_services::EngineConfig,
    PlayMode,
    f64,
);

fn prepare(app_config: &AppConfig, playback: PlaybackArgs, sample_rate: u32) -> Result<Prepared> {
    let mut project = session::read_project(&playback.project)?;
    if let Some(bpm) = playback.bpm {
        project.set_bpm(bpm)?;
    }

    let engine = app_config.engine_config(sample_rate);
    let mut paths = app_config.samples.paths.clone();
    paths.extend(playback.samples);
    let samples = session::load_samples(&paths, engine.sample_rate);

    let mode = PlayMode::from(playback.mode);
    let seconds = match playback.seconds {
        Some(s) if s.is_finite() && s > 0.0 => s,
        _ => session::session_seconds(&project, &engine, mode, playback.loops),
    };
    Ok((project, samples, engine, mode, seconds))
}
