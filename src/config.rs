use clap::Parser;
use serde::Deserialize;
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use service::audio::AudioConfig;

#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

/// Tuning file contents. Every section has defaults, so a partial file or
/// no file at all is fine.
#[derive(Deserialize, Debug, Default)]
pub struct Tuning {
    /// audio engine tuning
    ///
    /// Concealment mode, comfort-noise level, codec control defaults and
    /// the jitter-buffer scheduling knobs. Anything not given keeps the
    /// engine defaults.
    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub log: Log,
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    /// `--debug` and `--silent` on the command line take precedence.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Interface to capture from.
    #[arg(short = 'i', long)]
    interface: Option<String>,

    /// Output file (pcap format). A bare filename is placed on the
    /// desktop.
    #[arg(short = 'O', long)]
    output: Option<PathBuf>,

    /// Stop after the given number of seconds (0 = unlimited).
    #[arg(short = 't', long, default_value_t = 0)]
    time: u64,

    /// Auto mode: stop when the call ends.
    #[arg(short = 'a', long)]
    auto: bool,

    /// Enable debug output.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Suppress all output.
    #[arg(short = 's', long)]
    silent: bool,

    /// List available interfaces and exit.
    #[arg(short = 'l', long)]
    list: bool,

    /// Optional tuning file (JSON5) for the audio engine.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug)]
pub enum Mode {
    /// Print the interface table and exit.
    ListInterfaces,
    Capture,
}

#[derive(Debug)]
pub struct Config {
    pub mode: Mode,
    pub interface: String,
    pub output: PathBuf,
    /// Capture-time budget in seconds, 0 meaning unlimited.
    pub time: u64,
    pub auto: bool,
    pub debug: bool,
    pub silent: bool,
    pub audio: AudioConfig,
    pub log: Log,
}

impl Config {
    /// Loads command-line flags and, when given, the tuning file. Flag
    /// validation errors are reported through `anyhow` so the binary exits
    /// non-zero with the usage hint.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();

        let tuning: Tuning = match cli.config.as_deref() {
            Some(path) => serde_json5::from_str(&read_to_string(path)?)
                .map_err(|e| anyhow::anyhow!("tuning file {}: {}", path.display(), e))?,
            None => Tuning::default(),
        };

        if cli.list {
            return Ok(Self {
                mode: Mode::ListInterfaces,
                interface: String::new(),
                output: PathBuf::new(),
                time: 0,
                auto: false,
                debug: cli.debug,
                silent: cli.silent,
                audio: tuning.audio,
                log: tuning.log,
            });
        }

        let interface = cli
            .interface
            .ok_or_else(|| anyhow::anyhow!("--interface is required (try --list)"))?;
        let output = cli
            .output
            .ok_or_else(|| anyhow::anyhow!("--output is required"))?;

        Ok(Self {
            mode: Mode::Capture,
            interface,
            output: resolve_output(&output),
            time: cli.time,
            auto: cli.auto,
            debug: cli.debug,
            silent: cli.silent,
            audio: tuning.audio,
            log: tuning.log,
        })
    }

    /// Effective log level: `--debug` wins, `--silent` reduces to errors
    /// only, otherwise the tuning file / default applies.
    pub fn log_level(&self) -> log::Level {
        if self.debug {
            log::Level::Debug
        } else if self.silent {
            log::Level::Error
        } else {
            self.log.level.as_level()
        }
    }
}

/// A bare filename lands on the operator's desktop, anything with a path
/// separator is taken as given.
fn resolve_output(output: &Path) -> PathBuf {
    if output.components().count() > 1 {
        return output.to_path_buf();
    }

    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join("Desktop").join(output),
        None => output.to_path_buf(),
    }
}
