use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, crate_version};
use dopeman_supervisor::{PortRange, SupervisorConfig};
use miette::Result;
use tracing::debug;

use crate::log::{Level, LogFormat};

/// Looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "dopeman.yaml";

#[derive(Parser, Debug)]
#[command(
    name = "dopeman",
    version = crate_version!(),
    about = "Starts the control center helper services and runs its tasks"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true, help = "Path to dopeman.yaml.")]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "DOPEMAN_INTERPRETER",
        help = "Program that runs the helpers."
    )]
    pub interpreter: Option<String>,

    #[arg(
        long,
        global = true,
        env = "DOPEMAN_COMMANDS_DIR",
        help = "Directory holding the helper scripts."
    )]
    pub commands_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "First port to probe.")]
    pub port_start: Option<u32>,

    #[arg(long, global = true, help = "Last port to probe.")]
    pub port_end: Option<u32>,

    #[arg(short, long, global = true, help = "Enable debug log level.")]
    pub verbose: bool,

    #[arg(short, long, global = true, conflicts_with = "verbose", help = "Only log errors.")]
    pub quiet: bool,

    #[arg(long, global = true, value_enum, default_value_t, help = "Log output format.")]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    #[command(about = "Start the services and keep them running until interrupted.")]
    Up {
        #[arg(long, help = "Do not check the interpreter and packages first.")]
        skip_preflight: bool,
    },

    #[command(about = "Run the scan task.")]
    Scan,

    #[command(about = "Run the health-check task.")]
    HealthCheck,

    #[command(about = "Find a free port, or report on specific ports.")]
    Ports {
        #[arg(long, help = "Report availability of these ports instead.", num_args = 1..)]
        check: Vec<u16>,

        #[arg(long, help = "Print JSON.")]
        json: bool,
    },

    #[command(about = "Check the interpreter and required packages.")]
    Check {
        #[arg(long, help = "Print JSON.")]
        json: bool,
    },
}

impl Cli {
    pub fn level(&self) -> Level {
        if self.verbose {
            Level::Debug
        } else if self.quiet {
            Level::Error
        } else {
            Level::Info
        }
    }

    /// Load the configuration file, then apply command-line overrides.
    pub fn load_config(&self) -> Result<SupervisorConfig> {
        let mut config = match &self.config {
            Some(path) => SupervisorConfig::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                debug!("Using {}", DEFAULT_CONFIG_FILE);
                SupervisorConfig::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => SupervisorConfig::default(),
        };

        if let Some(interpreter) = &self.interpreter {
            config.interpreter = interpreter.clone();
        }
        if let Some(commands_dir) = &self.commands_dir {
            config.commands_dir = commands_dir.clone();
        }

        let start = self.port_start.unwrap_or(config.ports.start.into());
        let end = self.port_end.unwrap_or(config.ports.end.into());
        config.ports = PortRange::new(start, end)?;

        Ok(config)
    }
}
