//! Command-line surface (§6): `dev`, `build`, `start`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::CliOverrides;
use crate::options::Env;

#[derive(Parser, Debug)]
#[command(name = "titan", author, version, about = "File-routed HTTP API framework with an integrated dev loop")]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the dev loop: watch, rebuild incrementally, serve, publish telemetry.
    Dev {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        verbose: bool,
        #[arg(long = "no-watch")]
        no_watch: bool,
        #[arg(long = "no-studio")]
        no_studio: bool,
    },
    /// Run one full build and exit.
    Build {
        #[arg(long)]
        verbose: bool,
    },
    /// Serve the previously built output without watching for changes.
    Start {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        verbose: bool,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        https: bool,
        #[arg(long)]
        cert: Option<PathBuf>,
        #[arg(long)]
        key: Option<PathBuf>,
    },
}

/// What the rest of the program needs to know, independent of which
/// subcommand was invoked.
pub struct Resolved {
    pub command: crate::options::Command,
    pub env: Env,
    pub overrides: CliOverrides,
    pub watch: bool,
    pub tls: Option<TlsConfig>,
}

pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Cli {
    pub fn resolve(self) -> Resolved {
        match self.command {
            CliCommand::Dev { port, host, verbose, no_watch, no_studio } => Resolved {
                command: crate::options::Command::Dev,
                env: Env::Dev,
                overrides: CliOverrides { port, host, verbose, output_root: None, no_studio },
                watch: !no_watch,
                tls: None,
            },
            CliCommand::Build { verbose } => Resolved {
                command: crate::options::Command::Build,
                env: Env::Prod,
                overrides: CliOverrides { port: None, host: None, verbose, output_root: None, no_studio: true },
                watch: false,
                tls: None,
            },
            CliCommand::Start { port, host, verbose, output, https, cert, key } => {
                let output_root = output.map(|p| p.to_string_lossy().into_owned());
                let tls = if https {
                    match (cert, key) {
                        (Some(cert), Some(key)) => Some(TlsConfig { cert, key }),
                        _ => {
                            tracing::warn!("--https given without both --cert and --key; serving plain HTTP");
                            None
                        }
                    }
                } else {
                    None
                };
                Resolved {
                    command: crate::options::Command::Start,
                    env: Env::Prod,
                    overrides: CliOverrides { port, host, verbose, output_root, no_studio: false },
                    watch: false,
                    tls,
                }
            }
        }
    }
}
