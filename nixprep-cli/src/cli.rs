use clap::Parser;
use nixprep_core::ProvisionConfig;
use std::path::PathBuf;

/// Provisions csound-api's native build dependencies through nix-shell on NixOS
#[derive(Parser, Debug)]
#[command(name = "nixprep")]
#[command(author = "4n6h4x0r")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Runs the csound-api install inside nix-shell when on NixOS",
    long_about = None
)]
pub struct Args {
    /// Package to make available in the shell (repeatable, replaces the defaults)
    #[arg(short = 'p', long = "package", value_name = "PACKAGE")]
    pub packages: Vec<String>,

    /// Command to run inside the provisioned shell
    #[arg(long = "run", value_name = "COMMAND")]
    pub run: Option<String>,

    /// Pattern identifying NixOS in `uname -a` output
    #[arg(long = "marker", value_name = "PATTERN")]
    pub marker: Option<String>,

    /// Path or name of the nix-shell binary
    #[arg(long = "nix-shell", value_name = "PATH")]
    pub nix_shell: Option<PathBuf>,

    /// Do not pass --show-trace to nix-shell
    #[arg(long = "no-show-trace")]
    pub no_show_trace: bool,

    /// Provision even when the host is not detected as NixOS
    #[arg(long = "force")]
    pub force: bool,

    /// Show what would be run without spawning nix-shell
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Print the dry-run plan as JSON
    #[arg(long = "json", requires = "dry_run")]
    pub json: bool,

    /// Save a transcript of the run (defaults to the temp directory)
    #[arg(long = "transcript", value_name = "DIR", num_args = 0..=1)]
    pub transcript: Option<Option<PathBuf>>,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Args {
    /// Builds the engine configuration, keeping defaults for anything unset
    pub fn to_config(&self) -> ProvisionConfig {
        let mut config = ProvisionConfig::default();

        if !self.packages.is_empty() {
            config.packages = self.packages.clone();
        }
        if let Some(ref run) = self.run {
            config.command = run.clone();
        }
        if let Some(ref marker) = self.marker {
            config.marker = marker.clone();
        }
        if let Some(ref nix_shell) = self.nix_shell {
            config.program = nix_shell.clone();
        }

        config.show_trace = !self.no_show_trace; // Inverted: trace is the default
        config.force = self.force;
        config.dry_run = self.dry_run;
        config.transcript_dir = self
            .transcript
            .as_ref()
            .map(|dir| dir.clone().unwrap_or_else(std::env::temp_dir));

        config
    }
}

/// Parses command-line arguments
pub fn parse_args() -> Args {
    Args::parse()
}
