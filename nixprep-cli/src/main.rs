use anyhow::Result;
use nixprep_core::{PreinstallEngine, PreinstallReport};

mod cli;

fn main() -> Result<()> {
    let args = cli::parse_args();

    // Initialize logger with appropriate level based on verbose flag
    if std::env::var("RUST_LOG").is_err() {
        if args.verbose {
            std::env::set_var("RUST_LOG", "debug");
        } else {
            std::env::set_var("RUST_LOG", "info");
        }
    }
    env_logger::init();

    let engine = PreinstallEngine::new(args.to_config())?;
    let report = engine.run_on_host()?;

    match report {
        PreinstallReport::Skipped(ref outcome) => {
            log::debug!("Nothing to provision: {}", outcome.describe());
        }
        PreinstallReport::Planned(ref request) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(request)?);
            } else {
                println!("{}", request.display_command());
            }
        }
        PreinstallReport::Provisioned(ref outcome) => {
            if !outcome.is_success() {
                log::error!(
                    "Provisioning native dependencies failed (exit code {})",
                    outcome.exit_code()
                );
            }
        }
    }

    // Propagate provisioning failures to the package manager
    let code = report.exit_code();
    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}
