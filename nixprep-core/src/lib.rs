use anyhow::Result;
use std::path::{Path, PathBuf};

pub mod probe;
pub mod provisioner;
pub mod request;
pub mod transcript;

// Re-export public types
pub use probe::{probe, should_provision, HostSystem, ProbeOutcome, SystemIdentity, TargetMarker};
pub use provisioner::{
    provision, provision_with_output, Launcher, NixShell, OutputCallback, OutputLine,
    ProvisionEvent, ProvisionOutcome, Stream,
};
pub use request::ProvisionRequest;
pub use transcript::Transcript;

/// Number of transcripts kept in a directory after a run
const TRANSCRIPTS_TO_KEEP: usize = 5;

/// Configuration for the preinstall hook
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Packages made available in the provisioned shell
    pub packages: Vec<String>,
    /// Command executed inside the provisioned shell
    pub command: String,
    /// Ask nix-shell for a build trace on failure
    pub show_trace: bool,
    /// Pattern identifying NixOS in `uname -a` output
    pub marker: String,
    /// Provisioning tool, looked up in PATH unless absolute
    pub program: PathBuf,
    /// Provision without probing the host
    pub force: bool,
    /// Decide and report, but spawn nothing
    pub dry_run: bool,
    /// Directory to write a transcript of the run into
    pub transcript_dir: Option<PathBuf>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        let request = ProvisionRequest::default();
        Self {
            packages: request.packages,
            command: request.command,
            show_trace: request.show_trace,
            marker: probe::DEFAULT_MARKER.to_string(),
            program: PathBuf::from(request::NIX_SHELL),
            force: false,
            dry_run: false,
            transcript_dir: None,
        }
    }
}

/// What the engine decided to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Skip(ProbeOutcome),
    Provision(ProvisionRequest),
}

/// Result of a preinstall run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreinstallReport {
    /// Host is not the target; nothing was spawned
    Skipped(ProbeOutcome),
    /// Dry run; the request that would have been provisioned
    Planned(ProvisionRequest),
    Provisioned(ProvisionOutcome),
}

impl PreinstallReport {
    /// Exit status for the hook process
    pub fn exit_code(&self) -> i32 {
        match self {
            PreinstallReport::Skipped(_) | PreinstallReport::Planned(_) => 0,
            PreinstallReport::Provisioned(outcome) => outcome.exit_code(),
        }
    }
}

/// Probes the host and provisions native build dependencies when needed
pub struct PreinstallEngine {
    config: ProvisionConfig,
    marker: TargetMarker,
}

impl PreinstallEngine {
    /// Create an engine; fails if the marker is not a valid pattern
    pub fn new(config: ProvisionConfig) -> Result<Self> {
        if config.packages.is_empty() {
            anyhow::bail!("At least one package is required for provisioning");
        }
        let marker = TargetMarker::new(&config.marker)?;
        Ok(Self { config, marker })
    }

    /// The request this engine provisions
    pub fn request(&self) -> ProvisionRequest {
        let mut request = ProvisionRequest::new(self.config.packages.clone(), &self.config.command);
        request.show_trace = self.config.show_trace;
        request
    }

    /// Decide whether to provision on `identity`
    pub fn plan(&self, identity: &dyn SystemIdentity) -> Plan {
        if self.config.force {
            log::debug!("Provisioning forced, skipping probe");
            return Plan::Provision(self.request());
        }

        let outcome = probe(identity, &self.marker);
        if outcome.should_provision() {
            Plan::Provision(self.request())
        } else {
            Plan::Skip(outcome)
        }
    }

    /// Probe and provision this machine with the configured tool
    pub fn run_on_host(&self) -> Result<PreinstallReport> {
        self.run(&HostSystem::default(), &NixShell::new(self.config.program.clone()))
    }

    /// Probe `identity` and, if it is the target, provision through `launcher`
    pub fn run(
        &self,
        identity: &dyn SystemIdentity,
        launcher: &dyn Launcher,
    ) -> Result<PreinstallReport> {
        let request = match self.plan(identity) {
            Plan::Skip(outcome) => {
                log::debug!("Skipping provisioning: {}", outcome.describe());
                return Ok(PreinstallReport::Skipped(outcome));
            }
            Plan::Provision(request) => request,
        };

        if self.config.dry_run {
            log::info!("[DRY RUN] Would run: {}", request.display_command());
            return Ok(PreinstallReport::Planned(request));
        }

        if self.config.force {
            log::warn!("Provisioning forced, running `{}`", request.display_command());
        } else {
            log::warn!("NixOS detected, running `{}`", request.display_command());
        }

        let transcript = self
            .config
            .transcript_dir
            .as_deref()
            .and_then(open_transcript);
        if let Some(ref transcript) = transcript {
            transcript.info(&format!("Running: {}", request.display_command()));
        }

        let callback: Option<OutputCallback> = transcript.clone().map(|sink| {
            Box::new(move |event: &ProvisionEvent| {
                provisioner::print_event(event);
                sink.record_event(event);
            }) as OutputCallback
        });

        let outcome = provision_with_output(launcher, request, callback);

        if let Some(transcript) = transcript {
            if let ProvisionOutcome::SpawnError(ref cause) = outcome {
                transcript.error(&format!("Failed to launch provisioning shell: {}", cause));
            }
            transcript.finalize();
            log::info!("Transcript saved to {}", transcript.path().display());
        }

        Ok(PreinstallReport::Provisioned(outcome))
    }
}

/// Opens a transcript in `dir`, creating the directory if needed.
///
/// The transcript is optional: failures are logged and provisioning goes on
/// without one.
fn open_transcript(dir: &Path) -> Option<Transcript> {
    if let Err(e) = std::fs::create_dir_all(dir) {
        log::warn!(
            "Cannot create transcript directory {}: {}. Continuing without a transcript",
            dir.display(),
            e
        );
        return None;
    }

    if let Err(e) = Transcript::cleanup_old(dir, TRANSCRIPTS_TO_KEEP - 1) {
        log::debug!("Transcript cleanup failed: {:#}", e);
    }

    match Transcript::create_in(dir) {
        Ok(transcript) => {
            log::info!("Writing transcript to {}", transcript.path().display());
            Some(transcript)
        }
        Err(e) => {
            log::warn!("{:#}. Continuing without a transcript", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::tests::FakeSystem;
    use crate::provisioner::tests::ScriptLauncher;
    use tempfile::TempDir;

    fn engine(config: ProvisionConfig) -> PreinstallEngine {
        PreinstallEngine::new(config).unwrap()
    }

    #[test]
    fn test_darwin_spawns_nothing() -> Result<()> {
        let system = FakeSystem::new("darwin", Some("Darwin host 23.1.0"));
        let launcher = ScriptLauncher::new("exit 0");

        let report = engine(ProvisionConfig::default()).run(&system, &launcher)?;

        assert!(matches!(report, PreinstallReport::Skipped(ProbeOutcome::UnsupportedPlatform(_))));
        assert_eq!(report.exit_code(), 0);
        assert_eq!(system.calls.get(), 0);
        assert!(launcher.requests.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_ubuntu_is_not_provisioned() -> Result<()> {
        let system = FakeSystem::new("linux", Some("Linux ubuntu-focal"));
        let launcher = ScriptLauncher::new("exit 0");

        let report = engine(ProvisionConfig::default()).run(&system, &launcher)?;

        assert!(matches!(report, PreinstallReport::Skipped(_)));
        assert_eq!(system.calls.get(), 1);
        assert!(launcher.requests.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_uname_is_not_provisioned() -> Result<()> {
        let system = FakeSystem::new("linux", None);
        let launcher = ScriptLauncher::new("exit 0");

        let report = engine(ProvisionConfig::default()).run(&system, &launcher)?;

        assert!(matches!(report, PreinstallReport::Skipped(ProbeOutcome::ProbeUnavailable(_))));
        assert!(launcher.requests.borrow().is_empty());
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_nixos_provisions_once_with_fixed_request() -> Result<()> {
        let system = FakeSystem::new("linux", Some("Linux nixos-22.05"));
        let launcher = ScriptLauncher::new("printf 'building...\\n'; exit 0");

        let report = engine(ProvisionConfig::default()).run(&system, &launcher)?;

        assert_eq!(report, PreinstallReport::Provisioned(ProvisionOutcome::Success));
        assert_eq!(report.exit_code(), 0);

        let requests = launcher.requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].packages, vec!["csound", "boost", "python27"]);
        assert!(requests[0].command.contains("npm i csound-api --rebuild"));
        assert!(requests[0].shell_args().contains(&"--show-trace".to_string()));
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_failed_provisioning_propagates_exit_code() -> Result<()> {
        let system = FakeSystem::new("linux", Some("Linux nixos 6.1.55"));
        let launcher = ScriptLauncher::new("exit 1");

        let report = engine(ProvisionConfig::default()).run(&system, &launcher)?;

        assert_eq!(report, PreinstallReport::Provisioned(ProvisionOutcome::Failed(Some(1))));
        assert_ne!(report.exit_code(), 0);
        Ok(())
    }

    #[test]
    fn test_missing_tool_propagates_spawn_error() -> Result<()> {
        let system = FakeSystem::new("linux", Some("Linux nixos 6.1.55"));
        let launcher = NixShell::new("/nonexistent/bin/nix-shell-missing");

        let report = engine(ProvisionConfig::default()).run(&system, &launcher)?;

        assert!(matches!(
            report,
            PreinstallReport::Provisioned(ProvisionOutcome::SpawnError(_))
        ));
        assert_eq!(report.exit_code(), provisioner::SPAWN_FAILURE_EXIT_CODE);
        Ok(())
    }

    #[test]
    fn test_dry_run_spawns_nothing() -> Result<()> {
        let system = FakeSystem::new("linux", Some("Linux nixos 6.1.55"));
        let launcher = ScriptLauncher::new("exit 1");
        let config = ProvisionConfig {
            dry_run: true,
            ..Default::default()
        };

        let report = engine(config).run(&system, &launcher)?;

        assert_eq!(report, PreinstallReport::Planned(ProvisionRequest::default()));
        assert_eq!(report.exit_code(), 0);
        assert!(launcher.requests.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_force_skips_probe() {
        let system = FakeSystem::new("macos", None);
        let config = ProvisionConfig {
            force: true,
            ..Default::default()
        };

        let plan = engine(config).plan(&system);

        assert_eq!(plan, Plan::Provision(ProvisionRequest::default()));
        assert_eq!(system.calls.get(), 0);
    }

    #[test]
    fn test_custom_request_from_config() {
        let config = ProvisionConfig {
            packages: vec!["hello".to_string()],
            command: "hello --version".to_string(),
            show_trace: false,
            ..Default::default()
        };

        let request = engine(config).request();

        assert_eq!(request.packages, vec!["hello"]);
        assert_eq!(request.command, "hello --version");
        assert!(!request.show_trace);
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let bad_marker = ProvisionConfig {
            marker: "Linux (nixos".to_string(),
            ..Default::default()
        };
        assert!(PreinstallEngine::new(bad_marker).is_err());

        let no_packages = ProvisionConfig {
            packages: vec![],
            ..Default::default()
        };
        assert!(PreinstallEngine::new(no_packages).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_transcript_written_for_run() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let system = FakeSystem::new("linux", Some("Linux nixos 6.1.55"));
        let launcher = ScriptLauncher::new("echo compiling csound-api; echo warning >&2; exit 2");
        let config = ProvisionConfig {
            transcript_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let report = engine(config).run(&system, &launcher)?;
        assert_eq!(report.exit_code(), 2);

        let transcripts: Vec<_> = std::fs::read_dir(temp_dir.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        assert_eq!(transcripts.len(), 1);

        let contents = std::fs::read_to_string(&transcripts[0])?;
        assert!(contents.contains("Running: nix-shell --packages csound boost python27"));
        assert!(contents.contains("stdout: compiling csound-api"));
        assert!(contents.contains("stderr: warning"));
        assert!(contents.contains("child process exited with code 2"));
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_transcript_directory_is_created() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let nested = temp_dir.path().join("logs").join("nixprep");
        let system = FakeSystem::new("linux", Some("Linux nixos 6.1.55"));
        let launcher = ScriptLauncher::new("echo linked; exit 0");
        let config = ProvisionConfig {
            transcript_dir: Some(nested.clone()),
            ..Default::default()
        };

        let report = engine(config).run(&system, &launcher)?;

        assert_eq!(report, PreinstallReport::Provisioned(ProvisionOutcome::Success));
        let transcripts: Vec<_> = std::fs::read_dir(&nested)?
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(transcripts.len(), 1);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_unusable_transcript_directory_still_provisions() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let blocker = temp_dir.path().join("not-a-directory");
        std::fs::write(&blocker, "file")?;
        let system = FakeSystem::new("linux", Some("Linux nixos 6.1.55"));
        let launcher = ScriptLauncher::new("exit 0");
        let config = ProvisionConfig {
            transcript_dir: Some(blocker.join("logs")),
            ..Default::default()
        };

        let report = engine(config).run(&system, &launcher)?;

        assert_eq!(report, PreinstallReport::Provisioned(ProvisionOutcome::Success));
        assert_eq!(launcher.requests.borrow().len(), 1);
        Ok(())
    }
}
