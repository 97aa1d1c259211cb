//! Environment probing: decides whether the host is a NixOS machine.
//!
//! The probe never fails. An unsupported platform or an identification
//! command that cannot run both resolve to "do not provision".

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::PathBuf;
use std::process::Command;

/// Marker matched against the identification output
pub const DEFAULT_MARKER: &str = "Linux nixos";

/// Command used to identify the running kernel and host
pub const IDENTIFY_COMMAND: &str = "uname";

lazy_static! {
    static ref DEFAULT_MARKER_RE: Regex =
        Regex::new(DEFAULT_MARKER).expect("default marker is a valid pattern");
}

/// Source of the host's operating system identity
pub trait SystemIdentity {
    /// Kernel family, as reported by `std::env::consts::OS`
    fn platform(&self) -> String;

    /// Runs the identification command and returns its standard output
    fn identify(&self) -> Result<String>;
}

/// The machine this process is running on
#[derive(Debug, Clone)]
pub struct HostSystem {
    program: PathBuf,
}

impl HostSystem {
    /// Identify the host with `program -a` instead of `uname -a`
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for HostSystem {
    fn default() -> Self {
        Self::with_program(IDENTIFY_COMMAND)
    }
}

impl SystemIdentity for HostSystem {
    fn platform(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn identify(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("-a")
            .output()
            .with_context(|| format!("Failed to execute {} -a", self.program.display()))?;

        if !output.status.success() {
            anyhow::bail!("{} -a exited with {}", self.program.display(), output.status);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Pattern identifying the target distribution in the identification output.
///
/// Matching is case-sensitive and unanchored, so a marker without regex
/// metacharacters behaves as a plain substring test. Any host whose `uname -a`
/// output happens to contain the marker (a hostname, for instance) is
/// treated as the target.
#[derive(Debug, Clone)]
pub struct TargetMarker {
    pattern: Regex,
}

impl TargetMarker {
    /// Compile a marker pattern
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("Invalid distribution marker: {:?}", pattern))?;
        Ok(Self { pattern })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn is_match(&self, identification: &str) -> bool {
        self.pattern.is_match(identification)
    }
}

impl Default for TargetMarker {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_MARKER_RE.clone(),
        }
    }
}

/// Result of probing the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Not a Linux kernel; the identification command was never run
    UnsupportedPlatform(String),
    /// Linux, but the identification command failed or is missing
    ProbeUnavailable(String),
    /// Identification succeeded
    Detected {
        matched: bool,
        identification: String,
    },
}

impl ProbeOutcome {
    /// Only a successful identification containing the marker provisions
    pub fn should_provision(&self) -> bool {
        matches!(self, ProbeOutcome::Detected { matched: true, .. })
    }

    /// Short human-readable explanation, used in skip messages
    pub fn describe(&self) -> String {
        match self {
            ProbeOutcome::UnsupportedPlatform(platform) => {
                format!("platform {} is not linux", platform)
            }
            ProbeOutcome::ProbeUnavailable(reason) => {
                format!("system identification unavailable ({})", reason)
            }
            ProbeOutcome::Detected { matched: true, .. } => "NixOS detected".to_string(),
            ProbeOutcome::Detected { matched: false, .. } => "not a NixOS host".to_string(),
        }
    }
}

/// Probes the given system for the target distribution
pub fn probe(identity: &dyn SystemIdentity, marker: &TargetMarker) -> ProbeOutcome {
    let platform = identity.platform();
    if platform != "linux" {
        log::debug!("Skipping identification on platform {}", platform);
        return ProbeOutcome::UnsupportedPlatform(platform);
    }

    match identity.identify() {
        Ok(identification) => {
            let matched = marker.is_match(&identification);
            log::debug!(
                "Identification {:?} {} marker {:?}",
                identification.trim_end(),
                if matched { "matches" } else { "does not match" },
                marker.as_str()
            );
            ProbeOutcome::Detected {
                matched,
                identification,
            }
        }
        Err(e) => {
            // Safe default: an undetectable platform is not the target
            log::debug!("System identification failed: {:#}", e);
            ProbeOutcome::ProbeUnavailable(format!("{:#}", e))
        }
    }
}

/// Probes this machine with the default marker
pub fn should_provision() -> bool {
    probe(&HostSystem::default(), &TargetMarker::default()).should_provision()
}
