use serde::Serialize;

/// Provisioning tool invoked on NixOS
pub const NIX_SHELL: &str = "nix-shell";

/// Native build dependencies of csound-api
pub const DEFAULT_PACKAGES: &[&str] = &["csound", "boost", "python27"];

/// Install instruction executed inside the provisioned shell
pub const DEFAULT_INSTALL_COMMAND: &str = "exec npm i csound-api --rebuild";

/// A single provisioning run: which packages to materialize and what to run
/// inside the resulting shell.
///
/// Consumed by the provisioner, so one request provisions at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionRequest {
    /// Packages made available in the shell, in order
    pub packages: Vec<String>,
    /// Command executed inside the shell
    pub command: String,
    /// Ask nix-shell for a build trace on failure
    pub show_trace: bool,
}

impl ProvisionRequest {
    pub fn new(packages: Vec<String>, command: impl Into<String>) -> Self {
        Self {
            packages,
            command: command.into(),
            show_trace: true,
        }
    }

    /// Arguments passed to nix-shell.
    ///
    /// No intermediate shell is involved, so each package is its own argument
    /// after `--packages` and the command is a single `--run` argument.
    pub fn shell_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.packages.len() + 4);
        args.push("--packages".to_string());
        args.extend(self.packages.iter().cloned());
        args.push("--run".to_string());
        args.push(self.command.clone());
        if self.show_trace {
            args.push("--show-trace".to_string());
        }
        args
    }

    /// Command line as a user would type it
    pub fn display_command(&self) -> String {
        let mut line = format!("{} --packages {}", NIX_SHELL, self.packages.join(" "));
        line.push_str(&format!(" --run \"{}\"", self.command));
        if self.show_trace {
            line.push_str(" --show-trace");
        }
        line
    }
}

impl Default for ProvisionRequest {
    fn default() -> Self {
        Self::new(
            DEFAULT_PACKAGES.iter().map(|p| p.to_string()).collect(),
            DEFAULT_INSTALL_COMMAND,
        )
    }
}
