// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facts about the host the adaptor runs on.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use slog::{debug, o, Logger};
use thiserror::Error;

pub const DEFAULT_RELEASE_FILE: &str = "/etc/redhat-release";
pub const DEFAULT_VIRT_WHAT: &str = "/usr/sbin/virt-what";
pub const DEFAULT_LSBLK: &str = "/bin/lsblk";

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code:?}: {stderr}")]
    Failed { program: String, code: Option<i32>, stderr: String },
}

/// Host queries needed while defining a domain.
#[cfg_attr(test, mockall::automock)]
pub trait HostProbe: Send + Sync {
    /// Whether the host is physical hardware rather than itself a guest.
    fn is_bare_metal(&self) -> Result<bool, HostError>;

    /// Filesystem UUID of a block device, exactly as reported by the host.
    fn filesystem_uuid(&self, device: &str) -> Result<String, HostError>;
}

/// [`HostProbe`] backed by `virt-what` and `lsblk`.
pub struct CommandHostProbe {
    virt_what: PathBuf,
    lsblk: PathBuf,
    log: Logger,
}

impl CommandHostProbe {
    pub fn new(
        virt_what: impl Into<PathBuf>,
        lsblk: impl Into<PathBuf>,
        log: &Logger,
    ) -> Self {
        Self {
            virt_what: virt_what.into(),
            lsblk: lsblk.into(),
            log: log.new(o!("component" => "host-probe")),
        }
    }

    fn stdout_of(&self, program: &Path, args: &[&str]) -> Result<String, HostError> {
        debug!(self.log, "executing host command";
            "program" => %program.display(), "args" => ?args);
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| HostError::Spawn {
                program: program.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(HostError::Failed {
                program: program.display().to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl HostProbe for CommandHostProbe {
    fn is_bare_metal(&self) -> Result<bool, HostError> {
        // virt-what prints one line per detected hypervisor layer.
        Ok(self.stdout_of(&self.virt_what, &[])?.is_empty())
    }

    fn filesystem_uuid(&self, device: &str) -> Result<String, HostError> {
        self.stdout_of(&self.lsblk, &["-nf", "-o", "UUID", device])
    }
}

/// The host operating system's release, as read from its release file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostRelease {
    major: Option<String>,
}

impl HostRelease {
    pub fn new(major: impl Into<String>) -> Self {
        Self { major: Some(major.into()) }
    }

    /// A release about which nothing is known.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Parses the first line of a release file, e.g.
    /// `Red Hat Enterprise Linux Server release 7.9 (Maipo)`.
    pub fn parse(contents: &str) -> Self {
        let major = contents
            .lines()
            .next()
            .and_then(|line| line.split_once("release"))
            .map(|(_, rest)| rest.trim_start())
            .and_then(|rest| rest.split(['.', ' ']).next())
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        Self { major }
    }

    pub fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn major(&self) -> Option<&str> {
        self.major.as_deref()
    }

    /// Whether instances run as units of the host's service manager, which
    /// restart and stop paths must then go through.
    pub fn delegates_to_service_manager(&self) -> bool {
        self.major() != Some("6")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn parses_release_lines() {
        let r = HostRelease::parse(
            "Red Hat Enterprise Linux Server release 7.9 (Maipo)\n",
        );
        assert_eq!(r.major(), Some("7"));
        assert!(r.delegates_to_service_manager());

        let r = HostRelease::parse("CentOS release 6.10 (Final)");
        assert_eq!(r.major(), Some("6"));
        assert!(!r.delegates_to_service_manager());

        let r = HostRelease::parse("Rocky Linux release 8 (Green Obsidian)");
        assert_eq!(r.major(), Some("8"));
    }

    #[test]
    fn unparseable_release_delegates() {
        let r = HostRelease::parse("");
        assert_eq!(r.major(), None);
        assert!(r.delegates_to_service_manager());
        assert!(HostRelease::parse("Fedora 40").major().is_none());
    }

    #[test]
    fn empty_virt_what_output_is_bare_metal() {
        let probe = CommandHostProbe::new("true", "echo", &test_logger());
        assert!(probe.is_bare_metal().unwrap());

        // Any output at all names a hypervisor.
        let probe = CommandHostProbe::new("uname", "echo", &test_logger());
        assert!(!probe.is_bare_metal().unwrap());
    }

    #[test]
    fn lsblk_arguments() {
        let probe = CommandHostProbe::new("true", "echo", &test_logger());
        assert_eq!(
            probe.filesystem_uuid("/dev/sdb").unwrap(),
            "-nf -o UUID /dev/sdb"
        );
    }

    #[test]
    fn failing_command_reports_exit_code() {
        let probe = CommandHostProbe::new("false", "false", &test_logger());
        assert!(matches!(
            probe.is_bare_metal(),
            Err(HostError::Failed { code: Some(1), .. })
        ));
    }
}
