// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::DEFAULT_HEALTH_PORT;
use crate::host::{DEFAULT_LSBLK, DEFAULT_RELEASE_FILE, DEFAULT_VIRT_WHAT};
use crate::hypervisor::virsh::DEFAULT_VIRSH;
use crate::hypervisor::DEFAULT_URI;
use crate::service::DEFAULT_SYSTEMCTL;

/// Host-wide settings of the adaptor, shared by every instance.
///
/// Every field has a default matching the standard host layout; a TOML file
/// need only name the fields it changes:
///
/// ```toml
/// instances-dir = "/srv/vm/instances"
/// stop-grace-polls = 60
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct AdaptorSettings {
    /// Parent of the per-instance directories.
    pub instances_dir: PathBuf,

    /// Location of base images named by instance configurations.
    pub images_dir: PathBuf,

    pub connect_uri: String,

    pub virsh: PathBuf,
    pub systemctl: PathBuf,
    pub virt_what: PathBuf,
    pub lsblk: PathBuf,

    /// File the host's OS release is read from.
    pub release_file: PathBuf,

    /// Emulator binary named in domain definitions.
    pub emulator: PathBuf,

    /// Machine type named in domain definitions.
    pub machine_type: String,

    pub health_check_port: u16,

    /// Seconds between health probes while waiting for a guest to become
    /// healthy.
    pub health_check_interval: u64,

    /// Seconds before a single health probe gives up. Zero disables the
    /// limit.
    pub health_probe_timeout: u64,

    /// Seconds between state polls.
    pub poll_interval: u64,

    /// Polls between repeated ACPI shutdown requests.
    pub stop_grace_polls: u64,

    /// Seconds to wait for a domain to start when its configuration does
    /// not say.
    pub default_start_timeout: u64,

    /// How many times force-stop looks for a running domain before giving
    /// up on it.
    pub force_stop_attempts: u32,

    /// Seconds between those looks.
    pub force_stop_retry_delay: u64,
}

impl Default for AdaptorSettings {
    fn default() -> Self {
        Self {
            instances_dir: PathBuf::from("/var/lib/libvirt/instances"),
            images_dir: PathBuf::from("/var/lib/libvirt/images"),
            connect_uri: DEFAULT_URI.to_string(),
            virsh: PathBuf::from(DEFAULT_VIRSH),
            systemctl: PathBuf::from(DEFAULT_SYSTEMCTL),
            virt_what: PathBuf::from(DEFAULT_VIRT_WHAT),
            lsblk: PathBuf::from(DEFAULT_LSBLK),
            release_file: PathBuf::from(DEFAULT_RELEASE_FILE),
            emulator: PathBuf::from("/usr/libexec/qemu-kvm"),
            machine_type: "pc".to_string(),
            health_check_port: DEFAULT_HEALTH_PORT,
            health_check_interval: 5,
            health_probe_timeout: 30,
            poll_interval: 1,
            stop_grace_polls: 30,
            default_start_timeout: 45,
            force_stop_attempts: 3,
            force_stop_retry_delay: 5,
        }
    }
}

impl AdaptorSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| {
            SettingsError::Read { path: path.to_path_buf(), source }
        })?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn health_probe_timeout(&self) -> Option<Duration> {
        match self.health_probe_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn force_stop_retry_delay(&self) -> Duration {
        Duration::from_secs(self.force_stop_retry_delay)
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("cannot read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse settings: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let s: AdaptorSettings = toml::from_str(
            r#"
            instances-dir = "/srv/vm"
            stop-grace-polls = 60
            health-probe-timeout = 0
            "#,
        )
        .unwrap();
        assert_eq!(s.instances_dir, PathBuf::from("/srv/vm"));
        assert_eq!(s.stop_grace_polls, 60);
        assert_eq!(s.health_probe_timeout(), None);
        assert_eq!(s.images_dir, AdaptorSettings::default().images_dir);
        assert_eq!(s.connect_uri, "qemu:///system");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let res: Result<AdaptorSettings, _> =
            toml::from_str("instance-dir = \"/typo\"");
        assert!(res.is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = AdaptorSettings::load("/nonexistent/adaptor.toml").unwrap_err();
        assert!(matches!(err, SettingsError::Read { .. }));
    }
}
