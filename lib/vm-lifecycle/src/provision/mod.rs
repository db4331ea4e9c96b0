// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Defining a domain from an instance's configuration.
//!
//! Definition writes the first-boot media and the instance's copy of its
//! base image into the instance directory, then submits a domain
//! description to the hypervisor. Nothing is rolled back on failure: the
//! next start cleans the instance directory if its configuration drifted,
//! and otherwise overwrites what was left behind.

use std::fs;
use std::path::{Path, PathBuf};

use slog::{debug, info, o, warn, Logger};
use thiserror::Error;
use vm_instance_config::{
    ConfigError, ConfigStore, META_DATA, NETWORK_CONFIG, USER_DATA,
};

use crate::host::{HostError, HostProbe};
use crate::hypervisor::{Connection, HypervisorError};
use crate::settings::AdaptorSettings;

pub mod cidata;
pub mod domain_xml;
pub mod numa;
pub mod user_data;

pub use domain_xml::DomainSpec;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unsupported ram size {0:?}, expected a size in MiB such as \"1024M\"")]
    InvalidRam(String),

    #[error("failed to {what} {}: {source}", path.display())]
    Io {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid user-data: {0}")]
    UserData(String),

    #[error("cannot look up filesystem of {device}: {source}")]
    Host {
        device: String,
        #[source]
        source: HostError,
    },

    #[error("device {device} has no valid filesystem UUID ({value:?}): {source}")]
    InvalidUuid {
        device: String,
        value: String,
        #[source]
        source: uuid::Error,
    },

    #[error("failed to build cloud-init image: {0}")]
    Cidata(String),

    #[error("domain would need {0} disks, more than vda..vdz can hold")]
    TooManyDisks(usize),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

impl ProvisionError {
    fn io(what: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io { what, path: path.to_path_buf(), source }
    }
}

/// Builds and submits domain definitions.
pub struct Provisioner {
    settings: AdaptorSettings,
    host: Box<dyn HostProbe>,
    log: Logger,
}

impl Provisioner {
    pub fn new(
        settings: AdaptorSettings,
        host: Box<dyn HostProbe>,
        log: &Logger,
    ) -> Self {
        Self { settings, host, log: log.new(o!("component" => "provisioner")) }
    }

    /// Location of a base image named by an instance configuration.
    pub fn base_image_path(&self, image: &str) -> PathBuf {
        self.settings.images_dir.join(image)
    }

    /// Defines the domain for `store`'s instance on `conn`.
    pub fn define(
        &self,
        store: &ConfigStore,
        conn: &dyn Connection,
    ) -> Result<(), ProvisionError> {
        let doc = store.read_config()?;
        let vm = &doc.vm_data;
        let adaptor = &doc.adaptor_data;
        let memory_mib = domain_xml::parse_ram(&vm.ram)?;

        let cidata_image = store.cloud_init_image_path();
        self.write_cidata(store, &cidata_image)?;

        let base = self.base_image_path(&vm.image);
        let image = store.instance_image_path()?;
        info!(self.log, "copying base image";
            "from" => %base.display(), "to" => %image.display());
        fs::copy(&base, &image)
            .map_err(|e| ProvisionError::io("copy", &base, e))?;

        let cpuset = match (&vm.cpuset, &vm.cpunodebind) {
            (Some(cpuset), _) => Some(cpuset.clone()),
            (None, Some(nodes)) => self.nodes_cpuset(conn, nodes)?,
            (None, None) => None,
        };

        let bare_metal = self.host.is_bare_metal().unwrap_or_else(|e| {
            warn!(self.log, "cannot tell whether host is virtualized";
                "error" => %e);
            false
        });

        let mut nics: Vec<_> = vm.interfaces.iter().collect();
        nics.sort_by(|(a, _), (b, _)| domain_xml::natural_cmp(a, b));

        let spec = DomainSpec {
            name: store.name().to_string(),
            memory_mib,
            vcpus: vm.cpu,
            cpuset,
            bare_metal,
            machine_type: self.settings.machine_type.clone(),
            emulator: self.settings.emulator.clone(),
            image,
            block_devices: adaptor.block_devices().map(str::to_string).collect(),
            interfaces: nics.into_iter().map(|(_, nic)| nic.clone()).collect(),
            cidata_image,
        };
        let xml = spec.to_xml()?;
        debug!(self.log, "domain description"; "xml" => &xml);

        conn.define(&xml)?;
        info!(self.log, "domain \"{}\" defined", store.name());
        Ok(())
    }

    fn write_cidata(
        &self,
        store: &ConfigStore,
        dest: &Path,
    ) -> Result<(), ProvisionError> {
        let read = |file: &str| -> Result<Vec<u8>, ProvisionError> {
            let path = store.desired_path(file);
            match fs::read(&path) {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(self.log, "no {} for instance", file);
                    Ok(Vec::new())
                }
                Err(e) => Err(ProvisionError::io("read", &path, e)),
            }
        };

        let mut user_data = read(USER_DATA)?;
        let mounts = &store.adaptor_data()?.disk_mounts;
        if !mounts.is_empty() {
            let text = String::from_utf8(user_data)
                .map_err(|e| ProvisionError::UserData(e.to_string()))?;
            user_data =
                user_data::with_disk_mounts(&text, mounts, self.host.as_ref())?
                    .into_bytes();
        }

        let image = cidata::build_cidata_image(&[
            (USER_DATA, user_data),
            (META_DATA, read(META_DATA)?),
            (NETWORK_CONFIG, read(NETWORK_CONFIG)?),
        ])?;
        info!(self.log, "writing cloud-init image"; "path" => %dest.display());
        fs::write(dest, image).map_err(|e| ProvisionError::io("write", dest, e))
    }

    /// Resolves comma-separated NUMA node ids to the CPUs they contain.
    /// Unknown nodes are skipped; `None` when no node resolves.
    fn nodes_cpuset(
        &self,
        conn: &dyn Connection,
        nodes: &str,
    ) -> Result<Option<String>, ProvisionError> {
        let cells = numa::cell_cpusets(&conn.capabilities()?);
        let mut sets = Vec::new();
        for node in nodes.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match cells.get(node) {
                Some(cpus) if !cpus.is_empty() => sets.push(cpus.as_str()),
                _ => {
                    warn!(self.log, "NUMA node {} not found on host", node;
                        "known" => ?cells.keys().collect::<Vec<_>>());
                }
            }
        }
        Ok((!sets.is_empty()).then(|| sets.join(",")))
    }
}
