// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde_derive::{Deserialize, Serialize};

/// The declarative description of a single instance, as persisted in the
/// instance's `config.json`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ConfigDocument {
    pub vm_data: VmData,
    pub adaptor_data: AdaptorData,
}

/// Hardware description of the guest.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct VmData {
    /// Number of vCPUs. Accepted as either a JSON number or a numeric string.
    #[serde(deserialize_with = "lenient_count")]
    pub cpu: u32,

    /// Memory size with a unit suffix, e.g. `1024M`.
    pub ram: String,

    /// File name of the base image, relative to the image root.
    pub image: String,

    #[serde(default)]
    pub interfaces: BTreeMap<String, Interface>,

    /// Explicit host CPU list for vCPU placement. Takes precedence over
    /// `cpunodebind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpuset: Option<String>,

    /// Comma-separated NUMA node ids whose CPUs the vCPUs may run on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpunodebind: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Interface {
    /// Host bridge the NIC is attached to.
    pub host_device: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Parameters controlling how the adaptor drives the instance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AdaptorData {
    /// Seconds to wait for the domain to report running.
    #[serde(
        default,
        rename = "start-timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_timeout: Option<u64>,

    /// Seconds to wait for a graceful shutdown. Zero or absent waits
    /// indefinitely.
    #[serde(
        default,
        rename = "stop-timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_status_check: Option<HealthCheck>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disk_mounts: Vec<DiskMount>,
}

impl AdaptorData {
    /// Host block devices passed through to the guest, in configured order.
    pub fn block_devices(&self) -> impl Iterator<Item = &str> {
        self.disk_mounts.iter().map(|m| m.device.as_str())
    }
}

/// Application-level health endpoint exposed by the guest.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub active: CheckState,
    pub ip_address: String,
}

impl HealthCheck {
    pub fn is_active(&self) -> bool {
        self.active == CheckState::On
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    On,
    Off,
}

/// A host block device and the guest path it should be mounted on.
///
/// Serialized as a two element array, `["/dev/sdb", "/data"]`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct DiskMount {
    pub device: String,
    pub mount_point: String,
}

impl From<(String, String)> for DiskMount {
    fn from((device, mount_point): (String, String)) -> Self {
        Self { device, mount_point }
    }
}

impl From<DiskMount> for (String, String) {
    fn from(m: DiskMount) -> Self {
        (m.device, m.mount_point)
    }
}

fn lenient_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    struct CountVisitor;

    impl<'de> Visitor<'de> for CountVisitor {
        type Value = u32;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a positive integer or a string holding one")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u32, E> {
            u32::try_from(v).map_err(|_| E::custom(format!("{v} is too large")))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u32, E> {
            u32::try_from(v).map_err(|_| E::custom(format!("invalid count {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u32, E> {
            v.trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid count {v:?}")))
        }
    }

    deserializer.deserialize_any(CountVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "vm_data": {
            "cpu": "2",
            "ram": "1024M",
            "image": "base.qcow2",
            "interfaces": {
                "eth1": {"host_device": "br1"},
                "eth0": {"host_device": "br0", "mac_address": "52:54:00:aa:bb:cc"}
            },
            "cpunodebind": "0,1"
        },
        "adaptor_data": {
            "start-timeout": 60,
            "internal_status_check": {"active": "on", "ip_address": "10.0.0.2"},
            "disk_mounts": [["/dev/sdb", "/data"]]
        }
    }"#;

    #[test]
    fn parses_full_document() {
        let doc: ConfigDocument = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(doc.vm_data.cpu, 2);
        assert_eq!(doc.vm_data.interfaces.len(), 2);
        assert_eq!(
            doc.vm_data.interfaces["eth0"].mac_address.as_deref(),
            Some("52:54:00:aa:bb:cc")
        );
        assert_eq!(doc.vm_data.cpuset, None);
        assert_eq!(doc.adaptor_data.start_timeout, Some(60));
        assert_eq!(doc.adaptor_data.stop_timeout, None);

        let check = doc.adaptor_data.internal_status_check.as_ref().unwrap();
        assert!(check.is_active());
        assert_eq!(check.ip_address, "10.0.0.2");

        let devices: Vec<_> = doc.adaptor_data.block_devices().collect();
        assert_eq!(devices, vec!["/dev/sdb"]);
        assert_eq!(doc.adaptor_data.disk_mounts[0].mount_point, "/data");
    }

    #[test]
    fn cpu_accepts_number() {
        let doc: ConfigDocument = serde_json::from_str(
            r#"{"vm_data": {"cpu": 4, "ram": "512M", "image": "a.qcow2"},
                "adaptor_data": {}}"#,
        )
        .unwrap();
        assert_eq!(doc.vm_data.cpu, 4);
        assert!(doc.vm_data.interfaces.is_empty());
    }

    #[test]
    fn cpu_rejects_garbage() {
        let res: Result<ConfigDocument, _> = serde_json::from_str(
            r#"{"vm_data": {"cpu": "two", "ram": "512M", "image": "a"},
                "adaptor_data": {}}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn inactive_check_parses() {
        let check: HealthCheck = serde_json::from_str(
            r#"{"active": "off", "ip_address": "10.0.0.2"}"#,
        )
        .unwrap();
        assert!(!check.is_active());
    }
}
