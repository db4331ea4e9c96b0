// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde_yaml::{Mapping, Value};
use uuid::Uuid;
use vm_instance_config::DiskMount;

use super::ProvisionError;
use crate::host::HostProbe;

const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

/// Appends an fstab entry to the cloud-config `mounts` list for each disk
/// mount, identifying the filesystem by UUID.
///
/// YAML drops comments, so the `#cloud-config` header is written back
/// explicitly.
pub fn with_disk_mounts(
    user_data: &str,
    disk_mounts: &[DiskMount],
    host: &dyn HostProbe,
) -> Result<String, ProvisionError> {
    let mut doc: Value = serde_yaml::from_str(user_data)
        .map_err(|e| ProvisionError::UserData(e.to_string()))?;
    if doc.is_null() {
        doc = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = &mut doc else {
        return Err(ProvisionError::UserData(
            "user-data is not a mapping".to_string(),
        ));
    };

    let mounts = map
        .entry(Value::from("mounts"))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if mounts.is_null() {
        *mounts = Value::Sequence(Vec::new());
    }
    let Value::Sequence(mounts) = mounts else {
        return Err(ProvisionError::UserData(
            "`mounts` is not a list".to_string(),
        ));
    };

    for mount in disk_mounts {
        let uuid = filesystem_uuid(&mount.device, host)?;
        let entry = [
            format!("UUID={uuid}"),
            mount.mount_point.clone(),
            "ext4".to_string(),
            "defaults".to_string(),
            "0".to_string(),
            "0".to_string(),
        ];
        mounts.push(Value::Sequence(entry.into_iter().map(Value::from).collect()));
    }

    let body = serde_yaml::to_string(&doc)
        .map_err(|e| ProvisionError::UserData(e.to_string()))?;
    Ok(format!("{CLOUD_CONFIG_HEADER}{body}"))
}

fn filesystem_uuid(
    device: &str,
    host: &dyn HostProbe,
) -> Result<Uuid, ProvisionError> {
    let raw = host.filesystem_uuid(device).map_err(|source| {
        ProvisionError::Host { device: device.to_string(), source }
    })?;
    Uuid::parse_str(raw.trim()).map_err(|source| ProvisionError::InvalidUuid {
        device: device.to_string(),
        value: raw,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::host::MockHostProbe;

    const DATA_UUID: &str = "5b0c8a1e-7c5e-4f0f-9d55-3f3e1a9f6c11";

    fn mount(device: &str, mount_point: &str) -> DiskMount {
        DiskMount {
            device: device.to_string(),
            mount_point: mount_point.to_string(),
        }
    }

    #[test]
    fn appends_to_existing_mounts() {
        let mut host = MockHostProbe::new();
        host.expect_filesystem_uuid()
            .withf(|dev| dev == "/dev/sdb")
            .returning(|_| Ok(format!("{DATA_UUID}\n")));

        let merged = with_disk_mounts(
            "#cloud-config\nhostname: vm1\nmounts:\n- [swap, none, swap, sw, '0', '0']\n",
            &[mount("/dev/sdb", "/data")],
            &host,
        )
        .unwrap();
        assert!(merged.starts_with("#cloud-config\n"));

        let doc: Value = serde_yaml::from_str(&merged).unwrap();
        assert_eq!(doc["hostname"], Value::from("vm1"));
        let mounts = doc["mounts"].as_sequence().unwrap();
        assert_eq!(mounts.len(), 2);
        let added: Vec<&str> = mounts[1]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(
            added,
            vec![
                "UUID=5b0c8a1e-7c5e-4f0f-9d55-3f3e1a9f6c11",
                "/data",
                "ext4",
                "defaults",
                "0",
                "0"
            ]
        );
    }

    #[test]
    fn empty_user_data_gains_mounts() {
        let mut host = MockHostProbe::new();
        host.expect_filesystem_uuid()
            .returning(|_| Ok(DATA_UUID.to_string()));

        let merged =
            with_disk_mounts("", &[mount("/dev/sdc", "/logs")], &host).unwrap();
        let doc: Value = serde_yaml::from_str(&merged).unwrap();
        assert_eq!(doc["mounts"].as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn unformatted_device_is_rejected() {
        let mut host = MockHostProbe::new();
        host.expect_filesystem_uuid().returning(|_| Ok(String::new()));

        let res = with_disk_mounts(
            "#cloud-config\n",
            &[mount("/dev/sdb", "/data")],
            &host,
        );
        assert!(matches!(res, Err(ProvisionError::InvalidUuid { .. })));
    }

    #[test]
    fn non_mapping_user_data_is_rejected() {
        let host = MockHostProbe::new();
        let res = with_disk_mounts("- a\n- b\n", &[], &host);
        assert!(matches!(res, Err(ProvisionError::UserData(_))));
    }
}
