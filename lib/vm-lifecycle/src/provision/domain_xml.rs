// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendering of libvirt domain definitions.

use std::cmp::Ordering;
use std::fmt::{self, Write};
use std::path::PathBuf;

use vm_instance_config::Interface;

use super::ProvisionError;

/// Everything needed to describe a domain to the hypervisor.
#[derive(Clone, Debug)]
pub struct DomainSpec {
    pub name: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    /// Host CPUs the vCPUs may be placed on.
    pub cpuset: Option<String>,
    /// Pass the host CPU model through and attach a virtio RNG; only
    /// meaningful when the host is not itself virtualized.
    pub bare_metal: bool,
    pub machine_type: String,
    pub emulator: PathBuf,
    /// qcow2 boot disk.
    pub image: PathBuf,
    /// Host block devices passed through as raw virtio disks.
    pub block_devices: Vec<String>,
    /// Bridged NICs, in guest order.
    pub interfaces: Vec<Interface>,
    /// Read-only cloud-init volume.
    pub cidata_image: PathBuf,
}

/// Parses a memory size such as `1024M` into MiB. `M` is the only unit
/// accepted.
pub fn parse_ram(ram: &str) -> Result<u64, ProvisionError> {
    let bad = || ProvisionError::InvalidRam(ram.to_string());
    let value = ram.strip_suffix('M').ok_or_else(bad)?;
    value.parse().map_err(|_| bad())
}

/// Orders NIC names the way a person would: `eth2` before `eth10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b))
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Chunk {
    Text(String),
    Number(u64),
}

fn natural_key(s: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut rest = s;
    while let Some(c) = rest.chars().next() {
        let digits = c.is_ascii_digit();
        let end = rest
            .find(|ch: char| ch.is_ascii_digit() != digits)
            .unwrap_or(rest.len());
        let (chunk, tail) = rest.split_at(end);
        chunks.push(match chunk.parse() {
            Ok(n) if digits => Chunk::Number(n),
            _ => Chunk::Text(chunk.to_lowercase()),
        });
        rest = tail;
    }
    chunks
}

/// Guest device names `vdb`, `vdc`, ... for disks after the boot disk.
fn disk_names() -> impl Iterator<Item = String> {
    ('b'..='z').map(|c| format!("vd{c}"))
}

/// Escapes text for use in XML content and quoted attributes.
struct Xml<'a>(&'a str);

impl fmt::Display for Xml<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '&' => f.write_str("&amp;")?,
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '\'' => f.write_str("&apos;")?,
                '"' => f.write_str("&quot;")?,
                c => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

impl DomainSpec {
    /// Guest disk count, including the boot and cloud-init disks.
    pub fn disk_count(&self) -> usize {
        self.block_devices.len() + 2
    }

    pub fn to_xml(&self) -> Result<String, ProvisionError> {
        // vda is the boot disk; everything else needs a free vdX.
        if self.disk_count() > 26 {
            return Err(ProvisionError::TooManyDisks(self.disk_count()));
        }
        Ok(self.to_string())
    }
}

impl fmt::Display for DomainSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<domain type='kvm'>")?;
        writeln!(f, "  <name>{}</name>", Xml(&self.name))?;
        writeln!(f, "  <memory unit='MiB'>{}</memory>", self.memory_mib)?;
        if self.bare_metal {
            writeln!(f, "  <cpu mode='host-passthrough'/>")?;
        }
        match &self.cpuset {
            Some(cpuset) => writeln!(
                f,
                "  <vcpu placement='static' cpuset='{}'>{}</vcpu>",
                Xml(cpuset),
                self.vcpus
            )?,
            None => {
                writeln!(f, "  <vcpu placement='static'>{}</vcpu>", self.vcpus)?
            }
        }
        writeln!(f, "  <os>")?;
        writeln!(
            f,
            "    <type arch='x86_64' machine='{}'>hvm</type>",
            Xml(&self.machine_type)
        )?;
        writeln!(f, "    <boot dev='hd'/>")?;
        writeln!(f, "  </os>")?;
        writeln!(f, "  <features>")?;
        writeln!(f, "    <acpi/>")?;
        writeln!(f, "    <apic/>")?;
        writeln!(f, "    <pae/>")?;
        writeln!(f, "  </features>")?;
        writeln!(f, "  <clock offset='utc'/>")?;
        writeln!(f, "  <on_poweroff>destroy</on_poweroff>")?;
        writeln!(f, "  <on_reboot>restart</on_reboot>")?;
        writeln!(f, "  <on_crash>restart</on_crash>")?;

        writeln!(f, "  <devices>")?;
        writeln!(
            f,
            "    <emulator>{}</emulator>",
            Xml(&self.emulator.to_string_lossy())
        )?;

        writeln!(f, "    <disk type='file' device='disk'>")?;
        writeln!(f, "      <driver name='qemu' type='qcow2' cache='none'/>")?;
        writeln!(
            f,
            "      <source file='{}'/>",
            Xml(&self.image.to_string_lossy())
        )?;
        writeln!(f, "      <target dev='vda' bus='virtio'/>")?;
        writeln!(f, "    </disk>")?;

        let mut names = disk_names();
        for dev in &self.block_devices {
            let target = names.next().ok_or(fmt::Error)?;
            writeln!(f, "    <disk type='block' device='disk'>")?;
            writeln!(f, "      <driver name='qemu' type='raw' cache='none'/>")?;
            writeln!(f, "      <source dev='{}'/>", Xml(dev))?;
            writeln!(f, "      <target dev='{target}' bus='virtio'/>")?;
            writeln!(f, "    </disk>")?;
        }

        writeln!(f, "    <controller type='usb' index='0'/>")?;

        for nic in &self.interfaces {
            writeln!(f, "    <interface type='bridge'>")?;
            writeln!(f, "      <source bridge='{}'/>", Xml(&nic.host_device))?;
            writeln!(f, "      <model type='virtio'/>")?;
            if let Some(mac) = &nic.mac_address {
                writeln!(f, "      <mac address='{}'/>", Xml(mac))?;
            }
            writeln!(f, "    </interface>")?;
        }

        writeln!(f, "    <serial type='pty'>")?;
        writeln!(f, "      <target port='0'/>")?;
        writeln!(f, "    </serial>")?;
        writeln!(f, "    <console type='pty'>")?;
        writeln!(f, "      <target type='serial' port='0'/>")?;
        writeln!(f, "    </console>")?;
        writeln!(f, "    <input type='tablet' bus='usb'/>")?;
        writeln!(f, "    <input type='mouse' bus='ps2'/>")?;
        writeln!(
            f,
            "    <graphics type='vnc' autoport='yes' listen='127.0.0.1'>"
        )?;
        writeln!(f, "      <listen type='address' address='127.0.0.1'/>")?;
        writeln!(f, "    </graphics>")?;
        writeln!(f, "    <video>")?;
        writeln!(f, "      <model type='cirrus' vram='9216' heads='1'/>")?;
        writeln!(f, "    </video>")?;

        let target = names.next().ok_or(fmt::Error)?;
        writeln!(f, "    <disk type='file' device='disk'>")?;
        writeln!(f, "      <driver name='qemu' type='raw'/>")?;
        writeln!(
            f,
            "      <source file='{}'/>",
            Xml(&self.cidata_image.to_string_lossy())
        )?;
        writeln!(f, "      <target dev='{target}' bus='virtio'/>")?;
        writeln!(f, "      <readonly/>")?;
        writeln!(f, "    </disk>")?;

        if self.bare_metal {
            writeln!(f, "    <rng model='virtio'>")?;
            writeln!(f, "      <rate bytes='1234' period='2000'/>")?;
            writeln!(f, "      <backend model='random'>/dev/random</backend>")?;
            writeln!(f, "    </rng>")?;
        }
        writeln!(f, "  </devices>")?;
        writeln!(f, "</domain>")
    }
}
