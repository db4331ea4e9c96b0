// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Abstractions over the hypervisor management endpoint.
//!
//! The lifecycle code only ever talks to a [`Connection`], addressing domains
//! by name. Implementations look the domain up afresh on every call, so no
//! domain handle outlives a single request.

use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod virsh;

/// URI used when the caller does not name a hypervisor endpoint.
pub const DEFAULT_URI: &str = "qemu:///system";

bitflags! {
    /// Selects which domains [`Connection::list_domains`] returns.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DomainListFlags: u32 {
        const ACTIVE = 1 << 0;
        const INACTIVE = 1 << 1;
    }
}

/// Run state of a domain, numbered as libvirt numbers `virDomainState`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    PmSuspended,
    Unknown(u32),
}

impl DomainState {
    pub fn from_raw(code: u32) -> Self {
        match code {
            0 => Self::NoState,
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::ShuttingDown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DomainOp {
    Lookup,
    Define,
    Create,
    Destroy,
    Shutdown,
    Undefine,
}

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("failed to connect to {uri}: {message}")]
    Connect { uri: String, message: String },

    #[error("failed to list domains: {0}")]
    List(String),

    #[error("{op} of domain \"{name}\" failed: {message}")]
    Domain { op: DomainOp, name: String, message: String },

    #[error("failed to query capabilities: {0}")]
    Capabilities(String),

    #[error("unrecognized domain state {0:?}")]
    UnknownState(String),
}

/// An open handle to a hypervisor endpoint.
#[cfg_attr(test, mockall::automock)]
pub trait Connection: Send + Sync {
    /// Names of the domains matching `flags`.
    fn list_domains(
        &self,
        flags: DomainListFlags,
    ) -> Result<Vec<String>, HypervisorError>;

    /// Looks up `name` and reports its current state.
    fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError>;

    /// Registers a persistent domain from its XML description.
    fn define(&self, xml: &str) -> Result<(), HypervisorError>;

    /// Powers on a defined domain.
    fn create(&self, name: &str) -> Result<(), HypervisorError>;

    /// Hard power-off.
    fn destroy(&self, name: &str) -> Result<(), HypervisorError>;

    /// Requests an ACPI shutdown from the guest.
    fn shutdown(&self, name: &str) -> Result<(), HypervisorError>;

    /// Removes the persistent domain record.
    fn undefine(&self, name: &str) -> Result<(), HypervisorError>;

    /// Host capabilities XML.
    fn capabilities(&self) -> Result<String, HypervisorError>;
}

/// Opens connections to a hypervisor endpoint.
#[cfg_attr(test, mockall::automock)]
pub trait Connector: Send + Sync {
    fn open(&self, uri: &str) -> Result<Arc<dyn Connection>, HypervisorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_states_follow_libvirt_numbering() {
        assert_eq!(DomainState::from_raw(1), DomainState::Running);
        assert_eq!(DomainState::from_raw(5), DomainState::Shutoff);
        assert_eq!(DomainState::from_raw(7), DomainState::PmSuspended);
        assert_eq!(DomainState::from_raw(42), DomainState::Unknown(42));
    }

    #[test]
    fn domain_errors_name_the_operation() {
        let err = HypervisorError::Domain {
            op: DomainOp::Destroy,
            name: "vm1".to_string(),
            message: "domain is not running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "destroy of domain \"vm1\" failed: domain is not running"
        );
    }
}
