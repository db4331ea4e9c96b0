// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`Connection`] backed by the native libvirt client library.

use std::sync::Arc;

use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use super::{
    Connection, Connector, DomainListFlags, DomainOp, DomainState,
    HypervisorError,
};

pub struct LibvirtConnector;

impl Connector for LibvirtConnector {
    fn open(&self, uri: &str) -> Result<Arc<dyn Connection>, HypervisorError> {
        // libvirt prints every error to stderr unless told otherwise.
        virt::error::clear_error_callback();

        let conn = Connect::open(Some(uri)).map_err(|e| {
            HypervisorError::Connect { uri: uri.to_string(), message: e.to_string() }
        })?;
        Ok(Arc::new(LibvirtConnection { conn }))
    }
}

struct LibvirtConnection {
    conn: Connect,
}

// The libvirt connection object is documented as thread-safe.
unsafe impl Send for LibvirtConnection {}
unsafe impl Sync for LibvirtConnection {}

impl LibvirtConnection {
    fn lookup(&self, name: &str) -> Result<Domain, HypervisorError> {
        Domain::lookup_by_name(&self.conn, name).map_err(|e| {
            HypervisorError::Domain {
                op: DomainOp::Lookup,
                name: name.to_string(),
                message: e.to_string(),
            }
        })
    }

    fn domain_op<T>(
        &self,
        op: DomainOp,
        name: &str,
        f: impl FnOnce(&Domain) -> Result<T, virt::error::Error>,
    ) -> Result<(), HypervisorError> {
        let dom = self.lookup(name)?;
        f(&dom).map(|_| ()).map_err(|e| HypervisorError::Domain {
            op,
            name: name.to_string(),
            message: e.to_string(),
        })
    }
}

impl Connection for LibvirtConnection {
    fn list_domains(
        &self,
        flags: DomainListFlags,
    ) -> Result<Vec<String>, HypervisorError> {
        let mut raw = 0;
        if flags.contains(DomainListFlags::ACTIVE) {
            raw |= sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE;
        }
        if flags.contains(DomainListFlags::INACTIVE) {
            raw |= sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
        }

        let domains = self
            .conn
            .list_all_domains(raw)
            .map_err(|e| HypervisorError::List(e.to_string()))?;
        domains
            .iter()
            .map(|d| d.get_name().map_err(|e| HypervisorError::List(e.to_string())))
            .collect()
    }

    fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError> {
        let dom = self.lookup(name)?;
        let (state, _reason) = dom.get_state().map_err(|e| {
            HypervisorError::Domain {
                op: DomainOp::Lookup,
                name: name.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(DomainState::from_raw(state as u32))
    }

    fn define(&self, xml: &str) -> Result<(), HypervisorError> {
        Domain::define_xml(&self.conn, xml).map(|_| ()).map_err(|e| {
            HypervisorError::Domain {
                op: DomainOp::Define,
                name: String::new(),
                message: e.to_string(),
            }
        })
    }

    fn create(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_op(DomainOp::Create, name, |d| d.create())
    }

    fn destroy(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_op(DomainOp::Destroy, name, |d| d.destroy())
    }

    fn shutdown(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_op(DomainOp::Shutdown, name, |d| d.shutdown())
    }

    fn undefine(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_op(DomainOp::Undefine, name, |d| d.undefine())
    }

    fn capabilities(&self) -> Result<String, HypervisorError> {
        self.conn
            .get_capabilities()
            .map_err(|e| HypervisorError::Capabilities(e.to_string()))
    }
}
