// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use crate::connection::ConnectionManager;
use crate::hypervisor::{
    Connection, DomainListFlags, DomainState, HypervisorError,
};

/// Read-only queries about the hypervisor's view of one domain.
///
/// Nothing is cached: every call goes back to the hypervisor so that poll
/// loops observe the current state.
pub struct Inspector {
    connections: Arc<ConnectionManager>,
    uri: Option<String>,
    name: String,
}

impl Inspector {
    pub fn new(
        connections: Arc<ConnectionManager>,
        uri: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self { connections, uri, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn connection(
        &self,
    ) -> Result<Arc<dyn Connection>, HypervisorError> {
        self.connections.handle(self.uri.as_deref())
    }

    fn listed(&self, flags: DomainListFlags) -> Result<bool, HypervisorError> {
        Ok(self.connection()?.list_domains(flags)?.iter().any(|n| *n == self.name))
    }

    /// Whether the hypervisor holds a record of the domain, running or not.
    pub fn is_defined(&self) -> Result<bool, HypervisorError> {
        self.listed(DomainListFlags::ACTIVE | DomainListFlags::INACTIVE)
    }

    pub fn is_running(&self) -> Result<bool, HypervisorError> {
        self.listed(DomainListFlags::ACTIVE)
    }

    /// Fails if the domain cannot be looked up.
    pub fn run_state(&self) -> Result<DomainState, HypervisorError> {
        self.connection()?.domain_state(&self.name)
    }

    pub fn is_started(&self) -> Result<bool, HypervisorError> {
        Ok(self.run_state()? == DomainState::Running)
    }

    pub fn is_stopped(&self) -> Result<bool, HypervisorError> {
        Ok(self.run_state()? == DomainState::Shutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::hypervisor::{DomainOp, MockConnection, MockConnector};
    use slog::{o, Logger};

    fn inspector_over(conn: MockConnection) -> Inspector {
        let conn: Arc<dyn Connection> = Arc::new(conn);
        let mut connector = MockConnector::new();
        connector.expect_open().returning(move |_| Ok(conn.clone()));
        let log = Logger::root(slog::Discard, o!());
        let mgr = ConnectionManager::new(Box::new(connector), &log);
        Inspector::new(Arc::new(mgr), None, "vm1")
    }

    #[test]
    fn defined_checks_both_listings() {
        let mut conn = MockConnection::new();
        conn.expect_list_domains()
            .withf(|f| {
                *f == DomainListFlags::ACTIVE | DomainListFlags::INACTIVE
            })
            .returning(|_| Ok(vec!["other".to_string(), "vm1".to_string()]));
        conn.expect_list_domains()
            .withf(|f| *f == DomainListFlags::ACTIVE)
            .returning(|_| Ok(vec!["other".to_string()]));

        let insp = inspector_over(conn);
        assert!(insp.is_defined().unwrap());
        assert!(!insp.is_running().unwrap());
    }

    #[test]
    fn state_predicates() {
        let mut conn = MockConnection::new();
        conn.expect_domain_state().returning(|_| Ok(DomainState::Shutoff));

        let insp = inspector_over(conn);
        assert!(insp.is_stopped().unwrap());
        assert!(!insp.is_started().unwrap());
    }

    #[test]
    fn lookup_failure_propagates() {
        let mut conn = MockConnection::new();
        conn.expect_domain_state().returning(|name| {
            Err(HypervisorError::Domain {
                op: DomainOp::Lookup,
                name: name.to_string(),
                message: "Domain not found".to_string(),
            })
        });

        let insp = inspector_over(conn);
        assert!(insp.run_state().is_err());
        assert!(insp.is_started().is_err());
    }
}
