// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use slog::{debug, o, Logger};

use crate::hypervisor::{Connection, Connector, HypervisorError, DEFAULT_URI};

/// Hands out hypervisor connections, opening each URI at most once.
///
/// Connections are kept for the life of the manager and are never
/// revalidated. A failed open is not remembered.
pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    default_uri: String,
    handles: Mutex<BTreeMap<String, Arc<dyn Connection>>>,
    log: Logger,
}

impl ConnectionManager {
    pub fn new(connector: Box<dyn Connector>, log: &Logger) -> Self {
        Self::with_default_uri(connector, DEFAULT_URI, log)
    }

    pub fn with_default_uri(
        connector: Box<dyn Connector>,
        default_uri: impl Into<String>,
        log: &Logger,
    ) -> Self {
        Self {
            connector,
            default_uri: default_uri.into(),
            handles: Mutex::new(BTreeMap::new()),
            log: log.new(o!("component" => "connection-manager")),
        }
    }

    pub fn default_uri(&self) -> &str {
        &self.default_uri
    }

    /// Returns the connection for `uri`, or for the default URI when `None`.
    pub fn handle(
        &self,
        uri: Option<&str>,
    ) -> Result<Arc<dyn Connection>, HypervisorError> {
        let uri = uri.unwrap_or(&self.default_uri);
        let mut handles = self.handles.lock().unwrap();
        if let Some(conn) = handles.get(uri) {
            return Ok(conn.clone());
        }

        debug!(self.log, "opening hypervisor connection"; "uri" => uri);
        let conn = self.connector.open(uri)?;
        handles.insert(uri.to_string(), conn.clone());
        Ok(conn)
    }

    /// Forgets every cached connection.
    pub fn clear(&self) {
        self.handles.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::hypervisor::{MockConnection, MockConnector};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn counting_connector(expected_opens: usize) -> MockConnector {
        let mut connector = MockConnector::new();
        connector.expect_open().times(expected_opens).returning(|_| {
            Ok(Arc::new(MockConnection::new()) as Arc<dyn Connection>)
        });
        connector
    }

    #[test]
    fn repeated_uri_reuses_handle() {
        let mgr =
            ConnectionManager::new(Box::new(counting_connector(1)), &test_logger());
        let a = mgr.handle(None).unwrap();
        let b = mgr.handle(Some(DEFAULT_URI)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_uris_open_distinct_handles() {
        let mgr =
            ConnectionManager::new(Box::new(counting_connector(2)), &test_logger());
        let a = mgr.handle(Some("qemu:///system")).unwrap();
        let b = mgr.handle(Some("qemu:///session")).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        mgr.handle(Some("qemu:///session")).unwrap();
    }

    #[test]
    fn failed_open_is_retried() {
        let mut connector = MockConnector::new();
        let mut seq = mockall::Sequence::new();
        connector
            .expect_open()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|uri| {
                Err(HypervisorError::Connect {
                    uri: uri.to_string(),
                    message: "libvirtd not running".to_string(),
                })
            });
        connector
            .expect_open()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Arc::new(MockConnection::new()) as Arc<dyn Connection>)
            });

        let mgr = ConnectionManager::new(Box::new(connector), &test_logger());
        assert!(mgr.handle(None).is_err());
        assert!(mgr.handle(None).is_ok());
    }

    #[test]
    fn clear_forces_reopen() {
        let mgr =
            ConnectionManager::new(Box::new(counting_connector(2)), &test_logger());
        mgr.handle(None).unwrap();
        mgr.clear();
        mgr.handle(None).unwrap();
    }
}
