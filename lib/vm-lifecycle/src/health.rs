// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application-level health of a running guest.
//!
//! Guests may expose an HTTP endpoint answering `200` once their workload is
//! up, and `503` while it is reachable but not ready.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use slog::{debug, info, Logger};
use thiserror::Error;
use vm_instance_config::HealthCheck;

/// Port guests serve their status endpoint on.
pub const DEFAULT_HEALTH_PORT: u16 = 12987;

/// Status the endpoint returns while explicitly not ready.
pub const UNHEALTHY_STATUS: u16 = 503;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternalStatus {
    Ok,
    /// The endpoint answered and reported itself unhealthy.
    NotOk,
    /// The endpoint could not be reached or answered unexpectedly.
    CheckFailed,
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct ProbeError(pub String);

/// Performs the HTTP request behind a health check.
#[cfg_attr(test, mockall::automock)]
pub trait HealthProbe: Send + Sync {
    /// Issues a GET to `url`, returning the response status code.
    fn get(&self, url: &str) -> Result<u16, ProbeError>;
}

/// [`HealthProbe`] using a blocking `reqwest` client.
pub struct HttpProbe {
    client: reqwest::blocking::Client,
}

impl HttpProbe {
    pub fn new(timeout: Option<Duration>) -> Result<Self, ProbeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HealthProbe for HttpProbe {
    fn get(&self, url: &str) -> Result<u16, ProbeError> {
        self.client
            .get(url)
            .send()
            .map(|resp| resp.status().as_u16())
            .map_err(|e| ProbeError(e.to_string()))
    }
}

pub fn status_url(ip_address: &str, port: u16) -> String {
    match ip_address.parse::<IpAddr>() {
        Ok(ip) => format!("http://{}", SocketAddr::new(ip, port)),
        Err(_) => format!("http://{ip_address}:{port}"),
    }
}

/// Evaluates the configured health check of `instance`.
///
/// An absent or inactive check counts as healthy. When `quiet` is set the
/// healthy outcome is not logged.
pub fn internal_status(
    instance: &str,
    check: Option<&HealthCheck>,
    probe: &dyn HealthProbe,
    port: u16,
    quiet: bool,
    log: &Logger,
) -> InternalStatus {
    let Some(check) = check else {
        if !quiet {
            info!(log, "domain \"{}\" internal status check OK", instance);
        }
        return InternalStatus::Ok;
    };
    if !check.is_active() {
        if !quiet {
            info!(log, "domain \"{}\" internal status check not active", instance);
        }
        return InternalStatus::Ok;
    }

    let url = status_url(&check.ip_address, port);
    debug!(log, "checking domain status"; "url" => &url);

    match probe.get(&url) {
        Ok(200) => {
            if !quiet {
                info!(log, "domain \"{}\" internal status check OK", instance);
            }
            InternalStatus::Ok
        }
        Ok(UNHEALTHY_STATUS) => {
            info!(log, "domain \"{}\" internal status check failed", instance;
                "status" => UNHEALTHY_STATUS);
            InternalStatus::NotOk
        }
        Ok(status) => {
            info!(log,
                "domain \"{}\" internal status check failed with an unexpected status",
                instance;
                "status" => status);
            InternalStatus::CheckFailed
        }
        Err(e) => {
            info!(log,
                "domain \"{}\" internal status check failed to connect",
                instance;
                "url" => &url, "error" => %e);
            InternalStatus::CheckFailed
        }
    }
}
