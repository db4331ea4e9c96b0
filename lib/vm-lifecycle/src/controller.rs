// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle operations on a single instance.
//!
//! Each public operation drives the domain from whatever state it is
//! observed in towards the operation's target state, and reports an
//! [`Outcome`] which the caller turns into the process exit status. Every
//! wait is bounded by a [`Deadline`]; graceful stops that run out of time
//! escalate to a forced stop.
//!
//! Operations are safe to retry. Steps which find their work already done
//! (starting a running domain, stopping a stopped one) succeed without
//! touching the hypervisor.

use std::sync::Arc;
use std::time::Duration;

use slog::{debug, error, info, o, warn, Logger};
use vm_instance_config::{ArchiveReport, ConfigError, ConfigStore, StoreError};

use crate::connection::ConnectionManager;
use crate::health::{self, HealthProbe, InternalStatus};
use crate::host::{HostProbe, HostRelease};
use crate::hypervisor::HypervisorError;
use crate::inspector::Inspector;
use crate::provision::Provisioner;
use crate::report::Reporter;
use crate::service::{ServiceError, ServiceManager};
use crate::settings::AdaptorSettings;
use crate::wait::{poll_until, Clock, Deadline};

/// Result of an operation, as reported to the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    UnknownCommand,
    BadConfig,
    /// The service manager's own exit code, when an operation was handed
    /// to it.
    Delegated(i32),
}

impl Outcome {
    pub fn code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure => 1,
            Outcome::UnknownCommand => 2,
            Outcome::BadConfig => 3,
            Outcome::Delegated(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self.code() == 0
    }

    pub fn from_service_code(code: i32) -> Self {
        match code {
            0 => Outcome::Success,
            code => Outcome::Delegated(code),
        }
    }
}

/// Result of an operation which ends by undefining the domain and
/// archiving its files.
///
/// Archive and cleanup failures never change `outcome`; they are carried
/// here instead.
#[derive(Debug)]
pub struct TeardownReport {
    /// Result of the stop phase.
    pub outcome: Outcome,

    /// What was archived, if archiving ran to completion.
    pub archive: Option<ArchiveReport>,

    /// The error which cut archiving or cleanup short.
    pub cleanup_error: Option<StoreError>,
}

impl TeardownReport {
    /// Whether every file was archived and the directory cleaned.
    pub fn is_clean(&self) -> bool {
        self.cleanup_error.is_none()
            && self.archive.as_ref().map_or(true, |a| a.failed.is_empty())
    }
}

/// External services the controller drives.
pub struct Collaborators {
    pub connections: Arc<ConnectionManager>,
    pub services: Box<dyn ServiceManager>,
    pub probe: Box<dyn HealthProbe>,
    pub host: Box<dyn HostProbe>,
    pub reporter: Box<dyn Reporter>,
    pub clock: Arc<dyn Clock>,
}

pub struct LifecycleController {
    name: String,
    store: ConfigStore,
    inspector: Inspector,
    provisioner: Provisioner,
    settings: AdaptorSettings,
    release: HostRelease,
    services: Box<dyn ServiceManager>,
    probe: Box<dyn HealthProbe>,
    reporter: Box<dyn Reporter>,
    clock: Arc<dyn Clock>,
    log: Logger,
}

impl LifecycleController {
    pub fn new(
        name: impl Into<String>,
        settings: AdaptorSettings,
        release: HostRelease,
        parts: Collaborators,
        log: &Logger,
    ) -> Self {
        let name = name.into();
        let log = log.new(o!("instance" => name.clone()));
        let store = ConfigStore::new(&name, &settings.instances_dir, &log);
        let inspector = Inspector::new(parts.connections, None, &name);
        let provisioner =
            Provisioner::new(settings.clone(), parts.host, &log);
        Self {
            name,
            store,
            inspector,
            provisioner,
            settings,
            release,
            services: parts.services,
            probe: parts.probe,
            reporter: parts.reporter,
            clock: parts.clock,
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Confirms the instance configuration can be read and parsed.
    pub fn check_config(&self) -> Result<(), ConfigError> {
        self.store.read_config().map(|_| ())
    }

    fn banner(&self, msg: &str, outcome: Outcome) {
        if outcome.is_success() {
            self.reporter.success(msg);
        } else {
            self.reporter.failure(msg);
        }
    }

    fn secs(&self, secs: u64) -> Deadline {
        Deadline::after(self.clock.as_ref(), Duration::from_secs(secs))
    }

    /// Answers a state query, logging and absorbing hypervisor errors.
    ///
    /// Used inside poll loops, where a failed query means "not yet".
    fn observe(
        &self,
        what: &str,
        res: Result<bool, HypervisorError>,
    ) -> bool {
        res.unwrap_or_else(|e| {
            debug!(self.log, "state query failed"; "query" => what, "error" => %e);
            false
        })
    }

    /// Starts the domain, defining it first if needed, and waits until it
    /// is running and its internal health check passes.
    pub fn start(&self) -> Outcome {
        let changed = match self.reconcile_config() {
            Ok(changed) => changed,
            Err(e) => {
                error!(self.log, "failed to clean up instance directory";
                    "error" => %e);
                self.banner(&self.start_msg(), Outcome::Failure);
                return Outcome::Failure;
            }
        };

        let defined = match self.inspector.is_defined() {
            Ok(defined) => defined,
            Err(e) => {
                error!(self.log, "cannot query domain"; "error" => %e);
                self.banner(&self.start_msg(), Outcome::Failure);
                return Outcome::Failure;
            }
        };
        if let Err(problem) = self.check_startup_requirements(defined) {
            error!(self.log, "{}", problem);
            self.reporter.message(&problem);
            return Outcome::BadConfig;
        }

        let result = self.start_domain();
        if result.is_success() && changed {
            debug!(self.log, "copying configuration files to live");
            if let Err(e) = self.store.promote_to_live() {
                warn!(self.log, "failed to record live configuration";
                    "error" => %e);
            }
        }
        self.banner(&self.start_msg(), result);
        result
    }

    fn start_msg(&self) -> String {
        format!("Service start for \"{}\"", self.name)
    }

    /// Compares desired against live configuration and tears down a domain
    /// that no longer matches it. Returns whether the configuration
    /// changed.
    fn reconcile_config(&self) -> Result<bool, StoreError> {
        let drifted = self.store.config_drifted();

        if !self.store.live_snapshot_exists() {
            let defined = self.observe("defined", self.inspector.is_defined());
            if defined {
                warn!(self.log,
                    "domain \"{}\" exists without live files, forcefully \
                    stopping and undefining",
                    self.name);
                let report = self.force_stop_undefine_domain();
                debug!(self.log, "teardown finished";
                    "clean" => report.is_clean());
            }
        } else if drifted {
            info!(self.log,
                "configuration of domain \"{}\" changed, redefining",
                self.name);
            self.stop_domain(0);
            self.undefine_domain();
            self.store.clean_instance_directory()?;
        }
        Ok(drifted)
    }

    /// Checks that the disk image the next start depends on is present.
    fn check_startup_requirements(&self, defined: bool) -> Result<(), String> {
        let vm = self.store.vm_data().map_err(|e| e.to_string())?;

        if defined {
            let image = self.store.instance_image_path().map_err(|e| e.to_string())?;
            if !image.exists() {
                return Err(format!(
                    "Instance image for Domain \"{}\" does not exist",
                    self.name
                ));
            }
        } else if !self.provisioner.base_image_path(&vm.image).exists() {
            return Err(format!(
                "Base image for Domain \"{}\" does not exist",
                self.name
            ));
        }
        Ok(())
    }

    fn start_domain(&self) -> Outcome {
        info!(self.log, "attempting to start service \"{}\"", self.name);
        match self.inspector.is_running() {
            Ok(true) => {
                info!(self.log,
                    "domain \"{}\" is already running, nothing to do",
                    self.name);
                return Outcome::Success;
            }
            Ok(false) => {}
            Err(e) => {
                error!(self.log, "cannot query domain"; "error" => %e);
                return Outcome::Failure;
            }
        }

        let conn = match self.inspector.connection() {
            Ok(conn) => conn,
            Err(e) => {
                error!(self.log, "{}", e);
                return Outcome::Failure;
            }
        };

        match self.inspector.is_defined() {
            Ok(true) => {
                info!(self.log, "domain \"{}\" is already defined", self.name);
            }
            Ok(false) => {
                if let Err(e) = self.provisioner.define(&self.store, conn.as_ref())
                {
                    self.reporter.message(&format!(
                        "Domain \"{}\" could not be defined.",
                        self.name
                    ));
                    error!(self.log, "{}", e);
                    return Outcome::Failure;
                }
            }
            Err(e) => {
                error!(self.log, "cannot query domain"; "error" => %e);
                return Outcome::Failure;
            }
        }

        info!(self.log, "creating domain \"{}\"", self.name);
        if let Err(e) = conn.create(&self.name) {
            self.reporter.message(&format!(
                "Domain \"{}\" could not be created",
                self.name
            ));
            error!(self.log, "{}", e);
            return Outcome::Failure;
        }

        let timeout = self
            .store
            .adaptor_data()
            .ok()
            .and_then(|a| a.start_timeout)
            .unwrap_or(self.settings.default_start_timeout);
        info!(self.log, "waiting for domain \"{}\" to start", self.name;
            "timeout" => timeout);
        let started = poll_until(
            self.clock.as_ref(),
            self.secs(timeout),
            self.settings.poll_interval(),
            |_| self.observe("started", self.inspector.is_started()),
        );
        if !started.reached() {
            info!(self.log, "domain \"{}\" failed to start", self.name);
            return Outcome::Failure;
        }
        info!(self.log, "domain \"{}\" has been started successfully", self.name);

        // A running but unhealthy guest is waited on for as long as it
        // takes.
        poll_until(
            self.clock.as_ref(),
            Deadline::never(),
            self.settings.health_check_interval(),
            |_| self.check_health(false) == InternalStatus::Ok,
        );
        Outcome::Success
    }

    /// Asks the guest to shut down and waits for it, forcing it off if
    /// `timeout` seconds pass first. Zero uses the configured timeout.
    pub fn stop(&self, timeout: u64) -> Outcome {
        let result = self.stop_domain(timeout);
        self.banner(&format!("Service stop for \"{}\"", self.name), result);
        result
    }

    fn shutdown_domain(&self) {
        let res = self
            .inspector
            .connection()
            .and_then(|conn| conn.shutdown(&self.name));
        if let Err(e) = res {
            warn!(self.log, "shutdown failed on \"{}\"", self.name;
                "error" => %e);
        }
    }

    /// `timeout` of zero falls back to the configured stop timeout, which
    /// itself defaults to waiting indefinitely.
    fn stop_domain(&self, timeout: u64) -> Outcome {
        info!(self.log, "attempting to stop service \"{}\"", self.name);
        match self.inspector.is_running() {
            Ok(true) => {}
            Ok(false) => {
                info!(self.log,
                    "domain \"{}\" is not running, nothing to do",
                    self.name);
                return Outcome::Success;
            }
            Err(e) => {
                error!(self.log, "cannot query domain"; "error" => %e);
                return Outcome::Failure;
            }
        }

        info!(self.log, "calling ACPI shutdown on domain \"{}\"", self.name);
        self.shutdown_domain();

        let timeout = match timeout {
            0 => self
                .store
                .adaptor_data()
                .ok()
                .and_then(|a| a.stop_timeout)
                .unwrap_or(0),
            t => t,
        };
        if timeout > 0 {
            info!(self.log,
                "waiting {} seconds for domain \"{}\" to shut down",
                timeout, self.name);
        } else {
            info!(self.log, "waiting for domain \"{}\" to shut down", self.name);
        }

        // The first request may arrive before the guest's ACPI handling is
        // ready, so it is repeated periodically.
        let grace = self.settings.stop_grace_polls;
        let stopped = poll_until(
            self.clock.as_ref(),
            self.secs(timeout),
            self.settings.poll_interval(),
            |polls| {
                if grace > 0 && polls > 0 && polls % grace == 0 {
                    debug!(self.log, "repeating shutdown request";
                        "polls" => polls);
                    self.shutdown_domain();
                }
                self.observe("stopped", self.inspector.is_stopped())
            },
        );
        if stopped.reached() {
            return Outcome::Success;
        }

        info!(self.log,
            "ACPI shutdown of domain \"{}\" unsuccessful, calling force-stop",
            self.name);
        self.force_stop_domain()
    }

    /// Powers the domain off without involving the guest.
    pub fn force_stop(&self) -> Outcome {
        let result = self.force_stop_domain();
        if self.release.delegates_to_service_manager() {
            self.service_stop(true);
        }
        self.banner(&format!("Service force-stop for \"{}\"", self.name), result);
        result
    }

    fn force_stop_domain(&self) -> Outcome {
        info!(self.log, "attempting to destroy service \"{}\"", self.name);
        let entry = match self.inspector.is_defined() {
            Ok(true) => self.inspector.is_running(),
            other => other,
        };
        match entry {
            Ok(true) => {}
            Ok(false) => {
                info!(self.log,
                    "domain \"{}\" is not running, nothing to destroy",
                    self.name);
                return Outcome::Success;
            }
            Err(e) => {
                error!(self.log, "cannot query domain"; "error" => %e);
                return Outcome::Failure;
            }
        }

        info!(self.log, "calling destroy on domain \"{}\"", self.name);

        // Another agent may be restarting the domain underneath us; give it
        // a chance to come back up so the destroy does not race it.
        let attempts = self.settings.force_stop_attempts;
        for attempt in 0..attempts {
            if self.observe("running", self.inspector.is_running()) {
                break;
            }
            info!(self.log,
                "domain \"{}\" is not running, retrying. Attempt {} of {}",
                self.name, attempt + 1, attempts);
            self.clock.sleep(self.settings.force_stop_retry_delay());
        }
        if !self.observe("running", self.inspector.is_running()) {
            warn!(self.log,
                "all retry attempts used, domain \"{}\" is still down",
                self.name);
        }

        let res = self
            .inspector
            .connection()
            .and_then(|conn| conn.destroy(&self.name));
        match res {
            Ok(()) => info!(self.log, "domain \"{}\" destroyed", self.name),
            Err(e) => {
                warn!(self.log, "force shutdown failed on \"{}\"", self.name;
                    "error" => %e)
            }
        }
        Outcome::Success
    }

    fn service_call(
        &self,
        verb: &str,
        verbose: bool,
        call: impl FnOnce(&dyn ServiceManager, &str) -> Result<i32, ServiceError>,
    ) -> Outcome {
        info!(self.log,
            "attempting to {} service \"{}\" with the service manager",
            verb, self.name);
        let result = match call(self.services.as_ref(), &self.name) {
            Ok(code) => Outcome::from_service_code(code),
            Err(e) => {
                error!(self.log, "{}", e);
                Outcome::Failure
            }
        };
        if verbose {
            self.banner(
                &format!("Service {} for \"{}\"", verb, self.name),
                result,
            );
        }
        result
    }

    fn service_stop(&self, verbose: bool) -> Outcome {
        self.service_call("stop", verbose, |s, unit| s.stop(unit))
    }

    pub fn restart(&self) -> Outcome {
        if self.release.delegates_to_service_manager() {
            self.service_call("restart", true, |s, unit| s.restart(unit))
        } else {
            self.stop(0);
            self.start()
        }
    }

    pub fn force_restart(&self) -> Outcome {
        self.force_stop();
        if self.release.delegates_to_service_manager() {
            self.service_call("start", true, |s, unit| s.start(unit))
        } else {
            self.start()
        }
    }

    /// Removes the domain's persistent definition. Failures are logged and
    /// never reported.
    pub fn undefine(&self) -> Outcome {
        self.undefine_domain();
        Outcome::Success
    }

    fn undefine_domain(&self) {
        match self.inspector.is_defined() {
            Ok(true) => {
                info!(self.log,
                    "attempting to undefine the domain \"{}\"",
                    self.name);
                let res = self
                    .inspector
                    .connection()
                    .and_then(|conn| conn.undefine(&self.name));
                if let Err(e) = res {
                    warn!(self.log, "failed to undefine domain"; "error" => %e);
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(self.log, "cannot query domain"; "error" => %e);
            }
        }
    }

    fn archive(&self, outcome: Outcome) -> TeardownReport {
        match self.store.archive_and_clear() {
            Ok(archive) => {
                for failure in &archive.failed {
                    warn!(self.log, "file not archived"; "error" => %failure);
                }
                TeardownReport {
                    outcome,
                    archive: Some(archive),
                    cleanup_error: None,
                }
            }
            Err(e) => {
                warn!(self.log, "failed to archive and clean instance";
                    "error" => %e);
                TeardownReport { outcome, archive: None, cleanup_error: Some(e) }
            }
        }
    }

    /// Stops the domain gracefully, escalating after `stop_timeout` seconds
    /// (zero for the configured timeout), then undefines it and archives
    /// its files.
    pub fn stop_undefine(&self, stop_timeout: u64) -> TeardownReport {
        let outcome = self.stop_domain(stop_timeout);
        if self.release.delegates_to_service_manager() {
            self.service_stop(false);
        }
        self.undefine_domain();
        let report = self.archive(outcome);
        self.banner(
            &format!("Service stop-undefine for \"{}\"", self.name),
            report.outcome,
        );
        report
    }

    pub fn force_stop_undefine(&self) -> TeardownReport {
        let report = self.force_stop_undefine_domain();
        if self.release.delegates_to_service_manager() {
            self.service_stop(false);
        }
        self.banner(
            &format!("Service force-stop-undefine for \"{}\"", self.name),
            report.outcome,
        );
        report
    }

    fn force_stop_undefine_domain(&self) -> TeardownReport {
        self.force_stop_domain();
        self.undefine_domain();
        self.archive(Outcome::Success)
    }

    /// Evaluates the guest's internal health check.
    pub fn internal_status(&self) -> InternalStatus {
        self.check_health(false)
    }

    fn check_health(&self, quiet: bool) -> InternalStatus {
        let adaptor = match self.store.adaptor_data() {
            Ok(adaptor) => adaptor,
            Err(e) => {
                warn!(self.log, "cannot evaluate internal status"; "error" => %e);
                return InternalStatus::CheckFailed;
            }
        };
        health::internal_status(
            &self.name,
            adaptor.internal_status_check.as_ref(),
            self.probe.as_ref(),
            self.settings.health_check_port,
            quiet,
            &self.log,
        )
    }

    /// Running means defined, running and healthy.
    pub fn status(&self) -> Outcome {
        let result = self.status_domain();
        let state = if result.is_success() { "is running..." } else { "is stopped" };
        self.reporter.message(&format!("{} {}", self.name, state));
        result
    }

    fn status_domain(&self) -> Outcome {
        if self.release.delegates_to_service_manager() {
            match self.services.is_active(&self.name) {
                Ok(state) => {
                    debug!(self.log, "service state"; "state" => state)
                }
                Err(e) => debug!(self.log, "service state unknown"; "error" => %e),
            }
        }

        match self.inspector.is_defined() {
            Ok(true) => {}
            Ok(false) => {
                info!(self.log, "status: domain \"{}\" is not defined", self.name);
                return Outcome::Failure;
            }
            Err(e) => {
                info!(self.log, "status: cannot query domain"; "error" => %e);
                return Outcome::Failure;
            }
        }
        match self.inspector.is_running() {
            Ok(true) => {}
            Ok(false) => {
                info!(self.log, "status: domain \"{}\" is not running", self.name);
                return Outcome::Failure;
            }
            Err(e) => {
                info!(self.log, "status: cannot query domain"; "error" => %e);
                return Outcome::Failure;
            }
        }
        if self.check_health(true) != InternalStatus::Ok {
            info!(self.log,
                "status: domain \"{}\" failed internal check",
                self.name);
            return Outcome::Failure;
        }
        Outcome::Success
    }
}
