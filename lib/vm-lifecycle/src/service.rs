// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use slog::{debug, o, Logger};
use thiserror::Error;

pub const DEFAULT_SYSTEMCTL: &str = "/bin/systemctl";

#[derive(Error, Debug)]
#[error("failed to run {program} {verb} {unit}: {source}")]
pub struct ServiceError {
    program: String,
    verb: &'static str,
    unit: String,
    #[source]
    source: std::io::Error,
}

/// Client for the host's service manager.
///
/// Mutating calls return the service manager's own exit code.
#[cfg_attr(test, mockall::automock)]
pub trait ServiceManager: Send + Sync {
    fn start(&self, unit: &str) -> Result<i32, ServiceError>;
    fn stop(&self, unit: &str) -> Result<i32, ServiceError>;
    fn restart(&self, unit: &str) -> Result<i32, ServiceError>;

    /// The unit's state as reported by the service manager, e.g. `active`.
    fn is_active(&self, unit: &str) -> Result<String, ServiceError>;
}

pub struct Systemctl {
    program: PathBuf,
    log: Logger,
}

impl Systemctl {
    pub fn new(program: impl Into<PathBuf>, log: &Logger) -> Self {
        Self {
            program: program.into(),
            log: log.new(o!("component" => "systemctl")),
        }
    }

    fn run(
        &self,
        verb: &'static str,
        unit: &str,
    ) -> Result<(i32, String), ServiceError> {
        debug!(self.log, "executing systemctl"; "verb" => verb, "unit" => unit);
        let output = Command::new(&self.program)
            .arg(verb)
            .arg(unit)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ServiceError {
                program: self.program.display().to_string(),
                verb,
                unit: unit.to_string(),
                source,
            })?;

        // A missing exit code means the child was killed by a signal.
        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(self.log, "systemctl finished";
            "verb" => verb, "unit" => unit, "code" => code,
            "stderr" => %String::from_utf8_lossy(&output.stderr).trim());
        Ok((code, stdout))
    }
}

impl ServiceManager for Systemctl {
    fn start(&self, unit: &str) -> Result<i32, ServiceError> {
        self.run("start", unit).map(|(code, _)| code)
    }

    fn stop(&self, unit: &str) -> Result<i32, ServiceError> {
        self.run("stop", unit).map(|(code, _)| code)
    }

    fn restart(&self, unit: &str) -> Result<i32, ServiceError> {
        self.run("restart", unit).map(|(code, _)| code)
    }

    fn is_active(&self, unit: &str) -> Result<String, ServiceError> {
        self.run("is-active", unit).map(|(_, state)| state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn exit_codes_pass_through() {
        // `true` and `false` ignore their arguments.
        let ok = Systemctl::new("true", &test_logger());
        assert_eq!(ok.restart("vm1").unwrap(), 0);

        let failing = Systemctl::new("false", &test_logger());
        assert_eq!(failing.stop("vm1").unwrap(), 1);
    }

    #[test]
    fn echoes_unit_state() {
        let echo = Systemctl::new("echo", &test_logger());
        assert_eq!(echo.is_active("vm1").unwrap(), "is-active vm1");
    }

    #[test]
    fn missing_program_is_an_error() {
        let missing = Systemctl::new("/nonexistent/systemctl", &test_logger());
        let err = missing.start("vm1").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/systemctl start vm1"));
    }
}
