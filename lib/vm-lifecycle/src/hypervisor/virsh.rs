// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`Connection`] which drives libvirtd through the `virsh` client.
//!
//! Output of every invocation is captured, so the client's own chatter never
//! reaches the adaptor's terminal.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::sync::Arc;

use slog::{debug, error, o, Logger};

use super::{
    Connection, Connector, DomainListFlags, DomainOp, DomainState,
    HypervisorError,
};

pub const DEFAULT_VIRSH: &str = "/usr/bin/virsh";

pub struct VirshConnector {
    program: PathBuf,
    log: Logger,
}

impl VirshConnector {
    pub fn new(program: impl Into<PathBuf>, log: &Logger) -> Self {
        Self { program: program.into(), log: log.new(o!("backend" => "virsh")) }
    }
}

impl Connector for VirshConnector {
    fn open(&self, uri: &str) -> Result<Arc<dyn Connection>, HypervisorError> {
        let conn = VirshConnection {
            program: self.program.clone(),
            uri: uri.to_string(),
            log: self.log.new(o!("uri" => uri.to_string())),
        };
        // `virsh uri` fails unless the endpoint accepts a connection.
        conn.run(&["uri"])
            .map_err(|message| HypervisorError::Connect {
                uri: uri.to_string(),
                message,
            })?;
        Ok(Arc::new(conn))
    }
}

struct VirshConnection {
    program: PathBuf,
    uri: String,
    log: Logger,
}

impl VirshConnection {
    /// Runs `virsh -c <uri> <args..>`, returning stdout on success and a
    /// description of the failure otherwise.
    fn run(&self, args: &[&str]) -> Result<String, String> {
        debug!(self.log, "executing virsh command"; "args" => ?args);

        let output: Output = Command::new(&self.program)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                format!("running {} failed: {e}", self.program.display())
            })?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(self.log, "virsh command failed";
                "args" => ?args,
                "error_code" => ?output.status.code(),
                "stdout" => %stdout.trim(),
                "stderr" => %stderr.trim());
            let msg = stderr.trim();
            return Err(if msg.is_empty() {
                format!("virsh returned error {:?}", output.status.code())
            } else {
                msg.to_string()
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn domain_op(
        &self,
        op: DomainOp,
        verb: &str,
        name: &str,
    ) -> Result<(), HypervisorError> {
        self.run(&[verb, name]).map(|_| ()).map_err(|message| {
            HypervisorError::Domain { op, name: name.to_string(), message }
        })
    }
}

impl Connection for VirshConnection {
    fn list_domains(
        &self,
        flags: DomainListFlags,
    ) -> Result<Vec<String>, HypervisorError> {
        let mut args = vec!["list", "--name"];
        if flags.contains(DomainListFlags::ACTIVE | DomainListFlags::INACTIVE)
        {
            args.push("--all");
        } else if flags.contains(DomainListFlags::INACTIVE) {
            args.push("--inactive");
        }
        let out = self.run(&args).map_err(HypervisorError::List)?;
        Ok(parse_names(&out))
    }

    fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError> {
        let out = self.run(&["domstate", name]).map_err(|message| {
            HypervisorError::Domain {
                op: DomainOp::Lookup,
                name: name.to_string(),
                message,
            }
        })?;
        parse_domstate(&out)
    }

    fn define(&self, xml: &str) -> Result<(), HypervisorError> {
        let err = |message: String| HypervisorError::Domain {
            op: DomainOp::Define,
            name: domain_name_hint(xml).to_string(),
            message,
        };

        let mut file = tempfile::Builder::new()
            .prefix("domain-")
            .suffix(".xml")
            .tempfile()
            .map_err(|e| err(format!("creating definition file: {e}")))?;
        file.write_all(xml.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| err(format!("writing definition file: {e}")))?;

        let path = file.path().to_string_lossy().into_owned();
        self.run(&["define", &path]).map(|_| ()).map_err(err)
    }

    fn create(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_op(DomainOp::Create, "start", name)
    }

    fn destroy(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_op(DomainOp::Destroy, "destroy", name)
    }

    fn shutdown(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_op(DomainOp::Shutdown, "shutdown", name)
    }

    fn undefine(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain_op(DomainOp::Undefine, "undefine", name)
    }

    fn capabilities(&self) -> Result<String, HypervisorError> {
        self.run(&["capabilities"]).map_err(HypervisorError::Capabilities)
    }
}

fn parse_names(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Maps the human readable state printed by `virsh domstate`.
fn parse_domstate(out: &str) -> Result<DomainState, HypervisorError> {
    let state = match out.trim() {
        "no state" => DomainState::NoState,
        "running" => DomainState::Running,
        "idle" | "blocked" => DomainState::Blocked,
        "paused" => DomainState::Paused,
        "in shutdown" => DomainState::ShuttingDown,
        "shut off" => DomainState::Shutoff,
        "crashed" => DomainState::Crashed,
        "pmsuspended" => DomainState::PmSuspended,
        other => return Err(HypervisorError::UnknownState(other.to_string())),
    };
    Ok(state)
}

/// Best-effort extraction of `<name>` for error messages.
fn domain_name_hint(xml: &str) -> &str {
    xml.split_once("<name>")
        .and_then(|(_, rest)| rest.split_once("</name>"))
        .map(|(name, _)| name.trim())
        .unwrap_or("<unknown>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_domstate_output() {
        assert_eq!(parse_domstate("running\n\n").unwrap(), DomainState::Running);
        assert_eq!(parse_domstate("shut off\n").unwrap(), DomainState::Shutoff);
        assert_eq!(
            parse_domstate("in shutdown").unwrap(),
            DomainState::ShuttingDown
        );
        assert!(matches!(
            parse_domstate("levitating"),
            Err(HypervisorError::UnknownState(_))
        ));
    }

    #[test]
    fn list_output_skips_blank_lines() {
        assert_eq!(parse_names("vm1\nvm2\n\n"), vec!["vm1", "vm2"]);
        assert!(parse_names("\n").is_empty());
    }

    #[test]
    fn name_hint_reads_domain_name() {
        assert_eq!(
            domain_name_hint("<domain type='kvm'>\n  <name>vm1</name>"),
            "vm1"
        );
        assert_eq!(domain_name_hint("<domain/>"), "<unknown>");
    }
}
