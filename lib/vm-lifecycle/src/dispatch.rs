// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mapping of command-line actions onto controller operations.

use clap::Parser;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

use crate::controller::{LifecycleController, Outcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Action {
    Start,
    Stop,
    Status,
    Restart,
    ForceStop,
    ForceRestart,
    StopUndefine,
    ForceStopUndefine,
}

/// A validated action and its arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub action: Action,

    /// Seconds before a graceful stop escalates; zero defers to the
    /// instance configuration.
    pub stop_timeout: u64,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("Unsupported argument provided.")]
    UnsupportedArgument,

    #[error(transparent)]
    InvalidOptions(#[from] clap::Error),
}

impl DispatchError {
    pub fn outcome(&self) -> Outcome {
        Outcome::UnknownCommand
    }
}

/// The one-line usage, ending in a newline.
pub fn usage(program: &str) -> String {
    let actions: Vec<String> = Action::iter().map(|a| a.to_string()).collect();
    format!("{program} <instance_name> [{}]\n", actions.join("|"))
}

#[derive(Parser, Debug)]
#[clap(name = "stop-undefine", no_binary_name = true, disable_help_flag = true)]
struct StopUndefineOpt {
    /// Time in seconds. Once it elapses the graceful shut down of the VM
    /// gives way to a destroy, followed by undefining of the VM.
    #[clap(long, value_name = "positive_integer", value_parser = positive_integer)]
    stop_timeout: Option<u64>,
}

fn positive_integer(value: &str) -> Result<u64, String> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("invalid value: {value}")),
    }
}

/// Resolves `action`, case-insensitively, and validates the arguments that
/// followed it.
pub fn resolve(action: &str, options: &[String]) -> Result<Request, DispatchError> {
    let action: Action = action
        .parse()
        .map_err(|_| DispatchError::UnknownAction(action.to_string()))?;

    let stop_timeout = match action {
        Action::StopUndefine => {
            let opt = StopUndefineOpt::try_parse_from(options)?;
            opt.stop_timeout.unwrap_or(0)
        }
        _ if !options.is_empty() => {
            return Err(DispatchError::UnsupportedArgument)
        }
        _ => 0,
    };
    Ok(Request { action, stop_timeout })
}

pub fn run(controller: &LifecycleController, request: Request) -> Outcome {
    match request.action {
        Action::Start => controller.start(),
        Action::Stop => controller.stop(0),
        Action::Status => controller.status(),
        Action::Restart => controller.restart(),
        Action::ForceStop => controller.force_stop(),
        Action::ForceRestart => controller.force_restart(),
        Action::StopUndefine => {
            controller.stop_undefine(request.stop_timeout).outcome
        }
        Action::ForceStopUndefine => controller.force_stop_undefine().outcome,
    }
}
