// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use slog::{error, info, o, warn, Drain, Level, Logger};

use vm_lifecycle::connection::ConnectionManager;
use vm_lifecycle::dispatch::{self, DispatchError};
use vm_lifecycle::health::HttpProbe;
use vm_lifecycle::host::{CommandHostProbe, HostRelease};
use vm_lifecycle::hypervisor::Connector;
use vm_lifecycle::report::ConsoleReporter;
use vm_lifecycle::service::Systemctl;
use vm_lifecycle::wait::SystemClock;
use vm_lifecycle::{
    AdaptorSettings, Collaborators, LifecycleController, Outcome,
};

const PROGRAM: &str = "vm-adaptor";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Plain,
    Bunyan,
}

#[derive(Debug, Parser)]
#[clap(about, version, name = PROGRAM)]
struct Opt {
    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    /// Adaptor settings file
    #[clap(long, env = "VM_ADAPTOR_SETTINGS")]
    settings: Option<PathBuf>,

    /// Hypervisor URI, overriding the settings file
    #[clap(long, env = "VM_ADAPTOR_CONNECT_URI")]
    connect_uri: Option<String>,

    #[clap(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    /// Append log records to this file rather than stderr
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// VM instance name
    instance_name: String,

    /// VM instance action
    action: String,

    /// Arguments to the action
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    options: Vec<String>,
}

/// Adaptor flags go before the instance name.
const ADAPTOR_FLAGS: [&str; 5] =
    ["debug", "settings", "connect_uri", "log_format", "log_file"];

/// Whether an adaptor flag was given after the action, where only the
/// action's own arguments may appear.
fn flag_after_action(matches: &ArgMatches) -> bool {
    let Some(action) = matches.index_of("action") else {
        return false;
    };
    ADAPTOR_FLAGS.iter().any(|id| {
        matches.value_source(id) == Some(ValueSource::CommandLine)
            && matches.index_of(id).is_some_and(|i| i > action)
    })
}

fn build_logger(opt: &Opt) -> anyhow::Result<(Logger, slog_async::AsyncGuard)> {
    let level = if opt.debug { Level::Debug } else { Level::Info };

    let sink: Box<dyn std::io::Write + Send> = match &opt.log_file {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?,
        ),
        None => Box::new(std::io::stderr()),
    };

    let (drain, guard) = match opt.log_format {
        LogFormat::Plain
            if opt.log_file.is_none() && atty::is(atty::Stream::Stderr) =>
        {
            let decorator = slog_term::TermDecorator::new().stderr().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog::LevelFilter(drain, level).fuse();
            slog_async::Async::new(drain).build_with_guard()
        }
        LogFormat::Plain => {
            let decorator = slog_term::PlainDecorator::new(sink);
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog::LevelFilter(drain, level).fuse();
            slog_async::Async::new(drain).build_with_guard()
        }
        LogFormat::Bunyan => {
            let drain = slog_bunyan::with_name(PROGRAM, sink).build().fuse();
            let drain = slog::LevelFilter(drain, level).fuse();
            slog_async::Async::new(drain).build_with_guard()
        }
    };
    Ok((Logger::root(drain.fuse(), o!()), guard))
}

fn connector(settings: &AdaptorSettings, log: &Logger) -> Box<dyn Connector> {
    #[cfg(feature = "libvirt")]
    {
        let _ = (settings, log);
        Box::new(vm_lifecycle::hypervisor::libvirt::LibvirtConnector)
    }
    #[cfg(not(feature = "libvirt"))]
    {
        Box::new(vm_lifecycle::hypervisor::virsh::VirshConnector::new(
            settings.virsh.clone(),
            log,
        ))
    }
}

fn main() -> anyhow::Result<()> {
    let matches = Opt::command().get_matches();
    let opt =
        Opt::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    let (log, guard) = build_logger(&opt)?;

    let mut settings = match &opt.settings {
        Some(path) => AdaptorSettings::load(path)?,
        None => AdaptorSettings::default(),
    };
    if let Some(uri) = &opt.connect_uri {
        settings.connect_uri = uri.clone();
    }

    let resolved = if flag_after_action(&matches) {
        Err(DispatchError::UnsupportedArgument)
    } else {
        dispatch::resolve(&opt.action, &opt.options)
    };
    let request = match resolved {
        Ok(request) => request,
        Err(e) => {
            match &e {
                DispatchError::UnknownAction(_) => {
                    eprint!("{}", dispatch::usage(PROGRAM))
                }
                DispatchError::UnsupportedArgument => eprintln!("{e}"),
                DispatchError::InvalidOptions(err) => {
                    let _ = err.print();
                }
            }
            drop(guard);
            std::process::exit(e.outcome().code());
        }
    };

    let release = HostRelease::read(&settings.release_file).unwrap_or_else(|e| {
        warn!(log, "cannot read host release";
            "path" => %settings.release_file.display(), "error" => %e);
        HostRelease::unknown()
    });

    let connections = Arc::new(ConnectionManager::with_default_uri(
        connector(&settings, &log),
        settings.connect_uri.clone(),
        &log,
    ));
    let parts = Collaborators {
        connections,
        services: Box::new(Systemctl::new(settings.systemctl.clone(), &log)),
        probe: Box::new(
            HttpProbe::new(settings.health_probe_timeout())
                .context("building health probe client")?,
        ),
        host: Box::new(CommandHostProbe::new(
            settings.virt_what.clone(),
            settings.lsblk.clone(),
            &log,
        )),
        reporter: Box::new(ConsoleReporter::new(&log)),
        clock: Arc::new(SystemClock),
    };
    let controller = LifecycleController::new(
        opt.instance_name.clone(),
        settings,
        release,
        parts,
        &log,
    );

    if let Err(e) = controller.check_config() {
        error!(log, "{}", e);
        let msg = format!(
            "Error: cannot read config file: {}",
            controller.store().config_path().display()
        );
        error!(log, "{}", msg);
        println!("{e}");
        println!("{msg}");
        drop(guard);
        std::process::exit(Outcome::UnknownCommand.code());
    }

    info!(log, "dispatching"; "action" => %request.action);
    let outcome = dispatch::run(&controller, request);
    drop(controller);
    drop(guard);
    std::process::exit(outcome.code());
}
