// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle management of a single libvirt-hosted virtual machine.
//!
//! The [`controller::LifecycleController`] is the entry point: it reads the
//! instance's configuration through a
//! [`ConfigStore`](vm_instance_config::ConfigStore), observes the domain
//! through an [`inspector::Inspector`], and issues commands over a
//! connection obtained from a [`connection::ConnectionManager`]. External
//! services (the hypervisor, the host service manager, the guest's health
//! endpoint, and the wall clock) sit behind traits so they can be replaced
//! in tests.

pub mod connection;
pub mod controller;
pub mod dispatch;
pub mod health;
pub mod host;
pub mod hypervisor;
pub mod inspector;
pub mod provision;
pub mod report;
pub mod service;
pub mod settings;
pub mod wait;

pub use controller::{Collaborators, LifecycleController, Outcome, TeardownReport};
pub use settings::AdaptorSettings;
pub use vm_instance_config;
