// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-instance configuration of a managed virtual machine.
//!
//! [`ConfigDocument`] is the declarative description persisted as
//! `config.json`. [`ConfigStore`] owns the instance directory around it: it
//! reads the document, detects drift between the desired files and the
//! copies last applied, and archives or cleans the directory on teardown.

use std::path::{Path, PathBuf};

use thiserror::Error;

mod document;
mod store;

pub use document::*;
pub use store::*;

/// Errors raised while loading an instance's configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("problem opening config for domain \"{instance}\" at {}: {source}", path.display())]
    Read {
        instance: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("problem parsing config for domain \"{instance}\": {source}")]
    Parse {
        instance: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while manipulating files in an instance directory.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(
        op: &'static str,
        path: &Path,
        source: std::io::Error,
    ) -> Self {
        StoreError::Io { op, path: path.to_path_buf(), source }
    }
}
