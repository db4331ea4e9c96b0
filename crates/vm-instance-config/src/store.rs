// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk state of a single instance.
//!
//! Each instance owns a directory holding four tracked files, each with a
//! `.live` counterpart recording what was last applied:
//!
//! ```text
//! <instances>/<name>/config.json       config.json.live
//!                    user-data         user-data.live
//!                    meta-data         meta-data.live
//!                    network-config    network-config.live
//!                    cloud_init.img
//!                    <image>
//!                    last_undefined_vm/
//! ```

use std::cell::OnceCell;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use ring::digest::{Context, Digest, SHA256};
use slog::{debug, error, info, o, Logger};

use crate::{AdaptorData, ConfigDocument, ConfigError, StoreError, VmData};

pub const CONFIG_FILE: &str = "config.json";
pub const USER_DATA: &str = "user-data";
pub const META_DATA: &str = "meta-data";
pub const NETWORK_CONFIG: &str = "network-config";
pub const LIVE_SUFFIX: &str = ".live";
pub const BACKUP_DIR: &str = "last_undefined_vm";
pub const CLOUD_INIT_IMAGE: &str = "cloud_init.img";

/// Files whose desired and live copies are compared for drift.
pub const TRACKED_FILES: [&str; 4] =
    [CONFIG_FILE, USER_DATA, META_DATA, NETWORK_CONFIG];

const BACKUP_TIMESTAMP: &str = "%Y%m%d%H%M%S";

/// Outcome of moving the live files of an instance into its backup
/// directory.
#[derive(Debug, Default)]
pub struct ArchiveReport {
    /// The backup directory, if anything was archived.
    pub backup_dir: Option<PathBuf>,

    /// Destination paths of the files which were moved.
    pub moved: Vec<PathBuf>,

    /// Files which could not be moved. These do not abort the archive.
    pub failed: Vec<StoreError>,
}

/// Access to the configuration and generated files of one instance.
pub struct ConfigStore {
    name: String,
    instance_dir: PathBuf,
    doc: OnceCell<ConfigDocument>,
    log: Logger,
}

impl ConfigStore {
    pub fn new(
        name: impl Into<String>,
        instances_root: impl AsRef<Path>,
        log: &Logger,
    ) -> Self {
        let name = name.into();
        let instance_dir = instances_root.as_ref().join(&name);
        let log = log.new(o!("component" => "config-store"));
        Self { name, instance_dir, doc: OnceCell::new(), log }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.instance_dir.join(CONFIG_FILE)
    }

    pub fn cloud_init_image_path(&self) -> PathBuf {
        self.instance_dir.join(CLOUD_INIT_IMAGE)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.instance_dir.join(BACKUP_DIR)
    }

    /// Path of a tracked file inside the instance directory.
    pub fn desired_path(&self, file: &str) -> PathBuf {
        self.instance_dir.join(file)
    }

    pub fn live_path(&self, file: &str) -> PathBuf {
        self.instance_dir.join(format!("{file}{LIVE_SUFFIX}"))
    }

    fn tracked_pairs(&self) -> impl Iterator<Item = (PathBuf, PathBuf)> + '_ {
        TRACKED_FILES
            .iter()
            .map(|f| (self.desired_path(f), self.live_path(f)))
    }

    /// Parses `config.json`, at most once per store.
    ///
    /// A failed read is not remembered, so a later call retries.
    pub fn read_config(&self) -> Result<&ConfigDocument, ConfigError> {
        if let Some(doc) = self.doc.get() {
            return Ok(doc);
        }

        let path = self.config_path();
        let contents = fs::read_to_string(&path).map_err(|source| {
            ConfigError::Read { instance: self.name.clone(), path, source }
        })?;
        let doc = serde_json::from_str::<ConfigDocument>(&contents).map_err(
            |source| ConfigError::Parse { instance: self.name.clone(), source },
        )?;
        Ok(self.doc.get_or_init(|| doc))
    }

    pub fn vm_data(&self) -> Result<&VmData, ConfigError> {
        Ok(&self.read_config()?.vm_data)
    }

    pub fn adaptor_data(&self) -> Result<&AdaptorData, ConfigError> {
        Ok(&self.read_config()?.adaptor_data)
    }

    /// The instance's private copy of its base image.
    pub fn instance_image_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.instance_dir.join(&self.vm_data()?.image))
    }

    /// Whether a configuration has ever been applied to this instance.
    pub fn live_snapshot_exists(&self) -> bool {
        self.live_path(CONFIG_FILE).exists()
    }

    /// Compares every tracked file against its live copy.
    ///
    /// Any file which cannot be read counts as drift.
    pub fn config_drifted(&self) -> bool {
        for (desired, live) in self.tracked_pairs() {
            match (file_digest(&desired), file_digest(&live)) {
                (Ok(a), Ok(b)) => {
                    if a.as_ref() != b.as_ref() {
                        debug!(self.log, "configuration drift detected";
                            "file" => %desired.display(),
                            "desired" => hex::encode(a.as_ref()),
                            "live" => hex::encode(b.as_ref()));
                        return true;
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    info!(self.log,
                        "error while checking the checksum of the configuration";
                        "file" => %desired.display(),
                        "error" => %e);
                    return true;
                }
            }
        }
        false
    }

    /// Copies each tracked file over its live counterpart.
    ///
    /// Stops at the first failure; files copied before it stay copied.
    pub fn promote_to_live(&self) -> Result<(), StoreError> {
        for (desired, live) in self.tracked_pairs() {
            debug!(self.log, "promoting to live"; "file" => %desired.display());
            fs::copy(&desired, &live)
                .map_err(|e| StoreError::io("copy", &desired, e))?;
        }
        Ok(())
    }

    /// Removes everything in the instance directory except the tracked
    /// desired files and the backup directory.
    pub fn clean_instance_directory(&self) -> Result<(), StoreError> {
        let entries = fs::read_dir(&self.instance_dir)
            .map_err(|e| StoreError::io("list", &self.instance_dir, e))?;

        for entry in entries {
            let entry = entry
                .map_err(|e| StoreError::io("list", &self.instance_dir, e))?;
            let fname = entry.file_name();
            if fname
                .to_str()
                .is_some_and(|f| f == BACKUP_DIR || TRACKED_FILES.contains(&f))
            {
                continue;
            }

            let path = entry.path();
            let is_dir = entry
                .file_type()
                .map_err(|e| StoreError::io("stat", &path, e))?
                .is_dir();
            let res = if is_dir {
                debug!(self.log, "removing directory"; "path" => %path.display());
                fs::remove_dir_all(&path)
            } else {
                debug!(self.log, "removing file"; "path" => %path.display());
                fs::remove_file(&path)
            };
            if let Err(e) = res {
                error!(self.log, "failed to remove";
                    "path" => %path.display(), "error" => %e);
                return Err(StoreError::io("remove", &path, e));
            }
        }
        Ok(())
    }

    /// Moves the live files and the instance image into a freshly emptied
    /// backup directory, suffixing each with `timestamp`.
    ///
    /// Nothing is moved when the instance image does not exist.
    pub fn archive_live_files(
        &self,
        timestamp: NaiveDateTime,
    ) -> Result<ArchiveReport, StoreError> {
        let image = self.instance_image_path()?;
        if !image.exists() {
            info!(self.log, "no image found, nothing to save";
                "image" => %image.display());
            return Ok(ArchiveReport::default());
        }

        let backup_dir = self.backup_dir();
        if backup_dir.is_dir() {
            debug!(self.log, "removing directory"; "path" => %backup_dir.display());
            fs::remove_dir_all(&backup_dir)
                .map_err(|e| StoreError::io("remove", &backup_dir, e))?;
        }
        fs::create_dir(&backup_dir)
            .map_err(|e| StoreError::io("create", &backup_dir, e))?;

        let suffix = timestamp.format(BACKUP_TIMESTAMP).to_string();
        let sources = std::iter::once(image)
            .chain(TRACKED_FILES.iter().map(|f| self.live_path(f)));

        let mut report = ArchiveReport {
            backup_dir: Some(backup_dir.clone()),
            ..Default::default()
        };
        for src in sources {
            let Some(fname) = src.file_name() else {
                continue;
            };
            let dest = backup_dir
                .join(format!("{}-{suffix}", fname.to_string_lossy()));
            debug!(self.log, "moving file";
                "from" => %src.display(), "to" => %dest.display());
            match fs::rename(&src, &dest) {
                Ok(()) => report.moved.push(dest),
                Err(e) => {
                    info!(self.log, "failed to move file";
                        "path" => %src.display(), "error" => %e);
                    report.failed.push(StoreError::io("move", &src, e));
                }
            }
        }
        Ok(report)
    }

    /// Archives the live files (see [`ConfigStore::archive_live_files`]) and
    /// then cleans the instance directory.
    pub fn archive_and_clear(&self) -> Result<ArchiveReport, StoreError> {
        let report =
            self.archive_live_files(chrono::Local::now().naive_local())?;
        self.clean_instance_directory()?;
        Ok(report)
    }
}

fn file_digest(path: &Path) -> io::Result<Digest> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut context = Context::new(&SHA256);
    let mut buffer = [0; 1024];

    loop {
        let count = reader.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        context.update(&buffer[..count]);
    }

    Ok(context.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;
    use tempfile::TempDir;

    const CONFIG: &str = r#"{
        "vm_data": {"cpu": 2, "ram": "1024M", "image": "base.qcow2"},
        "adaptor_data": {"stop-timeout": 10}
    }"#;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    /// An instance directory with every tracked file and its live copy in
    /// place and identical.
    fn deployed_instance() -> (TempDir, ConfigStore) {
        let root = tempfile::tempdir().unwrap();
        let store = ConfigStore::new("vm1", root.path(), &test_logger());
        fs::create_dir(store.instance_dir()).unwrap();
        for f in TRACKED_FILES {
            let body = if f == CONFIG_FILE {
                CONFIG.to_string()
            } else {
                format!("{f} contents\n")
            };
            fs::write(store.desired_path(f), &body).unwrap();
            fs::write(store.live_path(f), &body).unwrap();
        }
        (root, store)
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn read_config_is_memoized() {
        let (_root, store) = deployed_instance();
        let first = store.read_config().unwrap() as *const ConfigDocument;

        // Later edits are not observed by the same store.
        fs::write(store.config_path(), "not json").unwrap();
        let second = store.read_config().unwrap() as *const ConfigDocument;
        assert_eq!(first, second);
        assert_eq!(store.adaptor_data().unwrap().stop_timeout, Some(10));
    }

    #[test]
    fn read_config_reports_instance_and_cause() {
        let root = tempfile::tempdir().unwrap();
        let store = ConfigStore::new("ghost", root.path(), &test_logger());
        match store.read_config() {
            Err(ConfigError::Read { instance, .. }) => {
                assert_eq!(instance, "ghost")
            }
            other => panic!("unexpected result {other:?}"),
        }

        fs::create_dir(store.instance_dir()).unwrap();
        fs::write(store.config_path(), "{\"vm_data\": 3}").unwrap();
        match store.read_config() {
            Err(e @ ConfigError::Parse { .. }) => {
                assert!(e.to_string().contains("ghost"))
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn identical_snapshots_have_not_drifted() {
        let (_root, store) = deployed_instance();
        assert!(store.live_snapshot_exists());
        assert!(!store.config_drifted());
    }

    #[test]
    fn single_byte_change_is_drift() {
        for f in TRACKED_FILES {
            let (_root, store) = deployed_instance();
            let mut bytes = fs::read(store.desired_path(f)).unwrap();
            bytes[0] ^= 0x01;
            fs::write(store.desired_path(f), bytes).unwrap();
            assert!(store.config_drifted(), "change to {f} not detected");
        }
    }

    #[test]
    fn unreadable_file_is_drift() {
        let (_root, store) = deployed_instance();
        fs::remove_file(store.live_path(META_DATA)).unwrap();
        assert!(store.config_drifted());
    }

    #[test]
    fn missing_live_config_is_not_deployed() {
        let (_root, store) = deployed_instance();
        fs::remove_file(store.live_path(CONFIG_FILE)).unwrap();
        assert!(!store.live_snapshot_exists());
    }

    #[test]
    fn promote_copies_desired_over_live() {
        let (_root, store) = deployed_instance();
        fs::write(store.desired_path(USER_DATA), "#cloud-config\n").unwrap();
        assert!(store.config_drifted());

        store.promote_to_live().unwrap();
        assert!(!store.config_drifted());
        assert_eq!(
            fs::read_to_string(store.live_path(USER_DATA)).unwrap(),
            "#cloud-config\n"
        );
    }

    #[test]
    fn promote_reports_missing_source() {
        let (_root, store) = deployed_instance();
        fs::remove_file(store.desired_path(NETWORK_CONFIG)).unwrap();
        assert!(matches!(store.promote_to_live(), Err(StoreError::Io { .. })));
    }

    #[test]
    fn clean_keeps_desired_files_and_backups() {
        let (_root, store) = deployed_instance();
        let dir = store.instance_dir();
        fs::write(dir.join("base.qcow2"), b"image").unwrap();
        fs::write(store.cloud_init_image_path(), b"fat").unwrap();
        fs::create_dir(dir.join("scratch")).unwrap();
        fs::write(dir.join("scratch/junk"), b"junk").unwrap();
        fs::create_dir(store.backup_dir()).unwrap();
        fs::write(store.backup_dir().join("old"), b"old").unwrap();

        store.clean_instance_directory().unwrap();

        assert_eq!(
            names_in(dir),
            vec![
                "config.json",
                "last_undefined_vm",
                "meta-data",
                "network-config",
                "user-data"
            ]
        );
        assert_eq!(names_in(&store.backup_dir()), vec!["old"]);
    }

    #[test]
    fn clean_fails_without_instance_dir() {
        let root = tempfile::tempdir().unwrap();
        let store = ConfigStore::new("vm1", root.path(), &test_logger());
        assert!(store.clean_instance_directory().is_err());
    }

    #[test]
    fn archive_moves_live_files_and_image() {
        let (_root, store) = deployed_instance();
        let dir = store.instance_dir().to_path_buf();
        fs::write(dir.join("base.qcow2"), b"image").unwrap();
        fs::write(store.cloud_init_image_path(), b"fat").unwrap();
        fs::create_dir(store.backup_dir()).unwrap();
        fs::write(store.backup_dir().join("stale-20200101000000"), b"")
            .unwrap();

        let report = store.archive_and_clear().unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.moved.len(), 5);
        assert_eq!(report.backup_dir.as_deref(), Some(&*store.backup_dir()));

        // Only the desired files and the backup directory are left behind.
        assert_eq!(
            names_in(&dir),
            vec![
                "config.json",
                "last_undefined_vm",
                "meta-data",
                "network-config",
                "user-data"
            ]
        );

        let archived = names_in(&store.backup_dir());
        assert_eq!(archived.len(), 5);
        let suffixes: Vec<&str> = archived
            .iter()
            .map(|n| n.rsplit_once('-').unwrap().1)
            .collect();
        assert!(suffixes.iter().all(|s| s.len() == 14 && *s == suffixes[0]));

        let mut stems: Vec<&str> =
            archived.iter().map(|n| n.rsplit_once('-').unwrap().0).collect();
        stems.sort();
        assert_eq!(
            stems,
            vec![
                "base.qcow2",
                "config.json.live",
                "meta-data.live",
                "network-config.live",
                "user-data.live"
            ]
        );
    }

    #[test]
    fn archive_uses_supplied_timestamp() {
        let (_root, store) = deployed_instance();
        fs::write(store.instance_dir().join("base.qcow2"), b"image").unwrap();
        let ts = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap();

        let report = store.archive_live_files(ts).unwrap();
        assert!(report
            .moved
            .contains(&store.backup_dir().join("base.qcow2-20240309070501")));
    }

    #[test]
    fn archive_without_image_is_noop() {
        let (_root, store) = deployed_instance();
        let report = store.archive_and_clear().unwrap();
        assert!(report.backup_dir.is_none());
        assert!(report.moved.is_empty());
        assert!(!store.backup_dir().exists());
    }

    #[test]
    fn archive_records_files_it_could_not_move() {
        let (_root, store) = deployed_instance();
        fs::write(store.instance_dir().join("base.qcow2"), b"image").unwrap();
        fs::remove_file(store.live_path(USER_DATA)).unwrap();

        let report = store.archive_and_clear().unwrap();
        assert_eq!(report.moved.len(), 4);
        assert_eq!(report.failed.len(), 1);
    }
}
