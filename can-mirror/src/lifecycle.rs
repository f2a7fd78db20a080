//! Bridge lifecycle
//!
//! [`Bridge::new`] performs every startup check (substitution, disabled
//! messages, working directory) and pre-creates one file per message.
//! [`Bridge::start`] spawns the receive and watch loops, and
//! [`RunningBridge::shutdown`] stops them and collects their counters. Unless
//! files are preserved, a directory created at startup is removed on exit; a
//! folder that already existed only loses the mirrored files.

use crate::catalog::Catalog;
use crate::config::BridgeConfig;
use crate::fingerprint::FingerprintTable;
use crate::projection;
use crate::rx::{RxStats, RxSynchronizer};
use crate::substitution::FileNaming;
use crate::transport::BusTransport;
use crate::types::{MirrorError, Result};
use crate::watch::{self, WatchDispatcher, WatchStats};
use notify::RecommendedWatcher;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Prefix of working directories created under the system temp folder
pub const TEMP_DIR_PREFIX: &str = "can-mirror-";

/// The directory holding the mirror, cleaned up on drop unless preserved
///
/// A directory created here is removed with its content. A folder that
/// existed before startup is kept: only the mirrored files are removed, and
/// the folder itself only if nothing else is left in it.
#[derive(Debug)]
pub struct WorkingDir {
    path: PathBuf,
    preserve: bool,
    adopted: bool,
    mirrored: Vec<PathBuf>,
}

impl WorkingDir {
    /// Use `folder` when given, otherwise create a fresh temporary directory
    pub fn resolve(folder: Option<&Path>, preserve: bool) -> Result<Self> {
        let (path, adopted) = match folder {
            Some(folder) => {
                let adopted = folder.exists();
                std::fs::create_dir_all(folder).map_err(|e| {
                    MirrorError::Config(format!("Cannot use {:?} as working directory: {}", folder, e))
                })?;
                (folder.to_path_buf(), adopted)
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix(TEMP_DIR_PREFIX)
                    .tempdir()
                    .map_err(|e| {
                        MirrorError::Config(format!("Cannot create a working directory: {}", e))
                    })?;
                #[allow(deprecated)]
                let path = dir.into_path();
                (path, false)
            }
        };
        if !path.is_dir() {
            return Err(MirrorError::Config(format!("{:?} is not a directory", path)));
        }
        Ok(Self {
            path,
            preserve,
            adopted,
            mirrored: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the files owned by the mirror
    pub fn track(&mut self, files: impl IntoIterator<Item = PathBuf>) {
        self.mirrored.extend(files);
    }

    fn remove_mirrored(&self) {
        for file in &self.mirrored {
            match std::fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove {:?}: {}", file, e),
            }
        }
        match std::fs::remove_dir(&self.path) {
            Ok(()) => log::debug!("Removed {:?}", self.path),
            Err(_) => log::debug!("Leaving {:?}, it holds other files", self.path),
        }
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        if self.preserve {
            log::info!("Keeping {:?}", self.path);
            return;
        }
        if self.adopted {
            self.remove_mirrored();
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("Removed {:?}", self.path),
            Err(e) => log::warn!("Failed to remove {:?}: {}", self.path, e),
        }
    }
}

/// Counters of both loops at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeReport {
    pub rx: RxStats,
    pub watch: WatchStats,
}

/// A configured bridge whose loops have not started yet
pub struct Bridge {
    config: BridgeConfig,
    catalog: Arc<Catalog>,
    transport: Arc<dyn BusTransport>,
    naming: Arc<FileNaming>,
    fingerprints: Arc<FingerprintTable>,
    rx_disabled: HashSet<u32>,
    workdir: WorkingDir,
}

impl Bridge {
    /// Validate the configuration and populate the working directory
    pub fn new(
        config: BridgeConfig,
        catalog: Arc<Catalog>,
        transport: Arc<dyn BusTransport>,
    ) -> Result<Self> {
        config.validate()?;
        if catalog.is_empty() {
            return Err(MirrorError::Config("The catalog holds no message".to_string()));
        }
        let rule = config.substitution_rule()?;
        let naming = FileNaming::new(&catalog, rule.as_ref())?;
        let rx_disabled = resolve_disabled(&catalog, &config.disable_rx)?;

        let mut workdir =
            WorkingDir::resolve(config.output_folder.as_deref(), config.preserve_files)?;
        let created = populate(&catalog, &naming, workdir.path())?;
        let mirrored: Vec<PathBuf> = catalog
            .ids()
            .filter_map(|id| naming.file_name(id))
            .map(|file_name| workdir.path().join(file_name))
            .collect();
        workdir.track(mirrored);
        log::info!(
            "Mirroring {} messages in {:?} ({} files created)",
            catalog.messages().len(),
            workdir.path(),
            created
        );

        Ok(Self {
            fingerprints: Arc::new(FingerprintTable::new(config.echo_grace())),
            config,
            catalog,
            transport,
            naming: Arc::new(naming),
            rx_disabled,
            workdir,
        })
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Start the receive and watch loops on their own threads
    pub fn start(self) -> Result<RunningBridge> {
        let mut synchronizer = RxSynchronizer::new(
            Arc::clone(&self.catalog),
            &self.naming,
            Arc::clone(&self.fingerprints),
            self.workdir.path(),
            &self.config,
            &self.rx_disabled,
        )?;
        synchronizer.resume_histories();

        let dispatcher = WatchDispatcher::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.naming),
            Arc::clone(&self.fingerprints),
            Arc::clone(&self.transport),
            self.workdir.path(),
        )
        .with_force_extended_id(self.config.force_extended_id)
        .with_warning_interval(self.config.warning_interval());

        // Watch before receiving so that no edit made after startup is missed
        let (watcher, events) =
            watch::watch_directory(self.workdir.path(), self.config.event_queue_capacity)?;

        let stop = Arc::new(AtomicBool::new(false));
        let poll = self.config.poll_interval();

        let watch_thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("can-mirror-watch".to_string())
                .spawn(move || dispatcher.run(events, stop, poll))?
        };
        let rx_thread = {
            let stop = Arc::clone(&stop);
            let transport = Arc::clone(&self.transport);
            std::thread::Builder::new()
                .name("can-mirror-rx".to_string())
                .spawn(move || synchronizer.run(transport, stop, poll))
        };
        let rx_thread = match rx_thread {
            Ok(handle) => handle,
            Err(e) => {
                stop.store(true, Ordering::SeqCst);
                let _ = watch_thread.join();
                return Err(e.into());
            }
        };

        Ok(RunningBridge {
            stop,
            rx_thread: Some(rx_thread),
            watch_thread: Some(watch_thread),
            watcher: Some(watcher),
            workdir: self.workdir,
        })
    }
}

/// A bridge whose loops are running
pub struct RunningBridge {
    stop: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<RxStats>>,
    watch_thread: Option<JoinHandle<WatchStats>>,
    watcher: Option<RecommendedWatcher>,
    workdir: WorkingDir,
}

impl RunningBridge {
    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Whether both loops are still running
    pub fn is_running(&self) -> bool {
        [
            self.rx_thread.as_ref().map(JoinHandle::is_finished),
            self.watch_thread.as_ref().map(JoinHandle::is_finished),
        ]
        .iter()
        .all(|finished| *finished == Some(false))
    }

    /// Stop both loops, wait for in-flight work and clean up
    ///
    /// Each loop notices the request within one poll interval.
    pub fn shutdown(mut self) -> BridgeReport {
        log::info!("Shutting down");
        let report = self.stop_loops();
        log::info!(
            "Received {} frames ({} written), sent {} edits ({} rejected, {} echoes dropped)",
            report.rx.frames,
            report.rx.written,
            report.watch.sent,
            report.watch.rejected,
            report.watch.echoes
        );
        report
    }

    fn stop_loops(&mut self) -> BridgeReport {
        self.stop.store(true, Ordering::SeqCst);
        let watch = join_loop(self.watch_thread.take(), "watch");
        // No more events are consumed past this point
        drop(self.watcher.take());
        let rx = join_loop(self.rx_thread.take(), "receive");
        BridgeReport { rx, watch }
    }
}

impl Drop for RunningBridge {
    fn drop(&mut self) {
        // The working directory is removed only after both loops are gone
        if self.rx_thread.is_some() || self.watch_thread.is_some() {
            self.stop_loops();
        }
    }
}

fn join_loop<T: Default>(handle: Option<JoinHandle<T>>, name: &str) -> T {
    match handle.map(JoinHandle::join) {
        Some(Ok(stats)) => stats,
        Some(Err(_)) => {
            log::error!("The {} loop panicked", name);
            T::default()
        }
        None => T::default(),
    }
}

/// Map `disable_rx` entries (message names or identifiers) to identifiers
pub fn resolve_disabled(catalog: &Catalog, entries: &[String]) -> Result<HashSet<u32>> {
    entries
        .iter()
        .map(|entry| {
            if let Some(message) = catalog.get_message_by_name(entry) {
                return Ok(message.id);
            }
            parse_id(entry)
                .filter(|id| catalog.get_message(*id).is_some())
                .ok_or_else(|| {
                    MirrorError::Config(format!("Cannot disable reception of unknown message '{}'", entry))
                })
        })
        .collect()
}

fn parse_id(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Create the placeholder file of every message, keeping existing ones
///
/// Returns how many files were created.
pub fn populate(catalog: &Catalog, naming: &FileNaming, dir: &Path) -> Result<usize> {
    let mut created = 0;
    for message in catalog.messages() {
        let file_name = naming
            .file_name(message.id)
            .ok_or(MirrorError::MessageNotFound(message.id))?;
        let path = dir.join(&file_name);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                log::debug!("Keeping existing {}", file_name);
                continue;
            }
            Err(e) => {
                return Err(MirrorError::Config(format!("Cannot create {:?}: {}", path, e)));
            }
        };
        let defaults = catalog.default_values(message.id).unwrap_or_default();
        file.write_all(&projection::to_file_content(&projection::default_document(&defaults))?)?;
        created += 1;
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualBus;
    use serde_json::json;

    const DBC: &str = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1 ECU2

BO_ 801 Bootloader_Identification: 1 ECU1
 SG_ Status : 0|8@1+ (1,0) [0|1] "" ECU2

BO_ 512 VehicleState: 2 ECU1
 SG_ Speed : 0|8@1+ (1,0) [0|250] "km/h" ECU2
 SG_ Gear : 8|4@1+ (1,0) [0|8] "" ECU2

VAL_ 801 Status 0 "Inactive" 1 "Active" ;
"#;

    fn catalog() -> Arc<Catalog> {
        Arc::new(Catalog::from_dbc_str(DBC).unwrap())
    }

    fn read_json(path: &Path) -> serde_json::Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_temporary_workdir_is_removed() {
        let workdir = WorkingDir::resolve(None, false).unwrap();
        let path = workdir.path().to_path_buf();
        assert!(path.is_dir());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(TEMP_DIR_PREFIX));
        drop(workdir);
        assert!(!path.exists());
    }

    #[test]
    fn test_preserved_workdir_stays() {
        let parent = tempfile::tempdir().unwrap();
        let folder = parent.path().join("mirror");
        drop(WorkingDir::resolve(Some(&folder), true).unwrap());
        assert!(folder.is_dir());
    }

    #[test]
    fn test_existing_folder_keeps_foreign_files() {
        let folder = tempfile::tempdir().unwrap();
        let notes = folder.path().join("thesis.txt");
        std::fs::write(&notes, "do not lose me").unwrap();

        let bus = VirtualBus::new("vcan0");
        let config = BridgeConfig::new()
            .with_output_folder(folder.path())
            .with_poll_interval(std::time::Duration::from_millis(20));
        let bridge = Bridge::new(config, catalog(), Arc::new(bus.endpoint())).unwrap();
        assert!(folder.path().join("VehicleState.json").is_file());
        bridge.start().unwrap().shutdown();

        assert!(folder.path().is_dir());
        assert_eq!(std::fs::read_to_string(&notes).unwrap(), "do not lose me");
        assert!(!folder.path().join("VehicleState.json").exists());
        assert!(!folder.path().join("Bootloader_Identification.json").exists());
    }

    #[test]
    fn test_existing_folder_removed_once_empty() {
        let parent = tempfile::tempdir().unwrap();
        let folder = parent.path().join("mirror");
        std::fs::create_dir(&folder).unwrap();

        let bus = VirtualBus::new("vcan0");
        let config = BridgeConfig::new().with_output_folder(&folder);
        drop(Bridge::new(config, catalog(), Arc::new(bus.endpoint())).unwrap());
        assert!(!folder.exists());
    }

    #[test]
    fn test_populate_creates_defaults_without_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog();
        let naming = FileNaming::new(&catalog, None).unwrap();
        let existing = dir.path().join("VehicleState.json");
        std::fs::write(&existing, "[{\"Speed\": 3, \"Gear\": 1}]").unwrap();

        assert_eq!(populate(&catalog, &naming, dir.path()).unwrap(), 1);
        assert_eq!(
            read_json(&dir.path().join("Bootloader_Identification.json")),
            json!({"Status": "Inactive"})
        );
        assert_eq!(read_json(&existing), json!([{"Speed": 3, "Gear": 1}]));
        assert_eq!(populate(&catalog, &naming, dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_resolve_disabled_by_name_or_id() {
        let catalog = catalog();
        let entries = vec![
            "VehicleState".to_string(),
            "0x321".to_string(),
            "512".to_string(),
        ];
        let disabled = resolve_disabled(&catalog, &entries).unwrap();
        assert_eq!(disabled, HashSet::from([0x200, 0x321]));

        let err = resolve_disabled(&catalog, &["Cmd".to_string()]).unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
    }

    #[test]
    fn test_startup_failures_happen_before_any_file() {
        let parent = tempfile::tempdir().unwrap();
        let folder = parent.path().join("mirror");
        let bus = VirtualBus::new("vcan0");

        let bad_pattern = BridgeConfig::new()
            .with_output_folder(&folder)
            .with_substitution("3**:4*");
        assert!(Bridge::new(bad_pattern, catalog(), Arc::new(bus.endpoint())).is_err());

        let bad_disable = BridgeConfig::new()
            .with_output_folder(&folder)
            .disable_rx_for("Cmd");
        assert!(Bridge::new(bad_disable, catalog(), Arc::new(bus.endpoint())).is_err());

        assert!(!folder.exists());
    }

    #[test]
    fn test_start_and_shutdown_cleans_up() {
        let bus = VirtualBus::new("vcan0");
        let config = BridgeConfig::new().with_poll_interval(std::time::Duration::from_millis(20));
        let bridge = Bridge::new(config, catalog(), Arc::new(bus.endpoint())).unwrap();
        let workdir = bridge.workdir().to_path_buf();
        assert!(workdir.join("VehicleState.json").is_file());

        let running = bridge.start().unwrap();
        assert!(running.is_running());
        let report = running.shutdown();
        assert_eq!(report, BridgeReport::default());
        assert!(!workdir.exists());
    }
}
