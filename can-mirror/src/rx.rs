//! Receive path: bus frames to JSON files
//!
//! The synchronizer owns one [`MessageRecord`] per catalog message. Each
//! accepted frame is decoded, folded into its record and written atomically;
//! the written content is fingerprinted first so that the watch path
//! recognises the resulting notification as an echo.

use crate::catalog::Catalog;
use crate::config::{BridgeConfig, UnknownIdPolicy};
use crate::filter::CanIdPattern;
use crate::fingerprint::{signature, FingerprintTable};
use crate::projection::{self, MessageRecord, ProjectionOptions};
use crate::substitution::FileNaming;
use crate::throttle::WarnThrottle;
use crate::transport::BusTransport;
use crate::types::{BusFrame, MirrorError, Result};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What happened to one received frame
#[derive(Debug, Clone, PartialEq)]
pub enum RxOutcome {
    /// The file was rewritten
    Written(PathBuf),
    /// Diff mode found nothing new to write
    Unchanged,
    /// Rejected by the acceptance filter
    Filtered,
    /// Identifier not in the catalog
    Unknown,
    /// Reception is disabled for this message
    RxDisabled,
    /// The payload could not be decoded
    DecodeFailed,
    /// The file could not be written
    WriteFailed,
}

/// Receive path counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStats {
    pub frames: u64,
    pub written: u64,
    pub unchanged: u64,
    pub filtered: u64,
    pub unknown: u64,
    pub rx_disabled: u64,
    pub decode_errors: u64,
    pub write_errors: u64,
    pub receive_errors: u64,
}

/// Mirrors decoded frames onto the working directory
pub struct RxSynchronizer {
    catalog: Arc<Catalog>,
    fingerprints: Arc<FingerprintTable>,
    options: ProjectionOptions,
    unknown_policy: UnknownIdPolicy,
    filter: Option<CanIdPattern>,
    records: HashMap<u32, MessageRecord>,
    reported_unknown: HashSet<u32>,
    write_warnings: WarnThrottle,
    receive_warnings: WarnThrottle,
    stats: RxStats,
}

impl RxSynchronizer {
    /// Build one record per catalog message
    ///
    /// `rx_disabled` holds the identifiers whose files reception must leave
    /// alone.
    pub fn new(
        catalog: Arc<Catalog>,
        naming: &FileNaming,
        fingerprints: Arc<FingerprintTable>,
        workdir: &Path,
        config: &BridgeConfig,
        rx_disabled: &HashSet<u32>,
    ) -> Result<Self> {
        let records = catalog
            .messages()
            .iter()
            .map(|message| {
                let file_name = naming
                    .file_name(message.id)
                    .ok_or(MirrorError::MessageNotFound(message.id))?;
                let record = MessageRecord::new(
                    message.id,
                    workdir.join(file_name),
                    !rx_disabled.contains(&message.id),
                );
                Ok((message.id, record))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            catalog,
            fingerprints,
            options: ProjectionOptions::from(config),
            unknown_policy: config.unknown_ids,
            filter: config.rx_filter,
            records,
            reported_unknown: HashSet::new(),
            write_warnings: WarnThrottle::new(config.warning_interval()),
            receive_warnings: WarnThrottle::new(config.warning_interval()),
            stats: RxStats::default(),
        })
    }

    /// Pick up histories left in the working directory by a previous run
    pub fn resume_histories(&mut self) {
        if !self.options.accumulate {
            return;
        }
        for record in self.records.values_mut().filter(|r| r.rx_enabled) {
            let Ok(content) = std::fs::read(&record.path) else {
                continue;
            };
            match serde_json::from_slice(&content) {
                Ok(document) => {
                    let entries = record.seed_history(&document);
                    if entries > 0 {
                        log::info!("Resuming {:?} with {} entries", record.path, entries);
                    }
                }
                Err(e) => log::warn!("Not resuming {:?}: {}", record.path, e),
            }
        }
    }

    /// Counters so far
    pub fn stats(&self) -> &RxStats {
        &self.stats
    }

    /// Receive-side record of a message
    pub fn record(&self, id: u32) -> Option<&MessageRecord> {
        self.records.get(&id)
    }

    /// Mirror one received frame
    pub fn handle_frame(&mut self, frame: &BusFrame) -> RxOutcome {
        self.stats.frames += 1;

        if let Some(filter) = &self.filter {
            if !filter.matches(frame.id) {
                self.stats.filtered += 1;
                return RxOutcome::Filtered;
            }
        }

        let Some(record) = self.records.get_mut(&frame.id) else {
            self.stats.unknown += 1;
            let first_time = self.reported_unknown.insert(frame.id);
            match self.unknown_policy {
                UnknownIdPolicy::Log if first_time => {
                    log::warn!("Ignoring 0x{:X}: not a known ID in the catalog", frame.id)
                }
                _ => log::debug!("Ignoring 0x{:X}: not a known ID in the catalog", frame.id),
            }
            return RxOutcome::Unknown;
        };

        if !record.rx_enabled {
            self.stats.rx_disabled += 1;
            log::trace!("Reception disabled for 0x{:X}, leaving {:?} alone", frame.id, record.path);
            return RxOutcome::RxDisabled;
        }

        let decoded = match self.catalog.decode(frame.id, &frame.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.decode_errors += 1;
                log::warn!("Skipping frame 0x{:X} {:02X?}: {}", frame.id, frame.data, e);
                return RxOutcome::DecodeFailed;
            }
        };

        let Some(document) = record.update(frame, decoded, &self.options) else {
            self.stats.unchanged += 1;
            return RxOutcome::Unchanged;
        };

        let path = record.path.clone();
        match write_document(&self.fingerprints, &path, &document) {
            Ok(signature) => {
                record.set_last_fingerprint(signature);
                self.stats.written += 1;
                log::trace!("Updated {:?}", path);
                RxOutcome::Written(path)
            }
            Err(e) => {
                self.stats.write_errors += 1;
                if let Some(suppressed) = self.write_warnings.admit() {
                    log::warn!(
                        "Failed to write {:?}: {} ({} similar warnings suppressed)",
                        path,
                        e,
                        suppressed
                    );
                }
                RxOutcome::WriteFailed
            }
        }
    }

    /// Receive and mirror frames until `stop` is raised
    ///
    /// The transport is polled with `poll` as timeout so that shutdown is
    /// noticed within one interval.
    pub fn run(
        mut self,
        transport: Arc<dyn BusTransport>,
        stop: Arc<AtomicBool>,
        poll: Duration,
    ) -> RxStats {
        log::info!("Receive loop started on {}", transport.channel());
        while !stop.load(Ordering::SeqCst) {
            match transport.receive(poll) {
                Ok(Some(frame)) => {
                    self.handle_frame(&frame);
                }
                Ok(None) => {}
                Err(e) => {
                    self.stats.receive_errors += 1;
                    if let Some(suppressed) = self.receive_warnings.admit() {
                        log::warn!("{} ({} similar warnings suppressed)", e, suppressed);
                    }
                    std::thread::sleep(poll);
                }
            }
        }
        log::info!("Receive loop stopped: {:?}", self.stats);
        self.stats
    }
}

/// Write a document atomically and fingerprint it
///
/// The fingerprint is registered before the file appears under its final
/// name, so the watch path can never observe the content first.
pub fn write_document(
    fingerprints: &FingerprintTable,
    path: &Path,
    document: &serde_json::Value,
) -> Result<crate::fingerprint::ContentSignature> {
    let content = projection::to_file_content(document)?;
    let dir = path
        .parent()
        .ok_or_else(|| MirrorError::InvalidData(format!("{:?} has no parent directory", path)))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(&content)?;
    temp.flush()?;
    // Closed before the rename: a close-after-write under the final name
    // would look like a second write
    let temp = temp.into_temp_path();
    // Temporary files are private; keep the mode the file already has
    if let Ok(metadata) = std::fs::metadata(path) {
        std::fs::set_permissions(&temp, metadata.permissions())?;
    }

    let signature = signature(&content);
    fingerprints.register(path, signature);
    if let Err(e) = temp.persist(path) {
        fingerprints.withdraw(path, &signature);
        return Err(MirrorError::IoError(e.error));
    }
    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalValue;
    use serde_json::{json, Value};

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

    struct Fixture {
        dir: tempfile::TempDir,
        fingerprints: Arc<FingerprintTable>,
        sync: RxSynchronizer,
    }

    fn fixture(config: BridgeConfig, disabled: &[u32]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(Catalog::from_dbc_str(DBC).unwrap());
        let naming = FileNaming::new(&catalog, None).unwrap();
        let fingerprints = Arc::new(FingerprintTable::new(Duration::from_secs(60)));
        let disabled: HashSet<u32> = disabled.iter().copied().collect();
        let sync = RxSynchronizer::new(
            catalog,
            &naming,
            Arc::clone(&fingerprints),
            dir.path(),
            &config,
            &disabled,
        )
        .unwrap();
        Fixture {
            dir,
            fingerprints,
            sync,
        }
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    fn frame(id: u32, data: &[u8], ts: f64) -> BusFrame {
        BusFrame::with_timestamp(id, data, ts).unwrap()
    }

    #[test]
    fn test_known_frame_is_written_and_fingerprinted() {
        let mut fx = fixture(BridgeConfig::new(), &[]);
        let outcome = fx.sync.handle_frame(&frame(0x321, &[0x01], 1.0));
        let path = fx.dir.path().join("Bootloader_Identification.json");
        assert_eq!(outcome, RxOutcome::Written(path.clone()));
        assert_eq!(read_json(&path), json!({"Status": "Active"}));

        let content = std::fs::read(&path).unwrap();
        assert_eq!(fx.sync.record(0x321).unwrap().last_fingerprint(), Some(&signature(&content)));
        assert!(fx.fingerprints.consume_echo(&path, &signature(&content)));
    }

    #[test]
    fn test_latest_frame_wins() {
        let mut fx = fixture(BridgeConfig::new(), &[]);
        for (i, speed) in [5u8, 80, 42].iter().enumerate() {
            fx.sync.handle_frame(&frame(0x200, &[*speed, 0x03], i as f64));
        }
        let doc = read_json(&fx.dir.path().join("VehicleState.json"));
        assert_eq!(doc, json!({"Speed": 42, "Gear": 3}));
        assert_eq!(fx.sync.stats().written, 3);
        assert_eq!(
            fx.sync.record(0x200).unwrap().current().unwrap()["Speed"],
            SignalValue::Integer(42)
        );
    }

    #[test]
    fn test_unknown_and_filtered_frames_touch_nothing() {
        let config = BridgeConfig::new().with_rx_filter("*21".parse().unwrap());
        let mut fx = fixture(config, &[]);

        assert_eq!(fx.sync.handle_frame(&frame(0x200, &[1, 1], 0.0)), RxOutcome::Filtered);
        assert_eq!(fx.sync.handle_frame(&frame(0x121, &[1], 0.0)), RxOutcome::Unknown);
        assert_eq!(fx.sync.handle_frame(&frame(0x121, &[1], 0.0)), RxOutcome::Unknown);
        assert_eq!(std::fs::read_dir(fx.dir.path()).unwrap().count(), 0);

        let stats = fx.sync.stats();
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.unknown, 2);
        assert_eq!(fx.fingerprints.pending(), 0);
    }

    #[test]
    fn test_decode_failure_is_skipped() {
        let mut fx = fixture(BridgeConfig::new(), &[]);
        assert_eq!(fx.sync.handle_frame(&frame(0x200, &[1], 0.0)), RxOutcome::DecodeFailed);
        assert_eq!(fx.sync.stats().decode_errors, 1);

        // Later frames for the same message still go through
        assert!(matches!(
            fx.sync.handle_frame(&frame(0x200, &[1, 1], 0.0)),
            RxOutcome::Written(_)
        ));
    }

    #[test]
    fn test_rx_disabled_message_is_never_written() {
        let mut fx = fixture(BridgeConfig::new(), &[0x200]);
        let path = fx.dir.path().join("VehicleState.json");
        std::fs::write(&path, "{\"Speed\": 7, \"Gear\": 1}\n").unwrap();

        for _ in 0..3 {
            assert_eq!(fx.sync.handle_frame(&frame(0x200, &[9, 9], 0.0)), RxOutcome::RxDisabled);
        }
        assert_eq!(read_json(&path), json!({"Speed": 7, "Gear": 1}));
        assert_eq!(fx.fingerprints.pending(), 0);
    }

    #[test]
    fn test_accumulate_diff_with_relative_timestamps() {
        let config = BridgeConfig::new()
            .with_accumulate(true)
            .with_diff(true)
            .with_timestamps(true);
        let mut fx = fixture(config, &[]);

        fx.sync.handle_frame(&frame(0x200, &[10, 2], 100.0));
        assert_eq!(fx.sync.handle_frame(&frame(0x200, &[10, 2], 100.5)), RxOutcome::Unchanged);
        fx.sync.handle_frame(&frame(0x200, &[20, 2], 101.5));

        let doc = read_json(&fx.dir.path().join("VehicleState.json"));
        assert_eq!(
            doc,
            json!([
                {"Speed": 10, "Gear": 2, "$timestamp": 0.0},
                {"Speed": 20, "$timestamp": 1.5}
            ])
        );
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        let mut fx = fixture(BridgeConfig::new(), &[]);
        // A directory squatting the file name makes the rename fail
        std::fs::create_dir(fx.dir.path().join("VehicleState.json")).unwrap();

        assert_eq!(fx.sync.handle_frame(&frame(0x200, &[1, 1], 0.0)), RxOutcome::WriteFailed);
        assert_eq!(fx.sync.stats().write_errors, 1);
        assert_eq!(fx.fingerprints.pending(), 0);

        // Other messages keep flowing
        assert!(matches!(
            fx.sync.handle_frame(&frame(0x321, &[0], 0.0)),
            RxOutcome::Written(_)
        ));
    }

    #[test]
    fn test_resume_histories() {
        let config = BridgeConfig::new().with_accumulate(true);
        let mut fx = fixture(config, &[]);
        let path = fx.dir.path().join("VehicleState.json");
        std::fs::write(&path, r#"[{"Speed": 1, "Gear": 1}]"#).unwrap();

        fx.sync.resume_histories();
        fx.sync.handle_frame(&frame(0x200, &[2, 2], 0.0));
        assert_eq!(
            read_json(&path),
            json!([{"Speed": 1, "Gear": 1}, {"Speed": 2, "Gear": 2}])
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_rewrite_keeps_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let mut fx = fixture(BridgeConfig::new(), &[]);
        let path = fx.dir.path().join("VehicleState.json");
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        fx.sync.handle_frame(&frame(0x200, &[1, 1], 0.0));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_no_temporary_files_left_behind() {
        let mut fx = fixture(BridgeConfig::new(), &[]);
        for i in 0..10u8 {
            fx.sync.handle_frame(&frame(0x200, &[i, 1], 0.0));
        }
        let names: Vec<_> = std::fs::read_dir(fx.dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["VehicleState.json".to_string()]);
    }
}
