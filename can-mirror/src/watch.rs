//! Transmit path: file edits to bus frames
//!
//! The filesystem backend pushes notifications into a bounded queue; the
//! dispatcher drains it on its own thread. Every notification on a mirrored
//! file is either recognised as an echo of a receive-path write (and dropped)
//! or treated as an edit: the file is parsed, encoded and sent.

use crate::catalog::Catalog;
use crate::fingerprint::{signature, FingerprintTable};
use crate::projection;
use crate::substitution::FileNaming;
use crate::throttle::WarnThrottle;
use crate::transport::BusTransport;
use crate::types::{BusFrame, MirrorError, Result};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// What happened to one notification
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Our own write, dropped
    Echo,
    /// An edit that went out on the bus
    Sent(BusFrame),
    /// Not a mirrored file, or the file vanished
    Ignored,
    /// The edit could not be parsed or encoded; nothing was sent
    Rejected,
    /// The transport refused the frame
    SendFailed,
}

/// Transmit path counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub events: u64,
    pub echoes: u64,
    pub sent: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub send_errors: u64,
    pub watch_errors: u64,
}

/// Turns edits of mirrored files into frames
pub struct WatchDispatcher {
    catalog: Arc<Catalog>,
    naming: Arc<FileNaming>,
    fingerprints: Arc<FingerprintTable>,
    transport: Arc<dyn BusTransport>,
    workdir: PathBuf,
    force_extended_id: Option<bool>,
    send_warnings: WarnThrottle,
    stats: WatchStats,
}

impl WatchDispatcher {
    pub fn new(
        catalog: Arc<Catalog>,
        naming: Arc<FileNaming>,
        fingerprints: Arc<FingerprintTable>,
        transport: Arc<dyn BusTransport>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            naming,
            fingerprints,
            transport,
            workdir: workdir.into(),
            force_extended_id: None,
            send_warnings: WarnThrottle::new(Duration::from_secs(5)),
            stats: WatchStats::default(),
        }
    }

    /// Builder method: override the catalog's identifier format
    pub fn with_force_extended_id(mut self, force: Option<bool>) -> Self {
        self.force_extended_id = force;
        self
    }

    /// Builder method: set the minimum delay between send failure warnings
    pub fn with_warning_interval(mut self, interval: Duration) -> Self {
        self.send_warnings = WarnThrottle::new(interval);
        self
    }

    pub fn stats(&self) -> &WatchStats {
        &self.stats
    }

    /// Process one notification about `path`
    pub fn handle_path(&mut self, path: &Path) -> DispatchOutcome {
        self.stats.events += 1;
        let outcome = self.dispatch(path);
        match &outcome {
            DispatchOutcome::Echo => self.stats.echoes += 1,
            DispatchOutcome::Sent(_) => self.stats.sent += 1,
            DispatchOutcome::Ignored => self.stats.ignored += 1,
            DispatchOutcome::Rejected => self.stats.rejected += 1,
            DispatchOutcome::SendFailed => self.stats.send_errors += 1,
        }
        outcome
    }

    fn dispatch(&mut self, path: &Path) -> DispatchOutcome {
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            return DispatchOutcome::Ignored;
        };
        let Some(id) = self.naming.id_for_file_name(file_name) else {
            log::trace!("Ignoring event on {:?}", path);
            return DispatchOutcome::Ignored;
        };

        // Same key the receive path registers under, whatever form the
        // backend reports paths in
        let key = self.workdir.join(file_name);
        let content = match std::fs::read(&key) {
            Ok(content) => content,
            Err(e) => {
                log::debug!("Cannot read {:?}: {}", key, e);
                return DispatchOutcome::Ignored;
            }
        };

        if self.fingerprints.consume_echo(&key, &signature(&content)) {
            log::trace!("Echo on {:?} dropped", key);
            return DispatchOutcome::Echo;
        }

        let frame = match self.build_frame(id, &content) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Encode error for {}: {}", file_name, e);
                return DispatchOutcome::Rejected;
            }
        };

        match self.transport.send(&frame) {
            Ok(()) => {
                log::debug!("Sent 0x{:X} {:02X?} from {}", frame.id, frame.data, file_name);
                DispatchOutcome::Sent(frame)
            }
            Err(e) => {
                if let Some(suppressed) = self.send_warnings.admit() {
                    log::warn!(
                        "Failed to send 0x{:X}: {} ({} similar warnings suppressed)",
                        frame.id,
                        e,
                        suppressed
                    );
                }
                DispatchOutcome::SendFailed
            }
        }
    }

    fn build_frame(&self, id: u32, content: &[u8]) -> Result<BusFrame> {
        let document: serde_json::Value = serde_json::from_slice(content)?;
        let values = projection::extract_signals(&document)?;
        let data = self.catalog.encode(id, &values)?;
        let message = self
            .catalog
            .get_message(id)
            .ok_or(MirrorError::MessageNotFound(id))?;
        let extended = self.force_extended_id.unwrap_or(message.is_extended);
        Ok(BusFrame::new(id, data)?.extended(extended))
    }

    /// Dispatch notifications until `stop` is raised or the backend goes away
    ///
    /// Events are processed one at a time in the order they were queued.
    pub fn run(
        mut self,
        events: Receiver<notify::Result<Event>>,
        stop: Arc<AtomicBool>,
        poll: Duration,
    ) -> WatchStats {
        log::info!("Watching {:?}", self.workdir);
        while !stop.load(Ordering::SeqCst) {
            match events.recv_timeout(poll) {
                Ok(Ok(event)) => {
                    if !is_edit_event(&event.kind) {
                        continue;
                    }
                    for path in &event.paths {
                        self.handle_path(path);
                    }
                }
                Ok(Err(e)) => {
                    self.stats.watch_errors += 1;
                    log::warn!("Filesystem watch error: {}", e);
                }
                Err(RecvTimeoutError::Timeout) => self.fingerprints.purge_expired(),
                Err(RecvTimeoutError::Disconnected) => {
                    log::warn!("Filesystem watcher went away");
                    break;
                }
            }
        }
        log::info!("Watch loop stopped: {:?}", self.stats);
        self.stats
    }
}

/// Whether a notification means a file reached new, complete content
///
/// Linux reports a finished in-place write as close-after-write; the
/// receive path's renames and editors' save-by-rename arrive as a rename
/// onto the final name. Other platforms only report modifications.
pub fn is_edit_event(kind: &EventKind) -> bool {
    match kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => true,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            !cfg!(target_os = "linux")
        }
        _ => false,
    }
}

/// Start watching `dir` and return the backend with its event queue
///
/// The queue holds at most `capacity` notifications; the backend waits when
/// the dispatcher falls behind. The watch stops when the watcher is dropped.
pub fn watch_directory(
    dir: &Path,
    capacity: usize,
) -> Result<(RecommendedWatcher, Receiver<notify::Result<Event>>)> {
    let (tx, rx) = mpsc::sync_channel(capacity);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            // The dispatcher is gone once shutdown has started
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}
