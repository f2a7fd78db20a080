//! CAN Filesystem Mirror Library
//!
//! Mirrors live CAN traffic onto a directory of per-message JSON files and
//! mirrors edits of those files back onto the bus.
//!
//! # Architecture
//!
//! - The [`Catalog`] holds message definitions loaded from DBC files and
//!   decodes/encodes payloads.
//! - A [`BusTransport`] receives and sends frames (SocketCAN or an in-process
//!   virtual bus).
//! - The [`RxSynchronizer`] writes every received message to its file.
//! - The [`WatchDispatcher`] sends every edited file as a frame.
//! - A shared [`FingerprintTable`] lets the dispatcher recognise the
//!   synchronizer's own writes, so received frames are never sent back.
//! - The [`Bridge`] owns the working directory and both loops.
//!
//! Argument parsing, logging setup and signal handling live in the
//! application layer (can-mirror-cli).
//!
//! # Example Usage
//!
//! ```no_run
//! use can_mirror::{transport, Bridge, BridgeConfig, Catalog};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let catalog = Arc::new(Catalog::load(Path::new("powertrain.dbc")).unwrap());
//! let bus = transport::open("can0", "socketcan").unwrap();
//!
//! let config = BridgeConfig::new()
//!     .with_accumulate(true)
//!     .with_diff(true)
//!     .with_timestamps(true);
//!
//! let running = Bridge::new(config, catalog, bus).unwrap().start().unwrap();
//! println!("Mirroring into {:?}", running.workdir());
//! // ... until interrupted
//! let report = running.shutdown();
//! println!("{} frames received", report.rx.frames);
//! ```

// Public modules
pub mod catalog;
pub mod config;
pub mod filter;
pub mod fingerprint;
pub mod lifecycle;
pub mod projection;
pub mod rx;
pub mod substitution;
pub mod transport;
pub mod types;
pub mod watch;

// Re-export main types for convenience
pub use catalog::{Catalog, CatalogStats, MessageDefinition, SignalDefinition};
pub use config::{BridgeConfig, TimestampMode, UnknownIdPolicy};
pub use filter::CanIdPattern;
pub use fingerprint::FingerprintTable;
pub use lifecycle::{Bridge, BridgeReport, RunningBridge, WorkingDir};
pub use rx::{RxOutcome, RxStats, RxSynchronizer};
pub use substitution::{FileNaming, SubstitutionRule};
pub use transport::BusTransport;
pub use types::{BusFrame, MirrorError, Result, SignalMap, SignalValue};
pub use watch::{DispatchOutcome, WatchDispatcher, WatchStats};

// Internal modules
mod throttle;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
