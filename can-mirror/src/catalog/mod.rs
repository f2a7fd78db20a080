//! Message catalog
//!
//! Combines message definitions from one or more DBC files into a single
//! ordered catalog, and exposes the decode/encode operations used by both
//! halves of the bridge.

pub mod codec;
pub mod dbc;
pub mod definitions;

pub use codec::SignalCodec;
pub use definitions::{ByteOrder, MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType};

use crate::types::{MirrorError, Result, SignalMap};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Known messages, in load order
#[derive(Debug, Default)]
pub struct Catalog {
    messages: Vec<MessageDefinition>,
    by_id: HashMap<u32, usize>,
    by_name: HashMap<String, usize>,
}

impl Catalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog from a DBC file or a directory of DBC files
    pub fn load(path: &Path) -> Result<Self> {
        let mut catalog = Self::new();
        for dbc_path in collect_databases(path)? {
            catalog.add_dbc(&dbc_path)?;
        }
        Ok(catalog)
    }

    /// Load a catalog from several database paths
    pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut catalog = Self::new();
        for path in paths {
            for dbc_path in collect_databases(path.as_ref())? {
                catalog.add_dbc(&dbc_path)?;
            }
        }
        Ok(catalog)
    }

    /// Build a catalog from DBC content held in memory
    pub fn from_dbc_str(content: &str) -> Result<Self> {
        let mut catalog = Self::new();
        for message in dbc::parse_dbc_str(content, "inline.dbc")? {
            catalog.add_message(message);
        }
        Ok(catalog)
    }

    /// Load a DBC file and add its definitions
    pub fn add_dbc(&mut self, path: &Path) -> Result<()> {
        log::info!("Loading DBC file: {:?}", path);
        for message in dbc::parse_dbc_file(path)? {
            self.add_message(message);
        }
        Ok(())
    }

    /// Add a message definition
    ///
    /// The first definition of an identifier or name wins; later duplicates
    /// are logged and dropped.
    pub fn add_message(&mut self, message: MessageDefinition) {
        if let Some(&existing) = self.by_id.get(&message.id) {
            log::warn!(
                "Ignoring {} (0x{:X}) from {}: already defined as {} in {}",
                message.name,
                message.id,
                message.source,
                self.messages[existing].name,
                self.messages[existing].source
            );
            return;
        }
        if let Some(&existing) = self.by_name.get(&message.name) {
            log::warn!(
                "Ignoring {} (0x{:X}) from {}: name already used by 0x{:X}",
                message.name,
                message.id,
                message.source,
                self.messages[existing].id
            );
            return;
        }

        let index = self.messages.len();
        self.by_id.insert(message.id, index);
        self.by_name.insert(message.name.clone(), index);
        self.messages.push(message);
    }

    /// All messages, in load order
    pub fn messages(&self) -> &[MessageDefinition] {
        &self.messages
    }

    /// Identifiers of all messages, in load order
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.messages.iter().map(|m| m.id)
    }

    /// Get a message definition by CAN ID
    pub fn get_message(&self, id: u32) -> Option<&MessageDefinition> {
        self.by_id.get(&id).map(|&index| &self.messages[index])
    }

    /// Get a message definition by name
    pub fn get_message_by_name(&self, name: &str) -> Option<&MessageDefinition> {
        self.by_name.get(name).map(|&index| &self.messages[index])
    }

    /// Decode a payload received for `id`
    pub fn decode(&self, id: u32, data: &[u8]) -> Result<SignalMap> {
        let message = self.get_message(id).ok_or(MirrorError::MessageNotFound(id))?;
        SignalCodec::decode(message, data)
    }

    /// Encode signal values for `id` into a payload
    pub fn encode(&self, id: u32, values: &SignalMap) -> Result<Vec<u8>> {
        let message = self.get_message(id).ok_or(MirrorError::MessageNotFound(id))?;
        SignalCodec::encode(message, values)
    }

    /// Default signal values used before any frame has been received
    pub fn default_values(&self, id: u32) -> Option<SignalMap> {
        self.get_message(id).map(|message| {
            message
                .signals
                .iter()
                .map(|signal| (signal.name.clone(), signal.default_value()))
                .collect()
        })
    }

    /// Get catalog statistics
    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.iter().map(|m| m.signals.len()).sum(),
        }
    }

    /// True if no message is known
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Catalog statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}

/// Expand a database path into the DBC files it designates
///
/// A directory yields every `.dbc` file inside it, sorted by name.
pub fn collect_databases(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let candidate = entry?.path();
        let is_dbc = candidate
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| ext.eq_ignore_ascii_case("dbc"));
        if is_dbc && candidate.is_file() {
            found.push(candidate);
        }
    }
    found.sort();

    if found.is_empty() {
        return Err(MirrorError::DbcParseError(format!(
            "No DBC file found in {:?}",
            path
        )));
    }
    Ok(found)
}
