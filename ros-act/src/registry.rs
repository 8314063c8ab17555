//! Explicitly constructed wire-type registry.
//!
//! There is no global default registry: one is created at process start,
//! populated with explicit [`TypeRegistry::register`] calls, and injected
//! into every client and server builder. Endpoint construction fails with
//! [`Error::UnknownType`] for types that were never registered.

use std::collections::HashMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::msg::{CdrCodec, WireMessage};
use crate::{Error, Result};

/// Stable identity of a wire type: its name plus a SHA-256 of that name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub name: String,
    pub hash: [u8; 32],
}

impl TypeInfo {
    fn new(name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        Self {
            name: name.to_string(),
            hash: hasher.finalize().into(),
        }
    }
}

impl std::fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { name, hash } = self;
        write!(f, "{name}/")?;
        for byte in &hash[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Factory that checks whether a payload decodes as the registered type.
type DecodeProbe = fn(&[u8]) -> Result<()>;

struct TypeEntry {
    info: TypeInfo,
    probe: DecodeProbe,
}

/// Mapping from wire-type name to type identity and decode probe.
pub struct TypeRegistry {
    entries: Mutex<HashMap<String, TypeEntry>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `M` under its wire-type name. Idempotent.
    pub fn register<M: WireMessage>(&self) {
        let name = M::type_name();
        let mut entries = self.entries.lock();
        entries.entry(name.clone()).or_insert_with(|| TypeEntry {
            info: TypeInfo::new(&name),
            probe: |bytes| CdrCodec::<M>::decode(bytes).map(|_| ()),
        });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Looks up the identity registered for `M`.
    pub fn type_info<M: WireMessage>(&self) -> Result<TypeInfo> {
        self.lookup(&M::type_name())
    }

    pub fn lookup(&self, name: &str) -> Result<TypeInfo> {
        self.entries
            .lock()
            .get(name)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| Error::UnknownType(name.to_string()))
    }

    /// Runs the decode probe registered for `name` against `payload`.
    pub fn probe(&self, name: &str, payload: &[u8]) -> Result<()> {
        let probe = self
            .entries
            .lock()
            .get(name)
            .map(|entry| entry.probe)
            .ok_or_else(|| Error::UnknownType(name.to_string()))?;
        probe(payload)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
