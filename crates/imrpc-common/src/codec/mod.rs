//! Serialization and compression plugins.
//!
//! Each client and server owns a [`CodecRegistry`] populated at construction.
//! A server only accepts frames whose serializer and compressor codes are
//! registered on it; anything else is answered with an
//! "unsupported protocol option" error.

pub mod compress;
pub mod serialize;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use compress::{Compressor, Gzip, Identity};
pub use serialize::{Serialization, Serializer};

/// Re-exported for implementing [`Serializer`] without a direct dependency.
pub use erased_serde;

use crate::protocol::error::{ImrpcError, Result};

/// Per-endpoint table of serializers and compressors, keyed by wire code.
///
/// The default registry holds JSON and the identity compressor. The identity
/// compressor (code 0) is always present. Registering a plugin under a code
/// that is already taken replaces the previous one.
///
/// # Example
///
/// ```
/// use imrpc_common::codec::{CodecRegistry, Gzip, Serialization};
///
/// let codecs = CodecRegistry::new()
///     .with_serializer(Serialization::Postcard)
///     .with_compressor(Gzip::new());
///
/// assert!(codecs.serializer(2).is_ok());
/// assert!(codecs.compressor(1).is_ok());
/// assert!(codecs.compressor(7).is_err());
/// ```
#[derive(Clone)]
pub struct CodecRegistry {
    serializers: HashMap<u8, Arc<dyn Serializer>>,
    compressors: HashMap<u8, Arc<dyn Compressor>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            serializers: HashMap::new(),
            compressors: HashMap::new(),
        };
        registry.register_serializer(Serialization::Json);
        registry.register_compressor(Identity);
        registry
    }

    /// A registry holding every built-in plugin.
    pub fn with_builtins() -> Self {
        Self::new()
            .with_serializer(Serialization::Postcard)
            .with_compressor(Gzip::new())
    }

    pub fn with_serializer(mut self, serializer: impl Serializer) -> Self {
        self.register_serializer(serializer);
        self
    }

    pub fn with_compressor(mut self, compressor: impl Compressor) -> Self {
        self.register_compressor(compressor);
        self
    }

    pub fn register_serializer(&mut self, serializer: impl Serializer) {
        self.serializers.insert(serializer.code(), Arc::new(serializer));
    }

    pub fn register_shared_serializer(&mut self, serializer: Arc<dyn Serializer>) {
        self.serializers.insert(serializer.code(), serializer);
    }

    /// Registers a compressor, replacing any previous one with the same code.
    pub fn register_compressor(&mut self, compressor: impl Compressor) {
        self.compressors.insert(compressor.code(), Arc::new(compressor));
    }

    /// Like [`register_compressor`](Self::register_compressor) for an
    /// already shared plugin.
    pub fn register_shared_compressor(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressors.insert(compressor.code(), compressor);
    }

    pub fn serializer(&self, code: u8) -> Result<Arc<dyn Serializer>> {
        self.serializers.get(&code).cloned().ok_or_else(|| {
            ImrpcError::UnsupportedOption(format!("serializer code {}", code))
        })
    }

    pub fn compressor(&self, code: u8) -> Result<Arc<dyn Compressor>> {
        self.compressors.get(&code).cloned().ok_or_else(|| {
            ImrpcError::UnsupportedOption(format!("compressor code {}", code))
        })
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut serializers: Vec<_> = self.serializers.values().map(|s| s.name()).collect();
        let mut compressors: Vec<_> = self.compressors.values().map(|c| c.name()).collect();
        serializers.sort_unstable();
        compressors.sort_unstable();
        f.debug_struct("CodecRegistry")
            .field("serializers", &serializers)
            .field("compressors", &compressors)
            .finish()
    }
}

/// Parses a compressor name as accepted on the command line.
pub fn compressor_by_name(name: &str) -> Result<Arc<dyn Compressor>> {
    match name.to_ascii_lowercase().as_str() {
        "none" | "identity" => Ok(Arc::new(Identity)),
        "gzip" => Ok(Arc::new(Gzip::new())),
        other => Err(ImrpcError::UnsupportedOption(format!(
            "unknown compressor '{}'",
            other
        ))),
    }
}
