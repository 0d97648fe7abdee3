use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::error::{ImrpcError, Result};

/// A serialization plugin.
///
/// Plugins work on type-erased values so they can be stored as trait objects
/// in a [`CodecRegistry`](super::CodecRegistry). Typed callers go through
/// [`encode`](#method.encode) and [`decode`](#method.decode) on
/// `dyn Serializer`.
///
/// # Example
///
/// ```
/// use imrpc_common::codec::{Serialization, Serializer};
/// use imrpc_common::Result;
///
/// /// JSON with indentation, under its own wire code.
/// struct PrettyJson;
///
/// impl Serializer for PrettyJson {
///     fn code(&self) -> u8 {
///         9
///     }
///
///     fn name(&self) -> &'static str {
///         "json-pretty"
///     }
///
///     fn encode_erased(&self, value: &dyn erased_serde::Serialize) -> Result<Vec<u8>> {
///         Ok(serde_json::to_vec_pretty(value)?)
///     }
///
///     fn decode_erased<'de>(
///         &self,
///         data: &'de [u8],
///         visit: &mut dyn FnMut(&mut dyn erased_serde::Deserializer<'de>) -> Result<()>,
///     ) -> Result<()> {
///         Serialization::Json.decode_erased(data, visit)
///     }
/// }
///
/// let plugin: &dyn Serializer = &PrettyJson;
/// let bytes = plugin.encode(&vec![1, 2]).unwrap();
/// assert!(bytes.contains(&b'\n'));
/// let back: Vec<i32> = plugin.decode(&bytes).unwrap();
/// assert_eq!(back, vec![1, 2]);
/// ```
pub trait Serializer: Send + Sync + 'static {
    /// Code carried in the frame preamble. Must be unique per registry.
    fn code(&self) -> u8;

    fn name(&self) -> &'static str;

    fn encode_erased(&self, value: &dyn erased_serde::Serialize) -> Result<Vec<u8>>;

    /// Builds a deserializer over `data` and hands it to `visit` once.
    fn decode_erased<'de>(
        &self,
        data: &'de [u8],
        visit: &mut dyn FnMut(&mut dyn erased_serde::Deserializer<'de>) -> Result<()>,
    ) -> Result<()>;
}

impl dyn Serializer {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        self.encode_erased(&value)
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let mut decoded = None;
        self.decode_erased(data, &mut |de| {
            decoded = Some(erased_serde::deserialize::<T>(de)?);
            Ok(())
        })?;
        decoded.ok_or_else(|| {
            ImrpcError::Serialization(format!("{} serializer produced no value", self.name()))
        })
    }
}

/// The built-in serialization formats.
///
/// The discriminant is the code carried in the frame preamble. Each variant
/// is also a [`Serializer`] plugin.
///
/// # Example
///
/// ```
/// use imrpc_common::codec::Serialization;
///
/// let bytes = Serialization::Json.encode(&vec![1, 2, 3]).unwrap();
/// let back: Vec<i32> = Serialization::Json.decode(&bytes).unwrap();
/// assert_eq!(back, vec![1, 2, 3]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Serialization {
    /// JSON via `serde_json` (self-describing, human-readable)
    #[default]
    Json,
    /// postcard (compact binary, not self-describing)
    Postcard,
}

impl Serialization {
    pub const fn code(self) -> u8 {
        match self {
            Serialization::Json => 1,
            Serialization::Postcard => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Serialization::Json),
            2 => Some(Serialization::Postcard),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Serialization::Json => "json",
            Serialization::Postcard => "postcard",
        }
    }

    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serialization::Json => Ok(serde_json::to_vec(value)?),
            Serialization::Postcard => Ok(postcard::to_stdvec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            Serialization::Json => Ok(serde_json::from_slice(data)?),
            Serialization::Postcard => Ok(postcard::from_bytes(data)?),
        }
    }
}

impl Serializer for Serialization {
    fn code(&self) -> u8 {
        Serialization::code(*self)
    }

    fn name(&self) -> &'static str {
        Serialization::name(*self)
    }

    fn encode_erased(&self, value: &dyn erased_serde::Serialize) -> Result<Vec<u8>> {
        Serialization::encode(*self, value)
    }

    fn decode_erased<'de>(
        &self,
        data: &'de [u8],
        visit: &mut dyn FnMut(&mut dyn erased_serde::Deserializer<'de>) -> Result<()>,
    ) -> Result<()> {
        match self {
            Serialization::Json => {
                let mut de = serde_json::Deserializer::from_slice(data);
                visit(&mut <dyn erased_serde::Deserializer>::erase(&mut de))?;
                Ok(de.end()?)
            }
            Serialization::Postcard => {
                let mut de = postcard::Deserializer::from_bytes(data);
                visit(&mut <dyn erased_serde::Deserializer>::erase(&mut de))
            }
        }
    }
}

impl fmt::Display for Serialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Serialization {
    type Err = ImrpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Serialization::Json),
            "postcard" => Ok(Serialization::Postcard),
            other => Err(ImrpcError::UnsupportedOption(format!(
                "unknown serializer '{}'",
                other
            ))),
        }
    }
}
