//! Key and value serialization
//!
//! The engine never looks inside keys or values; it hands them to a
//! `Serializer` when writing checkpoint files and when reading them back.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Converts a key or value to and from bytes.
pub trait Serializer<T>: Send + Sync {
    /// Append the encoded form of `value` to `out`
    fn write(&self, value: &T, out: &mut Vec<u8>) -> Result<()>;

    /// Decode a value previously produced by `write`
    fn read(&self, bytes: &[u8]) -> Result<T>;
}

/// Serializer for any serde type using bincode
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodeSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BincodeSerializer")
    }
}

impl<T> Serializer<T> for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn write(&self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(out, value)?;
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Serializer that stores `Vec<u8>` values verbatim
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBytesSerializer;

impl Serializer<Vec<u8>> for RawBytesSerializer {
    fn write(&self, value: &Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(value);
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Encode into a fresh buffer
pub(crate) fn to_bytes<T>(serializer: &dyn Serializer<T>, value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    serializer.write(value, &mut out)?;
    Ok(out)
}
