use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::value::Value;

/// JSON codec built on `serde_json`
///
/// Bytes travel as arrays of numbers and come back as lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const SERITYPE: &'static str = "json";
}

impl Codec for JsonCodec {
    fn seritype(&self) -> &'static str {
        Self::SERITYPE
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        let json: serde_json::Value = value.into();
        serde_json::to_vec(&json).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        let json: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(json.into())
    }

    fn boxed_clone(&self) -> Box<dyn Codec> {
        Box::new(*self)
    }
}
