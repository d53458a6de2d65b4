use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::value::Value;

/// Direct codec that passes bytes through without serialization
///
/// Only works with `Value::Bytes` and `Value::Str`; received bodies are
/// handed back as `Value::Bytes`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectCodec;

impl DirectCodec {
    pub const SERITYPE: &'static str = "direct";
}

impl Codec for DirectCodec {
    fn seritype(&self) -> &'static str {
        Self::SERITYPE
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Str(s) => Ok(s.as_bytes().to_vec()),
            Value::Null => Ok(Vec::new()),
            other => Err(Error::Serialization(format!(
                "direct codec cannot encode a {} value",
                other.kind()
            ))),
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        Ok(Value::Bytes(bytes.to_vec()))
    }

    fn boxed_clone(&self) -> Box<dyn Codec> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_become_bytes() {
        let bytes = DirectCodec.serialize(&Value::Str("abc".into())).unwrap();
        assert_eq!(DirectCodec.deserialize(&bytes).unwrap(), Value::Bytes(b"abc".to_vec()));
    }

    #[test]
    fn rejects_structured_values() {
        assert!(DirectCodec.serialize(&Value::List(vec![])).is_err());
    }
}
