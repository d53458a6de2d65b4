use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::value::Value;

/// Bincode codec for arbitrary value trees
///
/// Lossless for every [`Value`]; used when neither side configured a codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectCodec;

impl ObjectCodec {
    pub const SERITYPE: &'static str = "object";
}

impl Codec for ObjectCodec {
    fn seritype(&self) -> &'static str {
        Self::SERITYPE
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn boxed_clone(&self) -> Box<dyn Codec> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_values_survive() {
        let value = Value::Map(vec![
            ("bytes".into(), Value::Bytes(vec![0, 255, 7])),
            ("list".into(), Value::List(vec![Value::Float(1.5), Value::Bool(true)])),
        ]);
        let bytes = ObjectCodec.serialize(&value).unwrap();
        assert_eq!(ObjectCodec.deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn truncated_input_fails() {
        let bytes = ObjectCodec.serialize(&Value::Str("hello".into())).unwrap();
        assert!(ObjectCodec.deserialize(&bytes[..bytes.len() - 2]).is_err());
    }
}
