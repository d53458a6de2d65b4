use std::fmt;

use crate::error::{Error, Result};
use crate::value::Value;
use crate::wire::{keys, Header};

pub mod direct;
pub mod json;
pub mod object;
pub mod table;

pub use self::direct::DirectCodec;
pub use self::json::JsonCodec;
pub use self::object::ObjectCodec;
pub use self::table::TableCodec;

/// Codec trait for serializing and deserializing message bodies
///
/// A codec describes itself through [`Codec::type_descriptor`]; the first
/// message a communicator sends carries that descriptor so a blank peer can
/// rebuild a matching codec with [`from_descriptor`].
pub trait Codec: Send + Sync + fmt::Debug {
    /// Type tag selecting this codec in the registry
    fn seritype(&self) -> &'static str;

    /// Encode a value into bytes
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes into a value
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;

    /// Header entries describing this codec's parameters
    fn type_descriptor(&self) -> Header {
        Header::new().with(keys::SERITYPE, self.seritype())
    }

    /// Adopt parameters announced by a peer
    fn update_from_descriptor(&mut self, _descriptor: &Header) -> Result<()> {
        Ok(())
    }

    /// False while parameters still have to be learned
    fn is_initialized(&self) -> bool {
        true
    }

    /// Derive parameters from the first value sent
    fn infer_from(&mut self, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn Codec>;
}

impl Clone for Box<dyn Codec> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Seritype used when neither side configured a codec
pub const DEFAULT_SERITYPE: &str = ObjectCodec::SERITYPE;

/// Create an uninitialised codec for a type tag
pub fn from_seritype(seritype: &str) -> Result<Box<dyn Codec>> {
    match seritype {
        DirectCodec::SERITYPE => Ok(Box::new(DirectCodec)),
        JsonCodec::SERITYPE => Ok(Box::new(JsonCodec)),
        ObjectCodec::SERITYPE => Ok(Box::new(ObjectCodec)),
        TableCodec::SERITYPE => Ok(Box::new(TableCodec::default())),
        other => Err(Error::configuration(format!("unknown seritype '{other}'"))),
    }
}

/// Build a codec from a descriptor received in a header
pub fn from_descriptor(descriptor: &Header) -> Result<Box<dyn Codec>> {
    let seritype = descriptor
        .get(keys::SERITYPE)
        .ok_or_else(|| Error::serialization("descriptor has no seritype"))?;
    let mut codec = from_seritype(seritype)?;
    codec.update_from_descriptor(descriptor)?;
    Ok(codec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_every_codec() {
        for tag in ["direct", "json", "object", "table"] {
            assert_eq!(from_seritype(tag).unwrap().seritype(), tag);
        }
        assert!(matches!(
            from_seritype("pickle"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn descriptor_rebuilds_table_codec() {
        let sender = TableCodec::new("%d\t%s\n", &["n", "name"]).unwrap();
        let receiver = from_descriptor(&sender.type_descriptor()).unwrap();
        assert!(receiver.is_initialized());

        let row = Value::List(vec![Value::Int(3), Value::Str("three".into())]);
        let bytes = sender.serialize(&row).unwrap();
        assert_eq!(receiver.deserialize(&bytes).unwrap(), row);
    }

    #[test]
    fn descriptor_without_seritype_fails() {
        assert!(from_descriptor(&Header::new()).is_err());
    }
}
