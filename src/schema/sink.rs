use std::collections::BTreeMap;

use serde::Serialize;
use serde::ser::{
    SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant, SerializeTuple,
    SerializeTupleStruct, SerializeTupleVariant, Serializer,
};

use crate::error::SchemaError;
use crate::schema::{Kind, MAX_SCHEMA_DEPTH, Schema};

/// Shape recorded for one serialized value.
#[derive(Debug)]
pub(crate) struct Inferred {
    pub(crate) schema: Schema,
    /// The value went through `serialize_none`/`serialize_some`.
    pub(crate) optional: bool,
}

impl Inferred {
    fn required(schema: Schema) -> Self {
        Self {
            schema,
            optional: false,
        }
    }
}

/// Serializer that writes shape instead of bytes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SchemaSink {
    depth: usize,
}

impl SchemaSink {
    pub(crate) fn root() -> Self {
        Self { depth: 0 }
    }

    fn nested(self) -> Result<Self, SchemaError> {
        if self.depth >= MAX_SCHEMA_DEPTH {
            return Err(SchemaError::UnsupportedRecursiveSchema {
                depth: MAX_SCHEMA_DEPTH,
            });
        }
        Ok(Self {
            depth: self.depth + 1,
        })
    }

    fn infer<T: ?Sized + Serialize>(self, value: &T) -> Result<Inferred, SchemaError> {
        value.serialize(self.nested()?)
    }

    fn primitive(kind: Kind) -> Result<Inferred, SchemaError> {
        Ok(Inferred::required(Schema::of(kind)))
    }
}

/// Externally tagged variants serialize as `{"variant": payload}`.
fn tagged(variant: &'static str, payload: Schema) -> Schema {
    let mut schema = Schema::object();
    schema.properties = Some(BTreeMap::from([(variant.to_string(), payload)]));
    schema.required = Some(vec![variant.to_string()]);
    schema
}

impl Serializer for SchemaSink {
    type Ok = Inferred;
    type Error = SchemaError;
    type SerializeSeq = SeqShape;
    type SerializeTuple = SeqShape;
    type SerializeTupleStruct = SeqShape;
    type SerializeTupleVariant = SeqShape;
    type SerializeMap = MapShape;
    type SerializeStruct = ObjectShape;
    type SerializeStructVariant = ObjectShape;

    fn serialize_bool(self, _v: bool) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Boolean)
    }

    fn serialize_i8(self, _v: i8) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Integer)
    }

    fn serialize_i16(self, _v: i16) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Integer)
    }

    fn serialize_i32(self, _v: i32) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Integer)
    }

    fn serialize_i64(self, _v: i64) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Integer)
    }

    fn serialize_i128(self, _v: i128) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Integer)
    }

    fn serialize_u8(self, _v: u8) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Integer)
    }

    fn serialize_u16(self, _v: u16) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Integer)
    }

    fn serialize_u32(self, _v: u32) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Integer)
    }

    fn serialize_u64(self, _v: u64) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Integer)
    }

    fn serialize_u128(self, _v: u128) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Integer)
    }

    fn serialize_f32(self, _v: f32) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Number)
    }

    fn serialize_f64(self, _v: f64) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Number)
    }

    fn serialize_char(self, _v: char) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::String)
    }

    fn serialize_str(self, _v: &str) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::String)
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<Inferred, SchemaError> {
        Ok(Inferred::required(Schema::array(Some(Schema::of(
            Kind::Integer,
        )))))
    }

    fn serialize_none(self) -> Result<Inferred, SchemaError> {
        Ok(Inferred {
            schema: Schema::of(Kind::Null),
            optional: true,
        })
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Inferred, SchemaError> {
        let inner = self.infer(value)?;
        Ok(Inferred {
            schema: inner.schema,
            optional: true,
        })
    }

    fn serialize_unit(self) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<Inferred, SchemaError> {
        Self::primitive(Kind::String)
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Inferred, SchemaError> {
        self.infer(value)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Inferred, SchemaError> {
        let payload = self.infer(value)?;
        Ok(Inferred::required(tagged(variant, payload.schema)))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<SeqShape, SchemaError> {
        Ok(SeqShape::new(self, None))
    }

    fn serialize_tuple(self, _len: usize) -> Result<SeqShape, SchemaError> {
        Ok(SeqShape::new(self, None))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<SeqShape, SchemaError> {
        Ok(SeqShape::new(self, None))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<SeqShape, SchemaError> {
        Ok(SeqShape::new(self, Some(variant)))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapShape, SchemaError> {
        Ok(MapShape {
            sink: self,
            values: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<ObjectShape, SchemaError> {
        Ok(ObjectShape::new(self, None))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<ObjectShape, SchemaError> {
        Ok(ObjectShape::new(self, Some(variant)))
    }
}

/// Array node; `items` is taken from the first element only.
pub(crate) struct SeqShape {
    sink: SchemaSink,
    items: Option<Schema>,
    variant: Option<&'static str>,
}

impl SeqShape {
    fn new(sink: SchemaSink, variant: Option<&'static str>) -> Self {
        Self {
            sink,
            items: None,
            variant,
        }
    }

    fn push<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), SchemaError> {
        if self.items.is_none() {
            self.items = Some(self.sink.infer(value)?.schema);
        }
        Ok(())
    }

    fn finish(self) -> Result<Inferred, SchemaError> {
        let array = Schema::array(self.items);
        let schema = match self.variant {
            Some(variant) => tagged(variant, array),
            None => array,
        };
        Ok(Inferred::required(schema))
    }
}

impl SerializeSeq for SeqShape {
    type Ok = Inferred;
    type Error = SchemaError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), SchemaError> {
        self.push(value)
    }

    fn end(self) -> Result<Inferred, SchemaError> {
        self.finish()
    }
}

impl SerializeTuple for SeqShape {
    type Ok = Inferred;
    type Error = SchemaError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), SchemaError> {
        self.push(value)
    }

    fn end(self) -> Result<Inferred, SchemaError> {
        self.finish()
    }
}

impl SerializeTupleStruct for SeqShape {
    type Ok = Inferred;
    type Error = SchemaError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), SchemaError> {
        self.push(value)
    }

    fn end(self) -> Result<Inferred, SchemaError> {
        self.finish()
    }
}

impl SerializeTupleVariant for SeqShape {
    type Ok = Inferred;
    type Error = SchemaError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), SchemaError> {
        self.push(value)
    }

    fn end(self) -> Result<Inferred, SchemaError> {
        self.finish()
    }
}

/// Open-keyed map; keys are not recorded, values become `additionalProperties`.
pub(crate) struct MapShape {
    sink: SchemaSink,
    values: Option<Schema>,
}

impl SerializeMap for MapShape {
    type Ok = Inferred;
    type Error = SchemaError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, _key: &T) -> Result<(), SchemaError> {
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), SchemaError> {
        if self.values.is_none() {
            self.values = Some(self.sink.infer(value)?.schema);
        }
        Ok(())
    }

    fn end(self) -> Result<Inferred, SchemaError> {
        let mut schema = Schema::object();
        schema.additional_properties = self.values.map(Box::new);
        Ok(Inferred::required(schema))
    }
}

/// Keyed object; every field is required unless it was written as an option.
pub(crate) struct ObjectShape {
    sink: SchemaSink,
    properties: BTreeMap<String, Schema>,
    required: Vec<String>,
    variant: Option<&'static str>,
}

impl ObjectShape {
    fn new(sink: SchemaSink, variant: Option<&'static str>) -> Self {
        Self {
            sink,
            properties: BTreeMap::new(),
            required: Vec::new(),
            variant,
        }
    }

    fn field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), SchemaError> {
        let inferred = self.sink.infer(value)?;
        if !inferred.optional {
            self.required.push(key.to_string());
        }
        self.properties.insert(key.to_string(), inferred.schema);
        Ok(())
    }

    fn finish(self) -> Result<Inferred, SchemaError> {
        let object = Schema {
            properties: Some(self.properties),
            required: Some(self.required),
            ..Schema::of(Kind::Object)
        };
        let schema = match self.variant {
            Some(variant) => tagged(variant, object),
            None => object,
        };
        Ok(Inferred::required(schema))
    }
}

impl SerializeStruct for ObjectShape {
    type Ok = Inferred;
    type Error = SchemaError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), SchemaError> {
        self.field(key, value)
    }

    fn end(self) -> Result<Inferred, SchemaError> {
        self.finish()
    }
}

impl SerializeStructVariant for ObjectShape {
    type Ok = Inferred;
    type Error = SchemaError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), SchemaError> {
        self.field(key, value)
    }

    fn end(self) -> Result<Inferred, SchemaError> {
        self.finish()
    }
}
