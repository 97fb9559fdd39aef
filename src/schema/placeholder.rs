use serde::de::value::BorrowedStrDeserializer;
use serde::de::{
    DeserializeSeed, Deserializer, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor,
};

use crate::error::SchemaError;
use crate::schema::MAX_SCHEMA_DEPTH;

/// Data source that satisfies any `Deserialize` impl with zero-like values.
///
/// Optionals are always present and sequences always hold one element so the
/// sink gets to see the inner shape.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PlaceholderSource {
    depth: usize,
}

impl PlaceholderSource {
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
}

macro_rules! zero_value {
    ($($method:ident => $visit:ident($value:expr)),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, SchemaError> {
                visitor.$visit($value)
            }
        )*
    };
}

impl<'de> Deserializer<'de> for PlaceholderSource {
    type Error = SchemaError;

    zero_value! {
        deserialize_bool => visit_bool(false),
        deserialize_i8 => visit_i8(0),
        deserialize_i16 => visit_i16(0),
        deserialize_i32 => visit_i32(0),
        deserialize_i64 => visit_i64(0),
        deserialize_i128 => visit_i128(0),
        deserialize_u8 => visit_u8(0),
        deserialize_u16 => visit_u16(0),
        deserialize_u32 => visit_u32(0),
        deserialize_u64 => visit_u64(0),
        deserialize_u128 => visit_u128(0),
        deserialize_f32 => visit_f32(0.0),
        deserialize_f64 => visit_f64(0.0),
        deserialize_char => visit_char(' '),
        deserialize_str => visit_borrowed_str(""),
        deserialize_string => visit_borrowed_str(""),
        deserialize_identifier => visit_borrowed_str(""),
        deserialize_bytes => visit_borrowed_bytes(&[]),
        deserialize_byte_buf => visit_borrowed_bytes(&[]),
    }

    // Self-describing requests have no declared shape to answer with.
    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, SchemaError> {
        visitor.visit_unit()
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, SchemaError> {
        visitor.visit_unit()
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, SchemaError> {
        visitor.visit_some(self.nested()?)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, SchemaError> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, SchemaError> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, SchemaError> {
        visitor.visit_newtype_struct(self.nested()?)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, SchemaError> {
        visitor.visit_seq(PlaceholderSeq::new(self.nested()?, 1))
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, SchemaError> {
        visitor.visit_seq(PlaceholderSeq::new(self.nested()?, len))
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, SchemaError> {
        visitor.visit_seq(PlaceholderSeq::new(self.nested()?, len))
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, SchemaError> {
        visitor.visit_map(PlaceholderMap {
            source: self.nested()?,
            remaining: 1,
        })
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, SchemaError> {
        visitor.visit_map(PlaceholderStruct::new(self.nested()?, fields))
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, SchemaError> {
        let variant = variants.first().copied().ok_or_else(|| {
            SchemaError::Inference(format!("enum {name} has no variants to sample"))
        })?;
        visitor.visit_enum(PlaceholderVariant {
            source: self.nested()?,
            variant,
        })
    }
}

struct PlaceholderSeq {
    source: PlaceholderSource,
    remaining: usize,
}

impl PlaceholderSeq {
    fn new(source: PlaceholderSource, len: usize) -> Self {
        Self {
            source,
            remaining: len,
        }
    }
}

impl<'de> SeqAccess<'de> for PlaceholderSeq {
    type Error = SchemaError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, SchemaError>
    where
        T: DeserializeSeed<'de>,
    {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(self.source).map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

struct PlaceholderMap {
    source: PlaceholderSource,
    remaining: usize,
}

impl<'de> MapAccess<'de> for PlaceholderMap {
    type Error = SchemaError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, SchemaError>
    where
        K: DeserializeSeed<'de>,
    {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(self.source).map(Some)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, SchemaError>
    where
        V: DeserializeSeed<'de>,
    {
        seed.deserialize(self.source)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

struct PlaceholderStruct {
    source: PlaceholderSource,
    fields: std::slice::Iter<'static, &'static str>,
}

impl PlaceholderStruct {
    fn new(source: PlaceholderSource, fields: &'static [&'static str]) -> Self {
        Self {
            source,
            fields: fields.iter(),
        }
    }
}

impl<'de> MapAccess<'de> for PlaceholderStruct {
    type Error = SchemaError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, SchemaError>
    where
        K: DeserializeSeed<'de>,
    {
        let Some(field) = self.fields.next() else {
            return Ok(None);
        };
        seed.deserialize(BorrowedStrDeserializer::<SchemaError>::new(*field))
            .map(Some)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, SchemaError>
    where
        V: DeserializeSeed<'de>,
    {
        seed.deserialize(self.source)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.fields.len())
    }
}

struct PlaceholderVariant {
    source: PlaceholderSource,
    variant: &'static str,
}

impl<'de> EnumAccess<'de> for PlaceholderVariant {
    type Error = SchemaError;
    type Variant = PlaceholderSource;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, PlaceholderSource), SchemaError>
    where
        V: DeserializeSeed<'de>,
    {
        let variant =
            seed.deserialize(BorrowedStrDeserializer::<SchemaError>::new(self.variant))?;
        Ok((variant, self.source))
    }
}

impl<'de> VariantAccess<'de> for PlaceholderSource {
    type Error = SchemaError;

    fn unit_variant(self) -> Result<(), SchemaError> {
        Ok(())
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value, SchemaError>
    where
        T: DeserializeSeed<'de>,
    {
        seed.deserialize(self)
    }

    fn tuple_variant<V: Visitor<'de>>(
        self,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, SchemaError> {
        visitor.visit_seq(PlaceholderSeq::new(self.nested()?, len))
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, SchemaError> {
        visitor.visit_map(PlaceholderStruct::new(self.nested()?, fields))
    }
}
