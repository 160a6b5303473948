//! Detection of step values that JSON cannot represent faithfully.
//!
//! `serde_json` silently writes non-finite floats as `null` and rejects map
//! keys that are not strings or integers. [`scan`] walks a value through a
//! non-allocating serializer and reports each such spot with its path, so the
//! executor can record a snapshot warning (or fail in strict mode) instead of
//! persisting a value that will not restore.

use std::fmt;

use serde::Serialize;
use serde::ser::{self, Impossible};

/// One spot inside a value that will not survive a JSON round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossyFinding {
    /// Pointer-style path (`/items/0/price`); empty for the root.
    pub path: String,
    pub reason: String,
}

/// Report every lossy spot in `value`. Empty means the value round-trips.
pub fn scan<T: Serialize + ?Sized>(value: &T) -> Vec<LossyFinding> {
    let mut scanner = Scanner::default();
    if let Err(e) = value.serialize(&mut scanner) {
        let path = scanner.pointer();
        scanner.findings.push(LossyFinding {
            path,
            reason: format!("value could not be serialized: {}", e.0),
        });
    }
    scanner.findings
}

#[derive(Debug)]
struct ScanError(String);

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ScanError {}

impl ser::Error for ScanError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        ScanError(msg.to_string())
    }
}

#[derive(Default)]
struct Scanner {
    path: Vec<String>,
    findings: Vec<LossyFinding>,
}

impl Scanner {
    fn pointer(&self) -> String {
        self.path.iter().map(|p| format!("/{p}")).collect()
    }

    fn flag(&mut self, reason: impl Into<String>) {
        let path = self.pointer();
        self.findings.push(LossyFinding {
            path,
            reason: reason.into(),
        });
    }

    fn check_float(&mut self, v: f64) {
        if !v.is_finite() {
            self.flag(format!("non-finite number {v} is written as null"));
        }
    }

    fn nested<T: Serialize + ?Sized>(
        &mut self,
        segment: String,
        value: &T,
    ) -> Result<(), ScanError> {
        self.path.push(segment);
        value.serialize(&mut *self)?;
        self.path.pop();
        Ok(())
    }
}

impl<'a> ser::Serializer for &'a mut Scanner {
    type Ok = ();
    type Error = ScanError;
    type SerializeSeq = Compound<'a>;
    type SerializeTuple = Compound<'a>;
    type SerializeTupleStruct = Compound<'a>;
    type SerializeTupleVariant = Compound<'a>;
    type SerializeMap = Compound<'a>;
    type SerializeStruct = Compound<'a>;
    type SerializeStructVariant = Compound<'a>;

    fn serialize_bool(self, _: bool) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_i128(self, v: i128) -> Result<(), ScanError> {
        if i64::try_from(v).is_err() && u64::try_from(v).is_err() {
            self.flag(format!("integer {v} does not fit in 64 bits"));
        }
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_u128(self, v: u128) -> Result<(), ScanError> {
        if u64::try_from(v).is_err() {
            self.flag(format!("integer {v} does not fit in 64 bits"));
        }
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Result<(), ScanError> {
        self.check_float(f64::from(v));
        Ok(())
    }
    fn serialize_f64(self, v: f64) -> Result<(), ScanError> {
        self.check_float(v);
        Ok(())
    }
    fn serialize_char(self, _: char) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_none(self) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), ScanError> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<(), ScanError> {
        Ok(())
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), ScanError> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<(), ScanError> {
        self.nested(variant.to_string(), value)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Compound<'a>, ScanError> {
        Ok(Compound::new(self, false))
    }
    fn serialize_tuple(self, _: usize) -> Result<Compound<'a>, ScanError> {
        Ok(Compound::new(self, false))
    }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Compound<'a>, ScanError> {
        Ok(Compound::new(self, false))
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Compound<'a>, ScanError> {
        self.path.push(variant.to_string());
        Ok(Compound::new(self, true))
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Compound<'a>, ScanError> {
        Ok(Compound::new(self, false))
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Compound<'a>, ScanError> {
        Ok(Compound::new(self, false))
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Compound<'a>, ScanError> {
        self.path.push(variant.to_string());
        Ok(Compound::new(self, true))
    }
}

struct Compound<'a> {
    scan: &'a mut Scanner,
    index: usize,
    pending_key: Option<String>,
    pop_on_end: bool,
}

impl<'a> Compound<'a> {
    fn new(scan: &'a mut Scanner, pop_on_end: bool) -> Self {
        Self {
            scan,
            index: 0,
            pending_key: None,
            pop_on_end,
        }
    }

    fn element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ScanError> {
        let segment = self.index.to_string();
        self.index += 1;
        self.scan.nested(segment, value)
    }

    fn finish(self) -> Result<(), ScanError> {
        if self.pop_on_end {
            self.scan.path.pop();
        }
        Ok(())
    }
}

impl ser::SerializeSeq for Compound<'_> {
    type Ok = ();
    type Error = ScanError;
    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ScanError> {
        self.element(value)
    }
    fn end(self) -> Result<(), ScanError> {
        self.finish()
    }
}

impl ser::SerializeTuple for Compound<'_> {
    type Ok = ();
    type Error = ScanError;
    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ScanError> {
        self.element(value)
    }
    fn end(self) -> Result<(), ScanError> {
        self.finish()
    }
}

impl ser::SerializeTupleStruct for Compound<'_> {
    type Ok = ();
    type Error = ScanError;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ScanError> {
        self.element(value)
    }
    fn end(self) -> Result<(), ScanError> {
        self.finish()
    }
}

impl ser::SerializeTupleVariant for Compound<'_> {
    type Ok = ();
    type Error = ScanError;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ScanError> {
        self.element(value)
    }
    fn end(self) -> Result<(), ScanError> {
        self.finish()
    }
}

impl ser::SerializeMap for Compound<'_> {
    type Ok = ();
    type Error = ScanError;
    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), ScanError> {
        match key.serialize(KeyCheck) {
            Ok(name) => self.pending_key = Some(name),
            Err(e) => {
                let name = format!("<key {}>", self.index);
                self.scan.path.push(name.clone());
                self.scan.flag(format!("map key cannot be a JSON object key: {}", e.0));
                self.scan.path.pop();
                self.pending_key = Some(name);
            }
        }
        self.index += 1;
        Ok(())
    }
    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ScanError> {
        let segment = self.pending_key.take().unwrap_or_default();
        self.scan.nested(segment, value)
    }
    fn end(self) -> Result<(), ScanError> {
        self.finish()
    }
}

impl ser::SerializeStruct for Compound<'_> {
    type Ok = ();
    type Error = ScanError;
    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ScanError> {
        self.scan.nested(key.to_string(), value)
    }
    fn end(self) -> Result<(), ScanError> {
        self.finish()
    }
}

impl ser::SerializeStructVariant for Compound<'_> {
    type Ok = ();
    type Error = ScanError;
    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ScanError> {
        self.scan.nested(key.to_string(), value)
    }
    fn end(self) -> Result<(), ScanError> {
        self.finish()
    }
}

// ---------------------------------------------------------------------------
// Map keys
// ---------------------------------------------------------------------------

/// Accepts exactly the key shapes `serde_json` writes as object keys.
struct KeyCheck;

fn unsupported(kind: &str) -> ScanError {
    ScanError(format!("{kind} keys are not supported"))
}

impl ser::Serializer for KeyCheck {
    type Ok = String;
    type Error = ScanError;
    type SerializeSeq = Impossible<String, ScanError>;
    type SerializeTuple = Impossible<String, ScanError>;
    type SerializeTupleStruct = Impossible<String, ScanError>;
    type SerializeTupleVariant = Impossible<String, ScanError>;
    type SerializeMap = Impossible<String, ScanError>;
    type SerializeStruct = Impossible<String, ScanError>;
    type SerializeStructVariant = Impossible<String, ScanError>;

    fn serialize_bool(self, _: bool) -> Result<String, ScanError> {
        Err(unsupported("boolean"))
    }
    fn serialize_i8(self, v: i8) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_i16(self, v: i16) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_i32(self, v: i32) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_i64(self, v: i64) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_i128(self, v: i128) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_u8(self, v: u8) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_u16(self, v: u16) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_u32(self, v: u32) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_u64(self, v: u64) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_u128(self, v: u128) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_f32(self, _: f32) -> Result<String, ScanError> {
        Err(unsupported("float"))
    }
    fn serialize_f64(self, _: f64) -> Result<String, ScanError> {
        Err(unsupported("float"))
    }
    fn serialize_char(self, v: char) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_str(self, v: &str) -> Result<String, ScanError> {
        Ok(v.to_string())
    }
    fn serialize_bytes(self, _: &[u8]) -> Result<String, ScanError> {
        Err(unsupported("byte-array"))
    }
    fn serialize_none(self) -> Result<String, ScanError> {
        Err(unsupported("null"))
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<String, ScanError> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<String, ScanError> {
        Err(unsupported("unit"))
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<String, ScanError> {
        Err(unsupported("unit struct"))
    }
    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
    ) -> Result<String, ScanError> {
        Ok(variant.to_string())
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<String, ScanError> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<String, ScanError> {
        Err(unsupported("enum"))
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self::SerializeSeq, ScanError> {
        Err(unsupported("sequence"))
    }
    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple, ScanError> {
        Err(unsupported("tuple"))
    }
    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleStruct, ScanError> {
        Err(unsupported("tuple struct"))
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant, ScanError> {
        Err(unsupported("enum"))
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap, ScanError> {
        Err(unsupported("map"))
    }
    fn serialize_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStruct, ScanError> {
        Err(unsupported("struct"))
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant, ScanError> {
        Err(unsupported("enum"))
    }
}
