//! Typed, self-describing `Message` dictionary and its flatten/unflatten
//! wire codec (§3 "Message", §4.3 "Message codec").

mod byteio;
mod field;
pub mod micro;

pub use field::{type_code, FieldValue, Point, Rect, DEFAULT_ENCODING_TAG, MESSAGE_MAGIC};

use crate::status::{ErrorKind, Status, StatusResult};
use byteio::{ByteReader, ByteWriter};
use std::collections::HashMap;

/// A name→field dictionary with a 32-bit "what" code. Field insertion order
/// is preserved; values within a field are kept in append order (§3).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    what: u32,
    fields: Vec<(String, FieldValue)>,
    index: HashMap<String, usize>,
}

macro_rules! scalar_field_api {
    ($add:ident, $add_values:ident, $find:ident, $variant:ident, $t:ty) => {
        pub fn $add(&mut self, name: &str, v: $t) -> StatusResult<()> {
            self.add_value(name, FieldValue::$variant(vec![v]))
        }

        pub fn $add_values(&mut self, name: &str, vs: &[$t]) -> StatusResult<()> {
            self.add_value(name, FieldValue::$variant(vs.to_vec()))
        }

        pub fn $find(&self, name: &str, index: usize) -> StatusResult<$t> {
            match self.field(name)? {
                FieldValue::$variant(v) => v
                    .get(index)
                    .copied()
                    .ok_or_else(|| Status::new(ErrorKind::DataNotFound)),
                _ => Err(Status::new(ErrorKind::TypeMismatch)),
            }
        }
    };
}

impl Message {
    pub fn new(what: u32) -> Self {
        Message {
            what,
            fields: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn what(&self) -> u32 {
        self.what
    }

    pub fn set_what(&mut self, what: u32) {
        self.what = what;
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of values stored under `name`, or 0 if the field is absent.
    pub fn get_count(&self, name: &str) -> usize {
        self.field(name).map(|f| f.len()).unwrap_or(0)
    }

    /// Field names in insertion order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn field_type_code(&self, name: &str) -> StatusResult<u32> {
        self.field(name).map(|f| f.type_code())
    }

    fn field(&self, name: &str) -> StatusResult<&FieldValue> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| Status::new(ErrorKind::DataNotFound))?;
        Ok(&self.fields[idx].1)
    }

    /// Removes the field entirely. Re-packs the backing vector/index so
    /// that subsequent lookups stay consistent (§4.3 "Remove").
    pub fn remove_field(&mut self, name: &str) -> StatusResult<()> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| Status::new(ErrorKind::DataNotFound))?;
        self.fields.remove(idx);
        self.index.remove(name);
        for (n, i) in self.index.iter_mut() {
            if *i > idx {
                *i -= 1;
            }
            let _ = n;
        }
        Ok(())
    }

    /// Removes a single value at `index` within a field. If the field
    /// becomes empty, the field itself is removed.
    pub fn remove_value(&mut self, name: &str, index: usize) -> StatusResult<()> {
        let field_idx = *self
            .index
            .get(name)
            .ok_or_else(|| Status::new(ErrorKind::DataNotFound))?;
        let value = &mut self.fields[field_idx].1;
        let now_empty = remove_value_at(value, index)?;
        if now_empty {
            self.remove_field(name)?;
        }
        Ok(())
    }

    /// Deletes then re-inserts under a new name; the field's position is
    /// not preserved (it is re-appended at the end), matching
    /// "Rename/Replace: delete then insert" (§4.3).
    pub fn rename_field(&mut self, old_name: &str, new_name: &str) -> StatusResult<()> {
        if self.index.contains_key(new_name) {
            return Err(Status::new(ErrorKind::LogicError));
        }
        let idx = *self
            .index
            .get(old_name)
            .ok_or_else(|| Status::new(ErrorKind::DataNotFound))?;
        let (_, value) = self.fields.remove(idx);
        self.index.remove(old_name);
        for i in self.index.values_mut() {
            if *i > idx {
                *i -= 1;
            }
        }
        self.index.insert(new_name.to_string(), self.fields.len());
        self.fields.push((new_name.to_string(), value));
        Ok(())
    }

    fn add_value(&mut self, name: &str, value: FieldValue) -> StatusResult<()> {
        if let Some(&idx) = self.index.get(name) {
            merge_into(&mut self.fields[idx].1, value)
        } else {
            self.index.insert(name.to_string(), self.fields.len());
            self.fields.push((name.to_string(), value));
            Ok(())
        }
    }

    scalar_field_api!(add_bool, add_bool_values, find_bool, Bool, bool);
    scalar_field_api!(add_int8, add_int8_values, find_int8, Int8, i8);
    scalar_field_api!(add_int16, add_int16_values, find_int16, Int16, i16);
    scalar_field_api!(add_int32, add_int32_values, find_int32, Int32, i32);
    scalar_field_api!(add_int64, add_int64_values, find_int64, Int64, i64);
    scalar_field_api!(add_float, add_float_values, find_float, Float, f32);
    scalar_field_api!(add_double, add_double_values, find_double, Double, f64);
    scalar_field_api!(add_point, add_point_values, find_point, Point, Point);
    scalar_field_api!(add_rect, add_rect_values, find_rect, Rect, Rect);

    pub fn add_string(&mut self, name: &str, v: impl Into<String>) -> StatusResult<()> {
        self.add_value(name, FieldValue::String(vec![v.into()]))
    }

    pub fn find_string(&self, name: &str, index: usize) -> StatusResult<&str> {
        match self.field(name)? {
            FieldValue::String(v) => v
                .get(index)
                .map(String::as_str)
                .ok_or_else(|| Status::new(ErrorKind::DataNotFound)),
            _ => Err(Status::new(ErrorKind::TypeMismatch)),
        }
    }

    pub fn add_message(&mut self, name: &str, v: Message) -> StatusResult<()> {
        self.add_value(name, FieldValue::Message(vec![v]))
    }

    pub fn find_message(&self, name: &str, index: usize) -> StatusResult<&Message> {
        match self.field(name)? {
            FieldValue::Message(v) => v.get(index).ok_or_else(|| Status::new(ErrorKind::DataNotFound)),
            _ => Err(Status::new(ErrorKind::TypeMismatch)),
        }
    }

    pub fn add_raw(&mut self, name: &str, type_code: u32, blob: Vec<u8>) -> StatusResult<()> {
        self.add_value(
            name,
            FieldValue::Raw {
                type_code,
                blobs: vec![blob],
            },
        )
    }

    pub fn find_raw(&self, name: &str, index: usize) -> StatusResult<(u32, &[u8])> {
        match self.field(name)? {
            FieldValue::Raw { type_code, blobs } => blobs
                .get(index)
                .map(|b| (*type_code, b.as_slice()))
                .ok_or_else(|| Status::new(ErrorKind::DataNotFound)),
            _ => Err(Status::new(ErrorKind::TypeMismatch)),
        }
    }

    /// Total size, in bytes, of this message's flattened form.
    pub fn flattened_size(&self) -> usize {
        let mut size = 12; // magic + what + field_count
        for (name, value) in &self.fields {
            size += 4 + name.len() + 1; // name_len word + name bytes + NUL
            size += 4 + 4; // type_code + payload_len
            size += payload_size(value);
        }
        size
    }

    /// Writes the layout of §3: three header words followed by field
    /// records in insertion order.
    pub fn flatten(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.flattened_size());
        w.write_u32(MESSAGE_MAGIC);
        w.write_u32(self.what);
        w.write_u32(self.fields.len() as u32);
        for (name, value) in &self.fields {
            w.write_cstr_with_len(name);
            w.write_u32(value.type_code());
            let payload = encode_payload(value);
            w.write_u32(payload.len() as u32);
            w.write_bytes(&payload);
        }
        w.into_vec()
    }

    /// Validates magic, walks field records strictly by their length
    /// prefixes, and rejects records that would read past the end.
    /// Duplicate field names are rejected unless `enforce_unique` is false.
    pub fn unflatten_with_options(bytes: &[u8], enforce_unique: bool) -> StatusResult<Message> {
        let mut r = ByteReader::new(bytes);
        let magic = r.read_u32()?;
        if magic != MESSAGE_MAGIC {
            return Err(Status::new(ErrorKind::BadArgument));
        }
        let what = r.read_u32()?;
        let field_count = r.read_u32()?;
        let mut msg = Message::new(what);
        for _ in 0..field_count {
            let name = r.read_cstr_with_len()?;
            let type_code = r.read_u32()?;
            let payload_len = r.read_u32()? as usize;
            let payload = r.read_bytes(payload_len)?;
            let value = decode_payload(type_code, payload, enforce_unique)?;
            if msg.index.contains_key(&name) {
                if enforce_unique {
                    return Err(Status::new(ErrorKind::LogicError));
                }
                let idx = msg.index[&name];
                msg.fields[idx].1 = value;
            } else {
                msg.index.insert(name.clone(), msg.fields.len());
                msg.fields.push((name, value));
            }
        }
        Ok(msg)
    }

    /// Convenience wrapper over [`Message::unflatten_with_options`] with
    /// unique-name enforcement turned on.
    pub fn unflatten(bytes: &[u8]) -> StatusResult<Message> {
        Message::unflatten_with_options(bytes, true)
    }
}

/// Returns `true` if, after removing the value, the field is now empty.
fn remove_value_at(value: &mut FieldValue, index: usize) -> StatusResult<bool> {
    macro_rules! remove_arm {
        ($v:ident) => {{
            if index >= $v.len() {
                return Err(Status::new(ErrorKind::DataNotFound));
            }
            $v.remove(index);
            Ok($v.is_empty())
        }};
    }
    match value {
        FieldValue::Bool(v) => remove_arm!(v),
        FieldValue::Int8(v) => remove_arm!(v),
        FieldValue::Int16(v) => remove_arm!(v),
        FieldValue::Int32(v) => remove_arm!(v),
        FieldValue::Int64(v) => remove_arm!(v),
        FieldValue::Float(v) => remove_arm!(v),
        FieldValue::Double(v) => remove_arm!(v),
        FieldValue::Point(v) => remove_arm!(v),
        FieldValue::Rect(v) => remove_arm!(v),
        FieldValue::String(v) => remove_arm!(v),
        FieldValue::Message(v) => remove_arm!(v),
        FieldValue::Raw { blobs, .. } => remove_arm!(blobs),
    }
}

fn merge_into(existing: &mut FieldValue, incoming: FieldValue) -> StatusResult<()> {
    use FieldValue::*;
    match (existing, incoming) {
        (Bool(a), Bool(b)) => a.extend(b),
        (Int8(a), Int8(b)) => a.extend(b),
        (Int16(a), Int16(b)) => a.extend(b),
        (Int32(a), Int32(b)) => a.extend(b),
        (Int64(a), Int64(b)) => a.extend(b),
        (Float(a), Float(b)) => a.extend(b),
        (Double(a), Double(b)) => a.extend(b),
        (Point(a), Point(b)) => a.extend(b),
        (Rect(a), Rect(b)) => a.extend(b),
        (String(a), String(b)) => a.extend(b),
        (Message(a), Message(b)) => a.extend(b),
        (Raw { type_code: tc_a, blobs: a }, Raw { type_code: tc_b, blobs: b }) => {
            if *tc_a != tc_b {
                return Err(Status::new(ErrorKind::TypeMismatch));
            }
            a.extend(b);
        }
        _ => return Err(Status::new(ErrorKind::TypeMismatch)),
    }
    Ok(())
}

fn payload_size(value: &FieldValue) -> usize {
    match value {
        FieldValue::Bool(v) => v.len(),
        FieldValue::Int8(v) => v.len(),
        FieldValue::Int16(v) => v.len() * 2,
        FieldValue::Int32(v) => v.len() * 4,
        FieldValue::Int64(v) => v.len() * 8,
        FieldValue::Float(v) => v.len() * 4,
        FieldValue::Double(v) => v.len() * 8,
        FieldValue::Point(v) => v.len() * 8,
        FieldValue::Rect(v) => v.len() * 16,
        FieldValue::String(v) => 4 + v.iter().map(|s| 4 + s.len() + 1).sum::<usize>(),
        FieldValue::Message(v) => v.iter().map(|m| 4 + m.flattened_size()).sum(),
        FieldValue::Raw { blobs, .. } => 4 + blobs.iter().map(|b| 4 + b.len()).sum::<usize>(),
    }
}

fn encode_payload(value: &FieldValue) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(payload_size(value));
    match value {
        FieldValue::Bool(v) => v.iter().for_each(|b| w.write_u8(*b as u8)),
        FieldValue::Int8(v) => v.iter().for_each(|n| w.write_i8(*n)),
        FieldValue::Int16(v) => v.iter().for_each(|n| w.write_i16(*n)),
        FieldValue::Int32(v) => v.iter().for_each(|n| w.write_i32(*n)),
        FieldValue::Int64(v) => v.iter().for_each(|n| w.write_i64(*n)),
        FieldValue::Float(v) => v.iter().for_each(|n| w.write_f32(*n)),
        FieldValue::Double(v) => v.iter().for_each(|n| w.write_f64(*n)),
        FieldValue::Point(v) => v.iter().for_each(|p| {
            w.write_f32(p.x);
            w.write_f32(p.y);
        }),
        FieldValue::Rect(v) => v.iter().for_each(|r| {
            w.write_f32(r.left);
            w.write_f32(r.top);
            w.write_f32(r.right);
            w.write_f32(r.bottom);
        }),
        FieldValue::String(v) => {
            w.write_u32(v.len() as u32);
            v.iter().for_each(|s| w.write_cstr_with_len(s));
        }
        FieldValue::Message(v) => {
            // No top-level count prefix: the legacy wire format recovers
            // the count by scanning (§3, §9 "Open question"). Each entry is
            // a 32-bit flattened size followed by that many bytes.
            v.iter().for_each(|m| {
                let flat = m.flatten();
                w.write_u32(flat.len() as u32);
                w.write_bytes(&flat);
            });
        }
        FieldValue::Raw { blobs, .. } => {
            w.write_u32(blobs.len() as u32);
            blobs.iter().for_each(|b| {
                w.write_u32(b.len() as u32);
                w.write_bytes(b);
            });
        }
    }
    w.into_vec()
}

fn decode_payload(code: u32, payload: &[u8], enforce_unique: bool) -> StatusResult<FieldValue> {
    macro_rules! decode_fixed {
        ($variant:ident, $elem_size:expr, $read:ident) => {{
            if payload.len() % $elem_size != 0 {
                return Err(Status::new(ErrorKind::BadArgument));
            }
            let mut r = ByteReader::new(payload);
            let mut out = Vec::with_capacity(payload.len() / $elem_size);
            while r.remaining() > 0 {
                out.push(r.$read()?);
            }
            Ok(FieldValue::$variant(out))
        }};
    }

    match code {
        type_code::BOOL => {
            let mut r = ByteReader::new(payload);
            let mut out = Vec::with_capacity(payload.len());
            while r.remaining() > 0 {
                out.push(r.read_u8()? != 0);
            }
            Ok(FieldValue::Bool(out))
        }
        type_code::INT8 => decode_fixed!(Int8, 1, read_i8),
        type_code::INT16 => decode_fixed!(Int16, 2, read_i16),
        type_code::INT32 => decode_fixed!(Int32, 4, read_i32),
        type_code::INT64 => decode_fixed!(Int64, 8, read_i64),
        type_code::FLOAT => decode_fixed!(Float, 4, read_f32),
        type_code::DOUBLE => decode_fixed!(Double, 8, read_f64),
        type_code::POINT => {
            if payload.len() % 8 != 0 {
                return Err(Status::new(ErrorKind::BadArgument));
            }
            let mut r = ByteReader::new(payload);
            let mut out = Vec::with_capacity(payload.len() / 8);
            while r.remaining() > 0 {
                out.push(Point {
                    x: r.read_f32()?,
                    y: r.read_f32()?,
                });
            }
            Ok(FieldValue::Point(out))
        }
        type_code::RECT => {
            if payload.len() % 16 != 0 {
                return Err(Status::new(ErrorKind::BadArgument));
            }
            let mut r = ByteReader::new(payload);
            let mut out = Vec::with_capacity(payload.len() / 16);
            while r.remaining() > 0 {
                out.push(Rect {
                    left: r.read_f32()?,
                    top: r.read_f32()?,
                    right: r.read_f32()?,
                    bottom: r.read_f32()?,
                });
            }
            Ok(FieldValue::Rect(out))
        }
        type_code::STRING => {
            let mut r = ByteReader::new(payload);
            let count = r.read_u32()?;
            let mut out = Vec::with_capacity(count as usize);
            for _ in 0..count {
                out.push(r.read_cstr_with_len()?);
            }
            Ok(FieldValue::String(out))
        }
        type_code::MESSAGE => {
            let mut out = Vec::new();
            let mut pos = 0usize;
            while pos < payload.len() {
                if payload.len() - pos < 4 {
                    return Err(Status::new(ErrorKind::BadArgument));
                }
                let size = u32::from_le_bytes(payload[pos..pos + 4].try_into().unwrap()) as usize;
                pos += 4;
                if size < 12 || payload.len() - pos < size {
                    return Err(Status::new(ErrorKind::BadArgument));
                }
                let sub = Message::unflatten_with_options(&payload[pos..pos + size], enforce_unique)?;
                out.push(sub);
                pos += size;
            }
            Ok(FieldValue::Message(out))
        }
        other => {
            // Unrecognized or explicitly-raw type codes are treated as
            // opaque blob fields tagged with their wire type code (covers
            // both RAW_ANY/RAW_DATA and any user-chosen code).
            let mut r = ByteReader::new(payload);
            let count = r.read_u32()?;
            let mut blobs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let len = r.read_u32()? as usize;
                blobs.push(r.read_bytes(len)?.to_vec());
            }
            Ok(FieldValue::Raw {
                type_code: other,
                blobs,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let mut m = Message::new(0x1234);
        m.add_bool_values("b", &[true, false]).unwrap();
        m.add_int32_values("i", &[1, 2, 3, 4, 5]).unwrap();
        m.add_string("s", "hi").unwrap();
        m.add_string("s", "world").unwrap();
        let inner = Message::new(7);
        m.add_message("m", inner).unwrap();
        m
    }

    #[test]
    fn unflatten_of_flatten_round_trips() {
        let m = sample_message();
        let bytes = m.flatten();
        let back = Message::unflatten(&bytes).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn flatten_is_deterministic() {
        let m = sample_message();
        assert_eq!(m.flatten(), m.flatten());
    }

    #[test]
    fn find_returns_values_in_append_order() {
        let m = sample_message();
        assert_eq!(m.get_count("i"), 5);
        for i in 0..5 {
            assert_eq!(m.find_int32("i", i).unwrap(), i as i32 + 1);
        }
        assert_eq!(m.find_string("s", 0).unwrap(), "hi");
        assert_eq!(m.find_string("s", 1).unwrap(), "world");
    }

    #[test]
    fn zero_field_message_is_twelve_bytes() {
        let m = Message::new(42);
        let bytes = m.flatten();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &MESSAGE_MAGIC.to_le_bytes());
        assert_eq!(&bytes[4..8], &42u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0u32.to_le_bytes());
    }

    #[test]
    fn empty_string_field_round_trips() {
        let mut m = Message::new(1);
        m.add_string("e", "").unwrap();
        let back = Message::unflatten(&m.flatten()).unwrap();
        assert_eq!(back.find_string("e", 0).unwrap(), "");
    }

    #[test]
    fn type_mismatch_on_add_is_logic_error() {
        let mut m = Message::new(1);
        m.add_int32("x", 1).unwrap();
        let err = m.add_string("x", "oops").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn duplicate_field_name_rejected_when_enforced() {
        // Hand-craft bytes with the same field name twice.
        let mut w = ByteWriter::new();
        w.write_u32(MESSAGE_MAGIC);
        w.write_u32(1);
        w.write_u32(2);
        for _ in 0..2 {
            w.write_cstr_with_len("dup");
            w.write_u32(type_code::INT32);
            w.write_u32(4);
            w.write_i32(1);
        }
        let bytes = w.into_vec();
        assert!(Message::unflatten_with_options(&bytes, true).is_err());
        assert!(Message::unflatten_with_options(&bytes, false).is_ok());
    }

    #[test]
    fn nested_message_smaller_than_header_is_rejected() {
        let mut w = ByteWriter::new();
        w.write_u32(MESSAGE_MAGIC);
        w.write_u32(1);
        w.write_u32(1);
        w.write_cstr_with_len("m");
        w.write_u32(type_code::MESSAGE);
        w.write_u32(4 + 4); // payload: size word says 4, far too small
        w.write_u32(4);
        w.write_bytes(&[0, 0, 0, 0]);
        let bytes = w.into_vec();
        assert!(Message::unflatten(&bytes).is_err());
    }

    #[test]
    fn raw_blob_round_trips_with_custom_type_code() {
        let mut m = Message::new(1);
        m.add_raw("blob", 0xDEAD_BEEF, vec![1, 2, 3]).unwrap();
        let back = Message::unflatten(&m.flatten()).unwrap();
        let (code, bytes) = back.find_raw("blob", 0).unwrap();
        assert_eq!(code, 0xDEAD_BEEF);
        assert_eq!(bytes, &[1, 2, 3]);
    }
}
