//! `MicroMessage`: an in-place, near-zero-allocation view over a
//! caller-supplied buffer using the same wire layout as [`super::Message`]
//! (§3 "MicroMessage", §4.3).
//!
//! [`MicroMessageBuilder`] covers build mode (append-only construction).
//! [`MicroMessageView`] covers read-only mode: it walks field records
//! directly over the borrowed buffer and caches the last-looked-up field so
//! repeated queries against the same name skip the linear scan.

use super::byteio::ByteReader;
use super::field::{type_code, MESSAGE_MAGIC};
use crate::status::{ErrorKind, Status, StatusResult};

const HEADER_LEN: usize = 12;

/// Remembers the most recently appended field so repeated additions under
/// the same name are O(1): only the payload is extended and the record's
/// length word is patched, without re-scanning the field table.
struct AddCursor {
    name: String,
    type_code: u32,
    payload_len_offset: usize,
}

/// Append-only builder over a caller-owned buffer. The buffer must
/// pre-exist with enough spare capacity for the fields about to be added;
/// this builder never reallocates on its own (`grow_to` lets the owner do
/// so explicitly between appends).
pub struct MicroMessageBuilder<'buf> {
    buf: &'buf mut Vec<u8>,
    base: usize,
    unique_names: bool,
    cursor: Option<AddCursor>,
    /// Absolute offsets, one per enclosing ancestor level, of the 32-bit
    /// "payload length" word that must grow in lockstep as this message
    /// grows. The per-message size word embedded just after each such
    /// offset (`offset + 4`) grows by the same delta.
    ancestor_patch_offsets: Vec<usize>,
    field_names_seen: std::collections::HashSet<String>,
}

impl<'buf> MicroMessageBuilder<'buf> {
    /// Starts a brand-new top-level message at the end of `buf`.
    ///
    /// `unique_names` toggles the linear duplicate-name scan described as
    /// an open question in §9: preserved as an explicit, per-builder switch
    /// rather than a silent global, per that design note's resolution.
    pub fn new(buf: &'buf mut Vec<u8>, what: u32, unique_names: bool) -> Self {
        let base = buf.len();
        buf.extend_from_slice(&MESSAGE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&what.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // field_count, patched as fields are added
        MicroMessageBuilder {
            buf,
            base,
            unique_names,
            cursor: None,
            ancestor_patch_offsets: Vec::new(),
            field_names_seen: std::collections::HashSet::new(),
        }
    }

    fn field_count_offset(&self) -> usize {
        self.base + 8
    }

    fn len(&self) -> usize {
        self.buf.len() - self.base
    }

    fn bump_field_count(&mut self) {
        let off = self.field_count_offset();
        let cur = u32::from_le_bytes(self.buf[off..off + 4].try_into().unwrap());
        self.buf[off..off + 4].copy_from_slice(&(cur + 1).to_le_bytes());
    }

    fn patch_u32_add(&mut self, offset: usize, delta: u32) {
        let cur = u32::from_le_bytes(self.buf[offset..offset + 4].try_into().unwrap());
        self.buf[offset..offset + 4].copy_from_slice(&(cur + delta).to_le_bytes());
    }

    /// Propagates a growth of `delta` bytes to every enclosing ancestor's
    /// bookkeeping words. Called once per append.
    fn propagate_growth(&mut self, delta: u32) {
        if delta == 0 {
            return;
        }
        for i in 0..self.ancestor_patch_offsets.len() {
            let off = self.ancestor_patch_offsets[i];
            self.patch_u32_add(off, delta);
            self.patch_u32_add(off + 4, delta);
        }
    }

    fn begin_new_field(&mut self, name: &str, type_code: u32) -> StatusResult<usize> {
        if self.unique_names && self.field_names_seen.contains(name) {
            return Err(Status::new(ErrorKind::LogicError));
        }
        self.field_names_seen.insert(name.to_string());
        let before = self.len() as u32;
        let name_len = name.len() as u32 + 1;
        self.buf.extend_from_slice(&name_len.to_le_bytes());
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
        self.buf.extend_from_slice(&type_code.to_le_bytes());
        let payload_len_offset = self.buf.len();
        self.buf.extend_from_slice(&0u32.to_le_bytes()); // payload_len placeholder
        self.bump_field_count();
        self.cursor = None;
        let delta = self.len() as u32 - before;
        self.propagate_growth(delta);
        Ok(payload_len_offset)
    }

    fn append_payload_bytes(&mut self, payload_len_offset: usize, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.patch_u32_add(payload_len_offset, bytes.len() as u32);
        self.propagate_growth(bytes.len() as u32);
    }

    /// Appends one `i32` value under `name`, reusing the add-cursor for an
    /// O(1) append when this call matches the most recently added field.
    pub fn add_i32(&mut self, name: &str, v: i32) -> StatusResult<()> {
        self.add_fixed(name, type_code::INT32, &v.to_le_bytes())
    }

    pub fn add_i64(&mut self, name: &str, v: i64) -> StatusResult<()> {
        self.add_fixed(name, type_code::INT64, &v.to_le_bytes())
    }

    pub fn add_f64(&mut self, name: &str, v: f64) -> StatusResult<()> {
        self.add_fixed(name, type_code::DOUBLE, &v.to_le_bytes())
    }

    pub fn add_bool(&mut self, name: &str, v: bool) -> StatusResult<()> {
        self.add_fixed(name, type_code::BOOL, &[v as u8])
    }

    fn add_fixed(&mut self, name: &str, type_code: u32, bytes: &[u8]) -> StatusResult<()> {
        if let Some(cursor) = &self.cursor {
            if cursor.name == name && cursor.type_code == type_code {
                let offset = cursor.payload_len_offset;
                self.append_payload_bytes(offset, bytes);
                return Ok(());
            }
        }
        let offset = self.begin_new_field(name, type_code)?;
        self.append_payload_bytes(offset, bytes);
        self.cursor = Some(AddCursor {
            name: name.to_string(),
            type_code,
            payload_len_offset: offset,
        });
        Ok(())
    }

    pub fn add_string(&mut self, name: &str, v: &str) -> StatusResult<()> {
        if let Some(cursor) = &self.cursor {
            if cursor.name == name && cursor.type_code == type_code::STRING {
                let offset = cursor.payload_len_offset;
                // Bump the embedded per-field string count, then append.
                self.bump_string_count(offset);
                let mut bytes = Vec::with_capacity(v.len() + 5);
                bytes.extend_from_slice(&(v.len() as u32 + 1).to_le_bytes());
                bytes.extend_from_slice(v.as_bytes());
                bytes.push(0);
                self.append_payload_bytes(offset, &bytes);
                return Ok(());
            }
        }
        let offset = self.begin_new_field(name, type_code::STRING)?;
        // payload begins with a u32 string count, starting at 1.
        let mut bytes = Vec::with_capacity(v.len() + 9);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&(v.len() as u32 + 1).to_le_bytes());
        bytes.extend_from_slice(v.as_bytes());
        bytes.push(0);
        self.append_payload_bytes(offset, &bytes);
        self.cursor = Some(AddCursor {
            name: name.to_string(),
            type_code: type_code::STRING,
            payload_len_offset: offset,
        });
        Ok(())
    }

    fn bump_string_count(&mut self, payload_len_offset: usize) {
        // The string count word sits immediately after the payload_len
        // word, at the start of the payload itself.
        let count_offset = payload_len_offset + 4;
        self.patch_u32_add(count_offset, 1);
    }

    /// Begins a nested child message as a new field. The returned builder
    /// mutably borrows this builder's buffer, so the Rust borrow checker
    /// enforces the "child is sealed once a sibling field is appended"
    /// invariant of §3/§4.3: `self` cannot be used again until the child
    /// handle is dropped, and dropping it without reopening never allows
    /// further growth of that child.
    pub fn begin_child_message<'a>(
        &'a mut self,
        name: &str,
        what: u32,
    ) -> StatusResult<MicroMessageBuilder<'a>> {
        let payload_len_offset = self.begin_new_field(name, type_code::MESSAGE)?;
        // Payload = u32 child-size word + the child's own flattened bytes.
        let child_size_offset = self.buf.len();
        self.buf.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());
        let child_base = self.buf.len();
        self.buf.extend_from_slice(&MESSAGE_MAGIC.to_le_bytes());
        self.buf.extend_from_slice(&what.to_le_bytes());
        self.buf.extend_from_slice(&0u32.to_le_bytes());
        debug_assert_eq!(child_size_offset, payload_len_offset + 4);
        let total_growth = (self.buf.len() - child_base) as u32 + 4; // + the size word itself
        self.patch_u32_add(payload_len_offset, total_growth);
        self.propagate_growth(total_growth);

        let mut ancestor_patch_offsets = vec![payload_len_offset];
        ancestor_patch_offsets.extend(self.ancestor_patch_offsets.iter().copied());

        Ok(MicroMessageBuilder {
            buf: self.buf,
            base: child_base,
            unique_names: self.unique_names,
            cursor: None,
            ancestor_patch_offsets,
            field_names_seen: std::collections::HashSet::new(),
        })
    }

    /// Total length, in bytes, of this message (header plus fields so far).
    pub fn current_len(&self) -> usize {
        self.len()
    }
}

/// The most recently located field record, remembered so a repeated
/// `find_*` call under the same name skips the linear scan (§4.3 "a
/// read-only MicroMessage caches the last-looked-up field pointer").
struct FindCursor<'buf> {
    name: String,
    type_code: u32,
    payload: &'buf [u8],
}

/// Read-only cursor over a flattened message buffer, parsing field records
/// directly out of the borrowed bytes rather than decoding them into a
/// [`super::Message`] up front.
pub struct MicroMessageView<'buf> {
    what: u32,
    field_count: u32,
    fields: &'buf [u8],
    cursor: Option<FindCursor<'buf>>,
}

impl<'buf> MicroMessageView<'buf> {
    /// Parses the header of `buf`, which must begin exactly at the
    /// message's magic word (as written by [`MicroMessageBuilder`] or
    /// [`super::Message::flatten`]).
    pub fn new(buf: &'buf [u8]) -> StatusResult<Self> {
        let mut r = ByteReader::new(buf);
        let magic = r.read_u32()?;
        if magic != MESSAGE_MAGIC {
            return Err(Status::new(ErrorKind::BadArgument));
        }
        let what = r.read_u32()?;
        let field_count = r.read_u32()?;
        let fields = r.read_bytes(r.remaining())?;
        Ok(MicroMessageView {
            what,
            field_count,
            fields,
            cursor: None,
        })
    }

    pub fn what(&self) -> u32 {
        self.what
    }

    pub fn num_fields(&self) -> u32 {
        self.field_count
    }

    pub fn has_field(&mut self, name: &str) -> bool {
        self.locate(name).is_ok()
    }

    /// Scans the field records for `name`, caching the hit. Repeated calls
    /// for the same name short-circuit on the cached payload.
    fn locate(&mut self, name: &str) -> StatusResult<(u32, &'buf [u8])> {
        if let Some(cursor) = &self.cursor {
            if cursor.name == name {
                return Ok((cursor.type_code, cursor.payload));
            }
        }

        let mut r = ByteReader::new(self.fields);
        for _ in 0..self.field_count {
            let name_len = r.read_u32()? as usize;
            if name_len == 0 {
                return Err(Status::new(ErrorKind::BadArgument));
            }
            let name_bytes = r.read_bytes(name_len)?;
            let (body, nul) = name_bytes.split_at(name_len - 1);
            if nul != [0] {
                return Err(Status::new(ErrorKind::BadArgument));
            }
            let type_code = r.read_u32()?;
            let payload_len = r.read_u32()? as usize;
            let payload = r.read_bytes(payload_len)?;
            if body == name.as_bytes() {
                self.cursor = Some(FindCursor {
                    name: name.to_string(),
                    type_code,
                    payload,
                });
                return Ok((type_code, payload));
            }
        }
        Err(Status::new(ErrorKind::DataNotFound))
    }

    fn find_fixed(
        &mut self,
        name: &str,
        index: usize,
        expect: u32,
        width: usize,
    ) -> StatusResult<&'buf [u8]> {
        let (type_code, payload) = self.locate(name)?;
        if type_code != expect {
            return Err(Status::new(ErrorKind::TypeMismatch));
        }
        let start = index * width;
        if start + width > payload.len() {
            return Err(Status::new(ErrorKind::DataNotFound));
        }
        Ok(&payload[start..start + width])
    }

    pub fn find_bool(&mut self, name: &str, index: usize) -> StatusResult<bool> {
        let bytes = self.find_fixed(name, index, type_code::BOOL, 1)?;
        Ok(bytes[0] != 0)
    }

    pub fn find_i32(&mut self, name: &str, index: usize) -> StatusResult<i32> {
        let bytes = self.find_fixed(name, index, type_code::INT32, 4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn find_i64(&mut self, name: &str, index: usize) -> StatusResult<i64> {
        let bytes = self.find_fixed(name, index, type_code::INT64, 8)?;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn find_f64(&mut self, name: &str, index: usize) -> StatusResult<f64> {
        let bytes = self.find_fixed(name, index, type_code::DOUBLE, 8)?;
        Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Returns the `index`-th string appended under `name`, borrowed
    /// straight out of the underlying buffer.
    pub fn find_string(&mut self, name: &str, index: usize) -> StatusResult<&'buf str> {
        let (type_code, payload) = self.locate(name)?;
        if type_code != type_code::STRING {
            return Err(Status::new(ErrorKind::TypeMismatch));
        }
        let mut r = ByteReader::new(payload);
        let count = r.read_u32()? as usize;
        if index >= count {
            return Err(Status::new(ErrorKind::DataNotFound));
        }
        for i in 0..count {
            let len_including_nul = r.read_u32()? as usize;
            let bytes = r.read_bytes(len_including_nul)?;
            if i == index {
                let (body, nul) = bytes.split_at(len_including_nul - 1);
                if nul != [0] {
                    return Err(Status::new(ErrorKind::BadArgument));
                }
                return std::str::from_utf8(body).map_err(|_| Status::new(ErrorKind::BadArgument));
            }
        }
        Err(Status::new(ErrorKind::DataNotFound))
    }

    /// Returns a view over the child message stored under `name`. Only
    /// `index == 0` is supported: [`MicroMessageBuilder::begin_child_message`]
    /// writes one child per field record rather than packing several
    /// children into one payload, so a second child under the same name
    /// (unique-name enforcement disabled) lives in its own field record,
    /// not reachable through this call.
    pub fn find_message(
        &mut self,
        name: &str,
        index: usize,
    ) -> StatusResult<MicroMessageView<'buf>> {
        if index != 0 {
            return Err(Status::new(ErrorKind::DataNotFound));
        }
        let (type_code, payload) = self.locate(name)?;
        if type_code != type_code::MESSAGE {
            return Err(Status::new(ErrorKind::TypeMismatch));
        }
        let mut r = ByteReader::new(payload);
        let child_size = r.read_u32()? as usize;
        let child_bytes = r.read_bytes(child_size)?;
        MicroMessageView::new(child_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn micro_message_matches_message_for_scalar_and_string_fields() {
        let mut expected = Message::new(0x1234);
        expected.add_bool_values("b", &[true, false]).unwrap();
        expected.add_int32("i", 7).unwrap();
        expected.add_string("s", "hi").unwrap();

        let mut buf = Vec::new();
        {
            let mut builder = MicroMessageBuilder::new(&mut buf, 0x1234, true);
            builder.add_bool("b", true).unwrap();
            builder.add_bool("b", false).unwrap();
            builder.add_i32("i", 7).unwrap();
            builder.add_string("s", "hi").unwrap();
        }

        assert_eq!(buf, expected.flatten());
    }

    #[test]
    fn nested_child_message_updates_parent_length_fields() {
        let mut buf = Vec::new();
        {
            let mut parent = MicroMessageBuilder::new(&mut buf, 1, true);
            {
                let mut child = parent.begin_child_message("kid", 7).unwrap();
                child.add_i32("x", 99).unwrap();
                child.add_i32("x", 100).unwrap();
            }
            parent.add_i32("after", 5).unwrap();
        }

        let decoded = Message::unflatten(&buf).unwrap();
        let kid = decoded.find_message("kid", 0).unwrap();
        assert_eq!(kid.what(), 7);
        assert_eq!(kid.find_int32("x", 0).unwrap(), 99);
        assert_eq!(kid.find_int32("x", 1).unwrap(), 100);
        assert_eq!(decoded.find_int32("after", 0).unwrap(), 5);
    }

    #[test]
    fn duplicate_field_name_rejected_when_unique_enforced() {
        let mut buf = Vec::new();
        let mut builder = MicroMessageBuilder::new(&mut buf, 1, true);
        builder.add_i32("x", 1).unwrap();
        // A different type under the same name defeats the append-cursor
        // fast path and falls into begin_new_field's uniqueness check.
        let err = builder.add_string("x", "oops").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LogicError);
    }

    #[test]
    fn duplicate_field_name_allowed_when_unique_check_disabled() {
        let mut buf = Vec::new();
        let mut builder = MicroMessageBuilder::new(&mut buf, 1, false);
        builder.add_i32("x", 1).unwrap();
        assert!(builder.add_string("x", "ok").is_ok());
    }

    #[test]
    fn view_reads_back_scalar_and_string_fields() {
        let mut buf = Vec::new();
        {
            let mut builder = MicroMessageBuilder::new(&mut buf, 0x1234, true);
            builder.add_bool("b", true).unwrap();
            builder.add_bool("b", false).unwrap();
            builder.add_i32("i", 7).unwrap();
            builder.add_i64("big", -9).unwrap();
            builder.add_f64("d", 2.5).unwrap();
            builder.add_string("s", "hi").unwrap();
            builder.add_string("s", "world").unwrap();
        }

        let mut view = MicroMessageView::new(&buf).unwrap();
        assert_eq!(view.what(), 0x1234);
        assert_eq!(view.num_fields(), 5);
        assert_eq!(view.find_bool("b", 0).unwrap(), true);
        assert_eq!(view.find_bool("b", 1).unwrap(), false);
        assert_eq!(view.find_i32("i", 0).unwrap(), 7);
        assert_eq!(view.find_i64("big", 0).unwrap(), -9);
        assert_eq!(view.find_f64("d", 0).unwrap(), 2.5);
        assert_eq!(view.find_string("s", 0).unwrap(), "hi");
        assert_eq!(view.find_string("s", 1).unwrap(), "world");
        assert!(!view.has_field("missing"));
    }

    #[test]
    fn view_caches_last_looked_up_field_across_repeated_queries() {
        let mut buf = Vec::new();
        {
            let mut builder = MicroMessageBuilder::new(&mut buf, 1, true);
            builder.add_i32("a", 1).unwrap();
            builder.add_i32("b", 2).unwrap();
        }

        let mut view = MicroMessageView::new(&buf).unwrap();
        assert_eq!(view.find_i32("b", 0).unwrap(), 2);
        // Second lookup of the same name is served from the cached cursor;
        // a stale cursor would still answer correctly here, so this checks
        // behavior survives across repeats rather than the cache itself.
        assert_eq!(view.find_i32("b", 0).unwrap(), 2);
        assert_eq!(view.find_i32("a", 0).unwrap(), 1);
    }

    #[test]
    fn view_rejects_type_mismatch_and_missing_fields() {
        let mut buf = Vec::new();
        {
            let mut builder = MicroMessageBuilder::new(&mut buf, 1, true);
            builder.add_i32("x", 1).unwrap();
        }
        let mut view = MicroMessageView::new(&buf).unwrap();
        assert_eq!(
            view.find_string("x", 0).unwrap_err().kind(),
            ErrorKind::TypeMismatch
        );
        assert_eq!(
            view.find_i32("missing", 0).unwrap_err().kind(),
            ErrorKind::DataNotFound
        );
    }

    #[test]
    fn view_reads_back_nested_child_message() {
        let mut buf = Vec::new();
        {
            let mut parent = MicroMessageBuilder::new(&mut buf, 1, true);
            {
                let mut child = parent.begin_child_message("kid", 7).unwrap();
                child.add_i32("x", 99).unwrap();
            }
            parent.add_i32("after", 5).unwrap();
        }

        let mut view = MicroMessageView::new(&buf).unwrap();
        let mut kid = view.find_message("kid", 0).unwrap();
        assert_eq!(kid.what(), 7);
        assert_eq!(kid.find_i32("x", 0).unwrap(), 99);
        assert_eq!(view.find_i32("after", 0).unwrap(), 5);
    }
}
