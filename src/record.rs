//! Key record codec shared by the sorter and its host comparator.
//!
//! A key is a sequence of typed fields, each a tag byte plus payload.
//! Fields order NULL first, then numerics (integers and reals compare
//! across types), then text, then blobs; NaN sorts after every number.

use std::cmp::Ordering;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecError {
    Corrupt,
    NoMem,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt => f.write_str("Malformed key record"),
            Self::NoMem => f.write_str("Out of memory decoding key record"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Append `value` in variable-length encoding; returns the byte count.
///
/// Seven payload bits per byte, big-endian, high bit set on all but the
/// last byte; a ninth byte, when present, carries a full eight bits.
pub fn put_varint(out: &mut Vec<u8>, mut value: u64) -> usize {
    if value <= 0x7f {
        out.push(value as u8);
        return 1;
    }
    if value > 0x00ff_ffff_ffff_ffff {
        let mut buf = [0u8; 9];
        buf[8] = (value & 0xff) as u8;
        value >>= 8;
        for slot in buf[..8].iter_mut().rev() {
            *slot = ((value & 0x7f) as u8) | 0x80;
            value >>= 7;
        }
        out.extend_from_slice(&buf);
        return 9;
    }
    let mut buf = [0u8; 9];
    let mut n = 0;
    while value != 0 {
        buf[n] = ((value & 0x7f) as u8) | 0x80;
        n += 1;
        value >>= 7;
    }
    buf[0] &= 0x7f;
    for i in (0..n).rev() {
        out.push(buf[i]);
    }
    n
}

/// Decode a varint from the front of `bytes`; `None` if truncated.
pub fn get_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &b) in bytes.iter().take(9).enumerate() {
        if i == 8 {
            return Some(((value << 8) | b as u64, 9));
        }
        value = (value << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

pub fn varint_len(value: u64) -> usize {
    if value <= 0x7f {
        return 1;
    }
    if value > 0x00ff_ffff_ffff_ffff {
        return 9;
    }
    let mut n = 0;
    let mut value = value;
    while value != 0 {
        n += 1;
        value >>= 7;
    }
    n
}

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;

/// One key field, borrowing its payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldRef<'a> {
    Null,
    Integer(i64),
    Real(f64),
    Text(&'a [u8]),
    Blob(&'a [u8]),
}

/// Append one field to a key buffer.
pub fn put_field(out: &mut Vec<u8>, field: FieldRef<'_>) {
    match field {
        FieldRef::Null => out.push(TAG_NULL),
        FieldRef::Integer(value) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&value.to_be_bytes());
        }
        FieldRef::Real(value) => {
            out.push(TAG_REAL);
            out.extend_from_slice(&value.to_bits().to_be_bytes());
        }
        FieldRef::Text(bytes) | FieldRef::Blob(bytes) => {
            out.push(if matches!(field, FieldRef::Text(_)) { TAG_TEXT } else { TAG_BLOB });
            put_varint(out, bytes.len() as u64);
            out.extend_from_slice(bytes);
        }
    }
}

/// Serialize a whole key.
pub fn encode_key(fields: &[FieldRef<'_>]) -> Vec<u8> {
    let mut out = Vec::new();
    for &field in fields {
        put_field(&mut out, field);
    }
    out
}

/// Cursor over a serialized key.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_slice(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn read_varint(&mut self) -> Option<u64> {
        let (value, n) = get_varint(&self.data[self.pos..])?;
        self.pos += n;
        Some(value)
    }

    /// Decode the next field; `None` on truncated or unknown input.
    pub fn read_field(&mut self) -> Option<FieldRef<'a>> {
        let tag = *self.data.get(self.pos)?;
        self.pos += 1;
        match tag {
            TAG_NULL => Some(FieldRef::Null),
            TAG_INTEGER => {
                let raw: [u8; 8] = self.read_slice(8)?.try_into().ok()?;
                Some(FieldRef::Integer(i64::from_be_bytes(raw)))
            }
            TAG_REAL => {
                let raw: [u8; 8] = self.read_slice(8)?.try_into().ok()?;
                Some(FieldRef::Real(f64::from_bits(u64::from_be_bytes(raw))))
            }
            TAG_TEXT | TAG_BLOB => {
                let len = self.read_varint()?;
                let bytes = self.read_slice(len as usize)?;
                Some(if tag == TAG_TEXT { FieldRef::Text(bytes) } else { FieldRef::Blob(bytes) })
            }
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum DecodedField {
    Null,
    Integer(i64),
    Real(f64),
    Bytes { blob: bool, start: u32, len: u32 },
}

/// Reusable scratch holding one decoded key.
///
/// Populated from the right-hand record on each comparison and reused by
/// the tournament tree when the right side has not changed. Decode errors
/// stick in `err` for the caller to surface.
#[derive(Debug)]
pub struct UnpackedRecord {
    fields: Vec<DecodedField>,
    bytes: Vec<u8>,
    limit: usize,
    pub err: Option<CodecError>,
}

impl UnpackedRecord {
    pub fn new(limit: usize) -> Self {
        Self { fields: Vec::with_capacity(limit), bytes: Vec::new(), limit, err: None }
    }

    /// Number of key fields decoded by the next `unpack`.
    pub fn field_limit(&self) -> usize {
        self.limit
    }

    pub fn set_field_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Fields decoded by the last `unpack`.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_null(&self) -> bool {
        self.fields.iter().any(|f| matches!(f, DecodedField::Null))
    }

    pub fn field(&self, i: usize) -> FieldRef<'_> {
        match self.fields[i] {
            DecodedField::Null => FieldRef::Null,
            DecodedField::Integer(value) => FieldRef::Integer(value),
            DecodedField::Real(value) => FieldRef::Real(value),
            DecodedField::Bytes { blob, start, len } => {
                let payload = &self.bytes[start as usize..(start + len) as usize];
                if blob { FieldRef::Blob(payload) } else { FieldRef::Text(payload) }
            }
        }
    }

    /// Decode up to the field limit from `record`, replacing the previous
    /// contents. Truncated input sets the sticky error.
    pub fn unpack(&mut self, record: &[u8]) {
        self.fields.clear();
        self.bytes.clear();
        let mut decoder = Decoder::new(record);
        for _ in 0..self.limit {
            if decoder.remaining() == 0 {
                break;
            }
            let Some(field) = decoder.read_field() else {
                self.err.get_or_insert(CodecError::Corrupt);
                return;
            };
            let decoded = match field {
                FieldRef::Null => DecodedField::Null,
                FieldRef::Integer(value) => DecodedField::Integer(value),
                FieldRef::Real(value) => DecodedField::Real(value),
                FieldRef::Text(payload) | FieldRef::Blob(payload) => {
                    let start = self.bytes.len() as u32;
                    self.bytes.extend_from_slice(payload);
                    DecodedField::Bytes {
                        blob: matches!(field, FieldRef::Blob(_)),
                        start,
                        len: payload.len() as u32,
                    }
                }
            };
            self.fields.push(decoded);
        }
    }
}

#[inline]
fn type_rank(field: FieldRef<'_>) -> u8 {
    match field {
        FieldRef::Null => 0,
        FieldRef::Integer(_) | FieldRef::Real(_) => 1,
        FieldRef::Text(_) => 2,
        FieldRef::Blob(_) => 3,
    }
}

#[inline]
fn cmp_f64_total(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

/// Total order over key fields.
pub fn compare_fields(left: FieldRef<'_>, right: FieldRef<'_>) -> Ordering {
    let rank = type_rank(left).cmp(&type_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }
    match (left, right) {
        (FieldRef::Integer(l), FieldRef::Integer(r)) => l.cmp(&r),
        (FieldRef::Integer(l), FieldRef::Real(r)) => cmp_f64_total(l as f64, r),
        (FieldRef::Real(l), FieldRef::Integer(r)) => cmp_f64_total(l, r as f64),
        (FieldRef::Real(l), FieldRef::Real(r)) => cmp_f64_total(l, r),
        (FieldRef::Text(l), FieldRef::Text(r)) => l.cmp(r),
        (FieldRef::Blob(l), FieldRef::Blob(r)) => l.cmp(r),
        _ => Ordering::Equal,
    }
}

/// Host-supplied key comparison used by the sorter.
pub trait KeyCompare: Send + Sync {
    /// Number of key fields this comparator considers.
    fn fields(&self) -> usize;

    /// Compare two serialized keys. When `right` is given the scratch is
    /// repopulated from it first; when `None`, the scratch's current
    /// contents stand in for the right-hand key.
    fn compare(&self, left: &[u8], right: Option<&[u8]>, scratch: &mut UnpackedRecord)
    -> Ordering;
}

/// The crate's own key format: compares the leading `n_fields` fields of
/// records produced by [`encode_key`].
#[derive(Clone, Copy, Debug)]
pub struct RecordCompare {
    n_fields: usize,
}

impl RecordCompare {
    pub fn new(n_fields: usize) -> Self {
        Self { n_fields }
    }
}

impl KeyCompare for RecordCompare {
    fn fields(&self) -> usize {
        self.n_fields
    }

    fn compare(
        &self,
        left: &[u8],
        right: Option<&[u8]>,
        scratch: &mut UnpackedRecord,
    ) -> Ordering {
        if let Some(right) = right {
            scratch.unpack(right);
        }
        let mut decoder = Decoder::new(left);
        for i in 0..scratch.len() {
            let Some(field) = decoder.read_field() else {
                scratch.err.get_or_insert(CodecError::Corrupt);
                return Ordering::Equal;
            };
            let ord = compare_fields(field, scratch.field(i));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
