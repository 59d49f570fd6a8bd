use crate::schema::Index;
use byteorder::{BigEndian, WriteBytesExt};
use serde_json::Value;

/// Byte layout of every index key:
///
/// ```text
/// "index" 0x01 collection 0x01 index_name 0x01 field1 0x01 value1 ... 0x00 doc_id
/// ```
///
/// `0x01` separates components and `0x00` only ever precedes the docID, so a
/// proper prefix of fields is a byte prefix of the full key and the trailing
/// docID is recovered by splitting on the single `0x00`. Encoded components
/// are escaped so they never contain either byte.
const NAMESPACE: &[u8] = b"index";
const COMPONENT_SEP: u8 = 0x01;
const ID_SEP: u8 = 0x00;
const ESCAPE: u8 = 0x02;

/// Key prefix covering the supplied leading field values of an index; no
/// docID suffix, so it matches every entry that extends it.
pub fn seek_prefix(collection: &str, index: &Index, values: &[Value]) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(NAMESPACE);
    push_component(&mut key, collection.as_bytes());
    push_component(&mut key, index.name.as_bytes());
    for (field, value) in index.fields.iter().zip(values) {
        push_component(&mut key, field.as_bytes());
        push_component(&mut key, &encode_value(value));
    }
    key
}

/// The unique key of one document's entry in an index: the full field-value
/// prefix plus the docID suffix.
pub fn full_key(collection: &str, index: &Index, values: &[Value], doc_id: &str) -> Vec<u8> {
    let mut key = seek_prefix(collection, index, values);
    key.push(ID_SEP);
    key.extend_from_slice(&escape(doc_id.as_bytes()));
    key
}

/// A closed variant of [`seek_prefix`] for exact prefix scans: the trailing
/// delimiter pins the last supplied component, so `x@y` cannot match entries
/// for `x@y2` and index `age` cannot match entries of index `age2`.
pub fn scan_prefix(collection: &str, index: &Index, values: &[Value]) -> Vec<u8> {
    let mut key = seek_prefix(collection, index, values);
    if values.len() >= index.fields.len() {
        key.push(ID_SEP);
    } else {
        key.push(COMPONENT_SEP);
    }
    key
}

/// Recover the trailing docID from a full index key.
pub fn doc_id_from_key(key: &[u8]) -> Option<String> {
    let at = key.iter().position(|&b| b == ID_SEP)?;
    String::from_utf8(unescape(&key[at + 1..])).ok()
}

fn push_component(key: &mut Vec<u8>, component: &[u8]) {
    key.push(COMPONENT_SEP);
    key.extend_from_slice(&escape(component));
}

/// Canonical sortable byte form of a field value: numbers through an
/// order-preserving transform, booleans as `0`/`1`, strings raw, null empty;
/// arrays and objects fall back to their JSON text.
fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => Vec::new(),
        Value::Bool(false) => b"0".to_vec(),
        Value::Bool(true) => b"1".to_vec(),
        Value::Number(n) => encode_number(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}

/// Fixed-width hex of the order-preserving `f64 -> u64` transform, written
/// big-endian so the hex digits compare in numeric order.
fn encode_number(number: f64) -> Vec<u8> {
    let bits = number.to_bits();
    let sortable = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    let mut raw = Vec::with_capacity(8);
    raw.write_u64::<BigEndian>(sortable)
        .expect("writing to a Vec cannot fail");
    let mut hex = Vec::with_capacity(16);
    for byte in raw {
        hex.push(HEX[(byte >> 4) as usize]);
        hex.push(HEX[(byte & 0x0f) as usize]);
    }
    hex
}

const HEX: [u8; 16] = *b"0123456789abcdef";

/// Escape `0x00`/`0x01`/`0x02` so encoded components never collide with the
/// key delimiters. Injective, and order-preserving among the escaped bytes.
fn escape(raw: &[u8]) -> Vec<u8> {
    if !raw.iter().any(|&b| b <= ESCAPE) {
        return raw.to_vec();
    }
    let mut escaped = Vec::with_capacity(raw.len() + 2);
    for &byte in raw {
        match byte {
            0x00 => escaped.extend_from_slice(&[ESCAPE, b'a']),
            0x01 => escaped.extend_from_slice(&[ESCAPE, b'b']),
            0x02 => escaped.extend_from_slice(&[ESCAPE, b'c']),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape(escaped: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter();
    while let Some(&byte) = bytes.next() {
        if byte != ESCAPE {
            raw.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'a') => raw.push(0x00),
            Some(b'b') => raw.push(0x01),
            Some(b'c') => raw.push(0x02),
            Some(&other) => raw.push(other),
            None => break,
        }
    }
    raw
}
