//! Key derivation and record identity.
//!
//! Records without a caller supplied key get a deterministic one hashed from
//! their canonical JSON form. Records handed out by a collection carry a
//! [`RecordRef`], an opaque surrogate id that maps back to the record's key
//! for as long as the key stays in the collection's view.

use crate::{error::Result, Error, Key};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Derive a key from a record value.
///
/// Rolling 31-multiplier hash over the UTF-16 units of the compact JSON
/// form, wrapped to 32 bits and printed as unsigned base 36. Not
/// cryptographic: distinct records can collide, and the key depends on
/// field serialization order (sorted, with serde_json's default map).
pub fn generate_key(value: &Value) -> Key {
    let canonical = value.to_string();
    let mut hash: i32 = 0;
    for unit in canonical.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(unit));
    }
    to_base36(hash as u32)
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Opaque handle to a record currently in a collection's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef(u64);

impl std::fmt::Display for RecordRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Two-way index between record refs and keys.
///
/// Refs are never reused. Once a key leaves the view its ref is dropped, and
/// a key that comes back later gets a fresh ref, so a stale ref can never
/// address the new record.
#[derive(Debug, Default)]
pub struct KeyResolver {
    next_ref: u64,
    by_ref: HashMap<RecordRef, Key>,
    by_key: HashMap<Key, RecordRef>,
}

impl KeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ref for `key`, assigning one if the key is not tracked yet.
    pub fn track(&mut self, key: &str) -> RecordRef {
        if let Some(existing) = self.by_key.get(key) {
            return *existing;
        }
        self.next_ref += 1;
        let record_ref = RecordRef(self.next_ref);
        self.by_ref.insert(record_ref, key.to_string());
        self.by_key.insert(key.to_string(), record_ref);
        record_ref
    }

    /// Key behind a ref.
    pub fn resolve(&self, record_ref: RecordRef) -> Result<Key> {
        self.by_ref
            .get(&record_ref)
            .cloned()
            .ok_or(Error::NotTracked(record_ref))
    }

    /// Current ref of a key, if tracked.
    pub fn ref_for(&self, key: &str) -> Option<RecordRef> {
        self.by_key.get(key).copied()
    }

    /// Forget a key and its ref.
    pub fn invalidate(&mut self, key: &str) {
        if let Some(record_ref) = self.by_key.remove(key) {
            self.by_ref.remove(&record_ref);
        }
    }

    /// Drop every key for which `keep` returns false.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        let by_ref = &mut self.by_ref;
        self.by_key.retain(|key, record_ref| {
            let kept = keep(key);
            if !kept {
                by_ref.remove(record_ref);
            }
            kept
        });
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
