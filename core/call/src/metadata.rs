// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Metadata elements, validation, and the well-known header names the
//! call surface interprets.

// Standard library imports
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

// Third-party crates
use bytes::Bytes;
use parking_lot::Mutex;

/// Trailing status code.
pub const GRPC_STATUS: &str = "grpc-status";
/// Trailing status description.
pub const GRPC_MESSAGE: &str = "grpc-message";
/// Message-level compression of the stream being received.
pub const GRPC_ENCODING: &str = "grpc-encoding";
/// Stream-level compression of the stream being received.
pub const CONTENT_ENCODING: &str = "content-encoding";
/// Message-level algorithms the peer accepts.
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
/// Stream-level algorithms the peer accepts.
pub const ACCEPT_ENCODING: &str = "accept-encoding";
/// Request to the outgoing compression filter, consumed before the wire.
pub const GRPC_INTERNAL_ENCODING_REQUEST: &str = "grpc-internal-encoding-request";
/// Request method path.
pub const PATH: &str = ":path";

/// A single metadata element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadatum {
    pub key: String,
    pub value: Bytes,
}

impl Metadatum {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Metadatum {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The value as UTF-8, with invalid bytes replaced.
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Whether a key names a binary-valued header.
pub fn is_binary_key(key: &str) -> bool {
    key.ends_with("-bin")
}

/// Header key syntax: nonempty, lowercase alphanumeric plus `-`, `_`,
/// `.`, with an alphanumeric first character.
pub fn validate_key(key: &str) -> bool {
    let mut bytes = key.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_lowercase() || b.is_ascii_digit() => {}
        _ => return false,
    }
    key.bytes().all(|b| {
        b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_' || b == b'.'
    })
}

/// Non-binary header values must be printable ASCII.
pub fn validate_nonbin_value(value: &[u8]) -> bool {
    value.iter().all(|b| (0x20..=0x7e).contains(b))
}

/// An ordered, duplicate-tolerant collection of metadata elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataMap {
    entries: Vec<Metadatum>,
}

impl MetadataMap {
    pub fn new() -> Self {
        MetadataMap::default()
    }

    pub fn push(&mut self, md: Metadatum) {
        self.entries.push(md);
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.push(Metadatum::new(key, value));
    }

    /// Prepend an element, keeping it ahead of application metadata.
    pub fn push_front(&mut self, md: Metadatum) {
        self.entries.insert(0, md);
    }

    pub fn get_first(&self, key: &str) -> Option<&Metadatum> {
        self.entries.iter().find(|m| m.key == key)
    }

    /// Remove and return the first element with the given key.
    pub fn remove_first(&mut self, key: &str) -> Option<Metadatum> {
        let idx = self.entries.iter().position(|m| m.key == key)?;
        Some(self.entries.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metadatum> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drain all elements, leaving the map empty.
    pub fn take(&mut self) -> Vec<Metadatum> {
        std::mem::take(&mut self.entries)
    }
}

impl Extend<Metadatum> for MetadataMap {
    fn extend<T: IntoIterator<Item = Metadatum>>(&mut self, iter: T) {
        self.entries.extend(iter);
    }
}

impl FromIterator<Metadatum> for MetadataMap {
    fn from_iter<T: IntoIterator<Item = Metadatum>>(iter: T) -> Self {
        MetadataMap {
            entries: Vec::from_iter(iter),
        }
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for MetadataMap {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| Metadatum::new(k, v.as_bytes().to_vec()))
            .collect()
    }
}

/// One of the four per-call metadata batches. The deadline rides with
/// initial metadata on the wire.
#[derive(Debug, Default)]
pub struct MetadataBatch {
    pub list: MetadataMap,
    pub deadline: Option<Instant>,
}

impl MetadataBatch {
    pub fn clear(&mut self) {
        self.list.clear();
        self.deadline = None;
    }
}

/// Memoization of values decoded from header bytes, so that repeated
/// identical headers are parsed once.
#[derive(Debug, Default)]
pub(crate) struct ValueCache<T> {
    map: Mutex<HashMap<Bytes, T>>,
    parses: AtomicUsize,
}

impl<T: Clone> ValueCache<T> {
    pub(crate) fn new() -> Self {
        ValueCache {
            map: Mutex::new(HashMap::new()),
            parses: AtomicUsize::new(0),
        }
    }

    pub(crate) fn get_or_parse(&self, value: &Bytes, parse: impl FnOnce() -> T) -> T {
        let mut map = self.map.lock();
        if let Some(cached) = map.get(value) {
            return cached.clone();
        }
        self.parses.fetch_add(1, Ordering::Relaxed);
        let parsed = parse();
        map.insert(value.clone(), parsed.clone());
        parsed
    }

    /// Number of cache misses, i.e. actual parses performed.
    pub(crate) fn parse_count(&self) -> usize {
        self.parses.load(Ordering::Relaxed)
    }
}
