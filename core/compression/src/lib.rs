// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Compression algorithm taxonomy shared by the call surface and the
//! filters below it.
//!
//! Two independent dimensions exist on the wire: *message* compression
//! (`grpc-encoding`) and *stream* compression (`content-encoding`). The
//! application-visible [`CompressionAlgorithm`] is the union of both; a
//! message and a stream algorithm can never be active at the same time.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Message-level compression, negotiated via `grpc-encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageCompression {
    #[default]
    None = 0,
    Deflate = 1,
    Gzip = 2,
}

impl MessageCompression {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "identity" => Some(MessageCompression::None),
            "deflate" => Some(MessageCompression::Deflate),
            "gzip" => Some(MessageCompression::Gzip),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageCompression::None => "identity",
            MessageCompression::Deflate => "deflate",
            MessageCompression::Gzip => "gzip",
        }
    }
}

/// Stream-level compression, negotiated via `content-encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCompression {
    #[default]
    None = 0,
    Gzip = 1,
}

impl StreamCompression {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "identity" => Some(StreamCompression::None),
            "gzip" => Some(StreamCompression::Gzip),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamCompression::None => "identity",
            StreamCompression::Gzip => "gzip",
        }
    }
}

/// The application-visible algorithm space: the union of message and
/// stream compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionAlgorithm {
    #[default]
    Identity = 0,
    MessageDeflate = 1,
    MessageGzip = 2,
    StreamGzip = 3,
}

impl CompressionAlgorithm {
    pub const COUNT: usize = 4;

    /// Combine a (message, stream) pair into a single algorithm.
    ///
    /// Returns `None` when both dimensions are compressed at once; that
    /// combination is not expressible to the application.
    pub fn from_parts(
        message: MessageCompression,
        stream: StreamCompression,
    ) -> Option<Self> {
        match (message, stream) {
            (MessageCompression::None, StreamCompression::None) => {
                Some(CompressionAlgorithm::Identity)
            }
            (MessageCompression::Deflate, StreamCompression::None) => {
                Some(CompressionAlgorithm::MessageDeflate)
            }
            (MessageCompression::Gzip, StreamCompression::None) => {
                Some(CompressionAlgorithm::MessageGzip)
            }
            (MessageCompression::None, StreamCompression::Gzip) => {
                Some(CompressionAlgorithm::StreamGzip)
            }
            _ => None,
        }
    }

    /// Split back into the (message, stream) pair.
    pub fn into_parts(self) -> (MessageCompression, StreamCompression) {
        match self {
            CompressionAlgorithm::Identity => {
                (MessageCompression::None, StreamCompression::None)
            }
            CompressionAlgorithm::MessageDeflate => {
                (MessageCompression::Deflate, StreamCompression::None)
            }
            CompressionAlgorithm::MessageGzip => {
                (MessageCompression::Gzip, StreamCompression::None)
            }
            CompressionAlgorithm::StreamGzip => {
                (MessageCompression::None, StreamCompression::Gzip)
            }
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "identity" => Some(CompressionAlgorithm::Identity),
            "deflate" => Some(CompressionAlgorithm::MessageDeflate),
            "gzip" => Some(CompressionAlgorithm::MessageGzip),
            "stream/gzip" => Some(CompressionAlgorithm::StreamGzip),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Identity => "identity",
            CompressionAlgorithm::MessageDeflate => "deflate",
            CompressionAlgorithm::MessageGzip => "gzip",
            CompressionAlgorithm::StreamGzip => "stream/gzip",
        }
    }

    fn from_index(idx: u32) -> Option<Self> {
        match idx {
            0 => Some(CompressionAlgorithm::Identity),
            1 => Some(CompressionAlgorithm::MessageDeflate),
            2 => Some(CompressionAlgorithm::MessageGzip),
            3 => Some(CompressionAlgorithm::StreamGzip),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compression effort requested by the application; resolved to a concrete
/// algorithm against what the peer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    #[default]
    None = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

/// Bitset over [`CompressionAlgorithm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingSet(u32);

impl EncodingSet {
    /// The empty set. Note that a set decoded from the wire always
    /// contains [`CompressionAlgorithm::Identity`].
    pub const fn empty() -> Self {
        EncodingSet(0)
    }

    pub const fn identity_only() -> Self {
        EncodingSet(1 << CompressionAlgorithm::Identity as u32)
    }

    /// The full algorithm space.
    pub fn all() -> Self {
        EncodingSet((1 << CompressionAlgorithm::COUNT as u32) - 1)
    }

    pub fn insert(&mut self, algorithm: CompressionAlgorithm) {
        self.0 |= 1 << algorithm as u32;
    }

    pub fn remove(&mut self, algorithm: CompressionAlgorithm) {
        self.0 &= !(1 << algorithm as u32);
    }

    pub fn contains(&self, algorithm: CompressionAlgorithm) -> bool {
        self.0 & (1 << algorithm as u32) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: EncodingSet) -> EncodingSet {
        EncodingSet(self.0 | other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = CompressionAlgorithm> + '_ {
        let bits = self.0;
        (0..CompressionAlgorithm::COUNT as u32)
            .filter(move |i| bits & (1 << i) != 0)
            .filter_map(CompressionAlgorithm::from_index)
    }

    pub fn to_bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        EncodingSet(bits & (Self::all().0))
    }

    /// Format as a comma-separated accept-encoding value.
    pub fn to_header(&self) -> String {
        let names: Vec<&str> = self.iter().map(|a| a.name()).collect();
        names.join(",")
    }

    /// Parse a comma-separated accept-encoding value over the combined
    /// algorithm namespace. Returns the set and the entries that did not
    /// name a known algorithm; whitespace around entries is tolerated.
    pub fn parse_header(value: &str) -> (EncodingSet, Vec<String>) {
        let mut set = EncodingSet::empty();
        let mut unknown = Vec::new();
        for entry in split_without_space(value) {
            match CompressionAlgorithm::parse(entry) {
                Some(algorithm) => set.insert(algorithm),
                None => unknown.push(entry.to_string()),
            }
        }
        (set, unknown)
    }
}

impl Default for EncodingSet {
    fn default() -> Self {
        EncodingSet::identity_only()
    }
}

impl FromIterator<CompressionAlgorithm> for EncodingSet {
    fn from_iter<T: IntoIterator<Item = CompressionAlgorithm>>(iter: T) -> Self {
        let mut set = EncodingSet::empty();
        for a in iter {
            set.insert(a);
        }
        set
    }
}

/// Split a comma-separated header value, trimming surrounding whitespace
/// from each entry and skipping empty ones.
pub fn split_without_space(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Ranking of the compressed algorithms in increasing order of achieved
/// compression. Used to translate a level into a concrete choice.
const ALGORITHM_RANKING: [CompressionAlgorithm; 3] = [
    CompressionAlgorithm::StreamGzip,
    CompressionAlgorithm::MessageGzip,
    CompressionAlgorithm::MessageDeflate,
];

/// Resolve a compression level into the best algorithm the peer accepts.
///
/// `CompressionLevel::None` always yields identity. Otherwise the accepted
/// compressed algorithms are ranked by strength and the level selects a
/// position within that ranking; when nothing compressed is accepted the
/// result is identity.
pub fn algorithm_for_level(
    level: CompressionLevel,
    accepted: EncodingSet,
) -> CompressionAlgorithm {
    if level == CompressionLevel::None {
        return CompressionAlgorithm::Identity;
    }
    let sorted: Vec<CompressionAlgorithm> = ALGORITHM_RANKING
        .iter()
        .copied()
        .filter(|a| accepted.contains(*a))
        .collect();
    if sorted.is_empty() {
        return CompressionAlgorithm::Identity;
    }
    match level {
        CompressionLevel::None => CompressionAlgorithm::Identity,
        CompressionLevel::Low => sorted[0],
        CompressionLevel::Medium => sorted[sorted.len() / 2],
        CompressionLevel::High => sorted[sorted.len() - 1],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(
            MessageCompression::parse("gzip"),
            Some(MessageCompression::Gzip)
        );
        assert_eq!(
            MessageCompression::parse("identity"),
            Some(MessageCompression::None)
        );
        assert_eq!(MessageCompression::parse("zstd"), None);
        assert_eq!(
            StreamCompression::parse("gzip"),
            Some(StreamCompression::Gzip)
        );
        assert_eq!(StreamCompression::parse("deflate"), None);
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(
            CompressionAlgorithm::from_parts(
                MessageCompression::Gzip,
                StreamCompression::None
            ),
            Some(CompressionAlgorithm::MessageGzip)
        );
        assert_eq!(
            CompressionAlgorithm::from_parts(
                MessageCompression::Gzip,
                StreamCompression::Gzip
            ),
            None
        );
        for algorithm in EncodingSet::all().iter() {
            let (m, s) = algorithm.into_parts();
            assert_eq!(CompressionAlgorithm::from_parts(m, s), Some(algorithm));
        }
    }

    #[test]
    fn test_encoding_set_roundtrip() {
        let mut set = EncodingSet::identity_only();
        set.insert(CompressionAlgorithm::MessageGzip);
        set.insert(CompressionAlgorithm::StreamGzip);

        let header = set.to_header();
        let (parsed, unknown) = EncodingSet::parse_header(&header);
        assert!(unknown.is_empty());
        assert_eq!(parsed, set);
    }

    #[test]
    fn test_parse_header_whitespace_and_unknown() {
        let (set, unknown) = EncodingSet::parse_header("identity , gzip, br ,,");
        assert!(set.contains(CompressionAlgorithm::Identity));
        assert!(set.contains(CompressionAlgorithm::MessageGzip));
        assert_eq!(unknown, vec!["br".to_string()]);
    }

    #[test]
    fn test_algorithm_for_level() {
        let mut accepted = EncodingSet::identity_only();
        accepted.insert(CompressionAlgorithm::MessageGzip);

        assert_eq!(
            algorithm_for_level(CompressionLevel::None, accepted),
            CompressionAlgorithm::Identity
        );
        assert_eq!(
            algorithm_for_level(CompressionLevel::High, accepted),
            CompressionAlgorithm::MessageGzip
        );

        accepted.insert(CompressionAlgorithm::MessageDeflate);
        accepted.insert(CompressionAlgorithm::StreamGzip);
        assert_eq!(
            algorithm_for_level(CompressionLevel::Low, accepted),
            CompressionAlgorithm::StreamGzip
        );
        assert_eq!(
            algorithm_for_level(CompressionLevel::High, accepted),
            CompressionAlgorithm::MessageDeflate
        );
    }

    #[test]
    fn test_level_with_nothing_accepted() {
        assert_eq!(
            algorithm_for_level(CompressionLevel::High, EncodingSet::identity_only()),
            CompressionAlgorithm::Identity
        );
    }
}
