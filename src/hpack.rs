//! HPACK: Header Compression for HTTP/2 (RFC 7541)
//!
//! Thin wrapper around `fluke-hpack` providing the [`H2Header`] and
//! [`HeaderBlock`] types and the per-connection decoder/encoder pair.
//! Each side of a connection owns exactly one of each: the decoder lives in
//! the frame reader, the encoder in the single frame writer, so header
//! blocks are compressed in the same order they hit the wire.

use crate::error::{Error, Result};
use crate::settings::DEFAULT_HEADER_TABLE_SIZE;

/// Per-field overhead counted by SETTINGS_MAX_HEADER_LIST_SIZE (RFC 7540 Section 6.5.2).
const FIELD_OVERHEAD: usize = 32;

/// A decoded HTTP/2 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2Header {
    pub name: String,
    pub value: String,
}

impl H2Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered list of header fields carried by one HEADERS (+ CONTINUATION) block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    fields: Vec<H2Header>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(H2Header::new(name, value));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// First value for `name` (exact, lowercase match as HTTP/2 requires).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, H2Header> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn as_slice(&self) -> &[H2Header] {
        &self.fields
    }

    /// Uncompressed size as SETTINGS_MAX_HEADER_LIST_SIZE measures it.
    pub fn list_size(&self) -> usize {
        self.fields
            .iter()
            .map(|h| h.name.len() + h.value.len() + FIELD_OVERHEAD)
            .sum()
    }
}

impl From<Vec<H2Header>> for HeaderBlock {
    fn from(fields: Vec<H2Header>) -> Self {
        Self { fields }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderBlock {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(name, value)| H2Header::new(name, value))
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a HeaderBlock {
    type Item = &'a H2Header;
    type IntoIter = std::slice::Iter<'a, H2Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

/// HPACK decoder for HTTP/2 header blocks.
/// Wraps `fluke_hpack::Decoder` which maintains dynamic table state per-connection.
pub struct HpackDecoder {
    inner: fluke_hpack::Decoder<'static>,
}

impl std::fmt::Debug for HpackDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackDecoder").finish()
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self {
            inner: fluke_hpack::Decoder::new(),
        }
    }

    /// Reject dynamic table size updates above our advertised
    /// SETTINGS_HEADER_TABLE_SIZE.
    pub fn set_max_table_size(&mut self, size: u32) {
        self.inner.set_max_allowed_table_size(size as usize);
    }

    /// Decode an HPACK-encoded header block.
    ///
    /// A decode failure leaves the shared table state undefined, so callers
    /// must treat it as a connection error (COMPRESSION_ERROR).
    pub fn decode(&mut self, data: &[u8]) -> Result<HeaderBlock> {
        let pairs = self
            .inner
            .decode(data)
            .map_err(|e| Error::protocol(format!("HPACK decode error: {:?}", e)))?;
        Ok(pairs
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect())
    }
}

/// HPACK encoder for HTTP/2 header blocks.
/// Wraps `fluke_hpack::Encoder` which maintains dynamic table state per-connection.
pub struct HpackEncoder {
    inner: fluke_hpack::Encoder<'static>,
    table_size: usize,
    /// Smallest and latest table size since the last block; both must be
    /// signalled at the start of the next one (RFC 7541 Section 4.2).
    pending_resize: Option<(usize, usize)>,
}

impl std::fmt::Debug for HpackEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackEncoder").finish()
    }
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self {
            inner: fluke_hpack::Encoder::new(),
            table_size: DEFAULT_HEADER_TABLE_SIZE as usize,
            pending_resize: None,
        }
    }

    /// Follow the peer's SETTINGS_HEADER_TABLE_SIZE. The table never grows
    /// past the protocol default.
    pub fn set_max_table_size(&mut self, peer_size: u32) {
        let target = (peer_size as usize).min(DEFAULT_HEADER_TABLE_SIZE as usize);
        let current = self.pending_resize.map_or(self.table_size, |(_, latest)| latest);
        if target == current {
            return;
        }
        let smallest = self.pending_resize.map_or(target, |(smallest, _)| smallest.min(target));
        self.pending_resize = Some((smallest, target));
    }

    /// Dynamic table size update: `001` pattern with a 5-bit prefix integer.
    fn signal_table_size(&mut self, size: usize, block: &mut Vec<u8>) {
        let mut update = fluke_hpack::encoder::encode_integer(size, 5);
        update[0] |= 0x20;
        block.extend_from_slice(&update);
        self.inner.set_max_table_size(size);
        self.table_size = size;
    }

    /// Encode headers into an HPACK header block.
    pub fn encode(&mut self, headers: &HeaderBlock) -> Vec<u8> {
        let mut block = Vec::new();
        // A block may not end with a size update, so an empty one defers it.
        let pending = if headers.is_empty() { None } else { self.pending_resize.take() };
        if let Some((smallest, latest)) = pending {
            if smallest < latest {
                self.signal_table_size(smallest, &mut block);
            }
            self.signal_table_size(latest, &mut block);
        }
        let pairs: Vec<(&[u8], &[u8])> = headers
            .iter()
            .map(|h| (h.name.as_bytes(), h.value.as_bytes()))
            .collect();
        block.extend(self.inner.encode(pairs));
        block
    }
}

// ============================================================================
// Tests
// ============================================================================
