//! HTTP/2 frame codec.
//!
//! Sans-I/O framing layer underneath the connection engine: [`H2Codec`]
//! turns raw bytes into [`H2Event`]s, and the `create_*` builders produce
//! complete wire frames. Stream bookkeeping, flow control and HPACK all
//! live above this module; the codec only enforces framing rules
//! (frame sizes, payload lengths, CONTINUATION sequencing, preface).
//!
//! Reference: RFC 7540 (HTTP/2)

use crate::error::{Error, Result};

/// HTTP/2 frame types (RFC 7540 Section 6)
pub mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

/// HTTP/2 frame flags
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 SETTINGS identifiers (RFC 7540 Section 6.5.2)
pub mod settings_id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// HTTP/2 error codes (RFC 7540 Section 7)
pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const SETTINGS_TIMEOUT: u32 = 0x4;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;
    pub const CONNECT_ERROR: u32 = 0xa;
    pub const ENHANCE_YOUR_CALM: u32 = 0xb;
    pub const INADEQUATE_SECURITY: u32 = 0xc;
    pub const HTTP_1_1_REQUIRED: u32 = 0xd;
}

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 9;

/// A parsed HTTP/2 frame header (9 bytes)
#[derive(Debug, Clone)]
pub struct H2FrameHeader {
    pub length: u32,      // 24 bits
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,   // 31 bits (high bit reserved)
}

impl H2FrameHeader {
    /// Parse a 9-byte frame header
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return None;
        }

        let length = ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | (data[2] as u32);
        let frame_type = data[3];
        let flags = data[4];
        let stream_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & 0x7FFF_FFFF;

        Some(Self {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    /// Total frame size including header
    pub fn total_size(&self) -> usize {
        FRAME_HEADER_LEN + self.length as usize
    }

    /// Check if END_STREAM flag is set
    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    /// Check if END_HEADERS flag is set
    pub fn is_end_headers(&self) -> bool {
        self.flags & flags::END_HEADERS != 0
    }

    /// Check if ACK flag is set (SETTINGS and PING share bit 0x1)
    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }
}

/// Events emitted by the H2 codec when parsing frames
#[derive(Debug)]
pub enum H2Event {
    /// Complete header block (HEADERS plus any CONTINUATION frames)
    Headers {
        stream_id: u32,
        header_block: Vec<u8>,  // HPACK-encoded headers
        end_stream: bool,
    },
    /// Data for a stream. `flow_len` is the full payload length including
    /// padding, which is what flow control counts.
    Data {
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
        flow_len: u32,
    },
    /// Stream was reset (RST_STREAM)
    StreamReset {
        stream_id: u32,
        error_code: u32,
    },
    /// Connection-level GOAWAY
    GoAway {
        last_stream_id: u32,
        error_code: u32,
        debug_data: Vec<u8>,
    },
    /// Settings frame (connection-level)
    Settings {
        ack: bool,
        /// Parsed settings: (identifier, value) pairs. Empty for ACK frames.
        settings: Vec<(u16, u32)>,
    },
    /// Window update
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    /// Ping (connection-level)
    Ping {
        ack: bool,
        data: [u8; 8],
    },
}

/// Incremental HTTP/2 frame parser.
///
/// Feed raw transport bytes to [`process`](Self::process); complete frames
/// come back as events, partial frames stay buffered until the rest arrives.
#[derive(Debug)]
pub struct H2Codec {
    /// Buffer for incomplete frames
    buffer: Vec<u8>,
    /// Connection preface received (for servers)
    preface_received: bool,
    /// Reject input that does not start with the preface
    require_preface: bool,
    /// Largest frame payload we accept (our advertised SETTINGS_MAX_FRAME_SIZE)
    max_frame_size: u32,
    /// Stream ID with pending header block (waiting for CONTINUATION + END_HEADERS)
    pending_headers_stream: Option<u32>,
    /// END_STREAM flag from the HEADERS frame that started the pending header block
    pending_headers_end_stream: bool,
    /// Accumulated header block data across HEADERS + CONTINUATION frames
    pending_header_block: Vec<u8>,
}

/// Maximum accumulated header block size (256 KB).
/// Prevents unbounded memory growth from malicious/buggy CONTINUATION floods.
pub const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// The HTTP/2 connection preface (24 bytes)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Check if data starts with HTTP/2 connection preface (h2c detection)
pub fn is_h2c_preface(data: &[u8]) -> bool {
    data.len() >= CONNECTION_PREFACE.len() && &data[..CONNECTION_PREFACE.len()] == CONNECTION_PREFACE
}

impl Default for H2Codec {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            preface_received: false,
            require_preface: false,
            max_frame_size: crate::settings::DEFAULT_MAX_FRAME_SIZE,
            pending_headers_stream: None,
            pending_headers_end_stream: false,
            pending_header_block: Vec::new(),
        }
    }
}

impl H2Codec {
    /// Codec that strips a leading preface if one shows up, but does not insist on it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec for the server side of a fresh connection: the first 24 bytes
    /// must be the client preface.
    pub fn expecting_preface() -> Self {
        Self {
            require_preface: true,
            ..Self::default()
        }
    }

    pub fn preface_received(&self) -> bool {
        self.preface_received
    }

    /// Mark the preface as already consumed (e.g. by an h2c upgrade path).
    pub fn set_preface_received(&mut self, received: bool) {
        self.preface_received = received;
    }

    /// Raise or lower the accepted frame payload limit.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn is_awaiting_continuation(&self) -> bool {
        self.pending_headers_stream.is_some()
    }

    /// Process incoming data and return parsed events.
    ///
    /// This is the main entry point - feed raw bytes and get back events.
    pub fn process(&mut self, data: &[u8]) -> Result<Vec<H2Event>> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        if !self.preface_received {
            let n = self.buffer.len().min(CONNECTION_PREFACE.len());
            let matches_so_far = self.buffer[..n] == CONNECTION_PREFACE[..n];
            if matches_so_far && n == CONNECTION_PREFACE.len() {
                self.buffer.drain(..CONNECTION_PREFACE.len());
                self.preface_received = true;
            } else if self.require_preface {
                if !matches_so_far {
                    return Err(Error::protocol("Invalid connection preface"));
                }
                // partial preface: wait for the rest
                return Ok(events);
            }
        }

        // Parse frames
        loop {
            let header = match H2FrameHeader::parse(&self.buffer) {
                Some(h) => h,
                None => break,
            };

            if header.length > self.max_frame_size {
                return Err(Error::frame_size(format!(
                    "FRAME_SIZE_ERROR: frame of {} bytes exceeds max {}",
                    header.length, self.max_frame_size
                )));
            }

            // Check if we have the complete frame
            let total_size = header.total_size();
            if self.buffer.len() < total_size {
                break;
            }

            // Split the frame off the front without copying the payload twice
            let remainder = self.buffer.split_off(total_size);
            let mut payload = std::mem::replace(&mut self.buffer, remainder);
            payload.drain(..FRAME_HEADER_LEN);

            if let Some(event) = self.parse_frame(&header, payload)? {
                events.push(event);
            }
        }

        Ok(events)
    }

    /// Parse a single frame and return an event if applicable
    fn parse_frame(&mut self, header: &H2FrameHeader, payload: Vec<u8>) -> Result<Option<H2Event>> {
        if let Some(pending_stream) = self.pending_headers_stream {
            if header.frame_type != frame_type::CONTINUATION {
                return Err(Error::protocol(format!(
                    "Expected CONTINUATION for stream {}, got frame type {}",
                    pending_stream, header.frame_type
                )));
            }
        }

        match header.frame_type {
            frame_type::DATA => {
                require_stream(header, "DATA")?;
                let flow_len = header.length;
                let data = self.extract_data_payload(header, payload)?;
                Ok(Some(H2Event::Data {
                    stream_id: header.stream_id,
                    data,
                    end_stream: header.is_end_stream(),
                    flow_len,
                }))
            }
            frame_type::HEADERS => {
                require_stream(header, "HEADERS")?;
                let header_block = self.extract_headers_payload(header, payload)?;
                if header.is_end_headers() {
                    // Complete header block in a single frame
                    Ok(Some(H2Event::Headers {
                        stream_id: header.stream_id,
                        header_block,
                        end_stream: header.is_end_stream(),
                    }))
                } else {
                    // Headers span multiple frames - accumulate and wait for CONTINUATION
                    if header_block.len() > MAX_HEADER_BLOCK_SIZE {
                        return Err(Error::protocol(format!(
                            "Header block too large ({} bytes, max {})",
                            header_block.len(),
                            MAX_HEADER_BLOCK_SIZE
                        )));
                    }
                    self.pending_headers_stream = Some(header.stream_id);
                    self.pending_headers_end_stream = header.is_end_stream();
                    self.pending_header_block = header_block;
                    Ok(None)
                }
            }
            frame_type::CONTINUATION => {
                let pending_stream = match self.pending_headers_stream {
                    Some(id) => id,
                    None => {
                        return Err(Error::protocol(format!(
                            "Unexpected CONTINUATION frame for stream {}",
                            header.stream_id
                        )))
                    }
                };
                if pending_stream != header.stream_id {
                    return Err(Error::protocol(format!(
                        "CONTINUATION for stream {} but pending headers on stream {}",
                        header.stream_id, pending_stream
                    )));
                }
                // Guard against unbounded header block accumulation
                let new_size = self.pending_header_block.len() + payload.len();
                if new_size > MAX_HEADER_BLOCK_SIZE {
                    self.pending_headers_stream = None;
                    self.pending_header_block.clear();
                    return Err(Error::protocol(format!(
                        "Header block too large ({} bytes, max {})",
                        new_size, MAX_HEADER_BLOCK_SIZE
                    )));
                }
                self.pending_header_block.extend_from_slice(&payload);
                if !header.is_end_headers() {
                    return Ok(None);
                }
                let header_block = std::mem::take(&mut self.pending_header_block);
                let end_stream = self.pending_headers_end_stream;
                self.pending_headers_stream = None;
                self.pending_headers_end_stream = false;
                Ok(Some(H2Event::Headers {
                    stream_id: header.stream_id,
                    header_block,
                    end_stream,
                }))
            }
            frame_type::RST_STREAM => {
                require_stream(header, "RST_STREAM")?;
                if payload.len() != 4 {
                    return Err(Error::frame_size("RST_STREAM frame must be 4 bytes"));
                }
                let error_code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Some(H2Event::StreamReset {
                    stream_id: header.stream_id,
                    error_code,
                }))
            }
            frame_type::SETTINGS => {
                require_connection(header, "SETTINGS")?;
                let ack = header.is_ack();
                if ack && !payload.is_empty() {
                    return Err(Error::frame_size("SETTINGS ACK with payload"));
                }
                if payload.len() % 6 != 0 {
                    return Err(Error::frame_size("SETTINGS payload not a multiple of 6"));
                }
                // Each setting entry is 6 bytes: u16 id + u32 value
                let settings = payload
                    .chunks_exact(6)
                    .map(|entry| {
                        let id = u16::from_be_bytes([entry[0], entry[1]]);
                        let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
                        (id, value)
                    })
                    .collect();
                Ok(Some(H2Event::Settings { ack, settings }))
            }
            frame_type::GOAWAY => {
                require_connection(header, "GOAWAY")?;
                if payload.len() < 8 {
                    return Err(Error::frame_size("GOAWAY frame too short"));
                }
                let last_stream_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
                let error_code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                Ok(Some(H2Event::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data: payload[8..].to_vec(),
                }))
            }
            frame_type::WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(Error::frame_size("WINDOW_UPDATE frame must be 4 bytes"));
                }
                let increment = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
                Ok(Some(H2Event::WindowUpdate {
                    stream_id: header.stream_id,
                    increment,
                }))
            }
            frame_type::PING => {
                require_connection(header, "PING")?;
                if payload.len() != 8 {
                    return Err(Error::frame_size("PING frame must be 8 bytes"));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Ok(Some(H2Event::Ping {
                    ack: header.is_ack(),
                    data,
                }))
            }
            frame_type::PRIORITY => Ok(None),
            frame_type::PUSH_PROMISE => {
                // push is always disabled in our SETTINGS
                Err(Error::protocol(format!(
                    "PUSH_PROMISE on stream {} but push is disabled",
                    header.stream_id
                )))
            }
            // Unknown frame types must be ignored (RFC 7540 Section 4.1)
            _ => Ok(None),
        }
    }

    /// Extract DATA payload, handling PADDED flag.
    /// Takes ownership of the payload Vec to avoid re-copying.
    fn extract_data_payload(&self, header: &H2FrameHeader, mut payload: Vec<u8>) -> Result<Vec<u8>> {
        if header.flags & flags::PADDED == 0 {
            return Ok(payload);
        }
        if payload.is_empty() {
            return Err(Error::protocol("PADDED DATA frame with no payload"));
        }
        let pad_length = payload[0] as usize;
        if pad_length >= payload.len() {
            return Err(Error::protocol("Invalid padding length in DATA frame"));
        }
        // Remove padding from end, then remove pad_length byte from start
        payload.truncate(payload.len() - pad_length);
        payload.remove(0);
        Ok(payload)
    }

    /// Extract HEADERS payload, handling PADDED and PRIORITY flags.
    /// Takes ownership of the payload Vec to avoid re-copying.
    fn extract_headers_payload(&self, header: &H2FrameHeader, mut payload: Vec<u8>) -> Result<Vec<u8>> {
        let mut offset = 0;
        let mut end = payload.len();

        if header.flags & flags::PADDED != 0 {
            if payload.is_empty() {
                return Err(Error::protocol("PADDED HEADERS frame with no payload"));
            }
            let pad_length = payload[0] as usize;
            offset = 1;
            if pad_length > payload.len() - offset {
                return Err(Error::protocol("Invalid padding length in HEADERS frame"));
            }
            end = payload.len() - pad_length;
        }

        if header.flags & flags::PRIORITY != 0 {
            if end - offset < 5 {
                return Err(Error::protocol("PRIORITY HEADERS frame with insufficient data"));
            }
            offset += 5; // Skip stream dependency (4 bytes) + weight (1 byte)
        }

        if offset == 0 && end == payload.len() {
            return Ok(payload);
        }

        payload.truncate(end);
        payload.drain(..offset);
        Ok(payload)
    }

    /// Reset codec state (e.g., after upstream reconnect)
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.preface_received = false;
        self.pending_headers_stream = None;
        self.pending_headers_end_stream = false;
        self.pending_header_block.clear();
    }

    // ------------------------------------------------------------------
    // Frame builders
    // ------------------------------------------------------------------

    /// Write a 9-byte frame header into `frame`.
    fn push_frame_header(frame: &mut Vec<u8>, length: usize, kind: u8, flags_byte: u8, stream_id: u32) {
        let length = length as u32;
        frame.push((length >> 16) as u8);
        frame.push((length >> 8) as u8);
        frame.push(length as u8);
        frame.push(kind);
        frame.push(flags_byte);
        // Stream ID (31 bits, bit 31 is reserved)
        frame.extend_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());
    }

    /// Create a DATA frame. The caller bounds `data` by the peer's max frame size.
    pub fn create_data(stream_id: u32, data: &[u8], end_stream: bool) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + data.len());
        let flags_byte = if end_stream { flags::END_STREAM } else { 0 };
        Self::push_frame_header(&mut frame, data.len(), frame_type::DATA, flags_byte, stream_id);
        frame.extend_from_slice(data);
        frame
    }

    /// Create a HEADERS frame carrying `header_block`, followed by as many
    /// CONTINUATION frames as needed to respect `max_frame_size`.
    pub fn create_headers(stream_id: u32, header_block: &[u8], end_stream: bool, max_frame_size: u32) -> Vec<u8> {
        let max = (max_frame_size as usize).max(1);
        let mut chunks = header_block.chunks(max);
        let first = chunks.next().unwrap_or(&[]);
        let rest: Vec<&[u8]> = chunks.collect();

        let mut flags_byte = 0;
        if end_stream {
            flags_byte |= flags::END_STREAM;
        }
        if rest.is_empty() {
            flags_byte |= flags::END_HEADERS;
        }

        let mut frame = Vec::with_capacity(header_block.len() + FRAME_HEADER_LEN * (rest.len() + 1));
        Self::push_frame_header(&mut frame, first.len(), frame_type::HEADERS, flags_byte, stream_id);
        frame.extend_from_slice(first);
        let last = rest.len().saturating_sub(1);
        for (i, chunk) in rest.iter().enumerate() {
            frame.extend_from_slice(&Self::create_continuation_frame(stream_id, chunk, i == last));
        }
        frame
    }

    /// Create a RST_STREAM frame
    pub fn create_rst_stream(stream_id: u32, error_code: u32) -> Vec<u8> {
        let mut frame = Vec::with_capacity(13);
        Self::push_frame_header(&mut frame, 4, frame_type::RST_STREAM, 0, stream_id);
        frame.extend_from_slice(&error_code.to_be_bytes());
        frame
    }

    /// Create a GOAWAY frame
    pub fn create_goaway(last_stream_id: u32, error_code: u32, debug_data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(17 + debug_data.len());
        Self::push_frame_header(&mut frame, 8 + debug_data.len(), frame_type::GOAWAY, 0, 0);
        frame.extend_from_slice(&(last_stream_id & 0x7FFF_FFFF).to_be_bytes());
        frame.extend_from_slice(&error_code.to_be_bytes());
        frame.extend_from_slice(debug_data);
        frame
    }

    /// Create a SETTINGS frame carrying the given `(identifier, value)` pairs
    pub fn create_settings(settings: &[(u16, u32)]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + settings.len() * 6);
        Self::push_frame_header(&mut frame, settings.len() * 6, frame_type::SETTINGS, 0, 0);
        for (id, value) in settings {
            frame.extend_from_slice(&id.to_be_bytes());
            frame.extend_from_slice(&value.to_be_bytes());
        }
        frame
    }

    /// Create a SETTINGS ACK frame
    pub fn create_settings_ack() -> Vec<u8> {
        vec![
            0, 0, 0,  // Length: 0
            frame_type::SETTINGS,
            flags::ACK,
            0, 0, 0, 0,  // Stream ID: 0
        ]
    }

    /// Create a PING frame, or its acknowledgement when `ack` is set
    pub fn create_ping(data: [u8; 8], ack: bool) -> Vec<u8> {
        let mut frame = Vec::with_capacity(17);
        let flags_byte = if ack { flags::ACK } else { 0 };
        Self::push_frame_header(&mut frame, 8, frame_type::PING, flags_byte, 0);
        frame.extend_from_slice(&data);
        frame
    }

    /// Create a WINDOW_UPDATE frame to replenish flow control window
    /// stream_id=0 updates connection-level window, otherwise stream-level
    pub fn create_window_update(stream_id: u32, increment: u32) -> Vec<u8> {
        let mut frame = Vec::with_capacity(13);
        Self::push_frame_header(&mut frame, 4, frame_type::WINDOW_UPDATE, 0, stream_id);
        frame.extend_from_slice(&(increment & 0x7FFF_FFFF).to_be_bytes());
        frame
    }

    /// Create a CONTINUATION frame to continue a header block
    /// end_headers: true if this is the final frame in the header block sequence
    pub fn create_continuation_frame(stream_id: u32, payload: &[u8], end_headers: bool) -> Vec<u8> {
        let flags_byte = if end_headers { flags::END_HEADERS } else { 0 };
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        Self::push_frame_header(&mut frame, payload.len(), frame_type::CONTINUATION, flags_byte, stream_id);
        frame.extend_from_slice(payload);
        frame
    }
}

fn require_stream(header: &H2FrameHeader, name: &str) -> Result<()> {
    if header.stream_id == 0 {
        return Err(Error::protocol(format!("{} frame on stream 0", name)));
    }
    Ok(())
}

fn require_connection(header: &H2FrameHeader, name: &str) -> Result<()> {
    if header.stream_id != 0 {
        return Err(Error::protocol(format!(
            "{} frame on stream {} (must be stream 0)",
            name, header.stream_id
        )));
    }
    Ok(())
}
