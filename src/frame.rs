//! Decoded HTTP/2 frames as exchanged between the connection engine and
//! the frame transport.
//!
//! The same closed set of variants describes what the reader hands to the
//! connection and what the connection asks the writer to emit, so frame
//! handling is an exhaustive `match` rather than a callback interface.

use bytes::Bytes;

use crate::error::ErrorCode;
use crate::hpack::HeaderBlock;
use crate::settings::Settings;

pub type StreamId = u32;

#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream_id: StreamId,
        end_stream: bool,
        data: Bytes,
        /// Bytes charged against flow control. Equals `data.len()` for
        /// outbound frames; includes padding for inbound ones.
        flow_len: u32,
    },
    Headers {
        stream_id: StreamId,
        /// Promised/associated stream; always 0 since push is not supported.
        associated_id: StreamId,
        end_stream: bool,
        block: HeaderBlock,
    },
    Reset {
        stream_id: StreamId,
        code: ErrorCode,
    },
    Settings {
        /// Replace rather than merge the previous peer settings. The HTTP/2
        /// wire format has no such flag, so decoded frames always carry `false`.
        clear_previous: bool,
        settings: Settings,
    },
    SettingsAck,
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
}

impl Frame {
    pub fn data(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        let flow_len = data.len() as u32;
        Frame::Data {
            stream_id,
            end_stream,
            data,
            flow_len,
        }
    }

    pub fn headers(stream_id: StreamId, block: HeaderBlock, end_stream: bool) -> Self {
        Frame::Headers {
            stream_id,
            associated_id: 0,
            end_stream,
            block,
        }
    }

    /// Stream the frame belongs to; 0 for connection-scoped frames.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Reset { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::SettingsAck | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Short frame name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Data { .. } => "DATA",
            Frame::Headers { .. } => "HEADERS",
            Frame::Reset { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::SettingsAck => "SETTINGS_ACK",
            Frame::Ping { ack: false, .. } => "PING",
            Frame::Ping { ack: true, .. } => "PING_ACK",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
        }
    }
}
