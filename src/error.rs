//! Error types for the connection engine (RFC 7540 Section 7 error codes).

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error as ThisError;

use crate::h2_codec::error_code;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// HTTP/2 error code carried by RST_STREAM and GOAWAY frames.
///
/// Codes this crate does not know are preserved in `Unknown` so they
/// survive a decode/encode pass unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            error_code::NO_ERROR => ErrorCode::NoError,
            error_code::PROTOCOL_ERROR => ErrorCode::ProtocolError,
            error_code::INTERNAL_ERROR => ErrorCode::InternalError,
            error_code::FLOW_CONTROL_ERROR => ErrorCode::FlowControlError,
            error_code::SETTINGS_TIMEOUT => ErrorCode::SettingsTimeout,
            error_code::STREAM_CLOSED => ErrorCode::StreamClosed,
            error_code::FRAME_SIZE_ERROR => ErrorCode::FrameSizeError,
            error_code::REFUSED_STREAM => ErrorCode::RefusedStream,
            error_code::CANCEL => ErrorCode::Cancel,
            error_code::COMPRESSION_ERROR => ErrorCode::CompressionError,
            error_code::CONNECT_ERROR => ErrorCode::ConnectError,
            error_code::ENHANCE_YOUR_CALM => ErrorCode::EnhanceYourCalm,
            error_code::INADEQUATE_SECURITY => ErrorCode::InadequateSecurity,
            error_code::HTTP_1_1_REQUIRED => ErrorCode::Http11Required,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NoError => error_code::NO_ERROR,
            ErrorCode::ProtocolError => error_code::PROTOCOL_ERROR,
            ErrorCode::InternalError => error_code::INTERNAL_ERROR,
            ErrorCode::FlowControlError => error_code::FLOW_CONTROL_ERROR,
            ErrorCode::SettingsTimeout => error_code::SETTINGS_TIMEOUT,
            ErrorCode::StreamClosed => error_code::STREAM_CLOSED,
            ErrorCode::FrameSizeError => error_code::FRAME_SIZE_ERROR,
            ErrorCode::RefusedStream => error_code::REFUSED_STREAM,
            ErrorCode::Cancel => error_code::CANCEL,
            ErrorCode::CompressionError => error_code::COMPRESSION_ERROR,
            ErrorCode::ConnectError => error_code::CONNECT_ERROR,
            ErrorCode::EnhanceYourCalm => error_code::ENHANCE_YOUR_CALM,
            ErrorCode::InadequateSecurity => error_code::INADEQUATE_SECURITY,
            ErrorCode::Http11Required => error_code::HTTP_1_1_REQUIRED,
            ErrorCode::Unknown(other) => other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
            ErrorCode::Unknown(code) => return write!(f, "UNKNOWN(0x{:x})", code),
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the connection engine.
///
/// A connection-level failure is recorded once and cloned into every
/// outstanding stream operation, so all callers observe the same cause.
#[derive(ThisError, Debug, Clone)]
pub enum Error {
    /// Malformed or out-of-sequence frame. Always fails the whole connection.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Frame too large for the advertised limit, or of the wrong fixed length.
    #[error("frame size error: {0}")]
    FrameSize(String),
    /// Flow-control invariant violated by the peer. Treated like a protocol error.
    #[error("flow control error: {0}")]
    FlowControl(String),
    /// One exchange was aborted; the connection remains usable.
    #[error("stream {stream_id} reset by {}: {code}", reset_side(.remote))]
    Reset {
        stream_id: u32,
        code: ErrorCode,
        remote: bool,
    },
    /// The underlying byte stream failed.
    #[error("transport error: {0}")]
    Transport(#[source] Arc<io::Error>),
    /// The peer never answered an outstanding PING.
    #[error("ping timed out: previous PING still unanswered")]
    Timeout,
    /// The peer sent GOAWAY and will not process this stream.
    #[error("connection going away (last stream {last_stream_id}, {code})")]
    GoAway { last_stream_id: u32, code: ErrorCode },
    /// The connection was closed locally.
    #[error("connection closed")]
    ConnectionClosed,
    /// The stream is no longer part of the connection.
    #[error("stream {0} is closed")]
    StreamClosed(u32),
    /// A second local write was attempted while one was in flight on the same stream.
    #[error("stream {0} already has a write in progress")]
    ConcurrentWrite(u32),
    /// API used in a way the connection role does not allow.
    #[error("user error: {0}")]
    User(&'static str),
}

fn reset_side(remote: &bool) -> &'static str {
    if *remote {
        "peer"
    } else {
        "local endpoint"
    }
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn frame_size(msg: impl Into<String>) -> Self {
        Error::FrameSize(msg.into())
    }

    pub(crate) fn flow_control(msg: impl Into<String>) -> Self {
        Error::FlowControl(msg.into())
    }

    /// True if the error makes the whole connection unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::FrameSize(_)
                | Error::FlowControl(_)
                | Error::Transport(_)
                | Error::Timeout
                | Error::GoAway { .. }
                | Error::ConnectionClosed
        )
    }

    /// Wire code used when this error is reported to the peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) => ErrorCode::ProtocolError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::Reset { code, .. } => *code,
            Error::GoAway { code, .. } => *code,
            Error::Transport(_) | Error::Timeout => ErrorCode::InternalError,
            Error::ConnectionClosed => ErrorCode::NoError,
            Error::StreamClosed(_) => ErrorCode::StreamClosed,
            Error::ConcurrentWrite(_) | Error::User(_) => ErrorCode::InternalError,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(Arc::new(err))
    }
}
