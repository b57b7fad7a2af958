//! h2-mux: a multiplexed HTTP/2 connection engine
//!
//! One duplex byte stream carries many independent streams. Each stream
//! has its own lifecycle and flow-controlled read/write windows, and every
//! frame any stream emits goes through one serialized writer.
//!
//! # Features
//!
//! - **Stream lifecycle**: Idle, Open, half-closed, Closed and Reset states,
//!   with headers and trailers kept per stream
//! - **Two-level flow control**: every DATA frame is admitted by both the
//!   stream window and the connection window
//! - **Settings renegotiation**: a change of the peer's initial window size
//!   moves every open stream's window by the delta
//! - **Single writer**: frames are queued FIFO and encoded whole, so they
//!   never interleave on the wire
//! - **Failure broadcast**: a connection error resolves every pending stream
//!   operation with the same cause
//! - **HPACK**: header compression via fluke-hpack
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use h2_mux::{Config, Connection, HeaderBlock};
//!
//! # async fn example<T>(io: T) -> h2_mux::Result<()>
//! # where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static {
//! let (connection, driver) = Connection::handshake(io, Config::client()).await?;
//! tokio::spawn(driver.run());
//!
//! let request = HeaderBlock::new()
//!     .with(":method", "GET")
//!     .with(":scheme", "http")
//!     .with(":authority", "localhost")
//!     .with(":path", "/");
//! let stream = connection.open_stream(request, None).await?;
//! println!("status: {:?}", stream.headers().await?.get(":status"));
//! let body = stream.read_to_end().await?;
//! println!("{} bytes", body.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`flow_control`], [`settings`], [`pipe`], [`stream`]: plain state,
//!   no I/O
//! - [`connection`]: the stream table and frame routing, plus the
//!   [`Driver`] that runs the read and write loops
//! - [`transport`], [`h2_codec`], [`hpack`]: wire format, turning bytes
//!   into [`Frame`]s and back
//!
//! It does NOT provide:
//! - Server push or stream priorities
//! - TLS (wrap the transport with rustls or similar)
//! - HTTP semantics beyond carrying header blocks and bodies

pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod h2_codec;
pub mod hpack;
pub mod pipe;
pub mod settings;
pub mod stream;
pub mod transport;

pub use config::{Config, Mode};
pub use connection::{Connection, Driver, Lifecycle, Request, Response};
pub use error::{Error, ErrorCode, Result};
pub use flow_control::FlowWindow;
pub use frame::{Frame, StreamId};
pub use h2_codec::{
    H2Codec, H2Event, H2FrameHeader,
    CONNECTION_PREFACE, MAX_HEADER_BLOCK_SIZE,
    error_code, flags, frame_type, settings_id,
    is_h2c_preface,
};
pub use hpack::{H2Header, HeaderBlock, HpackDecoder, HpackEncoder};
pub use settings::Settings;
pub use stream::{RecvBody, StreamHandle, StreamState};
