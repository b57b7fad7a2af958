//! Frame transport: glue between the byte-stream socket and [`Frame`]s.
//!
//! [`FrameReader`] runs the incoming bytes through [`H2Codec`] and the
//! connection's HPACK decoder. [`FrameWriter`] encodes outgoing frames into
//! a send buffer with the connection's HPACK encoder; nothing reaches the
//! socket until [`FrameWriter::flush`] is called, so a batch of frames goes
//! out in one write.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::frame::{Frame, StreamId};
use crate::h2_codec::{H2Codec, H2Event, CONNECTION_PREFACE};
use crate::hpack::{HeaderBlock, HpackDecoder, HpackEncoder};
use crate::settings::{Settings, DEFAULT_MAX_FRAME_SIZE};

const READ_CHUNK: usize = 16 * 1024;

/// Reads frames from the inbound half of the transport.
#[derive(Debug)]
pub struct FrameReader<R> {
    io: R,
    codec: H2Codec,
    decoder: HpackDecoder,
    /// Our advertised SETTINGS_MAX_HEADER_LIST_SIZE
    max_header_list_size: Option<u32>,
    ready: VecDeque<Frame>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, codec: H2Codec) -> Self {
        Self {
            io,
            codec,
            decoder: HpackDecoder::new(),
            max_header_list_size: None,
            ready: VecDeque::new(),
            buf: vec![0; READ_CHUNK],
        }
    }

    /// Our advertised SETTINGS_MAX_FRAME_SIZE; larger inbound frames are rejected.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.codec.set_max_frame_size(size);
    }

    /// Hold the peer to our advertised SETTINGS_HEADER_TABLE_SIZE and
    /// SETTINGS_MAX_HEADER_LIST_SIZE.
    pub fn set_header_limits(&mut self, table_size: u32, max_list_size: u32) {
        self.decoder.set_max_table_size(table_size);
        self.max_header_list_size = Some(max_list_size);
    }

    /// Next complete frame, or `None` once the peer closed the transport.
    ///
    /// Cancel-safe: frames decoded from a completed read are queued before
    /// the next await point.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                trace!(kind = frame.kind(), stream_id = frame.stream_id(), "recv frame");
                return Ok(Some(frame));
            }
            let n = self.io.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            for event in self.codec.process(&self.buf[..n])? {
                let frame = self.decode_event(event)?;
                self.ready.push_back(frame);
            }
        }
    }

    fn decode_event(&mut self, event: H2Event) -> Result<Frame> {
        Ok(match event {
            H2Event::Data {
                stream_id,
                data,
                end_stream,
                flow_len,
            } => Frame::Data {
                stream_id,
                end_stream,
                data: Bytes::from(data),
                flow_len,
            },
            H2Event::Headers {
                stream_id,
                header_block,
                end_stream,
            } => {
                // Decode even an oversized list so the HPACK table stays in sync.
                let block = self.decoder.decode(&header_block)?;
                if let Some(limit) = self.max_header_list_size {
                    if block.list_size() > limit as usize {
                        return Err(Error::protocol(format!(
                            "header list of {} bytes on stream {} exceeds advertised max {}",
                            block.list_size(),
                            stream_id,
                            limit
                        )));
                    }
                }
                Frame::headers(stream_id, block, end_stream)
            }
            H2Event::StreamReset {
                stream_id,
                error_code,
            } => Frame::Reset {
                stream_id,
                code: ErrorCode::from(error_code),
            },
            H2Event::Settings { ack: true, .. } => Frame::SettingsAck,
            H2Event::Settings { ack: false, settings } => Frame::Settings {
                clear_previous: false,
                settings: Settings::from_pairs(&settings),
            },
            H2Event::Ping { ack, data } => Frame::Ping { ack, payload: data },
            H2Event::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => Frame::GoAway {
                last_stream_id,
                code: ErrorCode::from(error_code),
                debug_data: Bytes::from(debug_data),
            },
            H2Event::WindowUpdate {
                stream_id,
                increment,
            } => Frame::WindowUpdate {
                stream_id,
                increment,
            },
        })
    }
}

/// Encodes frames for the outbound half of the transport.
///
/// Owned by exactly one writer at a time; HPACK state depends on header
/// blocks being encoded in wire order.
#[derive(Debug)]
pub struct FrameWriter<W> {
    io: W,
    encoder: HpackEncoder,
    buf: Vec<u8>,
    /// Peer's SETTINGS_MAX_FRAME_SIZE
    max_frame_size: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            encoder: HpackEncoder::new(),
            buf: Vec::with_capacity(READ_CHUNK),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Peer's SETTINGS_HEADER_TABLE_SIZE, announced in the next header block.
    pub fn set_header_table_size(&mut self, size: u32) {
        self.encoder.set_max_table_size(size);
    }

    pub fn write_preface(&mut self) {
        self.buf.extend_from_slice(CONNECTION_PREFACE);
    }

    pub fn write_headers(&mut self, stream_id: StreamId, block: &HeaderBlock, end_stream: bool) {
        let encoded = self.encoder.encode(block);
        self.buf.extend_from_slice(&H2Codec::create_headers(
            stream_id,
            &encoded,
            end_stream,
            self.max_frame_size,
        ));
    }

    /// `data` must already be bounded by the peer's max frame size.
    pub fn write_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) {
        self.buf.extend_from_slice(&H2Codec::create_data(stream_id, data, end_stream));
    }

    pub fn write_settings(&mut self, settings: &Settings) {
        self.buf.extend_from_slice(&H2Codec::create_settings(&settings.to_pairs()));
    }

    pub fn write_settings_ack(&mut self) {
        self.buf.extend_from_slice(&H2Codec::create_settings_ack());
    }

    pub fn write_window_update(&mut self, stream_id: StreamId, increment: u32) {
        self.buf.extend_from_slice(&H2Codec::create_window_update(stream_id, increment));
    }

    pub fn write_rst_stream(&mut self, stream_id: StreamId, code: ErrorCode) {
        self.buf.extend_from_slice(&H2Codec::create_rst_stream(stream_id, code.into()));
    }

    pub fn write_ping(&mut self, ack: bool, payload: [u8; 8]) {
        self.buf.extend_from_slice(&H2Codec::create_ping(payload, ack));
    }

    pub fn write_goaway(&mut self, last_stream_id: StreamId, code: ErrorCode, debug_data: &[u8]) {
        self.buf.extend_from_slice(&H2Codec::create_goaway(last_stream_id, code.into(), debug_data));
    }

    /// Encode any frame into the send buffer.
    pub fn write_frame(&mut self, frame: &Frame) {
        trace!(kind = frame.kind(), stream_id = frame.stream_id(), "send frame");
        match frame {
            Frame::Data {
                stream_id,
                end_stream,
                data,
                ..
            } => self.write_data(*stream_id, data, *end_stream),
            Frame::Headers {
                stream_id,
                end_stream,
                block,
                ..
            } => self.write_headers(*stream_id, block, *end_stream),
            Frame::Reset { stream_id, code } => self.write_rst_stream(*stream_id, *code),
            Frame::Settings { settings, .. } => self.write_settings(settings),
            Frame::SettingsAck => self.write_settings_ack(),
            Frame::Ping { ack, payload } => self.write_ping(*ack, *payload),
            Frame::GoAway {
                last_stream_id,
                code,
                debug_data,
            } => self.write_goaway(*last_stream_id, *code, debug_data),
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.write_window_update(*stream_id, *increment),
        }
    }

    /// Push the buffered frames to the socket.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let result = self.io.write_all(&self.buf).await;
            self.buf.clear();
            result?;
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Final step of teardown: close the outbound half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
