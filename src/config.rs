//! Connection configuration.

use crate::flow_control::DEFAULT_WINDOW_SIZE;
use crate::h2_codec::settings_id;
use crate::settings::{Settings, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_MAX_FRAME_SIZE};

/// Receive window clients advertise by default (16 MiB). Large enough that
/// a client does not thrash WINDOW_UPDATEs every 64 KiB, small enough to
/// bound buffered data.
pub const DEFAULT_CLIENT_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 256;

pub const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 64 * 1024;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
    /// Server whose transport already consumed the client preface
    /// (prior-knowledge upgrade).
    ServerSkipConnectionPreface,
}

impl Mode {
    pub fn is_client(self) -> bool {
        self == Mode::Client
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Per-stream receive window we advertise; the connection receive
    /// window is raised to match during the handshake.
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    /// Peer-initiated streams beyond this are refused.
    pub max_concurrent_streams: u32,
    pub header_table_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::client()
    }
}

impl Config {
    pub fn client() -> Self {
        Self {
            mode: Mode::Client,
            initial_window_size: DEFAULT_CLIENT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
        }
    }

    pub fn server() -> Self {
        Self {
            mode: Mode::Server,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            ..Self::client()
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.header_table_size = size;
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.max_header_list_size = size;
        self
    }

    /// The SETTINGS we advertise at connection start.
    pub fn local_settings(&self) -> Settings {
        let mut settings = Settings::new();
        settings
            .set(settings_id::HEADER_TABLE_SIZE, self.header_table_size)
            .set(settings_id::MAX_CONCURRENT_STREAMS, self.max_concurrent_streams)
            .set(settings_id::INITIAL_WINDOW_SIZE, self.initial_window_size)
            .set(settings_id::MAX_FRAME_SIZE, self.max_frame_size)
            .set(settings_id::MAX_HEADER_LIST_SIZE, self.max_header_list_size);
        if self.mode.is_client() {
            settings.set(settings_id::ENABLE_PUSH, 0);
        }
        settings
    }
}
