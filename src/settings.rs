//! HTTP/2 SETTINGS parameters (RFC 7540 Section 6.5).
//!
//! Each side keeps its own [`Settings`]. A SETTINGS frame is usually a
//! partial update: only the parameters it carries change, everything else
//! keeps its current value. Parameters never set fall back to the protocol
//! defaults.

use crate::error::{Error, Result};
use crate::flow_control::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
use crate::h2_codec::settings_id;

/// Default HPACK table size (4 KB).
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Default and minimum max frame size (16 KB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest max frame size a peer may advertise (2^24 - 1).
pub const MAX_MAX_FRAME_SIZE: u32 = 0x00FF_FFFF;

const PARAMETER_COUNT: usize = 6;

/// A set of SETTINGS parameters, each either explicitly present or absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: [Option<u32>; PARAMETER_COUNT],
}

/// Outcome of applying a peer SETTINGS frame that the connection must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsDelta {
    /// new initial window size minus the previous one; applied to every
    /// open stream's write window, never to the connection window
    pub initial_window_delta: i64,
    pub max_frame_size: u32,
    /// Peer's HPACK decoder table size; bounds our encoder's dynamic table.
    pub header_table_size: u32,
}

fn slot(id: u16) -> Option<usize> {
    match id {
        settings_id::HEADER_TABLE_SIZE..=settings_id::MAX_HEADER_LIST_SIZE => Some(id as usize - 1),
        _ => None,
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from wire `(identifier, value)` pairs. Unknown identifiers are
    /// ignored as RFC 7540 Section 6.5.2 requires; later duplicates win.
    pub fn from_pairs(pairs: &[(u16, u32)]) -> Self {
        let mut settings = Self::new();
        for &(id, value) in pairs {
            settings.set(id, value);
        }
        settings
    }

    /// Present parameters as wire pairs, in identifier order.
    pub fn to_pairs(&self) -> Vec<(u16, u32)> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|value| (i as u16 + 1, value)))
            .collect()
    }

    pub fn get(&self, id: u16) -> Option<u32> {
        slot(id).and_then(|i| self.values[i])
    }

    pub fn set(&mut self, id: u16, value: u32) -> &mut Self {
        if let Some(i) = slot(id) {
            self.values[i] = Some(value);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    pub fn header_table_size(&self) -> u32 {
        self.get(settings_id::HEADER_TABLE_SIZE)
            .unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    pub fn enable_push(&self) -> bool {
        self.get(settings_id::ENABLE_PUSH).map_or(true, |v| v != 0)
    }

    /// `None` means unlimited.
    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.get(settings_id::MAX_CONCURRENT_STREAMS)
    }

    pub fn initial_window_size(&self) -> u32 {
        self.get(settings_id::INITIAL_WINDOW_SIZE)
            .unwrap_or(DEFAULT_WINDOW_SIZE)
    }

    pub fn max_frame_size(&self) -> u32 {
        self.get(settings_id::MAX_FRAME_SIZE)
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// `None` means unlimited.
    pub fn max_header_list_size(&self) -> Option<u32> {
        self.get(settings_id::MAX_HEADER_LIST_SIZE)
    }

    /// Overwrite every parameter present in `update`; keep the rest.
    pub fn merge(&mut self, update: &Settings) {
        for (current, incoming) in self.values.iter_mut().zip(update.values.iter()) {
            if incoming.is_some() {
                *current = *incoming;
            }
        }
    }

    /// Check parameter ranges per RFC 7540 Section 6.5.2.
    pub fn validate(&self) -> Result<()> {
        if let Some(push) = self.get(settings_id::ENABLE_PUSH) {
            if push > 1 {
                return Err(Error::protocol(format!("ENABLE_PUSH must be 0 or 1, got {}", push)));
            }
        }
        if let Some(window) = self.get(settings_id::INITIAL_WINDOW_SIZE) {
            if i64::from(window) > MAX_WINDOW_SIZE {
                return Err(Error::flow_control(format!(
                    "INITIAL_WINDOW_SIZE {} exceeds 2^31-1",
                    window
                )));
            }
        }
        if let Some(size) = self.get(settings_id::MAX_FRAME_SIZE) {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&size) {
                return Err(Error::protocol(format!("MAX_FRAME_SIZE {} out of range", size)));
            }
        }
        Ok(())
    }

    /// Apply a peer SETTINGS frame.
    ///
    /// With `clear_previous` the incoming set replaces the current one
    /// outright; otherwise it is merged. Nothing changes if validation fails.
    pub fn apply(&mut self, incoming: &Settings, clear_previous: bool) -> Result<SettingsDelta> {
        incoming.validate()?;
        let previous_window = i64::from(self.initial_window_size());
        if clear_previous {
            *self = incoming.clone();
        } else {
            self.merge(incoming);
        }
        Ok(SettingsDelta {
            initial_window_delta: i64::from(self.initial_window_size()) - previous_window,
            max_frame_size: self.max_frame_size(),
            header_table_size: self.header_table_size(),
        })
    }
}
