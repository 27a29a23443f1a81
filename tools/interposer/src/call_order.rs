//! Per-channel call order: logged while recording, verified on playback.

use crate::errors::InterposerError;
use crate::store::ChannelOrder;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct CallOrder {
    enabled: bool,
    recorded: ChannelOrder,
    cursors: BTreeMap<String, usize>,
    played: ChannelOrder,
}

impl CallOrder {
    /// A tracker seeded with `recorded`; verification only runs when `enabled`.
    pub fn new(enabled: bool, recorded: ChannelOrder) -> Self {
        Self {
            enabled,
            recorded,
            cursors: BTreeMap::new(),
            played: ChannelOrder::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn note_recorded(&mut self, channel: &str, call: Value) {
        self.recorded.entry(channel.to_string()).or_default().push(call);
    }

    /// Check `call` against the next recorded call on `channel` and advance.
    ///
    /// Every playback lands in the observational log, including those that
    /// fail verification.
    pub fn verify_playback(&mut self, channel: &str, call: &Value) -> Result<(), InterposerError> {
        self.played
            .entry(channel.to_string())
            .or_default()
            .push(call.clone());
        if !self.enabled {
            return Ok(());
        }

        let cursor = self.cursors.entry(channel.to_string()).or_insert(0);
        let expected = self
            .recorded
            .get(channel)
            .and_then(|calls| calls.get(*cursor))
            .ok_or_else(|| {
                InterposerError::Playback(format!(
                    "not enough calls recorded on channel `{channel}` (call {} requested)",
                    *cursor + 1
                ))
            })?;
        if expected != call {
            return Err(InterposerError::Playback(format!(
                "call order mismatch on channel `{channel}` at position {}: got {call}, expected {expected}",
                *cursor
            )));
        }
        *cursor += 1;
        Ok(())
    }

    /// The recorded log, as written to the store at close.
    pub fn snapshot(&self) -> &ChannelOrder {
        &self.recorded
    }

    pub fn played_back(&self, channel: &str) -> &[Value] {
        self.played.get(channel).map(Vec::as_slice).unwrap_or_default()
    }
}
