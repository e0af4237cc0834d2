//! Update channel that keeps every message for inspection

use luanext_hmr::{ChannelError, HotUpdate, PatchPayload, UpdateChannel};
use parking_lot::Mutex;

#[derive(Default)]
pub struct RecordingChannel {
    updates: Mutex<Vec<HotUpdate>>,
    closed: Mutex<bool>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far
    pub fn updates(&self) -> Vec<HotUpdate> {
        self.updates.lock().clone()
    }

    /// Remove and return the messages sent so far
    pub fn take(&self) -> Vec<HotUpdate> {
        std::mem::take(&mut *self.updates.lock())
    }

    /// Patch payloads among the messages sent so far
    pub fn patches(&self) -> Vec<PatchPayload> {
        self.updates
            .lock()
            .iter()
            .filter_map(|update| match update {
                HotUpdate::Patch(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Reject every later send, like a disconnected client
    pub fn close(&self) {
        *self.closed.lock() = true;
    }
}

impl UpdateChannel for RecordingChannel {
    fn send(&self, update: HotUpdate) -> Result<(), ChannelError> {
        if *self.closed.lock() {
            return Err(ChannelError::Closed);
        }
        self.updates.lock().push(update);
        Ok(())
    }
}
