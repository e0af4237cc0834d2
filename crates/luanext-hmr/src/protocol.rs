//! Hot-update messages and the channels that carry them

use std::collections::BTreeMap;
use std::io::Write;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::ChannelError;
use crate::runtime::ModuleId;

/// New code for the modules that changed in one rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchPayload {
    pub module_ids: Vec<ModuleId>,

    /// Factory bodies, keyed by module id
    pub code: BTreeMap<ModuleId, String>,
}

impl PatchPayload {
    pub fn new(code: BTreeMap<ModuleId, String>) -> Self {
        Self {
            module_ids: code.keys().cloned().collect(),
            code,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.module_ids.is_empty()
    }
}

/// A message from the dev server to an execution context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HotUpdate {
    Patch(PatchPayload),
    FullReload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        path: String,
        message: String,
    },
}

impl HotUpdate {
    pub fn full_reload(reason: impl Into<String>) -> Self {
        Self::FullReload {
            reason: Some(reason.into()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Outbound side of a connection to one execution context
pub trait UpdateChannel: Send + Sync {
    fn send(&self, update: HotUpdate) -> Result<(), ChannelError>;
}

impl UpdateChannel for UnboundedSender<HotUpdate> {
    fn send(&self, update: HotUpdate) -> Result<(), ChannelError> {
        UnboundedSender::send(self, update).map_err(|_| ChannelError::Closed)
    }
}

/// Writes each update as one line of JSON
pub struct JsonLinesChannel<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesChannel<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> UpdateChannel for JsonLinesChannel<W> {
    fn send(&self, update: HotUpdate) -> Result<(), ChannelError> {
        let line = update.to_json()?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> PatchPayload {
        let mut code = BTreeMap::new();
        code.insert("src/b.lua".to_string(), "exports.v = 2".to_string());
        code.insert("src/a.lua".to_string(), "exports.v = 1".to_string());
        PatchPayload::new(code)
    }

    #[test]
    fn test_payload_lists_ids_in_order() {
        assert_eq!(payload().module_ids, vec!["src/a.lua", "src/b.lua"]);
    }

    #[test]
    fn test_patch_wire_shape() {
        let json = HotUpdate::Patch(payload()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "patch");
        assert_eq!(value["moduleIds"][0], "src/a.lua");
        assert_eq!(value["code"]["src/b.lua"], "exports.v = 2");
    }

    #[test]
    fn test_full_reload_without_reason() {
        let json = HotUpdate::FullReload { reason: None }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"full-reload"}"#);
        assert_eq!(
            HotUpdate::from_json(&json).unwrap(),
            HotUpdate::FullReload { reason: None }
        );
    }

    #[test]
    fn test_error_wire_shape() {
        let update = HotUpdate::Error {
            path: "src/a.lua".into(),
            message: "unexpected symbol".into(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&update.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["path"], "src/a.lua");
    }

    #[test]
    fn test_json_lines_channel() {
        let channel = JsonLinesChannel::new(Vec::new());
        channel.send(HotUpdate::full_reload("entry changed")).unwrap();
        channel.send(HotUpdate::Patch(payload())).unwrap();

        let out = String::from_utf8(channel.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            HotUpdate::from_json(lines[0]).unwrap(),
            HotUpdate::full_reload("entry changed")
        );
    }

    #[test]
    fn test_closed_mpsc_channel() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<HotUpdate>();
        drop(rx);
        let err = UpdateChannel::send(&tx, HotUpdate::full_reload("x")).unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }
}
