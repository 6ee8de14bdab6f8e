use crate::channel::{ChannelMessage, DataChannel};
use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One file in a batch manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }
}

/// Total declared size of a manifest
pub fn manifest_size(files: &[FileEntry]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// Control messages, sent as JSON text frames tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Sender proposes a batch
    Metadata { files: Vec<FileEntry> },
    /// Receiver approved the batch
    Accept,
    /// Receiver rejected the batch
    Decline,
    /// Following binary frames belong to this file
    FileStart {
        name: String,
        size: u64,
        #[serde(rename = "mimeType", default)]
        mime_type: String,
    },
    /// Current file's chunks are complete
    FileEnd,
    /// Every file in the batch was sent
    TransferComplete,
    /// Abort the batch in progress (either side)
    Cancel,
}

impl ControlMessage {
    pub fn file_start(entry: &FileEntry) -> Self {
        ControlMessage::FileStart {
            name: entry.name.clone(),
            size: entry.size,
            mime_type: entry.mime_type.clone(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A received frame, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Chunk(Bytes),
    /// Text that is not a control message we understand
    Unknown(String),
}

impl From<ChannelMessage> for Frame {
    fn from(msg: ChannelMessage) -> Self {
        match msg {
            ChannelMessage::Binary(data) => Frame::Chunk(data),
            ChannelMessage::Text(text) => match ControlMessage::decode(&text) {
                Ok(control) => Frame::Control(control),
                Err(_) => Frame::Unknown(text),
            },
        }
    }
}

/// Send a control message as a text frame
pub async fn send_control<C: DataChannel>(channel: &C, msg: &ControlMessage) -> Result<()> {
    let json = msg.encode()?;
    channel.send_text(&json).await
}
