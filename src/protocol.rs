//! Wire protocol for the snapdock host/client sync link
//!
//! Control messages are UTF-8 JSON objects tagged by a required `action`
//! field; payload bytes travel in untagged binary frames against the
//! currently active transfer request.

use serde::{Deserialize, Serialize};

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"SNAP";
pub const VERSION: u16 = 1;

// Maximum frame payload size (10MB) - prevents memory exhaustion from a
// misbehaving client while still fitting a whole metadata file in one frame
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Default listen port for the sync server
pub const DEFAULT_PORT: u16 = 6969;

// Frame type IDs
pub mod frame {
    /// JSON control message
    pub const TEXT: u8 = 1;
    /// Raw payload bytes for the active transfer request
    pub const BINARY: u8 = 2;
}

/// Control messages received from the client.
///
/// Decoding is the validation boundary: a missing `action`, an unknown
/// action, or missing fields all fail here and never reach handler logic.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Out-of-band abort/ack from the peer; usable at any time.
    #[serde(rename_all = "camelCase")]
    EndSync { message: Option<String> },

    /// The client's per-album item-name lists, outermost index = album.
    #[serde(rename_all = "camelCase")]
    Albums { albums: Vec<Vec<String>> },

    /// Size/chunking info for an item the host asked about.
    #[serde(rename_all = "camelCase")]
    ItemInfo {
        album_index: usize,
        item_index: usize,
        last_modified: i64,
        size: u64,
        max_part_size: u64,
        parts: u32,
    },

    /// Modification time for an album's metadata file on the client.
    #[serde(rename_all = "camelCase")]
    MetadataInfo { album_index: usize, last_modified: i64 },

    /// Client asks for the host's metadata mtime (upload/serving path).
    #[serde(rename_all = "camelCase")]
    RequestMetadataInfo { album_index: usize },

    /// Client asks for the host's metadata bytes (upload/serving path).
    #[serde(rename_all = "camelCase")]
    RequestMetadataData { album_index: usize },
}

/// Control messages sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum HostMessage {
    /// Ask the client to describe one of its items. Queue position rides
    /// along so the client can show transfer progress.
    #[serde(rename_all = "camelCase")]
    RequestItemInfo {
        album_index: usize,
        item_index: usize,
        queue_index: usize,
        queue_size: usize,
    },

    /// Ask for one part of the active item's payload.
    #[serde(rename_all = "camelCase")]
    RequestItemData {
        album_index: usize,
        item_index: usize,
        part: u32,
    },

    /// Ask the client to describe an album's metadata file.
    #[serde(rename_all = "camelCase")]
    RequestMetadataInfo {
        album_index: usize,
        queue_index: usize,
        queue_size: usize,
    },

    /// Ask for the album's metadata bytes.
    #[serde(rename_all = "camelCase")]
    RequestMetadataData { album_index: usize },

    /// Host's metadata mtime, answering the client's requestMetadataInfo.
    #[serde(rename_all = "camelCase")]
    MetadataInfo { album_index: usize, last_modified: i64 },

    /// Kick off a client-driven metadata upload exchange.
    StartMetadataRequest,
}

impl HostMessage {
    /// Encode as the JSON text-frame payload.
    pub fn to_json(&self) -> String {
        // Serialization of a closed enum of plain fields cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_known_actions() {
        let msg: ClientMessage = serde_json::from_str(r#"{"action":"endSync"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::EndSync { message: None }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"action":"endSync","message":"done"}"#).unwrap();
        match msg {
            ClientMessage::EndSync { message } => assert_eq!(message.as_deref(), Some("done")),
            other => panic!("unexpected: {other:?}"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"action":"albums","albums":[["a.jpg"],[]]}"#).unwrap();
        match msg {
            ClientMessage::Albums { albums } => {
                assert_eq!(albums.len(), 2);
                assert_eq!(albums[0], vec!["a.jpg"]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let msg: ClientMessage = serde_json::from_str(
            r#"{"action":"itemInfo","albumIndex":1,"itemIndex":3,"lastModified":1700000000,
                "size":4096,"maxPartSize":1024,"parts":4}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::ItemInfo { album_index, item_index, parts, .. } => {
                assert_eq!(album_index, 1);
                assert_eq!(item_index, 3);
                assert_eq!(parts, 4);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_or_malformed_actions_fail_decode() {
        // Unknown action
        assert!(serde_json::from_str::<ClientMessage>(r#"{"action":"selfDestruct"}"#).is_err());
        // Missing action
        assert!(serde_json::from_str::<ClientMessage>(r#"{"albums":[]}"#).is_err());
        // Missing required field
        assert!(
            serde_json::from_str::<ClientMessage>(r#"{"action":"itemInfo","albumIndex":0}"#)
                .is_err()
        );
        // Not JSON at all
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn encode_uses_camel_case_actions() {
        let json = HostMessage::RequestItemData { album_index: 2, item_index: 5, part: 0 }.to_json();
        assert!(json.contains(r#""action":"requestItemData""#), "{json}");
        assert!(json.contains(r#""albumIndex":2"#), "{json}");
        assert!(json.contains(r#""itemIndex":5"#), "{json}");
        assert!(json.contains(r#""part":0"#), "{json}");

        let json = HostMessage::StartMetadataRequest.to_json();
        assert_eq!(json, r#"{"action":"startMetadataRequest"}"#);
    }
}
