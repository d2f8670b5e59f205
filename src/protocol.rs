//! Wire protocol between the server and remote mirrors.
//!
//! Binary frames are either a full snapshot (`record[count]`, no header) or a
//! diff frame:
//!
//! ```text
//! u32 update_count | update_count x (u32 index, u32 attr, u32 meta)
//! ```
//!
//! Control messages are JSON text frames tagged by `type`. A binary snapshot
//! is always announced by a `snapshot` text frame carrying its metadata, so a
//! consumer can tell the two binary kinds apart without sniffing lengths.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    bitmask::MetaLayout,
    errors::{ContractError, ContractResult},
    record::{read_u32, DiffEntry, Encoding},
    types::EntityIndex,
};

pub const DIFF_HEADER_BYTES: usize = 4;
pub const DIFF_ENTRY_BYTES: usize = 12;

/// Out-of-band description of the binary stream. Any change means the
/// consumer must reload a full snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub count: u32,
    pub stride_bytes: u32,
    pub encoding_tag: u8,
    pub layout_description: String,
    pub meta_layout: MetaLayout,
}

impl Metadata {
    pub fn new(count: usize, encoding: Encoding, layout: MetaLayout) -> Self {
        Self {
            count: count as u32,
            stride_bytes: encoding.stride() as u32,
            encoding_tag: encoding.tag(),
            layout_description: layout.description().to_string(),
            meta_layout: layout,
        }
    }

    /// Resolves the declared encoding, rejecting unknown tags and strides
    /// that disagree with the tag.
    pub fn encoding(&self) -> ContractResult<Encoding> {
        let encoding = Encoding::from_tag(self.encoding_tag)?;
        if encoding.stride() != self.stride_bytes as usize {
            return Err(ContractError::StrideMismatch {
                expected: encoding.stride(),
                actual: self.stride_bytes as usize,
            });
        }
        Ok(encoding)
    }

    pub fn snapshot_len(&self) -> usize {
        self.count as usize * self.stride_bytes as usize
    }

    pub fn requires_reload(&self, other: &Metadata) -> bool {
        self != other
    }
}

pub fn encode_diff(entries: &[DiffEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DIFF_HEADER_BYTES + entries.len() * DIFF_ENTRY_BYTES);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.index.into_inner().to_le_bytes());
        out.extend_from_slice(&entry.attr.to_le_bytes());
        out.extend_from_slice(&entry.meta.to_le_bytes());
    }
    out
}

pub fn decode_diff(bytes: &[u8]) -> ContractResult<Vec<DiffEntry>> {
    if bytes.len() < DIFF_HEADER_BYTES {
        return Err(ContractError::MalformedFrame(format!(
            "diff frame of {} bytes has no header",
            bytes.len()
        )));
    }
    let count = read_u32(bytes, 0) as usize;
    // Checked so a hostile count cannot wrap the expected length.
    let expected = count
        .checked_mul(DIFF_ENTRY_BYTES)
        .and_then(|body| body.checked_add(DIFF_HEADER_BYTES));
    if expected != Some(bytes.len()) {
        return Err(ContractError::MalformedFrame(format!(
            "diff frame declares {count} updates but carries {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes[DIFF_HEADER_BYTES..]
        .chunks_exact(DIFF_ENTRY_BYTES)
        .map(|chunk| DiffEntry {
            index: EntityIndex(read_u32(chunk, 0)),
            attr: read_u32(chunk, 4),
            meta: read_u32(chunk, 8),
        })
        .collect())
}

/// Folds `newer` into `pending`; the latest entry per index wins and the
/// result is sorted by index.
pub fn merge_diffs(pending: &mut Vec<DiffEntry>, newer: &[DiffEntry]) {
    let mut merged: BTreeMap<EntityIndex, DiffEntry> =
        pending.drain(..).map(|entry| (entry.index, entry)).collect();
    for entry in newer {
        merged.insert(entry.index, *entry);
    }
    pending.extend(merged.into_values());
}

/// Per-connection parameters negotiated at subscribe time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub encoding: Option<Encoding>,
    #[serde(default)]
    pub cadence_ms: Option<u64>,
    #[serde(default)]
    pub min_risk: u8,
    #[serde(default)]
    pub min_shock: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Metadata {
        #[serde(default)]
        encoding: Option<Encoding>,
    },
    Snapshot {
        #[serde(default)]
        encoding: Option<Encoding>,
    },
    Subscribe(SubscribeRequest),
    Ping,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Metadata(Metadata),
    /// Announces that the next binary frame is a full snapshot.
    Snapshot {
        metadata: Metadata,
        version: u64,
    },
    Subscribed {
        subscription_id: u64,
        cadence_ms: u64,
        min_risk: u8,
        min_shock: u8,
        metadata: Metadata,
    },
    Pong,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u32, meta: u32) -> DiffEntry {
        DiffEntry {
            index: EntityIndex(index),
            attr: index * 2,
            meta,
        }
    }

    #[test]
    fn test_diff_frame_layout() {
        let frame = encode_diff(&[entry(7, 0xAABBCCDD)]);
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[0..4], &[1, 0, 0, 0]);
        assert_eq!(&frame[4..8], &[7, 0, 0, 0]);
        assert_eq!(&frame[8..12], &[14, 0, 0, 0]);
        assert_eq!(&frame[12..16], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(decode_diff(&frame).unwrap(), vec![entry(7, 0xAABBCCDD)]);
    }

    #[test]
    fn test_empty_diff_is_header_only() {
        let frame = encode_diff(&[]);
        assert_eq!(frame, vec![0, 0, 0, 0]);
        assert!(decode_diff(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_truncated_frames() {
        assert!(matches!(
            decode_diff(&[1, 0]),
            Err(ContractError::MalformedFrame(_))
        ));
        let mut frame = encode_diff(&[entry(1, 1), entry(2, 2)]);
        frame.pop();
        assert!(matches!(
            decode_diff(&frame),
            Err(ContractError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_count() {
        let mut frame = u32::MAX.to_le_bytes().to_vec();
        frame.extend_from_slice(&[0u8; DIFF_ENTRY_BYTES]);
        assert!(matches!(
            decode_diff(&frame),
            Err(ContractError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_merge_diffs_last_write_wins() {
        let mut pending = vec![entry(5, 1), entry(2, 1)];
        merge_diffs(&mut pending, &[entry(5, 9), entry(3, 4)]);
        assert_eq!(pending, vec![entry(2, 1), entry(3, 4), entry(5, 9)]);
    }

    #[test]
    fn test_metadata_validates_stride() {
        let metadata = Metadata::new(10, Encoding::Extended, MetaLayout::Standard);
        assert_eq!(metadata.encoding(), Ok(Encoding::Extended));
        assert_eq!(metadata.snapshot_len(), 280);

        let mut bad = metadata.clone();
        bad.stride_bytes = 12;
        assert_eq!(
            bad.encoding(),
            Err(ContractError::StrideMismatch {
                expected: 28,
                actual: 12
            })
        );
        assert!(metadata.requires_reload(&bad));

        let mut unknown = metadata;
        unknown.encoding_tag = 7;
        assert_eq!(unknown.encoding(), Err(ContractError::UnknownEncoding(7)));
    }

    #[test]
    fn test_control_messages_json_shape() {
        let request: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","encoding":2,"cadence_ms":250,"min_risk":40}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            ClientMessage::Subscribe(SubscribeRequest {
                encoding: Some(Encoding::Extended),
                cadence_ms: Some(250),
                min_risk: 40,
                min_shock: 0,
            })
        );

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping);

        let metadata = Metadata::new(3, Encoding::Compact, MetaLayout::Domain);
        let text = serde_json::to_string(&ServerMessage::Metadata(metadata.clone())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "metadata");
        assert_eq!(value["stride_bytes"], 12);
        assert_eq!(value["encoding_tag"], 1);
        assert_eq!(value["meta_layout"], "domain");
        let back: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ServerMessage::Metadata(metadata));
    }
}
