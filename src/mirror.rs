//! Client-side copy of the point buffer.
//!
//! A mirror is only valid for the metadata of the snapshot it was built
//! from. Diffs are applied last-write-wins per index, so replaying a frame
//! is harmless. Any contract violation leaves the mirror untouched and the
//! caller is expected to [`discard`](Mirror::discard) it and fetch a fresh
//! snapshot.

use crate::{
    bitmask::{decode_visual, MetaCodec, MetaFields, MetaLayout, VisualAttrs},
    errors::{ContractError, ContractResult},
    protocol::{decode_diff, Metadata},
    record::{Encoding, EntityRecord},
    types::{EntityIndex, WorldPoint},
};

#[derive(Debug, Default)]
pub struct Mirror {
    pinned_layout: Option<MetaLayout>,
    metadata: Option<Metadata>,
    records: Vec<EntityRecord>,
    visuals: Vec<VisualAttrs>,
    generation: u64,
    diffs_applied: u64,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mirror that refuses snapshots declaring any other meta layout.
    pub fn with_layout(layout: MetaLayout) -> Self {
        Self {
            pinned_layout: Some(layout),
            ..Self::default()
        }
    }

    pub fn is_ready(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bumped on every applied snapshot; geometry only changes here.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn diffs_applied(&self) -> u64 {
        self.diffs_applied
    }

    pub fn layout(&self) -> Option<MetaLayout> {
        self.metadata.as_ref().map(|m| m.meta_layout)
    }

    pub fn apply_snapshot(&mut self, metadata: &Metadata, bytes: &[u8]) -> ContractResult<()> {
        let encoding = metadata.encoding()?;
        if let Some(pinned) = self.pinned_layout {
            if pinned != metadata.meta_layout {
                return Err(ContractError::LayoutMismatch {
                    expected: pinned.to_string(),
                    actual: metadata.meta_layout.to_string(),
                });
            }
        }
        let stride = encoding.stride();
        if bytes.len() % stride != 0 {
            return Err(ContractError::StrideMismatch {
                expected: stride,
                actual: bytes.len() % stride,
            });
        }
        if bytes.len() != metadata.snapshot_len() {
            return Err(ContractError::MalformedFrame(format!(
                "snapshot carries {} records, metadata declares {}",
                bytes.len() / stride,
                metadata.count
            )));
        }

        let records = bytes
            .chunks_exact(stride)
            .map(|chunk| EntityRecord::read(encoding, chunk))
            .collect::<ContractResult<Vec<_>>>()?;
        let layout = metadata.meta_layout;
        self.visuals = records
            .iter()
            .map(|record| decode_visual(record.meta, layout))
            .collect();
        self.records = records;
        self.metadata = Some(metadata.clone());
        self.generation += 1;
        tracing::debug!(
            count = self.records.len(),
            %encoding,
            %layout,
            generation = self.generation,
            "mirror snapshot applied"
        );
        Ok(())
    }

    /// Applies a binary diff frame and returns the indices whose record
    /// actually changed. Every index is validated before anything is written.
    pub fn apply_diff(&mut self, frame: &[u8]) -> ContractResult<Vec<EntityIndex>> {
        let Some(metadata) = &self.metadata else {
            return Err(ContractError::MalformedFrame(
                "diff received before any snapshot".to_string(),
            ));
        };
        let layout = metadata.meta_layout;
        let entries = decode_diff(frame)?;
        let count = self.records.len();
        if let Some(bad) = entries.iter().find(|e| e.index.as_usize() >= count) {
            return Err(ContractError::IndexOutOfRange {
                index: bad.index,
                count,
            });
        }

        let mut changed = Vec::new();
        for entry in entries {
            let slot = entry.index.as_usize();
            let record = &mut self.records[slot];
            if record.meta == entry.meta && record.attr == entry.attr {
                continue;
            }
            record.meta = entry.meta;
            record.attr = entry.attr;
            self.visuals[slot] = decode_visual(entry.meta, layout);
            changed.push(entry.index);
        }
        self.diffs_applied += 1;
        tracing::trace!(changed = changed.len(), "mirror diff applied");
        Ok(changed)
    }

    /// Drops all state; the next frame must be a snapshot.
    pub fn discard(&mut self) {
        self.metadata = None;
        self.records.clear();
        self.visuals.clear();
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.metadata.as_ref().and_then(|m| m.encoding().ok())
    }

    pub fn record(&self, index: EntityIndex) -> Option<&EntityRecord> {
        self.records.get(index.as_usize())
    }

    pub fn visual(&self, index: EntityIndex) -> Option<&VisualAttrs> {
        self.visuals.get(index.as_usize())
    }

    pub fn fields(&self, index: EntityIndex) -> Option<MetaFields> {
        let codec = MetaCodec::new(self.layout()?);
        self.record(index).map(|r| codec.unpack(r.meta))
    }

    pub fn positions(&self) -> Vec<WorldPoint> {
        self.records.iter().map(|r| r.position).collect()
    }

    pub fn meta_words(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.meta).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bitmask::pack,
        protocol::encode_diff,
        record::DiffEntry,
    };

    fn snapshot(count: usize, encoding: Encoding, layout: MetaLayout) -> (Metadata, Vec<u8>) {
        let mut bytes = Vec::new();
        for i in 0..count {
            let mut record =
                EntityRecord::new(WorldPoint::planar(i as f32 / 10.0, 0.5), i as u32, i as u32);
            record.meta = pack(i as u32, 0, 0, 0, 0);
            record.write(encoding, &mut bytes);
        }
        (Metadata::new(count, encoding, layout), bytes)
    }

    fn diff(entries: &[(u32, u32)]) -> Vec<u8> {
        let entries: Vec<DiffEntry> = entries
            .iter()
            .map(|(index, meta)| DiffEntry {
                index: EntityIndex(*index),
                attr: *index,
                meta: *meta,
            })
            .collect();
        encode_diff(&entries)
    }

    #[test]
    fn test_snapshot_then_diff() {
        let (metadata, bytes) = snapshot(4, Encoding::Compact, MetaLayout::Standard);
        let mut mirror = Mirror::new();
        mirror.apply_snapshot(&metadata, &bytes).unwrap();
        assert_eq!(mirror.len(), 4);
        assert_eq!(mirror.generation(), 1);

        let word = pack(0, 255, 1, 63, 0);
        let changed = mirror.apply_diff(&diff(&[(2, word)])).unwrap();
        assert_eq!(changed, vec![EntityIndex(2)]);
        assert_eq!(mirror.record(EntityIndex(2)).unwrap().meta, word);
        assert!((mirror.visual(EntityIndex(2)).unwrap().luminosity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_diff_application_is_idempotent() {
        let (metadata, bytes) = snapshot(8, Encoding::Extended, MetaLayout::Standard);
        let mut once = Mirror::new();
        let mut twice = Mirror::new();
        once.apply_snapshot(&metadata, &bytes).unwrap();
        twice.apply_snapshot(&metadata, &bytes).unwrap();

        let frame = diff(&[(1, 30), (6, 20)]);
        once.apply_diff(&frame).unwrap();
        twice.apply_diff(&frame).unwrap();
        let second = twice.apply_diff(&frame).unwrap();

        assert!(second.is_empty());
        assert_eq!(once.meta_words(), twice.meta_words());
        assert_eq!(once.record(EntityIndex(1)).unwrap().meta, 30);
    }

    #[test]
    fn test_out_of_range_diff_is_rejected_whole() {
        let (metadata, bytes) = snapshot(3, Encoding::Compact, MetaLayout::Standard);
        let mut mirror = Mirror::new();
        mirror.apply_snapshot(&metadata, &bytes).unwrap();
        let before = mirror.meta_words();

        let err = mirror.apply_diff(&diff(&[(0, 99), (3, 1)])).unwrap_err();
        assert_eq!(
            err,
            ContractError::IndexOutOfRange {
                index: EntityIndex(3),
                count: 3
            }
        );
        assert_eq!(mirror.meta_words(), before);
    }

    #[test]
    fn test_snapshot_length_and_stride_checks() {
        let (metadata, bytes) = snapshot(3, Encoding::Extended, MetaLayout::Standard);
        let mut mirror = Mirror::new();

        let err = mirror.apply_snapshot(&metadata, &bytes[..bytes.len() - 5]).unwrap_err();
        assert!(matches!(err, ContractError::StrideMismatch { expected: 28, .. }));

        let err = mirror.apply_snapshot(&metadata, &bytes[..56]).unwrap_err();
        assert!(matches!(err, ContractError::MalformedFrame(_)));
        assert!(!mirror.is_ready());
    }

    #[test]
    fn test_diff_before_snapshot_and_layout_pin() {
        let mut mirror = Mirror::with_layout(MetaLayout::Standard);
        assert!(matches!(
            mirror.apply_diff(&diff(&[(0, 1)])),
            Err(ContractError::MalformedFrame(_))
        ));

        let (metadata, bytes) = snapshot(2, Encoding::Compact, MetaLayout::Domain);
        assert!(matches!(
            mirror.apply_snapshot(&metadata, &bytes),
            Err(ContractError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn test_discard_requires_new_snapshot() {
        let (metadata, bytes) = snapshot(2, Encoding::Compact, MetaLayout::Standard);
        let mut mirror = Mirror::new();
        mirror.apply_snapshot(&metadata, &bytes).unwrap();
        mirror.discard();
        assert!(!mirror.is_ready());
        assert!(mirror.apply_diff(&diff(&[(0, 1)])).is_err());
        mirror.apply_snapshot(&metadata, &bytes).unwrap();
        assert_eq!(mirror.generation(), 2);
    }
}
