//! The virtual buffer: a logically contiguous byte sequence backed by a
//! list of physically disjoint segments (spec.md section 4.2), grounded on
//! `examples/madsmtm-apple-platform-rs/apfs-core/src/block.rs`'s
//! `BlockReader`/`Block` split between "where the bytes physically live"
//! and "how a caller addresses them" -- generalized here to a segment
//! *list* instead of a single block, and to owned segments in addition to
//! externally-owned ones.

use bytes::{Bytes, BytesMut};
use std::io::Write;
use std::path::Path;

use crate::error::{PrinbeeError, Result};

/// One contiguous run of bytes inside a [`VirtualBuffer`].
enum Segment {
    /// A byte range this buffer allocated and owns outright.
    Owned(BytesMut),
    /// A byte range borrowed from an externally-owned block or page,
    /// referenced by a caller-assigned block id and the byte range inside
    /// it (spec.md section 4.2: "so a structure can read/write directly
    /// into a cached page without copying").
    BlockBacked { block_id: u64, data: Bytes },
}

impl Segment {
    fn len(&self) -> usize {
        match self {
            Self::Owned(buf) => buf.len(),
            Self::BlockBacked { data, .. } => data.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(buf) => buf.as_ref(),
            Self::BlockBacked { data, .. } => data.as_ref(),
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Owned(buf) => Some(buf.as_mut()),
            Self::BlockBacked { .. } => None,
        }
    }

    /// The sub-range `start..end` of this segment, as a segment of the same
    /// kind (a zero-copy `Bytes::slice` for `BlockBacked`, a fresh copy of
    /// just that range for `Owned`).
    fn subrange(&self, start: usize, end: usize) -> Self {
        match self {
            Self::Owned(buf) => Self::Owned(BytesMut::from(&buf[start..end])),
            Self::BlockBacked { block_id, data } => Self::BlockBacked {
                block_id: *block_id,
                data: data.slice(start..end),
            },
        }
    }
}

/// A logically contiguous byte buffer physically split across any number
/// of [`Segment`]s (spec.md section 4.2).
#[derive(Default)]
pub struct VirtualBuffer {
    segments: Vec<Segment>,
}

impl VirtualBuffer {
    pub fn new() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut buf = Self::new();
        if !data.is_empty() {
            buf.segments.push(Segment::Owned(BytesMut::from(data.as_slice())));
        }
        buf
    }

    /// Append an externally-owned, block-backed range without copying it.
    pub fn append_block_backed(&mut self, block_id: u64, data: Bytes) {
        self.segments.push(Segment::BlockBacked { block_id, data });
    }

    /// Total logical size in bytes.
    pub fn size(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Number of physical segments, a fragmentation diagnostic (spec.md
    /// section 4.2).
    pub fn count_buffers(&self) -> usize {
        self.segments.len()
    }

    /// The backing block id for the segment holding logical offset `at`,
    /// or `None` when that byte lives in an owned segment.
    pub fn block_id_at(&self, at: usize) -> Option<u64> {
        let (index, _) = self.locate(at)?;
        match self.segments.get(index)? {
            Segment::BlockBacked { block_id, .. } => Some(*block_id),
            Segment::Owned(_) => None,
        }
    }

    /// Locate the segment (and offset inside it) containing logical
    /// offset `at`. Returns the segment index and the position counting
    /// from the start of the logical buffer where that segment begins.
    fn locate(&self, at: usize) -> Option<(usize, usize)> {
        let mut base = 0;
        for (index, segment) in self.segments.iter().enumerate() {
            let len = segment.len();
            if at < base + len || (at == base + len && len == 0) {
                return Some((index, base));
            }
            base += len;
        }
        if at == base {
            Some((self.segments.len(), base))
        } else {
            None
        }
    }

    /// Write `data` at logical `offset`. If `grow` is true and the write
    /// extends past the current size, new owned segments are appended
    /// (spec.md section 4.2).
    pub fn pwrite(&mut self, data: &[u8], offset: usize, grow: bool) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| PrinbeeError::OutOfRange("pwrite offset overflow".into()))?;

        if end > self.size() {
            if !grow {
                return Err(PrinbeeError::OutOfRange(format!(
                    "pwrite at {offset}..{end} exceeds buffer size {} and grow=false",
                    self.size()
                )));
            }
            let pad = offset.saturating_sub(self.size());
            if pad > 0 {
                self.segments.push(Segment::Owned(BytesMut::zeroed(pad)));
            }
            self.segments.push(Segment::Owned(BytesMut::from(data)));
            return Ok(());
        }

        let mut remaining = data;
        let mut cursor = offset;
        while !remaining.is_empty() {
            let (index, base) = self
                .locate(cursor)
                .ok_or_else(|| PrinbeeError::LogicError("pwrite located no segment".into()))?;
            let segment = &mut self.segments[index];
            let segment_offset = cursor - base;
            let available = segment.len() - segment_offset;
            let take = remaining.len().min(available);

            match segment.as_mut_slice() {
                Some(slice) => slice[segment_offset..segment_offset + take]
                    .copy_from_slice(&remaining[..take]),
                None => {
                    // A block-backed segment is read-only from the
                    // buffer's point of view; copy it into an owned
                    // segment before mutating (mirrors the original's
                    // copy-on-write semantics for cached pages).
                    self.split_to_owned(index);
                    continue;
                }
            }

            remaining = &remaining[take..];
            cursor += take;
        }
        Ok(())
    }

    /// Replace the block-backed segment at `index` with an owned copy of
    /// the same bytes, so a subsequent write can mutate in place.
    fn split_to_owned(&mut self, index: usize) {
        if let Segment::BlockBacked { data, .. } = &self.segments[index] {
            self.segments[index] = Segment::Owned(BytesMut::from(data.as_ref()));
        }
    }

    /// Read up to `size` bytes starting at `offset`, returning the number
    /// of bytes actually read. If `require_full` is set and fewer are
    /// available, fails instead of short-reading (spec.md section 4.2).
    pub fn pread(&self, size: usize, offset: usize, require_full: bool) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        let mut cursor = offset;
        while out.len() < size {
            let Some((index, base)) = self.locate(cursor) else { break };
            let Some(segment) = self.segments.get(index) else { break };
            let segment_offset = cursor - base;
            if segment_offset >= segment.len() {
                break;
            }
            let available = segment.len() - segment_offset;
            let take = (size - out.len()).min(available);
            out.extend_from_slice(&segment.as_slice()[segment_offset..segment_offset + take]);
            cursor += take;
        }

        if require_full && out.len() < size {
            return Err(PrinbeeError::CorruptedData(format!(
                "pread wanted {size} bytes at {offset}, only {} available",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Shift everything at and past `offset` forward by `data.len()`
    /// bytes, then write `data` into the resulting hole (spec.md section
    /// 4.2). Touches only the one segment `offset` falls inside (or none,
    /// when it lands exactly on a segment boundary) -- O(S+k) in the
    /// number of segments and `data.len()`, not the buffer's total size.
    pub fn pinsert(&mut self, data: &[u8], offset: usize) -> Result<()> {
        if offset > self.size() {
            return Err(PrinbeeError::OutOfRange(format!(
                "pinsert at {offset} exceeds buffer size {}",
                self.size()
            )));
        }
        let new_segment = Segment::Owned(BytesMut::from(data));
        let (index, base) = self
            .locate(offset)
            .ok_or_else(|| PrinbeeError::LogicError("pinsert located no segment".into()))?;

        if index >= self.segments.len() {
            // Appending past the last segment.
            self.segments.push(new_segment);
            return Ok(());
        }

        let segment_offset = offset - base;
        if segment_offset == 0 {
            self.segments.insert(index, new_segment);
        } else if segment_offset == self.segments[index].len() {
            self.segments.insert(index + 1, new_segment);
        } else {
            let segment = self.segments.remove(index);
            let before = segment.subrange(0, segment_offset);
            let after = segment.subrange(segment_offset, segment.len());
            self.segments.insert(index, after);
            self.segments.insert(index, new_segment);
            self.segments.insert(index, before);
        }
        Ok(())
    }

    /// Remove up to `size` bytes starting at `offset`, clamping at the
    /// buffer's end and returning the number of bytes actually removed
    /// (spec.md section 4.2). Only segments overlapping the erased range
    /// are split or dropped; untouched segments (including `BlockBacked`
    /// ones elsewhere in the buffer) are moved back as-is -- O(S+k) in the
    /// number of segments and `size`, not the buffer's total size.
    pub fn perase(&mut self, size: usize, offset: usize) -> Result<usize> {
        let total = self.size();
        if offset >= total || size == 0 {
            return Ok(0);
        }
        let removed = size.min(total - offset);
        let erase_end = offset + removed;

        let old_segments = std::mem::take(&mut self.segments);
        let mut base = 0;
        for segment in old_segments {
            let len = segment.len();
            let seg_start = base;
            let seg_end = base + len;
            base = seg_end;

            if seg_end <= offset || seg_start >= erase_end {
                // Entirely outside the erased range: keep as-is.
                self.segments.push(segment);
                continue;
            }

            let cut_start = offset.saturating_sub(seg_start);
            let cut_end = erase_end.min(seg_end) - seg_start;
            if cut_start > 0 {
                self.segments.push(segment.subrange(0, cut_start));
            }
            if cut_end < len {
                self.segments.push(segment.subrange(cut_end, len));
            }
        }
        Ok(removed)
    }

    /// Read the full logical content of `path` into a fresh buffer. If
    /// `required` is false, a missing file yields an empty buffer instead
    /// of an error (spec.md section 4.2).
    pub fn load_file(path: &Path, required: bool) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => Ok(Self::from_bytes(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => Ok(Self::new()),
            Err(err) => Err(PrinbeeError::Io(err)),
        }
    }

    /// Write the full logical content atomically to `path` (write to a
    /// sibling `.tmp` file then rename over the destination, so a reader
    /// never observes a partially written file).
    pub fn save_file(&self, path: &Path) -> Result<()> {
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = std::path::PathBuf::from(tmp_name);

        let mut file = std::fs::File::create(&tmp_path)?;
        for segment in &self.segments {
            file.write_all(segment.as_slice())?;
        }
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let mut buf = VirtualBuffer::new();
        buf.pwrite(b"hello world", 0, true).unwrap();
        assert_eq!(buf.pread(5, 0, true).unwrap(), b"hello");
        assert_eq!(buf.size(), 11);
    }

    #[test]
    fn write_without_grow_fails_past_end() {
        let mut buf = VirtualBuffer::new();
        assert!(buf.pwrite(b"abc", 0, false).is_err());
    }

    #[test]
    fn pinsert_shifts_tail() {
        let mut buf = VirtualBuffer::new();
        buf.pwrite(b"helloworld", 0, true).unwrap();
        buf.pinsert(b" ", 5).unwrap();
        assert_eq!(buf.pread(buf.size(), 0, true).unwrap(), b"hello world");
    }

    #[test]
    fn perase_clamps_at_end() {
        let mut buf = VirtualBuffer::new();
        buf.pwrite(b"hello", 0, true).unwrap();
        let removed = buf.perase(100, 2).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(buf.pread(buf.size(), 0, true).unwrap(), b"he");
    }

    #[test]
    fn block_backed_segment_copies_on_write() {
        let mut buf = VirtualBuffer::new();
        buf.append_block_backed(1, Bytes::from_static(b"cached"));
        buf.pwrite(b"X", 0, true).unwrap();
        assert_eq!(buf.pread(buf.size(), 0, true).unwrap(), b"Xached");
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.bin");

        let mut buf = VirtualBuffer::new();
        buf.pwrite(b"persisted", 0, true).unwrap();
        buf.save_file(&path).unwrap();

        let loaded = VirtualBuffer::load_file(&path, true).unwrap();
        assert_eq!(loaded.pread(loaded.size(), 0, true).unwrap(), b"persisted");
    }

    #[test]
    fn missing_optional_file_is_empty() {
        let loaded = VirtualBuffer::load_file(Path::new("/nonexistent/prinbee-test"), false).unwrap();
        assert_eq!(loaded.size(), 0);
    }

    #[test]
    fn perase_preserves_untouched_block_backed_segments() {
        let mut buf = VirtualBuffer::new();
        buf.pwrite(b"head-", 0, true).unwrap();
        buf.append_block_backed(42, Bytes::from_static(b"cached-page"));
        buf.pwrite(b"-tail", buf.size(), true).unwrap();

        let removed = buf.perase(1, 0).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(buf.pread(buf.size(), 0, true).unwrap(), b"ead-cached-page-tail");
        // The block-backed segment itself was never touched, so its
        // block id is still addressable at its (now shifted) offset.
        assert_eq!(buf.block_id_at(4), Some(42));
    }

    /// spec.md section 8, scenario F: random erases against a buffer built
    /// from several chunks must track a plain `Vec<u8>` mirror that
    /// underwent the same erases, regardless of how many segments the
    /// erases fragment the buffer into.
    #[test]
    fn scenario_f_random_erases_match_mirror() {
        let mut state: u64 = 0x5eed_5eed_5eed_5eed;
        let mut next = move || {
            // xorshift64: deterministic, no external RNG dependency.
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut buf = VirtualBuffer::new();
        let mut mirror: Vec<u8> = Vec::new();

        for chunk in 0..20 {
            let len = 1 + (next() % 37) as usize;
            let data: Vec<u8> = (0..len).map(|i| (chunk * 7 + i) as u8).collect();
            let offset = mirror.len();
            buf.pwrite(&data, offset, true).unwrap();
            mirror.extend_from_slice(&data);
        }

        assert_eq!(buf.size(), mirror.len());

        for _ in 0..200 {
            if mirror.is_empty() {
                break;
            }
            let offset = (next() as usize) % mirror.len();
            let size = 1 + (next() as usize) % 23;

            let removed = buf.perase(size, offset).unwrap();
            let end = (offset + size).min(mirror.len());
            let expected_removed = end - offset;
            assert_eq!(removed, expected_removed);
            mirror.drain(offset..end);

            assert_eq!(buf.size(), mirror.len());
            assert_eq!(buf.pread(buf.size(), 0, true).unwrap(), mirror);
        }
    }
}
