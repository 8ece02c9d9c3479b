//! Copy-on-write data buffers.
//!
//! A [`Buffer`] is a cheap handle: cloning it shares the payload and the
//! metadata. Mutating accessors such as [`Buffer::data_mut`] copy the
//! contents first when another handle still refers to them. A buffer that
//! has been handed to several consumers (for example by a tee) is therefore
//! immutable from each consumer's point of view.

use crate::clock::ClockTime;
use std::sync::Arc;

// ============================================================================
// Flags
// ============================================================================

/// Flags describing a buffer's relation to the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BufferFlags(u32);

impl BufferFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Data is not contiguous with the previous buffer.
    pub const DISCONT: Self = Self(1 << 0);
    /// Buffer cannot be decoded on its own (not a keyframe).
    pub const DELTA_UNIT: Self = Self(1 << 1);
    /// Buffer marks a gap; the payload carries no meaningful data.
    pub const GAP: Self = Self(1 << 2);
    /// Buffer may be dropped under load.
    pub const DROPPABLE: Self = Self(1 << 3);
    /// Buffer carries stream headers.
    pub const HEADER: Self = Self(1 << 4);

    /// Check if all bits of `flag` are set.
    #[inline]
    pub const fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    /// Set a flag.
    #[inline]
    pub const fn insert(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    /// Clear a flag.
    #[inline]
    pub const fn remove(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }

    /// Check if no flag is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.insert(rhs)
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Timing and sequencing metadata carried by every buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferMeta {
    /// Presentation timestamp.
    pub pts: ClockTime,
    /// Decode timestamp.
    pub dts: ClockTime,
    /// Duration of the contents.
    pub duration: ClockTime,
    /// Media-specific sequence offset (byte or sample position).
    pub offset: Option<u64>,
    /// Offset of the last unit plus one.
    pub offset_end: Option<u64>,
    /// Flags.
    pub flags: BufferFlags,
}

impl Default for BufferMeta {
    fn default() -> Self {
        Self {
            pts: ClockTime::NONE,
            dts: ClockTime::NONE,
            duration: ClockTime::NONE,
            offset: None,
            offset_end: None,
            flags: BufferFlags::NONE,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct BufferInner {
    data: Vec<u8>,
    meta: BufferMeta,
}

// ============================================================================
// Buffer
// ============================================================================

/// A chunk of payload plus timing metadata.
///
/// # Example
///
/// ```rust
/// use sluice::buffer::Buffer;
/// use sluice::clock::ClockTime;
///
/// let mut a = Buffer::from_vec(vec![1, 2, 3]);
/// a.set_pts(ClockTime::from_millis(40));
///
/// let mut b = a.clone();
/// assert!(Buffer::ptr_eq(&a, &b));
///
/// // Writing to a shared buffer copies it first.
/// b.data_mut()[0] = 9;
/// assert_eq!(a.data(), &[1, 2, 3]);
/// assert_eq!(b.data(), &[9, 2, 3]);
/// assert_eq!(b.pts(), ClockTime::from_millis(40));
/// ```
#[derive(Clone, Default)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer owning `data`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                data,
                meta: BufferMeta::default(),
            }),
        }
    }

    /// Create a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Create a zero-filled buffer of `size` bytes.
    pub fn with_size(size: usize) -> Self {
        Self::from_vec(vec![0; size])
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Metadata.
    pub fn meta(&self) -> &BufferMeta {
        &self.inner.meta
    }

    /// Presentation timestamp.
    pub fn pts(&self) -> ClockTime {
        self.inner.meta.pts
    }

    /// Decode timestamp.
    pub fn dts(&self) -> ClockTime {
        self.inner.meta.dts
    }

    /// Duration.
    pub fn duration(&self) -> ClockTime {
        self.inner.meta.duration
    }

    /// Sequence offset.
    pub fn offset(&self) -> Option<u64> {
        self.inner.meta.offset
    }

    /// Flags.
    pub fn flags(&self) -> BufferFlags {
        self.inner.meta.flags
    }

    /// Whether this handle is the only reference, so writes need no copy.
    pub fn is_writable(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Whether two handles share the same contents.
    pub fn ptr_eq(a: &Buffer, b: &Buffer) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn make_mut(&mut self) -> &mut BufferInner {
        Arc::make_mut(&mut self.inner)
    }

    /// Mutable payload, copying first if shared.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.make_mut().data
    }

    /// Mutable metadata, copying first if shared.
    pub fn meta_mut(&mut self) -> &mut BufferMeta {
        &mut self.make_mut().meta
    }

    /// Set the presentation timestamp.
    pub fn set_pts(&mut self, pts: ClockTime) {
        self.meta_mut().pts = pts;
    }

    /// Set the decode timestamp.
    pub fn set_dts(&mut self, dts: ClockTime) {
        self.meta_mut().dts = dts;
    }

    /// Set the duration.
    pub fn set_duration(&mut self, duration: ClockTime) {
        self.meta_mut().duration = duration;
    }

    /// Set the sequence offsets.
    pub fn set_offset(&mut self, offset: Option<u64>, offset_end: Option<u64>) {
        let meta = self.meta_mut();
        meta.offset = offset;
        meta.offset_end = offset_end;
    }

    /// Set a flag.
    pub fn set_flags(&mut self, flags: BufferFlags) {
        let meta = self.meta_mut();
        meta.flags = meta.flags.insert(flags);
    }

    /// Clear a flag.
    pub fn unset_flags(&mut self, flags: BufferFlags) {
        let meta = self.meta_mut();
        meta.flags = meta.flags.remove(flags);
    }

    /// Builder-style presentation timestamp.
    pub fn with_pts(mut self, pts: ClockTime) -> Self {
        self.set_pts(pts);
        self
    }

    /// Builder-style duration.
    pub fn with_duration(mut self, duration: ClockTime) -> Self {
        self.set_duration(duration);
        self
    }

    /// Builder-style offset.
    pub fn with_offset(mut self, offset: u64) -> Self {
        let end = offset + self.len() as u64;
        self.set_offset(Some(offset), Some(end));
        self
    }

    /// Copy `len` bytes starting at `offset` into a new private buffer.
    ///
    /// Metadata is carried over. The range is clamped to the payload.
    pub fn copy_region(&self, offset: usize, len: usize) -> Buffer {
        let start = offset.min(self.len());
        let end = start.saturating_add(len).min(self.len());
        let mut out = Buffer::from_slice(&self.inner.data[start..end]);
        *out.meta_mut() = self.inner.meta;
        out
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer::from_vec(data)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("pts", &self.pts())
            .field("duration", &self.duration())
            .field("offset", &self.offset())
            .field("flags", &self.flags())
            .finish()
    }
}
