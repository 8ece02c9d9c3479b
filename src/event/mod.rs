//! Events: out-of-band control that travels across links next to buffers.
//!
//! # Direction
//!
//! - **Downstream** events follow the data: stream-start, caps, segment,
//!   tags, gap, EOS.
//! - **Upstream** events go against it: seek, QoS, reconfigure.
//! - Flush events travel both ways.
//!
//! # Serialization
//!
//! Serialized events keep their position relative to buffers and go
//! through queues. Non-serialized events (flush-start, seek, QoS) overtake
//! queued data so they take effect immediately.
//!
//! # Sticky events
//!
//! Stream-start, caps, segment and tags describe the stream itself. A pad
//! remembers the last one of each kind and replays them to a new peer
//! before the next buffer, so an element linked mid-stream still learns the
//! format and timeline.
//!
//! # Example
//!
//! ```rust
//! use sluice::event::{Event, EventView, TagList};
//!
//! let mut tags = TagList::new();
//! tags.set("title", "Intro");
//!
//! let event = Event::tag(tags);
//! assert!(event.is_downstream());
//! assert!(event.is_serialized());
//! assert!(event.is_sticky());
//! assert!(matches!(event.view(), EventView::Tag(_)));
//! ```

mod tags;

pub use tags::{TagList, TagMergeMode, TagValue, names as tag_names};

use crate::buffer::Buffer;
use crate::caps::{Caps, Structure};
use crate::clock::ClockTime;
use std::sync::atomic::{AtomicU32, Ordering};

static SEQNUM: AtomicU32 = AtomicU32::new(1);

/// Allocate a fresh sequence number.
///
/// Events and messages that belong together (a seek and the flush it
/// causes, an EOS event and its EOS message) share one.
pub fn next_seqnum() -> u32 {
    SEQNUM.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Event
// ============================================================================

/// An event plus its sequence number.
#[derive(Debug, Clone)]
pub struct Event {
    view: EventView,
    seqnum: u32,
}

/// The payload of an [`Event`].
#[derive(Debug, Clone)]
pub enum EventView {
    // ========== Downstream ==========
    /// Start of a new stream.
    StreamStart(StreamStart),
    /// Fixed format of the buffers that follow.
    Caps(Caps),
    /// Timeline of the buffers that follow.
    Segment(Segment),
    /// Stream metadata.
    Tag(TagList),
    /// No data for a period of time.
    Gap {
        /// Start of the gap.
        timestamp: ClockTime,
        /// Length of the gap.
        duration: ClockTime,
    },
    /// No more data will follow.
    Eos,
    /// Application-defined, serialized with data.
    CustomDownstream(Structure),

    // ========== Upstream ==========
    /// Request to move to a new position.
    Seek(Seek),
    /// Processing-rate feedback.
    Qos(Qos),
    /// Ask upstream to renegotiate.
    Reconfigure,
    /// Application-defined, travelling upstream.
    CustomUpstream(Structure),

    // ========== Both ==========
    /// Discard queued data and unblock every waiter.
    FlushStart,
    /// Resume after a flush.
    FlushStop {
        /// Whether running time restarts at zero.
        reset_time: bool,
    },
}

impl Event {
    fn new(view: EventView) -> Self {
        Self {
            view,
            seqnum: next_seqnum(),
        }
    }

    /// Stream-start event.
    pub fn stream_start(stream_id: impl Into<String>) -> Self {
        Self::new(EventView::StreamStart(StreamStart::new(stream_id)))
    }

    /// Caps event announcing a fixed format.
    pub fn caps(caps: Caps) -> Self {
        Self::new(EventView::Caps(caps))
    }

    /// Segment event.
    pub fn segment(segment: Segment) -> Self {
        Self::new(EventView::Segment(segment))
    }

    /// Tag event.
    pub fn tag(tags: TagList) -> Self {
        Self::new(EventView::Tag(tags))
    }

    /// Gap event.
    pub fn gap(timestamp: ClockTime, duration: ClockTime) -> Self {
        Self::new(EventView::Gap {
            timestamp,
            duration,
        })
    }

    /// End-of-stream event.
    pub fn eos() -> Self {
        Self::new(EventView::Eos)
    }

    /// Seek event.
    pub fn seek(seek: Seek) -> Self {
        Self::new(EventView::Seek(seek))
    }

    /// QoS event.
    pub fn qos(qos: Qos) -> Self {
        Self::new(EventView::Qos(qos))
    }

    /// Reconfigure event.
    pub fn reconfigure() -> Self {
        Self::new(EventView::Reconfigure)
    }

    /// Flush-start event.
    pub fn flush_start() -> Self {
        Self::new(EventView::FlushStart)
    }

    /// Flush-stop event.
    pub fn flush_stop(reset_time: bool) -> Self {
        Self::new(EventView::FlushStop { reset_time })
    }

    /// Custom downstream event.
    pub fn custom_downstream(data: Structure) -> Self {
        Self::new(EventView::CustomDownstream(data))
    }

    /// Custom upstream event.
    pub fn custom_upstream(data: Structure) -> Self {
        Self::new(EventView::CustomUpstream(data))
    }

    /// Replace the sequence number, tying this event to another.
    pub fn with_seqnum(mut self, seqnum: u32) -> Self {
        self.seqnum = seqnum;
        self
    }

    /// The payload.
    pub fn view(&self) -> &EventView {
        &self.view
    }

    /// Take the payload.
    pub fn into_view(self) -> EventView {
        self.view
    }

    /// Sequence number.
    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    /// Whether this event may travel downstream.
    pub fn is_downstream(&self) -> bool {
        !matches!(
            self.view,
            EventView::Seek(_) | EventView::Qos(_) | EventView::Reconfigure | EventView::CustomUpstream(_)
        )
    }

    /// Whether this event may travel upstream.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self.view,
            EventView::Seek(_)
                | EventView::Qos(_)
                | EventView::Reconfigure
                | EventView::CustomUpstream(_)
                | EventView::FlushStart
                | EventView::FlushStop { .. }
        )
    }

    /// Whether this event keeps its order relative to buffers.
    pub fn is_serialized(&self) -> bool {
        matches!(
            self.view,
            EventView::StreamStart(_)
                | EventView::Caps(_)
                | EventView::Segment(_)
                | EventView::Tag(_)
                | EventView::Gap { .. }
                | EventView::Eos
                | EventView::CustomDownstream(_)
                | EventView::FlushStop { .. }
        )
    }

    /// Whether a pad stores this event for replay to a new peer.
    pub fn is_sticky(&self) -> bool {
        self.sticky_rank().is_some()
    }

    /// Replay order of sticky events; `None` for non-sticky ones.
    pub(crate) fn sticky_rank(&self) -> Option<u8> {
        match self.view {
            EventView::StreamStart(_) => Some(0),
            EventView::Caps(_) => Some(1),
            EventView::Segment(_) => Some(2),
            EventView::Tag(_) => Some(3),
            _ => None,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self.view {
            EventView::StreamStart(_) => "stream-start",
            EventView::Caps(_) => "caps",
            EventView::Segment(_) => "segment",
            EventView::Tag(_) => "tag",
            EventView::Gap { .. } => "gap",
            EventView::Eos => "eos",
            EventView::CustomDownstream(_) => "custom-downstream",
            EventView::Seek(_) => "seek",
            EventView::Qos(_) => "qos",
            EventView::Reconfigure => "reconfigure",
            EventView::CustomUpstream(_) => "custom-upstream",
            EventView::FlushStart => "flush-start",
            EventView::FlushStop { .. } => "flush-stop",
        }
    }
}

// ============================================================================
// Stream start
// ============================================================================

/// Identity of a new stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStart {
    /// Unique stream identifier.
    pub stream_id: String,
    /// Stream flags.
    pub flags: StreamFlags,
    /// Streams that belong together share a group id.
    pub group_id: Option<u32>,
}

impl StreamStart {
    /// Create a stream-start payload with no flags and no group.
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            flags: StreamFlags::NONE,
            group_id: None,
        }
    }
}

/// Flags of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamFlags(u32);

impl StreamFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Sparse stream such as subtitles.
    pub const SPARSE: Self = Self(1 << 0);
    /// Select by default.
    pub const SELECT: Self = Self(1 << 1);

    /// Check if all bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of flags.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

// ============================================================================
// Segment
// ============================================================================

/// Unit of segment positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// Nanoseconds.
    #[default]
    Time,
    /// Bytes.
    Bytes,
    /// Element-specific units (samples, frames).
    Default,
}

/// Flags of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SegmentFlags(u32);

impl SegmentFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Running time was reset.
    pub const RESET: Self = Self(1 << 0);
    /// Segment comes from a segment seek; no EOS at its end.
    pub const SEGMENT: Self = Self(1 << 3);

    /// Check if all bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// The timeline that maps buffer timestamps to running time.
///
/// Positions are in `format` units. `stop` of `None` means open-ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Unit of all positions.
    pub format: Format,
    /// Playback rate; negative plays backwards.
    pub rate: f64,
    /// Rate already applied upstream.
    pub applied_rate: f64,
    /// Flags.
    pub flags: SegmentFlags,
    /// Running time at which this segment starts.
    pub base: u64,
    /// First position to play.
    pub start: u64,
    /// Last position to play.
    pub stop: Option<u64>,
    /// Stream time at `start`.
    pub time: u64,
    /// Last known position.
    pub position: u64,
}

impl Segment {
    /// An open-ended segment in `format`, starting at zero.
    pub fn new(format: Format) -> Self {
        Self {
            format,
            rate: 1.0,
            applied_rate: 1.0,
            flags: SegmentFlags::NONE,
            base: 0,
            start: 0,
            stop: None,
            time: 0,
            position: 0,
        }
    }

    /// A time segment covering `start..stop`.
    pub fn new_time(start: ClockTime, stop: Option<ClockTime>) -> Self {
        Self {
            start: start.nanos(),
            stop: stop.map(ClockTime::nanos),
            time: start.nanos(),
            position: start.nanos(),
            ..Self::new(Format::Time)
        }
    }

    /// Clip a position range to the segment.
    ///
    /// Returns `None` when the range lies entirely outside.
    pub fn clip(&self, start: u64, stop: Option<u64>) -> Option<(u64, Option<u64>)> {
        if let Some(seg_stop) = self.stop
            && start >= seg_stop
            && !(start == seg_stop && stop == Some(start))
        {
            return None;
        }
        if let Some(stop) = stop
            && stop < self.start
        {
            return None;
        }
        let clipped_start = start.max(self.start);
        let clipped_stop = match (stop, self.stop) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Some((clipped_start, clipped_stop))
    }

    /// Convert a position to running time.
    ///
    /// Positions outside the segment have no running time.
    pub fn to_running_time(&self, position: u64) -> Option<u64> {
        if position < self.start || self.stop.is_some_and(|stop| position > stop) {
            return None;
        }
        let offset = if self.rate >= 0.0 {
            position - self.start
        } else {
            self.stop? - position
        };
        let scaled = if self.rate.abs() == 1.0 {
            offset
        } else {
            (offset as f64 / self.rate.abs()) as u64
        };
        Some(self.base + scaled)
    }

    /// Convert a position to stream time.
    pub fn to_stream_time(&self, position: u64) -> Option<u64> {
        if position < self.start || self.stop.is_some_and(|stop| position > stop) {
            return None;
        }
        Some(self.time + position - self.start)
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::new(Format::Time)
    }
}

// ============================================================================
// Seek
// ============================================================================

/// Flags of a seek request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeekFlags(u32);

impl SeekFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Flush the pipeline before seeking.
    pub const FLUSH: Self = Self(1 << 0);
    /// Seek to the exact position.
    pub const ACCURATE: Self = Self(1 << 1);
    /// Seek to the nearest keyframe.
    pub const KEY_UNIT: Self = Self(1 << 2);
    /// Post a segment-done message instead of EOS.
    pub const SEGMENT: Self = Self(1 << 3);

    /// Check if all bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of flags.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// How a seek boundary is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SeekType {
    /// Leave the boundary unchanged.
    #[default]
    None,
    /// Absolute position.
    Set,
    /// Relative to the end of the stream.
    End,
}

/// A seek request.
#[derive(Debug, Clone, PartialEq)]
pub struct Seek {
    /// Requested rate.
    pub rate: f64,
    /// Unit of `start` and `stop`.
    pub format: Format,
    /// Flags.
    pub flags: SeekFlags,
    /// How `start` is interpreted.
    pub start_type: SeekType,
    /// New start position.
    pub start: u64,
    /// How `stop` is interpreted.
    pub stop_type: SeekType,
    /// New stop position.
    pub stop: Option<u64>,
}

impl Seek {
    /// A flushing seek to an absolute time.
    pub fn flushing_to(position: ClockTime) -> Self {
        Self {
            rate: 1.0,
            format: Format::Time,
            flags: SeekFlags::FLUSH,
            start_type: SeekType::Set,
            start: position.nanos(),
            stop_type: SeekType::None,
            stop: None,
        }
    }

    /// Builder-style flags.
    pub fn with_flags(mut self, flags: SeekFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Build the segment this seek produces when applied to `current`.
    pub fn apply(&self, current: &Segment) -> Segment {
        let mut segment = current.clone();
        segment.format = self.format;
        segment.rate = self.rate;
        if self.start_type == SeekType::Set {
            segment.start = self.start;
            segment.time = self.start;
            segment.position = self.start;
        }
        if self.stop_type == SeekType::Set {
            segment.stop = self.stop;
        }
        if self.flags.contains(SeekFlags::FLUSH) {
            segment.base = 0;
            segment.flags = SegmentFlags::RESET;
        }
        segment
    }
}

// ============================================================================
// QoS
// ============================================================================

/// Kind of QoS feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosType {
    /// Downstream is late.
    Underflow,
    /// Downstream is early.
    Overflow,
    /// Upstream should throttle.
    Throttle,
}

/// Processing-rate feedback sent upstream by sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct Qos {
    /// Kind of feedback.
    pub qos_type: QosType,
    /// Ratio of actual to ideal processing rate.
    pub proportion: f64,
    /// Lateness in nanoseconds; negative is early.
    pub diff: i64,
    /// Timestamp of the buffer that triggered the feedback.
    pub timestamp: ClockTime,
}

// ============================================================================
// Stream item
// ============================================================================

/// A buffer or a serialized event, as stored in queues.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// Data.
    Buffer(Buffer),
    /// Serialized event.
    Event(Event),
}

impl StreamItem {
    /// Payload size in bytes; events count as zero.
    pub fn size(&self) -> usize {
        match self {
            StreamItem::Buffer(b) => b.len(),
            StreamItem::Event(_) => 0,
        }
    }

    /// Duration; events count as zero.
    pub fn duration(&self) -> ClockTime {
        match self {
            StreamItem::Buffer(b) if b.duration().is_some() => b.duration(),
            _ => ClockTime::ZERO,
        }
    }

    /// Whether this is a buffer.
    pub fn is_buffer(&self) -> bool {
        matches!(self, StreamItem::Buffer(_))
    }
}

impl From<Buffer> for StreamItem {
    fn from(buffer: Buffer) -> Self {
        StreamItem::Buffer(buffer)
    }
}

impl From<Event> for StreamItem {
    fn from(event: Event) -> Self {
        StreamItem::Event(event)
    }
}
