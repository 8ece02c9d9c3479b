//! TestSrc element for generating test patterns.
//!
//! Generates buffers of a fixed size filled with a pattern, in push mode
//! from its streaming task or on request in pull mode.

use super::base::{Source, SourceAdapter};
use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::clock::ClockTime;
use crate::element::Element;
use crate::error::Result;
use crate::event::{Format, Segment};
use std::time::{Duration, Instant};

/// Test pattern types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestPattern {
    /// All zeros.
    #[default]
    Zero,
    /// All ones (0xFF).
    Ones,
    /// Incrementing bytes (0, 1, 2, ..., 255, 0, 1, ...).
    Counter,
    /// Random data.
    Random,
    /// Sequence number repeated to fill buffer.
    Sequence,
}

/// A source that generates test pattern buffers.
///
/// Buffer `n` covers bytes `n * blocksize ..` (its offset) and, when a
/// buffer duration is set, starts at `n * duration`.
///
/// # Example
///
/// ```rust
/// use sluice::elements::{TestPattern, TestSrc};
///
/// let src = TestSrc::new()
///     .with_pattern(TestPattern::Counter)
///     .with_blocksize(1024)
///     .with_num_buffers(100)
///     .build("src");
/// assert_eq!(src.name(), "src");
/// ```
pub struct TestSrc {
    pattern: TestPattern,
    blocksize: usize,
    num_buffers: Option<u64>,
    is_live: bool,
    caps: Caps,
    buffer_duration: ClockTime,
    sequence: u64,
    counter: u8,
    rng_state: u64,
    live_start: Option<Instant>,
}

impl TestSrc {
    /// Create a new test source with default settings: 4096-byte zero
    /// buffers, endless, not live, `application/octet-stream`.
    pub fn new() -> Self {
        Self {
            pattern: TestPattern::default(),
            blocksize: 4096,
            num_buffers: None,
            is_live: false,
            caps: Caps::new_simple("application/octet-stream"),
            buffer_duration: ClockTime::NONE,
            sequence: 0,
            counter: 0,
            rng_state: 0x853c49e6748fea9b, // Arbitrary seed
            live_start: None,
        }
    }

    /// Set the test pattern.
    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Set the buffer size.
    pub fn with_blocksize(mut self, size: usize) -> Self {
        self.blocksize = size;
        self
    }

    /// Set the number of buffers to produce before EOS.
    pub fn with_num_buffers(mut self, count: u64) -> Self {
        self.num_buffers = Some(count);
        self
    }

    /// Produce only in PLAYING, paced by the buffer duration.
    pub fn with_live(mut self, live: bool) -> Self {
        self.is_live = live;
        self
    }

    /// Set the formats offered.
    pub fn with_caps(mut self, caps: Caps) -> Self {
        self.caps = caps;
        self
    }

    /// Timestamp buffers: buffer `n` gets pts `n * duration`.
    pub fn with_buffer_duration(mut self, duration: ClockTime) -> Self {
        self.buffer_duration = duration;
        self
    }

    /// Set the random seed (for reproducible Random pattern).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_state = seed;
        self
    }

    /// Wrap in an element.
    pub fn build(self, name: impl Into<String>) -> Element {
        SourceAdapter::element(name, self)
    }

    /// Change the buffer count; `None` is endless.
    pub fn set_num_buffers(&mut self, count: Option<u64>) {
        self.num_buffers = count;
    }

    /// Change the buffer size.
    pub fn set_blocksize(&mut self, size: usize) {
        self.blocksize = size;
    }

    /// Change live mode.
    pub fn set_live(&mut self, live: bool) {
        self.is_live = live;
    }

    /// Get the number of buffers produced.
    pub fn buffers_produced(&self) -> u64 {
        self.sequence
    }

    // Simple xorshift64 PRNG
    fn next_random(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x
    }

    fn fill_buffer(&mut self, data: &mut [u8], sequence: u64) {
        match self.pattern {
            TestPattern::Zero => data.fill(0),
            TestPattern::Ones => data.fill(0xFF),
            TestPattern::Counter => {
                for byte in data.iter_mut() {
                    *byte = self.counter;
                    self.counter = self.counter.wrapping_add(1);
                }
            }
            TestPattern::Random => {
                for chunk in data.chunks_mut(8) {
                    let bytes = self.next_random().to_le_bytes();
                    chunk.copy_from_slice(&bytes[..chunk.len()]);
                }
            }
            TestPattern::Sequence => {
                let seq_bytes = sequence.to_le_bytes();
                for (i, byte) in data.iter_mut().enumerate() {
                    *byte = seq_bytes[i % 8];
                }
            }
        }
    }

    fn total_size(&self) -> Option<u64> {
        self.num_buffers.map(|n| n * self.blocksize as u64)
    }

    fn timestamp(&self, sequence: u64) -> ClockTime {
        match self.buffer_duration.to_option() {
            Some(d) => ClockTime::from_nanos(d.nanos().saturating_mul(sequence)),
            None => ClockTime::NONE,
        }
    }

    /// Sleep until the buffer's time has come on the wall clock.
    fn pace(&mut self, pts: ClockTime) {
        if pts.is_none() {
            return;
        }
        let start = *self.live_start.get_or_insert_with(Instant::now);
        let due = start + Duration::from(pts);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }
}

impl Default for TestSrc {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for TestSrc {
    fn produce(&mut self) -> Result<Option<Buffer>> {
        if let Some(max) = self.num_buffers
            && self.sequence >= max
        {
            return Ok(None);
        }

        let sequence = self.sequence;
        let pts = self.timestamp(sequence);
        if self.is_live {
            self.pace(pts);
        }

        let mut data = vec![0u8; self.blocksize];
        self.fill_buffer(&mut data, sequence);
        self.sequence += 1;

        let mut buffer = Buffer::from_vec(data)
            .with_offset(sequence * self.blocksize as u64)
            .with_pts(pts);
        if self.buffer_duration.is_some() {
            buffer.set_duration(self.buffer_duration);
        }
        Ok(Some(buffer))
    }

    fn caps(&self) -> Caps {
        self.caps.clone()
    }

    fn start(&mut self) -> Result<()> {
        self.sequence = 0;
        self.counter = 0;
        self.live_start = None;
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.is_live
    }

    fn supports_pull(&self) -> bool {
        !self.is_live
    }

    fn get_range(&mut self, offset: u64, size: usize) -> Result<Option<Buffer>> {
        let size = match self.total_size() {
            Some(total) if offset >= total => return Ok(None),
            Some(total) => size.min((total - offset) as usize),
            None => size,
        };
        let mut data = vec![0u8; size];
        let sequence = offset / self.blocksize.max(1) as u64;
        self.fill_buffer(&mut data, sequence);
        Ok(Some(Buffer::from_vec(data).with_offset(offset)))
    }

    fn seek(&mut self, segment: &Segment) -> bool {
        let sequence = match segment.format {
            Format::Bytes => segment.start / self.blocksize.max(1) as u64,
            Format::Time => match self.buffer_duration.to_option() {
                Some(d) if d.nanos() > 0 => segment.start / d.nanos(),
                _ => return segment.start == 0,
            },
            Format::Default => segment.start,
        };
        tracing::debug!("testsrc: seek to buffer {sequence}");
        self.sequence = sequence;
        self.live_start = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testsrc_zero_pattern() {
        let mut src = TestSrc::new().with_blocksize(100).with_num_buffers(1);
        let buf = src.produce().unwrap().unwrap();
        assert_eq!(buf.len(), 100);
        assert!(buf.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_testsrc_counter_pattern() {
        let mut src = TestSrc::new()
            .with_pattern(TestPattern::Counter)
            .with_blocksize(256)
            .with_num_buffers(1);

        let buf = src.produce().unwrap().unwrap();
        for (i, &byte) in buf.data().iter().enumerate() {
            assert_eq!(byte, i as u8);
        }
    }

    #[test]
    fn test_testsrc_random_reproducible() {
        let make = || {
            TestSrc::new()
                .with_pattern(TestPattern::Random)
                .with_blocksize(100)
                .with_seed(12345)
        };
        let a = make().produce().unwrap().unwrap();
        let b = make().produce().unwrap().unwrap();
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_testsrc_num_buffers_and_offsets() {
        let mut src = TestSrc::new().with_blocksize(10).with_num_buffers(3);
        let offsets: Vec<_> = std::iter::from_fn(|| src.produce().unwrap())
            .map(|b| b.offset())
            .collect();
        assert_eq!(offsets, [Some(0), Some(10), Some(20)]);
        assert_eq!(src.buffers_produced(), 3);
    }

    #[test]
    fn test_testsrc_timestamps() {
        let mut src = TestSrc::new()
            .with_blocksize(1)
            .with_buffer_duration(ClockTime::from_millis(10));
        src.produce().unwrap();
        let second = src.produce().unwrap().unwrap();
        assert_eq!(second.pts(), ClockTime::from_millis(10));
        assert_eq!(second.duration(), ClockTime::from_millis(10));
    }

    #[test]
    fn test_testsrc_get_range_clamps_to_end() {
        let mut src = TestSrc::new().with_blocksize(10).with_num_buffers(2);
        assert_eq!(src.get_range(15, 10).unwrap().unwrap().len(), 5);
        assert!(src.get_range(20, 10).unwrap().is_none());
    }

    #[test]
    fn test_testsrc_seek_time() {
        let mut src = TestSrc::new()
            .with_num_buffers(10)
            .with_buffer_duration(ClockTime::from_millis(10));
        assert!(src.seek(&Segment::new_time(ClockTime::from_millis(50), None)));
        let buf = src.produce().unwrap().unwrap();
        assert_eq!(buf.pts(), ClockTime::from_millis(50));
    }
}
