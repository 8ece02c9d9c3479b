//! Base for elements that produce data.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::{
    Element, ElementImpl, Pad, PadMode, PadTemplate, StateChange, StateChangeResult,
    StateChangeSuccess,
};
use crate::error::{Error, FlowError, Result, StateChangeError};
use crate::event::{Event, EventView, Seek, Segment};
use std::ops::ControlFlow;
use std::sync::{Condvar, Mutex, MutexGuard};

/// A producer of buffers.
///
/// Wrapped in a [`SourceAdapter`], which owns the `src` pad and runs
/// [`Source::produce`] on the pad's streaming task.
///
/// # Example
///
/// ```rust
/// use sluice::buffer::Buffer;
/// use sluice::elements::base::{Source, SourceAdapter};
/// use sluice::error::Result;
///
/// struct Countdown(u8);
///
/// impl Source for Countdown {
///     fn produce(&mut self) -> Result<Option<Buffer>> {
///         if self.0 == 0 {
///             return Ok(None);
///         }
///         self.0 -= 1;
///         Ok(Some(Buffer::from_slice(&[self.0])))
///     }
/// }
///
/// let src = SourceAdapter::element("countdown", Countdown(3));
/// assert!(src.static_pad("src").is_some());
/// ```
pub trait Source: Send + 'static {
    /// Produce the next buffer. `Ok(None)` ends the stream.
    fn produce(&mut self) -> Result<Option<Buffer>>;

    /// Formats this source can produce.
    fn caps(&self) -> Caps {
        Caps::new_any()
    }

    /// The format was fixed for the stream.
    fn set_caps(&mut self, caps: &Caps) -> Result<()> {
        let _ = caps;
        Ok(())
    }

    /// Acquire resources (NULL → READY).
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release resources (READY → NULL).
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// A live source only produces while PLAYING and cannot preroll.
    fn is_live(&self) -> bool {
        false
    }

    /// Whether [`Source::get_range`] is implemented.
    fn supports_pull(&self) -> bool {
        false
    }

    /// Produce `size` bytes at `offset`. `Ok(None)` means past the end.
    fn get_range(&mut self, offset: u64, size: usize) -> Result<Option<Buffer>> {
        let _ = (offset, size);
        Err(FlowError::NotSupported.into())
    }

    /// Reposition to `segment`. Returns `false` when the source cannot seek.
    fn seek(&mut self, segment: &Segment) -> bool {
        let _ = segment;
        false
    }
}

#[derive(Debug)]
struct StreamState {
    segment: Segment,
    need_stream_start: bool,
    need_segment: bool,
    negotiated: bool,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            segment: Segment::default(),
            need_stream_start: true,
            need_segment: true,
            negotiated: false,
        }
    }
}

/// [`ElementImpl`] for a [`Source`].
pub struct SourceAdapter<S: Source> {
    source: Mutex<S>,
    stream: Mutex<StreamState>,
    playing: Mutex<bool>,
    playing_cond: Condvar,
    last_seek: Mutex<Option<u32>>,
}

impl<S: Source> SourceAdapter<S> {
    /// Wrap `source`.
    pub fn new(source: S) -> Self {
        Self {
            source: Mutex::new(source),
            stream: Mutex::new(StreamState::default()),
            playing: Mutex::new(false),
            playing_cond: Condvar::new(),
            last_seek: Mutex::new(None),
        }
    }

    /// Wrap `source` in a new element.
    pub fn element(name: impl Into<String>, source: S) -> Element {
        Element::new(name, Self::new(source))
    }

    /// Exclusive access to the wrapped source.
    ///
    /// Blocks while the streaming thread is producing.
    pub fn source(&self) -> MutexGuard<'_, S> {
        self.source.lock().unwrap()
    }

    /// The segment of the current stream.
    pub fn segment(&self) -> Segment {
        self.stream.lock().unwrap().segment.clone()
    }

    fn is_live(&self) -> bool {
        self.source().is_live()
    }

    fn src_pad(element: &Element) -> Option<Pad> {
        element.static_pad("src")
    }

    fn start_streaming(&self, element: &Element) -> Result<()> {
        let Some(pad) = Self::src_pad(element) else {
            return Err(Error::NoSuchPad(format!("{}:src", element.name())));
        };
        if pad.mode() != PadMode::Push {
            return Ok(());
        }
        let weak = element.downgrade();
        pad.start_task(move || {
            let Some(element) = weak.upgrade() else {
                return ControlFlow::Break(());
            };
            let (Some(pad), Some(this)) = (Self::src_pad(&element), element.imp_as::<Self>()) else {
                return ControlFlow::Break(());
            };
            this.stream_loop(&element, &pad);
            ControlFlow::Continue(())
        })
    }

    /// Block a live source until PLAYING. `false` when flushing instead.
    fn wait_playing(&self, pad: &Pad) -> bool {
        let mut playing = self.playing.lock().unwrap();
        while !*playing {
            if pad.is_flushing() {
                return false;
            }
            playing = self.playing_cond.wait(playing).unwrap();
        }
        true
    }

    fn wake(&self) {
        let _playing = self.playing.lock().unwrap();
        self.playing_cond.notify_all();
    }

    /// Send what must precede the next buffer: stream start, format and
    /// segment.
    fn prepare_stream(&self, element: &Element, pad: &Pad) -> std::result::Result<(), FlowError> {
        let (need_start, negotiated) = {
            let stream = self.stream.lock().unwrap();
            (stream.need_stream_start, stream.negotiated)
        };
        if need_start {
            pad.push_event(Event::stream_start(element.name()));
            self.stream.lock().unwrap().need_stream_start = false;
        }
        if !negotiated {
            if let Some(caps) = pad.negotiate()? {
                tracing::debug!("{}: negotiated {caps}", pad.path());
                if let Err(err) = self.source().set_caps(&caps) {
                    tracing::warn!("{}: caps {caps} refused: {err}", element.name());
                    return Err(FlowError::NotNegotiated);
                }
            }
            self.stream.lock().unwrap().negotiated = true;
        }
        let segment = {
            let mut stream = self.stream.lock().unwrap();
            let segment = stream.need_segment.then(|| stream.segment.clone());
            stream.need_segment = false;
            segment
        };
        if let Some(segment) = segment {
            pad.push_event(Event::segment(segment));
        }
        Ok(())
    }

    fn stream_loop(&self, element: &Element, pad: &Pad) {
        if self.is_live() && !self.wait_playing(pad) {
            pad.pause_task();
            return;
        }
        if let Err(flow) = self.prepare_stream(element, pad) {
            self.pause_with(element, pad, flow);
            return;
        }

        let produced = self.source().produce();
        let result = match produced {
            Ok(Some(buffer)) => pad.push(buffer).map(|_| ()),
            Ok(None) => Err(FlowError::Eos),
            Err(Error::Flow(flow)) => Err(flow),
            Err(err) => {
                element.post_error(err, Some("source failed to produce".into()));
                Err(FlowError::Error)
            }
        };
        if let Err(flow) = result {
            self.pause_with(element, pad, flow);
        }
    }

    /// Pause the streaming task after a non-ok flow result.
    fn pause_with(&self, element: &Element, pad: &Pad, flow: FlowError) {
        tracing::debug!("{}: pausing task, reason {flow}", pad.path());
        pad.pause_task();
        match flow {
            FlowError::Flushing => {}
            FlowError::Eos => {
                pad.push_event(Event::eos());
            }
            fatal => {
                element.post_error(Error::Flow(fatal), Some("streaming stopped".into()));
                pad.push_event(Event::eos());
            }
        }
    }

    /// The same seek reaches the source once per branch of a fan-out.
    fn is_repeated_seek(&self, event: &Event) -> bool {
        let mut last = self.last_seek.lock().unwrap();
        let repeated = *last == Some(event.seqnum());
        *last = Some(event.seqnum());
        repeated
    }

    /// Reposition the stream. A flushing seek discards data in flight.
    fn perform_seek(&self, element: &Element, seek: &Seek) -> bool {
        let Some(pad) = Self::src_pad(element) else {
            return false;
        };
        let flush = seek.flags.contains(crate::event::SeekFlags::FLUSH);
        tracing::debug!("{}: seek {seek:?}", element.name());

        if flush {
            pad.push_event(Event::flush_start());
            self.wake();
        }
        pad.pause_task();
        let segment = {
            // Wait for the streaming thread to leave its loop iteration.
            let stream_guard = pad.stream_lock();
            let segment = seek.apply(&self.stream.lock().unwrap().segment);
            if !self.source().seek(&segment) {
                tracing::debug!("{}: source cannot seek", element.name());
                drop(stream_guard);
                if flush {
                    pad.push_event(Event::flush_stop(true));
                }
                self.restart(element);
                return false;
            }
            if flush {
                pad.push_event(Event::flush_stop(true));
            }
            let mut stream = self.stream.lock().unwrap();
            stream.segment = segment.clone();
            stream.need_segment = true;
            drop(stream_guard);
            segment
        };
        tracing::debug!("{}: seeked to {}", element.name(), segment.start);
        self.restart(element);
        true
    }

    fn restart(&self, element: &Element) {
        if element.current_state() >= crate::element::State::Paused
            || element.pending_state() >= crate::element::State::Paused
        {
            if let Err(err) = self.start_streaming(element) {
                tracing::warn!("{}: cannot restart streaming: {err}", element.name());
            }
        }
    }
}

impl<S: Source> ElementImpl for SourceAdapter<S> {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![PadTemplate::src("src", self.source().caps())]
    }

    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        let live = self.is_live();
        match transition {
            StateChange::NullToReady => {
                if let Err(err) = self.source().start() {
                    element.post_error(err, Some("failed to start source".into()));
                    return Err(StateChangeError);
                }
            }
            StateChange::ReadyToPaused => {
                *self.stream.lock().unwrap() = StreamState::default();
                if let Err(err) = self.start_streaming(element) {
                    tracing::error!("{}: cannot start streaming: {err}", element.name());
                    return Err(StateChangeError);
                }
                if live {
                    return Ok(StateChangeSuccess::NoPreroll);
                }
            }
            StateChange::PausedToPlaying => {
                *self.playing.lock().unwrap() = true;
                self.playing_cond.notify_all();
            }
            StateChange::PlayingToPaused => {
                *self.playing.lock().unwrap() = false;
                if live {
                    return Ok(StateChangeSuccess::NoPreroll);
                }
            }
            StateChange::PausedToReady => {}
            StateChange::ReadyToNull => {
                if let Err(err) = self.source().stop() {
                    element.post_error(err, Some("failed to stop source".into()));
                    return Err(StateChangeError);
                }
            }
        }
        Ok(StateChangeSuccess::Success)
    }

    fn unlock(&self, _element: &Element) {
        self.wake();
    }

    fn src_event(&self, element: &Element, pad: &Pad, event: Event) -> bool {
        match event.view() {
            EventView::Seek(_) if self.is_repeated_seek(&event) => true,
            EventView::Seek(seek) => self.perform_seek(element, seek),
            EventView::Reconfigure => {
                self.stream.lock().unwrap().negotiated = false;
                true
            }
            _ => {
                tracing::trace!("{}: ignoring {}", pad.path(), event.name());
                false
            }
        }
    }

    fn send_event(&self, element: &Element, event: Event) -> bool {
        match event.view() {
            EventView::Seek(_) if self.is_repeated_seek(&event) => true,
            EventView::Seek(seek) => self.perform_seek(element, seek),
            _ => element.default_send_event(event),
        }
    }

    fn query_caps(&self, _element: &Element, _pad: &Pad, _filter: Option<&Caps>) -> Caps {
        self.source().caps()
    }

    fn get_range(
        &self,
        element: &Element,
        _pad: &Pad,
        offset: u64,
        size: usize,
    ) -> std::result::Result<Buffer, FlowError> {
        match self.source().get_range(offset, size) {
            Ok(Some(buffer)) => Ok(buffer),
            Ok(None) => Err(FlowError::Eos),
            Err(Error::Flow(flow)) => Err(flow),
            Err(err) => {
                element.post_error(err, Some("range request failed".into()));
                Err(FlowError::Error)
            }
        }
    }

    fn supports_pull(&self, _element: &Element, _pad: &Pad) -> bool {
        self.source().supports_pull()
    }

    fn is_source(&self, _element: &Element) -> bool {
        true
    }
}
