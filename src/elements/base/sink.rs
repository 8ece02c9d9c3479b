//! Base for elements that consume data.
//!
//! The adapter implements prerolling: in PAUSED the first buffer (or EOS)
//! completes the asynchronous READY → PAUSED change, and the streaming
//! thread then blocks until PLAYING. In PLAYING buffers are optionally
//! held until their running time on the pipeline clock.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::clock::{ClockId, ClockReturn, ClockTime};
use crate::element::{
    Element, ElementImpl, Pad, PadMode, PadTemplate, State, StateChange, StateChangeResult,
    StateChangeSuccess,
};
use crate::error::{Error, FlowError, FlowResult, FlowSuccess, Result, StateChangeError};
use crate::event::{Event, EventView, Format, Segment};
use crate::message::{Message, MessageView};
use std::ops::ControlFlow;
use std::sync::{Condvar, Mutex, MutexGuard};

/// A consumer of buffers.
///
/// Wrapped in a [`SinkAdapter`], which owns the `sink` pad.
pub trait Sink: Send + 'static {
    /// Consume a buffer in PLAYING.
    fn consume(&mut self, buffer: &Buffer) -> Result<()>;

    /// Look at the first buffer while PAUSED.
    fn preroll(&mut self, buffer: &Buffer) -> Result<()> {
        let _ = buffer;
        Ok(())
    }

    /// Formats this sink accepts.
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

    /// Observe an event that reached the sink.
    fn event(&mut self, event: &Event) {
        let _ = event;
    }

    /// Whether to pull data from upstream when it can serve ranges.
    fn prefers_pull(&self) -> bool {
        false
    }
}

/// Tunables of a [`SinkAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSettings {
    /// Hold buffers until their running time on the pipeline clock.
    pub sync: bool,
    /// Bytes requested per pull in pull mode.
    pub blocksize: usize,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            sync: true,
            blocksize: 4096,
        }
    }
}

#[derive(Debug)]
struct SinkState {
    segment: Segment,
    flushing: bool,
    playing: bool,
    need_preroll: bool,
    have_preroll: bool,
    eos: bool,
    eos_posted: bool,
    clock_id: Option<ClockId>,
    pull_offset: u64,
    last_buffer: Option<Buffer>,
}

impl Default for SinkState {
    fn default() -> Self {
        Self {
            segment: Segment::default(),
            flushing: false,
            playing: false,
            need_preroll: true,
            have_preroll: false,
            eos: false,
            eos_posted: false,
            clock_id: None,
            pull_offset: 0,
            last_buffer: None,
        }
    }
}

/// [`ElementImpl`] for a [`Sink`].
pub struct SinkAdapter<S: Sink> {
    sink: Mutex<S>,
    settings: Mutex<SinkSettings>,
    state: Mutex<SinkState>,
    cond: Condvar,
}

impl<S: Sink> SinkAdapter<S> {
    /// Wrap `sink` with default settings.
    pub fn new(sink: S) -> Self {
        Self::with_settings(sink, SinkSettings::default())
    }

    /// Wrap `sink`.
    pub fn with_settings(sink: S, settings: SinkSettings) -> Self {
        Self {
            sink: Mutex::new(sink),
            settings: Mutex::new(settings),
            state: Mutex::new(SinkState::default()),
            cond: Condvar::new(),
        }
    }

    /// Wrap `sink` in a new element.
    pub fn element(name: impl Into<String>, sink: S) -> Element {
        Element::new(name, Self::new(sink))
    }

    /// Exclusive access to the wrapped sink.
    pub fn sink(&self) -> MutexGuard<'_, S> {
        self.sink.lock().unwrap()
    }

    /// Current settings.
    pub fn settings(&self) -> SinkSettings {
        self.settings.lock().unwrap().clone()
    }

    /// Enable or disable clock synchronization.
    pub fn set_sync(&self, sync: bool) {
        self.settings.lock().unwrap().sync = sync;
    }

    /// The most recent buffer that reached the sink.
    pub fn last_buffer(&self) -> Option<Buffer> {
        self.state.lock().unwrap().last_buffer.clone()
    }

    /// Whether end-of-stream reached the sink.
    pub fn is_eos(&self) -> bool {
        self.state.lock().unwrap().eos
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap()
    }

    /// Wake the streaming thread and make it return `Flushing`.
    fn set_flushing(&self) {
        let mut st = self.lock();
        st.flushing = true;
        if let Some(id) = st.clock_id.take() {
            id.unschedule();
        }
        drop(st);
        self.cond.notify_all();
    }

    /// Block while prerolled in PAUSED. Returns the held state lock, or
    /// `Flushing` when woken by a flush.
    fn preroll_wait<'a>(
        &'a self,
        mut st: MutexGuard<'a, SinkState>,
    ) -> std::result::Result<MutexGuard<'a, SinkState>, FlowError> {
        while st.need_preroll && !st.playing {
            if st.flushing {
                return Err(FlowError::Flushing);
            }
            tracing::trace!("waiting in preroll");
            st = self.cond.wait(st).unwrap();
        }
        if st.flushing {
            return Err(FlowError::Flushing);
        }
        Ok(st)
    }

    /// Hand the first buffer to the sink and complete the async state
    /// change.
    fn do_preroll(&self, element: &Element, buffer: &Buffer) -> FlowResult {
        {
            let mut st = self.lock();
            if st.have_preroll || st.playing || !st.need_preroll {
                return Ok(FlowSuccess::Ok);
            }
            st.have_preroll = true;
        }
        if let Err(err) = self.sink().preroll(buffer) {
            element.post_error(err, Some("preroll failed".into()));
            element.continue_state(Err(StateChangeError));
            return Err(FlowError::Error);
        }
        tracing::debug!("{}: prerolled", element.name());
        element.commit_state();
        Ok(FlowSuccess::Ok)
    }

    /// Wait until the buffer's running time. `Ok(true)` when it is time to
    /// render, `Ok(false)` when the wait was cancelled by a pause.
    fn do_sync(&self, element: &Element, buffer: &Buffer) -> std::result::Result<bool, FlowError> {
        if !self.settings.lock().unwrap().sync {
            return Ok(true);
        }
        let Some(clock) = element.clock() else {
            return Ok(true);
        };
        let pts = buffer.pts();
        if pts.is_none() {
            return Ok(true);
        }
        let running_time = {
            let st = self.lock();
            if st.segment.format != Format::Time {
                return Ok(true);
            }
            st.segment.to_running_time(pts.nanos())
        };
        let Some(running_time) = running_time else {
            return Ok(true);
        };

        let target = ClockTime::from_nanos(running_time).saturating_add(element.base_time());
        let id = clock.new_single_shot_id(target);
        {
            let mut st = self.lock();
            if st.flushing {
                return Err(FlowError::Flushing);
            }
            if !st.playing {
                return Ok(false);
            }
            st.clock_id = Some(id.clone());
        }
        let ret = clock.wait(&id);
        let mut st = self.lock();
        st.clock_id = None;
        match ret {
            ClockReturn::Unscheduled if st.flushing => Err(FlowError::Flushing),
            ClockReturn::Unscheduled => Ok(false),
            _ => Ok(true),
        }
    }

    fn render(&self, element: &Element, buffer: Buffer) -> FlowResult {
        // Drop buffers entirely outside the segment.
        {
            let st = self.lock();
            if st.segment.format == Format::Time && buffer.pts().is_some() {
                let start = buffer.pts().nanos();
                let stop = buffer
                    .duration()
                    .to_option()
                    .map(|d| start.saturating_add(d.nanos()));
                if st.segment.clip(start, stop).is_none() {
                    tracing::trace!("{}: dropping out-of-segment buffer", element.name());
                    return Ok(FlowSuccess::Ok);
                }
            }
        }

        loop {
            {
                let st = self.lock();
                if st.flushing {
                    return Err(FlowError::Flushing);
                }
                if st.eos {
                    return Err(FlowError::Eos);
                }
            }
            self.do_preroll(element, &buffer)?;
            drop(self.preroll_wait(self.lock())?);
            if self.do_sync(element, &buffer)? {
                break;
            }
            // Paused while waiting on the clock; this buffer prerolls again.
        }

        let result = self.sink().consume(&buffer);
        self.lock().last_buffer = Some(buffer);
        match result {
            Ok(()) => Ok(FlowSuccess::Ok),
            Err(Error::Flow(flow)) => Err(flow),
            Err(err) => {
                element.post_error(err, Some("sink failed to consume".into()));
                Err(FlowError::Error)
            }
        }
    }

    /// End of stream: counts as preroll, posted once PLAYING.
    fn handle_eos(&self, element: &Element) {
        let prerolled = {
            let mut st = self.lock();
            st.eos = true;
            if st.need_preroll && !st.playing && !st.have_preroll {
                st.have_preroll = true;
                true
            } else {
                false
            }
        };
        if prerolled {
            element.commit_state();
        }
        self.post_eos_if_playing(element);
    }

    fn post_eos_if_playing(&self, element: &Element) {
        let post = {
            let mut st = self.lock();
            let post = st.eos && st.playing && !st.eos_posted;
            if post {
                st.eos_posted = true;
            }
            post
        };
        if post {
            tracing::debug!("{}: posting EOS", element.name());
            element.post_message(Message::new(element.name(), MessageView::Eos));
        }
    }

    fn start_pull_task(&self, element: &Element) -> Result<()> {
        let Some(pad) = element.static_pad("sink") else {
            return Err(Error::NoSuchPad(format!("{}:sink", element.name())));
        };
        let weak = element.downgrade();
        pad.start_task(move || {
            let Some(element) = weak.upgrade() else {
                return ControlFlow::Break(());
            };
            let (Some(pad), Some(this)) = (element.static_pad("sink"), element.imp_as::<Self>())
            else {
                return ControlFlow::Break(());
            };
            this.pull_loop(&element, &pad);
            ControlFlow::Continue(())
        })
    }

    fn pull_loop(&self, element: &Element, pad: &Pad) {
        let offset = self.lock().pull_offset;
        let blocksize = self.settings.lock().unwrap().blocksize;
        let result = pad.pull_range(offset, blocksize).and_then(|buffer| {
            self.lock().pull_offset = offset + buffer.len() as u64;
            self.render(element, buffer)
        });
        if let Err(flow) = result {
            tracing::debug!("{}: pausing pull task, reason {flow}", pad.path());
            pad.pause_task();
            match flow {
                FlowError::Eos => self.handle_eos(element),
                FlowError::Flushing => {}
                fatal => element.post_error(Error::Flow(fatal), Some("pulling stopped".into())),
            }
        }
    }
}

impl<S: Sink> ElementImpl for SinkAdapter<S> {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![PadTemplate::sink("sink", self.sink().caps())]
    }

    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        match transition {
            StateChange::NullToReady => {
                if let Err(err) = self.sink().start() {
                    element.post_error(err, Some("failed to start sink".into()));
                    return Err(StateChangeError);
                }
            }
            StateChange::ReadyToPaused => {
                if let Some(pad) = element.static_pad("sink")
                    && pad.mode() == PadMode::Pull
                    && let Err(err) = self.start_pull_task(element)
                {
                    tracing::error!("{}: cannot start pulling: {err}", element.name());
                    return Err(StateChangeError);
                }
                let st = self.lock();
                if st.have_preroll {
                    return Ok(StateChangeSuccess::Success);
                }
                return Ok(StateChangeSuccess::Async);
            }
            StateChange::PausedToPlaying => {
                {
                    let mut st = self.lock();
                    st.playing = true;
                    st.need_preroll = false;
                }
                self.cond.notify_all();
                self.post_eos_if_playing(element);
            }
            StateChange::PlayingToPaused => {
                let mut st = self.lock();
                st.playing = false;
                st.need_preroll = true;
                st.have_preroll = st.eos;
                if let Some(id) = st.clock_id.take() {
                    id.unschedule();
                }
            }
            StateChange::PausedToReady => {
                // Streaming already stopped: pads were deactivated.
                *self.lock() = SinkState::default();
            }
            StateChange::ReadyToNull => {
                if let Err(err) = self.sink().stop() {
                    element.post_error(err, Some("failed to stop sink".into()));
                    return Err(StateChangeError);
                }
            }
        }
        Ok(StateChangeSuccess::Success)
    }

    fn unlock(&self, _element: &Element) {
        self.set_flushing();
    }

    fn chain(&self, element: &Element, _pad: &Pad, buffer: Buffer) -> FlowResult {
        self.render(element, buffer)
    }

    fn sink_event(&self, element: &Element, _pad: &Pad, event: Event) -> bool {
        self.sink().event(&event);
        match event.view() {
            EventView::FlushStart => {
                self.set_flushing();
                true
            }
            EventView::FlushStop { .. } => {
                let reprerolled = {
                    let mut st = self.lock();
                    st.flushing = false;
                    st.eos = false;
                    st.eos_posted = false;
                    st.segment = Segment::default();
                    if !st.playing {
                        st.need_preroll = true;
                        st.have_preroll = false;
                        true
                    } else {
                        false
                    }
                };
                if reprerolled && element.current_state() == State::Paused {
                    element.lost_state();
                }
                true
            }
            EventView::Caps(caps) => match self.sink().set_caps(caps) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!("{}: caps {caps} refused: {err}", element.name());
                    false
                }
            },
            EventView::Segment(segment) => {
                self.lock().segment = segment.clone();
                true
            }
            EventView::StreamStart(_) => {
                element.post_message(Message::new(element.name(), MessageView::StreamStart));
                true
            }
            EventView::Tag(tags) => {
                element.post_message(Message::new(element.name(), MessageView::Tag(tags.clone())));
                true
            }
            EventView::Eos => {
                self.handle_eos(element);
                true
            }
            _ => true,
        }
    }

    fn query_caps(&self, _element: &Element, _pad: &Pad, _filter: Option<&Caps>) -> Caps {
        self.sink().caps()
    }

    fn prefers_pull(&self, _element: &Element, _pad: &Pad) -> bool {
        self.sink().prefers_pull()
    }

    fn is_sink(&self, _element: &Element) -> bool {
        true
    }
}
