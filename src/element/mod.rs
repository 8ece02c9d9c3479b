//! Elements: the processing nodes of a pipeline.
//!
//! An [`Element`] is a shared handle around an [`ElementImpl`], which holds
//! the element-specific behavior (its state-change hook, chain and event
//! handlers, caps queries). The handle owns everything generic: the pad
//! list, the state machine, the parent link, the clock and message routing.
//!
//! Most elements are written against the simpler `Source`, `Sink` and
//! `Transform` traits in [`crate::elements::base`], whose adapters supply
//! the `ElementImpl`.
//!
//! # State machine
//!
//! [`Element::set_state`] walks one adjacent step at a time
//! (NULL → READY → PAUSED → PLAYING and back), calling
//! [`ElementImpl::change_state`] for each step and posting a
//! `StateChanged` message after each committed step. A step may return
//! `Async` (typically a sink waiting for its first buffer); the element
//! then completes the step later through [`Element::continue_state`],
//! which posts `AsyncDone` and carries on towards the target.
//!
//! # Example
//!
//! ```rust
//! use sluice::element::{Element, State};
//! use sluice::elements::{FakeSink, TestSrc};
//!
//! let src = TestSrc::new().with_num_buffers(3).build("src");
//! let sink = FakeSink::new().build("sink");
//! src.link(&sink).unwrap();
//!
//! sink.set_state(State::Ready).unwrap();
//! assert_eq!(sink.current_state(), State::Ready);
//! sink.set_state(State::Null).unwrap();
//! ```

pub(crate) mod ghost;
mod pad;
mod state;

pub use ghost::GhostPad;
pub use pad::{
    Pad, PadDirection, PadMode, PadPresence, PadTemplate, ProbeData, ProbeId, ProbeReturn,
    ProbeType,
};
pub use state::{State, StateChange, StateChangeResult, StateChangeSuccess, combine};

use crate::bin::BinImpl;
use crate::buffer::Buffer;
use crate::bus::Bus;
use crate::caps::Caps;
use crate::clock::{Clock, ClockTime};
use crate::error::{Error, FlowError, FlowResult, PadLinkError, Result, StateChangeError};
use crate::event::Event;
use crate::message::{Message, MessageView};
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

// ============================================================================
// ElementImpl
// ============================================================================

/// Downcasting support for [`ElementImpl`] objects.
pub trait AsAny {
    /// The value as [`Any`].
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Element-specific behavior.
///
/// Every method has a default, so an implementation overrides only what it
/// needs. Hooks receive the [`Element`] handle they belong to and may be
/// called from any thread: `change_state` from the application thread,
/// `chain` and the event handlers from streaming threads.
pub trait ElementImpl: AsAny + Send + Sync + 'static {
    /// Templates of the pads this element can have. Pads of `Always`
    /// templates are created with the element.
    fn pad_templates(&self) -> Vec<PadTemplate> {
        Vec::new()
    }

    /// Perform one state step.
    ///
    /// Called after pads were activated for `ReadyToPaused` and after they
    /// were deactivated for `PausedToReady`.
    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        let _ = (element, transition);
        Ok(StateChangeSuccess::Success)
    }

    /// Wake any blocking wait in a streaming thread.
    ///
    /// Called before pads are deactivated so that streaming threads blocked
    /// inside the element can return.
    fn unlock(&self, element: &Element) {
        let _ = element;
    }

    /// Process a buffer that arrived on sink pad `pad`.
    fn chain(&self, element: &Element, pad: &Pad, buffer: Buffer) -> FlowResult {
        let _ = (element, buffer);
        tracing::warn!("{}: no chain handler", pad.path());
        Err(FlowError::NotSupported)
    }

    /// Handle an event that arrived on sink pad `pad`. Forwards by default.
    fn sink_event(&self, element: &Element, pad: &Pad, event: Event) -> bool {
        element.forward_event(pad, event)
    }

    /// Handle an event that arrived on source pad `pad`. Forwards by default.
    fn src_event(&self, element: &Element, pad: &Pad, event: Event) -> bool {
        element.forward_event(pad, event)
    }

    /// Formats `pad` can handle. The pad applies the filter afterwards.
    fn query_caps(&self, element: &Element, pad: &Pad, filter: Option<&Caps>) -> Caps {
        let _ = (element, filter);
        pad.template_caps()
    }

    /// Whether sink pad `pad` accepts `caps`.
    fn accept_caps(&self, element: &Element, pad: &Pad, caps: &Caps) -> bool {
        let _ = element;
        caps.is_subset(&pad.query_caps(None))
    }

    /// Serve a pull-mode range request on source pad `pad`.
    fn get_range(
        &self,
        element: &Element,
        pad: &Pad,
        offset: u64,
        size: usize,
    ) -> std::result::Result<Buffer, FlowError> {
        let _ = (element, pad, offset, size);
        Err(FlowError::NotSupported)
    }

    /// Whether source pad `pad` can operate in pull mode.
    fn supports_pull(&self, element: &Element, pad: &Pad) -> bool {
        let _ = (element, pad);
        false
    }

    /// Whether sink pad `pad` would rather pull than be pushed to.
    fn prefers_pull(&self, element: &Element, pad: &Pad) -> bool {
        let _ = (element, pad);
        false
    }

    /// Create a pad for a request template. The element adds it.
    fn request_new_pad(
        &self,
        element: &Element,
        template: &PadTemplate,
        name: Option<&str>,
    ) -> Option<Pad> {
        let _ = (element, template, name);
        None
    }

    /// A request pad is about to be removed.
    fn release_pad(&self, element: &Element, pad: &Pad) {
        let _ = (element, pad);
    }

    /// A clock this element can offer to the pipeline.
    fn provide_clock(&self, element: &Element) -> Option<Arc<dyn Clock>> {
        let _ = element;
        None
    }

    /// Whether the element consumes data at the end of a branch.
    fn is_sink(&self, element: &Element) -> bool {
        let _ = element;
        false
    }

    /// Whether the element produces data at the start of a branch.
    fn is_source(&self, element: &Element) -> bool {
        let _ = element;
        false
    }

    /// Handle an event sent to the element as a whole.
    fn send_event(&self, element: &Element, event: Event) -> bool {
        element.default_send_event(event)
    }

    /// Container behavior, for bins.
    fn as_bin(&self) -> Option<&BinImpl> {
        None
    }
}

// ============================================================================
// Element
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsyncStep {
    Idle,
    /// The hook is running; a completion that arrives meanwhile is parked.
    InHook { early: Option<StateChangeResult> },
    /// The hook returned `Async`; waiting for `continue_state`.
    Waiting,
}

#[derive(Debug)]
struct StateInfo {
    current: State,
    next: State,
    pending: State,
    target: State,
    last_return: StateChangeResult,
    step: AsyncStep,
    locked: bool,
}

pub(crate) struct ElementInner {
    name: String,
    factory: OnceLock<String>,
    templates: Vec<PadTemplate>,
    state_lock: Mutex<()>,
    state: Mutex<StateInfo>,
    state_cond: Condvar,
    // Dropped before the pads so a blocking implementation can release its
    // streaming thread before the pad joins it.
    imp: Box<dyn ElementImpl>,
    pads: Mutex<SmallVec<[Pad; 4]>>,
    parent: Mutex<Weak<ElementInner>>,
    bus: Mutex<Option<Bus>>,
    clock: Mutex<Option<Arc<dyn Clock>>>,
    base_time: AtomicU64,
    start_time: AtomicU64,
}

/// Shared handle to an element.
#[derive(Clone)]
pub struct Element(pub(crate) Arc<ElementInner>);

/// Non-owning element handle.
#[derive(Clone, Default)]
pub struct WeakElement(Weak<ElementInner>);

impl WeakElement {
    /// Get a strong handle if the element is alive.
    pub fn upgrade(&self) -> Option<Element> {
        self.0.upgrade().map(Element)
    }
}

impl Element {
    /// Create an element around `imp`. Pads of `Always` templates are
    /// created immediately.
    pub fn new(name: impl Into<String>, imp: impl ElementImpl) -> Element {
        let templates = imp.pad_templates();
        let element = Element(Arc::new(ElementInner {
            name: name.into(),
            factory: OnceLock::new(),
            templates,
            state_lock: Mutex::new(()),
            state: Mutex::new(StateInfo {
                current: State::Null,
                next: State::VoidPending,
                pending: State::VoidPending,
                target: State::Null,
                last_return: Ok(StateChangeSuccess::Success),
                step: AsyncStep::Idle,
                locked: false,
            }),
            state_cond: Condvar::new(),
            pads: Mutex::new(SmallVec::new()),
            parent: Mutex::new(Weak::new()),
            bus: Mutex::new(None),
            clock: Mutex::new(None),
            base_time: AtomicU64::new(0),
            start_time: AtomicU64::new(0),
            imp: Box::new(imp),
        }));

        let always: Vec<Pad> = element
            .0
            .templates
            .iter()
            .filter(|t| t.presence == PadPresence::Always)
            .map(|t| Pad::from_template(t, t.name.clone()))
            .collect();
        for pad in always {
            if let Err(err) = element.add_pad(&pad) {
                tracing::error!("{}: cannot add template pad: {err}", element.name());
            }
        }
        element
    }

    /// Element name, unique among its siblings.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Name of the factory that created the element, if any.
    pub fn factory_name(&self) -> Option<&str> {
        self.0.factory.get().map(String::as_str)
    }

    pub(crate) fn set_factory_name(&self, name: &str) {
        let _ = self.0.factory.set(name.to_string());
    }

    /// The behavior object.
    pub fn imp(&self) -> &dyn ElementImpl {
        &*self.0.imp
    }

    /// The behavior object as a concrete type.
    pub fn imp_as<T: ElementImpl>(&self) -> Option<&T> {
        self.imp().as_any().downcast_ref::<T>()
    }

    /// Whether this element is a bin.
    pub fn is_bin(&self) -> bool {
        self.imp().as_bin().is_some()
    }

    /// Whether this element is, or contains, a sink.
    pub fn is_sink(&self) -> bool {
        self.imp().is_sink(self)
    }

    /// Whether this element is, or contains, a source.
    pub fn is_source(&self) -> bool {
        self.imp().is_source(self)
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakElement {
        WeakElement(Arc::downgrade(&self.0))
    }

    /// The containing bin.
    pub fn parent(&self) -> Option<Element> {
        self.0.parent.lock().unwrap().upgrade().map(Element)
    }

    pub(crate) fn set_parent(&self, parent: Option<&Element>) -> Result<()> {
        let mut slot = self.0.parent.lock().unwrap();
        match parent {
            Some(p) => {
                if slot.strong_count() > 0 {
                    return Err(Error::AlreadyParented(self.name().to_string()));
                }
                *slot = Arc::downgrade(&p.0);
            }
            None => *slot = Weak::new(),
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Pads
    // ------------------------------------------------------------------------

    /// Add a pad. Fails when the pad already has an element or the name is
    /// taken. Pads added while the element runs are activated.
    pub fn add_pad(&self, pad: &Pad) -> Result<()> {
        if pad.has_parent() {
            return Err(Error::AlreadyParented(pad.name().to_string()));
        }
        {
            let mut pads = self.0.pads.lock().unwrap();
            if pads.iter().any(|p| p.name() == pad.name()) {
                return Err(Error::DuplicateName(pad.name().to_string()));
            }
            pad.set_parent(Arc::downgrade(&self.0));
            pads.push(pad.clone());
        }
        if self.current_state() >= State::Paused || self.pending_state() >= State::Paused {
            pad.activate()?;
        }
        tracing::trace!("{}: added pad {}", self.name(), pad.name());
        Ok(())
    }

    /// Remove a pad: unlink, deactivate and detach it.
    pub fn remove_pad(&self, pad: &Pad) -> Result<()> {
        let removed = {
            let mut pads = self.0.pads.lock().unwrap();
            let before = pads.len();
            pads.retain(|p| p != pad);
            pads.len() != before
        };
        if !removed {
            return Err(Error::NoSuchPad(pad.path()));
        }
        pad.unlink_peer();
        pad.deactivate();
        pad.set_parent(Weak::new());
        Ok(())
    }

    /// All pads, in creation order.
    pub fn pads(&self) -> Vec<Pad> {
        self.0.pads.lock().unwrap().to_vec()
    }

    /// Source pads.
    pub fn src_pads(&self) -> Vec<Pad> {
        self.pads().into_iter().filter(Pad::is_src).collect()
    }

    /// Sink pads.
    pub fn sink_pads(&self) -> Vec<Pad> {
        self.pads().into_iter().filter(Pad::is_sink).collect()
    }

    /// Pad by name.
    pub fn static_pad(&self, name: &str) -> Option<Pad> {
        self.0.pads.lock().unwrap().iter().find(|p| p.name() == name).cloned()
    }

    /// Templates this element was created with.
    pub fn pad_templates(&self) -> &[PadTemplate] {
        &self.0.templates
    }

    /// Template by name pattern.
    pub fn pad_template(&self, name: &str) -> Option<&PadTemplate> {
        self.0.templates.iter().find(|t| t.name == name)
    }

    /// Create and add a pad from the request template `template`.
    pub fn request_pad(&self, template: &str, name: Option<&str>) -> Result<Pad> {
        let tmpl = self
            .pad_template(template)
            .filter(|t| t.presence == PadPresence::Request)
            .ok_or_else(|| Error::NoSuchPad(format!("{}:{template}", self.name())))?;
        let pad = self
            .imp()
            .request_new_pad(self, tmpl, name)
            .ok_or_else(|| Error::NoSuchPad(format!("{}:{template}", self.name())))?;
        self.add_pad(&pad)?;
        Ok(pad)
    }

    /// Release a pad obtained through [`Element::request_pad`].
    pub fn release_request_pad(&self, pad: &Pad) -> Result<()> {
        self.imp().release_pad(self, pad);
        self.remove_pad(pad)
    }

    /// Link the first free compatible source pad of `self` to the first
    /// free compatible sink pad of `dest`, requesting pads when needed.
    pub fn link(&self, dest: &Element) -> Result<()> {
        let src_pads: Vec<Pad> = self.src_pads().into_iter().filter(|p| !p.is_linked()).collect();
        let sink_pads: Vec<Pad> = dest.sink_pads().into_iter().filter(|p| !p.is_linked()).collect();

        let mut last_err = PadLinkError::NoFormat;
        for src in &src_pads {
            for sink in &sink_pads {
                match src.link(sink) {
                    Ok(()) => return Ok(()),
                    Err(err) => last_err = err,
                }
            }
        }

        // No free source pad: request one and offer it to the free sink pads.
        let requested = if src_pads.is_empty() {
            let pad = self.request_any_pad(PadDirection::Src)?;
            for sink in &sink_pads {
                match pad.link(sink) {
                    Ok(()) => return Ok(()),
                    Err(err) => last_err = err,
                }
            }
            Some(pad)
        } else {
            None
        };

        let result = self.link_to_requested_sink(dest, requested.as_slice().iter().chain(&src_pads));
        match result {
            Some(Ok(())) => return Ok(()),
            Some(Err(err)) => last_err = err,
            None => {}
        }
        if let Some(pad) = requested {
            self.release_request_pad(&pad)?;
        }
        if sink_pads.is_empty() && result.is_none() {
            return Err(Error::NoSuchPad(format!("{}: no free sink pad", dest.name())));
        }
        Err(last_err.into())
    }

    /// Request a sink pad on `dest` and link the first of `srcs` that fits.
    /// `None` when `dest` has no request sink template.
    fn link_to_requested_sink<'a>(
        &self,
        dest: &Element,
        srcs: impl Iterator<Item = &'a Pad>,
    ) -> Option<std::result::Result<(), PadLinkError>> {
        let tmpl = dest
            .pad_templates()
            .iter()
            .find(|t| t.direction == PadDirection::Sink && t.presence == PadPresence::Request)?
            .name
            .clone();
        let sink = match dest.request_pad(&tmpl, None) {
            Ok(sink) => sink,
            Err(err) => {
                tracing::debug!("{}: cannot request {tmpl}: {err}", dest.name());
                return Some(Err(PadLinkError::NoFormat));
            }
        };
        let mut last_err = PadLinkError::NoFormat;
        for src in srcs {
            match src.link(&sink) {
                Ok(()) => return Some(Ok(())),
                Err(err) => last_err = err,
            }
        }
        if let Err(err) = dest.release_request_pad(&sink) {
            tracing::warn!("{}: cannot release {}: {err}", dest.name(), sink.name());
        }
        Some(Err(last_err))
    }

    fn request_any_pad(&self, direction: PadDirection) -> Result<Pad> {
        let tmpl = self
            .pad_templates()
            .iter()
            .find(|t| t.direction == direction && t.presence == PadPresence::Request)
            .map(|t| t.name.clone())
            .ok_or_else(|| Error::NoSuchPad(format!("{}: no free {direction:?} pad", self.name())))?;
        self.request_pad(&tmpl, None)
    }

    /// Link the named pads of two elements.
    pub fn link_pads(&self, src_pad: &str, dest: &Element, sink_pad: &str) -> Result<()> {
        let src = self
            .static_pad(src_pad)
            .ok_or_else(|| Error::NoSuchPad(format!("{}:{src_pad}", self.name())))?;
        let sink = dest
            .static_pad(sink_pad)
            .ok_or_else(|| Error::NoSuchPad(format!("{}:{sink_pad}", dest.name())))?;
        src.link(&sink)?;
        Ok(())
    }

    /// Unlink every link from `self` to `dest`.
    pub fn unlink(&self, dest: &Element) {
        for src in self.src_pads() {
            if let Some(peer) = src.peer()
                && peer.parent_element().as_ref() == Some(dest)
            {
                src.unlink(&peer);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Events and messages
    // ------------------------------------------------------------------------

    /// Push `event` out of every pad facing away from `from`.
    ///
    /// Returns `true` when at least one pad handled it, or when there is no
    /// pad to forward to.
    pub fn forward_event(&self, from: &Pad, event: Event) -> bool {
        let targets: Vec<Pad> = self
            .pads()
            .into_iter()
            .filter(|p| p.direction() != from.direction())
            .collect();
        if targets.is_empty() {
            return true;
        }
        let mut handled = false;
        for pad in targets {
            handled |= pad.push_event(event.clone());
        }
        handled
    }

    /// Send an event to the element: upstream events leave through a sink
    /// pad, downstream events through a source pad.
    pub fn send_event(&self, event: Event) -> bool {
        self.imp().send_event(self, event)
    }

    pub(crate) fn default_send_event(&self, event: Event) -> bool {
        let pads = if event.is_upstream() && !event.is_downstream() {
            self.sink_pads()
        } else {
            self.src_pads()
        };
        match pads.first() {
            Some(pad) => pad.push_event(event),
            None => {
                tracing::debug!("{}: no pad to send {} through", self.name(), event.name());
                false
            }
        }
    }

    /// Post a message: it goes to the parent bin, or to the element's own
    /// bus when it has no parent.
    pub fn post_message(&self, message: Message) -> bool {
        if let Some(parent) = self.parent()
            && let Some(bin) = parent.imp().as_bin()
        {
            bin.handle_message(&parent, self, message);
            return true;
        }
        match self.bus() {
            Some(bus) => bus.post(message),
            None => {
                tracing::trace!("{}: no bus, dropping {message}", self.name());
                false
            }
        }
    }

    /// Post an error message originating from this element.
    pub fn post_error(&self, error: Error, debug: Option<String>) {
        tracing::error!("{}: {error}", self.name());
        self.post_message(Message::error(self.name(), error, debug));
    }

    /// Bus of a top-level element.
    pub fn bus(&self) -> Option<Bus> {
        self.0.bus.lock().unwrap().clone()
    }

    /// Attach a bus, for elements used without a pipeline.
    pub fn set_bus(&self, bus: Option<Bus>) {
        *self.0.bus.lock().unwrap() = bus;
    }

    // ------------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------------

    /// Clock to synchronize against; bins pass it to their children.
    pub fn set_clock(&self, clock: Option<Arc<dyn Clock>>) {
        *self.0.clock.lock().unwrap() = clock.clone();
        if let Some(bin) = self.imp().as_bin() {
            for child in bin.children() {
                child.set_clock(clock.clone());
            }
        }
    }

    /// The clock in use.
    pub fn clock(&self) -> Option<Arc<dyn Clock>> {
        self.0.clock.lock().unwrap().clone()
    }

    /// A clock this element (or a child, for bins) can provide.
    pub fn provide_clock(&self) -> Option<Arc<dyn Clock>> {
        self.imp().provide_clock(self)
    }

    /// Clock time corresponding to running time zero.
    pub fn base_time(&self) -> ClockTime {
        ClockTime::from_nanos(self.0.base_time.load(Ordering::Acquire))
    }

    /// Set the base time; bins pass it to their children.
    pub fn set_base_time(&self, time: ClockTime) {
        self.0.base_time.store(time.nanos(), Ordering::Release);
        if let Some(bin) = self.imp().as_bin() {
            for child in bin.children() {
                child.set_base_time(time);
            }
        }
    }

    /// Running time accumulated when the element last paused.
    pub fn start_time(&self) -> ClockTime {
        ClockTime::from_nanos(self.0.start_time.load(Ordering::Acquire))
    }

    /// Set the start time.
    pub fn set_start_time(&self, time: ClockTime) {
        self.0.start_time.store(time.nanos(), Ordering::Release);
    }

    /// Current running time: clock time minus base time while playing,
    /// the start time otherwise.
    pub fn current_running_time(&self) -> ClockTime {
        match self.clock() {
            Some(clock) if self.current_state() == State::Playing => {
                clock.now().saturating_sub(self.base_time())
            }
            _ => self.start_time(),
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    fn state_info(&self) -> MutexGuard<'_, StateInfo> {
        self.0.state.lock().unwrap()
    }

    /// Committed state.
    pub fn current_state(&self) -> State {
        self.state_info().current
    }

    /// Final state of a change in progress, `VoidPending` when idle.
    pub fn pending_state(&self) -> State {
        self.state_info().pending
    }

    /// Last state requested.
    pub fn target_state(&self) -> State {
        self.state_info().target
    }

    /// Whether a parent bin leaves this element's state alone.
    pub fn is_locked_state(&self) -> bool {
        self.state_info().locked
    }

    /// Lock or unlock the state. Returns whether the flag changed.
    pub fn set_locked_state(&self, locked: bool) -> bool {
        let mut st = self.state_info();
        let changed = st.locked != locked;
        st.locked = locked;
        changed
    }

    /// Move the element to `target`, one step at a time.
    ///
    /// Returns `Async` when a step completes later; watch for `AsyncDone`
    /// or use [`Element::get_state`]. Requesting the current state with
    /// nothing pending is a no-op.
    pub fn set_state(&self, target: State) -> StateChangeResult {
        if target == State::VoidPending {
            return Err(StateChangeError);
        }
        let _guard = self.0.state_lock.lock().unwrap();
        self.drive_state(target)
    }

    fn drive_state(&self, target: State) -> StateChangeResult {
        let mut current = {
            let mut st = self.state_info();
            if st.last_return.is_err() {
                st.next = State::VoidPending;
                st.pending = State::VoidPending;
                st.last_return = Ok(StateChangeSuccess::Success);
            }
            st.target = target;

            let mut from = st.current;
            if st.step == AsyncStep::Waiting {
                if target >= st.pending || target == st.next {
                    tracing::debug!("{}: busy, now heading for {target}", self.name());
                    st.pending = target;
                    return Ok(StateChangeSuccess::Async);
                }
                // Going back down: abandon the async step and start from
                // the state it was heading for.
                st.step = AsyncStep::Idle;
                from = st.next;
                st.current = from;
                st.next = State::VoidPending;
            } else if st.current == target && st.pending == State::VoidPending {
                return st.last_return;
            }
            st.pending = target;
            from
        };

        loop {
            let Some(transition) = StateChange::towards(current, target) else {
                let mut st = self.state_info();
                st.pending = State::VoidPending;
                st.last_return = Ok(StateChangeSuccess::Success);
                drop(st);
                self.0.state_cond.notify_all();
                return Ok(StateChangeSuccess::Success);
            };

            {
                let mut st = self.state_info();
                st.next = transition.next();
                st.step = AsyncStep::InHook { early: None };
            }
            tracing::debug!("{}: {transition}", self.name());

            let mut ret = self.change_state(transition);

            let mut st = self.state_info();
            if let AsyncStep::InHook { early: Some(early) } = st.step
                && ret == Ok(StateChangeSuccess::Async)
            {
                ret = early;
            }
            st.step = AsyncStep::Idle;

            match ret {
                Err(err) => {
                    st.next = State::VoidPending;
                    st.pending = State::VoidPending;
                    st.last_return = Err(err);
                    drop(st);
                    self.0.state_cond.notify_all();
                    self.post_error(
                        Error::StateChange(err),
                        Some(format!("{transition} failed")),
                    );
                    return Err(err);
                }
                Ok(StateChangeSuccess::Async) if target > State::Ready => {
                    // Completions racing with the AsyncStart post are parked
                    // so the parent always sees AsyncStart first.
                    st.step = AsyncStep::InHook { early: None };
                    st.last_return = Ok(StateChangeSuccess::Async);
                    drop(st);
                    tracing::debug!("{}: {transition} is async", self.name());
                    self.post_message(Message::new(self.name(), MessageView::AsyncStart));

                    let early = {
                        let mut st = self.state_info();
                        let early = match st.step {
                            AsyncStep::InHook { early } => early,
                            _ => None,
                        };
                        st.step = AsyncStep::Waiting;
                        early
                    };
                    if let Some(result) = early {
                        self.continue_state(result);
                    }
                    return Ok(StateChangeSuccess::Async);
                }
                Ok(success) => {
                    let success = match success {
                        StateChangeSuccess::Async => StateChangeSuccess::Success,
                        other => other,
                    };
                    let old = st.current;
                    st.current = transition.next();
                    st.next = State::VoidPending;
                    let done = st.current == target;
                    if done {
                        st.pending = State::VoidPending;
                    }
                    st.last_return = Ok(success);
                    let pending = st.pending;
                    drop(st);

                    self.post_message(Message::state_changed(
                        self.name(),
                        old,
                        transition.next(),
                        pending,
                    ));
                    if done {
                        self.0.state_cond.notify_all();
                        return Ok(success);
                    }
                    current = transition.next();
                }
            }
        }
    }

    /// Run one step: pad (de)activation around the element's hook.
    fn change_state(&self, transition: StateChange) -> StateChangeResult {
        if transition == StateChange::ReadyToPaused
            && let Err(err) = self.activate_pads()
        {
            tracing::warn!("{}: pad activation failed: {err}", self.name());
            self.deactivate_pads();
            return Err(StateChangeError);
        }
        if transition == StateChange::PausedToReady {
            self.deactivate_pads();
        }
        let ret = self.imp().change_state(self, transition);
        if transition == StateChange::ReadyToPaused && ret.is_err() {
            self.deactivate_pads();
        }
        ret
    }

    fn activate_pads(&self) -> Result<()> {
        for pad in self.src_pads() {
            pad.activate()?;
        }
        for pad in self.sink_pads() {
            pad.activate()?;
        }
        Ok(())
    }

    fn deactivate_pads(&self) {
        let pads = self.pads();
        for pad in &pads {
            pad.set_flushing(true);
        }
        self.imp().unlock(self);
        for pad in &pads {
            pad.deactivate();
        }
    }

    /// Complete an asynchronous step with `result`.
    ///
    /// Commits the pending step, posts `StateChanged` and `AsyncDone`, and
    /// continues towards the target on a helper thread when further steps
    /// remain. Safe to call from streaming threads; a completion that
    /// arrives while the step's hook is still running is applied when the
    /// hook returns. Ignored when no asynchronous step is in progress.
    pub fn continue_state(&self, result: StateChangeResult) {
        let mut st = self.state_info();
        match st.step {
            AsyncStep::Idle => {
                tracing::trace!("{}: nothing to continue", self.name());
                return;
            }
            AsyncStep::InHook { .. } => {
                st.step = AsyncStep::InHook {
                    early: Some(result),
                };
                return;
            }
            AsyncStep::Waiting => {}
        }
        st.step = AsyncStep::Idle;

        match result {
            Err(err) => {
                st.next = State::VoidPending;
                st.pending = State::VoidPending;
                st.last_return = Err(err);
                drop(st);
                self.0.state_cond.notify_all();
                self.post_error(Error::StateChange(err), Some("async state change failed".into()));
            }
            Ok(success) => {
                let old = st.current;
                let new = st.next;
                st.current = new;
                st.next = State::VoidPending;
                let target = st.pending;
                let done = target == new || target == State::VoidPending;
                if done {
                    st.pending = State::VoidPending;
                    st.last_return = Ok(match success {
                        StateChangeSuccess::Async => StateChangeSuccess::Success,
                        other => other,
                    });
                }
                drop(st);

                tracing::debug!("{}: committed {new} asynchronously", self.name());
                self.post_message(Message::state_changed(
                    self.name(),
                    old,
                    new,
                    if done { State::VoidPending } else { target },
                ));
                self.post_message(Message::new(
                    self.name(),
                    MessageView::AsyncDone {
                        running_time: ClockTime::NONE,
                    },
                ));
                if done {
                    self.0.state_cond.notify_all();
                } else {
                    self.spawn_continuation();
                }
            }
        }
    }

    /// Complete the current asynchronous step successfully.
    pub fn commit_state(&self) {
        self.continue_state(Ok(StateChangeSuccess::Success));
    }

    /// Carry on towards the pending state on a helper thread holding the
    /// state lock.
    fn spawn_continuation(&self) {
        let weak = self.downgrade();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-state", self.name()))
            .spawn(move || {
                let Some(element) = weak.upgrade() else {
                    return;
                };
                let _guard = element.0.state_lock.lock().unwrap();
                let target = {
                    let st = element.state_info();
                    if st.step != AsyncStep::Idle || st.pending == State::VoidPending {
                        return;
                    }
                    st.target
                };
                if let Err(err) = element.drive_state(target) {
                    tracing::warn!(
                        "{}: continuing to {target:?} failed: {err}",
                        element.name()
                    );
                }
            });
        if let Err(err) = spawned {
            tracing::error!("{}: cannot spawn state thread: {err}", self.name());
        }
    }

    /// Run `f` on a helper thread while holding this element's state lock.
    pub(crate) fn with_state_lock_async<F>(&self, f: F)
    where
        F: FnOnce(&Element) + Send + 'static,
    {
        let weak = self.downgrade();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-async", self.name()))
            .spawn(move || {
                if let Some(element) = weak.upgrade() {
                    let _guard = element.0.state_lock.lock().unwrap();
                    f(&element);
                }
            });
        if let Err(err) = spawned {
            tracing::error!("{}: cannot spawn helper thread: {err}", self.name());
        }
    }

    /// Whether an asynchronous step is waiting for completion.
    pub(crate) fn is_async_pending(&self) -> bool {
        let st = self.state_info();
        st.step == AsyncStep::Waiting
    }

    /// Whether a state change is running or waiting.
    pub(crate) fn is_changing_state(&self) -> bool {
        let st = self.state_info();
        st.step != AsyncStep::Idle || st.pending != State::VoidPending
    }

    /// Re-enter an asynchronous wait at the current state.
    ///
    /// Used by sinks that lose their prerolled data (after a flush) while
    /// paused: the element posts `AsyncStart` and completes with
    /// [`Element::continue_state`] once it prerolls again. Ignored below
    /// PAUSED or while a change is in progress.
    pub fn lost_state(&self) {
        let mut st = self.state_info();
        if st.step != AsyncStep::Idle || st.pending != State::VoidPending || st.current < State::Paused {
            return;
        }
        let current = st.current;
        st.next = current;
        st.pending = current;
        st.step = AsyncStep::Waiting;
        st.last_return = Ok(StateChangeSuccess::Async);
        drop(st);
        tracing::debug!("{}: lost state at {current}", self.name());
        self.post_message(Message::state_changed(self.name(), current, current, current));
        self.post_message(Message::new(self.name(), MessageView::AsyncStart));
    }

    /// Give up on a pending asynchronous step; the change fails.
    pub fn abort_state(&self) {
        let mut st = self.state_info();
        if st.step != AsyncStep::Waiting {
            return;
        }
        st.step = AsyncStep::Idle;
        st.next = State::VoidPending;
        st.pending = State::VoidPending;
        st.last_return = Err(StateChangeError);
        drop(st);
        self.0.state_cond.notify_all();
        tracing::debug!("{}: aborted async state change", self.name());
    }

    /// Wait up to `timeout` (forever for `None`) for a pending change and
    /// report `(result, current, pending)`.
    pub fn get_state(&self, timeout: Option<Duration>) -> (StateChangeResult, State, State) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.state_info();
        while st.last_return == Ok(StateChangeSuccess::Async) && st.pending != State::VoidPending {
            st = match deadline {
                None => self.0.state_cond.wait(st).unwrap(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    self.0.state_cond.wait_timeout(st, remaining).unwrap().0
                }
            };
        }
        (st.last_return, st.current, st.pending)
    }

    /// Move to the parent's current (or pending) state.
    pub fn sync_state_with_parent(&self) -> StateChangeResult {
        let Some(parent) = self.parent() else {
            return Err(StateChangeError);
        };
        let (_, current, pending) = parent.get_state(Some(Duration::ZERO));
        let target = if pending != State::VoidPending { pending } else { current };
        tracing::debug!("{}: syncing with parent at {target}", self.name());
        self.set_state(target)
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Element {}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("name", &self.0.name)
            .field("state", &self.current_state())
            .finish()
    }
}

/// Link elements in a chain: `a ! b ! c`.
pub fn link_many(elements: &[&Element]) -> Result<()> {
    for pair in elements.windows(2) {
        pair[0].link(pair[1])?;
    }
    Ok(())
}
