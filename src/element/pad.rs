//! Pads: the typed, directional connection points of elements.
//!
//! A source pad links to exactly one sink pad. Buffers travel downstream by
//! [`Pad::push`] on the source pad, which runs the peer's chain handler in
//! the calling thread. Events travel in both directions with
//! [`Pad::push_event`]. In pull mode the sink side drives instead, calling
//! [`Pad::pull_range`].
//!
//! Each pad remembers the sticky events (stream-start, caps, segment, tags)
//! it carried so that a newly linked peer receives the current stream
//! context before the next buffer.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::{Element, ElementImpl, ElementInner};
use crate::error::{FlowError, FlowResult, FlowSuccess, PadLinkError, Result};
use crate::event::{Event, EventView};
use crate::scheduler::{Task, TaskState};
use smallvec::SmallVec;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

// ============================================================================
// Templates
// ============================================================================

/// Direction of a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadDirection {
    /// Produces data (a source pad).
    Src,
    /// Consumes data (a sink pad).
    Sink,
}

impl PadDirection {
    /// The other direction.
    pub fn opposite(self) -> Self {
        match self {
            PadDirection::Src => PadDirection::Sink,
            PadDirection::Sink => PadDirection::Src,
        }
    }
}

/// Whether a pad is always present or created dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadPresence {
    /// Pad is always present on the element.
    Always,
    /// Pad appears when the stream requires it (e.g. demuxers).
    Sometimes,
    /// Pad is created when the application requests it.
    Request,
}

/// Template for creating pads.
///
/// Describes the name pattern, direction, presence and the formats a pad
/// created from it can handle.
#[derive(Debug, Clone)]
pub struct PadTemplate {
    /// Name pattern for this pad (e.g. "src", "sink", "src_%u").
    pub name: String,
    /// Direction of this pad.
    pub direction: PadDirection,
    /// Whether this pad is always present or created on demand.
    pub presence: PadPresence,
    /// Formats the pad can handle.
    pub caps: Caps,
}

impl PadTemplate {
    /// Create a new pad template.
    pub fn new(
        name: impl Into<String>,
        direction: PadDirection,
        presence: PadPresence,
        caps: Caps,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            presence,
            caps,
        }
    }

    /// Template for an always-present sink pad.
    pub fn sink(name: impl Into<String>, caps: Caps) -> Self {
        Self::new(name, PadDirection::Sink, PadPresence::Always, caps)
    }

    /// Template for an always-present source pad.
    pub fn src(name: impl Into<String>, caps: Caps) -> Self {
        Self::new(name, PadDirection::Src, PadPresence::Always, caps)
    }

    /// Template for source pads created on request.
    pub fn request_src(name: impl Into<String>, caps: Caps) -> Self {
        Self::new(name, PadDirection::Src, PadPresence::Request, caps)
    }

    /// Template for source pads that appear with the stream.
    pub fn sometimes_src(name: impl Into<String>, caps: Caps) -> Self {
        Self::new(name, PadDirection::Src, PadPresence::Sometimes, caps)
    }

    /// Pad name for instance `n` of this template ("src_%u" gives "src_3").
    pub fn instance_name(&self, n: u32) -> String {
        if self.name.contains("%u") || self.name.contains("%d") {
            self.name.replace("%u", &n.to_string()).replace("%d", &n.to_string())
        } else {
            self.name.clone()
        }
    }
}

// ============================================================================
// Probes
// ============================================================================

/// Kinds of data a probe observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeType(u32);

impl ProbeType {
    /// Buffers.
    pub const BUFFER: Self = Self(1 << 0);
    /// Downstream events.
    pub const EVENT_DOWNSTREAM: Self = Self(1 << 1);
    /// Upstream events.
    pub const EVENT_UPSTREAM: Self = Self(1 << 2);
    /// Everything travelling downstream.
    pub const DATA_DOWNSTREAM: Self = Self(Self::BUFFER.0 | Self::EVENT_DOWNSTREAM.0);

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: ProbeType) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Whether any bit of `other` is set.
    pub fn intersects(self, other: ProbeType) -> bool {
        (self.0 & other.0) != 0
    }
}

impl std::ops::BitOr for ProbeType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Verdict of a probe callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeReturn {
    /// Let the data pass.
    Ok,
    /// Discard the data; the push reports success.
    Drop,
    /// Let the data pass and uninstall the probe.
    Remove,
    /// The probe consumed the data; the push reports success.
    Handled,
}

/// Data seen by a probe. The probe may modify it in place.
#[derive(Debug)]
pub enum ProbeData<'a> {
    /// A buffer on its way through the pad.
    Buffer(&'a mut Buffer),
    /// An event on its way through the pad.
    Event(&'a mut Event),
}

/// Handle returned by [`Pad::add_probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(u64);

type ProbeFn = dyn Fn(&Pad, &mut ProbeData<'_>) -> ProbeReturn + Send + Sync;

static NEXT_PROBE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct Probe {
    id: ProbeId,
    mask: ProbeType,
    func: Arc<ProbeFn>,
}

// ============================================================================
// Pad
// ============================================================================

/// Scheduling mode of an active pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PadMode {
    /// Inactive.
    #[default]
    None,
    /// Upstream pushes buffers.
    Push,
    /// Downstream pulls ranges.
    Pull,
}

#[derive(Clone)]
struct StickyEvent {
    event: Event,
    received: bool,
}

struct PadState {
    peer: Weak<PadInner>,
    parent: Weak<ElementInner>,
    mode: PadMode,
    flushing: bool,
    eos: bool,
    any_negotiated: bool,
    link_caps: Option<Caps>,
    sticky: SmallVec<[StickyEvent; 4]>,
    last_flow: FlowResult,
    probes: Vec<Probe>,
    task: Option<Task>,
}

pub(crate) enum PadKind {
    Regular,
    /// Ghost pad on a bin, forwarding through `internal` to its target.
    Ghost { internal: Pad },
    /// Internal half of a ghost pad.
    Proxy { ghost: Weak<PadInner> },
}

pub(crate) struct PadInner {
    name: String,
    direction: PadDirection,
    template: Option<PadTemplate>,
    state: Mutex<PadState>,
    stream_lock: Arc<Mutex<()>>,
    pub(crate) kind: PadKind,
}

impl Drop for PadInner {
    fn drop(&mut self) {
        // The streaming thread must not outlive the pad it serves.
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = state.task.take() {
            tracing::debug!("pad {} dropped with a live task", self.name);
            task.join();
        }
    }
}

/// A connection point on an element. Cheap to clone; clones share the pad.
#[derive(Clone)]
pub struct Pad(pub(crate) Arc<PadInner>);

enum ProbeOutcome {
    Pass,
    Consumed,
}

impl Pad {
    /// Create a free-standing pad with no template.
    pub fn new(name: impl Into<String>, direction: PadDirection) -> Self {
        Self::build(name.into(), direction, None, PadKind::Regular)
    }

    /// Create a pad from a template.
    pub fn from_template(template: &PadTemplate, name: impl Into<String>) -> Self {
        Self::build(name.into(), template.direction, Some(template.clone()), PadKind::Regular)
    }

    pub(crate) fn build(
        name: String,
        direction: PadDirection,
        template: Option<PadTemplate>,
        kind: PadKind,
    ) -> Self {
        Pad(Arc::new(Self::inner(name, direction, template, kind)))
    }

    pub(crate) fn inner(
        name: String,
        direction: PadDirection,
        template: Option<PadTemplate>,
        kind: PadKind,
    ) -> PadInner {
        PadInner {
            name,
            direction,
            template,
            state: Mutex::new(PadState {
                peer: Weak::new(),
                parent: Weak::new(),
                mode: PadMode::None,
                flushing: true,
                eos: false,
                any_negotiated: false,
                link_caps: None,
                sticky: SmallVec::new(),
                last_flow: Ok(FlowSuccess::Ok),
                probes: Vec::new(),
                task: None,
            }),
            stream_lock: Arc::new(Mutex::new(())),
            kind,
        }
    }

    /// Pad name, unique within its element.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Pad direction.
    pub fn direction(&self) -> PadDirection {
        self.0.direction
    }

    /// Whether this is a source pad.
    pub fn is_src(&self) -> bool {
        self.0.direction == PadDirection::Src
    }

    /// Whether this is a sink pad.
    pub fn is_sink(&self) -> bool {
        self.0.direction == PadDirection::Sink
    }

    /// Template the pad was created from.
    pub fn template(&self) -> Option<&PadTemplate> {
        self.0.template.as_ref()
    }

    /// Formats of the template, or ANY.
    pub fn template_caps(&self) -> Caps {
        self.0
            .template
            .as_ref()
            .map(|t| t.caps.clone())
            .unwrap_or_else(Caps::new_any)
    }

    /// Whether this is a ghost pad.
    pub fn is_ghost(&self) -> bool {
        matches!(self.0.kind, PadKind::Ghost { .. })
    }

    pub(crate) fn is_proxy(&self) -> bool {
        matches!(self.0.kind, PadKind::Proxy { .. })
    }

    /// The opposite half of a ghost pad pair.
    pub(crate) fn partner(&self) -> Option<Pad> {
        match &self.0.kind {
            PadKind::Regular => None,
            PadKind::Ghost { internal } => Some(internal.clone()),
            PadKind::Proxy { ghost } => ghost.upgrade().map(Pad),
        }
    }

    /// Element owning the pad.
    pub fn parent_element(&self) -> Option<Element> {
        self.lock().parent.upgrade().map(Element)
    }

    pub(crate) fn set_parent(&self, parent: Weak<ElementInner>) {
        self.lock().parent = parent;
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.lock().parent.strong_count() > 0
    }

    fn lock(&self) -> MutexGuard<'_, PadState> {
        self.0.state.lock().unwrap()
    }

    /// Debug name, `element:pad`.
    pub fn path(&self) -> String {
        match self.parent_element() {
            Some(el) => format!("{}:{}", el.name(), self.name()),
            None => format!("(none):{}", self.name()),
        }
    }

    // ------------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------------

    /// The linked pad, if any.
    pub fn peer(&self) -> Option<Pad> {
        self.lock().peer.upgrade().map(Pad)
    }

    /// Whether the pad has a peer.
    pub fn is_linked(&self) -> bool {
        self.lock().peer.strong_count() > 0
    }

    /// Link this source pad to `sink`.
    ///
    /// Both pads must be unlinked, belong to elements in the same bin and
    /// share at least one format. On success the common format set is
    /// stored as the provisional link caps; the concrete format is fixed
    /// later, when the first buffer is produced.
    pub fn link(&self, sink: &Pad) -> std::result::Result<(), PadLinkError> {
        if !self.is_src() || !sink.is_sink() {
            return Err(PadLinkError::WrongDirection);
        }
        self.check_hierarchy(sink)?;
        if self.is_linked() || sink.is_linked() {
            return Err(PadLinkError::WasLinked);
        }

        // Caps are queried without holding either pad's lock: the query may
        // walk through other elements.
        let src_caps = self.query_caps(None);
        let sink_caps = sink.query_caps(None);
        let common = src_caps.intersect(&sink_caps);
        if common.is_empty() {
            tracing::debug!(
                "cannot link {} to {}: {} and {} do not intersect",
                self.path(),
                sink.path(),
                src_caps,
                sink_caps
            );
            return Err(PadLinkError::NoFormat);
        }

        let mut src_state = self.lock();
        let mut sink_state = sink.lock();
        if src_state.peer.strong_count() > 0 || sink_state.peer.strong_count() > 0 {
            return Err(PadLinkError::WasLinked);
        }
        src_state.peer = Arc::downgrade(&sink.0);
        sink_state.peer = Arc::downgrade(&self.0);
        src_state.link_caps = Some(common.clone());
        sink_state.link_caps = Some(common);
        src_state.any_negotiated = false;
        for sticky in src_state.sticky.iter_mut() {
            sticky.received = false;
        }
        drop(sink_state);
        drop(src_state);

        tracing::debug!("linked {} to {}", self.path(), sink.path());
        Ok(())
    }

    fn check_hierarchy(&self, sink: &Pad) -> std::result::Result<(), PadLinkError> {
        if self.is_proxy() || sink.is_proxy() {
            return Ok(());
        }
        match (self.parent_element(), sink.parent_element()) {
            (None, None) => Ok(()),
            (Some(a), Some(b)) => {
                let same = match (a.parent(), b.parent()) {
                    (None, None) => true,
                    (Some(pa), Some(pb)) => pa == pb,
                    _ => false,
                };
                if same {
                    Ok(())
                } else {
                    Err(PadLinkError::WrongHierarchy)
                }
            }
            _ => Err(PadLinkError::NoParent),
        }
    }

    /// Unlink this source pad from `sink`. Returns `false` when they were
    /// not linked to each other.
    pub fn unlink(&self, sink: &Pad) -> bool {
        if !self.is_src() {
            return false;
        }
        let mut src_state = self.lock();
        let mut sink_state = sink.lock();
        let linked = src_state
            .peer
            .upgrade()
            .is_some_and(|p| Arc::ptr_eq(&p, &sink.0));
        if !linked {
            return false;
        }
        src_state.peer = Weak::new();
        sink_state.peer = Weak::new();
        src_state.link_caps = None;
        sink_state.link_caps = None;
        drop(sink_state);
        drop(src_state);
        tracing::debug!("unlinked {} from {}", self.path(), sink.path());
        true
    }

    /// Unlink from whatever peer the pad has.
    pub fn unlink_peer(&self) -> bool {
        match self.peer() {
            Some(peer) if self.is_src() => self.unlink(&peer),
            Some(peer) => peer.unlink(self),
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Caps
    // ------------------------------------------------------------------------

    /// Formats this pad can handle now, optionally narrowed by `filter`.
    pub fn query_caps(&self, filter: Option<&Caps>) -> Caps {
        let caps = match &self.0.kind {
            PadKind::Regular => match self.parent_element() {
                Some(element) => element.imp().query_caps(&element, self, filter),
                None => self.template_caps(),
            },
            PadKind::Ghost { internal } => internal.peer_query_caps(filter),
            PadKind::Proxy { ghost } => match ghost.upgrade().map(Pad) {
                Some(ghost) => ghost.peer_query_caps(filter),
                None => Caps::new_any(),
            },
        };
        // The filter comes from the asking side; its order is the preference.
        match filter {
            Some(filter) => filter.intersect(&caps),
            None => caps,
        }
    }

    /// Formats the peer can handle; ANY when unlinked.
    pub fn peer_query_caps(&self, filter: Option<&Caps>) -> Caps {
        match self.peer() {
            Some(peer) => peer.query_caps(filter),
            None => filter.cloned().unwrap_or_else(Caps::new_any),
        }
    }

    /// Formats both this pad and its peer can handle. `None` when unlinked.
    pub fn allowed_caps(&self) -> Option<Caps> {
        let peer = self.peer()?;
        let mine = self.query_caps(None);
        Some(peer.query_caps(Some(&mine)))
    }

    /// Whether the pad would accept a caps event carrying `caps`.
    pub fn accept_caps(&self, caps: &Caps) -> bool {
        match &self.0.kind {
            PadKind::Regular => match self.parent_element() {
                Some(element) => element.imp().accept_caps(&element, self, caps),
                None => caps.is_subset(&self.template_caps()),
            },
            _ => caps.is_subset(&self.query_caps(None)),
        }
    }

    /// The fixed format currently flowing through the pad.
    ///
    /// For a ghost pad this is always its target's format.
    pub fn current_caps(&self) -> Option<Caps> {
        if let Some(target) = crate::element::ghost::target_of(self) {
            return target.current_caps();
        }
        self.sticky_caps()
    }

    fn sticky_caps(&self) -> Option<Caps> {
        self.lock().sticky.iter().find_map(|s| match s.event.view() {
            EventView::Caps(caps) => Some(caps.clone()),
            _ => None,
        })
    }

    /// Whether a format has been fixed on the pad.
    pub fn has_current_caps(&self) -> bool {
        self.current_caps().is_some()
    }

    /// Format set stored when the pad was linked.
    pub fn link_caps(&self) -> Option<Caps> {
        self.lock().link_caps.clone()
    }

    /// Fix a format for this source pad and announce it downstream.
    ///
    /// Picks the first concrete format that both sides support and pushes a
    /// caps event. Links where both sides accept ANY carry no format and
    /// succeed with `None`.
    pub fn negotiate(&self) -> std::result::Result<Option<Caps>, FlowError> {
        let Some(peer) = self.peer() else {
            return Err(FlowError::NotLinked);
        };
        let mine = self.query_caps(None);
        let mut allowed = peer.query_caps(Some(&mine));
        if let Some(link) = self.link_caps()
            && !link.is_any()
        {
            allowed = allowed.intersect(&link);
        }
        if allowed.is_empty() {
            tracing::warn!("{}: no common format with {}", self.path(), peer.path());
            return Err(FlowError::NotNegotiated);
        }
        if allowed.is_any() {
            self.lock().any_negotiated = true;
            return Ok(None);
        }
        let Some(fixed) = allowed.fixate() else {
            tracing::warn!("{}: cannot fixate {}", self.path(), allowed);
            return Err(FlowError::NotNegotiated);
        };
        tracing::debug!("{}: negotiated {}", self.path(), fixed);
        if !self.push_event(Event::caps(fixed.clone())) {
            return Err(FlowError::NotNegotiated);
        }
        Ok(Some(fixed))
    }

    fn needs_negotiation(&self) -> bool {
        let state = self.lock();
        !state.any_negotiated
            && !state
                .sticky
                .iter()
                .any(|s| matches!(s.event.view(), EventView::Caps(_)))
    }

    // ------------------------------------------------------------------------
    // Sticky events
    // ------------------------------------------------------------------------

    /// Sticky events currently stored on the pad, in replay order.
    pub fn sticky_events(&self) -> Vec<Event> {
        self.lock().sticky.iter().map(|s| s.event.clone()).collect()
    }

    fn store_sticky(state: &mut PadState, event: &Event, received: bool) {
        let Some(rank) = event.sticky_rank() else {
            return;
        };
        let entry = StickyEvent {
            event: event.clone(),
            received,
        };
        match state
            .sticky
            .iter()
            .position(|s| s.event.sticky_rank() >= Some(rank))
        {
            Some(i) if state.sticky[i].event.sticky_rank() == Some(rank) => state.sticky[i] = entry,
            Some(i) => state.sticky.insert(i, entry),
            None => state.sticky.push(entry),
        }
    }

    fn mark_received(&self, rank: u8) {
        let mut state = self.lock();
        if let Some(s) = state
            .sticky
            .iter_mut()
            .find(|s| s.event.sticky_rank() == Some(rank))
        {
            s.received = true;
        }
    }

    /// Send sticky events the peer has not seen, up to (not including)
    /// rank `below`.
    fn send_pending_sticky(&self, peer: &Pad, below: Option<u8>) -> std::result::Result<(), FlowError> {
        let pending: SmallVec<[Event; 4]> = self
            .lock()
            .sticky
            .iter()
            .filter(|s| !s.received && below.is_none_or(|b| s.event.sticky_rank() < Some(b)))
            .map(|s| s.event.clone())
            .collect();

        for event in pending {
            let rank = event.sticky_rank();
            let is_caps = matches!(event.view(), EventView::Caps(_));
            if peer.send_event(event) {
                if let Some(rank) = rank {
                    self.mark_received(rank);
                }
            } else if is_caps {
                return Err(FlowError::NotNegotiated);
            } else if peer.is_flushing() {
                return Err(FlowError::Flushing);
            } else if let Some(rank) = rank {
                // Refused but not fatal; do not retry on every buffer.
                self.mark_received(rank);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------------

    /// Install a callback observing data of the kinds in `mask`.
    pub fn add_probe<F>(&self, mask: ProbeType, func: F) -> ProbeId
    where
        F: Fn(&Pad, &mut ProbeData<'_>) -> ProbeReturn + Send + Sync + 'static,
    {
        let id = ProbeId(NEXT_PROBE_ID.fetch_add(1, Ordering::Relaxed));
        self.lock().probes.push(Probe {
            id,
            mask,
            func: Arc::new(func),
        });
        id
    }

    /// Uninstall a probe.
    pub fn remove_probe(&self, id: ProbeId) {
        self.lock().probes.retain(|p| p.id != id);
    }

    fn run_probes(&self, kind: ProbeType, data: &mut ProbeData<'_>) -> ProbeOutcome {
        let probes: SmallVec<[Probe; 2]> = self
            .lock()
            .probes
            .iter()
            .filter(|p| p.mask.intersects(kind))
            .cloned()
            .collect();
        for probe in probes {
            match (probe.func)(self, data) {
                ProbeReturn::Ok => {}
                ProbeReturn::Remove => self.remove_probe(probe.id),
                ProbeReturn::Drop | ProbeReturn::Handled => return ProbeOutcome::Consumed,
            }
        }
        ProbeOutcome::Pass
    }

    // ------------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------------

    /// Current scheduling mode.
    pub fn mode(&self) -> PadMode {
        self.lock().mode
    }

    /// Whether the pad is active in some mode.
    pub fn is_active(&self) -> bool {
        self.mode() != PadMode::None
    }

    /// Whether data is currently refused.
    pub fn is_flushing(&self) -> bool {
        self.lock().flushing
    }

    pub(crate) fn set_flushing(&self, flushing: bool) {
        let mut state = self.lock();
        state.flushing = flushing;
        if let Some(partner) = self.partner() {
            drop(state);
            partner.lock().flushing = flushing;
        }
    }

    /// Whether end-of-stream passed through the pad.
    pub fn is_eos(&self) -> bool {
        self.lock().eos
    }

    /// Whether the source pad can serve [`Pad::get_range`].
    pub fn supports_pull(&self) -> bool {
        if !self.is_src() {
            return false;
        }
        match &self.0.kind {
            PadKind::Regular => self
                .parent_element()
                .is_some_and(|el| el.imp().supports_pull(&el, self)),
            _ => self
                .partner()
                .and_then(|p| p.peer())
                .is_some_and(|upstream| upstream.supports_pull()),
        }
    }

    /// Activate with the default mode choice.
    ///
    /// Sink pads pick pull when their element prefers it and the peer can
    /// serve it, push otherwise. A source pad that a downstream peer already
    /// activated in pull mode is left alone.
    pub fn activate(&self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        let wants_pull = self.is_sink()
            && matches!(self.0.kind, PadKind::Regular)
            && self
                .parent_element()
                .is_some_and(|el| el.imp().prefers_pull(&el, self))
            && self.peer().is_some_and(|p| p.supports_pull());
        let mode = if wants_pull { PadMode::Pull } else { PadMode::Push };
        self.activate_mode(mode, true)
    }

    /// Activate or deactivate in a specific mode.
    pub fn activate_mode(&self, mode: PadMode, active: bool) -> Result<()> {
        if !active || mode == PadMode::None {
            self.deactivate();
            return Ok(());
        }
        if self.mode() == mode {
            return Ok(());
        }
        if mode == PadMode::Pull && self.is_sink() {
            let peer = self.peer().ok_or(FlowError::NotLinked)?;
            if !peer.supports_pull() {
                return Err(FlowError::NotSupported.into());
            }
            peer.activate_mode(PadMode::Pull, true)?;
        }
        {
            let mut state = self.lock();
            state.mode = mode;
            state.flushing = false;
            state.eos = false;
            state.last_flow = Ok(FlowSuccess::Ok);
        }
        if let Some(partner) = self.partner() {
            {
                let mut state = partner.lock();
                state.mode = mode;
                state.flushing = false;
                state.eos = false;
            }
            if mode == PadMode::Pull
                && self.is_src()
                && let Some(upstream) = partner.peer()
            {
                upstream.activate_mode(PadMode::Pull, true)?;
            }
        }
        tracing::debug!("{}: activated in {:?} mode", self.path(), mode);
        Ok(())
    }

    /// Deactivate: refuse data, stop the task, wait for the streaming thread
    /// to leave the pad and drop the stream context.
    pub fn deactivate(&self) {
        let old_mode = {
            let mut state = self.lock();
            if state.mode == PadMode::None && state.task.is_none() {
                state.flushing = true;
                return;
            }
            state.flushing = true;
            state.mode
        };
        self.stop_task();
        drop(self.stream_lock());
        {
            let mut state = self.lock();
            state.mode = PadMode::None;
            state.sticky.clear();
            state.any_negotiated = false;
            state.eos = false;
        }
        if let Some(partner) = self.partner() {
            let mut state = partner.lock();
            state.mode = PadMode::None;
            state.flushing = true;
            state.sticky.clear();
        }
        if old_mode == PadMode::Pull {
            let upstream = if self.is_sink() {
                self.peer()
            } else {
                self.partner().and_then(|p| p.peer())
            };
            if let Some(upstream) = upstream {
                upstream.deactivate();
            }
        }
        tracing::debug!("{}: deactivated", self.path());
    }

    // ------------------------------------------------------------------------
    // Dataflow
    // ------------------------------------------------------------------------

    /// Push a buffer to the peer of this source pad.
    ///
    /// Runs the peer's chain handler in the calling thread. Fixes the format
    /// first if none is set yet and replays sticky events the peer missed.
    pub fn push(&self, mut buffer: Buffer) -> FlowResult {
        let peer = {
            let state = self.lock();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.eos {
                return Err(FlowError::Eos);
            }
            if state.mode == PadMode::Pull {
                return Err(FlowError::NotSupported);
            }
            state.peer.upgrade().map(Pad)
        };

        if let ProbeOutcome::Consumed = self.run_probes(ProbeType::BUFFER, &mut ProbeData::Buffer(&mut buffer)) {
            return Ok(FlowSuccess::Ok);
        }

        let result = match peer {
            None => Err(FlowError::NotLinked),
            Some(peer) => self.push_to_peer(&peer, buffer),
        };
        self.lock().last_flow = result;
        result
    }

    fn push_to_peer(&self, peer: &Pad, buffer: Buffer) -> FlowResult {
        if self.needs_negotiation() {
            self.negotiate()?;
        }
        self.send_pending_sticky(peer, None)?;
        peer.chain(buffer)
    }

    /// A buffer arriving at this sink pad.
    fn chain(&self, mut buffer: Buffer) -> FlowResult {
        let _stream = self.stream_lock();
        {
            let state = self.lock();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.eos {
                return Err(FlowError::Eos);
            }
        }
        if let ProbeOutcome::Consumed = self.run_probes(ProbeType::BUFFER, &mut ProbeData::Buffer(&mut buffer)) {
            return Ok(FlowSuccess::Ok);
        }

        let result = match &self.0.kind {
            PadKind::Regular => match self.parent_element() {
                Some(element) => element.imp().chain(&element, self, buffer),
                None => Err(FlowError::Flushing),
            },
            _ => match self.partner() {
                Some(partner) => partner.push(buffer),
                None => Err(FlowError::NotLinked),
            },
        };
        self.lock().last_flow = result;
        result
    }

    /// Pull `size` bytes at `offset` from the peer of this sink pad.
    pub fn pull_range(&self, offset: u64, size: usize) -> std::result::Result<Buffer, FlowError> {
        let peer = {
            let state = self.lock();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.mode != PadMode::Pull {
                return Err(FlowError::NotSupported);
            }
            state.peer.upgrade().map(Pad)
        };
        let peer = peer.ok_or(FlowError::NotLinked)?;
        let result = peer.get_range(offset, size);
        self.lock().last_flow = result.as_ref().map(|_| FlowSuccess::Ok).map_err(|e| *e);
        result
    }

    /// Serve a range request on this source pad.
    pub fn get_range(&self, offset: u64, size: usize) -> std::result::Result<Buffer, FlowError> {
        {
            let state = self.lock();
            if state.flushing {
                return Err(FlowError::Flushing);
            }
            if state.mode != PadMode::Pull {
                return Err(FlowError::NotSupported);
            }
        }
        let _stream = self.stream_lock();
        match &self.0.kind {
            PadKind::Regular => match self.parent_element() {
                Some(element) => element.imp().get_range(&element, self, offset, size),
                None => Err(FlowError::Flushing),
            },
            _ => match self.partner() {
                Some(partner) => partner.pull_range(offset, size),
                None => Err(FlowError::NotLinked),
            },
        }
    }

    /// Result of the last push, chain or pull through the pad.
    pub fn last_flow_result(&self) -> FlowResult {
        self.lock().last_flow
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Send an event to the peer: downstream from a source pad, upstream
    /// from a sink pad.
    ///
    /// Sticky events are stored even when the peer is missing so that a
    /// later link replays them. Returns whether the peer handled the event.
    pub fn push_event(&self, mut event: Event) -> bool {
        let downstream = self.is_src();
        if (downstream && !event.is_downstream()) || (!downstream && !event.is_upstream()) {
            tracing::warn!("{}: {} cannot travel this way", self.path(), event.name());
            return false;
        }

        let peer = {
            let mut state = self.lock();
            match event.view() {
                EventView::FlushStart => state.flushing = true,
                EventView::FlushStop { .. } => {
                    if state.mode != PadMode::None {
                        state.flushing = false;
                    }
                    state.eos = false;
                    state.sticky.retain(|s| !matches!(s.event.view(), EventView::Segment(_)));
                }
                _ if state.flushing => {
                    drop(state);
                    tracing::trace!("{}: flushing, dropping {}", self.path(), event.name());
                    return false;
                }
                _ if downstream && state.eos && event.is_serialized() => return false,
                _ => {}
            }
            if downstream {
                Self::store_sticky(&mut state, &event, false);
                if matches!(event.view(), EventView::Eos) {
                    state.eos = true;
                }
            }
            state.peer.upgrade().map(Pad)
        };

        let kind = if downstream {
            ProbeType::EVENT_DOWNSTREAM
        } else {
            ProbeType::EVENT_UPSTREAM
        };
        if let ProbeOutcome::Consumed = self.run_probes(kind, &mut ProbeData::Event(&mut event)) {
            return true;
        }

        let Some(peer) = peer else {
            // Stored for replay; nothing else to do without a peer.
            return event.is_sticky();
        };

        if downstream && event.is_serialized() {
            let below = event.sticky_rank();
            if below.is_some() || !matches!(event.view(), EventView::FlushStop { .. }) {
                match self.send_pending_sticky(&peer, below) {
                    Ok(()) => {}
                    Err(FlowError::NotNegotiated) if below.is_none() => return false,
                    Err(_) => {}
                }
            }
        }

        let rank = event.sticky_rank();
        let handled = peer.send_event(event);
        if handled && downstream && let Some(rank) = rank {
            self.mark_received(rank);
        }
        handled
    }

    /// Deliver an event to this pad, as if the peer had pushed it.
    ///
    /// Applications use this to inject events; it is also the receiving half
    /// of [`Pad::push_event`].
    pub fn send_event(&self, mut event: Event) -> bool {
        let serialized = self.is_sink() && event.is_serialized();
        let is_caps = matches!(event.view(), EventView::Caps(_));

        if let EventView::Caps(caps) = event.view()
            && self.is_sink()
            && !self.accept_caps(caps)
        {
            tracing::warn!("{}: refusing caps {}", self.path(), caps);
            return false;
        }

        {
            let mut state = self.lock();
            match event.view() {
                EventView::FlushStart => state.flushing = true,
                EventView::FlushStop { .. } => {}
                _ if state.flushing => {
                    drop(state);
                    tracing::trace!("{}: flushing, refusing {}", self.path(), event.name());
                    return false;
                }
                _ if serialized && state.eos => return false,
                _ => {}
            }
        }

        let kind = if event.is_downstream() && self.is_sink() {
            ProbeType::EVENT_DOWNSTREAM
        } else {
            ProbeType::EVENT_UPSTREAM
        };
        if let ProbeOutcome::Consumed = self.run_probes(kind, &mut ProbeData::Event(&mut event)) {
            return true;
        }

        let _stream = serialized.then(|| self.stream_lock());
        {
            let mut state = self.lock();
            match event.view() {
                EventView::FlushStop { .. } => {
                    if state.mode != PadMode::None {
                        state.flushing = false;
                    }
                    state.eos = false;
                    state.sticky.retain(|s| !matches!(s.event.view(), EventView::Segment(_)));
                }
                EventView::Eos if self.is_sink() => state.eos = true,
                _ => {}
            }
            if self.is_sink() && !is_caps {
                Self::store_sticky(&mut state, &event, true);
            }
        }

        // A format only becomes current once the handler took it.
        let accepted_caps = (is_caps && self.is_sink()).then(|| event.clone());
        let handled = match &self.0.kind {
            PadKind::Regular => match self.parent_element() {
                Some(element) => {
                    let imp: &dyn ElementImpl = element.imp();
                    if self.is_sink() {
                        imp.sink_event(&element, self, event)
                    } else {
                        imp.src_event(&element, self, event)
                    }
                }
                None => true,
            },
            _ => match self.partner() {
                Some(partner) => partner.push_event(event),
                None => false,
            },
        };
        if handled && let Some(caps_event) = accepted_caps {
            Self::store_sticky(&mut self.lock(), &caps_event, true);
        }
        handled
    }

    // ------------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------------

    /// Lock serializing dataflow through the pad.
    ///
    /// Held by the streaming thread while it runs the chain handler,
    /// serialized event handlers and each iteration of the pad task.
    pub fn stream_lock(&self) -> MutexGuard<'_, ()> {
        self.0.stream_lock.lock().unwrap()
    }

    /// Start (or resume) the pad task running `func` in a loop until it
    /// breaks or the task is stopped.
    ///
    /// A paused task resumes with its original function.
    pub fn start_task<F>(&self, func: F) -> Result<()>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        // Naming the task looks up the parent through the pad state.
        let name = format!("{}-task", self.path());
        let task = {
            let mut state = self.lock();
            match &state.task {
                Some(task) if task.state() != TaskState::Stopped => task.clone(),
                _ => {
                    let task = Task::with_lock(
                        name,
                        Arc::clone(&self.0.stream_lock),
                        func,
                    );
                    state.task = Some(task.clone());
                    task
                }
            }
        };
        task.start()
    }

    /// Park the pad task after its current iteration. Does not wait.
    pub fn pause_task(&self) {
        let task = self.lock().task.clone();
        if let Some(task) = task
            && let Err(err) = task.pause()
        {
            tracing::warn!("{}: pausing task failed: {err}", self.path());
        }
    }

    /// Stop the pad task and wait for its thread, unless called from it.
    pub fn stop_task(&self) {
        let task = self.lock().task.take();
        if let Some(task) = task {
            task.join();
        }
    }

    /// State of the pad task, `None` when there is none.
    pub fn task_state(&self) -> Option<TaskState> {
        self.lock().task.as_ref().map(Task::state)
    }
}

impl PartialEq for Pad {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Pad {}

impl fmt::Debug for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pad")
            .field("name", &self.0.name)
            .field("direction", &self.0.direction)
            .field("linked", &self.is_linked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Structure;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn raw(format: &str) -> Caps {
        Caps::from_structure(Structure::new("audio/x-raw").field("format", format))
    }

    fn free_pair(src_caps: Caps, sink_caps: Caps) -> (Pad, Pad) {
        let src = Pad::from_template(&PadTemplate::src("src", src_caps), "src");
        let sink = Pad::from_template(&PadTemplate::sink("sink", sink_caps), "sink");
        (src, sink)
    }

    #[test]
    fn test_template_instance_name() {
        let t = PadTemplate::request_src("src_%u", Caps::new_any());
        assert_eq!(t.instance_name(3), "src_3");
        assert_eq!(PadTemplate::sink("sink", Caps::new_any()).instance_name(7), "sink");
    }

    #[test]
    fn test_link_and_unlink() {
        let (src, sink) = free_pair(raw("S16LE"), Caps::new_any());
        src.link(&sink).unwrap();
        assert_eq!(src.peer().unwrap(), sink);
        assert_eq!(sink.peer().unwrap(), src);
        assert_eq!(src.link_caps().unwrap(), raw("S16LE"));

        let (other, _) = free_pair(Caps::new_any(), Caps::new_any());
        assert_eq!(other.link(&sink), Err(PadLinkError::WasLinked));

        assert!(src.unlink(&sink));
        assert!(!src.is_linked());
        assert!(!sink.is_linked());
        assert!(src.link_caps().is_none());
        assert!(!src.unlink(&sink));
    }

    #[test]
    fn test_link_wrong_direction() {
        let (src, sink) = free_pair(Caps::new_any(), Caps::new_any());
        assert_eq!(sink.link(&src), Err(PadLinkError::WrongDirection));
        let other_src = Pad::new("src2", PadDirection::Src);
        assert_eq!(src.link(&other_src), Err(PadLinkError::WrongDirection));
    }

    #[test]
    fn test_link_no_common_format() {
        let (src, sink) = free_pair(raw("S16LE"), raw("F32LE"));
        assert_eq!(src.link(&sink), Err(PadLinkError::NoFormat));
        assert!(!src.is_linked());
        assert!(src.link_caps().is_none());
        assert!(sink.link_caps().is_none());
    }

    #[test]
    fn test_inactive_pad_refuses_push() {
        let (src, sink) = free_pair(Caps::new_any(), Caps::new_any());
        src.link(&sink).unwrap();
        assert_eq!(src.push(Buffer::from_slice(b"x")), Err(FlowError::Flushing));
    }

    #[test]
    fn test_start_task_runs() {
        let src = Pad::new("src", PadDirection::Src);
        let (tx, rx) = std::sync::mpsc::channel();
        src.start_task(move || {
            let _ = tx.send(());
            ControlFlow::Break(())
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(3)).unwrap();
        src.stop_task();
    }

    #[test]
    fn test_dropped_pad_joins_task() {
        let src = Pad::new("src", PadDirection::Src);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        src.start_task(move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            ControlFlow::Continue(())
        })
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while count.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(src);
        let stopped_at = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
    }

    #[test]
    fn test_push_unlinked() {
        let src = Pad::new("src", PadDirection::Src);
        src.activate_mode(PadMode::Push, true).unwrap();
        assert_eq!(src.push(Buffer::new()), Err(FlowError::NotLinked));
        assert_eq!(src.last_flow_result(), Err(FlowError::NotLinked));
    }

    #[test]
    fn test_sticky_events_stored_without_peer() {
        let src = Pad::new("src", PadDirection::Src);
        src.activate_mode(PadMode::Push, true).unwrap();
        assert!(src.push_event(Event::segment(Default::default())));
        assert!(src.push_event(Event::stream_start("s")));
        assert!(src.push_event(Event::caps(raw("S16LE"))));
        let names: Vec<_> = src.sticky_events().iter().map(Event::name).collect();
        assert_eq!(names, ["stream-start", "caps", "segment"]);
        assert_eq!(src.current_caps().unwrap(), raw("S16LE"));

        // Replacing keeps one event per kind.
        src.push_event(Event::caps(raw("F32LE")));
        assert_eq!(src.sticky_events().len(), 3);
        assert_eq!(src.current_caps().unwrap(), raw("F32LE"));
    }

    #[test]
    fn test_flush_events_toggle_flushing() {
        let src = Pad::new("src", PadDirection::Src);
        src.activate_mode(PadMode::Push, true).unwrap();
        src.push_event(Event::flush_start());
        assert!(src.is_flushing());
        // A second flush-start is harmless.
        src.push_event(Event::flush_start());
        assert!(!src.push_event(Event::tag(Default::default())));
        src.push_event(Event::flush_stop(true));
        assert!(!src.is_flushing());
    }

    #[test]
    fn test_wrong_way_event_refused() {
        let src = Pad::new("src", PadDirection::Src);
        src.activate_mode(PadMode::Push, true).unwrap();
        assert!(!src.push_event(Event::reconfigure()));
    }

    #[test]
    fn test_probe_drop_and_remove() {
        let src = Pad::new("src", PadDirection::Src);
        src.activate_mode(PadMode::Push, true).unwrap();
        let id = src.add_probe(ProbeType::BUFFER, |_, _| ProbeReturn::Drop);
        // Dropped before the not-linked check.
        assert_eq!(src.push(Buffer::new()), Ok(FlowSuccess::Ok));
        src.remove_probe(id);
        assert_eq!(src.push(Buffer::new()), Err(FlowError::NotLinked));

        src.add_probe(ProbeType::BUFFER, |_, data| {
            if let ProbeData::Buffer(buf) = data {
                buf.set_pts(crate::clock::ClockTime::from_secs(1));
            }
            ProbeReturn::Remove
        });
        let _ = src.push(Buffer::new());
        assert!(src.lock().probes.is_empty());
    }
}
