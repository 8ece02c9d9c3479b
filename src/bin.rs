//! Bins: elements that contain other elements.
//!
//! A [`Bin`] drives its children through every state step, sinks first so
//! that downstream is ready before upstream starts pushing. It intercepts
//! the messages its children post:
//!
//! - `AsyncStart`/`AsyncDone` complete the bin's own asynchronous step once
//!   every child has prerolled.
//! - `Eos` is aggregated: the bin posts a single `Eos` of its own when every
//!   sink child has reached end-of-stream.
//! - Everything else is forwarded upward unchanged.
//!
//! # Example
//!
//! ```rust
//! use sluice::bin::Bin;
//! use sluice::elements::{FakeSink, Identity};
//!
//! let bin = Bin::new("filter");
//! let identity = Identity::new().build("identity");
//! let sink = FakeSink::new().build("sink");
//! bin.add_many(&[&identity, &sink]).unwrap();
//! identity.link(&sink).unwrap();
//!
//! let pad = identity.static_pad("sink").unwrap();
//! bin.add_ghost_pad("sink", &pad).unwrap();
//! assert_eq!(bin.sinks(), vec![sink]);
//! ```

use crate::clock::Clock;
use crate::element::{
    Element, ElementImpl, GhostPad, Pad, State, StateChange, StateChangeResult,
    StateChangeSuccess, combine,
};
use crate::error::{Error, Result};
use crate::event::{Event, EventView, SeekFlags};
use crate::message::{Message, MessageView};
use daggy::petgraph::algo::toposort;
use daggy::{Dag, NodeIndex};
use std::ops::Deref;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct BinState {
    children: Vec<Element>,
    /// Children with an asynchronous step in flight.
    async_pending: Vec<Element>,
    /// Children that posted end-of-stream.
    eos: Vec<Element>,
    eos_posted: bool,
}

/// Container behavior shared by [`Bin`] and the pipeline.
#[derive(Default)]
pub struct BinImpl {
    state: Mutex<BinState>,
}

impl BinImpl {
    /// Empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Children in insertion order.
    pub fn children(&self) -> Vec<Element> {
        self.state.lock().unwrap().children.clone()
    }

    /// Children ordered sinks first, see [`sink_first`].
    pub fn sorted_children(&self) -> Vec<Element> {
        sink_first(&self.children())
    }

    pub(crate) fn add(&self, bin: &Element, child: &Element) -> Result<()> {
        if child == bin {
            return Err(Error::InvalidArgument(format!(
                "cannot add {} to itself",
                bin.name()
            )));
        }
        if self.by_name(child.name()).is_some() {
            return Err(Error::DuplicateName(child.name().to_string()));
        }
        child.set_parent(Some(bin))?;
        self.state.lock().unwrap().children.push(child.clone());

        child.set_clock(bin.clock());
        child.set_base_time(bin.base_time());
        tracing::debug!("{}: added {}", bin.name(), child.name());

        if bin.target_state() > State::Null {
            let child = child.downgrade();
            bin.with_state_lock_async(move |_| {
                if let Some(child) = child.upgrade()
                    && let Err(err) = child.sync_state_with_parent()
                {
                    tracing::warn!("{}: cannot sync state with parent: {err}", child.name());
                }
            });
        }
        Ok(())
    }

    pub(crate) fn remove(&self, bin: &Element, child: &Element) -> Result<()> {
        if !self.state.lock().unwrap().children.contains(child) {
            return Err(Error::NotAChild(child.name().to_string()));
        }

        if let Err(err) = child.set_state(State::Null) {
            tracing::warn!("{}: {} did not reach NULL: {err}", bin.name(), child.name());
        }
        for pad in child.pads() {
            pad.unlink_peer();
        }

        let async_done = {
            let mut st = self.state.lock().unwrap();
            st.children.retain(|c| c != child);
            st.eos.retain(|c| c != child);
            let was_waiting = !st.async_pending.is_empty();
            st.async_pending.retain(|c| c != child);
            was_waiting && st.async_pending.is_empty()
        };
        child.set_parent(None)?;
        tracing::debug!("{}: removed {}", bin.name(), child.name());

        if async_done {
            complete_async(bin);
        }
        self.check_eos(bin);
        Ok(())
    }

    fn by_name(&self, name: &str) -> Option<Element> {
        self.state
            .lock()
            .unwrap()
            .children
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// A child posted `message`.
    pub(crate) fn handle_message(&self, bin: &Element, child: &Element, message: Message) {
        match message.view() {
            MessageView::AsyncStart => {
                {
                    let mut st = self.state.lock().unwrap();
                    if !st.async_pending.contains(child) {
                        st.async_pending.push(child.clone());
                    }
                }
                tracing::trace!("{}: {} went async", bin.name(), child.name());
                if !bin.is_changing_state() {
                    bin.lost_state();
                }
            }
            MessageView::AsyncDone { .. } => {
                let done = {
                    let mut st = self.state.lock().unwrap();
                    st.async_pending.retain(|c| c != child);
                    st.async_pending.is_empty()
                };
                tracing::trace!("{}: {} finished async", bin.name(), child.name());
                if done {
                    complete_async(bin);
                }
            }
            MessageView::Eos => {
                {
                    let mut st = self.state.lock().unwrap();
                    if !st.eos.contains(child) {
                        st.eos.push(child.clone());
                    }
                }
                self.check_eos(bin);
            }
            MessageView::StreamStart => {
                // A new stream re-arms end-of-stream for this branch.
                let mut st = self.state.lock().unwrap();
                st.eos.retain(|c| c != child);
                st.eos_posted = false;
                drop(st);
                bin.post_message(message);
            }
            _ => {
                bin.post_message(message);
            }
        }
    }

    fn check_eos(&self, bin: &Element) {
        let sinks: Vec<Element> = self.children().into_iter().filter(Element::is_sink).collect();
        let post = {
            let mut st = self.state.lock().unwrap();
            let all = !sinks.is_empty() && sinks.iter().all(|s| st.eos.contains(s));
            if all && !st.eos_posted {
                st.eos_posted = true;
                true
            } else {
                false
            }
        };
        if post {
            tracing::debug!("{}: all sinks are EOS", bin.name());
            bin.post_message(Message::new(bin.name(), MessageView::Eos));
        }
    }

    fn reset_eos(&self) {
        let mut st = self.state.lock().unwrap();
        st.eos.clear();
        st.eos_posted = false;
    }
}

/// Complete the bin's pending asynchronous step once no child is still
/// prerolling. Runs on a helper thread holding the bin's state lock, so it
/// only sees the bin after its current state step has settled.
fn complete_async(bin: &Element) {
    bin.with_state_lock_async(|bin| {
        let Some(imp) = bin.imp().as_bin() else {
            return;
        };
        let idle = imp.state.lock().unwrap().async_pending.is_empty();
        if idle && bin.is_async_pending() {
            tracing::debug!("{}: all children prerolled", bin.name());
            bin.commit_state();
        }
    });
}

impl ElementImpl for BinImpl {
    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        match transition {
            StateChange::ReadyToPaused => self.reset_eos(),
            StateChange::PausedToReady | StateChange::ReadyToNull => {
                self.state.lock().unwrap().async_pending.clear();
            }
            _ => {}
        }

        let next = transition.next();
        let mut result = Ok(StateChangeSuccess::Success);
        for child in self.sorted_children() {
            if child.is_locked_state() {
                tracing::trace!("{}: skipping locked {}", element.name(), child.name());
                continue;
            }
            let ret = child.set_state(next);
            match ret {
                Err(_) => tracing::warn!("{}: {} failed {transition}", element.name(), child.name()),
                Ok(StateChangeSuccess::Async) => {
                    tracing::debug!("{}: {} is async", element.name(), child.name())
                }
                Ok(_) => {}
            }
            result = combine(result, ret);
        }

        // Children may have finished prerolling while later ones changed.
        if result == Ok(StateChangeSuccess::Async)
            && self.state.lock().unwrap().async_pending.is_empty()
        {
            result = Ok(StateChangeSuccess::Success);
        }
        result
    }

    fn provide_clock(&self, _element: &Element) -> Option<Arc<dyn Clock>> {
        self.sorted_children().iter().find_map(Element::provide_clock)
    }

    fn is_sink(&self, _element: &Element) -> bool {
        self.children().iter().any(Element::is_sink)
    }

    fn is_source(&self, _element: &Element) -> bool {
        self.children().iter().any(Element::is_source)
    }

    /// Upstream events go to every sink, downstream events to every source.
    fn send_event(&self, element: &Element, event: Event) -> bool {
        if let EventView::Seek(seek) = event.view()
            && seek.flags.contains(SeekFlags::FLUSH)
        {
            self.reset_eos();
        }
        let upstream = event.is_upstream() && !event.is_downstream();
        let targets: Vec<Element> = self
            .children()
            .into_iter()
            .filter(|c| if upstream { c.is_sink() } else { c.is_source() })
            .collect();
        tracing::debug!("{}: sending {} to {} children", element.name(), event.name(), targets.len());

        let mut handled = false;
        for target in targets {
            handled |= target.send_event(event.clone());
        }
        handled
    }

    fn as_bin(&self) -> Option<&BinImpl> {
        Some(self)
    }
}

/// Order `children` so that every element comes before the elements
/// upstream of it. Linked elements come first, then the unlinked ones in
/// insertion order. A cycle in the links keeps insertion order.
pub(crate) fn sink_first(children: &[Element]) -> Vec<Element> {
    let mut dag: Dag<usize, ()> = Dag::new();
    let nodes: Vec<NodeIndex> = (0..children.len()).map(|i| dag.add_node(i)).collect();
    let mut linked = vec![false; children.len()];

    for (i, child) in children.iter().enumerate() {
        for pad in child.src_pads() {
            let Some(downstream) = pad.peer().and_then(|peer| peer.parent_element()) else {
                continue;
            };
            let Some(j) = children.iter().position(|c| *c == downstream) else {
                continue;
            };
            if i == j {
                continue;
            }
            linked[i] = true;
            linked[j] = true;
            if dag.add_edge(nodes[i], nodes[j], ()).is_err() {
                tracing::warn!("link {} creates a cycle, keeping insertion order", pad.path());
                return children.to_vec();
            }
        }
    }

    let Ok(order) = toposort(dag.graph(), None) else {
        return children.to_vec();
    };
    let mut sorted: Vec<Element> = order
        .into_iter()
        .rev()
        .map(|node| dag[node])
        .filter(|&i| linked[i])
        .map(|i| children[i].clone())
        .collect();
    sorted.extend(
        children
            .iter()
            .zip(&linked)
            .filter(|(_, linked)| !**linked)
            .map(|(child, _)| child.clone()),
    );
    sorted
}

// ============================================================================
// Bin
// ============================================================================

/// Handle to an element that contains other elements.
///
/// Dereferences to [`Element`] for state, pads and events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bin(pub(crate) Element);

impl Bin {
    /// Create an empty bin.
    pub fn new(name: impl Into<String>) -> Bin {
        Bin(Element::new(name, BinImpl::new()))
    }

    /// View `element` as a bin, if it is one.
    pub fn from_element(element: Element) -> Option<Bin> {
        element.is_bin().then_some(Bin(element))
    }

    /// The underlying element.
    pub fn element(&self) -> &Element {
        &self.0
    }

    /// Consume the handle, returning the element.
    pub fn into_element(self) -> Element {
        self.0
    }

    fn imp(&self) -> Result<&BinImpl> {
        self.0
            .imp()
            .as_bin()
            .ok_or_else(|| Error::InvalidArgument(format!("{} is not a bin", self.0.name())))
    }

    /// Add a child. Fails when the name is taken or the child already has
    /// a parent. A running bin brings the child to its state in the
    /// background.
    pub fn add(&self, child: &Element) -> Result<()> {
        self.imp()?.add(&self.0, child)
    }

    /// Add several children, stopping at the first failure.
    pub fn add_many(&self, children: &[&Element]) -> Result<()> {
        for child in children {
            self.add(child)?;
        }
        Ok(())
    }

    /// Remove a child: it is set to NULL and unlinked first.
    pub fn remove(&self, child: &Element) -> Result<()> {
        self.imp()?.remove(&self.0, child)
    }

    /// Direct child named `name`.
    pub fn by_name(&self, name: &str) -> Option<Element> {
        self.imp().ok()?.by_name(name)
    }

    /// Child named `name`, searching nested bins too.
    pub fn by_name_recurse(&self, name: &str) -> Option<Element> {
        let imp = self.imp().ok()?;
        if let Some(child) = imp.by_name(name) {
            return Some(child);
        }
        imp.children()
            .into_iter()
            .filter_map(Bin::from_element)
            .find_map(|bin| bin.by_name_recurse(name))
    }

    /// Children in insertion order.
    pub fn children(&self) -> Vec<Element> {
        self.imp().map(BinImpl::children).unwrap_or_default()
    }

    /// Children in the order state changes visit them.
    pub fn sorted(&self) -> Vec<Element> {
        self.imp().map(BinImpl::sorted_children).unwrap_or_default()
    }

    /// Children that are, or contain, sinks.
    pub fn sinks(&self) -> Vec<Element> {
        self.children().into_iter().filter(Element::is_sink).collect()
    }

    /// Children that are, or contain, sources.
    pub fn sources(&self) -> Vec<Element> {
        self.children().into_iter().filter(Element::is_source).collect()
    }

    /// Expose `target`, a pad of a child, as a pad of the bin.
    pub fn add_ghost_pad(&self, name: impl Into<String>, target: &Pad) -> Result<Pad> {
        let ghost = GhostPad::with_target(name, target)?;
        self.0.add_pad(&ghost)?;
        Ok(ghost)
    }
}

impl Deref for Bin {
    type Target = Element;

    fn deref(&self) -> &Element {
        &self.0
    }
}

impl From<Bin> for Element {
    fn from(bin: Bin) -> Element {
        bin.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::elements::{FakeSink, Identity, TestSrc};
    use crate::message::MessageType;
    use std::time::Duration;

    fn names(elements: &[Element]) -> Vec<&str> {
        elements.iter().map(Element::name).collect()
    }

    #[test]
    fn test_sink_first_chain() {
        let src = TestSrc::new().build("src");
        let mid = Identity::new().build("mid");
        let sink = FakeSink::new().build("sink");
        src.link(&mid).unwrap();
        mid.link(&sink).unwrap();

        let sorted = sink_first(&[src.clone(), mid.clone(), sink.clone()]);
        assert_eq!(names(&sorted), ["sink", "mid", "src"]);
    }

    #[test]
    fn test_sink_first_unlinked_last() {
        let lone = FakeSink::new().build("lone");
        let src = TestSrc::new().build("src");
        let sink = FakeSink::new().build("sink");
        src.link(&sink).unwrap();

        let sorted = sink_first(&[lone, src, sink]);
        assert_eq!(names(&sorted), ["sink", "src", "lone"]);
    }

    #[test]
    fn test_add_rejects_duplicates_and_parented() {
        let bin = Bin::new("bin");
        let other = Bin::new("other");
        let a = Identity::new().build("a");
        bin.add(&a).unwrap();

        let twin = Identity::new().build("a");
        assert!(matches!(bin.add(&twin), Err(Error::DuplicateName(_))));
        assert!(matches!(other.add(&a), Err(Error::AlreadyParented(_))));
        assert_eq!(a.parent().as_ref(), Some(bin.element()));
    }

    #[test]
    fn test_remove_unlinks_and_detaches() {
        let bin = Bin::new("bin");
        let src = TestSrc::new().build("src");
        let sink = FakeSink::new().build("sink");
        bin.add_many(&[&src, &sink]).unwrap();
        src.link(&sink).unwrap();

        bin.remove(&sink).unwrap();
        assert!(sink.parent().is_none());
        assert!(!src.static_pad("src").unwrap().is_linked());
        assert!(bin.by_name("sink").is_none());
        assert!(matches!(bin.remove(&sink), Err(Error::NotAChild(_))));
    }

    #[test]
    fn test_by_name_recurse() {
        let outer = Bin::new("outer");
        let inner = Bin::new("inner");
        let deep = Identity::new().build("deep");
        inner.add(&deep).unwrap();
        outer.add(&inner).unwrap();

        assert!(outer.by_name("deep").is_none());
        assert_eq!(outer.by_name_recurse("deep"), Some(deep));
    }

    #[test]
    fn test_sinks_and_sources() {
        let bin = Bin::new("bin");
        let src = TestSrc::new().build("src");
        let mid = Identity::new().build("mid");
        let sink = FakeSink::new().build("sink");
        bin.add_many(&[&src, &mid, &sink]).unwrap();

        assert_eq!(bin.sinks(), vec![sink]);
        assert_eq!(bin.sources(), vec![src]);
        assert!(bin.is_sink());
        assert!(bin.is_source());
    }

    #[test]
    fn test_locked_child_is_skipped() {
        let bin = Bin::new("bin");
        let a = Identity::new().build("a");
        let b = Identity::new().build("b");
        bin.add_many(&[&a, &b]).unwrap();
        b.set_locked_state(true);

        bin.set_state(State::Ready).unwrap();
        assert_eq!(a.current_state(), State::Ready);
        assert_eq!(b.current_state(), State::Null);
        bin.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_child_messages_forwarded() {
        let bus = Bus::new();
        let bin = Bin::new("bin");
        bin.set_bus(Some(bus.clone()));
        let a = Identity::new().build("a");
        bin.add(&a).unwrap();

        bin.set_state(State::Ready).unwrap();
        let from_child = std::iter::from_fn(|| bus.timed_pop(Duration::from_millis(10)))
            .filter(|m| m.message_type() == MessageType::StateChanged)
            .any(|m| m.src() == "a");
        assert!(from_child);
        bin.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_ghost_pad_on_bin() {
        let bin = Bin::new("bin");
        let identity = Identity::new().build("identity");
        bin.add(&identity).unwrap();

        let target = identity.static_pad("src").unwrap();
        let ghost = bin.add_ghost_pad("src", &target).unwrap();
        assert!(ghost.is_ghost());
        assert_eq!(GhostPad::target(&ghost), Some(target));
        assert_eq!(bin.static_pad("src"), Some(ghost));
    }
}
