//! Tee element - duplicates buffers to multiple outputs.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::{Element, ElementImpl, Pad, PadDirection, PadTemplate};
use crate::error::{FlowError, FlowResult, FlowSuccess};
use crate::event::{Event, EventView};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Pushes every incoming buffer to all of its `src_%u` request pads.
///
/// Buffers are shared, not copied. An unlinked branch does not stop the
/// others; the push only fails with not-linked when no branch is linked.
///
/// # Example
///
/// ```rust
/// use sluice::elements::Tee;
///
/// let tee = Tee::new().build("tee");
/// let a = tee.request_pad("src_%u", None).unwrap();
/// let b = tee.request_pad("src_%u", None).unwrap();
/// assert_eq!((a.name(), b.name()), ("src_0", "src_1"));
/// ```
#[derive(Default)]
pub struct Tee {
    next_pad: AtomicU32,
    count: AtomicU64,
}

impl Tee {
    /// Create a new Tee element.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in an element.
    pub fn build(self, name: impl Into<String>) -> Element {
        Element::new(name, self)
    }

    /// Buffers received so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Replay the sink pad's stream configuration onto a branch that has
    /// not seen any yet (a pad requested mid-stream).
    fn prime_branch(sink: &Pad, branch: &Pad) {
        if !branch.sticky_events().is_empty() {
            return;
        }
        for event in sink.sticky_events() {
            if !matches!(event.view(), EventView::Eos) {
                branch.push_event(event);
            }
        }
    }
}

impl ElementImpl for Tee {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![
            PadTemplate::sink("sink", Caps::new_any()),
            PadTemplate::request_src("src_%u", Caps::new_any()),
        ]
    }

    fn request_new_pad(
        &self,
        element: &Element,
        template: &PadTemplate,
        name: Option<&str>,
    ) -> Option<Pad> {
        let name = match name {
            Some(name) => name.to_string(),
            None => loop {
                let n = self.next_pad.fetch_add(1, Ordering::Relaxed);
                let candidate = template.instance_name(n);
                if element.static_pad(&candidate).is_none() {
                    break candidate;
                }
            },
        };
        tracing::debug!("{}: new branch {name}", element.name());
        Some(Pad::from_template(template, name))
    }

    fn chain(&self, element: &Element, pad: &Pad, buffer: Buffer) -> FlowResult {
        self.count.fetch_add(1, Ordering::Relaxed);
        let branches = element.src_pads();
        if branches.is_empty() {
            return Err(FlowError::NotLinked);
        }

        let mut any_ok = false;
        let mut last = FlowError::NotLinked;
        for branch in &branches {
            Self::prime_branch(pad, branch);
            match branch.push(buffer.clone()) {
                Ok(_) => any_ok = true,
                Err(FlowError::NotLinked) => {}
                Err(flow) if flow.is_fatal() => return Err(flow),
                Err(flow) => last = flow,
            }
        }
        if any_ok {
            Ok(FlowSuccess::Ok)
        } else {
            Err(last)
        }
    }

    fn src_event(&self, element: &Element, pad: &Pad, event: Event) -> bool {
        // Upstream events from one branch only reach the sink pad.
        match element.static_pad("sink") {
            Some(sink) => {
                tracing::trace!("{}: upstream {} from {}", element.name(), event.name(), pad.name());
                sink.push_event(event)
            }
            None => false,
        }
    }

    fn query_caps(&self, element: &Element, pad: &Pad, filter: Option<&Caps>) -> Caps {
        let mut caps = pad.template_caps();
        if let Some(filter) = filter {
            caps = caps.intersect(filter);
        }
        let others = element.pads().into_iter().filter(|p| p != pad);
        for other in others {
            if pad.direction() == PadDirection::Src && other.is_src() {
                continue;
            }
            if other.is_linked() {
                caps = caps.intersect(&other.peer_query_caps(Some(&caps)));
            }
        }
        caps
    }
}
