//! Ghost pads: a bin's pads that stand in for pads of its children.
//!
//! A ghost pad is a pair. The ghost itself sits on the bin and links to
//! the outside world; its internal proxy is linked to the target pad inside
//! the bin. Data, events and caps queries cross the pair in both
//! directions, so the bin behaves like a single element.
//!
//! ```text
//!   outside ──► [ghost sink │ proxy src] ──► child:sink
//! ```

use super::pad::{Pad, PadDirection, PadKind};
use crate::error::{PadLinkError, Result};
use std::sync::Arc;

/// Constructors for ghost pads.
pub struct GhostPad;

impl GhostPad {
    /// Create an untargeted ghost pad.
    pub fn new(name: impl Into<String>, direction: PadDirection) -> Pad {
        let name = name.into();
        let inner = Arc::new_cyclic(|weak| {
            let internal = Pad::build(
                name.clone(),
                direction.opposite(),
                None,
                PadKind::Proxy { ghost: weak.clone() },
            );
            Pad::inner(name.clone(), direction, None, PadKind::Ghost { internal })
        });
        Pad(inner)
    }

    /// Create a ghost pad for `target`, taking its direction.
    pub fn with_target(name: impl Into<String>, target: &Pad) -> Result<Pad> {
        let ghost = Self::new(name, target.direction());
        Self::set_target(&ghost, Some(target))?;
        Ok(ghost)
    }

    /// Retarget `ghost`: unlink from the old target, link to the new one.
    pub fn set_target(ghost: &Pad, target: Option<&Pad>) -> Result<()> {
        let PadKind::Ghost { internal } = &ghost.0.kind else {
            return Err(PadLinkError::WrongHierarchy.into());
        };
        if let Some(target) = target
            && target.direction() != ghost.direction()
        {
            return Err(PadLinkError::WrongDirection.into());
        }
        internal.unlink_peer();
        if let Some(target) = target {
            match ghost.direction() {
                PadDirection::Sink => internal.link(target)?,
                PadDirection::Src => target.link(internal)?,
            }
            tracing::debug!("{}: ghosting {}", ghost.name(), target.path());
        }
        Ok(())
    }

    /// Current target of `ghost`.
    pub fn target(ghost: &Pad) -> Option<Pad> {
        target_of(ghost)
    }
}

pub(crate) fn target_of(pad: &Pad) -> Option<Pad> {
    match &pad.0.kind {
        PadKind::Ghost { internal } => internal.peer(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Caps;

    #[test]
    fn test_ghost_direction_and_target() {
        let target = Pad::new("sink", PadDirection::Sink);
        let ghost = GhostPad::with_target("sink", &target).unwrap();
        assert!(ghost.is_ghost());
        assert!(ghost.is_sink());
        assert_eq!(GhostPad::target(&ghost), Some(target.clone()));

        GhostPad::set_target(&ghost, None).unwrap();
        assert!(GhostPad::target(&ghost).is_none());
        assert!(!target.is_linked());
    }

    #[test]
    fn test_ghost_wrong_direction() {
        let ghost = GhostPad::new("src", PadDirection::Src);
        let target = Pad::new("sink", PadDirection::Sink);
        assert!(GhostPad::set_target(&ghost, Some(&target)).is_err());
    }

    #[test]
    fn test_ghost_caps_follow_target() {
        let tmpl = crate::element::PadTemplate::sink("sink", "audio/x-raw".parse::<Caps>().unwrap());
        let target = Pad::from_template(&tmpl, "sink");
        let ghost = GhostPad::with_target("in", &target).unwrap();
        assert_eq!(ghost.query_caps(None), tmpl.caps);
    }
}
