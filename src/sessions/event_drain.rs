//! Iterator returned by [`LinkController::events`](crate::LinkController::events).

use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::LinkEvent;

/// Drains the controller's pending [`LinkEvent`]s, oldest first.
///
/// Hides the underlying queue type so it can change without breaking callers. Whatever is
/// left when the drain is dropped is thrown away, so a caller that only wants the
/// `Closed` event can stop as soon as it sees it.
///
/// ```ignore
/// for event in controller.events() {
///     if let LinkEvent::Closed { outcome, cause } = event {
///         tracing::info!(%outcome, %cause, "duel over");
///         break;
///     }
/// }
/// ```
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    pending: Drain<'a, LinkEvent>,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(pending: Drain<'a, LinkEvent>) -> Self {
        Self { pending }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = LinkEvent;

    fn next(&mut self) -> Option<LinkEvent> {
        self.pending.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.pending.size_hint()
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<LinkEvent> {
        self.pending.next_back()
    }
}

impl ExactSizeIterator for EventDrain<'_> {}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::{Outcome, Role, TerminationCause};
    use std::collections::VecDeque;

    fn session_log() -> VecDeque<LinkEvent> {
        VecDeque::from(vec![
            LinkEvent::Active { role: Role::Host },
            LinkEvent::OutcomeDecided {
                outcome: Outcome::Win,
            },
            LinkEvent::Closed {
                outcome: Outcome::Win,
                cause: TerminationCause::LocalOutcome,
            },
        ])
    }

    #[test]
    fn yields_events_in_arrival_order() {
        let mut queue = session_log();
        let drained: Vec<_> = EventDrain::from_drain(queue.drain(..)).collect();
        assert_eq!(drained, Vec::from(session_log()));
        assert!(queue.is_empty());
    }

    #[test]
    fn stopping_early_still_empties_the_queue() {
        let mut queue = session_log();
        let first = EventDrain::from_drain(queue.drain(..)).next();
        assert_eq!(first, Some(LinkEvent::Active { role: Role::Host }));
        assert!(queue.is_empty());
    }

    #[test]
    fn reports_remaining_length_from_both_ends() {
        let mut queue = session_log();
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(drain.len(), 3);
        assert!(matches!(drain.next_back(), Some(LinkEvent::Closed { .. })));
        assert_eq!(drain.len(), 2);
        assert_eq!(format!("{drain:?}"), "EventDrain { pending: 2, .. }");
        drain.by_ref().for_each(drop);
        assert_eq!(drain.next(), None);
        assert_eq!(drain.next(), None);
    }
}
