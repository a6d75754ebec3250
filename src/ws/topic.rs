use super::codec::{ControlFrame, GroupId};

/// Holds the single group the session is interested in.
///
/// The server forgets subscriptions when the transport drops, so the
/// registry is the source of truth and is replayed after every open.
#[derive(Debug, Default)]
pub(crate) struct TopicRegistry {
    current: Option<GroupId>,
}

impl TopicRegistry {
    /// Record `group_id` as the active topic. Returns the frames to send,
    /// which are empty unless the session is connected.
    pub(crate) fn subscribe(&mut self, group_id: GroupId, connected: bool) -> Vec<ControlFrame> {
        let previous = self.current.replace(group_id);
        if !connected {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(2);
        if let Some(old) = previous
            && old != group_id
        {
            frames.push(ControlFrame::Unsubscribe { group_id: old });
        }
        frames.push(ControlFrame::Subscribe { group_id });
        frames
    }

    /// Clear the active topic regardless of connection state.
    pub(crate) fn unsubscribe(&mut self, connected: bool) -> Option<ControlFrame> {
        let group_id = self.current.take()?;
        connected.then_some(ControlFrame::Unsubscribe { group_id })
    }

    /// Frame re-asserting the active topic on a fresh transport.
    pub(crate) fn replay(&self) -> Option<ControlFrame> {
        self.current
            .map(|group_id| ControlFrame::Subscribe { group_id })
    }

    pub(crate) fn current(&self) -> Option<GroupId> {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_while_disconnected_sends_nothing() {
        let mut topics = TopicRegistry::default();

        assert!(topics.subscribe(5, false).is_empty());
        assert_eq!(topics.current(), Some(5));
        assert_eq!(topics.replay(), Some(ControlFrame::Subscribe { group_id: 5 }));
    }

    #[test]
    fn switching_topics_unsubscribes_old_first() {
        let mut topics = TopicRegistry::default();
        _ = topics.subscribe(1, true);

        let frames = topics.subscribe(2, true);

        assert_eq!(
            frames,
            vec![
                ControlFrame::Unsubscribe { group_id: 1 },
                ControlFrame::Subscribe { group_id: 2 },
            ]
        );
        assert_eq!(topics.current(), Some(2));
    }

    #[test]
    fn resubscribing_same_topic_does_not_unsubscribe() {
        let mut topics = TopicRegistry::default();
        _ = topics.subscribe(9, true);

        assert_eq!(
            topics.subscribe(9, true),
            vec![ControlFrame::Subscribe { group_id: 9 }]
        );
    }

    #[test]
    fn unsubscribe_clears_even_when_disconnected() {
        let mut topics = TopicRegistry::default();
        _ = topics.subscribe(3, false);

        assert_eq!(topics.unsubscribe(false), None);
        assert_eq!(topics.current(), None);
        assert_eq!(topics.replay(), None);
    }

    #[test]
    fn unsubscribe_while_connected_emits_frame() {
        let mut topics = TopicRegistry::default();
        _ = topics.subscribe(3, true);

        assert_eq!(
            topics.unsubscribe(true),
            Some(ControlFrame::Unsubscribe { group_id: 3 })
        );
        assert_eq!(topics.unsubscribe(true), None);
    }
}
