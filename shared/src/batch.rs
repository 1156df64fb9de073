//! Coalescing buffer for batched-class events

use crate::events::ServerEvent;

/// Holds batched events until their window closes
///
/// Events sharing a coalesce key replace each other in place, so a flurry of
/// presence flips for one player reaches clients as a single final state.
#[derive(Debug)]
pub struct EventBatcher {
    window_ms: u64,
    opened_at: Option<u64>,
    pending: Vec<(Option<String>, ServerEvent)>,
}

impl EventBatcher {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            opened_at: None,
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, event: ServerEvent, now: u64) {
        let key = event.coalesce_key();
        if let Some(k) = &key {
            if let Some(slot) = self
                .pending
                .iter_mut()
                .find(|(existing, _)| existing.as_ref() == Some(k))
            {
                slot.1 = event;
                return;
            }
        }
        self.opened_at.get_or_insert(now);
        self.pending.push((key, event));
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.opened_at
            .map(|opened| now.saturating_sub(opened) >= self.window_ms)
            .unwrap_or(false)
    }

    /// Drains the buffer if the window has elapsed
    pub fn take_due(&mut self, now: u64) -> Option<Vec<ServerEvent>> {
        if self.is_due(now) {
            Some(self.flush())
        } else {
            None
        }
    }

    pub fn flush(&mut self) -> Vec<ServerEvent> {
        self.opened_at = None;
        self.pending.drain(..).map(|(_, event)| event).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConnectionState;

    fn presence(id: &str, connection: ConnectionState) -> ServerEvent {
        ServerEvent::PlayerPresenceChanged {
            player_id: id.to_string(),
            connection,
        }
    }

    #[test]
    fn test_window_controls_flush() {
        let mut batcher = EventBatcher::new(200);
        assert!(!batcher.is_due(0));

        batcher.push(presence("p1", ConnectionState::Disconnected), 1_000);
        assert!(batcher.take_due(1_100).is_none());
        let flushed = batcher.take_due(1_200).unwrap();
        assert_eq!(flushed.len(), 1);
        assert!(batcher.is_empty());
        assert!(!batcher.is_due(5_000));
    }

    #[test]
    fn test_same_key_coalesces_to_latest() {
        let mut batcher = EventBatcher::new(100);
        batcher.push(presence("p1", ConnectionState::Disconnected), 0);
        batcher.push(presence("p2", ConnectionState::Disconnected), 10);
        batcher.push(presence("p1", ConnectionState::Connected), 20);

        assert_eq!(batcher.len(), 2);
        let events = batcher.flush();
        assert_eq!(events[0], presence("p1", ConnectionState::Connected));
        assert_eq!(events[1], presence("p2", ConnectionState::Disconnected));
    }
}
