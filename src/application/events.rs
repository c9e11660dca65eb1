use crate::domain::jobs::JobEvent;
use tokio::sync::broadcast;

/// In-process fan-out of job lifecycle events.
#[derive(Debug)]
pub struct EventHub {
    sender: broadcast::Sender<JobEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        // Slow subscribers lag rather than block publishers.
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: JobEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
