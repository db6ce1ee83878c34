//! The event target: a dedicated task delivering user callbacks in FIFO
//! order, decoupled from the engine so slow listeners never stall it.

use tokio::sync::mpsc;

use crate::core::view::event::Event;
use crate::logger::Logger;
use crate::runtime::spawn_detached;

enum EventBatch {
    /// A batch raised by one engine mutation; delivered back-to-back so
    /// listeners never observe a partial update.
    Events(Vec<Event>),
    /// A completion callback ordered with respect to surrounding events.
    Closure(Box<dyn FnOnce() + Send>),
}

#[derive(Clone)]
pub struct EventTarget {
    sender: mpsc::UnboundedSender<EventBatch>,
}

impl EventTarget {
    pub fn new(logger: Logger) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<EventBatch>();
        spawn_detached(async move {
            while let Some(batch) = receiver.recv().await {
                match batch {
                    EventBatch::Events(events) => {
                        for event in events {
                            logger.debug(format!("raising {event:?}"));
                            event.fire();
                        }
                    }
                    EventBatch::Closure(closure) => closure(),
                }
            }
        });
        Self { sender }
    }

    /// Queues a batch of events; they fire together, in order.
    pub fn post_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let _ = self.sender.send(EventBatch::Events(events));
    }

    /// Queues a callback behind everything already queued.
    pub fn post(&self, closure: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(EventBatch::Closure(Box::new(closure)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn closures_and_events_stay_ordered() {
        let target = EventTarget::new(Logger::new("firebase-database/test-events"));
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        for value in 0..10u32 {
            let captured = seen.clone();
            target.post(move || captured.lock().unwrap().push(value));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }
}
