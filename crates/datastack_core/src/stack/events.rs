//! In-process bus for persist notifications.

use parking_lot::Mutex;
use std::sync::mpsc::{channel, Receiver, Sender};

/// Outcome of one persist call, published before its completion runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistNotification {
    DidPersist,
    DidFailToPersist { error: String },
}

/// Fans persist notifications out to every live subscriber.
#[derive(Default)]
pub(crate) struct PersistBus {
    subscribers: Mutex<Vec<Sender<PersistNotification>>>,
}

impl PersistBus {
    pub fn subscribe(&self) -> Receiver<PersistNotification> {
        let (sender, receiver) = channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Delivers `notification` and forgets subscribers whose receiver is gone.
    pub fn publish(&self, notification: &PersistNotification) {
        self.subscribers
            .lock()
            .retain(|sender| sender.send(notification.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::{PersistBus, PersistNotification};

    #[test]
    fn publish_reaches_every_subscriber_and_drops_closed_ones() {
        let bus = PersistBus::default();
        let first = bus.subscribe();
        let second = bus.subscribe();
        drop(second);

        bus.publish(&PersistNotification::DidPersist);

        assert_eq!(first.try_recv().unwrap(), PersistNotification::DidPersist);
        assert_eq!(bus.subscribers.lock().len(), 1);
    }
}
