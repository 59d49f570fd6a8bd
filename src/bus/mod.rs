use crate::command::Command;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Queue depth of each subscription. Events beyond this are dropped rather
/// than back-pressuring the writer.
const SUBSCRIPTION_BUFFER: usize = 1024;

/// A subscription to one collection's committed commands, delivered in
/// commit order. The stream ends when the subscription is dropped or the
/// database shuts down.
pub struct ChangeStream {
    receiver: Receiver<Command>,
    dropped: Arc<AtomicU64>,
}

impl ChangeStream {
    /// Block for the next command; `None` once the stream is closed.
    pub fn recv(&self) -> Option<Command> {
        self.receiver.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Command> {
        self.receiver.try_recv().ok()
    }

    /// How many events this subscription has missed to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Subscription {
    sender: Sender<Command>,
    dropped: Arc<AtomicU64>,
}

type Topics = Arc<RwLock<HashMap<String, Vec<Subscription>>>>;

/// Topic-per-collection fan-out over commit notifications. Publishing hands
/// the command to a single dispatcher thread, which offers it to each
/// subscription's bounded queue; full queues drop the event and count it, so
/// the writer never stalls on consumers.
pub struct ChangeBus {
    ingest: Sender<Command>,
    topics: Topics,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        let (ingest, feed) = unbounded::<Command>();
        let topics: Topics = Arc::new(RwLock::new(HashMap::new()));
        let dispatch_topics = topics.clone();
        thread::spawn(move || {
            while let Ok(command) = feed.recv() {
                dispatch(&dispatch_topics, command);
            }
        });
        ChangeBus { ingest, topics }
    }

    pub fn subscribe(&self, collection: &str) -> ChangeStream {
        let (sender, receiver) = bounded(SUBSCRIPTION_BUFFER);
        let dropped = Arc::new(AtomicU64::new(0));
        self.topics
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(Subscription {
                sender,
                dropped: dropped.clone(),
            });
        ChangeStream { receiver, dropped }
    }

    /// Enqueue a committed command for delivery. Never blocks.
    pub fn publish(&self, command: Command) {
        // the dispatcher is gone only during shutdown
        let _ = self.ingest.send(command);
    }
}

fn dispatch(topics: &Topics, command: Command) {
    let mut topics = topics.write();
    let Some(subscriptions) = topics.get_mut(&command.collection) else {
        return;
    };
    subscriptions.retain(|subscription| {
        match subscription.sender.try_send(command.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = subscription.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "change stream subscriber on {} is full; dropped {} events",
                    command.collection,
                    dropped
                );
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    });
    if subscriptions.is_empty() {
        topics.remove(&command.collection);
    }
}
