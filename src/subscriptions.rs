use std::collections::{BTreeSet, HashMap};
use tokio::sync::oneshot;

type Waiters = Vec<oneshot::Sender<bool>>;

/// Topics a supervisor believes are subscribed on the wire, plus requests still
/// waiting for their acknowledgement.
///
/// The set is a cache: it is rebuilt from the store whenever the connection comes up.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    subscribed: BTreeSet<String>,
    pending_subscribe: HashMap<String, Waiters>,
    pending_unsubscribe: HashMap<String, Waiters>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscribed.contains(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.subscribed.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.subscribed.clear();
    }

    /// Records a subscribe request. Returns true when the caller has to put a
    /// SUBSCRIBE on the wire, false when one for the same topic is already in flight.
    pub fn begin_subscribe(&mut self, topic: &str, waiter: Option<oneshot::Sender<bool>>) -> bool {
        begin(&mut self.pending_subscribe, topic, waiter)
    }

    /// Settles an in-flight subscribe and answers everybody waiting on it.
    pub fn finish_subscribe(&mut self, topic: &str, acked: bool) {
        if acked {
            self.subscribed.insert(topic.to_string());
        }
        finish(&mut self.pending_subscribe, topic, acked);
    }

    /// Answers every in-flight request with failure. Used when the connection they
    /// were sent on goes away.
    pub fn abandon_pending(&mut self) {
        for (_, waiters) in self.pending_subscribe.drain().chain(self.pending_unsubscribe.drain()) {
            for waiter in waiters {
                let _ = waiter.send(false);
            }
        }
    }

    pub fn begin_unsubscribe(&mut self, topic: &str, waiter: Option<oneshot::Sender<bool>>) -> bool {
        begin(&mut self.pending_unsubscribe, topic, waiter)
    }

    pub fn finish_unsubscribe(&mut self, topic: &str, acked: bool) {
        if acked {
            self.subscribed.remove(topic);
        }
        finish(&mut self.pending_unsubscribe, topic, acked);
    }
}

fn begin(pending: &mut HashMap<String, Waiters>, topic: &str, waiter: Option<oneshot::Sender<bool>>) -> bool {
    let fresh = !pending.contains_key(topic);
    let waiters = pending.entry(topic.to_string()).or_default();
    waiters.extend(waiter);
    fresh
}

fn finish(pending: &mut HashMap<String, Waiters>, topic: &str, acked: bool) {
    for waiter in pending.remove(topic).unwrap_or_default() {
        let _ = waiter.send(acked);
    }
}
