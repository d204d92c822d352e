//! The fanout transport the monitor publishes on and dispatches from.
//!
//! The shipped [`InProcessBus`] mirrors the in-memory fallback this codebase
//! already reaches for when a real broker isn't warranted: a process-wide
//! registry of named `tokio::sync::broadcast` channels, so every peer that
//! `connect`s with the same bus name lands on the same exchange without any
//! of them needing a handle to the others. A networked implementation of the
//! same trait (backed by an AMQP fanout exchange, say) is an external
//! collaborator and out of scope for the core.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// Publish a message to the group fanout; hand back a dedicated receiver for
/// every subscriber. Delivery is reliable and per-sender ordered, but not
/// globally ordered, and there is no delivery-to-self suppression — peers
/// that care filter their own messages themselves.
pub trait Transport: Send + Sync + 'static {
    fn publish(&self, bytes: Vec<u8>);

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;
}

type Registry = Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A named in-process fanout exchange. Every [`InProcessBus::connect`] with
/// the same `bus_name` in the same process joins the same exchange.
#[derive(Clone)]
pub struct InProcessBus {
    tx: broadcast::Sender<Vec<u8>>,
}

impl InProcessBus {
    pub fn connect(bus_name: &str) -> Self {
        let mut map = registry().lock().unwrap();
        let tx = map
            .entry(bus_name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        Self { tx }
    }
}

impl Transport for InProcessBus {
    fn publish(&self, bytes: Vec<u8>) {
        // A fanout publish with no current subscribers is not an error.
        let _ = self.tx.send(bytes);
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_on_the_same_bus_name_share_an_exchange() {
        let a = InProcessBus::connect("test-bus-share");
        let mut rx = a.subscribe();
        let b = InProcessBus::connect("test-bus-share");
        b.publish(vec![1, 2, 3]);
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn different_bus_names_do_not_cross_talk() {
        let a = InProcessBus::connect("test-bus-a");
        let b = InProcessBus::connect("test-bus-b");
        let mut rx_a = a.subscribe();
        b.publish(vec![9]);
        assert!(rx_a.try_recv().is_err());
    }
}
