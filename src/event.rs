//! A small typed event dispatcher.
//!
//! Components subscribe with a scope handle and receive every dispatched
//! event in subscription order over their own channel. Dropping a receiver
//! (or unsubscribing the scope) removes the subscription on the next
//! dispatch, so a component's listeners die with it.

use tokio::sync::mpsc;

/// Identifies a subscription so it can be removed at shutdown.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Scope(u64);

pub(crate) struct Dispatcher<E: Clone> {
    subscribers: Vec<(Scope, mpsc::UnboundedSender<E>)>,
    next_scope: u64,
}

impl<E: Clone> Dispatcher<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            next_scope: 0,
        }
    }

    pub fn subscribe(&mut self) -> (Scope, mpsc::UnboundedReceiver<E>) {
        let scope = Scope(self.next_scope);
        self.next_scope += 1;
        let (chan, port) = mpsc::unbounded_channel();
        self.subscribers.push((scope, chan));
        (scope, port)
    }

    pub fn unsubscribe(&mut self, scope: Scope) {
        self.subscribers.retain(|(s, _)| *s != scope);
    }

    /// Delivers the event to all live subscribers in subscription order,
    /// pruning the ones whose receivers are gone.
    pub fn dispatch(&mut self, event: E) {
        self.subscribers
            .retain(|(_, chan)| chan.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_order_and_pruning() {
        let mut dispatcher = Dispatcher::new();
        let (_scope_a, mut port_a) = dispatcher.subscribe();
        let (scope_b, mut port_b) = dispatcher.subscribe();

        dispatcher.dispatch(1u32);
        dispatcher.dispatch(2u32);
        assert_eq!(port_a.try_recv().unwrap(), 1);
        assert_eq!(port_a.try_recv().unwrap(), 2);
        assert_eq!(port_b.try_recv().unwrap(), 1);

        // unsubscribing stops delivery
        dispatcher.unsubscribe(scope_b);
        dispatcher.dispatch(3u32);
        assert_eq!(port_a.try_recv().unwrap(), 3);
        assert!(port_b.try_recv().is_err());

        // a dropped receiver is pruned on the next dispatch
        drop(port_a);
        dispatcher.dispatch(4u32);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}
