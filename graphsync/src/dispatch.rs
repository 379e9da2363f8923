//! Outbound notification dispatch with a pending queue.
//!
//! A notification is posted immediately only while the surface is both ready
//! and visible. Anything else lands in the pending queue, keyed by
//! [`NotificationType`]:
//!
//! - overwriteable types collapse to their latest entry;
//! - the full-state type evicts every other entry;
//! - any other type replaces its previous entry in place.
//!
//! Entries are either a stamped message ([`Pending::Fixed`]) or a marker that
//! the controller rebuilds from current state at flush time
//! ([`Pending::Recompute`]).

use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::channel::MessageChannel;
use crate::protocol::{Notification, NotificationType, OutboundMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    Fixed(OutboundMessage),
    Recompute,
}

/// Queue and delivery flags. Pure state, no I/O.
#[derive(Debug)]
pub struct Dispatcher {
    ready: bool,
    visible: bool,
    next_id: u64,
    pending: IndexMap<NotificationType, Pending>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// A dispatcher for a visible surface that has not yet reported ready.
    pub fn new() -> Self {
        Self { ready: false, visible: true, next_id: 0, pending: IndexMap::new() }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn can_deliver(&self) -> bool {
        self.ready && self.visible
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Assigns the next message id.
    pub fn stamp(&mut self, notification: Notification, completion_id: Option<String>) -> OutboundMessage {
        self.next_id += 1;
        OutboundMessage { id: self.next_id, notification, completion_id }
    }

    pub fn enqueue(&mut self, kind: NotificationType, entry: Pending) {
        if kind == NotificationType::DidChangeState {
            self.pending.clear();
        } else if kind.overwriteable() {
            self.pending.shift_remove(&kind);
        }
        self.pending.insert(kind, entry);
    }

    /// Queues a marker for `kind`. Types the controller cannot rebuild are
    /// dropped with a warning.
    pub fn enqueue_recompute(&mut self, kind: NotificationType) -> bool {
        if !kind.regenerable() {
            warn!("no regenerator for {kind:?}; pending entry dropped");
            return false;
        }
        self.enqueue(kind, Pending::Recompute);
        true
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Removes and returns every pending entry in queue order.
    pub fn take_pending(&mut self) -> Vec<(NotificationType, Pending)> {
        self.pending.drain(..).collect()
    }

    pub fn pending_kinds(&self) -> Vec<NotificationType> {
        self.pending.keys().copied().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// A [`Dispatcher`] bound to a [`MessageChannel`].
pub struct Outbox {
    dispatcher: Mutex<Dispatcher>,
    channel: Arc<dyn MessageChannel>,
}

impl Outbox {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { dispatcher: Mutex::new(Dispatcher::new()), channel }
    }

    pub fn can_deliver(&self) -> bool {
        self.dispatcher.lock().can_deliver()
    }

    pub fn is_ready(&self) -> bool {
        self.dispatcher.lock().is_ready()
    }

    pub fn set_ready(&self, ready: bool) {
        self.dispatcher.lock().set_ready(ready);
    }

    pub fn set_visible(&self, visible: bool) {
        self.dispatcher.lock().set_visible(visible);
    }

    pub fn defer(&self, kind: NotificationType) {
        self.dispatcher.lock().enqueue_recompute(kind);
    }

    pub fn clear(&self) {
        self.dispatcher.lock().clear();
    }

    pub fn take_pending(&self) -> Vec<(NotificationType, Pending)> {
        self.dispatcher.lock().take_pending()
    }

    pub fn pending_kinds(&self) -> Vec<NotificationType> {
        self.dispatcher.lock().pending_kinds()
    }

    /// Posts `notification` now if the surface can take it, otherwise queues it.
    ///
    /// A successful post clears the whole queue; a failed one queues the
    /// stamped message.
    pub async fn notify(&self, notification: Notification, completion_id: Option<String>) -> bool {
        let (message, deliverable) = {
            let mut dispatcher = self.dispatcher.lock();
            let message = dispatcher.stamp(notification, completion_id);
            (message, dispatcher.can_deliver())
        };
        if !deliverable {
            debug!("surface unavailable, queueing {:?}", message.notification.kind());
            self.dispatcher
                .lock()
                .enqueue(message.notification.kind(), Pending::Fixed(message));
            return false;
        }
        self.post(message).await
    }

    /// Re-posts an already stamped message taken from the queue.
    pub async fn resend(&self, message: OutboundMessage) -> bool {
        self.post(message).await
    }

    async fn post(&self, message: OutboundMessage) -> bool {
        let delivered = self.channel.post(&message).await;
        let mut dispatcher = self.dispatcher.lock();
        if delivered {
            dispatcher.clear();
        } else {
            warn!("delivery of message {} failed, queueing", message.id);
            dispatcher.enqueue(message.notification.kind(), Pending::Fixed(message));
        }
        delivered
    }
}
