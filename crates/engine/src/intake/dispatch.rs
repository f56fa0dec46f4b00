use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::warn;

use super::MessageDispatch;

/// Messages routed by a type tag (the message template name on the wire).
pub trait TaggedMessage {
    fn tag(&self) -> &str;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed {tag} message: {reason}")]
    Malformed { tag: String, reason: String },
    #[error("{tag} handler failed: {reason}")]
    Handler { tag: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub handled: u64,
    pub unhandled: u64,
    pub failed: u64,
}

type Handler<M> = Box<dyn FnMut(&M) -> Result<(), DispatchError>>;

/// Handler table keyed by message tag. Unknown tags and handler errors are logged and
/// counted; neither ever interrupts the drain that fed the message in.
pub struct DispatchTable<M> {
    handlers: HashMap<String, Handler<M>>,
    stats: DispatchStats,
}

impl<M> Default for DispatchTable<M> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            stats: DispatchStats::default(),
        }
    }
}

impl<M> fmt::Debug for DispatchTable<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags = self.handlers.keys().collect::<Vec<_>>();
        tags.sort();
        f.debug_struct("DispatchTable")
            .field("tags", &tags)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<M: TaggedMessage> DispatchTable<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, tag: impl Into<String>, handler: F)
    where
        F: FnMut(&M) -> Result<(), DispatchError> + 'static,
    {
        let tag = tag.into();
        if self.handlers.insert(tag.clone(), Box::new(handler)).is_some() {
            warn!(tag = %tag, "dispatch_handler_replaced");
        }
    }

    pub fn handles(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }
}

impl<M: TaggedMessage> MessageDispatch<M> for DispatchTable<M> {
    fn dispatch(&mut self, message: M) {
        let Some(handler) = self.handlers.get_mut(message.tag()) else {
            self.stats.unhandled = self.stats.unhandled.saturating_add(1);
            warn!(tag = message.tag(), "unhandled_message");
            return;
        };

        match handler(&message) {
            Ok(()) => self.stats.handled = self.stats.handled.saturating_add(1),
            Err(error) => {
                self.stats.failed = self.stats.failed.saturating_add(1);
                warn!(tag = message.tag(), error = %error, "message_dispatch_failed");
            }
        }
    }
}
