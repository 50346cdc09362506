//! Event bus for build lifecycle notifications
//!
//! Listeners (a dev server, the CLI printer) register handlers by event
//! name. Handlers run synchronously on the emitting task and must not block.

use crate::build::BuildResults;
use crate::changes::ChangeSet;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    FsChange,
    BuildStart,
    BuildFinish,
    BuildLog,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BuildEvent {
    FsChange(ChangeSet),
    #[serde(rename_all = "camelCase")]
    BuildStart { build_id: u64, is_rebuild: bool },
    BuildFinish(BuildResults),
    BuildLog { message: String },
}

impl BuildEvent {
    pub fn name(&self) -> EventName {
        match self {
            BuildEvent::FsChange(_) => EventName::FsChange,
            BuildEvent::BuildStart { .. } => EventName::BuildStart,
            BuildEvent::BuildFinish(_) => EventName::BuildFinish,
            BuildEvent::BuildLog { .. } => EventName::BuildLog,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

pub type Handler = Arc<dyn Fn(&BuildEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(SubscriptionId, Option<EventName>, Handler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event name
    pub fn on<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&BuildEvent) + Send + Sync + 'static,
    {
        self.register(Some(name), Arc::new(handler))
    }

    /// Register a handler for every event
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BuildEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, name: Option<EventName>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push((id, name, handler));
        }
        id
    }

    pub fn off(&self, id: SubscriptionId) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.retain(|(sub, _, _)| *sub != id);
        }
    }

    pub fn emit(&self, event: &BuildEvent) {
        // clone the matching handlers so a handler may call `on`/`off`
        let targets: Vec<Handler> = match self.handlers.read() {
            Ok(handlers) => handlers
                .iter()
                .filter(|(_, name, _)| name.map_or(true, |n| n == event.name()))
                .map(|(_, _, h)| Arc::clone(h))
                .collect(),
            Err(_) => return,
        };

        for handler in targets {
            handler(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[test]
    fn test_emit_routes_by_name() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.on(EventName::FsChange, move |e| {
            sink.lock().unwrap().push(e.name());
        });

        bus.emit(&BuildEvent::BuildLog {
            message: "hello".into(),
        });
        bus.emit(&BuildEvent::FsChange(ChangeSet {
            files_added: vec![PathBuf::from("/src/a.css")],
            ..Default::default()
        }));

        assert_eq!(*seen.lock().unwrap(), vec![EventName::FsChange]);
    }

    #[test]
    fn test_off_unsubscribes() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = Arc::clone(&count);
        let id = bus.on_any(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&BuildEvent::BuildLog { message: "a".into() });
        bus.off(id);
        bus.emit(&BuildEvent::BuildLog { message: "b".into() });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_fs_change_json() {
        let event = BuildEvent::FsChange(ChangeSet {
            dirs_deleted: vec![PathBuf::from("/src/old")],
            ..Default::default()
        });
        let json: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(json["event"], "fsChange");
        assert_eq!(json["dirsDeleted"][0], "/src/old");
    }
}
