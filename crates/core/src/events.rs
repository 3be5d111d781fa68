//! Before/after events published around structural mutations.
//!
//! Before-events are cancellable: every registered before-handler sees
//! the event and any `false` verdict aborts the operation before it
//! touches the store or the cache. After-events are broadcast to bus
//! subscribers once the mutation has persisted.

use bus::{Bus, BusReader};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum PermissionEvent {
    PlayerJoinGroup {
        player_uuid: String,
        group_name: String,
        expiry_timestamp: Option<i64>,
    },
    PlayerLeaveGroup {
        player_uuid: String,
        group_name: String,
    },
    GroupPermissionChange {
        group_name: String,
        rule: String,
        added: bool,
    },
}

type BeforeHandler = Box<dyn Fn(&PermissionEvent) -> bool + Send + Sync>;

pub struct PermissionEventBus {
    before_handlers: Mutex<Vec<BeforeHandler>>,
    after_bus: Mutex<Bus<PermissionEvent>>,
}

impl Default for PermissionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionEventBus {
    pub fn new() -> Self {
        PermissionEventBus {
            before_handlers: Mutex::new(Vec::new()),
            after_bus: Mutex::new(Bus::new(64)),
        }
    }

    /// Register a cancellation hook. Returning `false` from the hook
    /// aborts the mutation the event describes.
    pub fn on_before(
        &self,
        handler: impl Fn(&PermissionEvent) -> bool + Send + Sync + 'static,
    ) {
        self.before_handlers.lock().unwrap().push(Box::new(handler));
    }

    /// Subscribe to after-events. Slow readers do not block mutations;
    /// a full subscriber buffer drops the event for that reader.
    pub fn subscribe(&self) -> BusReader<PermissionEvent> {
        self.after_bus.lock().unwrap().add_rx()
    }

    /// `false` when any handler cancelled the operation.
    pub fn publish_before(&self, event: &PermissionEvent) -> bool {
        let handlers = self.before_handlers.lock().unwrap();
        for handler in handlers.iter() {
            if !handler(event) {
                debug!("event cancelled by before-handler: {event:?}");
                return false;
            }
        }
        true
    }

    pub fn publish_after(&self, event: PermissionEvent) {
        let mut bus = self.after_bus.lock().unwrap();
        if bus.try_broadcast(event).is_err() {
            debug!("after-event dropped: subscriber buffer full");
        }
    }
}
