//! Lifecycle callback hooks.
//!
//! Consumers observe operation progress; they can never alter the plan.
//! Callbacks are registered explicitly on the engine builder, there is
//! no discovery mechanism.

use std::sync::Arc;

use async_trait::async_trait;

use crate::info::MigrationInfo;

/// Lifecycle notification points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Before a `migrate` run starts.
    BeforeMigrate,
    /// Before each individual migration in a run.
    BeforeEachMigrate,
    /// After each individual migration succeeded.
    AfterEachMigrate,
    /// After an individual migration failed.
    AfterEachMigrateError,
    /// After a `migrate` run completed successfully.
    AfterMigrate,
    /// Before `validate`.
    BeforeValidate,
    /// After `validate`.
    AfterValidate,
    /// Before `repair`.
    BeforeRepair,
    /// After `repair`.
    AfterRepair,
    /// Before `baseline`.
    BeforeBaseline,
    /// After `baseline`.
    AfterBaseline,
}

/// Read-only context passed to callbacks.
pub struct EventContext<'a> {
    /// The migration the event is about, for per-migration events.
    pub migration: Option<&'a MigrationInfo>,
}

impl EventContext<'_> {
    /// Context for run-level events.
    pub fn run() -> Self {
        Self { migration: None }
    }

    /// Context for per-migration events.
    pub fn migration(info: &MigrationInfo) -> EventContext<'_> {
        EventContext {
            migration: Some(info),
        }
    }
}

/// A lifecycle observer.
#[async_trait]
pub trait Callback: Send + Sync {
    /// Whether this callback wants the given event. Defaults to all.
    fn supports(&self, _event: Event) -> bool {
        true
    }

    /// Handle an event. Errors are the callback's own problem; the
    /// engine does not interpret them.
    async fn handle(&self, event: Event, context: &EventContext<'_>);
}

/// The ordered set of registered callbacks.
#[derive(Clone, Default)]
pub struct CallbackSet {
    callbacks: Vec<Arc<dyn Callback>>,
}

impl CallbackSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; it fires after previously registered ones.
    pub fn add(&mut self, callback: Arc<dyn Callback>) {
        self.callbacks.push(callback);
    }

    /// Notify all interested callbacks.
    pub async fn emit(&self, event: Event, context: &EventContext<'_>) {
        for callback in &self.callbacks {
            if callback.supports(event) {
                callback.handle(event, context).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<Event>>,
        only: Option<Event>,
    }

    #[async_trait]
    impl Callback for Recorder {
        fn supports(&self, event: Event) -> bool {
            self.only.is_none_or(|only| only == event)
        }

        async fn handle(&self, event: Event, _context: &EventContext<'_>) {
            self.seen.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_emit_respects_supports() {
        let all = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            only: None,
        });
        let picky = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            only: Some(Event::AfterMigrate),
        });

        let mut set = CallbackSet::new();
        set.add(all.clone());
        set.add(picky.clone());

        set.emit(Event::BeforeMigrate, &EventContext::run()).await;
        set.emit(Event::AfterMigrate, &EventContext::run()).await;

        assert_eq!(
            *all.seen.lock().unwrap(),
            vec![Event::BeforeMigrate, Event::AfterMigrate]
        );
        assert_eq!(*picky.seen.lock().unwrap(), vec![Event::AfterMigrate]);
    }
}
