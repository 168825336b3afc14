use std::sync::Arc;

use gradeflow_core::{
    Config, EventHandle, EventStore, SanitizedConfig, Scheduler, WorkController, WorkQuery,
    WorkStore,
};

/// Shared application state
pub struct AppState {
    config: Config,
    store: Arc<dyn WorkStore>,
    event_store: Arc<dyn EventStore>,
    events: EventHandle,
    scheduler: Arc<Scheduler>,
    controller: WorkController,
    query: WorkQuery,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn WorkStore>,
        event_store: Arc<dyn EventStore>,
        events: EventHandle,
        scheduler: Arc<Scheduler>,
        controller: WorkController,
    ) -> Self {
        let query = WorkQuery::new(Arc::clone(&store));
        Self {
            config,
            store,
            event_store,
            events,
            scheduler,
            controller,
            query,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn store(&self) -> &Arc<dyn WorkStore> {
        &self.store
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.event_store
    }

    pub fn events(&self) -> &EventHandle {
        &self.events
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn controller(&self) -> &WorkController {
        &self.controller
    }

    pub fn query(&self) -> &WorkQuery {
        &self.query
    }
}
