use std::sync::Arc;

use crate::models::api::ItemIdBounds;
use crate::services::{dispatcher::Dispatcher, status::StatusProjector};
use crate::store::JobStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub dispatcher: Dispatcher,
    pub projector: StatusProjector,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, bounds: ItemIdBounds) -> Self {
        Self {
            dispatcher: Dispatcher::new(store.clone(), bounds),
            projector: StatusProjector::new(store.clone()),
            store,
        }
    }
}
