use std::sync::Arc;

use relay_core::EventRouter;
use server_api::ApiContext;
use storage::Storage;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) router: Arc<EventRouter>,
    pub(crate) storage: Storage,
}

impl AppState {
    pub(crate) fn new(storage: Storage, router: EventRouter) -> Self {
        Self {
            api: ApiContext::from_storage(storage.clone()),
            router: Arc::new(router),
            storage,
        }
    }
}
