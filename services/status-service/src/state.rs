use std::sync::Arc;

use crate::optimizer::ResultSource;
use crate::store::StatusStore;
use crate::stream::StreamSettings;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StatusStore>,
    pub source: Arc<dyn ResultSource>,
    pub stream: StreamSettings,
}
