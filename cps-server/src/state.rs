//! Application state shared across all request handlers.

use cps_core::registry::CommunityDirectory;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    /// Read access to the lifecycle manager's registry.
    pub directory: Arc<dyn CommunityDirectory>,
    /// Base operator configuration, echoed by the summary endpoint.
    pub operator_config: Arc<Value>,
}

impl AppState {
    pub fn new(directory: Arc<dyn CommunityDirectory>, operator_config: Map<String, Value>) -> Self {
        Self {
            directory,
            operator_config: Arc::new(Value::Object(operator_config)),
        }
    }
}
