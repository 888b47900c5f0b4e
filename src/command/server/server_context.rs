use std::sync::Arc;

use crate::proxy::DependencyProxy;

/// Per-listener state shared by every connection.
pub struct ServerContext {
    pub proxy: Arc<DependencyProxy>,
}

impl ServerContext {
    pub fn new(proxy: Arc<DependencyProxy>) -> Self {
        Self { proxy }
    }
}
