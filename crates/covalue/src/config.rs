//! Node configuration.

use covalue_sync::SyncConfig;

/// Configuration for a [`LocalNode`](crate::LocalNode).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeConfig {
    pub sync: SyncConfig,
    /// Leave private transactions encrypted until first read.
    pub skip_private_on_load: bool,
}

impl NodeConfig {
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_skip_private_on_load(mut self, skip: bool) -> Self {
        self.skip_private_on_load = skip;
        self
    }
}
