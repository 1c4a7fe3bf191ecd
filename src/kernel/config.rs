//! Kernel configuration
//!
//! Sizing of the handle arena. Loadable from JSON so a board description
//! can carry it; missing fields fall back to the defaults.

use serde::{Deserialize, Serialize};

/// Handles held inline in the arena before any slab is allocated
pub const DEFAULT_INLINE_HANDLES: usize = 32;

/// Handles per heap slab
pub const DEFAULT_SLAB_SIZE: usize = 16;

/// Configuration for a [`Kernel`](super::Kernel)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Size of the inline handle block
    pub inline_handles: usize,
    /// Handles per additional slab
    pub slab_size: usize,
    /// Upper bound on heap slabs (`None` = grow until allocation fails)
    pub max_slabs: Option<usize>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            inline_handles: DEFAULT_INLINE_HANDLES,
            slab_size: DEFAULT_SLAB_SIZE,
            max_slabs: None,
        }
    }
}

impl KernelConfig {
    pub fn inline_handles(mut self, n: usize) -> Self {
        self.inline_handles = n;
        self
    }

    pub fn slab_size(mut self, n: usize) -> Self {
        self.slab_size = n.max(1);
        self
    }

    pub fn max_slabs(mut self, n: usize) -> Self {
        self.max_slabs = Some(n);
        self
    }

    /// Parse a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut config: KernelConfig = serde_json::from_str(json)?;
        config.slab_size = config.slab_size.max(1);
        Ok(config)
    }
}
