use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{bail, Result};

/// Group-wide and per-peer parameters the monitor needs at construction time.
///
/// `group_size`, `peer_id` and `bus_name` have no sane default and must be
/// supplied by the caller; `bootstrap_id` and `settling_delay` follow the
/// reference defaults.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// `N`, the fixed number of peers in the group.
    pub group_size: usize,
    /// This peer's id, in `[0, group_size)`.
    pub peer_id: usize,
    /// The peer conventionally born holding the token.
    pub bootstrap_id: usize,
    /// How long `set` waits after broadcasting, to let receivers settle.
    pub settling_delay: Duration,
    /// Name of the fanout exchange this group's transport publishes on.
    pub bus_name: String,
}

impl Config {
    pub fn new(group_size: usize, peer_id: usize, bus_name: impl Into<String>) -> Self {
        Self {
            group_size,
            peer_id,
            bootstrap_id: 0,
            settling_delay: Duration::from_millis(100),
            bus_name: bus_name.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            bail!("invalid configuration: group_size must be non-zero");
        }
        if self.peer_id >= self.group_size {
            bail!(
                "invalid configuration: peer_id {} out of range for group_size {}",
                self.peer_id,
                self.group_size
            );
        }
        if self.bootstrap_id >= self.group_size {
            bail!(
                "invalid configuration: bootstrap_id {} out of range for group_size {}",
                self.bootstrap_id,
                self.group_size
            );
        }
        Ok(())
    }
}
