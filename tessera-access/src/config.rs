// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use crate::manifest::DEFAULT_CONTROLLER_TYPE;

/// Default deadline for opening a nested account.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval of the safety re-check retrying unresolved accounts.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct AccessConfig {
    /// Controller type written into and expected from manifests.
    pub controller_type: String,

    /// How long the resolver waits for a nested account to open before it gives up on that
    /// branch until the next update.
    pub open_timeout: Duration,

    /// Interval for re-trying accounts which could not be opened yet. `None` relies on update
    /// events only.
    pub recheck_interval: Option<Duration>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            controller_type: DEFAULT_CONTROLLER_TYPE.to_string(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            recheck_interval: Some(DEFAULT_RECHECK_INTERVAL),
        }
    }
}
