//! Private tokio runtime for the async server drivers
//!
//! Each server connection owns a current-thread runtime and blocks on it for
//! every round-trip, so callers never see async code.

use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use crate::domain::result::DriverError;
use crate::ports::DriverResult;

/// Upper bound on establishing a server connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn blocking_runtime() -> DriverResult<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| DriverError::connection(format!("failed to start runtime: {}", e)))
}

/// Name of the session-scoped advisory lock for `name`
pub fn lock_name(name: &str) -> String {
    format!("xalanih.{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_blocks_on_futures() {
        let rt = blocking_runtime().unwrap();
        assert_eq!(rt.block_on(async { 40 + 2 }), 42);
    }
}
