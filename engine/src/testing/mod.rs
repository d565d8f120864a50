//! Shared test fixtures.

use std::sync::{Arc, Once};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::EngineConfig;
use crate::storage::cache::{Access, BufferCache, Transaction};

static TRACING: Once = Once::new();

/// Install a `RUST_LOG`-driven subscriber writing to the test output.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

/// Small-reference configuration so blob trees grow deep quickly.
#[must_use]
pub const fn small_ref_config() -> EngineConfig {
    EngineConfig {
        block_size: 4096,
        max_ref_len: 64,
        blob_fanout: 4,
    }
}

/// A fresh cache and a write transaction on it.
pub fn new_write_txn(block_size: usize) -> (Arc<BufferCache>, Transaction) {
    init_tracing();
    let cache = BufferCache::new(block_size);
    let txn = cache.begin(Access::Write);
    (cache, txn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures() {
        init_tracing();
        init_tracing();
        assert!(small_ref_config().validate().is_ok());
        let (cache, txn) = new_write_txn(512);
        assert_eq!(txn.block_size(), 512);
        assert_eq!(cache.block_count(), 0);
    }
}
