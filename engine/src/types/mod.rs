//! Small value types shared across the storage engine.

mod key;
mod timestamp;

pub use key::{KeyError, MAX_KEY_SIZE, check_key, key_cost};
pub use timestamp::{TIMESTAMP_SIZE, Timestamp};
