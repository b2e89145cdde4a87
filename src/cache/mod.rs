//! Connection de-duplication cache.
//!
//! Adapters that target the same URL with equivalent options under the same
//! cache name share one cache slot and therefore one physical connection.
//! See [`store::ConnectionCache`].

pub mod options;
pub mod store;

pub use options::{ConnectOptions, DeepComparator, LooseComparator, OptionValue, OptionsComparator};
pub use store::{CacheEntry, CacheEvent, CacheIndex, ConnectionCache};
