pub const UNDERMOON_BROKER_VERSION: &str = env!("CARGO_PKG_VERSION");
// Bump it whenever the layout of the persisted metadata changes.
pub const UNDERMOON_MEM_BROKER_META_VERSION: &str = "mem-broker-0.2";
