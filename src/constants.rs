pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";

/// Code of objects synthesized when no parent could be reached. Always
/// treated as retryable.
pub const CODE_CONNECT_FAILURE: u16 = 502;

/// Path the stats plugin answers on.
pub const STATS_PATH: &str = "/_astats";
