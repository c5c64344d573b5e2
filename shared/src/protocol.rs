/// mDNS service type advertised by monitored hosts
pub const CIRCOS_SERVICE_TYPE: &str = "_circos._tcp.local.";

/// Control port assumed when an advertisement or registration omits one
pub const DEFAULT_CONTROL_PORT: u16 = 9000;

/// Number of ping timestamps kept per entry
pub const PING_HISTORY_LEN: usize = 10;

/// Remote control endpoints exposed by each monitored host
pub const REMOTE_METADATA_PATH: &str = "/metadata";
pub const REMOTE_STATUS_PATH: &str = "/status";

/// API path prefix
pub const API_PREFIX: &str = "/v1";
