/// Signature scheme name carried in registry requests and canonical messages
pub const ALGORITHM: &str = "bioforestchain";

/// Signed-request header names
pub const HEADER_HOST: &str = "x-dweb-cloud-host";
pub const HEADER_ORIGIN: &str = "x-dweb-cloud-origin";
pub const HEADER_NOISE: &str = "x-dweb-cloud-noise";
pub const HEADER_ALGORITHM: &str = "x-dweb-cloud-algorithm";
pub const HEADER_PUBLIC_KEY: &str = "x-dweb-cloud-public-key";
pub const HEADER_SIGNATURE: &str = "x-dweb-cloud-signature";

/// Gateway HTTP paths
pub const REGISTRY_PATH: &str = "/registry";
pub const QUERY_PATH: &str = "/query";

/// Default separator between a peer label and the gateway hostname
pub const DEFAULT_SEP: &str = "-";

/// Body returned for requests that match neither a peer nor a route
pub const NOT_FOUND_BODY: &str = "Hello Dweb Cloud.";

/// mDNS group and port
pub const MDNS_GROUP_V4: [u8; 4] = [224, 0, 0, 251];
pub const MDNS_PORT: u16 = 5353;

/// TTL (seconds) used for PTR/SRV/TXT service answers
pub const SERVICE_TTL: u32 = 120;

/// TTL (seconds) used for A answers about the gateway's own names
pub const HOST_TTL: u32 = 300;

/// DNS-SD meta-query name listing every advertised service type
pub const META_QUERY_NAME: &str = "_services._dns-sd._udp.local";

/// TXT metadata keys with a defined meaning
pub const TXT_HOSTNAME: &str = "hostname";
pub const TXT_HEALTH_ENDPOINT: &str = "healthEndpoint";
pub const TXT_PEER_ID: &str = "peerId";

/// Health endpoint probed when a service does not announce one
pub const DEFAULT_HEALTH_ENDPOINT: &str = "/health";
