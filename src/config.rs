use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Standard HTTP port
pub const HTTP_PORT: u16 = 5000;

/// Bind address for the HTTP surface — 0.0.0.0 so peers and game clients can reach it
pub const HTTP_BIND_ADDRESS: &str = "0.0.0.0";

/// World units per grid cell. A placement at world position P lands in cell
/// floor(P / 500) on each axis. This divisor is part of the client contract.
pub const WORLD_CELL_SIZE: f64 = 500.0;

/// Maximum bytes per asset-bundle chunk row
pub const BUNDLE_CHUNK_BYTES: usize = 400_000;

/// Maximum characters per serialized-cell chunk row
pub const CELL_CHUNK_CHARS: usize = 100_000;

/// Startup rehydration scans the cube [-HYDRATE_RADIUS, HYDRATE_RADIUS]^3
pub const HYDRATE_RADIUS: i64 = 5;

/// Orphaned-bundle sweep interval (3 days)
pub const SWEEP_INTERVAL_SECS: u64 = 3 * 24 * 60 * 60;

/// Per-peer HTTP timeout during reconciliation
pub const PEER_TIMEOUT_SECS: u64 = 10;

/// Trust oracle endpoint. The application id is baked into the request URL.
pub const ORACLE_AUTH_URL: &str =
    "https://partner.steam-api.com/ISteamUserAuth/AuthenticateUserTicket/v1/";
pub const ORACLE_APP_ID: &str = "1522520";

/// Data directory name
pub const DATA_DIR: &str = ".blockgrid";

pub struct NetworkConfig {
    pub http_port: u16,
    pub data_dir: String,
}

impl NetworkConfig {
    pub fn standalone() -> Self {
        let home = resolve_home_dir();
        let mut config = NetworkConfig {
            http_port: HTTP_PORT,
            data_dir: format!("{}/{}", home, DATA_DIR),
        };

        // Allow environment overrides for multi-node testing
        if let Ok(p) = std::env::var("BLOCKGRID_HTTP_PORT")
            && let Ok(port) = p.parse()
        {
            config.http_port = port;
        }
        if let Ok(d) = std::env::var("BLOCKGRID_DATA_DIR") {
            config.data_dir = d;
        }
        config
    }
}

/// Startup secrets: store credentials, the trust-oracle web API key, and the
/// newline-delimited moderator-id allowlist. Each lives in its own file in
/// the data directory.
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub web_api_key: String,
    pub moderators: HashSet<String>,
}

impl Credentials {
    pub fn load(data_dir: &Path) -> Self {
        let read = |name: &str| -> Option<String> {
            std::fs::read_to_string(data_dir.join(name))
                .ok()
                .map(|s| s.trim().to_string())
        };

        let moderators = match std::fs::read_to_string(data_dir.join("moderators")) {
            Ok(s) => s
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            Err(_) => HashSet::new(),
        };

        Credentials {
            access_key: read("accesskey").unwrap_or_default(),
            secret_key: read("secretkey").unwrap_or_default(),
            web_api_key: read("webapikey").unwrap_or_default(),
            moderators,
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    PathBuf::from(resolve_home_dir()).join(DATA_DIR)
}

fn resolve_home_dir() -> String {
    if let Ok(home) = std::env::var("HOME") {
        if !home.trim().is_empty() {
            return home;
        }
    }
    #[cfg(windows)]
    {
        if let Ok(home) = std::env::var("USERPROFILE") {
            if !home.trim().is_empty() {
                return home;
            }
        }
    }
    ".".to_string()
}
