//! Server configuration, parsed from flags with environment fallbacks.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "rondo-server", about = "Matchmaking and signaling server")]
pub struct ServerConfig {
    /// Shared state store URL (Redis). Required: every instance in the fleet
    /// must point at the same store.
    #[arg(long, env = "REDIS_URL")]
    pub store_url: String,

    /// Address for the HTTP/WebSocket listener.
    #[arg(long, env = "RONDO_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Shared secret for the /admin endpoints. Unset disables them.
    #[arg(long, env = "RONDO_ADMIN_SECRET")]
    pub admin_secret: Option<String>,

    /// Allowed browser origins, comma-separated. Empty = permissive (dev).
    #[arg(long, env = "RONDO_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// STUN server URLs handed to clients via /ice.
    #[arg(
        long,
        env = "RONDO_STUN_URLS",
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    pub stun_urls: Vec<String>,

    /// TURN server URL (optional; requires username and credential).
    #[arg(long, env = "RONDO_TURN_URL")]
    pub turn_url: Option<String>,

    #[arg(long, env = "RONDO_TURN_USERNAME")]
    pub turn_username: Option<String>,

    #[arg(long, env = "RONDO_TURN_CREDENTIAL")]
    pub turn_credential: Option<String>,
}

impl ServerConfig {
    /// A config pointed at nothing, for tests that never touch Redis.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            store_url: "redis://unused".into(),
            listen_addr: "127.0.0.1:0".into(),
            admin_secret: None,
            allowed_origins: Vec::new(),
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            turn_url: None,
            turn_username: None,
            turn_credential: None,
        }
    }
}
