use std::time::Duration;

/// Typing indicators clear themselves after this long without a refresh.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(1200);

/// Server sends a Ping this often; two consecutive missed Pongs drop the connection.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// HS256 secret shared with the session issuer. Empty disables token auth.
    pub jwt_secret: String,
    /// Accept raw `userId`/`role`/`name` handshake fields without a token.
    /// Only meant for local development behind a trusted proxy.
    pub trust_handshake: bool,
    pub typing_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            trust_handshake: false,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}
