use serde::{Deserialize, Serialize};

use crate::models::{NotificationKind, NotificationScope, Role};

// -- JWT Claims --

/// Session claims issued by the web application and accepted by the socket
/// handshake. Canonical definition lives here so issuer and verifier agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: usize,
}

// -- Handshake --

/// Query-string metadata supplied when opening the socket.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub token: Option<String>,
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub name: Option<String>,
}

// -- Notifications --

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchNotificationRequest {
    pub kind: NotificationKind,
    pub scope: NotificationScope,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct DispatchAccepted {
    pub accepted: bool,
}

// -- Health --

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
}
