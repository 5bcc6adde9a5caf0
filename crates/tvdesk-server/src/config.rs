use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use tvdesk_gateway::GatewayConfig;
use tvdesk_gateway::config::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_TYPING_TIMEOUT};

/// Secrets that ship in sample `.env` files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub internal_key: String,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let jwt_secret = required_secret("TVDESK_JWT_SECRET", var("TVDESK_JWT_SECRET"))?;
        let internal_key = required_secret("TVDESK_INTERNAL_KEY", var("TVDESK_INTERNAL_KEY"))?;

        let typing_timeout = match var("TVDESK_TYPING_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(parse("TVDESK_TYPING_TIMEOUT_MS", &raw)?),
            None => DEFAULT_TYPING_TIMEOUT,
        };
        let heartbeat_interval = match var("TVDESK_HEARTBEAT_SECS") {
            Some(raw) => Duration::from_secs(parse("TVDESK_HEARTBEAT_SECS", &raw)?),
            None => DEFAULT_HEARTBEAT_INTERVAL,
        };
        if typing_timeout.is_zero() || heartbeat_interval.is_zero() {
            bail!("TVDESK_TYPING_TIMEOUT_MS and TVDESK_HEARTBEAT_SECS must be positive");
        }

        let trust_handshake = match var("TVDESK_TRUST_HANDSHAKE") {
            Some(raw) => parse_flag("TVDESK_TRUST_HANDSHAKE", &raw)?,
            None => false,
        };

        Ok(Self {
            host: var("TVDESK_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: match var("TVDESK_PORT") {
                Some(raw) => parse("TVDESK_PORT", &raw)?,
                None => 3000,
            },
            db_path: PathBuf::from(var("TVDESK_DB_PATH").unwrap_or_else(|| "tvdesk.db".into())),
            internal_key,
            gateway: GatewayConfig {
                jwt_secret,
                trust_handshake,
                typing_timeout,
                heartbeat_interval,
            },
        })
    }
}

fn required_secret(name: &str, value: Option<String>) -> Result<String> {
    let value = value.with_context(|| format!("{name} must be set"))?;
    if PLACEHOLDER_SECRETS.contains(&value.as_str()) {
        bail!("{name} is still the placeholder value; generate a real secret");
    }
    Ok(value)
}

fn parse<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse()
        .with_context(|| format!("{name} has invalid value '{raw}'"))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{name} has invalid value '{raw}', expected true or false"),
    }
}
