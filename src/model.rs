//! Data model (spec.md §3): plain value types shared by the store, cache,
//! pool and web layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Parcel {
    pub id: i64,
    pub carrier_id: String,
    pub tracking_code: String,
    pub created: DateTime<Utc>,
    pub slug: String,
}

impl Parcel {
    pub fn is_outdated(&self, outdated_period_days: i64, now: DateTime<Utc>) -> bool {
        (now - self.created).num_days() > outdated_period_days
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistorySnapshot {
    pub id: i64,
    pub parcel_id: i64,
    pub retrieved: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserParcelLink {
    pub user_id: i64,
    pub parcel_id: i64,
    pub name: String,
    pub archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
        }
    }
}

impl std::str::FromStr for ProxyProtocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Self::Http),
            "socks4" => Ok(Self::Socks4),
            "socks5" => Ok(Self::Socks5),
            _ => Err(()),
        }
    }
}

/// A carrier this proxy successfully reached during its last test, and how
/// long that round-trip took.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidCarrier {
    pub carrier_id: String,
    pub timing_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: i64,
    pub addr: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub country: Option<String>,
    pub speed_ms: Option<u64>,
    pub active: bool,
    pub valid_carriers: Vec<ValidCarrier>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub salt: String,
    pub access_level: i64,
}

impl User {
    pub fn is_superuser(&self) -> bool {
        self.access_level >= 100
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuthToken {
    pub token: String,
    pub user_id: i64,
    pub description: String,
    pub active: bool,
}
