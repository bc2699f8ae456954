//! Structured, titled, loggable error taxonomy (C8).
//!
//! Every error that can reach an HTTP boundary implements [`title`],
//! [`message`] and [`status_code`], and renders as `{title, message, reqid?}`
//! JSON via [`IntoResponse`]. This is the Rust rendition of the original
//! `openparcel.exceptions.TitledException` hierarchy.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

/// The five carrier-classified scraping outcomes, plus an escape hatch for
/// whatever a carrier's `errorCheck()` reports that we don't recognize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapingErrorCode {
    ParcelNotFound,
    InvalidTrackingCode,
    RateLimiting,
    Blocked,
    ProxyTimeout,
    Other(String),
}

impl ScrapingErrorCode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "ParcelNotFound" => Self::ParcelNotFound,
            "InvalidTrackingCode" => Self::InvalidTrackingCode,
            "RateLimiting" => Self::RateLimiting,
            "Blocked" => Self::Blocked,
            "ProxyTimeout" => Self::ProxyTimeout,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::ParcelNotFound => "ParcelNotFound",
            Self::InvalidTrackingCode => "InvalidTrackingCode",
            Self::RateLimiting => "RateLimiting",
            Self::Blocked => "Blocked",
            Self::ProxyTimeout => "ProxyTimeout",
            Self::Other(name) => name,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenParcelError {
    #[error("missing parameter: {parameter}")]
    NotEnoughParameters { parameter: &'static str, status_code: u16 },

    #[error("authentication failed")]
    AuthenticationFailed { status_code: u16 },

    #[error("invalid tracking code")]
    TrackingCodeInvalid,

    #[error("invalid slug")]
    SlugInvalid,

    #[error("carrier not found")]
    CarrierNotFound,

    #[error("parcel not found")]
    ParcelNotFound,

    #[error("scraping returned {code:?}")]
    ScrapingReturnedError {
        code: ScrapingErrorCode,
        data: Option<Value>,
    },

    #[error("scraping browser error: {source}")]
    ScrapingBrowserError {
        source: anyhow::Error,
        carrier_context: Value,
    },

    #[error("server overwhelmed")]
    ServerOverwhelmed,

    #[error("database error")]
    DatabaseError(#[from] sqlx::Error),

    #[error("scraping script not found: {0}")]
    ScrapingJsNotFound(String),

    #[error("user already logged in or exists")]
    Conflict { title: &'static str, message: String },
}

#[derive(Serialize)]
struct ErrorBody {
    title: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reqid: Option<String>,
}

impl OpenParcelError {
    pub fn title(&self) -> String {
        match self {
            Self::NotEnoughParameters { .. } => "Missing parameter".to_string(),
            Self::AuthenticationFailed { .. } => "Authentication failed".to_string(),
            Self::TrackingCodeInvalid => "Invalid tracking code".to_string(),
            Self::SlugInvalid => "Invalid parcel slug".to_string(),
            Self::CarrierNotFound => "Invalid carrier ID".to_string(),
            Self::ParcelNotFound => "Parcel not found".to_string(),
            Self::ScrapingReturnedError { code, .. } => match code {
                ScrapingErrorCode::ParcelNotFound => "Parcel not found".to_string(),
                ScrapingErrorCode::InvalidTrackingCode => "Invalid tracking code".to_string(),
                ScrapingErrorCode::RateLimiting => "Too many requests".to_string(),
                ScrapingErrorCode::Blocked => "Blocked by carrier".to_string(),
                ScrapingErrorCode::ProxyTimeout => "Proxy server timeout".to_string(),
                ScrapingErrorCode::Other(_) => "Unknown error".to_string(),
            },
            Self::ScrapingBrowserError { .. } => "Scraping error".to_string(),
            Self::ServerOverwhelmed => "Service overwhelmed".to_string(),
            Self::DatabaseError(_) => "Server database error".to_string(),
            Self::ScrapingJsNotFound(_) => "Scraping script not found".to_string(),
            Self::Conflict { title, .. } => title.to_string(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NotEnoughParameters { parameter, .. } => {
                format!("A value for '{parameter}' must be supplied.")
            }
            Self::AuthenticationFailed { .. } => {
                "Credentials didn't match any users in our database.".to_string()
            }
            Self::TrackingCodeInvalid => {
                "The provided tracking code contains invalid characters.".to_string()
            }
            Self::SlugInvalid => "The provided parcel slug is not well-formed.".to_string(),
            Self::CarrierNotFound => {
                "Carrier ID doesn't match any of the available carriers.".to_string()
            }
            Self::ParcelNotFound => "No parcel matched the given identity.".to_string(),
            Self::ScrapingReturnedError { code, .. } => match code {
                ScrapingErrorCode::ParcelNotFound => {
                    "The provided tracking code did not match any parcels in the \
                     carrier's system."
                        .to_string()
                }
                ScrapingErrorCode::InvalidTrackingCode => {
                    "The provided tracking code is invalid for this carrier.".to_string()
                }
                ScrapingErrorCode::RateLimiting => {
                    "We have reached the request limit of this carrier.".to_string()
                }
                ScrapingErrorCode::Blocked => {
                    "We have been blocked by the carrier for trying to scrape their \
                     website. Try again later after the system's proxy list has been \
                     refreshed."
                        .to_string()
                }
                ScrapingErrorCode::ProxyTimeout => {
                    "The proxy server used to perform the request to the carrier took \
                     too long to respond. Try again later."
                        .to_string()
                }
                ScrapingErrorCode::Other(_) => {
                    "An unknown, but expected, error occurred while scraping the \
                     website."
                        .to_string()
                }
            },
            Self::ScrapingBrowserError { .. } => {
                "An error occurred while trying to fetch the tracking history from \
                 the carrier's website."
                    .to_string()
            }
            Self::ServerOverwhelmed => {
                "The service is currently experiencing a lot of traffic or is \
                 undergoing maintenance. Please try again later."
                    .to_string()
            }
            Self::DatabaseError(_) => {
                "Sorry but a server error related to our database occurred. We have \
                 been notified and are currently working on a solution."
                    .to_string()
            }
            Self::ScrapingJsNotFound(filename) => {
                format!("Missing scraping script: {filename}")
            }
            Self::Conflict { message, .. } => message.clone(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        let code = match self {
            Self::NotEnoughParameters { status_code, .. } => *status_code,
            Self::AuthenticationFailed { status_code, .. } => *status_code,
            Self::TrackingCodeInvalid | Self::SlugInvalid | Self::CarrierNotFound => 422,
            Self::ParcelNotFound => 404,
            Self::ScrapingReturnedError { code, .. } => match code {
                ScrapingErrorCode::Other(_) => 500,
                _ => 422,
            },
            Self::ScrapingBrowserError { .. } => 500,
            Self::ServerOverwhelmed => 503,
            Self::DatabaseError(_) => 500,
            Self::ScrapingJsNotFound(_) => 500,
            Self::Conflict { .. } => 422,
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Logs this error at the severity its kind warrants. `ParcelNotFound`
    /// and `InvalidTrackingCode` are expected outcomes and are never logged,
    /// matching the scraping pool's "don't log the expected" rule.
    pub fn log(&self, req_id: &str) {
        match self {
            Self::ScrapingReturnedError { code, .. }
                if matches!(
                    code,
                    ScrapingErrorCode::ParcelNotFound | ScrapingErrorCode::InvalidTrackingCode
                ) => {}
            Self::ScrapingBrowserError {
                source,
                carrier_context,
            } => {
                tracing::error!(
                    req_id,
                    action = "scrape_error",
                    context = %carrier_context,
                    error = %source,
                    "scraping browser crashed"
                );
            }
            Self::DatabaseError(err) => {
                tracing::error!(req_id, action = "database_error", error = %err, "database error");
            }
            Self::ServerOverwhelmed => {
                tracing::warn!(req_id, action = "server_overwhelmed", "pool admission timed out");
            }
            other => {
                tracing::warn!(req_id, action = "request_error", error = %other, "request failed");
            }
        }
    }

    pub fn not_enough_parameters(parameter: &'static str, status_code: u16) -> Self {
        Self::NotEnoughParameters {
            parameter,
            status_code,
        }
    }

    /// Produces an equivalent error for a coalesced waiter (scraping pool
    /// §4.5). Several variants wrap values (`anyhow::Error`, `sqlx::Error`)
    /// that aren't `Clone`, so this re-derives an equivalent error from
    /// their rendered message instead of cloning the original.
    pub fn for_waiter(&self) -> OpenParcelError {
        match self {
            Self::NotEnoughParameters {
                parameter,
                status_code,
            } => Self::NotEnoughParameters {
                parameter,
                status_code: *status_code,
            },
            Self::AuthenticationFailed { status_code } => Self::AuthenticationFailed {
                status_code: *status_code,
            },
            Self::TrackingCodeInvalid => Self::TrackingCodeInvalid,
            Self::SlugInvalid => Self::SlugInvalid,
            Self::CarrierNotFound => Self::CarrierNotFound,
            Self::ParcelNotFound => Self::ParcelNotFound,
            Self::ScrapingReturnedError { code, data } => Self::ScrapingReturnedError {
                code: code.clone(),
                data: data.clone(),
            },
            Self::ScrapingBrowserError {
                source,
                carrier_context,
            } => Self::ScrapingBrowserError {
                source: anyhow::anyhow!(source.to_string()),
                carrier_context: carrier_context.clone(),
            },
            Self::ServerOverwhelmed => Self::ServerOverwhelmed,
            Self::DatabaseError(err) => Self::ScrapingBrowserError {
                source: anyhow::anyhow!(err.to_string()),
                carrier_context: Value::Null,
            },
            Self::ScrapingJsNotFound(filename) => Self::ScrapingJsNotFound(filename.clone()),
            Self::Conflict { title, message } => Self::Conflict {
                title,
                message: message.clone(),
            },
        }
    }
}

/// Per-request identity for logging and error reporting, threaded explicitly
/// through handlers instead of living in request-scoped globals.
#[derive(Clone, Debug, Default)]
pub struct ReqId(pub String);

impl OpenParcelError {
    pub fn into_response_with(self, req_id: Option<&ReqId>) -> Response {
        if let Some(id) = req_id {
            self.log(&id.0);
        }
        let status = self.status_code();
        let body = ErrorBody {
            title: self.title(),
            message: self.message(),
            reqid: req_id.map(|r| r.0.clone()),
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for OpenParcelError {
    fn into_response(self) -> Response {
        self.into_response_with(None)
    }
}

pub type Result<T> = std::result::Result<T, OpenParcelError>;
