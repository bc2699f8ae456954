//! Carrier Adapter (C3): the per-carrier fetch state machine.
//!
//! A `CarrierAdapter` owns exactly one scrape: navigate, wait for
//! readiness, probe for a classified error, scrape the normalized history.
//! The default [`CarrierAdapter::fetch`] implements the common protocol;
//! carriers override only the hooks their site actually needs (DHL's
//! fallback click, YunExpress's re-navigate-once).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::driver::{DriverError, ScraperDriver};
use crate::error::{OpenParcelError, ScrapingErrorCode};

/// Mirrors spec.md §4.3's NAVIGATED → SCRIPTS_LOADED → PAGE_READY → SCRAPED
/// progression; terminal states are DONE (handled by the caller) or FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Navigated,
    ScriptsLoaded,
    PageReady,
    Scraped,
    Failed,
}

pub struct CarrierDescriptor {
    pub uid: &'static str,
    pub name: &'static str,
    pub tracking_url_template: &'static str,
    pub accent_color: &'static str,
    pub outdated_period_days: i64,
}

pub const UTILS_SCRIPT: &str = include_str!("scripts/utils.js");

/// Normalized scrape output: an array of timestamped events plus whatever
/// carrier metadata the scraping script chose to attach.
#[derive(Debug, Clone)]
pub struct ScrapeResult {
    pub history: Value,
}

#[async_trait]
pub trait CarrierAdapter: Send + Sync {
    fn descriptor(&self) -> &'static CarrierDescriptor;
    fn tracking_code(&self) -> &str;
    fn script_source(&self) -> &'static str;
    fn readiness_selectors(&self) -> &'static [&'static str];
    fn element_wait_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn tracking_url(&self) -> String {
        self.descriptor()
            .tracking_url_template
            .replace("${tracking_code}", self.tracking_code())
    }

    /// Waits for the page to become scrape-ready. Default: a single
    /// `wait_for_any` over `readiness_selectors()`. Carriers with
    /// multi-phase load protocols (DHL, YunExpress) override this.
    async fn wait_ready(&mut self, driver: &mut ScraperDriver) -> Result<usize, DriverError> {
        driver
            .wait_for_any(self.readiness_selectors(), self.element_wait_timeout())
            .await
    }

    /// Runs the carrier script's `errorCheck()` probe. Returns `Ok(None)`
    /// when the page is healthy, `Ok(Some(code))` when the carrier script
    /// classified a failure.
    async fn error_check(&self, driver: &ScraperDriver) -> Result<Option<ScrapingErrorCode>, DriverError> {
        let value = driver.evaluate("errorCheck()").await?;
        if value.is_null() {
            return Ok(None);
        }
        let name = value
            .get("code")
            .and_then(|c| c.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("Unknown");
        Ok(Some(ScrapingErrorCode::from_name(name)))
    }

    async fn scrape(&self, driver: &ScraperDriver) -> Result<ScrapeResult, DriverError> {
        let history = driver.evaluate("scrape()").await?;
        Ok(ScrapeResult { history })
    }

    /// The default fetch protocol. Overridden only when a carrier's site
    /// needs a different navigation/wait dance.
    async fn fetch(&mut self, driver: &mut ScraperDriver) -> Result<ScrapeResult, OpenParcelError> {
        driver
            .open(&self.tracking_url())
            .await
            .map_err(|e| classify_driver_error(e, self.descriptor().uid))?;

        driver
            .inject(UTILS_SCRIPT)
            .await
            .map_err(|e| classify_driver_error(e, self.descriptor().uid))?;
        driver
            .inject(self.script_source())
            .await
            .map_err(|e| classify_driver_error(e, self.descriptor().uid))?;

        self.wait_ready(driver)
            .await
            .map_err(|e| classify_driver_error(e, self.descriptor().uid))?;

        if let Some(code) = self
            .error_check(driver)
            .await
            .map_err(|e| classify_driver_error(e, self.descriptor().uid))?
        {
            return Err(OpenParcelError::ScrapingReturnedError { code, data: None });
        }

        self.scrape(driver)
            .await
            .map_err(|e| classify_driver_error(e, self.descriptor().uid))
    }
}

fn classify_driver_error(err: DriverError, carrier_uid: &str) -> OpenParcelError {
    match err {
        DriverError::ProxyTimeout => OpenParcelError::ScrapingReturnedError {
            code: ScrapingErrorCode::ProxyTimeout,
            data: None,
        },
        other => OpenParcelError::ScrapingBrowserError {
            source: anyhow::anyhow!(other),
            carrier_context: serde_json::json!({ "carrier": carrier_uid }),
        },
    }
}

/// Tracking-code syntax: spec.md §4.3.
pub fn is_tracking_code_valid(code: &str) -> bool {
    !code.is_empty() && code.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Slug syntax: spec.md §4.3 / §6.
pub fn is_slug_valid(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 35
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Two parcel identities are *similar* (spec.md §4.3) when their slugs
/// match, or when their natural keys match.
pub fn is_similar(
    a_slug: Option<&str>,
    a_key: (&str, &str),
    b_slug: Option<&str>,
    b_key: (&str, &str),
) -> bool {
    match (a_slug, b_slug) {
        (Some(a), Some(b)) if a == b => true,
        _ => a_key == b_key,
    }
}

/// `<first 5 alnum of uid>-<first 8 alnum lower of code>-<4-6 hex bytes>`.
pub fn generate_slug(carrier_uid: &str, tracking_code: &str) -> String {
    let uid_part: String = carrier_uid
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(5)
        .collect();
    let code_part: String = tracking_code
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let mut rng = rand::thread_rng();
    let n_bytes = 2 + (rand::Rng::gen_range(&mut rng, 0..=1) as usize);
    let random_bytes: Vec<u8> = (0..n_bytes).map(|_| rand::Rng::gen(&mut rng)).collect();
    format!("{}-{}-{}", uid_part, code_part, hex::encode(random_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_code_validation() {
        assert!(is_tracking_code_valid("RR123456789PT"));
        assert!(is_tracking_code_valid("JD-0123-456789"));
        assert!(!is_tracking_code_valid(""));
        assert!(!is_tracking_code_valid("has space"));
    }

    #[test]
    fn slug_validation_and_generation() {
        let slug = generate_slug("ctt", "RR123456789PT");
        assert!(is_slug_valid(&slug));
        assert!(slug.starts_with("ctt-rr123456"));
        assert!(slug.len() <= 35);
    }

    #[test]
    fn similarity_matches_slug_or_natural_key() {
        assert!(is_similar(
            Some("ctt-abc-1234"),
            ("ctt", "X"),
            Some("ctt-abc-1234"),
            ("ctt", "Y")
        ));
        assert!(is_similar(None, ("dhl", "A"), None, ("dhl", "A")));
        assert!(!is_similar(None, ("dhl", "A"), None, ("dhl", "B")));
    }
}
