use std::time::Duration;

use async_trait::async_trait;

use crate::carriers::adapter::{CarrierAdapter, CarrierDescriptor};
use crate::driver::{DriverError, ScraperDriver};

pub const DESCRIPTOR: CarrierDescriptor = CarrierDescriptor {
    uid: "dhl",
    name: "DHL",
    tracking_url_template: "https://www.dhl.com/us-en/home/tracking.html?\
        tracking-id=${tracking_code}&submit=1",
    accent_color: "#FFCC00",
    outdated_period_days: 90,
};

const SCRIPT: &str = include_str!("scripts/dhl.js");
const SELECTORS: &[&str] = &[
    ".c-tracking-result--checkpoint",
    ".c-tracking-result--status-shipment-undefined",
];
const TRACK_BUTTON: &str = ".c-voc-tracking-bar--button.js--tracking--input-submit";

pub struct Dhl {
    tracking_code: String,
}

impl Dhl {
    pub fn new(tracking_code: String) -> Self {
        Self { tracking_code }
    }
}

#[async_trait]
impl CarrierAdapter for Dhl {
    fn descriptor(&self) -> &'static CarrierDescriptor {
        &DESCRIPTOR
    }

    fn tracking_code(&self) -> &str {
        &self.tracking_code
    }

    fn script_source(&self) -> &'static str {
        SCRIPT
    }

    fn readiness_selectors(&self) -> &'static [&'static str] {
        SELECTORS
    }

    fn element_wait_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// DHL's anti-scraping measures gate the timeline behind a "Track"
    /// button on first paint. If the first wait times out, click it and
    /// wait again with a shorter budget before giving up for real.
    async fn wait_ready(&mut self, driver: &mut ScraperDriver) -> Result<usize, DriverError> {
        match driver.wait_for_any(SELECTORS, Duration::from_secs(10)).await {
            Ok(idx) => Ok(idx),
            Err(DriverError::PageWaitTimeout) => {
                driver.click(TRACK_BUTTON).await?;
                driver.wait_for_any(SELECTORS, Duration::from_secs(8)).await
            }
            Err(other) => Err(other),
        }
    }
}
