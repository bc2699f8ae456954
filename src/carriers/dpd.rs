use async_trait::async_trait;

use crate::carriers::adapter::{CarrierAdapter, CarrierDescriptor};
use crate::driver::{DriverError, ScraperDriver};

pub const DESCRIPTOR: CarrierDescriptor = CarrierDescriptor {
    uid: "dpd-pt",
    name: "DPD (PT)",
    tracking_url_template: "https://tracking.dpd.pt/en/getting-parcel/\
        track-trace?reference=${tracking_code}",
    accent_color: "#DC1332",
    outdated_period_days: 180,
};

const SCRIPT: &str = include_str!("scripts/dpd.js");
const SELECTORS: &[&str] = &["#content .table-responsive"];

pub struct Dpd {
    tracking_code: String,
}

impl Dpd {
    pub fn new(tracking_code: String) -> Self {
        Self { tracking_code }
    }
}

#[async_trait]
impl CarrierAdapter for Dpd {
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

    async fn wait_ready(&mut self, driver: &mut ScraperDriver) -> Result<usize, DriverError> {
        driver
            .wait_for_title("Track & Trace", std::time::Duration::from_secs(5))
            .await?;
        driver
            .wait_for_any(self.readiness_selectors(), self.element_wait_timeout())
            .await
    }
}
