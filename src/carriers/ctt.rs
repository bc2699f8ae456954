use async_trait::async_trait;

use crate::carriers::adapter::{CarrierAdapter, CarrierDescriptor};
use crate::driver::{DriverError, ScraperDriver};

pub const DESCRIPTOR: CarrierDescriptor = CarrierDescriptor {
    uid: "ctt",
    name: "CTT",
    tracking_url_template: "https://appserver.ctt.pt/CustomerArea/PublicArea_Detail?\
        ObjectCodeInput=${tracking_code}&SearchInput=${tracking_code}",
    accent_color: "#DE0024",
    outdated_period_days: 180,
};

const SCRIPT: &str = include_str!("scripts/ctt.js");
const SELECTORS: &[&str] = &[
    "[data-block=\"TrackTrace.TT_Timeline_New\"] \
     [data-block=\"CustomerArea.AC_TimelineItemCustom\"]",
];

pub struct Ctt {
    tracking_code: String,
}

impl Ctt {
    pub fn new(tracking_code: String) -> Self {
        Self { tracking_code }
    }
}

#[async_trait]
impl CarrierAdapter for Ctt {
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
            .wait_for_title("Detalhe", std::time::Duration::from_secs(5))
            .await?;
        driver
            .wait_for_any(self.readiness_selectors(), self.element_wait_timeout())
            .await
    }
}
