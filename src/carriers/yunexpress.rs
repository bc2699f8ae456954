use std::time::Duration;

use async_trait::async_trait;

use crate::carriers::adapter::{CarrierAdapter, CarrierDescriptor};
use crate::driver::{DriverError, ScraperDriver};

pub const DESCRIPTOR: CarrierDescriptor = CarrierDescriptor {
    uid: "yunexpress",
    name: "YunExpress",
    tracking_url_template: "https://www.yuntrack.com/parcelTracking?id=${tracking_code}",
    accent_color: "#04977A",
    outdated_period_days: 180,
};

const SCRIPT: &str = include_str!("scripts/yunexpress.js");
const SELECTORS: &[&str] = &[
    "#timeline",
    ".el-table__empty-block .el-table__empty-text .empty",
    ".el-table .el-table_1_column_3 .el-tooltip.el-tag--info",
];
const EMPTY_SELECTOR_INDEX: usize = 1;

pub struct YunExpress {
    tracking_code: String,
}

impl YunExpress {
    pub fn new(tracking_code: String) -> Self {
        Self { tracking_code }
    }
}

#[async_trait]
impl CarrierAdapter for YunExpress {
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

    /// If the table renders its "empty" placeholder before YunExpress has
    /// finished hydrating, the page needs one re-navigation before the
    /// real selector shows up.
    async fn wait_ready(&mut self, driver: &mut ScraperDriver) -> Result<usize, DriverError> {
        driver
            .wait_for_title("Tracking Results", Duration::from_secs(8))
            .await?;
        let idx = driver.wait_for_any(SELECTORS, Duration::from_secs(10)).await?;
        if idx == EMPTY_SELECTOR_INDEX {
            driver.open(&self.tracking_url()).await?;
            return driver.wait_for_any(SELECTORS, Duration::from_secs(10)).await;
        }
        Ok(idx)
    }
}
