//! Proxy Manager (C4): storage, lifecycle and health testing of outbound
//! proxies used to keep carrier scraping from being trivially blocked.

pub mod config;
pub mod providers;

use std::time::{Duration, Instant};

use rand::Rng;

use crate::carriers;
use crate::driver::{DriverSettings, ScraperDriver};
use crate::error::{OpenParcelError, Result, ScrapingErrorCode};
use crate::model::{Proxy, ProxyProtocol, ValidCarrier};
use crate::store::ParcelStore;

pub struct ProxyManager {
    store: ParcelStore,
}

impl ProxyManager {
    pub fn new(store: ParcelStore) -> Self {
        Self { store }
    }

    pub async fn list_active(&self) -> Result<Vec<Proxy>> {
        self.store.list_active_proxies().await
    }

    pub async fn import(&self, addr: &str, port: u16, protocol: ProxyProtocol) -> Result<()> {
        self.store.import_proxy(addr, port, protocol).await
    }

    pub async fn save(&self, proxy: &Proxy) -> Result<()> {
        self.store.save_proxy(proxy).await
    }

    /// Re-tests every active proxy, demoting those that no longer reach any
    /// registered carrier.
    pub async fn refresh_all(&self) -> Result<()> {
        let proxies = self.list_active().await?;
        for mut proxy in proxies {
            self.test(&mut proxy).await?;
            self.save(&proxy).await?;
        }
        Ok(())
    }

    /// Exercises `proxy` against every registered carrier with a random
    /// tracking code (spec.md §4.4), classifying the outcome:
    /// - `ParcelNotFound`/`InvalidTrackingCode` → the proxy reached the
    ///   carrier; record timing.
    /// - `RateLimiting`/`Blocked` → carrier reachable but rejecting; not
    ///   recorded, not fatal.
    /// - `ProxyTimeout` or an unexpected driver error → skip this carrier.
    ///
    /// `active` is set to whether any carrier was reached at all, and
    /// `speed_ms` is the mean timing across the successful carriers.
    pub async fn test(&self, proxy: &mut Proxy) -> Result<bool> {
        let mut valid_carriers = Vec::new();
        let proxy_config = config::ProxyConfig {
            scheme: proxy.protocol.as_str().to_string(),
            host: proxy.addr.clone(),
            port: proxy.port,
            username: None,
            password: None,
        };

        for entry in carriers::list() {
            let tracking_code = random_probe_tracking_code();
            let started = Instant::now();

            let outcome = probe_carrier(entry, &tracking_code, &proxy_config).await;
            match outcome {
                Ok(()) => {
                    // A successful scrape against a random code should
                    // never happen; treat it like ParcelNotFound would.
                    valid_carriers.push(ValidCarrier {
                        carrier_id: entry.descriptor.uid.to_string(),
                        timing_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(OpenParcelError::ScrapingReturnedError { code, .. }) => match code {
                    ScrapingErrorCode::ParcelNotFound | ScrapingErrorCode::InvalidTrackingCode => {
                        valid_carriers.push(ValidCarrier {
                            carrier_id: entry.descriptor.uid.to_string(),
                            timing_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    ScrapingErrorCode::RateLimiting | ScrapingErrorCode::Blocked => {}
                    ScrapingErrorCode::ProxyTimeout | ScrapingErrorCode::Other(_) => {}
                },
                Err(_) => {}
            }
        }

        proxy.active = !valid_carriers.is_empty();
        proxy.speed_ms = if valid_carriers.is_empty() {
            None
        } else {
            Some(valid_carriers.iter().map(|c| c.timing_ms).sum::<u64>() / valid_carriers.len() as u64)
        };
        proxy.valid_carriers = valid_carriers;
        Ok(proxy.active)
    }
}

async fn probe_carrier(
    entry: &carriers::CarrierEntry,
    tracking_code: &str,
    proxy: &config::ProxyConfig,
) -> Result<()> {
    let mut adapter = (entry.make)(tracking_code.to_string());
    let mut driver = ScraperDriver::launch(DriverSettings::default(), Some(proxy))
        .await
        .map_err(|e| OpenParcelError::ScrapingBrowserError {
            source: anyhow::anyhow!(e.to_string()),
            carrier_context: serde_json::json!({"carrier": entry.descriptor.uid}),
        })?;
    let result = adapter.fetch(&mut driver).await;
    driver.close().await;
    result.map(|_| ())
}

/// 2 letters, 9 digits, 2 letters — a code no real carrier will recognize,
/// used purely to classify whether a proxy can reach the carrier at all.
fn random_probe_tracking_code() -> String {
    let mut rng = rand::thread_rng();
    let letter = |rng: &mut rand::rngs::ThreadRng| -> char {
        (b'A' + rng.gen_range(0..26)) as char
    };
    let mut code = String::with_capacity(13);
    code.push(letter(&mut rng));
    code.push(letter(&mut rng));
    for _ in 0..9 {
        code.push(char::from_digit(rng.gen_range(0..10), 10).unwrap());
    }
    code.push(letter(&mut rng));
    code.push(letter(&mut rng));
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_tracking_codes_match_the_documented_shape() {
        for _ in 0..20 {
            let code = random_probe_tracking_code();
            assert_eq!(code.len(), 13);
            assert!(code.chars().take(2).all(|c| c.is_ascii_uppercase()));
            assert!(code.chars().skip(2).take(9).all(|c| c.is_ascii_digit()));
            assert!(code.chars().skip(11).all(|c| c.is_ascii_uppercase()));
        }
    }
}
