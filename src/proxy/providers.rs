//! Proxy-list providers (§4.4, supplemented from `openparcel/proxies.py`):
//! backends that feed freshly-discovered proxies through
//! [`ProxyManager::import`] + [`ProxyManager::test`].
//!
//! The original keys each provider's API key off its class name via
//! `config.proxy_api_key(service_name)`; here that's the `proxy_api_keys`
//! map in [`crate::config::Config`], looked up by [`ProxyProvider::name`].

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{OpenParcelError, Result};
use crate::model::ProxyProtocol;
use crate::proxy::ProxyManager;

/// A proxy as reported by a provider backend, before it has been tested.
#[derive(Debug, Clone)]
pub struct DiscoveredProxy {
    pub addr: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
}

#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// Matches the original's class name, used as the `proxy_api_keys` key.
    fn name(&self) -> &'static str;

    async fn fetch(&self, api_key: Option<&str>) -> Result<Vec<DiscoveredProxy>>;

    /// Fetches and imports every discovered proxy, testing each in turn.
    /// Returns the number that tested active.
    async fn run(&self, manager: &ProxyManager, api_key: Option<&str>) -> Result<usize> {
        let discovered = self.fetch(api_key).await?;
        let mut active = 0;
        for candidate in discovered {
            manager
                .import(&candidate.addr, candidate.port, candidate.protocol)
                .await?;
        }
        for mut proxy in manager.list_active().await? {
            if manager.test(&mut proxy).await? {
                active += 1;
            }
            manager.save(&proxy).await?;
        }
        Ok(active)
    }
}

fn http_error(context: &'static str, status: reqwest::StatusCode) -> OpenParcelError {
    OpenParcelError::ScrapingBrowserError {
        source: anyhow::anyhow!("{context} request failed with HTTP status {status}"),
        carrier_context: Value::Null,
    }
}

/// PubProxy: paginated by protocol, API key optional (free tier is rate
/// limited to a handful of results).
pub struct PubProxy;

#[async_trait]
impl ProxyProvider for PubProxy {
    fn name(&self) -> &'static str {
        "PubProxy"
    }

    async fn fetch(&self, api_key: Option<&str>) -> Result<Vec<DiscoveredProxy>> {
        let client = reqwest::Client::new();
        let mut out = Vec::new();
        for protocol in ["http", "socks4", "socks5"] {
            let mut url = format!(
                "http://pubproxy.com/api/proxy?format=json&last_check=30&type={protocol}"
            );
            url.push_str(if api_key.is_some() { "&limit=20" } else { "&limit=5" });
            if let Some(key) = api_key {
                url.push_str(&format!("&api={key}"));
            }
            let resp = client
                .get(&url)
                .send()
                .await
                .map_err(|e| OpenParcelError::ScrapingBrowserError {
                    source: anyhow::anyhow!(e),
                    carrier_context: Value::Null,
                })?;
            if !resp.status().is_success() {
                return Err(http_error("PubProxy", resp.status()));
            }
            let body: Value = resp.json().await.map_err(|e| OpenParcelError::ScrapingBrowserError {
                source: anyhow::anyhow!(e),
                carrier_context: Value::Null,
            })?;
            for item in body["data"].as_array().into_iter().flatten() {
                if let (Some(addr), Some(port)) = (item["ip"].as_str(), item["port"].as_str()) {
                    if let (Ok(port), Ok(protocol)) =
                        (port.parse::<u16>(), protocol.parse::<ProxyProtocol>())
                    {
                        out.push(DiscoveredProxy {
                            addr: addr.to_string(),
                            port,
                            protocol,
                        });
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Proxifly: a single POST with a JSON options body.
pub struct Proxifly {
    pub quantity: u32,
}

#[async_trait]
impl ProxyProvider for Proxifly {
    fn name(&self) -> &'static str {
        "Proxifly"
    }

    async fn fetch(&self, api_key: Option<&str>) -> Result<Vec<DiscoveredProxy>> {
        let mut options = serde_json::json!({
            "format": "json",
            "protocol": ["http", "socks4", "socks5"],
            "quantity": self.quantity,
            "https": true,
            "speed": 10000,
        });
        if let Some(key) = api_key {
            options["apiKey"] = Value::String(key.to_string());
        }

        let client = reqwest::Client::new();
        let resp = client
            .post("https://api.proxifly.dev/get-proxy")
            .json(&options)
            .send()
            .await
            .map_err(|e| OpenParcelError::ScrapingBrowserError {
                source: anyhow::anyhow!(e),
                carrier_context: Value::Null,
            })?;
        if !resp.status().is_success() {
            return Err(http_error("Proxifly", resp.status()));
        }
        let body: Vec<Value> = resp.json().await.map_err(|e| OpenParcelError::ScrapingBrowserError {
            source: anyhow::anyhow!(e),
            carrier_context: Value::Null,
        })?;
        Ok(body
            .into_iter()
            .filter_map(|item| {
                let addr = item["ip"].as_str()?.to_string();
                let port = item["port"].as_str()?.parse::<u16>().ok()?;
                let protocol = item["protocol"].as_str()?.parse::<ProxyProtocol>().ok()?;
                Some(DiscoveredProxy {
                    addr,
                    port,
                    protocol,
                })
            })
            .collect())
    }
}

/// Open Proxy Space: each item lists multiple protocol indices (1/2/3 →
/// http/socks4/socks5), expanded into one candidate per protocol.
pub struct OpenProxySpace {
    pub quantity: u32,
}

impl OpenProxySpace {
    fn proto_from_index(index: u64) -> Option<ProxyProtocol> {
        match index {
            1 => Some(ProxyProtocol::Http),
            2 => Some(ProxyProtocol::Socks4),
            3 => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }
}

#[async_trait]
impl ProxyProvider for OpenProxySpace {
    fn name(&self) -> &'static str {
        "OpenProxySpace"
    }

    async fn fetch(&self, api_key: Option<&str>) -> Result<Vec<DiscoveredProxy>> {
        let key = api_key.unwrap_or_default();
        let url = format!(
            "https://api.openproxy.space/premium/json?apiKey={key}&amount={}\
             &smart=1&stableAverage=0&status=1&uptime=99",
            self.quantity
        );
        let client = reqwest::Client::new();
        let resp = client
            .get(&url)
            .send()
            .await
            .map_err(|e| OpenParcelError::ScrapingBrowserError {
                source: anyhow::anyhow!(e),
                carrier_context: Value::Null,
            })?;
        if !resp.status().is_success() {
            return Err(http_error("OpenProxySpace", resp.status()));
        }
        let body: Vec<Value> = resp.json().await.map_err(|e| OpenParcelError::ScrapingBrowserError {
            source: anyhow::anyhow!(e),
            carrier_context: Value::Null,
        })?;

        let mut out = Vec::new();
        for item in body {
            let Some(addr) = item["ip"].as_str() else { continue };
            let Some(port) = item["port"].as_u64().map(|p| p as u16) else { continue };
            for index in item["protocols"].as_array().into_iter().flatten() {
                if let Some(protocol) = index.as_u64().and_then(Self::proto_from_index) {
                    out.push(DiscoveredProxy {
                        addr: addr.to_string(),
                        port,
                        protocol,
                    });
                }
            }
        }
        Ok(out)
    }
}

/// ProxyScrape free tier: filters to `alive && ssl`, sorted by timeout.
pub struct ProxyScrapeFree {
    pub timeout_ms: u32,
}

#[async_trait]
impl ProxyProvider for ProxyScrapeFree {
    fn name(&self) -> &'static str {
        "ProxyScrapeFree"
    }

    async fn fetch(&self, _api_key: Option<&str>) -> Result<Vec<DiscoveredProxy>> {
        let url = format!(
            "https://api.proxyscrape.com/v3/free-proxy-list/get?request=displayproxies\
             &protocol=all&timeout={}&proxy_format=protocolipport&format=json",
            self.timeout_ms
        );
        let client = reqwest::Client::new();
        let resp = client
            .get(&url)
            .send()
            .await
            .map_err(|e| OpenParcelError::ScrapingBrowserError {
                source: anyhow::anyhow!(e),
                carrier_context: Value::Null,
            })?;
        if !resp.status().is_success() {
            return Err(http_error("ProxyScrapeFree", resp.status()));
        }
        let body: Value = resp.json().await.map_err(|e| OpenParcelError::ScrapingBrowserError {
            source: anyhow::anyhow!(e),
            carrier_context: Value::Null,
        })?;

        let mut proxies: Vec<&Value> = body["proxies"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|item| item["alive"].as_bool().unwrap_or(false) && item["ssl"].as_bool().unwrap_or(false))
            .collect();
        proxies.sort_by_key(|item| item["average_timeout"].as_u64().unwrap_or(u64::MAX));

        Ok(proxies
            .into_iter()
            .filter_map(|item| {
                let addr = item["ip"].as_str()?.to_string();
                let port = item["port"].as_str()?.parse::<u16>().ok()?;
                let protocol = item["protocol"].as_str()?.parse::<ProxyProtocol>().ok()?;
                Some(DiscoveredProxy {
                    addr,
                    port,
                    protocol,
                })
            })
            .collect())
    }
}

/// WebShare: paginated, `Authorization: Token <key>` header, socks5 only.
pub struct WebShare {
    pub quantity: u32,
    pub page: u32,
}

#[async_trait]
impl ProxyProvider for WebShare {
    fn name(&self) -> &'static str {
        "WebShare"
    }

    async fn fetch(&self, api_key: Option<&str>) -> Result<Vec<DiscoveredProxy>> {
        let key = api_key.unwrap_or_default();
        let url = format!(
            "https://proxy.webshare.io/api/v2/proxy/list/?mode=direct&page={}&page_size={}",
            self.page, self.quantity
        );
        let client = reqwest::Client::new();
        let resp = client
            .get(&url)
            .header("Authorization", format!("Token {key}"))
            .send()
            .await
            .map_err(|e| OpenParcelError::ScrapingBrowserError {
                source: anyhow::anyhow!(e),
                carrier_context: Value::Null,
            })?;
        if !resp.status().is_success() {
            return Err(http_error("WebShare", resp.status()));
        }
        let body: Value = resp.json().await.map_err(|e| OpenParcelError::ScrapingBrowserError {
            source: anyhow::anyhow!(e),
            carrier_context: Value::Null,
        })?;

        Ok(body["results"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|item| {
                let addr = item["proxy_address"].as_str()?.to_string();
                let port = item["port"].as_u64()? as u16;
                Some(DiscoveredProxy {
                    addr,
                    port,
                    protocol: ProxyProtocol::Socks5,
                })
            })
            .collect())
    }
}

/// Resolves a provider by the same name `opm proxy fetch [providers]` takes
/// on the command line (case-insensitive), matching `scripts/proxy.py`.
pub fn by_name(name: &str) -> Option<Box<dyn ProxyProvider>> {
    match name.to_ascii_lowercase().as_str() {
        "pubproxy" => Some(Box::new(PubProxy)),
        "proxifly" => Some(Box::new(Proxifly { quantity: 5 })),
        "openproxyspace" => Some(Box::new(OpenProxySpace { quantity: 5 })),
        "proxyscrapefree" => Some(Box::new(ProxyScrapeFree { timeout_ms: 8000 })),
        "webshare" => Some(Box::new(WebShare {
            quantity: 25,
            page: 1,
        })),
        _ => None,
    }
}

pub const ALL_PROVIDER_NAMES: &[&str] = &[
    "pubproxy",
    "proxifly",
    "openproxyspace",
    "proxyscrapefree",
    "webshare",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_name_resolves_every_documented_provider() {
        for name in ALL_PROVIDER_NAMES {
            assert!(by_name(name).is_some(), "missing provider {name}");
        }
        assert!(by_name("not-a-provider").is_none());
    }

    #[test]
    fn open_proxy_space_protocol_index_mapping() {
        assert_eq!(OpenProxySpace::proto_from_index(1), Some(ProxyProtocol::Http));
        assert_eq!(OpenProxySpace::proto_from_index(2), Some(ProxyProtocol::Socks4));
        assert_eq!(OpenProxySpace::proto_from_index(3), Some(ProxyProtocol::Socks5));
        assert_eq!(OpenProxySpace::proto_from_index(4), None);
    }
}
