//! Best-effort geolocation enrichment for reporter static data.
//!
//! Lookup failures are the caller's to swallow; nothing here may ever
//! block report processing.

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct GeoInfo {
    pub country: Option<String>,
    #[serde(rename = "countryCode")]
    pub country_code: Option<String>,
}

pub struct HttpGeoLookup {
    client: reqwest::Client,
}

impl HttpGeoLookup {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Loopback and private addresses have no meaningful geolocation;
    /// skip the round-trip entirely.
    pub fn is_lookupable(ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_private() && !v4.is_link_local(),
            IpAddr::V6(v6) => !v6.is_loopback(),
        }
    }

    pub async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, reqwest::Error> {
        let url = format!("http://ip-api.com/json/{ip}?fields=country,countryCode");
        self.client.get(url).send().await?.error_for_status()?.json().await
    }
}

impl Default for HttpGeoLookup {
    fn default() -> Self {
        Self::new()
    }
}
