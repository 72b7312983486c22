//! Best-effort IP geolocation.
//!
//! Lookups go to an ip-api.com compatible endpoint and degrade to
//! [`UNKNOWN_LOCATION`] on any failure. Login handling never blocks on a
//! resolver error.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::debug;

pub const UNKNOWN_LOCATION: &str = "Unknown";

const LOOKUP_TIMEOUT_SECONDS: u64 = 3;

#[derive(Debug, Clone)]
pub struct GeoResolver {
    client: reqwest::Client,
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    status: String,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

impl GeoResolver {
    /// An empty base URL disables lookups entirely.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base_url = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };

        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(Duration::from_secs(LOOKUP_TIMEOUT_SECONDS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client, base_url }
    }

    /// Resolve an IP to `City, Country`, or [`UNKNOWN_LOCATION`].
    pub async fn resolve(&self, ip: &str) -> String {
        let Some(base) = &self.base_url else {
            return UNKNOWN_LOCATION.to_string();
        };

        let Ok(parsed) = ip.parse::<IpAddr>() else {
            return UNKNOWN_LOCATION.to_string();
        };
        if parsed.is_loopback() {
            return UNKNOWN_LOCATION.to_string();
        }

        let url = format!("{base}/json/{ip}?fields=status,city,country");
        match self.lookup(&url).await {
            Ok(location) => location,
            Err(error) => {
                debug!(ip, %error, "geoip lookup failed");
                UNKNOWN_LOCATION.to_string()
            }
        }
    }

    async fn lookup(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let body: GeoResponse = response.json().await?;
        if body.status != "success" {
            return Ok(UNKNOWN_LOCATION.to_string());
        }
        Ok(format_location(body.city.as_deref(), body.country.as_deref()))
    }
}

fn format_location(city: Option<&str>, country: Option<&str>) -> String {
    match (non_empty(city), non_empty(country)) {
        (Some(city), Some(country)) => format!("{city}, {country}"),
        (Some(city), None) => city.to_string(),
        (None, Some(country)) => country.to_string(),
        (None, None) => UNKNOWN_LOCATION.to_string(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{format_location, GeoResolver, UNKNOWN_LOCATION};

    #[tokio::test]
    async fn disabled_resolver_returns_unknown() {
        let resolver = GeoResolver::new("");
        assert_eq!(resolver.resolve("203.0.113.7").await, UNKNOWN_LOCATION);
    }

    #[tokio::test]
    async fn unparseable_ip_returns_unknown() {
        let resolver = GeoResolver::new("http://ip-api.invalid");
        assert_eq!(resolver.resolve("Unknown IP").await, UNKNOWN_LOCATION);
        assert_eq!(resolver.resolve("").await, UNKNOWN_LOCATION);
    }

    #[tokio::test]
    async fn loopback_skips_lookup() {
        let resolver = GeoResolver::new("http://ip-api.invalid");
        assert_eq!(resolver.resolve("127.0.0.1").await, UNKNOWN_LOCATION);
        assert_eq!(resolver.resolve("::1").await, UNKNOWN_LOCATION);
    }

    #[test]
    fn format_location_combinations() {
        assert_eq!(
            format_location(Some("Lisbon"), Some("Portugal")),
            "Lisbon, Portugal"
        );
        assert_eq!(format_location(Some("Lisbon"), None), "Lisbon");
        assert_eq!(format_location(None, Some("Portugal")), "Portugal");
        assert_eq!(format_location(None, None), UNKNOWN_LOCATION);
        assert_eq!(format_location(Some("  "), Some("")), UNKNOWN_LOCATION);
    }
}
