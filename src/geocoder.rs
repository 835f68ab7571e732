use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    /// Stored for stores that could not be geocoded; never a real location.
    pub const UNRESOLVED: Coordinates = Coordinates { lat: 0.0, lon: 0.0 };

    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_resolved(&self) -> bool {
        !(self.lat == 0.0 && self.lon == 0.0)
    }
}

/// A single query against the external lookup service. `Ok(None)` means no match.
#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn search(&self, query: &str) -> AppResult<Option<Coordinates>>;
}

/// The full query, then the first word of the store name with the same address.
pub fn query_variants(name: &str, address: &str) -> Vec<String> {
    let name = name.trim();
    let address = address.trim();
    let mut variants = vec![format!("{name}, {address}")];
    if let Some(token) = name.split_whitespace().next() {
        let degraded = format!("{token}, {address}");
        if degraded != variants[0] {
            variants.push(degraded);
        }
    }
    variants
}

#[derive(Clone)]
pub struct Geocoder {
    inner: Arc<dyn GeocodeLookup>,
    rate_limiter: Arc<RateLimiter>,
    concurrency: usize,
}

impl Geocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = HttpGeocoder::new(config)?;
        Ok(Self::from_lookup(
            Arc::new(http),
            config.geocoder_rate_limit_qps,
            config.geocoder_concurrency,
        ))
    }

    pub fn from_lookup(lookup: Arc<dyn GeocodeLookup>, qps: u32, concurrency: usize) -> Self {
        Self {
            inner: lookup,
            rate_limiter: Arc::new(RateLimiter::new(qps)),
            concurrency: concurrency.max(1),
        }
    }

    /// Resolves one store; lookup failures degrade to the next variant and finally `None`.
    pub async fn locate(&self, name: &str, address: &str) -> Option<Coordinates> {
        for (attempt, query) in query_variants(name, address).iter().enumerate() {
            self.rate_limiter.wait().await;
            match self.inner.search(query).await {
                Ok(Some(coordinates)) => {
                    debug!(
                        target: "geocoder",
                        query = query.as_str(),
                        attempt,
                        lat = coordinates.lat,
                        lon = coordinates.lon,
                        "store located"
                    );
                    return Some(coordinates);
                }
                Ok(None) => {
                    debug!(target: "geocoder", query = query.as_str(), attempt, "no match");
                }
                Err(err) => {
                    warn!(
                        target: "geocoder",
                        ?err,
                        query = query.as_str(),
                        attempt,
                        "geocoder request failed; treating as no match"
                    );
                }
            }
        }
        None
    }

    /// Looks up many stores with at most `concurrency` requests in flight.
    pub async fn locate_many(
        &self,
        stores: Vec<(String, String)>,
    ) -> HashMap<(String, String), Option<Coordinates>> {
        stream::iter(stores)
            .map(|(name, address)| async move {
                let found = self.locate(&name, &address).await;
                ((name, address), found)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

struct RateLimiter {
    min_interval_ms: AtomicU64,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    /// `0` disables throttling.
    fn interval_ms(qps: u32) -> u64 {
        if qps == 0 {
            return 0;
        }
        let interval_ms = (1000_f64 / qps as f64).ceil() as u64;
        interval_ms.max(50)
    }

    fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst))
    }

    async fn wait(&self) {
        let interval = self.interval_duration();
        if interval.is_zero() {
            return;
        }
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

struct HttpGeocoder {
    http: reqwest::Client,
    search_url: String,
    country_codes: String,
    api_key: Option<SecretString>,
}

impl HttpGeocoder {
    fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.geocoder_timeout_secs.max(1)))
            .user_agent("price-list-import/0.1.0")
            .build()?;
        Ok(Self {
            http,
            search_url: format!("{}/search", config.geocoder_base_url.trim_end_matches('/')),
            country_codes: config.geocoder_country_codes.clone(),
            api_key: config.geocoder_api_key.clone(),
        })
    }
}

#[async_trait]
impl GeocodeLookup for HttpGeocoder {
    async fn search(&self, query: &str) -> AppResult<Option<Coordinates>> {
        #[derive(Deserialize)]
        struct SearchHit {
            lat: Option<String>,
            lon: Option<String>,
        }

        let mut request = self.http.get(&self.search_url).query(&[
            ("q", query),
            ("countrycodes", self.country_codes.as_str()),
            ("format", "json"),
        ]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.expose_secret())]);
        }

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            debug!(
                target: "geocoder",
                status = %response.status(),
                "geocoder answered with non-success status"
            );
            return Ok(None);
        }

        let hits: Vec<SearchHit> = response.json().await?;
        Ok(hits.into_iter().next().and_then(|hit| {
            let lat = hit.lat?.trim().parse::<f64>().ok()?;
            let lon = hit.lon?.trim().parse::<f64>().ok()?;
            Some(Coordinates::new(lat, lon))
        }))
    }
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::errors::AppError;

    fn http_geocoder(server: &Server) -> Geocoder {
        let config = AppConfig {
            geocoder_base_url: server.url("/").to_string(),
            geocoder_rate_limit_qps: 0,
            ..AppConfig::default()
        };
        Geocoder::new(&config).unwrap()
    }

    #[test]
    fn builds_primary_and_degraded_queries() {
        assert_eq!(
            query_variants(" Main Street Grocers ", "1 Main Rd"),
            vec!["Main Street Grocers, 1 Main Rd", "Main, 1 Main Rd"]
        );
        assert_eq!(query_variants("Massy", "Trincity"), vec!["Massy, Trincity"]);
    }

    #[tokio::test]
    async fn resolves_with_primary_query() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/search"),
                request::query(url_decoded(contains(("q", "Hi-Lo, Mall Road")))),
                request::query(url_decoded(contains(("countrycodes", "tt")))),
                request::query(url_decoded(contains(("format", "json")))),
            ])
            .respond_with(json_encoded(json!([{ "lat": "10.65", "lon": "-61.51" }]))),
        );

        let found = http_geocoder(&server).locate("Hi-Lo", "Mall Road").await;
        assert_eq!(found, Some(Coordinates::new(10.65, -61.51)));
    }

    #[tokio::test]
    async fn falls_back_to_first_word_of_name() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::query(url_decoded(contains((
                "q",
                "Main Street Grocers, 1 Main Rd",
            )))))
            .respond_with(json_encoded(json!([]))),
        );
        server.expect(
            Expectation::matching(request::query(url_decoded(contains((
                "q",
                "Main, 1 Main Rd",
            )))))
            .respond_with(json_encoded(json!([{ "lat": "10.1", "lon": "-61.2" }]))),
        );

        let found = http_geocoder(&server)
            .locate("Main Street Grocers", "1 Main Rd")
            .await;
        assert_eq!(found, Some(Coordinates::new(10.1, -61.2)));
    }

    #[tokio::test]
    async fn server_errors_degrade_to_unresolved() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/search"))
                .times(2)
                .respond_with(status_code(500)),
        );

        let found = http_geocoder(&server)
            .locate("Main Street Grocers", "1 Main Rd")
            .await;
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn malformed_body_is_treated_as_no_match() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/search"))
                .times(1)
                .respond_with(status_code(200).body("not json")),
        );

        assert_eq!(http_geocoder(&server).locate("Massy", "Trincity").await, None);
    }

    struct ScriptedLookup {
        calls: Mutex<Vec<String>>,
        hits: HashMap<String, Coordinates>,
    }

    #[async_trait]
    impl GeocodeLookup for ScriptedLookup {
        async fn search(&self, query: &str) -> AppResult<Option<Coordinates>> {
            self.calls.lock().push(query.to_string());
            if query.starts_with("Broken") {
                return Err(AppError::Config("connection reset".into()));
            }
            Ok(self.hits.get(query).copied())
        }
    }

    #[tokio::test]
    async fn locates_many_stores_concurrently() {
        let lookup = Arc::new(ScriptedLookup {
            calls: Mutex::new(Vec::new()),
            hits: HashMap::from([
                ("Hi-Lo, Mall Road".to_string(), Coordinates::new(10.0, -61.0)),
                ("Broken, Elsewhere".to_string(), Coordinates::new(1.0, 1.0)),
            ]),
        });
        let geocoder = Geocoder::from_lookup(lookup.clone(), 0, 3);

        let results = geocoder
            .locate_many(vec![
                ("Hi-Lo".into(), "Mall Road".into()),
                ("Broken Store".into(), "Elsewhere".into()),
                ("Massy".into(), "Trincity".into()),
            ])
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(
            results[&("Hi-Lo".to_string(), "Mall Road".to_string())],
            Some(Coordinates::new(10.0, -61.0))
        );
        assert_eq!(
            results[&("Broken Store".to_string(), "Elsewhere".to_string())],
            None
        );
        assert_eq!(results[&("Massy".to_string(), "Trincity".to_string())], None);
        assert_eq!(lookup.calls.lock().len(), 4);
    }

    #[test]
    fn sentinel_is_not_resolved() {
        assert!(!Coordinates::UNRESOLVED.is_resolved());
        assert!(Coordinates::new(0.0, -61.0).is_resolved());
        assert_eq!(RateLimiter::interval_ms(0), 0);
        assert_eq!(RateLimiter::interval_ms(5), 200);
        assert_eq!(RateLimiter::interval_ms(100), 50);
    }
}
