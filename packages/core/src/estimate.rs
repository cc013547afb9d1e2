//! Estimated daily consumption by device name.
//!
//! Resolution is tiered from cheap to expensive:
//! 1. exact match of the normalized name in a table of appliance archetypes
//! 2. any table key contained in the name, or the name contained in a key
//! 3. any word of the name longer than 3 characters contained in a key
//! 4. an external search whose first results are scanned for power or
//!    energy figures
//!
//! Step 4 runs on the worker pool under a short timeout. Its outcome,
//! "not found" included, is cached by normalized name, and concurrent
//! callers asking for the same name share the one in-flight query.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::cache::{keys, AppCache};
use crate::metrics::AppMetrics;
use crate::models::{round_to, CachedValue, ConsumptionEstimate, EstimateSource, SearchSnippet};
use crate::pool::{TaskError, WorkerPool};
use crate::search::SearchProvider;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SNIPPET_TIMEOUT: Duration = Duration::from_secs(1);

/// Only the top results of a search are scanned.
const RESULTS_SCANNED: usize = 3;
const MIN_SNIPPET_LEN: usize = 20;

/// Typical daily consumption (kWh/day) of common household appliances.
/// Order matters: substring scans return the first hit.
pub static APPLIANCE_TABLE: &[(&str, f64)] = &[
    // Large appliances
    ("refrigerador", 1.5),
    ("refrigeradora", 1.5),
    ("nevera", 1.5),
    ("frigorífico", 1.5),
    ("aire acondicionado", 8.0),
    ("ac", 8.0),
    ("climatizador", 6.0),
    ("lavadora", 0.8),
    ("lavarropas", 0.8),
    ("secadora", 3.0),
    ("secador de ropa", 3.0),
    ("lavavajillas", 1.2),
    ("lavaplatos", 1.2),
    ("horno", 2.4),
    ("horno eléctrico", 2.4),
    ("microondas", 0.4),
    ("micro ondas", 0.4),
    // Heating and hot water
    ("calentador de agua", 4.0),
    ("terma", 4.0),
    ("boiler", 4.0),
    ("calefactor", 2.0),
    ("estufa eléctrica", 2.0),
    ("radiador", 1.5),
    // Entertainment
    ("televisor", 0.3),
    ("tv", 0.3),
    ("televisión", 0.3),
    ("computadora", 0.4),
    ("pc", 0.4),
    ("ordenador", 0.4),
    ("laptop", 0.1),
    ("portátil", 0.1),
    ("consola", 0.2),
    ("playstation", 0.2),
    ("xbox", 0.2),
    // Lighting
    ("bombilla led", 0.024),
    ("foco led", 0.024),
    ("lámpara led", 0.024),
    ("bombilla", 0.144),
    ("foco", 0.144),
    ("lámpara", 0.144),
    ("fluorescente", 0.096),
    // Small appliances
    ("ventilador", 0.2),
    ("abanico", 0.2),
    ("plancha", 0.3),
    ("ferro", 0.3),
    ("aspiradora", 0.4),
    ("aspirador", 0.4),
    ("licuadora", 0.1),
    ("batidora", 0.1),
    ("tostadora", 0.2),
    ("tostador", 0.2),
    ("cafetera", 0.2),
    ("hervidor", 0.3),
    ("pava eléctrica", 0.3),
    // Other
    ("cargador", 0.024),
    ("cargador celular", 0.024),
    ("router", 0.048),
    ("modem", 0.048),
    ("impresora", 0.1),
    ("monitor", 0.2),
    ("pantalla", 0.2),
];

/// Figure extractors tried in order, each with its multiplier to kWh/day.
static EXTRACTORS: Lazy<Vec<(Regex, f64)>> = Lazy::new(|| {
    [
        (r"(?i)(\d+[.,]?\d*)\s*kwh\s*/?(?:por\s*)?d[ií]a", 1.0),
        (r"(?i)(\d+[.,]?\d*)\s*kwh\s*/?(?:por\s*)?mes", 1.0 / 30.0),
        (r"(?i)(\d+[.,]?\d*)\s*w(?:atts?)?\b", 24.0 / 1000.0),
        (r"(?i)(\d+[.,]?\d*)\s*kw\b", 24.0),
    ]
    .into_iter()
    .map(|(pattern, multiplier)| {
        (
            Regex::new(pattern).expect("consumption extractor pattern is valid"),
            multiplier,
        )
    })
    .collect()
});

pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Resolve a device name against the appliance table only.
pub fn lookup_local(name: &str) -> Option<f64> {
    let name = normalize(name);
    if name.is_empty() {
        return None;
    }

    if let Some((_, kwh)) = APPLIANCE_TABLE.iter().find(|(key, _)| *key == name) {
        return Some(*kwh);
    }

    if let Some((_, kwh)) = APPLIANCE_TABLE
        .iter()
        .find(|(key, _)| name.contains(key) || key.contains(name.as_str()))
    {
        return Some(*kwh);
    }

    name.split_whitespace()
        .filter(|word| word.chars().count() > 3)
        .find_map(|word| {
            APPLIANCE_TABLE
                .iter()
                .find(|(key, _)| key.contains(word))
                .map(|(_, kwh)| *kwh)
        })
}

/// First power or energy figure found in `text`, converted to kWh/day.
pub fn extract_daily_kwh(text: &str) -> Option<f64> {
    let text = text.to_lowercase();
    EXTRACTORS.iter().find_map(|(pattern, multiplier)| {
        let captures = pattern.captures(&text)?;
        let value: f64 = captures.get(1)?.as_str().replace(',', ".").parse().ok()?;
        Some(round_to(value * multiplier, 3))
    })
}

type SharedLookup = Shared<BoxFuture<'static, Option<ConsumptionEstimate>>>;
type InFlight = Arc<Mutex<HashMap<String, SharedLookup>>>;

fn lock_in_flight(in_flight: &InFlight) -> MutexGuard<'_, HashMap<String, SharedLookup>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a name from the in-flight map when its lookup task ends,
/// including by panic.
struct InFlightGuard {
    in_flight: InFlight,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock_in_flight(&self.in_flight).remove(&self.name);
    }
}

pub struct EstimateResolver {
    cache: Arc<AppCache>,
    pool: WorkerPool,
    search: Arc<dyn SearchProvider>,
    lookup_timeout: Duration,
    snippet_timeout: Duration,
    in_flight: InFlight,
    metrics: Option<Arc<AppMetrics>>,
}

impl EstimateResolver {
    pub fn new(cache: Arc<AppCache>, pool: WorkerPool, search: Arc<dyn SearchProvider>) -> Self {
        Self {
            cache,
            pool,
            search,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            snippet_timeout: DEFAULT_SNIPPET_TIMEOUT,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            metrics: None,
        }
    }

    pub fn with_timeouts(mut self, lookup_timeout: Duration, snippet_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self.snippet_timeout = snippet_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resolve with the configured external lookup timeout.
    pub async fn resolve(&self, name: &str) -> ConsumptionEstimate {
        self.resolve_within(name, self.lookup_timeout).await
    }

    /// Resolve, waiting at most `budget` for the external lookup.
    ///
    /// When the budget runs out the caller gets "not found" while the
    /// lookup continues and caches its answer for the next caller.
    pub async fn resolve_within(&self, name: &str, budget: Duration) -> ConsumptionEstimate {
        let normalized = normalize(name);
        let key = keys::estimate(&normalized);

        if let Some(CachedValue::Estimate(estimate)) = self.cache.get(&key) {
            self.record_cache_lookup(true);
            return estimate;
        }
        self.record_cache_lookup(false);

        if let Some(kwh) = lookup_local(&normalized) {
            let estimate = ConsumptionEstimate {
                device_name: name.trim().to_string(),
                daily_kwh: Some(kwh),
                source: EstimateSource::LocalTable,
            };
            self.cache.set(key, CachedValue::Estimate(estimate.clone()));
            return estimate;
        }

        let lookup = self.external_lookup(name.trim(), &normalized);
        match tokio::time::timeout(budget, lookup).await {
            Ok(Some(estimate)) => estimate,
            Ok(None) => ConsumptionEstimate::not_found(name.trim()),
            Err(_) => {
                tracing::debug!("External estimate for '{}' not ready after {:?}", normalized, budget);
                ConsumptionEstimate::not_found(name.trim())
            }
        }
    }

    /// Up to three descriptive search snippets for the device detail page.
    /// Empty when the search is slow, fails, or finds nothing useful.
    pub async fn snippets(&self, name: &str) -> Vec<SearchSnippet> {
        let normalized = normalize(name);
        let key = keys::snippets(&normalized);

        if let Some(CachedValue::Snippets(snippets)) = self.cache.get(&key) {
            self.record_cache_lookup(true);
            return snippets;
        }
        self.record_cache_lookup(false);

        let search = self.search.clone();
        let cache = self.cache.clone();
        let query = format!("{} consumo eléctrico especificaciones", name.trim());

        self.pool
            .run_with_timeout("snippet_lookup", self.snippet_timeout, async move {
                let hits = search
                    .search(&query)
                    .await
                    .map_err(|err| TaskError::Search(err.to_string()))?;

                let snippets: Vec<SearchSnippet> = hits
                    .into_iter()
                    .take(RESULTS_SCANNED)
                    .filter(|hit| hit.snippet.trim().len() > MIN_SNIPPET_LEN)
                    .map(|hit| SearchSnippet {
                        title: hit.title,
                        snippet: hit.snippet,
                    })
                    .collect();

                cache.set(key, CachedValue::Snippets(snippets.clone()));
                Ok(snippets)
            })
            .await
            .unwrap_or_default()
    }

    /// Join the in-flight lookup for `normalized`, or start one on the pool.
    fn external_lookup(&self, display_name: &str, normalized: &str) -> SharedLookup {
        let mut in_flight = lock_in_flight(&self.in_flight);
        if let Some(existing) = in_flight.get(normalized) {
            return existing.clone();
        }

        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            name: normalized.to_string(),
        };
        let search = self.search.clone();
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let key = keys::estimate(normalized);
        let device_name = display_name.to_string();
        let query = format!("{} consumo eléctrico kWh watts potencia", display_name);

        // The guard only touches the map after this function releases the
        // lock, so the entry inserted below is always the one it removes.
        let handle = self.pool.spawn("estimate_lookup", async move {
            let _guard = guard;
            if let Some(metrics) = &metrics {
                metrics.external_lookups_total.inc();
            }

            let hits = search
                .search(&query)
                .await
                .map_err(|err| TaskError::Search(err.to_string()))?;

            let daily_kwh = hits.iter().take(RESULTS_SCANNED).find_map(|hit| {
                extract_daily_kwh(&format!("{} {}", hit.title, hit.snippet))
            });

            let estimate = match daily_kwh {
                Some(kwh) => ConsumptionEstimate {
                    device_name,
                    daily_kwh: Some(kwh),
                    source: EstimateSource::ExternalLookup,
                },
                None => ConsumptionEstimate::not_found(device_name),
            };
            cache.set(key, CachedValue::Estimate(estimate.clone()));
            Ok(estimate)
        });

        let shared = async move { handle.await.ok().flatten() }.boxed().shared();
        in_flight.insert(normalized.to_string(), shared.clone());
        shared
    }

    fn record_cache_lookup(&self, hit: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(hit);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::search::{SearchError, SearchHit, SearchProvider};

    /// Search double that counts queries and can be slowed down.
    #[derive(Clone, Default)]
    pub struct FakeSearch {
        pub hits: Vec<SearchHit>,
        pub delay: Option<Duration>,
        pub hang: bool,
        pub calls: Arc<AtomicUsize>,
    }

    impl FakeSearch {
        pub fn returning(hits: &[(&str, &str)]) -> Self {
            Self {
                hits: hits
                    .iter()
                    .map(|(title, snippet)| SearchHit {
                        title: title.to_string(),
                        snippet: snippet.to_string(),
                    })
                    .collect(),
                ..Self::default()
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SearchProvider for FakeSearch {
        async fn search(&self, _query: &str) -> Result<Vec<SearchHit>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.hits.clone())
        }
    }
}
