use crate::errors::BacktestError;
use crate::models::{Bar, DataSource, Timeframe};
use crate::synthetic;
use anyhow::{anyhow, Context, Result as AnyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const SECONDS_PER_DAY: i64 = 86_400;

/// Source of historical bars. Implementations must be safe to call from
/// multiple concurrent runs; the provider serializes external calls through
/// its global rate limiter.
#[async_trait]
pub trait BarFetcher: Send + Sync {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AnyResult<Vec<Bar>>;
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// How long a cache entry counts as fresh.
    pub cache_ttl: Duration,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Minimum gap between external calls, shared by every concurrent run.
    pub min_request_gap: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(15 * 60),
            max_retries: 3,
            base_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(5),
            min_request_gap: Duration::from_millis(350),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    symbol: String,
    timeframe: Timeframe,
    start_bucket: i64,
    end_bucket: i64,
}

impl CacheKey {
    fn new(symbol: &str, timeframe: Timeframe, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            start_bucket: start.timestamp().div_euclid(SECONDS_PER_DAY),
            end_bucket: end.timestamp().div_euclid(SECONDS_PER_DAY),
        }
    }
}

struct CacheEntry {
    bars: Arc<Vec<Bar>>,
    fetched_at: Instant,
}

/// Bars for one symbol/timeframe/range plus the provenance flag and any
/// degradation warnings picked up on the way.
#[derive(Debug, Clone)]
pub struct BarSeries {
    pub bars: Arc<Vec<Bar>>,
    pub source: DataSource,
    pub warnings: Vec<String>,
}

/// Shared historical-data provider. Cheap to share across concurrent runs
/// behind an `Arc`: reads hit the DashMap cache concurrently, misses for
/// the same key are coalesced into a single underlying fetch, and the rate
/// limiter gates external calls globally.
pub struct HistoricalDataProvider {
    fetcher: Box<dyn BarFetcher>,
    settings: ProviderSettings,
    cache: DashMap<CacheKey, CacheEntry>,
    inflight: DashMap<CacheKey, Arc<Mutex<()>>>,
    request_gate: Mutex<Option<Instant>>,
}

impl HistoricalDataProvider {
    pub fn new(fetcher: Box<dyn BarFetcher>, settings: ProviderSettings) -> Self {
        Self {
            fetcher,
            settings,
            cache: DashMap::new(),
            inflight: DashMap::new(),
            request_gate: Mutex::new(None),
        }
    }

    pub async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarSeries, BacktestError> {
        let key = CacheKey::new(symbol, timeframe, start, end);

        if let Some(series) = self.fresh_cached(&key, symbol, timeframe) {
            return Ok(series);
        }

        // Single-flight: the first caller for this key fetches while the
        // rest block on the gate, then find the cache populated.
        let gate = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = gate.lock().await;

        if let Some(series) = self.fresh_cached(&key, symbol, timeframe) {
            drop(guard);
            self.inflight.remove(&key);
            return Ok(series);
        }

        let result = self
            .fetch_with_fallback(&key, symbol, timeframe, start, end)
            .await;
        drop(guard);
        self.inflight.remove(&key);
        result
    }

    fn fresh_cached(&self, key: &CacheKey, symbol: &str, timeframe: Timeframe) -> Option<BarSeries> {
        let entry = self.cache.get(key)?;
        if entry.fetched_at.elapsed() >= self.settings.cache_ttl {
            return None;
        }
        let bars = entry.bars.clone();
        drop(entry);
        let warnings = gap_warnings(symbol, timeframe, &bars);
        Some(BarSeries {
            bars,
            source: DataSource::Live,
            warnings,
        })
    }

    async fn fetch_with_fallback(
        &self,
        key: &CacheKey,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarSeries, BacktestError> {
        match self.fetch_with_retry(symbol, timeframe, start, end).await {
            Ok(bars) => {
                let bars = Arc::new(bars);
                self.cache.insert(
                    key.clone(),
                    CacheEntry {
                        bars: bars.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                let warnings = gap_warnings(symbol, timeframe, &bars);
                Ok(BarSeries {
                    bars,
                    source: DataSource::Live,
                    warnings,
                })
            }
            Err(error) => {
                warn!("Fetch failed for {} {}: {}", symbol, timeframe.as_str(), error);

                if let Some(entry) = self.cache.get(key) {
                    let bars = entry.bars.clone();
                    drop(entry);
                    let mut warnings = vec![format!(
                        "{}: serving stale cached data after fetch failure ({})",
                        symbol, error
                    )];
                    warnings.extend(gap_warnings(symbol, timeframe, &bars));
                    return Ok(BarSeries {
                        bars,
                        source: DataSource::CachedStale,
                        warnings,
                    });
                }

                let bars = synthetic::generate_bars(symbol, timeframe, start, end);
                if bars.is_empty() {
                    return Err(BacktestError::DataUnavailable {
                        symbol: symbol.to_string(),
                        reason: format!("{} (and the requested range is empty)", error),
                    });
                }
                warn!(
                    "Falling back to synthetic data for {} ({} bars)",
                    symbol,
                    bars.len()
                );
                Ok(BarSeries {
                    bars: Arc::new(bars),
                    source: DataSource::Synthetic,
                    warnings: vec![format!(
                        "{}: using synthetic data after fetch failure ({})",
                        symbol, error
                    )],
                })
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AnyResult<Vec<Bar>> {
        let mut last_error = None;

        for attempt in 0..=self.settings.max_retries {
            self.pace_external_request().await;

            match self.fetcher.fetch(symbol, timeframe, start, end).await {
                Ok(raw) => {
                    let bars = normalize_bars(raw, start, end);
                    if bars.is_empty() {
                        last_error = Some(anyhow!("source returned no bars"));
                    } else {
                        return Ok(bars);
                    }
                }
                Err(error) => {
                    last_error = Some(error);
                }
            }

            if attempt < self.settings.max_retries {
                let delay = self.backoff_delay(attempt);
                debug!(
                    "Attempt {}/{} for {} failed, retrying in {:?}",
                    attempt + 1,
                    self.settings.max_retries + 1,
                    symbol,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("fetch retries exhausted")))
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.base_retry_delay.as_millis() as u64;
        let capped = (base.saturating_mul(2_u64.saturating_pow(attempt)))
            .min(self.settings.max_retry_delay.as_millis() as u64);
        let jitter_range = capped / 4;
        let jitter = if jitter_range > 0 {
            fastrand::u64(0..=jitter_range * 2)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_sub(jitter_range).saturating_add(jitter))
    }

    /// Global pacing gate: callers across all runs queue here so the
    /// external source never sees bursts, regardless of run concurrency.
    async fn pace_external_request(&self) {
        let mut guard = self.request_gate.lock().await;
        if let Some(last) = *guard {
            let elapsed = last.elapsed();
            if elapsed < self.settings.min_request_gap {
                tokio::time::sleep(self.settings.min_request_gap - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Sort, dedupe and clip raw bars to the requested range. Bars are keyed by
/// open_time; duplicates keep the first occurrence.
fn normalize_bars(mut bars: Vec<Bar>, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Bar> {
    bars.retain(|bar| bar.open_time >= start && bar.open_time < end);
    bars.sort_by(|a, b| a.open_time.cmp(&b.open_time));
    bars.dedup_by(|a, b| a.open_time == b.open_time);
    bars
}

/// Gaps are flagged, never silently interpolated.
fn gap_warnings(symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Vec<String> {
    let step = timeframe.step();
    let mut gaps = 0usize;
    let mut first_gap = None;

    for window in bars.windows(2) {
        let delta = window[1].open_time - window[0].open_time;
        if delta > step {
            gaps += 1;
            if first_gap.is_none() {
                first_gap = Some(window[0].open_time);
            }
        }
    }

    match first_gap {
        Some(at) if gaps > 0 => vec![format!(
            "{}: {} gap{} in {} data (first after {})",
            symbol,
            gaps,
            if gaps == 1 { "" } else { "s" },
            timeframe.as_str(),
            at
        )],
        _ => Vec::new(),
    }
}

/// Fetcher for a klines-style REST endpoint (open time in epoch millis,
/// prices and volume as strings or numbers).
pub struct RestFetcher {
    http: reqwest::Client,
    base_url: String,
}

impl RestFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> AnyResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build market data HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BarFetcher for RestFetcher {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AnyResult<Vec<Bar>> {
        let url = format!("{}/klines", self.base_url);
        let start_ms = start.timestamp_millis().to_string();
        let end_ms = end.timestamp_millis().to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("symbol", symbol),
                ("interval", timeframe.as_str()),
                ("startTime", start_ms.as_str()),
                ("endTime", end_ms.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("GET {} returned error", url))?;

        let rows: Vec<Vec<Value>> = response
            .json()
            .await
            .context("failed to parse klines response")?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(bar) = parse_kline_row(symbol, timeframe, &row) else {
                warn!("Skipping malformed kline row for {}", symbol);
                continue;
            };
            bars.push(bar);
        }
        Ok(bars)
    }
}

fn parse_kline_row(symbol: &str, timeframe: Timeframe, row: &[Value]) -> Option<Bar> {
    if row.len() < 6 {
        return None;
    }
    let open_time_ms = row[0].as_i64()?;
    let open_time = DateTime::<Utc>::from_timestamp_millis(open_time_ms)?;

    Some(Bar {
        symbol: symbol.to_string(),
        timeframe,
        open_time,
        open: value_to_f64(&row[1])?,
        high: value_to_f64(&row[2])?,
        low: value_to_f64(&row[3])?,
        close: value_to_f64(&row[4])?,
        volume: value_to_f64(&row[5])?,
    })
}

fn value_to_f64(value: &Value) -> Option<f64> {
    if let Some(number) = value.as_f64() {
        return Some(number);
    }
    value.as_str()?.trim().parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedFetcher {
        calls: AtomicUsize,
        succeed_first: usize,
    }

    impl ScriptedFetcher {
        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                succeed_first: 0,
            }
        }

        fn succeeding_once() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                succeed_first: 1,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BarFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> AnyResult<Vec<Bar>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.succeed_first {
                Ok(synthetic::generate_bars(symbol, timeframe, start, end))
            } else {
                Err(anyhow!("simulated outage"))
            }
        }
    }

    fn fast_settings() -> ProviderSettings {
        ProviderSettings {
            cache_ttl: Duration::from_secs(300),
            max_retries: 0,
            base_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(2),
            min_request_gap: Duration::from_millis(0),
        }
    }

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn persistent_failure_degrades_to_synthetic() {
        let provider =
            HistoricalDataProvider::new(Box::new(ScriptedFetcher::failing()), fast_settings());
        let (start, end) = range();

        let series = provider
            .get_bars("BTC-USD", Timeframe::H1, start, end)
            .await
            .unwrap();
        assert_eq!(series.source, DataSource::Synthetic);
        assert!(!series.bars.is_empty());
        assert!(!series.warnings.is_empty());
    }

    #[tokio::test]
    async fn stale_cache_is_served_when_the_source_goes_down() {
        let mut settings = fast_settings();
        settings.cache_ttl = Duration::from_millis(0);
        let provider =
            HistoricalDataProvider::new(Box::new(ScriptedFetcher::succeeding_once()), settings);
        let (start, end) = range();

        let first = provider
            .get_bars("BTC-USD", Timeframe::H1, start, end)
            .await
            .unwrap();
        assert_eq!(first.source, DataSource::Live);

        // TTL of zero makes the entry immediately stale; the next request
        // refetches, fails, and falls back to the stale entry.
        let second = provider
            .get_bars("BTC-USD", Timeframe::H1, start, end)
            .await
            .unwrap();
        assert_eq!(second.source, DataSource::CachedStale);
        assert_eq!(second.bars.len(), first.bars.len());
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_fetch() {
        let fetcher = Arc::new(ScriptedFetcher::succeeding_once());

        struct SharedFetcher(Arc<ScriptedFetcher>);

        #[async_trait]
        impl BarFetcher for SharedFetcher {
            async fn fetch(
                &self,
                symbol: &str,
                timeframe: Timeframe,
                start: DateTime<Utc>,
                end: DateTime<Utc>,
            ) -> AnyResult<Vec<Bar>> {
                self.0.fetch(symbol, timeframe, start, end).await
            }
        }

        let provider = Arc::new(HistoricalDataProvider::new(
            Box::new(SharedFetcher(fetcher.clone())),
            fast_settings(),
        ));
        let (start, end) = range();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                provider.get_bars("BTC-USD", Timeframe::H1, start, end).await
            }));
        }
        for handle in handles {
            let series = handle.await.unwrap().unwrap();
            assert_eq!(series.source, DataSource::Live);
        }

        assert_eq!(fetcher.call_count(), 1);
    }

    #[test]
    fn gaps_are_flagged() {
        let (start, _) = range();
        let mut bars = synthetic::generate_bars("BTC-USD", Timeframe::H1, start, start + chrono::Duration::hours(6));
        bars.remove(3);
        let warnings = gap_warnings("BTC-USD", Timeframe::H1, &bars);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("1 gap"));
    }
}
