//! In-process fake of the statistics archive.

#![allow(dead_code)]

use async_trait::async_trait;
use league_crawler::api::{RawResponse, Request, TransportError};
use league_crawler::{
    Fetcher, LeagueCrawler, MemorySink, RateLimiter, ResponseCache, RetryPolicy,
    StatistikRequestBuilder, Transport,
};
use shared::{Config, CrawlStore, EndpointKind, Period};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Which league pages exist, and what they contain
#[derive(Default)]
pub struct FakeCatalog {
    leagues: HashSet<(i64, i32)>,
    /// Ids answering 503 in every period
    failing: HashSet<i64>,
    /// Ids answering 404 in every period
    missing: HashSet<i64>,
    overrides: HashMap<(i64, i32, EndpointKind), String>,
    calls: AtomicUsize,
    log: Mutex<Vec<(i64, i32, EndpointKind)>>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_leagues(mut self, period: i32, ids: impl IntoIterator<Item = i64>) -> Self {
        self.leagues.extend(ids.into_iter().map(|id| (id, period)));
        self
    }

    pub fn with_failing(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.failing.extend(ids);
        self
    }

    pub fn with_missing(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.missing.extend(ids);
        self
    }

    /// Serve a fixed body for one endpoint of one league
    pub fn with_page(mut self, id: i64, period: i32, endpoint: EndpointKind, body: String) -> Self {
        self.overrides.insert((id, period, endpoint), body);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requested coordinates, in request order
    pub fn requested(&self) -> Vec<(i64, i32, EndpointKind)> {
        self.log.lock().unwrap().clone()
    }

    pub fn requested_ids(&self, period: i32) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .requested()
            .into_iter()
            .filter(|(_, p, _)| *p == period)
            .map(|(id, _, _)| id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

fn query_param<'a>(url: &'a str, key: &str) -> Option<&'a str> {
    let query = url.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn endpoint_for(code: &str) -> Option<EndpointKind> {
    EndpointKind::ALL
        .into_iter()
        .find(|&e| StatistikRequestBuilder::req_code(e) == code)
}

#[async_trait]
impl Transport for FakeCatalog {
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let parsed = (|| {
            let endpoint = endpoint_for(query_param(&request.url, "reqCode")?)?;
            let id: i64 = query_param(&request.url, "liga_id")?.parse().ok()?;
            let period: i32 = query_param(&request.url, "saison_id")?.parse().ok()?;
            Some((id, period, endpoint))
        })();
        let Some((id, period, endpoint)) = parsed else {
            return Err(TransportError::Other(format!("unexpected url {}", request.url)));
        };
        self.log.lock().unwrap().push((id, period, endpoint));

        if self.failing.contains(&id) {
            return Ok(RawResponse {
                status: 503,
                body: String::new(),
            });
        }
        if self.missing.contains(&id) {
            return Ok(RawResponse {
                status: 404,
                body: String::new(),
            });
        }

        let body = match self.overrides.get(&(id, period, endpoint)) {
            Some(body) => body.clone(),
            None if self.leagues.contains(&(id, period)) => league_page(id, period, endpoint),
            // The archive answers unknown leagues with an empty page
            None => empty_page(),
        };
        Ok(RawResponse { status: 200, body })
    }
}

pub fn empty_page() -> String {
    "<html><head><title>Statistik</title></head><body><p>Keine Daten vorhanden</p></body></html>"
        .to_string()
}

/// Render a statistics page with a header row and data rows
pub fn page(caption: &str, header: &[&str], rows: &[Vec<String>]) -> String {
    let mut html = format!(
        "<html><head><title>Statistik</title></head><body><h1>{}</h1><table>",
        caption
    );
    html.push_str("<tr>");
    for h in header {
        html.push_str(&format!("<th>{}</th>", h));
    }
    html.push_str("</tr>");
    for row in rows {
        html.push_str("<tr>");
        for cell in row {
            html.push_str(&format!("<td>{}</td>", cell));
        }
        html.push_str("</tr>");
    }
    html.push_str("<tr><td colspan=\"7\">Stand: Saisonende</td></tr></table></body></html>");
    html
}

/// Three players and two teams per league
pub fn league_page(id: i64, period: i32, endpoint: EndpointKind) -> String {
    let caption = format!("Bezirksliga {} ({})", id, period);
    let team_a = format!("TSV Liga{} A", id);
    let team_b = format!("BC Liga{} B", id);
    let players = [
        ("Müller", "Max", &team_a),
        ("Schmidt", "Eva", &team_a),
        ("Weber", "Jonas", &team_b),
    ];

    match endpoint {
        EndpointKind::Standings => page(
            &caption,
            &["Platz", "Mannschaft", "Sp", "S", "N", "Pkt", "Körbe", "Diff"],
            &[
                vec!["1.".into(), team_a.clone(), "10".into(), "8".into(), "2".into(), "16".into(), "700:600".into(), "+100".into()],
                vec!["2.".into(), team_b.clone(), "10".into(), "2".into(), "8".into(), "4".into(), "600:700".into(), "-100".into()],
            ],
        ),
        EndpointKind::TopScorers => page(
            &caption,
            &["Platz", "Name", "Vorname", "Mannschaft", "Punkte", "Sp", "Schnitt"],
            &players
                .iter()
                .enumerate()
                .map(|(i, (surname, first, team))| {
                    vec![
                        format!("{}.", i + 1),
                        surname.to_string(),
                        first.to_string(),
                        team.to_string(),
                        format!("{}", 200 - i * 20),
                        "10".to_string(),
                        format!("{},0", 20 - i * 2),
                    ]
                })
                .collect::<Vec<_>>(),
        ),
        EndpointKind::FreeThrows => page(
            &caption,
            &["Platz", "Name", "Vorname", "Mannschaft", "Versuche", "Treffer", "Quote"],
            &players
                .iter()
                .enumerate()
                .map(|(i, (surname, first, team))| {
                    vec![
                        format!("{}", i + 1),
                        surname.to_string(),
                        first.to_string(),
                        team.to_string(),
                        "40".to_string(),
                        format!("{}", 30 - i),
                        format!("{},5%", 75 - i),
                    ]
                })
                .collect::<Vec<_>>(),
        ),
        EndpointKind::ThreePointers => page(
            &caption,
            &["Platz", "Name", "Vorname", "Mannschaft", "Treffer", "Sp", "Schnitt"],
            &players
                .iter()
                .enumerate()
                .map(|(i, (surname, first, team))| {
                    vec![
                        format!("{}", i + 1),
                        surname.to_string(),
                        first.to_string(),
                        team.to_string(),
                        format!("{}", 15 - i),
                        "10".to_string(),
                        format!("1.{}", 5 - i),
                    ]
                })
                .collect::<Vec<_>>(),
        ),
    }
}

/// Entities one generated league contributes
pub const ENTITIES_PER_LEAGUE: usize = 5;

/// Configuration for crawling the fake catalog: one period, no pacing, no
/// body-size warnings
pub fn test_config(data_dir: &Path, periods: &[i32], seeds: &[i64], radius: i64) -> Config {
    let mut config = Config::default();
    config.data.root_dir = data_dir.to_string_lossy().to_string();
    config.crawler.base_url = "http://archive.test".to_string();
    config.crawler.retry.max_attempts = 1;
    config.crawler.retry.backoff_base_ms = 1;
    config.discovery.seed_ids = seeds.to_vec();
    config.discovery.ranges = Vec::new();
    config.discovery.periods = periods.iter().copied().map(Period).collect();
    config.discovery.reference_period = Period(*periods.iter().max().unwrap_or(&2019));
    config.discovery.current_period = Period(2030);
    config.discovery.offset_step = 0;
    config.discovery.adjacency_radius = radius;
    config.discovery.worker_count = 4;
    config.anomaly.min_entities_per_period = 1;
    config.anomaly.min_body_bytes = 0;
    config
}

pub fn fetcher(catalog: Arc<FakeCatalog>, config: &Config) -> Fetcher {
    Fetcher::new(
        catalog,
        RateLimiter::unlimited(),
        RetryPolicy {
            max_attempts: config.crawler.retry.max_attempts,
            backoff_base: Duration::from_millis(config.crawler.retry.backoff_base_ms),
        },
        Duration::from_secs(5),
    )
}

/// Crawler over the fake catalog with an on-disk store and response cache
/// under `data_dir`
pub fn crawler(
    catalog: Arc<FakeCatalog>,
    config: Config,
    data_dir: &Path,
    sink: Arc<MemorySink>,
) -> anyhow::Result<LeagueCrawler> {
    let store = CrawlStore::open(data_dir.join("crawl.db"))?;
    let responses = ResponseCache::new(data_dir.join("responses"), true)?;
    let fetcher = fetcher(catalog, &config);
    Ok(LeagueCrawler::new(config, fetcher, store, sink).with_response_cache(responses))
}
