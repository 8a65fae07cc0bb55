//! Server reputation cache.
//!
//! Scores known server URIs by reliability and latency so the coordinator
//! can pick the best candidates to connect to. Scores persist across
//! restarts; the outage heuristic and the response-time smoother are
//! instance-local so multiple engines in one process cannot
//! cross-contaminate each other.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub const MAX_SCORE: i32 = 500;
pub const MIN_SCORE: i32 = -100;

/// Servers dropped from the published list are strongly discouraged but
/// not forbidden; re-added servers get a second chance.
const DROPPED_SERVER_SCORE: i32 = -100;
const RE_ADDED_SERVER_SCORE: i32 = -10;

/// Sentinel for a server we have never heard back from.
const RESPONSE_TIME_UNINITIALIZED: u64 = 999_999_999;

/// Minimum score a server needs to be ranked by latency.
const QUALIFYING_SCORE: i32 = 5;

/// If no server at all has scored up within this window, assume the
/// network (not the server) is down and suppress penalties.
const OUTAGE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerScore {
    pub url: String,
    pub score: i32,
    /// Smoothed response time in milliseconds.
    pub response_time: u64,
    pub sample_count: u32,
}

impl ServerScore {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            score: 0,
            response_time: RESPONSE_TIME_UNINITIALIZED,
            sample_count: 0,
        }
    }

    /// A server we have never contacted.
    fn is_new(&self) -> bool {
        self.score == 0 && self.response_time == RESPONSE_TIME_UNINITIALIZED
    }
}

pub struct ServerCache {
    servers: HashMap<String, ServerScore>,
    dirty: bool,
    last_score_up: Instant,
}

impl Default for ServerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCache {
    pub fn new() -> Self {
        Self {
            servers: HashMap::new(),
            dirty: false,
            last_score_up: Instant::now(),
        }
    }

    /// Merges previously persisted scores with a freshly published
    /// candidate list.
    pub fn load(&mut self, old_scores: HashMap<String, ServerScore>, candidates: &[String]) {
        let mut merged = old_scores;
        for url in candidates {
            merged
                .entry(url.clone())
                .or_insert_with(|| ServerScore::new(url));
        }

        for (url, mut info) in merged {
            if candidates.contains(&url) {
                info.score = info.score.max(RE_ADDED_SERVER_SCORE);
            } else {
                info.score = info.score.min(DROPPED_SERVER_SCORE);
            }
            self.servers.insert(url, info);
        }
        self.dirty = true;
    }

    pub fn clear(&mut self) {
        self.servers.clear();
        self.dirty = false;
        self.last_score_up = Instant::now();
    }

    pub fn score_up(&mut self, url: &str, response_time_ms: u64, delta: i32) {
        let Some(info) = self.servers.get_mut(url) else {
            return;
        };
        info.score = (info.score + delta).min(MAX_SCORE);
        self.last_score_up = Instant::now();
        if response_time_ms != 0 {
            self.set_response_time(url, response_time_ms);
        }
        if let Some(info) = self.servers.get(url) {
            log::debug!(
                "[SCORE] {url}: up to {} ({response_time_ms}ms)",
                info.score
            );
        }
        self.dirty = true;
    }

    pub fn score_down(&mut self, url: &str, delta: i32) {
        if self.last_score_up.elapsed() > OUTAGE_WINDOW {
            // Nobody has succeeded for a while; don't punish anyone.
            log::debug!("[SCORE] {url}: down cancelled (network outage)");
            return;
        }
        let Some(info) = self.servers.get_mut(url) else {
            return;
        };
        info.score = (info.score - delta).max(MIN_SCORE);
        let first_sample = info.sample_count == 0;
        log::debug!("[SCORE] {url}: down to {}", info.score);
        if first_sample {
            self.set_response_time(url, 9999);
        }
        self.dirty = true;
    }

    fn set_response_time(&mut self, url: &str, response_time_ms: u64) {
        let Some(info) = self.servers.get_mut(url) else {
            return;
        };
        info.sample_count += 1;
        info.response_time = if info.response_time == RESPONSE_TIME_UNINITIALIZED {
            response_time_ms
        } else if info.sample_count % 10 == 0 {
            // Every 10th sample, weight the new one 4:1 to adapt to drift.
            (info.response_time + response_time_ms * 4) / 5
        } else {
            (info.response_time + response_time_ms) / 2
        };
        self.dirty = true;
    }

    /// Selects up to `count` servers to connect to.
    ///
    /// Servers within 100 points of the top score, above the qualifying
    /// minimum, and with a known response time are ranked by latency;
    /// the rest trail in score order. At least one never-contacted server
    /// is always included so new servers keep getting explored.
    pub fn select(&self, count: usize, url_prefixes: &[&str]) -> Vec<String> {
        let matches_prefix = |url: &str| {
            url_prefixes.is_empty() || url_prefixes.iter().any(|p| url.starts_with(p))
        };

        let mut ranked: Vec<&ServerScore> = self
            .servers
            .values()
            .filter(|s| matches_prefix(&s.url))
            .collect();
        if ranked.is_empty() {
            return Vec::new();
        }
        ranked.sort_by(|a, b| b.score.cmp(&a.score));

        let top_score = ranked[0].score;
        let qualifies = |s: &ServerScore| {
            s.score >= top_score - 100
                && s.score >= QUALIFYING_SCORE
                && s.response_time < RESPONSE_TIME_UNINITIALIZED
        };

        let mut qualifying: Vec<&ServerScore> =
            ranked.iter().copied().filter(|s| qualifies(s)).collect();
        qualifying.sort_by(|a, b| a.response_time.cmp(&b.response_time));

        let rest: Vec<&ServerScore> = ranked.iter().copied().filter(|s| !qualifies(s)).collect();

        let mut selected: Vec<String> = Vec::new();
        let mut has_new = false;
        for info in qualifying.iter().chain(rest.iter()) {
            if selected.len() >= count {
                break;
            }
            has_new |= info.is_new();
            selected.push(info.url.clone());
        }

        // Always give one untried server a chance.
        if !has_new {
            if let Some(new_server) = ranked.iter().find(|s| s.is_new()) {
                if selected.len() >= count {
                    selected.pop();
                }
                selected.insert(0, new_server.url.clone());
            }
        }
        selected
    }

    pub fn scores(&self) -> &HashMap<String, ServerScore> {
        &self.servers
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    #[cfg(test)]
    fn backdate_last_score_up(&mut self, by: Duration) {
        self.last_score_up = Instant::now() - by;
    }
}
