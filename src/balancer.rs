//! Load Balancer: score workers from health samples, pick the best candidate.
//!
//! A pure leaf — no reference to the Registry or Pool. It only ever sees
//! `Candidate` snapshots handed to it by the caller and returns a name.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;

const SCORE_HISTORY_CAP: usize = 100;
const TREND_WINDOW: usize = 10;
const TREND_CLAMP: f64 = 0.2;

/// A point-in-time load snapshot for one worker, in percent/count units
/// matching `HealthSample` (0-100 for cpu/mem/disk/network, raw count for tasks).
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_percent: f64,
    pub network_percent: f64,
    pub running_tasks: u32,
}

/// Per-dimension reservations added to a candidate's current value before
/// the requirement gate is checked, letting a caller reserve headroom for
/// work it's about to place without having observed it yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Requirements {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_percent: f64,
    pub network_percent: f64,
    pub running_tasks: u32,
}

/// Operational snapshot for one worker: raw score plus its trend multiplier.
/// Read-only and additive — `server_status`/`cluster_status` never feed back
/// into `select`.
#[derive(Debug, Clone, Copy)]
pub struct ServerStatus {
    pub score: f64,
    pub trend: f64,
    pub final_score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ClusterStatus {
    pub server_count: usize,
    pub total_running_tasks: u32,
    pub average_score: f64,
    pub healthy_server_count: usize,
}

struct ScoreHistory {
    history: VecDeque<f64>,
    last_candidate: Option<Candidate>,
}

/// Scores workers from health samples; picks the best candidate.
pub struct LoadBalancer {
    loads: DashMap<String, ScoreHistory>,
    last_selected: DashMap<String, Instant>,
    cooldown: Duration,
    top_n: usize,
}

impl LoadBalancer {
    pub fn new(cooldown: Duration, top_n: usize) -> Self {
        Self {
            loads: DashMap::new(),
            last_selected: DashMap::new(),
            cooldown,
            top_n: top_n.max(1),
        }
    }

    /// score = 0.4*cpu + 0.3*mem + 0.3*disk (0-100, lower is better).
    pub fn score(candidate: &Candidate) -> f64 {
        0.4 * candidate.cpu_percent + 0.3 * candidate.mem_percent + 0.3 * candidate.disk_percent
    }

    /// Records a fresh sample for `name`, pushing onto its score history.
    pub fn record(&self, name: &str, candidate: Candidate) {
        let score = Self::score(&candidate);
        let mut entry = self.loads.entry(name.to_string()).or_insert_with(|| ScoreHistory {
            history: VecDeque::with_capacity(SCORE_HISTORY_CAP),
            last_candidate: None,
        });
        if entry.history.len() >= SCORE_HISTORY_CAP {
            entry.history.pop_front();
        }
        entry.history.push_back(score);
        entry.last_candidate = Some(candidate);
    }

    fn passes_gate(candidate: &Candidate, requirements: &Requirements) -> bool {
        if candidate.cpu_percent / 100.0 + requirements.cpu_percent / 100.0 > 0.8 {
            return false;
        }
        if candidate.mem_percent / 100.0 + requirements.mem_percent / 100.0 > 0.8 {
            return false;
        }
        if candidate.disk_percent / 100.0 + requirements.disk_percent / 100.0 > 0.9 {
            return false;
        }
        if candidate.network_percent / 100.0 + requirements.network_percent / 100.0 > 0.8 {
            return false;
        }
        if candidate.running_tasks + requirements.running_tasks >= 10 {
            return false;
        }
        true
    }

    /// Picks one of the top `top_n` lowest-scored eligible candidates,
    /// favoring ones not selected within the cooldown window.
    pub fn select(
        &self,
        candidates: &[(String, Candidate)],
        requirements: Requirements,
    ) -> Option<String> {
        let eligible: Vec<&(String, Candidate)> = candidates
            .iter()
            .filter(|(_, c)| Self::passes_gate(c, &requirements))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let now = Instant::now();
        let mut pool: Vec<&(String, Candidate)> = eligible
            .iter()
            .filter(|(name, _)| {
                self.last_selected
                    .get(name)
                    .map(|t| now.duration_since(*t) >= self.cooldown)
                    .unwrap_or(true)
            })
            .copied()
            .collect();
        if pool.is_empty() {
            pool = eligible;
        }

        pool.sort_by(|a, b| {
            Self::score(&a.1)
                .partial_cmp(&Self::score(&b.1))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let n = self.top_n.min(pool.len());
        let idx = if n <= 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..n)
        };
        let chosen = &pool[idx];
        self.last_selected.insert(chosen.0.clone(), now);
        Some(chosen.0.clone())
    }

    /// Slope of the last `TREND_WINDOW` scores via simple linear regression
    /// over index 0..n-1, clamped to ±0.2. Positive means rising (worsening) load.
    fn trend(history: &VecDeque<f64>) -> f64 {
        let n = history.len().min(TREND_WINDOW);
        if n < 2 {
            return 0.0;
        }
        let points: Vec<f64> = history.iter().rev().take(n).rev().copied().collect();
        let n_f = n as f64;
        let sum_x: f64 = (0..n).map(|i| i as f64).sum();
        let sum_y: f64 = points.iter().sum();
        let sum_xy: f64 = points.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
        let sum_xx: f64 = (0..n).map(|i| (i * i) as f64).sum();
        let denom = n_f * sum_xx - sum_x * sum_x;
        if denom.abs() < f64::EPSILON {
            return 0.0;
        }
        let slope = (n_f * sum_xy - sum_x * sum_y) / denom;
        slope.clamp(-TREND_CLAMP, TREND_CLAMP)
    }

    /// Reporting-only status for one worker: base score, trend, and the
    /// trend-weighted final score (`score * (1 + trend)`).
    pub fn server_status(&self, name: &str) -> Option<ServerStatus> {
        let entry = self.loads.get(name)?;
        let score = *entry.history.back()?;
        let trend = Self::trend(&entry.history);
        Some(ServerStatus {
            score,
            trend,
            final_score: score * (1.0 + trend),
        })
    }

    /// Reporting-only cluster-wide aggregate.
    pub fn cluster_status(&self) -> ClusterStatus {
        let server_count = self.loads.len();
        let mut total_running_tasks = 0u32;
        let mut total_score = 0.0;
        let mut healthy = 0usize;
        for entry in self.loads.iter() {
            if let Some(candidate) = entry.last_candidate {
                total_running_tasks += candidate.running_tasks;
                if Self::passes_gate(&candidate, &Requirements::default()) {
                    healthy += 1;
                }
            }
            if let Some(score) = entry.history.back() {
                total_score += score;
            }
        }
        let average_score = if server_count > 0 {
            total_score / server_count as f64
        } else {
            0.0
        };
        ClusterStatus {
            server_count,
            total_running_tasks,
            average_score,
            healthy_server_count: healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(cpu: f64, mem: f64, disk: f64) -> Candidate {
        Candidate {
            cpu_percent: cpu,
            mem_percent: mem,
            disk_percent: disk,
            network_percent: 0.0,
            running_tasks: 0,
        }
    }

    #[test]
    fn score_weights_are_cpu_weighted() {
        let c = candidate(100.0, 0.0, 0.0);
        assert!((LoadBalancer::score(&c) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn select_picks_lower_scored_candidate() {
        let balancer = LoadBalancer::new(Duration::from_secs(5), 3);
        let candidates = vec![
            ("high".to_string(), candidate(90.0, 90.0, 90.0)),
            ("low".to_string(), candidate(5.0, 5.0, 5.0)),
        ];
        // top_n=3 but only 2 candidates, still deterministic with a single
        // clearly-lowest candidate only if top_n effectively narrows to 1.
        let balancer = LoadBalancer::new(Duration::from_secs(5), 1);
        let picked = balancer.select(&candidates, Requirements::default());
        assert_eq!(picked, Some("low".to_string()));
        let _ = balancer;
    }

    #[test]
    fn select_excludes_over_threshold_candidates() {
        let balancer = LoadBalancer::new(Duration::from_secs(5), 3);
        let candidates = vec![(
            "overloaded".to_string(),
            Candidate {
                cpu_percent: 95.0,
                mem_percent: 10.0,
                disk_percent: 10.0,
                network_percent: 0.0,
                running_tasks: 0,
            },
        )];
        assert_eq!(balancer.select(&candidates, Requirements::default()), None);
    }

    #[test]
    fn cooldown_falls_back_to_full_set_when_all_recently_selected() {
        let balancer = LoadBalancer::new(Duration::from_secs(5), 1);
        let candidates = vec![("only".to_string(), candidate(10.0, 10.0, 10.0))];
        assert_eq!(
            balancer.select(&candidates, Requirements::default()),
            Some("only".to_string())
        );
        // Selected again immediately; cooldown would exclude it, but the
        // fallback-to-full-set rule means it's still selectable.
        assert_eq!(
            balancer.select(&candidates, Requirements::default()),
            Some("only".to_string())
        );
    }

    #[test]
    fn trend_is_clamped() {
        let mut history = VecDeque::new();
        for i in 0..20 {
            history.push_back(i as f64 * 100.0);
        }
        let trend = LoadBalancer::trend(&history);
        assert!(trend <= TREND_CLAMP && trend >= -TREND_CLAMP);
    }
}
