//! Aggregator. Derives the threat-intelligence report and the
//! incident timeline from `ThreatRecord`s already restricted to one owner
//! and time window by the Storage Layer.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::Serialize;

use crate::types::{AttackVector, ThreatRecord};

pub const DEFAULT_SINCE_HOURS: i64 = 24;
pub const DEFAULT_TOP_N: usize = 5;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TopHostileIp {
    pub ip: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct AttackVectorDistribution {
    #[serde(rename = "Volumetric")]
    pub volumetric: u64,
    #[serde(rename = "Protocol")]
    pub protocol: u64,
    #[serde(rename = "Application")]
    pub application: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GeoBreakdown {
    pub name: String,
    pub count: u64,
    pub pct: u32,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct ConfidenceBucketCounts {
    #[serde(rename = "Obvious")]
    pub obvious: u64,
    #[serde(rename = "Subtle")]
    pub subtle: u64,
    #[serde(rename = "Other")]
    pub other: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AiConfidenceDistribution {
    pub buckets: ConfidenceBucketCounts,
    /// The score boundaries separating Obvious|Subtle and Subtle|Other, so
    /// the UI can explain the split. `None` when there were no scored
    /// threats in the window.
    pub obvious_subtle_boundary: Option<f64>,
    pub subtle_other_boundary: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThreatIntel {
    pub total_threats: u64,
    pub top_hostile_ips: Vec<TopHostileIp>,
    pub attack_vector_distribution: AttackVectorDistribution,
    pub geo_all_countries: Vec<GeoBreakdown>,
    pub ai_confidence_distribution: AiConfidenceDistribution,
}

/// Computes the full threat-intelligence report over `records`, which the
/// caller has already restricted to one owner and `since_hours` window.
pub fn threat_intel(records: &[ThreatRecord], top_n: usize) -> ThreatIntel {
    let total_threats = records.len() as u64;

    ThreatIntel {
        total_threats,
        top_hostile_ips: top_hostile_ips(records, top_n),
        attack_vector_distribution: attack_vector_distribution(records),
        geo_all_countries: geo_breakdown(records, total_threats),
        ai_confidence_distribution: ai_confidence_distribution(records),
    }
}

fn top_hostile_ips(records: &[ThreatRecord], top_n: usize) -> Vec<TopHostileIp> {
    let mut by_ip: HashMap<&str, (u64, DateTime<Utc>)> = HashMap::new();
    for r in records {
        let entry = by_ip.entry(r.source_ip.as_str()).or_insert((0, r.timestamp));
        entry.0 += 1;
        if r.timestamp > entry.1 {
            entry.1 = r.timestamp;
        }
    }

    let mut ips: Vec<TopHostileIp> = by_ip
        .into_iter()
        .map(|(ip, (count, last_seen))| TopHostileIp { ip: ip.to_string(), count, last_seen })
        .collect();

    // count desc, tie-break on more recent last_seen.
    ips.sort_by(|a, b| b.count.cmp(&a.count).then(b.last_seen.cmp(&a.last_seen)));
    ips.truncate(top_n);
    ips
}

fn attack_vector_distribution(records: &[ThreatRecord]) -> AttackVectorDistribution {
    let mut dist = AttackVectorDistribution::default();
    for r in records {
        match r.attack_vector {
            Some(AttackVector::Volumetric) => dist.volumetric += 1,
            Some(AttackVector::Protocol) => dist.protocol += 1,
            Some(AttackVector::Application) => dist.application += 1,
            None => {} // unknown vectors are dropped from this breakdown
        }
    }
    dist
}

fn geo_breakdown(records: &[ThreatRecord], total: u64) -> Vec<GeoBreakdown> {
    let mut by_country: HashMap<String, u64> = HashMap::new();
    for r in records {
        let name = r.source_country.clone().unwrap_or_else(|| "Unknown".to_string());
        *by_country.entry(name).or_insert(0) += 1;
    }

    let mut breakdown: Vec<GeoBreakdown> = by_country
        .into_iter()
        .map(|(name, count)| {
            let pct = if total == 0 { 0 } else { ((count as f64 / total as f64) * 100.0).round() as u32 };
            GeoBreakdown { name, count, pct }
        })
        .collect();

    breakdown.sort_by(|a, b| b.count.cmp(&a.count).then(a.name.cmp(&b.name)));
    breakdown
}

/// Lower scores are more suspicious. Bottom 20% → Obvious, next 40% →
/// Subtle, remaining 40% → Other. When every score is identical there is
/// no basis to distinguish degrees of suspicion, so everything falls into
/// `Other`, the inconclusive/no-signal bucket.
fn ai_confidence_distribution(records: &[ThreatRecord]) -> AiConfidenceDistribution {
    let mut scores: Vec<f64> = records.iter().filter_map(|r| r.anomaly_score).collect();
    scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = scores.len();
    if n == 0 {
        return AiConfidenceDistribution {
            buckets: ConfidenceBucketCounts::default(),
            obvious_subtle_boundary: None,
            subtle_other_boundary: None,
        };
    }

    let all_equal = (scores[n - 1] - scores[0]).abs() < f64::EPSILON;
    if all_equal {
        return AiConfidenceDistribution {
            buckets: ConfidenceBucketCounts { obvious: 0, subtle: 0, other: n as u64 },
            obvious_subtle_boundary: Some(scores[0]),
            subtle_other_boundary: Some(scores[0]),
        };
    }

    let idx1 = ((n as f64) * 0.2).round() as usize;
    let idx2 = ((n as f64) * 0.6).round().max(idx1 as f64) as usize;
    let idx1 = idx1.min(n);
    let idx2 = idx2.min(n);

    let obvious = idx1 as u64;
    let subtle = (idx2 - idx1) as u64;
    let other = (n - idx2) as u64;

    AiConfidenceDistribution {
        buckets: ConfidenceBucketCounts { obvious, subtle, other },
        obvious_subtle_boundary: scores.get(idx1.saturating_sub(1)).copied(),
        subtle_other_boundary: scores.get(idx2.saturating_sub(1)).copied(),
    }
}

// ---------------------------------------------------------------------
// Incident timeline
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Hour,
    Day,
    Month,
}

/// `auto` selects `hour` if span ≤ 48h, `day` if ≤ 120d, else `month`.
pub fn resolve_auto_bucket(from: DateTime<Utc>, to: DateTime<Utc>) -> Bucket {
    let span = to - from;
    if span <= Duration::hours(48) {
        Bucket::Hour
    } else if span <= Duration::days(120) {
        Bucket::Day
    } else {
        Bucket::Month
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimelineEntry {
    pub key: String,
    pub attacks: u64,
}

/// Truncates `ts` to the start of its bucket, in UTC.
#[allow(clippy::unwrap_used)]
fn bucket_start(ts: DateTime<Utc>, bucket: Bucket) -> DateTime<Utc> {
    match bucket {
        Bucket::Hour => ts.with_minute(0).unwrap().with_second(0).unwrap().with_nanosecond(0).unwrap(),
        Bucket::Day => ts.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc(),
        Bucket::Month => ts
            .date_naive()
            .with_day(1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc(),
    }
}

fn bucket_key(start: DateTime<Utc>, bucket: Bucket) -> String {
    match bucket {
        Bucket::Hour => start.format("%Y-%m-%dT%H:00").to_string(),
        Bucket::Day => start.format("%Y-%m-%d").to_string(),
        Bucket::Month => start.format("%Y-%m").to_string(),
    }
}

#[allow(clippy::unwrap_used)]
fn next_bucket_start(start: DateTime<Utc>, bucket: Bucket) -> DateTime<Utc> {
    match bucket {
        Bucket::Hour => start + Duration::hours(1),
        Bucket::Day => start + Duration::days(1),
        Bucket::Month => {
            let naive = start.date_naive();
            let next = if naive.month() == 12 {
                naive.with_year(naive.year() + 1).unwrap().with_month(1).unwrap()
            } else {
                naive.with_month(naive.month() + 1).unwrap()
            };
            next.and_hms_opt(0, 0, 0).unwrap().and_utc()
        }
    }
}

/// Builds the bucketed incident timeline over `[from, to)`. Every bucket
/// key in range appears exactly once, with `attacks: 0` for empty ones —
/// required so clients can render a continuous axis.
pub fn incident_timeline(
    records: &[ThreatRecord],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    bucket: Bucket,
) -> Vec<TimelineEntry> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for r in records {
        if r.timestamp >= from && r.timestamp < to {
            *counts.entry(bucket_key(bucket_start(r.timestamp, bucket), bucket)).or_insert(0) += 1;
        }
    }

    let mut entries = Vec::new();
    if from >= to {
        return entries;
    }

    let mut cursor = bucket_start(from, bucket);
    loop {
        if cursor >= to {
            break;
        }
        let key = bucket_key(cursor, bucket);
        let attacks = counts.get(&key).copied().unwrap_or(0);
        entries.push(TimelineEntry { key, attacks });
        cursor = next_bucket_start(cursor, bucket);
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ip: &str, ts: DateTime<Utc>, score: Option<f64>, vector: Option<AttackVector>) -> ThreatRecord {
        ThreatRecord {
            owner_id: crate::types::OwnerId::anon("a"),
            timestamp: ts,
            source_ip: ip.to_string(),
            source_country: Some("US".to_string()),
            destination_ip: "10.0.0.1".to_string(),
            protocol: "TCP".to_string(),
            method: "POST".to_string(),
            bytes: 20_000,
            anomaly_score: score,
            is_anomaly: true,
            attack_vector: vector,
        }
    }

    #[test]
    fn top_hostile_ips_sorted_by_count_then_recency() {
        let t0 = Utc::now();
        let records = vec![
            record("1.1.1.1", t0, Some(0.1), Some(AttackVector::Volumetric)),
            record("1.1.1.1", t0 + Duration::seconds(1), Some(0.1), Some(AttackVector::Volumetric)),
            record("2.2.2.2", t0, Some(0.1), Some(AttackVector::Volumetric)),
        ];
        let top = top_hostile_ips(&records, 5);
        assert_eq!(top[0].ip, "1.1.1.1");
        assert_eq!(top[0].count, 2);
    }

    #[test]
    fn scenario_three_top_hostile_ip_is_attacker() {
        let t0 = Utc::now();
        let records = vec![
            record("198.51.100.23", t0, Some(0.0), Some(AttackVector::Volumetric)),
            record("198.51.100.23", t0, Some(0.0), Some(AttackVector::Volumetric)),
        ];
        let intel = threat_intel(&records, DEFAULT_TOP_N);
        assert_eq!(intel.top_hostile_ips[0].ip, "198.51.100.23");
        assert!(intel.ai_confidence_distribution.buckets.obvious >= 1 || intel.ai_confidence_distribution.buckets.other >= 1);
    }

    #[test]
    fn attack_vector_distribution_drops_unknown_but_counts_total() {
        let t0 = Utc::now();
        let records = vec![
            record("1.1.1.1", t0, Some(0.1), Some(AttackVector::Volumetric)),
            record("2.2.2.2", t0, Some(0.1), None),
        ];
        let intel = threat_intel(&records, DEFAULT_TOP_N);
        assert_eq!(intel.total_threats, 2);
        assert_eq!(intel.attack_vector_distribution.volumetric, 1);
        assert_eq!(intel.attack_vector_distribution.protocol, 0);
        assert_eq!(intel.attack_vector_distribution.application, 0);
    }

    #[test]
    fn geo_breakdown_sums_to_at_most_100_pct() {
        let t0 = Utc::now();
        let records: Vec<_> = (0..7).map(|i| record(&format!("1.1.1.{i}"), t0, Some(0.1), Some(AttackVector::Protocol))).collect();
        let intel = threat_intel(&records, DEFAULT_TOP_N);
        let sum: u32 = intel.geo_all_countries.iter().map(|g| g.pct).sum();
        assert!(sum <= 100);
    }

    #[test]
    fn all_equal_scores_collapse_to_single_bucket() {
        let t0 = Utc::now();
        let records: Vec<_> = (0..5).map(|_| record("1.1.1.1", t0, Some(0.5), Some(AttackVector::Protocol))).collect();
        let intel = threat_intel(&records, DEFAULT_TOP_N);
        assert_eq!(intel.ai_confidence_distribution.buckets.obvious, 0);
        assert_eq!(intel.ai_confidence_distribution.buckets.subtle, 0);
        assert_eq!(intel.ai_confidence_distribution.buckets.other, 5);
    }

    #[test]
    fn confidence_buckets_split_20_40_40() {
        let t0 = Utc::now();
        let records: Vec<_> = (0..10)
            .map(|i| record("1.1.1.1", t0, Some(i as f64 * 0.1), Some(AttackVector::Protocol)))
            .collect();
        let intel = threat_intel(&records, DEFAULT_TOP_N);
        assert_eq!(intel.ai_confidence_distribution.buckets.obvious, 2);
        assert_eq!(intel.ai_confidence_distribution.buckets.subtle, 4);
        assert_eq!(intel.ai_confidence_distribution.buckets.other, 4);
    }

    #[test]
    fn auto_bucket_picks_hour_for_short_span() {
        let from = Utc::now();
        let to = from + Duration::hours(10);
        assert_eq!(resolve_auto_bucket(from, to), Bucket::Hour);
    }

    #[test]
    fn auto_bucket_picks_day_for_medium_span() {
        let from = Utc::now();
        let to = from + Duration::days(60);
        assert_eq!(resolve_auto_bucket(from, to), Bucket::Day);
    }

    #[test]
    fn auto_bucket_picks_month_for_long_span() {
        let from = Utc::now();
        let to = from + Duration::days(400);
        assert_eq!(resolve_auto_bucket(from, to), Bucket::Month);
    }

    #[test]
    fn timeline_has_24_hourly_buckets_for_one_day() {
        let from: DateTime<Utc> = "2025-01-01T00:00:00Z".parse().unwrap();
        let to: DateTime<Utc> = "2025-01-02T00:00:00Z".parse().unwrap();
        let entries = incident_timeline(&[], from, to, Bucket::Hour);
        assert_eq!(entries.len(), 24);
        assert_eq!(entries[0].key, "2025-01-01T00:00");
        assert_eq!(entries[23].key, "2025-01-01T23:00");
        assert!(entries.iter().all(|e| e.attacks == 0));
    }

    #[test]
    fn timeline_buckets_records_into_correct_hour() {
        let from: DateTime<Utc> = "2025-01-01T00:00:00Z".parse().unwrap();
        let to: DateTime<Utc> = "2025-01-01T03:00:00Z".parse().unwrap();
        let ts: DateTime<Utc> = "2025-01-01T01:30:00Z".parse().unwrap();
        let records = vec![record("1.1.1.1", ts, Some(0.1), Some(AttackVector::Protocol))];
        let entries = incident_timeline(&records, from, to, Bucket::Hour);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].attacks, 1);
        assert_eq!(entries[0].attacks, 0);
        assert_eq!(entries[2].attacks, 0);
    }

    #[test]
    fn empty_range_returns_no_entries() {
        let from = Utc::now();
        let entries = incident_timeline(&[], from, from, Bucket::Hour);
        assert!(entries.is_empty());
    }
}
