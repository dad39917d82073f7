//! Ranking metrics: MAP, P@K, nDCG@K, reciprocal rank.
//!
//! Metric names follow trec_eval (`map`, `P_20`, `ndcg_cut_20`,
//! `recip_rank`). Relevance is graded: a document is relevant when its grade
//! is positive, and nDCG uses the grade as linear gain.
//!
//! Aggregates average over queries that appear in both the run and the
//! judgments; queries without judgments are excluded.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::benchmark::Qrels;
use crate::error::{RerankError, RerankResult};
use crate::run::Run;

/// Supported metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Mean average precision.
    Map,
    /// Precision at cutoff.
    Precision(usize),
    /// nDCG at cutoff.
    NdcgCut(usize),
    /// Reciprocal rank of the first relevant document.
    RecipRank,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Map => write!(f, "map"),
            Metric::Precision(k) => write!(f, "P_{}", k),
            Metric::NdcgCut(k) => write!(f, "ndcg_cut_{}", k),
            Metric::RecipRank => write!(f, "recip_rank"),
        }
    }
}

impl FromStr for Metric {
    type Err = RerankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cutoff = |rest: &str| {
            rest.parse::<usize>()
                .ok()
                .filter(|k| *k > 0)
                .ok_or_else(|| RerankError::config(format!("invalid metric cutoff in '{}'", s)))
        };
        match s {
            "map" => Ok(Metric::Map),
            "recip_rank" | "mrr" => Ok(Metric::RecipRank),
            _ => {
                if let Some(rest) = s.strip_prefix("P_") {
                    Ok(Metric::Precision(cutoff(rest)?))
                } else if let Some(rest) = s.strip_prefix("ndcg_cut_") {
                    Ok(Metric::NdcgCut(cutoff(rest)?))
                } else {
                    Err(RerankError::config(format!("unknown metric '{}'", s)))
                }
            }
        }
    }
}

impl Serialize for Metric {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Metric {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Precision over the top `k` retrieved documents.
pub fn precision_at_k(retrieved: &[&str], relevant: &HashSet<&str>, k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    let hits = retrieved.iter().take(k).filter(|d| relevant.contains(*d)).count();
    hits as f64 / k as f64
}

/// 1/rank of the first relevant document, 0 if none is retrieved.
pub fn reciprocal_rank(retrieved: &[&str], relevant: &HashSet<&str>) -> f64 {
    retrieved
        .iter()
        .position(|d| relevant.contains(d))
        .map(|pos| 1.0 / (pos + 1) as f64)
        .unwrap_or(0.0)
}

/// Average precision against all judged relevant documents.
pub fn average_precision(retrieved: &[&str], relevant: &HashSet<&str>) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }

    let mut sum = 0.0;
    let mut found = 0;
    for (i, doc) in retrieved.iter().enumerate() {
        if relevant.contains(doc) {
            found += 1;
            sum += found as f64 / (i + 1) as f64;
        }
    }
    sum / relevant.len() as f64
}

/// nDCG over the top `k`, with `grades` giving the gain of each judged document.
pub fn ndcg_at_k(retrieved: &[&str], grades: &BTreeMap<String, i32>, k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    let gain = |g: i32| g.max(0) as f64;

    let dcg: f64 = retrieved
        .iter()
        .take(k)
        .enumerate()
        .map(|(i, doc)| gain(grades.get(*doc).copied().unwrap_or(0)) / (i as f64 + 2.0).log2())
        .sum();

    let mut ideal: Vec<f64> = grades.values().map(|g| gain(*g)).collect();
    ideal.sort_by(|a, b| b.total_cmp(a));
    let idcg: f64 = ideal
        .iter()
        .take(k)
        .enumerate()
        .map(|(i, g)| g / (i as f64 + 2.0).log2())
        .sum();

    if idcg < f64::EPSILON {
        0.0
    } else {
        dcg / idcg
    }
}

/// Per-query values of `metric`, keyed by qid.
pub fn per_query(run: &Run, qrels: &Qrels, metric: Metric) -> BTreeMap<String, f64> {
    run.iter()
        .filter_map(|(qid, ranking)| {
            let grades = qrels.for_query(qid)?;
            let retrieved: Vec<&str> = ranking.iter().map(|(d, _)| d.as_str()).collect();
            let relevant: HashSet<&str> = grades
                .iter()
                .filter(|(_, g)| **g > 0)
                .map(|(d, _)| d.as_str())
                .collect();
            let value = match metric {
                Metric::Map => average_precision(&retrieved, &relevant),
                Metric::Precision(k) => precision_at_k(&retrieved, &relevant, k),
                Metric::NdcgCut(k) => ndcg_at_k(&retrieved, grades, k),
                Metric::RecipRank => reciprocal_rank(&retrieved, &relevant),
            };
            Some((qid.to_string(), value))
        })
        .collect()
}

/// Mean of `metric` over judged queries; 0 when none is judged.
pub fn evaluate(run: &Run, qrels: &Qrels, metric: Metric) -> f64 {
    let values = per_query(run, qrels, metric);
    if values.is_empty() {
        return 0.0;
    }
    values.values().sum::<f64>() / values.len() as f64
}

/// Evaluate several metrics given by name.
pub fn evaluate_many(run: &Run, qrels: &Qrels, names: &[&str]) -> RerankResult<BTreeMap<String, f64>> {
    names
        .iter()
        .map(|name| {
            let metric: Metric = name.parse()?;
            Ok((metric.to_string(), evaluate(run, qrels, metric)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set<'a>(ids: &[&'a str]) -> HashSet<&'a str> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_precision_at_k() {
        let retrieved = ["d1", "d2", "d3", "d4", "d5"];
        let relevant = set(&["d1", "d3", "d5", "d7"]);
        assert!((precision_at_k(&retrieved, &relevant, 5) - 0.6).abs() < 1e-9);
        assert!((precision_at_k(&retrieved, &relevant, 2) - 0.5).abs() < 1e-9);
        // cutoff beyond the ranking still divides by k
        assert!((precision_at_k(&retrieved, &relevant, 10) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_reciprocal_rank() {
        let retrieved = ["d2", "d1", "d3"];
        assert!((reciprocal_rank(&retrieved, &set(&["d1", "d3"])) - 0.5).abs() < 1e-9);
        assert_eq!(reciprocal_rank(&retrieved, &set(&["d9"])), 0.0);
    }

    #[test]
    fn test_average_precision() {
        let retrieved = ["d1", "d2", "d3", "d4", "d5"];
        // (1/1 + 2/3 + 3/5) / 3
        let ap = average_precision(&retrieved, &set(&["d1", "d3", "d5"]));
        assert!((ap - 0.7556).abs() < 1e-3);
        // unretrieved relevant documents count in the denominator
        let ap = average_precision(&["d1"], &set(&["d1", "d9"]));
        assert!((ap - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ndcg_graded() {
        let mut grades = BTreeMap::new();
        grades.insert("d1".to_string(), 1);
        grades.insert("d2".to_string(), 2);
        let ideal = ndcg_at_k(&["d2", "d1"], &grades, 10);
        assert!((ideal - 1.0).abs() < 1e-9);
        let swapped = ndcg_at_k(&["d1", "d2"], &grades, 10);
        assert!(swapped < 1.0 && swapped > 0.0);
    }

    #[test]
    fn test_metric_names() {
        assert_eq!("map".parse::<Metric>().unwrap(), Metric::Map);
        assert_eq!("P_20".parse::<Metric>().unwrap(), Metric::Precision(20));
        assert_eq!("ndcg_cut_10".parse::<Metric>().unwrap(), Metric::NdcgCut(10));
        assert_eq!(Metric::NdcgCut(10).to_string(), "ndcg_cut_10");
        assert!("P_0".parse::<Metric>().is_err());
        assert!("bpref".parse::<Metric>().is_err());
    }

    #[test]
    fn test_evaluate_excludes_unjudged_queries() {
        let mut run = Run::new();
        run.insert("301", "LA010189-0001", 0.1);
        run.insert("301", "LA010189-0002", 0.9);
        run.insert("999", "x", 1.0);

        let mut qrels = Qrels::new();
        qrels.insert("301", "LA010189-0001", 0);
        qrels.insert("301", "LA010189-0002", 1);

        assert!((evaluate(&run, &qrels, Metric::Map) - 1.0).abs() < 1e-9);
        assert_eq!(per_query(&run, &qrels, Metric::Map).len(), 1);

        let all = evaluate_many(&run, &qrels, &["map", "P_1", "recip_rank"]).unwrap();
        assert_eq!(all.len(), 3);
        assert!((all["P_1"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_evaluate_empty_is_zero() {
        assert_eq!(evaluate(&Run::new(), &Qrels::new(), Metric::Map), 0.0);
    }
}
