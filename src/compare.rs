//! Experiment comparison: per-score statistics and baseline diffs.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::ValidationError;
use crate::score::{parse_bool, ScoreDataType, ScoreRecord};

/// One materialized score value belonging to an experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreSample {
    pub experiment_id: String,
    pub name: String,
    pub data_type: ScoreDataType,
    pub value: Option<f64>,
    pub string_value: Option<String>,
}

impl ScoreSample {
    /// Convert a stored score. Scores without an experiment are skipped.
    pub fn from_record(record: &ScoreRecord) -> Option<Self> {
        let score = &record.score;
        Some(Self {
            experiment_id: score.experiment_id.clone()?,
            name: score.name.clone(),
            data_type: score.data_type,
            value: score.value,
            string_value: score.string_value.clone(),
        })
    }

    /// Numeric reading of the sample. Boolean strings count as 0/1.
    fn numeric(&self) -> Option<f64> {
        match (self.value, self.data_type, self.string_value.as_deref()) {
            (Some(v), _, _) if v.is_finite() => Some(v),
            (None, ScoreDataType::Boolean, Some(s)) => {
                parse_bool(s).map(|b| if b { 1.0 } else { 0.0 })
            }
            _ => None,
        }
    }
}

/// Summary statistics of a numeric score in one experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreStats {
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl ScoreStats {
    /// Returns `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std_dev: variance.sqrt(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            count: values.len(),
        })
    }
}

/// Label distribution of a categorical score in one experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStats {
    pub count: usize,
    pub distribution: BTreeMap<String, usize>,
    /// Most frequent label; ties go to the lexicographically smallest.
    pub mode: String,
}

impl CategoryStats {
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut distribution = BTreeMap::new();
        for label in labels {
            *distribution.entry(label.to_string()).or_insert(0usize) += 1;
        }
        // BTreeMap iterates in key order; the fold keeps the first maximum on ties
        let mode = distribution
            .iter()
            .fold(None::<(&String, usize)>, |best, (label, &n)| match best {
                Some((_, best_n)) if best_n >= n => best,
                _ => Some((label, n)),
            })?
            .0
            .clone();
        Some(Self {
            count: distribution.values().sum(),
            distribution,
            mode,
        })
    }
}

/// Aggregate of one score in one experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoreAggregate {
    Numeric(ScoreStats),
    Categorical(CategoryStats),
}

/// Sign of a numeric diff against the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    #[serde(rename = "+")]
    Up,
    #[serde(rename = "-")]
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "+",
            Self::Down => "-",
        }
    }
}

/// Difference between an experiment and the baseline for one score.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScoreDiff {
    Numeric { difference: f64, direction: Direction },
    Categorical { is_different: bool },
}

/// Numeric diff: magnitude of the mean difference and its direction.
pub fn calculate_diff(baseline: &ScoreStats, current: &ScoreStats) -> ScoreDiff {
    let direction = if current.mean >= baseline.mean {
        Direction::Up
    } else {
        Direction::Down
    };
    ScoreDiff::Numeric {
        difference: (current.mean - baseline.mean).abs(),
        direction,
    }
}

fn diff(baseline: &ScoreAggregate, current: &ScoreAggregate) -> Option<ScoreDiff> {
    match (baseline, current) {
        (ScoreAggregate::Numeric(b), ScoreAggregate::Numeric(c)) => Some(calculate_diff(b, c)),
        (ScoreAggregate::Categorical(b), ScoreAggregate::Categorical(c)) => {
            Some(ScoreDiff::Categorical {
                is_different: b.mode != c.mode,
            })
        }
        _ => None,
    }
}

/// Comparison of one score across experiments. Experiments without data for
/// the score are absent from both maps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreComparison {
    pub data_type: ScoreDataType,
    pub experiments: BTreeMap<String, ScoreAggregate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub diffs: BTreeMap<String, ScoreDiff>,
}

/// Result of comparing experiment runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub experiment_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_id: Option<String>,
    pub scores: BTreeMap<String, ScoreComparison>,
}

/// Validate the experiment selection for a comparison.
pub fn check_selection(
    config: &EngineConfig,
    experiment_ids: &[String],
    baseline_id: Option<&str>,
) -> Result<(), ValidationError> {
    let n = experiment_ids.len();
    if n < config.min_comparison_experiments || n > config.max_comparison_experiments {
        return Err(ValidationError::new(
            "experiment_ids",
            format!(
                "expected {} to {} experiments, got {}",
                config.min_comparison_experiments, config.max_comparison_experiments, n
            ),
        ));
    }
    let mut seen = HashSet::new();
    for id in experiment_ids {
        if id.trim().is_empty() {
            return Err(ValidationError::new("experiment_ids", "contains an empty id"));
        }
        if !seen.insert(id.as_str()) {
            return Err(ValidationError::new(
                "experiment_ids",
                format!("duplicate experiment '{}'", id),
            ));
        }
    }
    if let Some(baseline) = baseline_id {
        if !seen.contains(baseline) {
            return Err(ValidationError::new(
                "baseline_id",
                format!("'{}' is not one of the compared experiments", baseline),
            ));
        }
    }
    Ok(())
}

/// Compare score samples across experiments.
///
/// Samples for experiments outside `experiment_ids` are ignored. Scores are
/// treated as categorical when declared CATEGORICAL, numeric otherwise.
pub fn compare(
    experiment_ids: &[String],
    baseline_id: Option<&str>,
    samples: &[ScoreSample],
) -> ComparisonResult {
    let wanted: HashSet<&str> = experiment_ids.iter().map(String::as_str).collect();

    // score name -> (data type, experiment -> samples)
    let mut grouped: BTreeMap<&str, (ScoreDataType, BTreeMap<&str, Vec<&ScoreSample>>)> =
        BTreeMap::new();
    for sample in samples {
        if !wanted.contains(sample.experiment_id.as_str()) {
            continue;
        }
        grouped
            .entry(sample.name.as_str())
            .or_insert_with(|| (sample.data_type, BTreeMap::new()))
            .1
            .entry(sample.experiment_id.as_str())
            .or_default()
            .push(sample);
    }

    let mut scores = BTreeMap::new();
    for (name, (data_type, by_experiment)) in grouped {
        let experiments: BTreeMap<String, ScoreAggregate> = by_experiment
            .into_iter()
            .filter_map(|(experiment, samples)| {
                aggregate(data_type, &samples).map(|agg| (experiment.to_string(), agg))
            })
            .collect();
        if experiments.is_empty() {
            continue;
        }

        let mut diffs = BTreeMap::new();
        if let Some(base) = baseline_id.and_then(|b| experiments.get(b)) {
            for (experiment, current) in &experiments {
                if Some(experiment.as_str()) == baseline_id {
                    continue;
                }
                if let Some(d) = diff(base, current) {
                    diffs.insert(experiment.clone(), d);
                }
            }
        }

        scores.insert(
            name.to_string(),
            ScoreComparison {
                data_type,
                experiments,
                diffs,
            },
        );
    }

    ComparisonResult {
        experiment_ids: experiment_ids.to_vec(),
        baseline_id: baseline_id.map(str::to_string),
        scores,
    }
}

fn aggregate(data_type: ScoreDataType, samples: &[&ScoreSample]) -> Option<ScoreAggregate> {
    match data_type {
        ScoreDataType::Categorical => CategoryStats::from_labels(
            samples.iter().filter_map(|s| s.string_value.as_deref()),
        )
        .map(ScoreAggregate::Categorical),
        ScoreDataType::Numeric | ScoreDataType::Boolean => {
            let values: Vec<f64> = samples.iter().filter_map(|s| s.numeric()).collect();
            ScoreStats::from_values(&values).map(ScoreAggregate::Numeric)
        }
    }
}
