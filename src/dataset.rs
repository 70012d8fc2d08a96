//! Gathers historical records into an immutable training [`Dataset`].

use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{BuildError, SourceError};
use crate::records::{parse_flag, LabeledRecord, PatientFeatureSet};
use crate::source::{MigrationRow, RecordSource, RecordStore, SourceRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetOrigin {
    Primary,
    Fallback,
}

/// Ordered labeled records from a single source. Never mutated after `build`.
#[derive(Debug, Clone)]
pub struct Dataset {
    records: Vec<LabeledRecord>,
    unlabeled: Vec<PatientFeatureSet>,
    origin: DatasetOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub origin: DatasetOrigin,
    pub rows: usize,
    pub class_counts: BTreeMap<u8, usize>,
    pub unlabeled_rows: usize,
}

impl Dataset {
    pub fn records(&self) -> &[LabeledRecord] {
        &self.records
    }

    /// Rows with valid features but no usable outcome; kept for inference-only use.
    pub fn unlabeled(&self) -> &[PatientFeatureSet] {
        &self.unlabeled
    }

    pub fn origin(&self) -> DatasetOrigin {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn outcomes(&self) -> Vec<i32> {
        self.records.iter().map(|r| i32::from(r.outcome)).collect()
    }

    pub fn class_counts(&self) -> BTreeMap<u8, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.outcome).or_insert(0) += 1;
        }
        counts
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            origin: self.origin,
            rows: self.records.len(),
            class_counts: self.class_counts(),
            unlabeled_rows: self.unlabeled.len(),
        }
    }
}

/// Rows split by whether they can serve as training examples.
#[derive(Debug, Default)]
struct Partitioned {
    labeled: Vec<LabeledRecord>,
    unlabeled: Vec<PatientFeatureSet>,
    invalid: usize,
}

fn partition_rows(rows: Vec<SourceRow>) -> Partitioned {
    let mut out = Partitioned::default();
    for row in rows {
        let features = match row.input.validate() {
            Ok(f) => f,
            Err(e) => {
                debug!("dropping row {:?}: {}", row.id, e);
                out.invalid += 1;
                continue;
            }
        };
        match row.outcome.as_deref().and_then(parse_flag) {
            Some(outcome) => out.labeled.push(LabeledRecord { features, outcome }),
            None => out.unlabeled.push(features),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    pub min_outcome_classes: usize,
}

impl Default for DatasetBuilder {
    fn default() -> Self {
        DatasetBuilder {
            min_outcome_classes: 2,
        }
    }
}

impl DatasetBuilder {
    pub fn new(min_outcome_classes: usize) -> Self {
        DatasetBuilder {
            min_outcome_classes,
        }
    }

    async fn load<S: RecordSource>(source: &S, failures: &mut Vec<String>) -> Option<Partitioned> {
        match source.fetch_all().await {
            Ok(rows) => {
                let part = partition_rows(rows);
                info!(
                    "{}: {} labeled, {} unlabeled, {} invalid rows",
                    source.describe(),
                    part.labeled.len(),
                    part.unlabeled.len(),
                    part.invalid
                );
                if part.labeled.is_empty() {
                    failures.push(format!("{} has no labeled rows", source.describe()));
                    None
                } else {
                    Some(part)
                }
            }
            Err(e) => {
                warn!("{} unavailable: {}", source.describe(), e);
                failures.push(format!("{}: {}", source.describe(), e));
                None
            }
        }
    }

    /// Reads the primary source and falls back to the file source when the
    /// primary is unreachable or holds no labeled rows.
    pub async fn build<P, F>(&self, primary: &P, fallback: &F) -> Result<Dataset, BuildError>
    where
        P: RecordSource,
        F: RecordSource,
    {
        let mut failures = Vec::new();
        let (part, origin) = match Self::load(primary, &mut failures).await {
            Some(part) => (part, DatasetOrigin::Primary),
            None => {
                info!("falling back to {}", fallback.describe());
                match Self::load(fallback, &mut failures).await {
                    Some(part) => (part, DatasetOrigin::Fallback),
                    None => {
                        return Err(BuildError::DataUnavailable {
                            reason: failures.join("; "),
                        })
                    }
                }
            }
        };

        let dataset = Dataset {
            records: part.labeled,
            unlabeled: part.unlabeled,
            origin,
        };
        let classes = dataset.class_counts();
        info!("dataset class counts: {:?}", classes);
        if classes.len() < self.min_outcome_classes {
            return Err(BuildError::DataUnavailable {
                reason: format!(
                    "{} distinct outcome classes, need at least {}",
                    classes.len(),
                    self.min_outcome_classes
                ),
            });
        }
        Ok(dataset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    AlreadyPopulated { existing: usize },
    Migrated { inserted: usize, skipped: usize },
}

/// Copies the fallback file into the primary store unless the store already
/// holds more than `populated_threshold` labeled rows.
pub async fn migrate_fallback<S, F>(
    store: &S,
    fallback: &F,
    populated_threshold: usize,
) -> Result<MigrationOutcome, SourceError>
where
    S: RecordStore,
    F: RecordSource,
{
    let existing = store.count_labeled().await?;
    if existing > populated_threshold {
        info!(
            "{} already holds {} labeled rows; skipping migration",
            store.describe(),
            existing
        );
        return Ok(MigrationOutcome::AlreadyPopulated { existing });
    }

    let mut skipped = 0usize;
    let mut rows = Vec::new();
    for (idx, row) in fallback.fetch_all().await?.into_iter().enumerate() {
        match row.input.validate() {
            Ok(features) => rows.push(MigrationRow {
                name: format!("Patient {}", row.id.unwrap_or_else(|| (idx + 1).to_string())),
                features,
                outcome: row.outcome.as_deref().and_then(parse_flag),
            }),
            Err(e) => {
                skipped += 1;
                debug!("not migrating row {}: {}", idx + 1, e);
            }
        }
    }
    let inserted = store.insert_all(&rows).await?;
    info!("migrated {} rows into {}", inserted, store.describe());
    Ok(MigrationOutcome::Migrated { inserted, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::PatientInput;
    use crate::source::MemorySource;

    fn row(age: f64, outcome: Option<&str>) -> SourceRow {
        SourceRow {
            id: None,
            input: PatientInput {
                age: Some(age),
                gender: Some("Female".into()),
                hypertension: Some(0),
                heart_disease: Some(0),
                ever_married: Some("No".into()),
                work_type: Some("Private".into()),
                residence_type: Some("Rural".into()),
                avg_glucose_level: Some(88.0),
                bmi: Some(24.0),
                smoking_status: Some("never smoked".into()),
            },
            outcome: outcome.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_primary_preferred() {
        let primary = MemorySource::new(vec![row(40.0, Some("1")), row(50.0, Some("0"))]);
        let fallback = MemorySource::new(vec![row(60.0, Some("1"))]);
        let dataset = DatasetBuilder::default().build(&primary, &fallback).await.unwrap();
        assert_eq!(dataset.origin(), DatasetOrigin::Primary);
        assert_eq!(dataset.len(), 2);
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_unlabeled() {
        // "High Risk" is a scorer label, not an outcome
        let primary = MemorySource::new(vec![row(40.0, Some("High Risk")), row(41.0, None)]);
        let fallback = MemorySource::new(vec![
            row(60.0, Some("yes")),
            row(30.0, Some("false")),
            row(35.0, None),
        ]);
        let dataset = DatasetBuilder::default().build(&primary, &fallback).await.unwrap();
        assert_eq!(dataset.origin(), DatasetOrigin::Fallback);
        assert_eq!(dataset.outcomes(), vec![1, 0]);
        assert_eq!(dataset.unlabeled().len(), 1);
    }

    #[tokio::test]
    async fn test_no_data_anywhere() {
        let err = DatasetBuilder::default()
            .build(&MemorySource::empty(), &MemorySource::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::DataUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_single_class_is_degenerate() {
        let primary = MemorySource::new(vec![row(40.0, Some("0")), row(50.0, Some("no"))]);
        let err = DatasetBuilder::default()
            .build(&primary, &MemorySource::empty())
            .await
            .unwrap_err();
        let BuildError::DataUnavailable { reason } = err;
        assert!(reason.contains("1 distinct outcome classes"));
    }

    #[tokio::test]
    async fn test_invalid_rows_dropped() {
        let mut broken = row(70.0, Some("1"));
        broken.input.gender = None;
        let primary = MemorySource::new(vec![broken, row(40.0, Some("1")), row(50.0, Some("0"))]);
        let dataset = DatasetBuilder::default()
            .build(&primary, &MemorySource::empty())
            .await
            .unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.summary().class_counts.get(&1), Some(&1));
    }

    #[tokio::test]
    async fn test_migration_guard() {
        let store = MemorySource::new((0..11).map(|i| row(30.0 + i as f64, Some("0"))).collect());
        let fallback = MemorySource::new(vec![row(60.0, Some("1"))]);
        let outcome = migrate_fallback(&store, &fallback, 10).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::AlreadyPopulated { existing: 11 });
        assert_eq!(store.fetch_all().await.unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_migration_copies_rows() {
        let store = MemorySource::empty();
        let mut broken = row(70.0, Some("1"));
        broken.input.work_type = None;
        let fallback = MemorySource::new(vec![row(60.0, Some("Yes")), row(30.0, None), broken]);
        let outcome = migrate_fallback(&store, &fallback, 10).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Migrated { inserted: 2, skipped: 1 });
        assert_eq!(store.count_labeled().await.unwrap(), 1);
        let stored = store.fetch_all().await.unwrap();
        assert_eq!(stored[0].id.as_deref(), Some("Patient 1"));
        assert_eq!(stored[0].outcome.as_deref(), Some("1"));
    }
}
