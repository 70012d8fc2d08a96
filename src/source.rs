//! Record-source collaborators: where historical patient rows come from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::error::SourceError;
use crate::records::{normalize_header, Feature, PatientFeatureSet, PatientInput, OUTCOME_COLUMN};

/// A row as delivered by a source: features still unvalidated, outcome still raw text.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub id: Option<String>,
    pub input: PatientInput,
    pub outcome: Option<String>,
}

/// A validated row ready to be written into the primary store.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRow {
    pub name: String,
    pub features: PatientFeatureSet,
    pub outcome: Option<u8>,
}

#[allow(async_fn_in_trait)]
pub trait RecordSource {
    /// Short human-readable origin used in logs and reports.
    fn describe(&self) -> String;

    /// Every persisted row; may be empty.
    async fn fetch_all(&self) -> Result<Vec<SourceRow>, SourceError>;
}

/// A source that can also be written to, used when migrating the fallback file.
#[allow(async_fn_in_trait)]
pub trait RecordStore: RecordSource {
    async fn count_labeled(&self) -> Result<usize, SourceError>;

    async fn insert_all(&self, rows: &[MigrationRow]) -> Result<usize, SourceError>;
}

/// Delimited text file with a header row. Header names are matched up to case
/// and known aliases; the outcome column is optional.
#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
    delimiter: u8,
}

impl CsvFileSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        CsvFileSource {
            path: path.as_ref().to_path_buf(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<SourceRow>, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(self.delimiter)
            .flexible(true)
            .from_reader(bytes);

        let columns: HashMap<String, usize> = reader
            .headers()?
            .iter()
            .enumerate()
            .map(|(idx, name)| (normalize_header(name), idx))
            .collect();

        let present: Vec<Feature> = columns.keys().filter_map(|name| Feature::from_column(name)).collect();
        let missing: Vec<String> = Feature::ALL
            .iter()
            .filter(|f| !present.contains(f))
            .map(|f| f.name().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SourceError::MissingColumns(missing));
        }
        if !columns.contains_key(OUTCOME_COLUMN) {
            warn!(
                "{} has no outcome column; rows are usable for scoring only",
                self.path.display()
            );
        }

        let mut rows = Vec::new();
        let mut skipped = 0usize;
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let cell = |name: &str| columns.get(name).and_then(|&idx| record.get(idx));
            match PatientInput::from_cells(cell) {
                Ok(input) => rows.push(SourceRow {
                    id: cell("id").map(str::to_string),
                    input,
                    outcome: cell(OUTCOME_COLUMN)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                }),
                Err(e) => {
                    skipped += 1;
                    debug!("skipping data line {}: {}", line + 2, e);
                }
            }
        }
        if skipped > 0 {
            warn!("skipped {} malformed rows in {}", skipped, self.path.display());
        }
        Ok(rows)
    }
}

impl RecordSource for CsvFileSource {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn fetch_all(&self) -> Result<Vec<SourceRow>, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        let rows = self.parse(&bytes)?;
        info!("read {} rows from {}", rows.len(), self.path.display());
        Ok(rows)
    }
}

/// In-process store; stands in for the primary store when none is configured.
#[derive(Debug, Default)]
pub struct MemorySource {
    rows: Mutex<Vec<SourceRow>>,
}

impl MemorySource {
    pub fn new(rows: Vec<SourceRow>) -> Self {
        MemorySource {
            rows: Mutex::new(rows),
        }
    }

    pub fn empty() -> Self {
        MemorySource::default()
    }
}

impl RecordSource for MemorySource {
    fn describe(&self) -> String {
        "in-memory store".to_string()
    }

    async fn fetch_all(&self) -> Result<Vec<SourceRow>, SourceError> {
        Ok(self.rows.lock().await.clone())
    }
}

impl RecordStore for MemorySource {
    async fn count_labeled(&self) -> Result<usize, SourceError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| r.outcome.is_some())
            .count())
    }

    async fn insert_all(&self, rows: &[MigrationRow]) -> Result<usize, SourceError> {
        let mut stored = self.rows.lock().await;
        stored.extend(rows.iter().map(|row| SourceRow {
            id: Some(row.name.clone()),
            input: PatientInput::from(&row.features),
            outcome: row.outcome.map(|o| o.to_string()),
        }));
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str =
        "id,gender,age,hypertension,heart_disease,ever_married,work_type,Residence_type,avg_glucose_level,bmi,smoking_status,Stroke";

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_reads_case_variant_headers() {
        let file = write_file(&format!(
            "{HEADER}\n9046,Male,67,0,1,Yes,Private,Urban,228.69,36.6,formerly smoked,1\n51676,Female,61,0,0,Yes,Self-employed,Rural,202.21,N/A,never smoked,yes\n"
        ));
        let rows = CsvFileSource::new(file.path()).fetch_all().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id.as_deref(), Some("9046"));
        assert_eq!(rows[0].input.residence_type.as_deref(), Some("Urban"));
        assert_eq!(rows[1].input.bmi, None);
        assert_eq!(rows[1].outcome.as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn test_outcome_column_optional() {
        let file = write_file(
            "gender,age,hypertension,heart_disease,ever_married,work_type,residence_type,avg_glucose_level,bmi,smoking_status\nMale,40,0,0,No,Private,Urban,90,22,smokes\n",
        );
        let rows = CsvFileSource::new(file.path()).fetch_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].outcome, None);
    }

    #[tokio::test]
    async fn test_missing_columns_rejected() {
        let file = write_file("gender,age\nMale,40\n");
        let err = CsvFileSource::new(file.path()).fetch_all().await.unwrap_err();
        match err {
            SourceError::MissingColumns(cols) => assert!(cols.contains(&"bmi".to_string())),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_rows_skipped() {
        let file = write_file(&format!(
            "{HEADER}\n1,Male,old,0,1,Yes,Private,Urban,228.69,36.6,smokes,1\n2,Male,50,0,1,Yes,Private,Urban,128.69,26.6,smokes,0\n"
        ));
        let rows = CsvFileSource::new(file.path()).fetch_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_semicolon_delimiter() {
        let file = write_file(&format!(
            "{}\n3;Female;30;0;0;No;Private;Urban;80;20;never smoked;0\n",
            HEADER.replace(',', ";")
        ));
        let rows = CsvFileSource::new(file.path())
            .with_delimiter(b';')
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(rows[0].input.age, Some(30.0));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = CsvFileSource::new("/nonexistent/brain_stroke.csv")
            .fetch_all()
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[tokio::test]
    async fn test_memory_store_counts_labeled() {
        let store = MemorySource::empty();
        let features = PatientInput {
            age: Some(50.0),
            gender: Some("Male".into()),
            hypertension: Some(0),
            heart_disease: Some(0),
            ever_married: Some("Yes".into()),
            work_type: Some("Private".into()),
            residence_type: Some("Urban".into()),
            avg_glucose_level: Some(100.0),
            bmi: None,
            smoking_status: Some("smokes".into()),
        }
        .validate()
        .unwrap();
        let rows = vec![
            MigrationRow {
                name: "Patient 1".into(),
                features: features.clone(),
                outcome: Some(1),
            },
            MigrationRow {
                name: "Patient 2".into(),
                features,
                outcome: None,
            },
        ];
        assert_eq!(store.insert_all(&rows).await.unwrap(), 2);
        assert_eq!(store.count_labeled().await.unwrap(), 1);
        assert_eq!(store.fetch_all().await.unwrap().len(), 2);
    }
}
