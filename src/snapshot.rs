//! Parquet snapshot of the processed feature frame, written for auditing how
//! records were encoded in a given run.

use std::fs::File;
use std::path::Path;

use log::info;
use polars::frame::DataFrame;
use polars::prelude::SerReader;
use polars::prelude::*;
use polars_io::parquet::{ParquetReader, ParquetWriter};

use crate::preprocess::FeatureMatrix;
use crate::records::{FeatureSchema, OUTCOME_COLUMN};

fn check_schema(df: &DataFrame) -> PolarsResult<()> {
    if df.schema() != FeatureSchema::processed_schema() {
        return Err(PolarsError::ComputeError(
            format!("frame columns {:?} do not match the processed schema", df.get_column_names()).into(),
        ));
    }
    Ok(())
}

/// Builds a frame with one Float64 column per feature plus the Int32 outcome,
/// and checks it against [`FeatureSchema::processed_schema`].
pub fn feature_frame(matrix: &FeatureMatrix, outcomes: &[i32]) -> PolarsResult<DataFrame> {
    if outcomes.len() != matrix.n_rows() {
        return Err(PolarsError::ShapeMismatch(
            format!("{} outcomes for {} rows", outcomes.len(), matrix.n_rows()).into(),
        ));
    }

    let mut columns: Vec<Series> = matrix
        .feature_names()
        .iter()
        .enumerate()
        .map(|(idx, name)| Series::new(name, matrix.column(idx)))
        .collect();
    columns.push(Series::new(OUTCOME_COLUMN, outcomes.to_vec()));
    let df = DataFrame::new(columns)?;
    check_schema(&df)?;
    Ok(df)
}

pub fn write_snapshot<P: AsRef<Path>>(path: P, matrix: &FeatureMatrix, outcomes: &[i32]) -> PolarsResult<()> {
    let mut df = feature_frame(matrix, outcomes)?;
    let mut file = File::create(path.as_ref())?;
    ParquetWriter::new(&mut file).finish(&mut df)?;
    info!("wrote {} processed rows to {:?}", df.height(), path.as_ref());
    Ok(())
}

/// Reads a snapshot back into feature rows and outcomes. Files whose columns
/// differ from the processed schema are rejected.
pub fn read_snapshot<P: AsRef<Path>>(path: P) -> PolarsResult<(FeatureMatrix, Vec<i32>)> {
    let file = File::open(path)?;
    let df = ParquetReader::new(file).finish()?;
    check_schema(&df)?;

    let names: Vec<String> = FeatureSchema::feature_names().iter().map(|s| s.to_string()).collect();
    let mut columns = Vec::with_capacity(names.len());
    for name in &names {
        let values: Vec<f64> = df.column(name)?.f64()?.into_no_null_iter().collect();
        columns.push(values);
    }
    let outcomes: Vec<i32> = df.column(OUTCOME_COLUMN)?.i32()?.into_no_null_iter().collect();
    let rows = (0..df.height())
        .map(|r| columns.iter().map(|c| c[r]).collect())
        .collect();
    Ok((FeatureMatrix::new(names, rows), outcomes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> FeatureMatrix {
        let names = FeatureSchema::feature_names().iter().map(|s| s.to_string()).collect();
        let rows = (0..4)
            .map(|r| (0..10).map(|c| r as f64 * 0.5 - c as f64).collect())
            .collect();
        FeatureMatrix::new(names, rows)
    }

    #[test]
    fn test_frame_matches_processed_schema() {
        let df = feature_frame(&matrix(), &[0, 1, 0, 1]).unwrap();
        assert_eq!(df.schema(), FeatureSchema::processed_schema());
        assert_eq!(df.height(), 4);
    }

    #[test]
    fn test_rejects_mismatched_outcomes() {
        assert!(feature_frame(&matrix(), &[0, 1]).is_err());
    }

    #[test]
    fn test_rejects_columns_outside_processed_schema() {
        let mut names: Vec<String> = FeatureSchema::feature_names().iter().map(|s| s.to_string()).collect();
        names[8] = "body_mass".to_string();
        let renamed = FeatureMatrix::new(names, matrix().rows().to_vec());
        let err = feature_frame(&renamed, &[0, 1, 0, 1]).unwrap_err();
        assert!(err.to_string().contains("processed schema"));
    }

    #[test]
    fn test_read_rejects_foreign_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.parquet");
        let mut df = DataFrame::new(vec![Series::new("age", vec![1.0f64, 2.0])]).unwrap();
        ParquetWriter::new(File::create(&path).unwrap()).finish(&mut df).unwrap();
        assert!(read_snapshot(&path).is_err());
    }

    #[test]
    fn test_snapshot_survives_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.parquet");
        write_snapshot(&path, &matrix(), &[1, 0, 0, 1]).unwrap();
        let (restored, outcomes) = read_snapshot(&path).unwrap();
        assert_eq!(restored, matrix());
        assert_eq!(outcomes, vec![1, 0, 0, 1]);
    }
}
