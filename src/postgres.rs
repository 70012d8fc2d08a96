//! PostgreSQL-backed primary record store.

use log::{error, info};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};

use crate::error::SourceError;
use crate::records::PatientInput;
use crate::source::{MigrationRow, RecordSource, RecordStore, SourceRow};

const CREATE_PATIENTS: &str = "CREATE TABLE IF NOT EXISTS patients (
    id SERIAL PRIMARY KEY,
    name VARCHAR(100) NOT NULL,
    age DOUBLE PRECISION NOT NULL,
    gender VARCHAR(10) NOT NULL,
    hypertension INTEGER NOT NULL,
    heart_disease INTEGER NOT NULL,
    ever_married VARCHAR(5) NOT NULL,
    work_type VARCHAR(50) NOT NULL,
    residence_type VARCHAR(10) NOT NULL,
    avg_glucose_level DOUBLE PRECISION NOT NULL,
    bmi DOUBLE PRECISION,
    smoking_status VARCHAR(50) NOT NULL,
    stroke_prediction VARCHAR(50),
    validated BOOLEAN DEFAULT FALSE,
    created_by VARCHAR(80) NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

// Casts keep the row decoding independent of the exact column types.
const SELECT_PATIENTS: &str = "SELECT id::text AS id, age::float8 AS age, gender,
        hypertension::int4 AS hypertension, heart_disease::int4 AS heart_disease,
        ever_married, work_type, residence_type,
        avg_glucose_level::float8 AS avg_glucose_level, bmi::float8 AS bmi,
        smoking_status, stroke_prediction::text AS stroke_prediction
    FROM patients ORDER BY id";

const COUNT_LABELED: &str = "SELECT COUNT(*) FROM patients WHERE stroke_prediction IS NOT NULL";

const INSERT_PATIENT: &str = "INSERT INTO patients (name, age, gender, hypertension, heart_disease,
        ever_married, work_type, residence_type, avg_glucose_level, bmi, smoking_status,
        stroke_prediction, validated, created_by)
    VALUES ($1::text, $2::float8, $3::text, $4::int4, $5::int4, $6::text, $7::text, $8::text,
        $9::float8, $10::float8, $11::text, $12::text, $13::bool, $14::text)";

pub const MIGRATION_AUTHOR: &str = "migration_script";

pub struct PgRecordStore {
    client: Mutex<Client>,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, SourceError> {
        info!("Connecting to PostgreSQL record store...");
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("record store connection error: {}", e);
            }
        });
        client.query_one("SELECT 1", &[]).await?;
        info!("Record store connection initialized successfully.");
        Ok(PgRecordStore {
            client: Mutex::new(client),
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), SourceError> {
        self.client.lock().await.batch_execute(CREATE_PATIENTS).await?;
        Ok(())
    }
}

fn flag(row: &Row, column: &str) -> Result<Option<u8>, tokio_postgres::Error> {
    let value: Option<i32> = row.try_get(column)?;
    Ok(value.and_then(|v| u8::try_from(v).ok()))
}

fn decode_row(row: &Row) -> Result<SourceRow, tokio_postgres::Error> {
    Ok(SourceRow {
        id: row.try_get("id")?,
        input: PatientInput {
            age: row.try_get("age")?,
            gender: row.try_get("gender")?,
            hypertension: flag(row, "hypertension")?,
            heart_disease: flag(row, "heart_disease")?,
            ever_married: row.try_get("ever_married")?,
            work_type: row.try_get("work_type")?,
            residence_type: row.try_get("residence_type")?,
            avg_glucose_level: row.try_get("avg_glucose_level")?,
            bmi: row.try_get("bmi")?,
            smoking_status: row.try_get("smoking_status")?,
        },
        outcome: row.try_get("stroke_prediction")?,
    })
}

impl RecordSource for PgRecordStore {
    fn describe(&self) -> String {
        "postgres table patients".to_string()
    }

    async fn fetch_all(&self) -> Result<Vec<SourceRow>, SourceError> {
        let rows = self.client.lock().await.query(SELECT_PATIENTS, &[]).await?;
        let decoded = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(decoded)
    }
}

impl RecordStore for PgRecordStore {
    async fn count_labeled(&self) -> Result<usize, SourceError> {
        let row = self.client.lock().await.query_one(COUNT_LABELED, &[]).await?;
        let count: i64 = row.try_get(0)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn insert_all(&self, rows: &[MigrationRow]) -> Result<usize, SourceError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let statement = tx.prepare(INSERT_PATIENT).await?;
        for row in rows {
            let p = &row.features;
            let outcome = row.outcome.map(|o| o.to_string());
            tx.execute(
                &statement,
                &[
                    &row.name,
                    &p.age,
                    &p.gender,
                    &i32::from(p.hypertension),
                    &i32::from(p.heart_disease),
                    &p.ever_married,
                    &p.work_type,
                    &p.residence_type,
                    &p.avg_glucose_level,
                    &p.bmi,
                    &p.smoking_status,
                    &outcome,
                    &true,
                    &MIGRATION_AUTHOR,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }
}
