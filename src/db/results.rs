// Result persistence.
//
// Every algorithm result a processor delivers is written once, keyed by the
// window it was computed for. Reads are by algorithm identity.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::Db;
use crate::model::{AlgorithmResult, ResultData, Window};
use crate::types::WindowId;

/// Where delivered results end up.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(
        &self,
        window_id: &WindowId,
        window: &Window,
        result: &AlgorithmResult,
    ) -> Result<()>;
}

/// A stored result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub window_id: String,
    pub window_type_name: String,
    pub window_type_version: String,
    pub time_from: i64,
    pub time_to: i64,
    pub origin: String,
    pub algorithm_name: String,
    pub algorithm_version: String,
    pub status: String,
    #[serde(default)]
    pub single_value: Option<f64>,
    #[serde(default)]
    pub float_values: Vec<f64>,
    /// JSON text of a struct payload.
    #[serde(default)]
    pub struct_value: Option<String>,
    pub timestamp: i64,
}

impl ResultRecord {
    pub fn new(window_id: &WindowId, window: &Window, result: &AlgorithmResult) -> Result<Self> {
        let (single_value, float_values, struct_value) = match &result.result.result_data {
            Some(ResultData::SingleValue(v)) => (Some(f64::from(*v)), Vec::new(), None),
            Some(ResultData::FloatValues(array)) => (
                None,
                array.values.iter().copied().map(f64::from).collect(),
                None,
            ),
            Some(ResultData::StructValue(map)) => (
                None,
                Vec::new(),
                Some(serde_json::Value::Object(map.clone()).to_string()),
            ),
            None => (None, Vec::new(), None),
        };

        let time_from = i64::try_from(window.time_from)
            .with_context(|| format!("time_from {} out of range", window.time_from))?;
        let time_to = i64::try_from(window.time_to)
            .with_context(|| format!("time_to {} out of range", window.time_to))?;

        Ok(Self {
            window_id: window_id.to_string(),
            window_type_name: window.window_type_name.clone(),
            window_type_version: window.window_type_version.clone(),
            time_from,
            time_to,
            origin: window.origin.clone(),
            algorithm_name: result.algorithm.name.clone(),
            algorithm_version: result.algorithm.version.clone(),
            status: result.result.status.as_str().to_string(),
            single_value,
            float_values,
            struct_value,
            timestamp: result.result.timestamp,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Deserialize)]
struct StatusCount {
    status: String,
    count: u64,
}

pub struct ResultStore {
    db: Db,
}

impl ResultStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn insert(&self, record: ResultRecord) -> Result<()> {
        self.db
            .query("CREATE result CONTENT $record")
            .bind(("record", record))
            .await?
            .check()?;
        Ok(())
    }

    /// Results of one algorithm version, oldest window first.
    pub async fn results_for_algorithm(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Vec<ResultRecord>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT window_id, window_type_name, window_type_version, time_from, time_to,
                       origin, algorithm_name, algorithm_version, status, single_value,
                       float_values, struct_value, timestamp
                FROM result
                WHERE algorithm_name = $name AND algorithm_version = $version
                ORDER BY time_from ASC
                "#,
            )
            .bind(("name", name.to_owned()))
            .bind(("version", version.to_owned()))
            .await?;

        let records: Vec<ResultRecord> = res.take(0)?;
        Ok(records)
    }

    pub async fn results_for_window(&self, window_id: &WindowId) -> Result<Vec<ResultRecord>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT window_id, window_type_name, window_type_version, time_from, time_to,
                       origin, algorithm_name, algorithm_version, status, single_value,
                       float_values, struct_value, timestamp
                FROM result
                WHERE window_id = $window_id
                ORDER BY algorithm_name ASC
                "#,
            )
            .bind(("window_id", window_id.to_string()))
            .await?;

        let records: Vec<ResultRecord> = res.take(0)?;
        Ok(records)
    }

    pub async fn stats(&self) -> Result<ResultStats> {
        let mut res = self
            .db
            .query("SELECT status, count() AS count FROM result GROUP BY status")
            .await?;
        let rows: Vec<StatusCount> = res.take(0)?;

        let mut stats = ResultStats::default();
        for row in rows {
            stats.total += row.count;
            stats.by_status.insert(row.status, row.count);
        }
        Ok(stats)
    }
}

#[async_trait]
impl ResultSink for ResultStore {
    async fn record(
        &self,
        window_id: &WindowId,
        window: &Window,
        result: &AlgorithmResult,
    ) -> Result<()> {
        self.insert(ResultRecord::new(window_id, window, result)?).await
    }
}
