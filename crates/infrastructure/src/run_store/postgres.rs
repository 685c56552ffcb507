use std::time::Duration;

use async_trait::async_trait;
use autoreduce_core::{
    config::RecordStoreConfig,
    models::{ExperimentId, JobMessage, LogLocations, RunIdentity, RunRecord, RunStatus},
    traits::RunStateStore,
    AutoreduceError, Result,
};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Row};
use tracing::{debug, info, instrument};

const RECORD_COLUMNS: &str = "experiment_key, run_number, run_version, experiment_id, instrument, \
     status, retry_of_run, retry_of_version, retry_run, retry_run_version, retry_at, cancelled, \
     message, log_locations, output_directory, job, created_at, updated_at";

const IDENTITY_FILTER: &str = "experiment_key = $1 AND run_number = $2 AND run_version = $3";

/// PostgreSQL运行记录存储
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &RecordStoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!("成功连接到记录数据库");
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// 创建运行记录表
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reduction_runs (
                experiment_key TEXT NOT NULL,
                run_number BIGINT NOT NULL,
                run_version INTEGER NOT NULL,
                experiment_id JSONB NOT NULL,
                instrument VARCHAR(64) NOT NULL,
                status VARCHAR(16) NOT NULL,
                retry_of_run BIGINT,
                retry_of_version INTEGER,
                retry_run BIGINT,
                retry_run_version INTEGER,
                retry_at TIMESTAMPTZ,
                cancelled BOOLEAN NOT NULL DEFAULT FALSE,
                message TEXT,
                log_locations JSONB,
                output_directory TEXT,
                job JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (experiment_key, run_number, run_version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<RunRecord> {
        let experiment = experiment_from_key(row.try_get("experiment_key")?);
        let status: String = row.try_get("status")?;
        let Json(experiment_id): Json<ExperimentId> = row.try_get("experiment_id")?;
        let Json(job): Json<JobMessage> = row.try_get("job")?;
        let log_locations: Option<Json<LogLocations>> = row.try_get("log_locations")?;

        Ok(RunRecord {
            identity: identity_from(
                &experiment,
                row.try_get("run_number")?,
                row.try_get("run_version")?,
            )?,
            experiment_id,
            instrument: row.try_get("instrument")?,
            status: status.parse()?,
            retry_of: optional_identity(
                &experiment,
                row.try_get("retry_of_run")?,
                row.try_get("retry_of_version")?,
            )?,
            retry_run: optional_identity(
                &experiment,
                row.try_get("retry_run")?,
                row.try_get("retry_run_version")?,
            )?,
            retry_at: row.try_get("retry_at")?,
            cancelled: row.try_get("cancelled")?,
            message: row.try_get("message")?,
            log_locations: log_locations.map(|Json(l)| l),
            output_directory: row.try_get("output_directory")?,
            job,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// 规范化实验编号的文本形式; 整数形式的字符串与整数得到同一个键
fn experiment_key(experiment: &ExperimentId) -> String {
    experiment.normalized().to_string()
}

fn experiment_from_key(key: String) -> ExperimentId {
    ExperimentId::Text(key).normalized()
}

fn identity_from(
    experiment: &ExperimentId,
    run_number: i64,
    run_version: i32,
) -> Result<RunIdentity> {
    let run_number = u64::try_from(run_number)
        .map_err(|_| AutoreduceError::Internal(format!("无效的运行号: {run_number}")))?;
    let run_version = u32::try_from(run_version)
        .map_err(|_| AutoreduceError::Internal(format!("无效的版本号: {run_version}")))?;
    Ok(RunIdentity::new(experiment.clone(), run_number, run_version))
}

fn optional_identity(
    experiment: &ExperimentId,
    run_number: Option<i64>,
    run_version: Option<i32>,
) -> Result<Option<RunIdentity>> {
    match (run_number, run_version) {
        (Some(n), Some(v)) => identity_from(experiment, n, v).map(Some),
        _ => Ok(None),
    }
}

/// 运行标识对应的主键列值
struct RowKey {
    experiment: String,
    run_number: i64,
    run_version: i32,
}

impl RowKey {
    fn of(identity: &RunIdentity) -> Result<Self> {
        Ok(Self {
            experiment: experiment_key(&identity.experiment),
            run_number: i64::try_from(identity.run_number).map_err(|_| {
                AutoreduceError::Internal(format!("运行号超出范围: {}", identity.run_number))
            })?,
            run_version: i32::try_from(identity.run_version).map_err(|_| {
                AutoreduceError::Internal(format!("版本号超出范围: {}", identity.run_version))
            })?,
        })
    }
}

fn not_found(identity: &RunIdentity) -> AutoreduceError {
    AutoreduceError::RunNotFound {
        identity: identity.clone(),
    }
}

#[async_trait]
impl RunStateStore for PostgresRunStore {
    #[instrument(skip(self, job), fields(run_number = job.run_number, run_version = job.run_version))]
    async fn create_run(&self, job: &JobMessage) -> Result<RunRecord> {
        let identity = job.identity();
        let key = RowKey::of(&identity)?;
        let record = RunRecord::queued(job);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO reduction_runs
                (experiment_key, run_number, run_version, experiment_id, instrument, status, job)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (experiment_key, run_number, run_version) DO NOTHING
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(&key.experiment)
        .bind(key.run_number)
        .bind(key.run_version)
        .bind(Json(&record.experiment_id))
        .bind(&record.instrument)
        .bind(record.status.as_str())
        .bind(Json(&record.job))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                debug!("创建运行记录: {}", identity);
                Self::row_to_record(&row)
            }
            None => Err(AutoreduceError::DuplicateRun { identity }),
        }
    }

    #[instrument(skip(self, identity), fields(run = %identity))]
    async fn find_run(&self, identity: &RunIdentity) -> Result<Option<RunRecord>> {
        let key = RowKey::of(identity)?;
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM reduction_runs WHERE {IDENTITY_FILTER}"
        ))
        .bind(&key.experiment)
        .bind(key.run_number)
        .bind(key.run_version)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    #[instrument(skip(self, identity, message), fields(run = %identity))]
    async fn update_status(
        &self,
        identity: &RunIdentity,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<()> {
        let key = RowKey::of(identity)?;
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar(&format!(
            "SELECT status FROM reduction_runs WHERE {IDENTITY_FILTER} FOR UPDATE"
        ))
        .bind(&key.experiment)
        .bind(key.run_number)
        .bind(key.run_version)
        .fetch_optional(&mut *tx)
        .await?;

        let current: RunStatus = current.ok_or_else(|| not_found(identity))?.parse()?;
        if !current.can_transition_to(status) {
            return Err(AutoreduceError::Internal(format!(
                "{identity} 无法从 {current} 转换到 {status}"
            )));
        }

        sqlx::query(&format!(
            "UPDATE reduction_runs SET status = $4, message = COALESCE($5, message), \
             updated_at = NOW() WHERE {IDENTITY_FILTER}"
        ))
        .bind(&key.experiment)
        .bind(key.run_number)
        .bind(key.run_version)
        .bind(status.as_str())
        .bind(message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, identity, logs), fields(run = %identity))]
    async fn record_output(
        &self,
        identity: &RunIdentity,
        logs: Option<LogLocations>,
        output_directory: Option<String>,
    ) -> Result<()> {
        let key = RowKey::of(identity)?;
        let result = sqlx::query(&format!(
            "UPDATE reduction_runs SET log_locations = $4, output_directory = $5, \
             updated_at = NOW() WHERE {IDENTITY_FILTER}"
        ))
        .bind(&key.experiment)
        .bind(key.run_number)
        .bind(key.run_version)
        .bind(logs.map(Json))
        .bind(output_directory)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(identity));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_max_version(
        &self,
        experiment_id: &ExperimentId,
        run_number: u64,
    ) -> Result<Option<u32>> {
        let run_number = i64::try_from(run_number)
            .map_err(|_| AutoreduceError::Internal(format!("运行号超出范围: {run_number}")))?;

        let max: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(run_version) FROM reduction_runs WHERE experiment_key = $1 AND run_number = $2",
        )
        .bind(experiment_key(experiment_id))
        .bind(run_number)
        .fetch_one(&self.pool)
        .await?;

        max.map(|v| {
            u32::try_from(v).map_err(|_| AutoreduceError::Internal(format!("无效的版本号: {v}")))
        })
        .transpose()
    }

    #[instrument(skip(self, identity, retry_identity), fields(run = %identity, retry = %retry_identity))]
    async fn link_retry(
        &self,
        identity: &RunIdentity,
        retry_identity: &RunIdentity,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        if identity.experiment != retry_identity.experiment {
            return Err(AutoreduceError::Internal(format!(
                "重试 {retry_identity} 与 {identity} 不属于同一实验"
            )));
        }
        let key = RowKey::of(identity)?;
        let retry_key = RowKey::of(retry_identity)?;
        let mut tx = self.pool.begin().await?;

        let original = sqlx::query(&format!(
            "UPDATE reduction_runs SET retry_run = $4, retry_run_version = $5, retry_at = $6, \
             updated_at = NOW() WHERE {IDENTITY_FILTER}"
        ))
        .bind(&key.experiment)
        .bind(key.run_number)
        .bind(key.run_version)
        .bind(retry_key.run_number)
        .bind(retry_key.run_version)
        .bind(retry_at)
        .execute(&mut *tx)
        .await?;
        if original.rows_affected() == 0 {
            return Err(not_found(identity));
        }

        let retry = sqlx::query(&format!(
            "UPDATE reduction_runs SET retry_of_run = $4, retry_of_version = $5, retry_at = $6, \
             updated_at = NOW() WHERE {IDENTITY_FILTER}"
        ))
        .bind(&retry_key.experiment)
        .bind(retry_key.run_number)
        .bind(retry_key.run_version)
        .bind(key.run_number)
        .bind(key.run_version)
        .bind(retry_at)
        .execute(&mut *tx)
        .await?;
        if retry.rows_affected() == 0 {
            return Err(not_found(retry_identity));
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, identity), fields(run = %identity))]
    async fn clear_retry(&self, identity: &RunIdentity) -> Result<()> {
        let key = RowKey::of(identity)?;
        let result = sqlx::query(&format!(
            "UPDATE reduction_runs SET retry_at = NULL, updated_at = NOW() WHERE {IDENTITY_FILTER}"
        ))
        .bind(&key.experiment)
        .bind(key.run_number)
        .bind(key.run_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(identity));
        }
        Ok(())
    }

    #[instrument(skip(self, identity), fields(run = %identity))]
    async fn mark_cancelled(&self, identity: &RunIdentity) -> Result<()> {
        let key = RowKey::of(identity)?;
        let result = sqlx::query(&format!(
            "UPDATE reduction_runs SET cancelled = TRUE, updated_at = NOW() WHERE {IDENTITY_FILTER}"
        ))
        .bind(&key.experiment)
        .bind(key.run_number)
        .bind(key.run_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(identity));
        }
        Ok(())
    }
}
