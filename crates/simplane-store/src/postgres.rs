//! Postgres-backed store
//!
//! Admission takes a `FOR UPDATE` lock on the tenant row before counting the
//! tenant's active jobs, so concurrent admissions for one tenant serialize on
//! that row while different tenants proceed in parallel.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use simplane_common::config::StoreSettings;
use simplane_common::{
    Job, JobStatus, ResultLocation, StatusUpdate, StorageKind, Tenant, TenantLimits,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    check_transition, Admission, JobFilter, JobOrder, JobStore, StoreError, StoreResult,
    TenantStore,
};

/// Schema migrations, applied in order and recorded in `schema_migrations`
const MIGRATIONS: &[(i32, &str, &[&str])] = &[
    (
        1,
        "baseline_tables",
        &[
            "CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL UNIQUE,
                credential_hash TEXT NOT NULL UNIQUE,
                max_cpu INTEGER NOT NULL CHECK (max_cpu > 0),
                max_memory_gi INTEGER NOT NULL CHECK (max_memory_gi > 0),
                max_concurrent_jobs INTEGER NOT NULL CHECK (max_concurrent_jobs > 0),
                created_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS jobs (
                job_id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(tenant_id) ON DELETE CASCADE,
                unit_name TEXT NOT NULL UNIQUE,
                namespace TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('PENDING', 'RUNNING', 'SUCCEEDED', 'FAILED')),
                submitted_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ NULL,
                finished_at TIMESTAMPTZ NULL,
                observed_at TIMESTAMPTZ NULL,
                scenario JSONB NOT NULL DEFAULT '{}'::jsonb,
                cpu_request INTEGER NOT NULL CHECK (cpu_request > 0),
                memory_gi INTEGER NOT NULL CHECK (memory_gi > 0),
                status_message TEXT NULL,
                result_kind TEXT NULL,
                result_uri TEXT NULL,
                result_files JSONB NULL
            )",
        ],
    ),
    (
        2,
        "job_indexes",
        &[
            "CREATE INDEX IF NOT EXISTS idx_jobs_tenant_status ON jobs(tenant_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_submitted ON jobs(status, submitted_at)",
        ],
    ),
];

const JOB_COLUMNS: &str = "job_id, tenant_id, unit_name, namespace, status, submitted_at, \
     started_at, finished_at, observed_at, scenario, cpu_request, memory_gi, status_message, \
     result_kind, result_uri, result_files";

const TENANT_COLUMNS: &str =
    "tenant_id, namespace, credential_hash, max_cpu, max_memory_gi, max_concurrent_jobs, created_at";

fn is_unique_violation(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            Some(db_err.constraint().unwrap_or("unique").to_string())
        }
        _ => None,
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(column: &str, value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative: {value}")))
}

fn tenant_from_row(row: &PgRow) -> StoreResult<Tenant> {
    let get = |e: sqlx::Error| StoreError::database("decode_tenant", e);
    Ok(Tenant {
        tenant_id: row.try_get("tenant_id").map_err(get)?,
        namespace: row.try_get("namespace").map_err(get)?,
        credential_hash: row.try_get("credential_hash").map_err(get)?,
        limits: TenantLimits {
            max_cpu: to_u32("max_cpu", row.try_get("max_cpu").map_err(get)?)?,
            max_memory_gi: to_u32("max_memory_gi", row.try_get("max_memory_gi").map_err(get)?)?,
            max_concurrent_jobs: to_u32(
                "max_concurrent_jobs",
                row.try_get("max_concurrent_jobs").map_err(get)?,
            )?,
        },
        created_at: row.try_get("created_at").map_err(get)?,
    })
}

fn job_from_row(row: &PgRow) -> StoreResult<Job> {
    let get = |e: sqlx::Error| StoreError::database("decode_job", e);

    let status: String = row.try_get("status").map_err(get)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let scenario = match row.try_get::<serde_json::Value, _>("scenario").map_err(get)? {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(StoreError::Corrupt(format!(
                "scenario is not an object: {other}"
            )))
        }
    };

    let result_kind: Option<String> = row.try_get("result_kind").map_err(get)?;
    let result_uri: Option<String> = row.try_get("result_uri").map_err(get)?;
    let result_files: Option<serde_json::Value> = row.try_get("result_files").map_err(get)?;
    let result = match (result_kind, result_uri) {
        (Some(kind), Some(uri)) => {
            let kind = kind.parse::<StorageKind>().map_err(StoreError::Corrupt)?;
            let files = match result_files {
                Some(value) => serde_json::from_value::<Vec<String>>(value)
                    .map_err(|e| StoreError::Corrupt(format!("result_files: {e}")))?,
                None => Vec::new(),
            };
            Some(ResultLocation { kind, uri, files })
        }
        _ => None,
    };

    Ok(Job {
        job_id: row.try_get("job_id").map_err(get)?,
        tenant_id: row.try_get("tenant_id").map_err(get)?,
        unit_name: row.try_get("unit_name").map_err(get)?,
        namespace: row.try_get("namespace").map_err(get)?,
        status,
        submitted_at: row.try_get("submitted_at").map_err(get)?,
        started_at: row.try_get("started_at").map_err(get)?,
        finished_at: row.try_get("finished_at").map_err(get)?,
        observed_at: row.try_get("observed_at").map_err(get)?,
        scenario,
        cpu_request: to_u32("cpu_request", row.try_get("cpu_request").map_err(get)?)?,
        memory_gi: to_u32("memory_gi", row.try_get("memory_gi").map_err(get)?)?,
        status_message: row.try_get("status_message").map_err(get)?,
        result,
    })
}

/// Store backed by a Postgres connection pool
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with the configured pool bounds and apply migrations
    pub async fn connect(settings: &StoreSettings) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(settings.min_connections)
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(&settings.database_url)
            .await
            .map_err(|e| StoreError::database("connect", e))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool; call [`PostgresStore::migrate`] before use
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply outstanding schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        let db = |e| StoreError::database("migrate", e);

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db)?;

        let current: i32 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(db)?;

        for (version, name, statements) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            let mut tx = self.pool.begin().await.map_err(db)?;
            for statement in *statements {
                sqlx::query(statement).execute(&mut *tx).await.map_err(db)?;
            }
            sqlx::query(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES ($1, $2, $3)
                 ON CONFLICT (version) DO NOTHING",
            )
            .bind(*version)
            .bind(*name)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
            tx.commit().await.map_err(db)?;
            info!(version = *version, name = *name, "applied schema migration");
        }
        Ok(())
    }
}

#[async_trait]
impl TenantStore for PostgresStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO tenants (tenant_id, namespace, credential_hash, max_cpu, max_memory_gi,
                 max_concurrent_jobs, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&tenant.tenant_id)
        .bind(&tenant.namespace)
        .bind(&tenant.credential_hash)
        .bind(to_i32(tenant.limits.max_cpu))
        .bind(to_i32(tenant.limits.max_memory_gi))
        .bind(to_i32(tenant.limits.max_concurrent_jobs))
        .bind(tenant.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => match is_unique_violation(&e) {
                Some(constraint) if constraint.contains("namespace") => {
                    Err(StoreError::Conflict(format!(
                        "namespace {} is already assigned to another tenant",
                        tenant.namespace
                    )))
                }
                Some(constraint) if constraint.contains("credential") => {
                    Err(StoreError::Conflict("credential collision".to_string()))
                }
                Some(_) => Err(StoreError::Conflict(format!(
                    "tenant {} already exists",
                    tenant.tenant_id
                ))),
                None => Err(StoreError::database("insert_tenant", e)),
            },
        }
    }

    async fn get_tenant(&self, tenant_id: &str) -> StoreResult<Option<Tenant>> {
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE tenant_id = $1");
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("get_tenant", e))?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn find_tenant_by_credential(&self, credential_hash: &str) -> StoreResult<Option<Tenant>> {
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE credential_hash = $1");
        let row = sqlx::query(&sql)
            .bind(credential_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("find_tenant_by_credential", e))?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn update_limits(&self, tenant_id: &str, limits: &TenantLimits) -> StoreResult<Tenant> {
        let sql = format!(
            "UPDATE tenants SET max_cpu = $2, max_memory_gi = $3, max_concurrent_jobs = $4
             WHERE tenant_id = $1 RETURNING {TENANT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(to_i32(limits.max_cpu))
            .bind(to_i32(limits.max_memory_gi))
            .bind(to_i32(limits.max_concurrent_jobs))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("update_limits", e))?;
        match row {
            Some(row) => tenant_from_row(&row),
            None => Err(StoreError::NotFound {
                kind: "tenant",
                id: tenant_id.to_string(),
            }),
        }
    }

    async fn rotate_credential(&self, tenant_id: &str, credential_hash: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE tenants SET credential_hash = $2 WHERE tenant_id = $1")
            .bind(tenant_id)
            .bind(credential_hash)
            .execute(&self.pool)
            .await;
        match result {
            Ok(r) if r.rows_affected() == 0 => Err(StoreError::NotFound {
                kind: "tenant",
                id: tenant_id.to_string(),
            }),
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e).is_some() => {
                Err(StoreError::Conflict("credential collision".to_string()))
            }
            Err(e) => Err(StoreError::database("rotate_credential", e)),
        }
    }

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY created_at DESC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::database("list_tenants", e))?;
        rows.iter().map(tenant_from_row).collect()
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn admit_job(&self, job: &Job) -> StoreResult<Admission> {
        let db = |e| StoreError::database("admit_job", e);
        let mut tx = self.pool.begin().await.map_err(db)?;

        let limit: Option<i32> = sqlx::query_scalar(
            "SELECT max_concurrent_jobs FROM tenants WHERE tenant_id = $1 FOR UPDATE",
        )
        .bind(&job.tenant_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;
        let Some(limit) = limit else {
            return Err(StoreError::NotFound {
                kind: "tenant",
                id: job.tenant_id.clone(),
            });
        };
        let limit = to_u32("max_concurrent_jobs", limit)?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE tenant_id = $1 AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(&job.tenant_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;
        let active = u32::try_from(active).unwrap_or(u32::MAX);

        if active >= limit {
            tx.rollback().await.map_err(db)?;
            debug!(tenant = %job.tenant_id, active, limit, "admission rejected at ceiling");
            return Ok(Admission::Rejected { active, limit });
        }

        sqlx::query(
            "INSERT INTO jobs (job_id, tenant_id, unit_name, namespace, status, submitted_at,
                 scenario, cpu_request, memory_gi)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(job.job_id)
        .bind(&job.tenant_id)
        .bind(&job.unit_name)
        .bind(&job.namespace)
        .bind(job.status.as_str())
        .bind(job.submitted_at)
        .bind(serde_json::Value::Object(job.scenario.clone()))
        .bind(to_i32(job.cpu_request))
        .bind(to_i32(job.memory_gi))
        .execute(&mut *tx)
        .await
        .map_err(|e| match is_unique_violation(&e) {
            Some(_) => StoreError::Conflict(format!("job {} already exists", job.job_id)),
            None => db(e),
        })?;

        tx.commit().await.map_err(db)?;
        Ok(Admission::Admitted)
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_job_status(&self, job_id: Uuid, update: &StatusUpdate) -> StoreResult<bool> {
        check_transition(job_id, update)?;
        let result = sqlx::query(
            "UPDATE jobs SET
                 status = $3,
                 started_at = COALESCE(started_at, $4),
                 finished_at = COALESCE(finished_at, $5),
                 observed_at = COALESCE(observed_at, $6),
                 status_message = COALESCE($7, status_message)
             WHERE job_id = $1 AND status = $2",
        )
        .bind(job_id)
        .bind(update.expected.as_str())
        .bind(update.status.as_str())
        .bind(update.started_at)
        .bind(update.finished_at)
        .bind(update.observed_at)
        .bind(update.message.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("update_job_status", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_result_location(
        &self,
        job_id: Uuid,
        location: &ResultLocation,
    ) -> StoreResult<bool> {
        let files = serde_json::to_value(&location.files)
            .map_err(|e| StoreError::Corrupt(format!("result_files: {e}")))?;
        let result = sqlx::query(
            "UPDATE jobs SET result_kind = $2, result_uri = $3, result_files = $4
             WHERE job_id = $1 AND result_uri IS NULL AND status IN ('SUCCEEDED', 'FAILED')",
        )
        .bind(job_id)
        .bind(location.kind.as_str())
        .bind(&location.uri)
        .bind(files)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("set_result_location", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let direction = match filter.order {
            JobOrder::OldestFirst => "ASC",
            JobOrder::NewestFirst => "DESC",
        };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = ANY($1)
               AND ($2::TEXT IS NULL OR tenant_id = $2)
               AND (NOT $3 OR result_uri IS NULL)
             ORDER BY submitted_at {direction}
             LIMIT $4"
        );
        let statuses: Vec<String> = filter
            .effective_statuses()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query(&sql)
            .bind(statuses)
            .bind(filter.tenant_id.as_deref())
            .bind(filter.unresolved_only)
            .bind(i64::from(filter.limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::database("list_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn count_by_status(
        &self,
        tenant_id: Option<&str>,
    ) -> StoreResult<BTreeMap<JobStatus, u64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM jobs
             WHERE ($1::TEXT IS NULL OR tenant_id = $1)
             GROUP BY status",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database("count_by_status", e))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::database("count_by_status", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| StoreError::database("count_by_status", e))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            counts.insert(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database("ping", e))?;
        Ok(())
    }
}
