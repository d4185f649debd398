use crate::errors::Result;
use crate::model::{
    DeviceState, ResetRecord, SamplePage, TelemetrySample, TrendScope, TrendWindow,
};
use crate::store::CounterStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

const SAMPLE_COLUMNS: &str =
    "id, device_id, location, sub_location, in_count, out_count, capacity, event_time";

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(sqlx::FromRow)]
struct StateRow {
    id: i64,
    device_id: String,
    location: String,
    sub_location: String,
    in_count: i64,
    out_count: i64,
    capacity: i64,
    event_time: DateTime<Utc>,
    reset_time: Option<DateTime<Utc>>,
    reset_in_count: Option<i64>,
    reset_out_count: Option<i64>,
}

impl From<StateRow> for DeviceState {
    fn from(row: StateRow) -> Self {
        let reset = match (row.reset_time, row.reset_in_count, row.reset_out_count) {
            (Some(reset_time), Some(reset_in_count), Some(reset_out_count)) => Some(ResetRecord {
                device_id: row.device_id.clone(),
                reset_time,
                reset_in_count,
                reset_out_count,
            }),
            _ => None,
        };
        DeviceState {
            sample: TelemetrySample {
                id: row.id,
                device_id: row.device_id,
                location: row.location,
                sub_location: row.sub_location,
                in_count: row.in_count,
                out_count: row.out_count,
                capacity: row.capacity,
                event_time: row.event_time,
            },
            reset,
        }
    }
}

/// Postgres-backed counter store.
#[derive(Debug, Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn scope_filter(scope: &TrendScope) -> (&'static str, &str) {
    match scope {
        TrendScope::Device(id) => ("device_id", id.as_str()),
        TrendScope::Location(location) => ("location", location.as_str()),
    }
}

/// `LIMIT NULL` is no limit.
async fn select_samples(
    conn: &mut PgConnection,
    scope: &TrendScope,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: Option<i64>,
) -> Result<Vec<TelemetrySample>> {
    let (column, key) = scope_filter(scope);
    let query = format!(
        "SELECT {SAMPLE_COLUMNS} FROM people_counter_log
         WHERE {column} = $1 AND event_time >= $2 AND event_time < $3
         ORDER BY device_id, event_time, id
         LIMIT $4"
    );
    let samples = sqlx::query_as::<_, TelemetrySample>(&query)
        .bind(key)
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(conn)
        .await?;
    Ok(samples)
}

async fn count_samples(
    conn: &mut PgConnection,
    scope: &TrendScope,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<u64> {
    let (column, key) = scope_filter(scope);
    let query = format!(
        "SELECT COUNT(*) FROM people_counter_log
         WHERE {column} = $1 AND event_time >= $2 AND event_time < $3"
    );
    let total = sqlx::query_scalar::<_, i64>(&query)
        .bind(key)
        .bind(from)
        .bind(to)
        .fetch_one(conn)
        .await?;
    Ok(total.max(0) as u64)
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn insert_samples(&self, batch: &[TelemetrySample]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let device_ids: Vec<&str> = batch.iter().map(|s| s.device_id.as_str()).collect();
        let locations: Vec<&str> = batch.iter().map(|s| s.location.as_str()).collect();
        let sub_locations: Vec<&str> = batch.iter().map(|s| s.sub_location.as_str()).collect();
        let in_counts: Vec<i64> = batch.iter().map(|s| s.in_count).collect();
        let out_counts: Vec<i64> = batch.iter().map(|s| s.out_count).collect();
        let capacities: Vec<i64> = batch.iter().map(|s| s.capacity).collect();
        let event_times: Vec<DateTime<Utc>> = batch.iter().map(|s| s.event_time).collect();

        // WITH ORDINALITY keeps the batch order as insertion order.
        let query = r#"
            INSERT INTO people_counter_log
                (device_id, location, sub_location, in_count, out_count, capacity, event_time)
            SELECT device_id, location, sub_location, in_count, out_count, capacity, event_time
            FROM UNNEST($1::text[], $2::text[], $3::text[], $4::int8[], $5::int8[], $6::int8[], $7::timestamptz[])
                WITH ORDINALITY AS t(device_id, location, sub_location, in_count, out_count, capacity, event_time, ord)
            ORDER BY ord
            "#;

        let result = sqlx::query(query)
            .bind(&device_ids)
            .bind(&locations)
            .bind(&sub_locations)
            .bind(&in_counts)
            .bind(&out_counts)
            .bind(&capacities)
            .bind(&event_times)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn latest_sample(&self, device_id: &str) -> Result<Option<TelemetrySample>> {
        let query = format!(
            "SELECT {SAMPLE_COLUMNS} FROM people_counter_log
             WHERE device_id = $1
             ORDER BY event_time DESC, id DESC
             LIMIT 1"
        );
        let sample = sqlx::query_as::<_, TelemetrySample>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sample)
    }

    async fn latest_reset(&self, device_id: &str) -> Result<Option<ResetRecord>> {
        let reset = sqlx::query_as::<_, ResetRecord>(
            "SELECT device_id, reset_time, reset_in_count, reset_out_count
             FROM people_counter_resets
             WHERE device_id = $1
             ORDER BY reset_time DESC, id DESC
             LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(reset)
    }

    async fn append_reset(&self, reset: &ResetRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO people_counter_resets (device_id, reset_time, reset_in_count, reset_out_count)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&reset.device_id)
        .bind(reset.reset_time)
        .bind(reset.reset_in_count)
        .bind(reset.reset_out_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_states(&self, device_ids: Option<&[String]>) -> Result<Vec<DeviceState>> {
        // One statement, so sample and reset come from the same snapshot.
        let rows = sqlx::query_as::<_, StateRow>(
            r#"
            SELECT l.id, l.device_id, l.location, l.sub_location,
                   l.in_count, l.out_count, l.capacity, l.event_time,
                   r.reset_time, r.reset_in_count, r.reset_out_count
            FROM (
                SELECT DISTINCT ON (device_id) *
                FROM people_counter_log
                WHERE $1::text[] IS NULL OR device_id = ANY($1)
                ORDER BY device_id, event_time DESC, id DESC
            ) l
            LEFT JOIN LATERAL (
                SELECT reset_time, reset_in_count, reset_out_count
                FROM people_counter_resets
                WHERE device_id = l.device_id AND reset_time <= l.event_time
                ORDER BY reset_time DESC, id DESC
                LIMIT 1
            ) r ON TRUE
            ORDER BY l.device_id
            "#,
        )
        .bind(device_ids.map(<[String]>::to_vec))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DeviceState::from).collect())
    }

    async fn samples_in_range(
        &self,
        scope: &TrendScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<SamplePage> {
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let total = count_samples(&mut tx, scope, from, to).await?;
        let samples = select_samples(&mut tx, scope, from, to, limit).await?;

        tx.commit().await?;
        Ok(SamplePage { samples, total })
    }

    async fn resets_in_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ResetRecord>> {
        let resets = sqlx::query_as::<_, ResetRecord>(
            "SELECT device_id, reset_time, reset_in_count, reset_out_count
             FROM people_counter_resets
             WHERE device_id = $1 AND reset_time >= $2 AND reset_time < $3
             ORDER BY reset_time, id",
        )
        .bind(device_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(resets)
    }

    async fn trend_window(
        &self,
        scope: &TrendScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<TrendWindow> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let samples = select_samples(&mut tx, scope, from, to, None).await?;

        let mut device_ids: Vec<String> = samples.iter().map(|s| s.device_id.clone()).collect();
        device_ids.dedup();

        let resets = sqlx::query_as::<_, ResetRecord>(
            "SELECT device_id, reset_time, reset_in_count, reset_out_count
             FROM people_counter_resets
             WHERE device_id = ANY($1) AND reset_time < $2
             ORDER BY device_id, reset_time, id",
        )
        .bind(&device_ids)
        .bind(to)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(TrendWindow { samples, resets })
    }

    async fn distinct_devices(&self, location: &str) -> Result<Vec<String>> {
        let devices = sqlx::query_scalar::<_, String>(
            "SELECT device_id FROM people_counter_log WHERE location = $1
             UNION
             SELECT device_id FROM people_counter_log_archive WHERE location = $1
             ORDER BY device_id",
        )
        .bind(location)
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    async fn list_devices(&self) -> Result<Vec<String>> {
        let devices = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT device_id FROM people_counter_log ORDER BY device_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    async fn list_locations(&self) -> Result<Vec<String>> {
        let locations = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT location FROM people_counter_log ORDER BY location",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(locations)
    }

    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM people_counter_log
                WHERE event_time < $1
                RETURNING id, device_id, location, sub_location, in_count, out_count,
                          capacity, event_time, created_at
            )
            INSERT INTO people_counter_log_archive
                (id, device_id, location, sub_location, in_count, out_count,
                 capacity, event_time, created_at)
            SELECT * FROM moved
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
