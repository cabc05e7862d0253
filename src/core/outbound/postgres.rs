//! Slot store shared by every worker through Postgres.
//!
//! Each operation runs in one transaction that first takes a transaction
//! scoped advisory lock on the business's `slots:` key, so concurrent
//! workers serialize per business. Lease times come from the database clock.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;

use super::{
    AcquireOutcome, CapacityFn, OutboundSlot, ReleaseOutcome, SlotResult, SlotSnapshot, SlotStore,
    SlotStoreError, queue_key, slots_key,
};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_CONNECTIONS: u32 = 5;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS outbound_slots (
        slot_key TEXT NOT NULL,
        business_id TEXT NOT NULL,
        job_id TEXT NOT NULL,
        acquired_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        lease_expires_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (slot_key, job_id)
    )",
    "CREATE TABLE IF NOT EXISTS outbound_queue (
        id BIGSERIAL PRIMARY KEY,
        queue_key TEXT NOT NULL,
        job_id TEXT NOT NULL,
        UNIQUE (queue_key, job_id)
    )",
];

fn map_err(e: sqlx::Error) -> SlotStoreError {
    SlotStoreError::Unavailable(e.to_string())
}

fn lease_secs(lease: Duration) -> f64 {
    lease.as_secs_f64()
}

pub struct PostgresSlotStore {
    pool: PgPool,
}

impl PostgresSlotStore {
    pub async fn connect(database_url: &str) -> SlotResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(map_err)?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> SlotResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn locked(&self, business_id: &str) -> SlotResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(slots_key(business_id))
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        Ok(tx)
    }

    async fn count(
        tx: &mut Transaction<'static, Postgres>,
        business_id: &str,
    ) -> SlotResult<(usize, usize)> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM outbound_slots WHERE slot_key = $1) AS active,
                (SELECT COUNT(*) FROM outbound_queue WHERE queue_key = $2) AS queued",
        )
        .bind(slots_key(business_id))
        .bind(queue_key(business_id))
        .fetch_one(&mut **tx)
        .await
        .map_err(map_err)?;
        let active: i64 = row.try_get("active").map_err(map_err)?;
        let queued: i64 = row.try_get("queued").map_err(map_err)?;
        Ok((active as usize, queued as usize))
    }

    async fn insert_slot(
        tx: &mut Transaction<'static, Postgres>,
        business_id: &str,
        job_id: &str,
        lease: Duration,
    ) -> SlotResult<OutboundSlot> {
        let row = sqlx::query(
            "INSERT INTO outbound_slots (slot_key, business_id, job_id, lease_expires_at)
             VALUES ($1, $2, $3, now() + make_interval(secs => $4))
             RETURNING (EXTRACT(EPOCH FROM acquired_at) * 1000)::BIGINT AS acquired_at",
        )
        .bind(slots_key(business_id))
        .bind(business_id)
        .bind(job_id)
        .bind(lease_secs(lease))
        .fetch_one(&mut **tx)
        .await
        .map_err(map_err)?;
        let acquired_at: i64 = row.try_get("acquired_at").map_err(map_err)?;
        Ok(OutboundSlot {
            business_id: business_id.to_string(),
            job_id: job_id.to_string(),
            acquired_at: acquired_at as u64,
        })
    }

    async fn promote_next(
        tx: &mut Transaction<'static, Postgres>,
        business_id: &str,
        lease: Duration,
    ) -> SlotResult<Option<OutboundSlot>> {
        let next = sqlx::query(
            "DELETE FROM outbound_queue
             WHERE id = (SELECT id FROM outbound_queue WHERE queue_key = $1 ORDER BY id LIMIT 1)
             RETURNING job_id",
        )
        .bind(queue_key(business_id))
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_err)?;

        let Some(row) = next else {
            return Ok(None);
        };
        let job_id: String = row.try_get("job_id").map_err(map_err)?;
        Self::insert_slot(tx, business_id, &job_id, lease)
            .await
            .map(Some)
    }
}

#[async_trait]
impl SlotStore for PostgresSlotStore {
    async fn acquire(
        &self,
        business_id: &str,
        job_id: &str,
        capacity: usize,
        lease: Duration,
    ) -> SlotResult<AcquireOutcome> {
        let mut tx = self.locked(business_id).await?;

        let held = sqlx::query(
            "UPDATE outbound_slots SET lease_expires_at = now() + make_interval(secs => $3)
             WHERE slot_key = $1 AND job_id = $2
             RETURNING (EXTRACT(EPOCH FROM acquired_at) * 1000)::BIGINT AS acquired_at",
        )
        .bind(slots_key(business_id))
        .bind(job_id)
        .bind(lease_secs(lease))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;

        let outcome = if let Some(row) = held {
            let acquired_at: i64 = row.try_get("acquired_at").map_err(map_err)?;
            AcquireOutcome::AlreadyActive {
                slot: OutboundSlot {
                    business_id: business_id.to_string(),
                    job_id: job_id.to_string(),
                    acquired_at: acquired_at as u64,
                },
            }
        } else {
            let position = sqlx::query(
                "SELECT position FROM (
                    SELECT job_id, ROW_NUMBER() OVER (ORDER BY id) AS position
                    FROM outbound_queue WHERE queue_key = $1
                 ) ranked WHERE job_id = $2",
            )
            .bind(queue_key(business_id))
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?;

            if let Some(row) = position {
                let position: i64 = row.try_get("position").map_err(map_err)?;
                AcquireOutcome::Queued {
                    position: position as usize,
                }
            } else {
                let (active, queued) = Self::count(&mut tx, business_id).await?;
                if active < capacity && queued == 0 {
                    let slot = Self::insert_slot(&mut tx, business_id, job_id, lease).await?;
                    AcquireOutcome::Acquired { slot }
                } else {
                    sqlx::query("INSERT INTO outbound_queue (queue_key, job_id) VALUES ($1, $2)")
                        .bind(queue_key(business_id))
                        .bind(job_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(map_err)?;
                    AcquireOutcome::Queued {
                        position: queued + 1,
                    }
                }
            }
        };

        tx.commit().await.map_err(map_err)?;
        Ok(outcome)
    }

    async fn release(
        &self,
        business_id: &str,
        job_id: &str,
        lease: Duration,
    ) -> SlotResult<ReleaseOutcome> {
        let mut tx = self.locked(business_id).await?;

        let removed = sqlx::query("DELETE FROM outbound_slots WHERE slot_key = $1 AND job_id = $2")
            .bind(slots_key(business_id))
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?
            .rows_affected();
        let released = removed > 0;

        let promoted = if released {
            Self::promote_next(&mut tx, business_id, lease).await?
        } else {
            sqlx::query("DELETE FROM outbound_queue WHERE queue_key = $1 AND job_id = $2")
                .bind(queue_key(business_id))
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
            None
        };

        let (active_after, queued_after) = Self::count(&mut tx, business_id).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(ReleaseOutcome {
            released,
            promoted,
            active_after,
            queued_after,
        })
    }

    async fn heartbeat(&self, business_id: &str, job_id: &str, lease: Duration) -> SlotResult<bool> {
        let updated = sqlx::query(
            "UPDATE outbound_slots SET lease_expires_at = now() + make_interval(secs => $3)
             WHERE slot_key = $1 AND job_id = $2",
        )
        .bind(slots_key(business_id))
        .bind(job_id)
        .bind(lease_secs(lease))
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn reap_expired(
        &self,
        capacity: CapacityFn<'_>,
        lease: Duration,
    ) -> SlotResult<Vec<OutboundSlot>> {
        let rows = sqlx::query(
            "SELECT DISTINCT business_id FROM outbound_slots WHERE lease_expires_at <= now()",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut promoted = Vec::new();
        for row in rows {
            let business_id: String = row.try_get("business_id").map_err(map_err)?;
            let mut tx = self.locked(&business_id).await?;

            let reclaimed = sqlx::query(
                "DELETE FROM outbound_slots WHERE slot_key = $1 AND lease_expires_at <= now()",
            )
            .bind(slots_key(&business_id))
            .execute(&mut *tx)
            .await
            .map_err(map_err)?
            .rows_affected();
            if reclaimed > 0 {
                tracing::warn!(business_id, reclaimed, "reclaimed expired outbound slots");
            }

            let limit = capacity(&business_id);
            loop {
                let (active, _) = Self::count(&mut tx, &business_id).await?;
                if active >= limit {
                    break;
                }
                match Self::promote_next(&mut tx, &business_id, lease).await? {
                    Some(slot) => promoted.push(slot),
                    None => break,
                }
            }
            tx.commit().await.map_err(map_err)?;
        }
        Ok(promoted)
    }

    async fn snapshot(&self, business_id: &str) -> SlotResult<SlotSnapshot> {
        let active = sqlx::query("SELECT job_id FROM outbound_slots WHERE slot_key = $1 ORDER BY job_id")
            .bind(slots_key(business_id))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(|row| row.try_get::<String, _>("job_id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        let queued = sqlx::query("SELECT job_id FROM outbound_queue WHERE queue_key = $1 ORDER BY id")
            .bind(queue_key(business_id))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(|row| row.try_get::<String, _>("job_id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(SlotSnapshot { active, queued })
    }
}
