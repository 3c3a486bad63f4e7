//! Host record store backed by the host application's own tables.
//!
//! `information_object`, `slug` and `digital_object` belong to the host schema;
//! kiln only reads records and inserts digital objects.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use kiln_core::{Error, HostRecord, HostRecordStore, NewDigitalObject, Result};

/// PostgreSQL implementation of [`HostRecordStore`].
#[derive(Clone)]
pub struct PgHostRecordStore {
    pool: Pool<Postgres>,
}

impl PgHostRecordStore {
    /// Create a new PgHostRecordStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HostRecordStore for PgHostRecordStore {
    async fn find_record(&self, record_id: i64) -> Result<Option<HostRecord>> {
        let row = sqlx::query(
            "SELECT io.id AS id, s.slug AS slug
             FROM information_object io
             LEFT JOIN slug s ON s.object_id = io.id
             WHERE io.id = $1
             LIMIT 1",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(|r| -> Result<HostRecord> {
            Ok(HostRecord {
                id: r.try_get("id")?,
                slug: r.try_get("slug")?,
            })
        })
        .transpose()
    }

    // Derivatives hang off their master via parent_id and carry no object_id,
    // so any row linked to the record is a master.
    async fn has_master_object(&self, record_id: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM digital_object
                 WHERE object_id = $1
             )",
        )
        .bind(record_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(exists)
    }

    async fn insert_digital_object(&self, object: NewDigitalObject) -> Result<i64> {
        let checksum_type = object.checksum.as_ref().map(|_| "md5");

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO digital_object (object_id, parent_id, usage_id, mime_type, byte_size,
                                         checksum, checksum_type, name, path, sequence,
                                         created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
             RETURNING id",
        )
        .bind(object.record_id)
        .bind(object.parent_id)
        .bind(object.usage.term_id())
        .bind(&object.mime_type)
        .bind(object.byte_size)
        .bind(&object.checksum)
        .bind(checksum_type)
        .bind(&object.name)
        .bind(&object.path)
        .bind(object.sequence)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "host",
            op = "insert_digital_object",
            object_id = id,
            usage = ?object.usage,
            path = %object.path,
            "Digital object inserted"
        );
        Ok(id)
    }
}
