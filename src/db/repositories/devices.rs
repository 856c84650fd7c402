use crate::db::models::{Camera, CameraKey, DeviceStatus, Gateway, Tag, Upserted};
use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct GatewayRow {
    #[sqlx(flatten)]
    gateway: Gateway,
    inserted: bool,
}

#[derive(sqlx::FromRow)]
struct TagRow {
    #[sqlx(flatten)]
    tag: Tag,
    inserted: bool,
}

#[derive(sqlx::FromRow)]
struct CameraRow {
    #[sqlx(flatten)]
    camera: Camera,
    inserted: bool,
}

/// Identity records for gateways, tags, cameras and collectors
#[derive(Clone)]
pub struct DevicesRepository {
    pool: Arc<PgPool>,
}

impl DevicesRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Insert or refresh a gateway. `xmax = 0` is true only for the inserting statement.
    pub async fn upsert_gateway(&self, mac: &str, seen_at: DateTime<Utc>) -> Result<Upserted<Gateway>> {
        let row = sqlx::query_as::<_, GatewayRow>(
            r#"
            INSERT INTO gateways (id, mac_address, status, last_seen_at, created_at, updated_at)
            VALUES ($1, $2, 'online', $3, NOW(), NOW())
            ON CONFLICT (mac_address) DO UPDATE
            SET last_seen_at = GREATEST(gateways.last_seen_at, EXCLUDED.last_seen_at),
                status = 'online',
                updated_at = NOW()
            RETURNING id, mac_address, status, last_seen_at, tenant_id, building_id, floor_id,
                      created_at, updated_at, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(mac)
        .bind(seen_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert gateway {}: {}", mac, e)))?;

        Ok(Upserted { record: row.gateway, created: row.inserted })
    }

    pub async fn set_gateway_status(&self, id: Uuid, status: DeviceStatus) -> Result<()> {
        sqlx::query("UPDATE gateways SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to update gateway status: {}", e)))?;
        debug!("Gateway {} marked {}", id, status);
        Ok(())
    }

    pub async fn list_gateways(&self) -> Result<Vec<Gateway>> {
        let result = sqlx::query_as::<_, Gateway>(
            r#"
            SELECT id, mac_address, status, last_seen_at, tenant_id, building_id, floor_id, created_at, updated_at
            FROM gateways
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list gateways: {}", e)))?;

        Ok(result)
    }

    pub async fn upsert_tag(&self, mac: &str, seen_at: DateTime<Utc>) -> Result<Upserted<Tag>> {
        let row = sqlx::query_as::<_, TagRow>(
            r#"
            INSERT INTO tags (id, mac_address, last_seen_at, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (mac_address) DO UPDATE
            SET last_seen_at = GREATEST(tags.last_seen_at, EXCLUDED.last_seen_at)
            RETURNING id, mac_address, person_id, last_seen_at, created_at, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(mac)
        .bind(seen_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert tag {}: {}", mac, e)))?;

        Ok(Upserted { record: row.tag, created: row.inserted })
    }

    pub async fn list_tags(&self) -> Result<Vec<Tag>> {
        let result = sqlx::query_as::<_, Tag>(
            "SELECT id, mac_address, person_id, last_seen_at, created_at FROM tags",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list tags: {}", e)))?;

        Ok(result)
    }

    pub async fn upsert_camera(
        &self,
        key: &CameraKey,
        status: DeviceStatus,
        info: Option<serde_json::Value>,
        seen_at: DateTime<Utc>,
    ) -> Result<Upserted<Camera>> {
        let row = sqlx::query_as::<_, CameraRow>(
            r#"
            INSERT INTO cameras (id, tenant, building, floor, code, status, last_seen_at, info, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            ON CONFLICT (tenant, building, floor, code) DO UPDATE
            SET status = EXCLUDED.status,
                last_seen_at = GREATEST(cameras.last_seen_at, EXCLUDED.last_seen_at),
                info = COALESCE(EXCLUDED.info, cameras.info),
                updated_at = NOW()
            RETURNING id, tenant, building, floor, code, status, last_seen_at, info, created_at, updated_at,
                      (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&key.tenant)
        .bind(&key.building)
        .bind(&key.floor)
        .bind(&key.code)
        .bind(status)
        .bind(seen_at)
        .bind(info.map(Json))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert camera {}: {}", key, e)))?;

        Ok(Upserted { record: row.camera, created: row.inserted })
    }

    pub async fn upsert_collector(
        &self,
        tenant: &str,
        building: &str,
        status: DeviceStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collectors (id, tenant, building, status, last_seen_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant, building) DO UPDATE
            SET status = EXCLUDED.status,
                last_seen_at = GREATEST(collectors.last_seen_at, EXCLUDED.last_seen_at)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant)
        .bind(building)
        .bind(status)
        .bind(seen_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert collector: {}", e)))?;

        Ok(())
    }
}
