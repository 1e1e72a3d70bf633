//! Promotion rows: create, fetch, list, and phase transitions.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::model::{NewPromotion, Phase, Promotion, PromotionKey};
use crate::store::{PromotionStore, WatchEvent};
use crate::telemetry::metrics;

const COLUMNS: &str =
    "uid, namespace, name, stage, freight, phase, message, created_at, updated_at, finished_at";

impl super::Db {
    /// List promotions, newest first, optionally filtered by phase and stage.
    pub async fn list_promotions(
        &self,
        phase: Option<Phase>,
        stage: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Promotion>> {
        let rows: Vec<PromotionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM promotions
             WHERE ($1::text IS NULL OR phase = $1)
             AND ($2::text IS NULL OR stage = $2)
             ORDER BY created_at DESC, name DESC
             LIMIT $3"
        ))
        .bind(phase.map(|p| p.to_string()))
        .bind(stage)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(PromotionRow::try_into_promotion).collect()
    }
}

#[async_trait]
impl PromotionStore for super::Db {
    async fn list_non_terminal(&self) -> Result<Vec<Promotion>> {
        let rows: Vec<PromotionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM promotions
             WHERE phase IN ('pending', 'running')
             ORDER BY namespace, stage, created_at, name"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(PromotionRow::try_into_promotion).collect()
    }

    async fn get(&self, key: &PromotionKey) -> Result<Option<Promotion>> {
        let row: Option<PromotionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM promotions WHERE namespace = $1 AND name = $2"
        ))
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(self.pool())
        .await?;

        row.map(PromotionRow::try_into_promotion).transpose()
    }

    async fn update_phase(
        &self,
        key: &PromotionKey,
        phase: Phase,
        message: Option<&str>,
    ) -> Result<Promotion> {
        let current = self
            .get(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("promotion {key}")))?;
        let from = current.phase;
        if !from.can_transition_to(phase) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: phase.to_string(),
            });
        }

        // Optimistic: only applies if nobody moved the phase since we read it.
        let row: Option<PromotionRow> = sqlx::query_as(&format!(
            "UPDATE promotions
             SET phase = $1, message = $2, updated_at = now(),
                 finished_at = CASE WHEN $3 THEN now() ELSE finished_at END
             WHERE namespace = $4 AND name = $5 AND phase = $6
             RETURNING {COLUMNS}"
        ))
        .bind(phase.to_string())
        .bind(message)
        .bind(phase.is_terminal())
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(from.to_string())
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: phase.to_string(),
            });
        };

        metrics::phase_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", phase.to_string()),
            ],
        );

        row.try_into_promotion()
    }

    async fn create(&self, new: NewPromotion) -> Result<Promotion> {
        let promotion = new.into_promotion(chrono::Utc::now())?;

        let row: Option<PromotionRow> = sqlx::query_as(&format!(
            "INSERT INTO promotions ({COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $7, NULL)
             ON CONFLICT (namespace, name) DO NOTHING
             RETURNING {COLUMNS}"
        ))
        .bind(promotion.uid)
        .bind(&promotion.namespace)
        .bind(&promotion.name)
        .bind(&promotion.stage)
        .bind(&promotion.freight)
        .bind(promotion.phase.to_string())
        .bind(promotion.created_at)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| {
            Error::InvalidArgument(format!("promotion {} already exists", promotion.key()))
        })?
        .try_into_promotion()
    }

    async fn delete(&self, key: &PromotionKey) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM promotions WHERE namespace = $1 AND name = $2")
            .bind(&key.namespace)
            .bind(&key.name)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<WatchEvent>> {
        self.listen().await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct PromotionRow {
    uid: uuid::Uuid,
    namespace: String,
    name: String,
    stage: String,
    freight: String,
    phase: String,
    message: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl PromotionRow {
    fn try_into_promotion(self) -> Result<Promotion> {
        Ok(Promotion {
            uid: self.uid,
            namespace: self.namespace,
            name: self.name,
            stage: self.stage,
            freight: self.freight,
            phase: self.phase.parse()?,
            message: self.message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}
