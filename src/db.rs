use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::{
    ConnectionStatus, Credentials, DailyMetric, DayBatch, EventType, IngestState, IngestStatus,
    InsightEvent, ReferrerRecord,
};
use crate::store::MetricStore;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed storage for metrics, insights and connection state.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn save_credentials(&self, credentials: &Credentials) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO traffic_insights.analytics_connections
            (user_id, property_id, access_token, refresh_token, token_expiry, status, status_message)
            VALUES ($1, $2, $3, $4, $5, $6, NULL)
            ON CONFLICT (user_id) DO UPDATE
            SET property_id = EXCLUDED.property_id,
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                token_expiry = EXCLUDED.token_expiry,
                status = EXCLUDED.status,
                status_message = NULL,
                updated_at = now()
            "#,
        )
        .bind(credentials.user_id)
        .bind(&credentials.property_id)
        .bind(&credentials.access_token)
        .bind(&credentials.refresh_token)
        .bind(credentials.token_expiry)
        .bind(credentials.status.as_str())
        .execute(&self.pool)
        .await
        .context("failed to save analytics connection")?;

        Ok(())
    }

    pub async fn fetch_status(&self, user_id: Uuid) -> anyhow::Result<Option<IngestStatus>> {
        let row = sqlx::query(
            r#"
            SELECT status, message, days_processed, updated_at
            FROM traffic_insights.ingest_status
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| IngestStatus {
            status: row.get("status"),
            message: row.get("message"),
            days_processed: row.get("days_processed"),
            updated_at: row.get("updated_at"),
        }))
    }

    pub async fn fetch_events(
        &self,
        user_id: Uuid,
        since: NaiveDate,
    ) -> anyhow::Result<Vec<InsightEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, date, event_type, event_key, title, description, value, metadata
            FROM traffic_insights.insight_events
            WHERE user_id = $1 AND date >= $2
            ORDER BY date DESC, event_type
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_type: String = row.get("event_type");
            let event_type = match event_type.parse::<EventType>() {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring stored event with unknown type");
                    continue;
                }
            };
            events.push(InsightEvent {
                user_id: row.get("user_id"),
                date: row.get("date"),
                event_type,
                event_key: row.get("event_key"),
                title: row.get("title"),
                description: row.get("description"),
                value: row.get("value"),
                metadata: row.get("metadata"),
            });
        }

        Ok(events)
    }
}

async fn insert_children(
    tx: &mut Transaction<'_, Postgres>,
    daily_metric_id: Uuid,
    user_id: Uuid,
    batch: &DayBatch,
) -> anyhow::Result<()> {
    let date = batch.date();

    for r in &batch.referrers {
        sqlx::query(
            r#"
            INSERT INTO traffic_insights.referrers
            (id, daily_metric_id, user_id, date, source, visitors)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(daily_metric_id)
        .bind(user_id)
        .bind(date)
        .bind(&r.source)
        .bind(r.visitors)
        .execute(&mut **tx)
        .await?;
    }

    for p in &batch.pages {
        sqlx::query(
            r#"
            INSERT INTO traffic_insights.top_pages
            (id, daily_metric_id, user_id, date, page_path, page_views, avg_engagement_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(daily_metric_id)
        .bind(user_id)
        .bind(date)
        .bind(&p.page_path)
        .bind(p.page_views)
        .bind(p.avg_engagement_time)
        .execute(&mut **tx)
        .await?;
    }

    for g in &batch.geography {
        sqlx::query(
            r#"
            INSERT INTO traffic_insights.geography
            (id, daily_metric_id, user_id, date, country, country_code, city, visitors, page_views)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(daily_metric_id)
        .bind(user_id)
        .bind(date)
        .bind(&g.country)
        .bind(&g.country_code)
        .bind(&g.city)
        .bind(g.visitors)
        .bind(g.page_views)
        .execute(&mut **tx)
        .await?;
    }

    for d in &batch.devices {
        sqlx::query(
            r#"
            INSERT INTO traffic_insights.devices
            (id, daily_metric_id, user_id, date, device_category, browser, operating_system, visitors, page_views)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(daily_metric_id)
        .bind(user_id)
        .bind(date)
        .bind(&d.device_category)
        .bind(&d.browser)
        .bind(&d.operating_system)
        .bind(d.visitors)
        .bind(d.page_views)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &InsightEvent,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO traffic_insights.insight_events
        (id, user_id, date, event_type, event_key, title, description, value, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (user_id, date, event_type, event_key) DO UPDATE
        SET title = EXCLUDED.title,
            description = EXCLUDED.description,
            value = EXCLUDED.value,
            metadata = EXCLUDED.metadata,
            created_at = now()
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(event.user_id)
    .bind(event.date)
    .bind(event.event_type.as_str())
    .bind(&event.event_key)
    .bind(&event.title)
    .bind(&event.description)
    .bind(event.value)
    .bind(&event.metadata)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

impl MetricStore for PgStore {
    async fn load_credentials(&self, user_id: Uuid) -> anyhow::Result<Option<Credentials>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, property_id, access_token, refresh_token, token_expiry, status
            FROM traffic_insights.analytics_connections
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load analytics connection")?;

        Ok(row.map(|row| {
            let status: String = row.get("status");
            Credentials {
                user_id: row.get("user_id"),
                property_id: row.get("property_id"),
                access_token: row.get("access_token"),
                refresh_token: row.get("refresh_token"),
                token_expiry: row.get("token_expiry"),
                status: ConnectionStatus::parse(&status),
            }
        }))
    }

    async fn save_access_token(
        &self,
        user_id: Uuid,
        access_token: &str,
        token_expiry: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE traffic_insights.analytics_connections
            SET access_token = $2, token_expiry = $3, status = 'active',
                status_message = NULL, updated_at = now()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(access_token)
        .bind(token_expiry)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_credentials_invalid(&self, user_id: Uuid, reason: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE traffic_insights.analytics_connections
            SET status = 'invalid', status_message = $2, updated_at = now()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_status(
        &self,
        user_id: Uuid,
        state: IngestState,
        message: &str,
        days_processed: i32,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO traffic_insights.ingest_status
            (user_id, status, message, days_processed, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (user_id) DO UPDATE
            SET status = EXCLUDED.status,
                message = EXCLUDED.message,
                days_processed = EXCLUDED.days_processed,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(state.as_str())
        .bind(message)
        .bind(days_processed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_day(&self, user_id: Uuid, batch: &DayBatch) -> anyhow::Result<Uuid> {
        let date = batch.date();
        let totals = &batch.totals;
        let mut tx = self.pool.begin().await?;

        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM traffic_insights.daily_metrics
            WHERE user_id = $1 AND date = $2
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(date)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE traffic_insights.daily_metrics
                    SET visitors = $2, page_views = $3, avg_session_duration = $4,
                        bounce_rate = $5, updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(totals.visitors)
                .bind(totals.page_views)
                .bind(totals.avg_session_duration)
                .bind(totals.bounce_rate)
                .execute(&mut *tx)
                .await?;

                for table in ["referrers", "top_pages", "geography", "devices"] {
                    let sql = format!(
                        "DELETE FROM traffic_insights.{table} WHERE daily_metric_id = $1"
                    );
                    sqlx::query(&sql).bind(id).execute(&mut *tx).await?;
                }

                id
            }
            None => sqlx::query_scalar(
                r#"
                INSERT INTO traffic_insights.daily_metrics
                (id, user_id, date, visitors, page_views, avg_session_duration, bounce_rate)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (user_id, date) DO UPDATE
                SET visitors = EXCLUDED.visitors,
                    page_views = EXCLUDED.page_views,
                    avg_session_duration = EXCLUDED.avg_session_duration,
                    bounce_rate = EXCLUDED.bounce_rate,
                    updated_at = now()
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(date)
            .bind(totals.visitors)
            .bind(totals.page_views)
            .bind(totals.avg_session_duration)
            .bind(totals.bounce_rate)
            .fetch_one(&mut *tx)
            .await?,
        };

        insert_children(&mut tx, id, user_id, batch).await?;
        tx.commit()
            .await
            .with_context(|| format!("failed to commit metrics for {date}"))?;

        Ok(id)
    }

    async fn metrics_between(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<DailyMetric>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, date, visitors, page_views, avg_session_duration, bounce_rate
            FROM traffic_insights.daily_metrics
            WHERE user_id = $1 AND date BETWEEN $2 AND $3
            ORDER BY date
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut metrics = Vec::with_capacity(rows.len());
        for row in rows {
            metrics.push(DailyMetric {
                id: row.get("id"),
                user_id: row.get("user_id"),
                date: row.get("date"),
                visitors: row.get("visitors"),
                page_views: row.get("page_views"),
                avg_session_duration: row.get("avg_session_duration"),
                bounce_rate: row.get("bounce_rate"),
            });
        }

        Ok(metrics)
    }

    async fn referrers_between(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<ReferrerRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT date, source, visitors
            FROM traffic_insights.referrers
            WHERE user_id = $1 AND date BETWEEN $2 AND $3
            ORDER BY date
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ReferrerRecord {
                date: row.get("date"),
                source: row.get("source"),
                visitors: row.get("visitors"),
            })
            .collect())
    }

    async fn upsert_event(&self, event: &InsightEvent) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_event(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_events(
        &self,
        user_id: Uuid,
        types: &[EventType],
        from: NaiveDate,
        to: NaiveDate,
        events: &[InsightEvent],
    ) -> anyhow::Result<()> {
        let type_names: Vec<&str> = types.iter().map(EventType::as_str).collect();
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM traffic_insights.insight_events
            WHERE user_id = $1 AND event_type = ANY($2) AND date BETWEEN $3 AND $4
            "#,
        )
        .bind(user_id)
        .bind(&type_names[..])
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await?;

        for event in events {
            insert_event(&mut tx, event).await?;
        }

        tx.commit()
            .await
            .context("failed to commit regenerated insights")?;

        tracing::debug!(
            user_id = %user_id,
            deleted = deleted.rows_affected(),
            inserted = events.len(),
            "Replaced insight events"
        );
        Ok(())
    }
}
