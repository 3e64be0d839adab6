use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{
    Credentials, DailyMetric, DayBatch, EventType, IngestState, InsightEvent, ReferrerRecord,
};

/// Storage operations the ingestion pipeline and detectors depend on.
///
/// `upsert_day` and `replace_events` must each be atomic: either the whole
/// date (or the whole event window) is written, or nothing is.
#[allow(async_fn_in_trait)]
pub trait MetricStore {
    async fn load_credentials(&self, user_id: Uuid) -> anyhow::Result<Option<Credentials>>;

    async fn save_access_token(
        &self,
        user_id: Uuid,
        access_token: &str,
        token_expiry: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn mark_credentials_invalid(&self, user_id: Uuid, reason: &str) -> anyhow::Result<()>;

    async fn set_status(
        &self,
        user_id: Uuid,
        state: IngestState,
        message: &str,
        days_processed: i32,
    ) -> anyhow::Result<()>;

    /// Create or update the day's aggregate and replace all of its children.
    /// Returns the aggregate's id.
    async fn upsert_day(&self, user_id: Uuid, batch: &DayBatch) -> anyhow::Result<Uuid>;

    async fn metrics_between(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<DailyMetric>>;

    async fn referrers_between(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<ReferrerRecord>>;

    /// Insert or overwrite by (user, date, type, key).
    async fn upsert_event(&self, event: &InsightEvent) -> anyhow::Result<()>;

    /// Delete every event of `types` dated within `from..=to`, then insert
    /// `events`.
    async fn replace_events(
        &self,
        user_id: Uuid,
        types: &[EventType],
        from: NaiveDate,
        to: NaiveDate,
        events: &[InsightEvent],
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
pub mod memory {
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::Mutex;

    use anyhow::anyhow;

    use super::*;
    use crate::models::{ConnectionStatus, DeviceRecord, GeographyRecord, TopPageRecord};

    #[derive(Debug, Clone)]
    pub struct StoredChild<T> {
        pub daily_metric_id: Uuid,
        pub user_id: Uuid,
        pub record: T,
    }

    #[derive(Debug, Default)]
    pub struct Tables {
        pub credentials: HashMap<Uuid, Credentials>,
        pub invalid_reasons: HashMap<Uuid, String>,
        pub status_log: Vec<(Uuid, IngestState, String, i32)>,
        pub metrics: BTreeMap<(Uuid, NaiveDate), DailyMetric>,
        pub referrers: Vec<StoredChild<ReferrerRecord>>,
        pub pages: Vec<StoredChild<TopPageRecord>>,
        pub geography: Vec<StoredChild<GeographyRecord>>,
        pub devices: Vec<StoredChild<DeviceRecord>>,
        pub events: Vec<InsightEvent>,
        pub failing_dates: HashSet<NaiveDate>,
        pub failing_events: bool,
    }

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        pub tables: Mutex<Tables>,
    }

    impl MemoryStore {
        pub fn with_credentials(credentials: Credentials) -> Self {
            let store = Self::default();
            store
                .tables
                .lock()
                .unwrap()
                .credentials
                .insert(credentials.user_id, credentials);
            store
        }

        pub fn fail_on(&self, date: NaiveDate) {
            self.tables.lock().unwrap().failing_dates.insert(date);
        }

        pub fn fail_event_writes(&self) {
            self.tables.lock().unwrap().failing_events = true;
        }

        pub fn seed_metrics(&self, metrics: Vec<DailyMetric>) {
            let mut tables = self.tables.lock().unwrap();
            for m in metrics {
                tables.metrics.insert((m.user_id, m.date), m);
            }
        }

        pub fn seed_referrers(&self, user_id: Uuid, referrers: Vec<ReferrerRecord>) {
            let mut tables = self.tables.lock().unwrap();
            for record in referrers {
                tables.referrers.push(StoredChild {
                    daily_metric_id: Uuid::nil(),
                    user_id,
                    record,
                });
            }
        }

        pub fn events(&self) -> Vec<InsightEvent> {
            self.tables.lock().unwrap().events.clone()
        }

        pub fn last_status(&self) -> Option<(IngestState, String, i32)> {
            self.tables
                .lock()
                .unwrap()
                .status_log
                .last()
                .map(|(_, s, m, d)| (*s, m.clone(), *d))
        }
    }

    fn attach<T: Clone>(
        rows: &mut Vec<StoredChild<T>>,
        records: &[T],
        daily_metric_id: Uuid,
        user_id: Uuid,
    ) {
        rows.extend(records.iter().cloned().map(|record| StoredChild {
            daily_metric_id,
            user_id,
            record,
        }));
    }

    impl MetricStore for MemoryStore {
        async fn load_credentials(&self, user_id: Uuid) -> anyhow::Result<Option<Credentials>> {
            Ok(self.tables.lock().unwrap().credentials.get(&user_id).cloned())
        }

        async fn save_access_token(
            &self,
            user_id: Uuid,
            access_token: &str,
            token_expiry: DateTime<Utc>,
        ) -> anyhow::Result<()> {
            let mut tables = self.tables.lock().unwrap();
            let creds = tables
                .credentials
                .get_mut(&user_id)
                .ok_or_else(|| anyhow!("no credentials"))?;
            creds.access_token = access_token.to_string();
            creds.token_expiry = token_expiry;
            creds.status = ConnectionStatus::Active;
            Ok(())
        }

        async fn mark_credentials_invalid(&self, user_id: Uuid, reason: &str) -> anyhow::Result<()> {
            let mut tables = self.tables.lock().unwrap();
            if let Some(creds) = tables.credentials.get_mut(&user_id) {
                creds.status = ConnectionStatus::Invalid;
            }
            tables.invalid_reasons.insert(user_id, reason.to_string());
            Ok(())
        }

        async fn set_status(
            &self,
            user_id: Uuid,
            state: IngestState,
            message: &str,
            days_processed: i32,
        ) -> anyhow::Result<()> {
            self.tables
                .lock()
                .unwrap()
                .status_log
                .push((user_id, state, message.to_string(), days_processed));
            Ok(())
        }

        async fn upsert_day(&self, user_id: Uuid, batch: &DayBatch) -> anyhow::Result<Uuid> {
            let mut tables = self.tables.lock().unwrap();
            let date = batch.date();
            if tables.failing_dates.contains(&date) {
                return Err(anyhow!("simulated failure for {date}"));
            }

            let totals = &batch.totals;
            let id = match tables.metrics.get_mut(&(user_id, date)) {
                Some(existing) => {
                    existing.visitors = totals.visitors;
                    existing.page_views = totals.page_views;
                    existing.avg_session_duration = totals.avg_session_duration;
                    existing.bounce_rate = totals.bounce_rate;
                    existing.id
                }
                None => {
                    let id = Uuid::new_v4();
                    tables.metrics.insert(
                        (user_id, date),
                        DailyMetric {
                            id,
                            user_id,
                            date,
                            visitors: totals.visitors,
                            page_views: totals.page_views,
                            avg_session_duration: totals.avg_session_duration,
                            bounce_rate: totals.bounce_rate,
                        },
                    );
                    id
                }
            };

            tables.referrers.retain(|c| c.daily_metric_id != id);
            tables.pages.retain(|c| c.daily_metric_id != id);
            tables.geography.retain(|c| c.daily_metric_id != id);
            tables.devices.retain(|c| c.daily_metric_id != id);

            attach(&mut tables.referrers, &batch.referrers, id, user_id);
            attach(&mut tables.pages, &batch.pages, id, user_id);
            attach(&mut tables.geography, &batch.geography, id, user_id);
            attach(&mut tables.devices, &batch.devices, id, user_id);

            Ok(id)
        }

        async fn metrics_between(
            &self,
            user_id: Uuid,
            from: NaiveDate,
            to: NaiveDate,
        ) -> anyhow::Result<Vec<DailyMetric>> {
            Ok(self
                .tables
                .lock()
                .unwrap()
                .metrics
                .range((user_id, from)..=(user_id, to))
                .map(|(_, m)| m.clone())
                .collect())
        }

        async fn referrers_between(
            &self,
            user_id: Uuid,
            from: NaiveDate,
            to: NaiveDate,
        ) -> anyhow::Result<Vec<ReferrerRecord>> {
            Ok(self
                .tables
                .lock()
                .unwrap()
                .referrers
                .iter()
                .filter(|c| c.user_id == user_id && c.record.date >= from && c.record.date <= to)
                .map(|c| c.record.clone())
                .collect())
        }

        async fn upsert_event(&self, event: &InsightEvent) -> anyhow::Result<()> {
            let mut tables = self.tables.lock().unwrap();
            if tables.failing_events {
                return Err(anyhow!("simulated event write failure"));
            }
            tables.events.retain(|e| {
                !(e.user_id == event.user_id
                    && e.date == event.date
                    && e.event_type == event.event_type
                    && e.event_key == event.event_key)
            });
            tables.events.push(event.clone());
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
            let mut tables = self.tables.lock().unwrap();
            if tables.failing_events {
                return Err(anyhow!("simulated event write failure"));
            }
            tables.events.retain(|e| {
                !(e.user_id == user_id
                    && types.contains(&e.event_type)
                    && e.date >= from
                    && e.date <= to)
            });
            tables.events.extend(events.iter().cloned());
            Ok(())
        }
    }
}
