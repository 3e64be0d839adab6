use chrono::{Duration, NaiveDate};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::models::{DailyMetric, EventType, InsightEvent};
use crate::store::MetricStore;

pub const LOOKBACK_DAYS: i64 = 30;
pub const SPIKE_RATIO: f64 = 1.5;
pub const DROP_RATIO: f64 = 0.7;
/// Drops below this many visitors the day before are noise.
pub const DROP_MIN_VISITORS: i64 = 10;
pub const MILESTONES: [i64; 5] = [100, 500, 1000, 5000, 10000];
pub const MIN_STREAK: u32 = 5;

/// Consecutive days of visitor growth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StreakState {
    length: u32,
    active: bool,
    last_date: Option<NaiveDate>,
}

impl StreakState {
    fn extend(&mut self, date: NaiveDate) {
        self.length += 1;
        self.active = true;
        self.last_date = Some(date);
    }

    /// Close the current streak, emitting it if long enough.
    fn finish(&mut self, user_id: Uuid) -> Option<InsightEvent> {
        let finished = std::mem::take(self);
        match finished.last_date {
            Some(date) if finished.active && finished.length >= MIN_STREAK => {
                Some(streak_event(user_id, date, finished.length))
            }
            _ => None,
        }
    }
}

fn percent_change(previous: i64, current: i64) -> f64 {
    (current - previous) as f64 / previous as f64 * 100.0
}

fn spike_event(user_id: Uuid, yesterday: &DailyMetric, today: &DailyMetric) -> InsightEvent {
    let pct = percent_change(yesterday.visitors, today.visitors).round();
    InsightEvent {
        user_id,
        date: today.date,
        event_type: EventType::Spike,
        event_key: String::new(),
        title: "Traffic spike".to_string(),
        description: format!(
            "Visitors jumped {pct:.0}% to {} (from {} the day before)",
            today.visitors, yesterday.visitors
        ),
        value: today.visitors as f64,
        metadata: json!({
            "previous_visitors": yesterday.visitors,
            "visitors": today.visitors,
            "percent_change": pct,
        }),
    }
}

fn drop_event(user_id: Uuid, yesterday: &DailyMetric, today: &DailyMetric) -> InsightEvent {
    let pct = percent_change(yesterday.visitors, today.visitors).abs().round();
    InsightEvent {
        user_id,
        date: today.date,
        event_type: EventType::Drop,
        event_key: String::new(),
        title: "Traffic drop".to_string(),
        description: format!(
            "Visitors fell {pct:.0}% to {} (from {} the day before)",
            today.visitors, yesterday.visitors
        ),
        value: today.visitors as f64,
        metadata: json!({
            "previous_visitors": yesterday.visitors,
            "visitors": today.visitors,
            "percent_change": -pct,
        }),
    }
}

fn milestone_event(user_id: Uuid, today: &DailyMetric, threshold: i64) -> InsightEvent {
    InsightEvent {
        user_id,
        date: today.date,
        event_type: EventType::Milestone,
        event_key: threshold.to_string(),
        title: format!("{threshold} daily visitors"),
        description: format!(
            "Crossed {threshold} visitors in a day with {} visitors",
            today.visitors
        ),
        value: threshold as f64,
        metadata: json!({
            "threshold": threshold,
            "visitors": today.visitors,
        }),
    }
}

fn streak_event(user_id: Uuid, date: NaiveDate, length: u32) -> InsightEvent {
    InsightEvent {
        user_id,
        date,
        event_type: EventType::Streak,
        event_key: String::new(),
        title: format!("{length}-day growth streak"),
        description: format!("Visitors grew day over day for {length} consecutive days"),
        value: f64::from(length),
        metadata: json!({ "streak_days": length }),
    }
}

/// Scan day pairs for spikes, drops, milestone crossings and growth streaks.
pub fn detect_daily_events(user_id: Uuid, metrics: &[DailyMetric]) -> Vec<InsightEvent> {
    let mut sorted: Vec<&DailyMetric> = metrics.iter().collect();
    sorted.sort_by_key(|m| m.date);

    let mut events = Vec::new();
    let mut streak = StreakState::default();

    for pair in sorted.windows(2) {
        let (yesterday, today) = (pair[0], pair[1]);

        if yesterday.visitors > 0 && today.visitors as f64 > yesterday.visitors as f64 * SPIKE_RATIO {
            events.push(spike_event(user_id, yesterday, today));
        }

        if yesterday.visitors > DROP_MIN_VISITORS
            && (today.visitors as f64) < yesterday.visitors as f64 * DROP_RATIO
        {
            events.push(drop_event(user_id, yesterday, today));
        }

        for threshold in MILESTONES {
            if yesterday.visitors < threshold && today.visitors >= threshold {
                events.push(milestone_event(user_id, today, threshold));
            }
        }

        if today.visitors > yesterday.visitors {
            streak.extend(today.date);
        } else {
            events.extend(streak.finish(user_id));
        }
    }
    events.extend(streak.finish(user_id));

    events
}

/// Detect over the trailing window ending at `today` and upsert the results.
///
/// An ongoing streak is emitted on every run, so each day it extends leaves
/// another `streak` row dated on that day.
pub async fn run_daily_detection<S: MetricStore>(
    store: &S,
    user_id: Uuid,
    today: NaiveDate,
) -> anyhow::Result<usize> {
    let from = today - Duration::days(LOOKBACK_DAYS);
    let metrics = store.metrics_between(user_id, from, today).await?;
    let events = detect_daily_events(user_id, &metrics);

    for event in &events {
        store.upsert_event(event).await?;
    }

    info!(user_id = %user_id, days = metrics.len(), events = events.len(), "Daily detection complete");
    Ok(events.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn series(user_id: Uuid, visitors: &[i64]) -> Vec<DailyMetric> {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        visitors
            .iter()
            .enumerate()
            .map(|(i, v)| DailyMetric {
                id: Uuid::new_v4(),
                user_id,
                date: start + Duration::days(i as i64),
                visitors: *v,
                page_views: v * 2,
                avg_session_duration: 60.0,
                bounce_rate: 0.5,
            })
            .collect()
    }

    fn of_type(events: &[InsightEvent], t: EventType) -> Vec<&InsightEvent> {
        events.iter().filter(|e| e.event_type == t).collect()
    }

    #[test]
    fn spike_above_fifty_percent() {
        let user = Uuid::new_v4();
        let metrics = series(user, &[100, 160]);
        let events = detect_daily_events(user, &metrics);
        let spikes = of_type(&events, EventType::Spike);
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].value, 160.0);
        assert_eq!(spikes[0].date, metrics[1].date);
        assert!(spikes[0].description.contains("60%"));
    }

    #[test]
    fn exactly_fifty_percent_is_not_a_spike() {
        let user = Uuid::new_v4();
        let events = detect_daily_events(user, &series(user, &[100, 150]));
        assert!(of_type(&events, EventType::Spike).is_empty());
    }

    #[test]
    fn drop_below_seventy_percent() {
        let user = Uuid::new_v4();
        let metrics = series(user, &[100, 60]);
        let events = detect_daily_events(user, &metrics);
        let drops = of_type(&events, EventType::Drop);
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].date, metrics[1].date);
        assert_eq!(drops[0].value, 60.0);
        assert!(drops[0].description.contains("40%"));
    }

    #[test]
    fn small_sites_do_not_report_drops() {
        let user = Uuid::new_v4();
        let events = detect_daily_events(user, &series(user, &[10, 2]));
        assert!(of_type(&events, EventType::Drop).is_empty());
    }

    #[test]
    fn one_day_can_cross_several_milestones() {
        let user = Uuid::new_v4();
        let events = detect_daily_events(user, &series(user, &[90, 600]));
        let milestones = of_type(&events, EventType::Milestone);
        assert_eq!(milestones.len(), 2);
        assert_eq!(milestones[0].value, 100.0);
        assert_eq!(milestones[0].event_key, "100");
        assert_eq!(milestones[1].value, 500.0);
        assert_eq!(milestones[1].event_key, "500");
    }

    #[test]
    fn landing_exactly_on_threshold_counts() {
        let user = Uuid::new_v4();
        let events = detect_daily_events(user, &series(user, &[99, 100]));
        assert_eq!(of_type(&events, EventType::Milestone).len(), 1);
    }

    #[test]
    fn five_day_streak_then_break() {
        let user = Uuid::new_v4();
        let metrics = series(user, &[10, 11, 12, 13, 14, 15, 15]);
        let events = detect_daily_events(user, &metrics);
        let streaks = of_type(&events, EventType::Streak);
        assert_eq!(streaks.len(), 1);
        assert_eq!(streaks[0].value, 5.0);
        assert_eq!(streaks[0].date, metrics[5].date);
    }

    #[test]
    fn streak_running_into_end_of_data_is_flushed() {
        let user = Uuid::new_v4();
        let metrics = series(user, &[5, 1, 2, 3, 4, 5, 6, 7]);
        let events = detect_daily_events(user, &metrics);
        let streaks = of_type(&events, EventType::Streak);
        assert_eq!(streaks.len(), 1);
        assert_eq!(streaks[0].value, 6.0);
        assert_eq!(streaks[0].date, metrics[7].date);
    }

    #[test]
    fn short_streaks_are_ignored() {
        let user = Uuid::new_v4();
        let events = detect_daily_events(user, &series(user, &[10, 11, 12, 13, 14, 9, 10, 11]));
        assert!(of_type(&events, EventType::Streak).is_empty());
    }

    #[test]
    fn unsorted_input_is_ordered_by_date() {
        let user = Uuid::new_v4();
        let mut metrics = series(user, &[100, 160]);
        metrics.reverse();
        let events = detect_daily_events(user, &metrics);
        assert_eq!(of_type(&events, EventType::Spike).len(), 1);
        assert!(of_type(&events, EventType::Drop).is_empty());
    }

    #[tokio::test]
    async fn rerunning_detection_does_not_duplicate_events() {
        let user = Uuid::new_v4();
        let metrics = series(user, &[90, 600, 100]);
        let today = metrics[2].date;
        let store = MemoryStore::default();
        store.seed_metrics(metrics);

        let first = run_daily_detection(&store, user, today).await.unwrap();
        let stored = store.events().len();
        let second = run_daily_detection(&store, user, today).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.events().len(), stored);
        assert_eq!(stored, first);
    }
}
