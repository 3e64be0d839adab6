use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::{DailyMetric, EventType, InsightEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct EventTypeSummary {
    pub event_type: EventType,
    pub count: usize,
    pub latest: NaiveDate,
}

pub fn summarize_by_type(events: &[InsightEvent]) -> Vec<EventTypeSummary> {
    let mut map: std::collections::HashMap<EventType, (usize, NaiveDate)> =
        std::collections::HashMap::new();

    for event in events {
        let entry = map.entry(event.event_type).or_insert((0, event.date));
        entry.0 += 1;
        entry.1 = entry.1.max(event.date);
    }

    let mut summaries: Vec<EventTypeSummary> = map
        .into_iter()
        .map(|(event_type, (count, latest))| EventTypeSummary {
            event_type,
            count,
            latest,
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.event_type.as_str().cmp(b.event_type.as_str()))
    });
    summaries
}

pub fn build_report(
    label: &str,
    since: NaiveDate,
    metrics: &[DailyMetric],
    events: &[InsightEvent],
) -> String {
    let summaries = summarize_by_type(events);
    let mut output = String::new();

    let _ = writeln!(output, "# Traffic Insights Report");
    let _ = writeln!(output, "Generated for {} (data since {})", label, since);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Traffic Summary");

    if metrics.is_empty() {
        let _ = writeln!(output, "No traffic recorded for this window.");
    } else {
        let visitors: i64 = metrics.iter().map(|m| m.visitors).sum();
        let page_views: i64 = metrics.iter().map(|m| m.page_views).sum();
        let n = metrics.len() as f64;
        let bounce = metrics.iter().map(|m| m.bounce_rate).sum::<f64>() / n;
        let duration = metrics.iter().map(|m| m.avg_session_duration).sum::<f64>() / n;
        let best = metrics.iter().max_by_key(|m| m.visitors);

        let _ = writeln!(output, "- {} days of data", metrics.len());
        let _ = writeln!(output, "- {} visitors, {} page views", visitors, page_views);
        let _ = writeln!(
            output,
            "- average bounce rate {:.1}%, average session {:.0}s",
            bounce * 100.0,
            duration
        );
        if let Some(best) = best {
            let _ = writeln!(output, "- best day {} with {} visitors", best.date, best.visitors);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Insight Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No insights recorded for this window.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} (latest {})",
                summary.event_type, summary.count, summary.latest
            );
        }
    }

    let (weekly, daily): (Vec<&InsightEvent>, Vec<&InsightEvent>) =
        events.iter().partition(|e| e.event_type.is_weekly());

    for (heading, mut section) in [("Weekly Insights", weekly), ("Daily Events", daily)] {
        section.sort_by(|a, b| b.date.cmp(&a.date));
        let _ = writeln!(output);
        let _ = writeln!(output, "## {heading}");

        if section.is_empty() {
            let _ = writeln!(output, "Nothing detected for this window.");
            continue;
        }
        for event in section.iter().take(15) {
            let _ = writeln!(
                output,
                "- {} **{}**: {}",
                event.date, event.title, event.description
            );
        }
    }

    output
}
