//! Cron occurrence generator.
//!
//! Keeps exactly one not-yet-started occurrence per definition. The next
//! occurrence is materialized as soon as the current one starts running (or
//! ends), always strictly after both the latest existing occurrence and now.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::backends::PersistenceStore;
use crate::cron::{CronExpression, CronParser, SchedulerTimeZone};
use crate::domain::{CronDefinition, CronOccurrence};
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventBus, SchedulerEvent};

/// Parse `expression` and check that it fires at least once after `now`.
pub fn parse_expression(
    expression: &str,
    now: DateTime<Utc>,
    zone: SchedulerTimeZone,
) -> SchedulerResult<CronExpression> {
    let parsed = CronParser::parse(expression).map_err(|e| SchedulerError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: format!("{e:#}"),
    })?;
    if parsed.next_after(&now, zone).is_none() {
        return Err(SchedulerError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: "expression never fires".to_string(),
        });
    }
    Ok(parsed)
}

/// Due time of the next occurrence: strictly after the later of the latest
/// existing occurrence and `now`.
#[must_use]
pub fn next_occurrence_time(
    expression: &CronExpression,
    latest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    zone: SchedulerTimeZone,
) -> Option<DateTime<Utc>> {
    let watermark = latest.map_or(now, |latest| latest.max(now));
    expression.next_after(&watermark, zone)
}

/// Materializes cron occurrences into the store.
#[derive(Clone)]
pub struct OccurrenceGenerator {
    store: Arc<dyn PersistenceStore>,
    events: EventBus,
    zone: SchedulerTimeZone,
}

impl std::fmt::Debug for OccurrenceGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OccurrenceGenerator")
            .field("zone", &self.zone)
            .finish_non_exhaustive()
    }
}

impl OccurrenceGenerator {
    pub fn new(store: Arc<dyn PersistenceStore>, events: EventBus, zone: SchedulerTimeZone) -> Self {
        Self { store, events, zone }
    }

    /// Create the next occurrence of `definition` unless one is already
    /// waiting. Returns the new occurrence, if any.
    pub async fn ensure_next(
        &self,
        definition: &CronDefinition,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<CronOccurrence>> {
        let pending = self
            .store
            .pending_occurrence(definition.id)
            .await
            .map_err(SchedulerError::store)?;
        if pending.is_some() {
            return Ok(None);
        }

        let expression = CronParser::parse(&definition.expression).map_err(|e| {
            SchedulerError::InvalidCronExpression {
                expression: definition.expression.clone(),
                reason: format!("{e:#}"),
            }
        })?;
        let latest = self
            .store
            .latest_occurrence(definition.id)
            .await
            .map_err(SchedulerError::store)?
            .map(|o| o.execution_time);

        let Some(at) = next_occurrence_time(&expression, latest, now, self.zone) else {
            warn!(cron_id = %definition.id, expression = %definition.expression, "Cron expression has no future occurrence");
            return Ok(None);
        };

        let occurrence = CronOccurrence::new(definition.id, at, now);
        let inserted = self
            .store
            .insert_occurrence(&occurrence)
            .await
            .map_err(SchedulerError::store)?;
        if !inserted {
            // Another node materialized the next occurrence first.
            debug!(cron_id = %definition.id, at = %at, "Occurrence already exists");
            return Ok(None);
        }

        debug!(cron_id = %definition.id, occurrence_id = %occurrence.id, at = %at, "Materialized cron occurrence");
        self.events.emit(SchedulerEvent::OccurrenceMaterialized {
            cron_id: definition.id,
            occurrence_id: occurrence.id,
            at,
        });
        Ok(Some(occurrence))
    }

    /// Run [`Self::ensure_next`] for every definition. A definition that
    /// fails is logged and skipped. Returns the earliest new due time.
    pub async fn materialize_all(&self, now: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>> {
        let definitions = self
            .store
            .list_cron_definitions()
            .await
            .map_err(SchedulerError::store)?;

        let mut earliest: Option<DateTime<Utc>> = None;
        for definition in &definitions {
            match self.ensure_next(definition, now).await {
                Ok(Some(occurrence)) => {
                    earliest = Some(earliest.map_or(occurrence.execution_time, |e| e.min(occurrence.execution_time)));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(cron_id = %definition.id, error = %e, "Skipping cron definition this cycle");
                }
            }
        }
        Ok(earliest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::domain::{JobKind, JobStatus, NewCronJob, Transition};
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_next_time_never_in_the_past() {
        let expr = CronParser::parse("*/10 * * * * *").unwrap();
        let now = at(12, 0, 33);
        // Latest occurrence long ago: next slot after now.
        assert_eq!(
            next_occurrence_time(&expr, Some(at(11, 0, 0)), now, SchedulerTimeZone::Utc),
            Some(at(12, 0, 40))
        );
        // Latest occurrence in the future: strictly after it.
        assert_eq!(
            next_occurrence_time(&expr, Some(at(12, 0, 40)), now, SchedulerTimeZone::Utc),
            Some(at(12, 0, 50))
        );
        assert_eq!(
            next_occurrence_time(&expr, None, now, SchedulerTimeZone::Utc),
            Some(at(12, 0, 40))
        );
    }

    #[test]
    fn test_parse_expression_rejects_dead_schedules() {
        let now = Utc::now();
        assert!(parse_expression("0 0 0 31 2 *", now, SchedulerTimeZone::Utc).is_err());
        assert!(parse_expression("garbage", now, SchedulerTimeZone::Utc).is_err());
        assert!(parse_expression("0 0 * * * *", now, SchedulerTimeZone::Utc).is_ok());
    }

    #[tokio::test]
    async fn test_only_one_pending_occurrence() {
        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::new());
        let generator = OccurrenceGenerator::new(Arc::clone(&store), EventBus::default(), SchedulerTimeZone::Utc);
        let now = Utc::now();
        let definition = NewCronJob::new("tick", "*/10 * * * * *").into_definition(now);
        store.insert_cron_definition(&definition).await.unwrap();

        let first = generator.ensure_next(&definition, now).await.unwrap().unwrap();
        assert!(generator.ensure_next(&definition, now).await.unwrap().is_none());
        assert!(generator.materialize_all(now).await.unwrap().is_none());
        assert_eq!(store.occurrences(definition.id).await.unwrap().len(), 1);

        // Once the first starts, the next one is generated after it.
        store.try_claim(JobKind::Cron, first.id, "a", now).await.unwrap();
        let start = Transition::new(JobStatus::Queued, JobStatus::InProgress).executed_at(now);
        store.transition(JobKind::Cron, first.id, &start).await.unwrap();

        let second = generator.ensure_next(&definition, now).await.unwrap().unwrap();
        assert_eq!(second.execution_time - first.execution_time, chrono::Duration::seconds(10));
        assert!(generator.ensure_next(&definition, now).await.unwrap().is_none());
    }
}
