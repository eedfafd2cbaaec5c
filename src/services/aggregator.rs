//! Daily dwell aggregation
//!
//! Consumes ENTER/LEAVE events (in order per fingerprint) and keeps one
//! `DailyAggregate` per (fingerprint, UTC date). Closed intervals are split
//! at midnight and each day is credited its share.
//!
//! Day rollover follows event timestamps: the aggregator keeps a watermark
//! (latest event time seen) and seals any date before the watermark's date
//! that no open interval still covers. Replaying a history file therefore
//! produces the same aggregates as live processing did. The full seal pass
//! only runs when the watermark date changes; in between, a LEAVE reseals
//! just the dates its interval touched.

use crate::domain::device::{split_by_day, DailyAggregate};
use crate::domain::types::{FingerprintId, PresenceEvent, TransitionKind};
use chrono::{DateTime, Days, NaiveDate, Utc};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, warn};

/// What changed after one event
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AggregateUpdate {
    /// Aggregates created or modified by this event (latest values)
    pub touched: Vec<DailyAggregate>,
    /// Aggregates that became final because the watermark moved past them
    pub sealed: Vec<DailyAggregate>,
    /// The event was out of order and its duration was clamped or ignored
    pub anomaly: bool,
}

pub struct DailyAggregator {
    /// Start of the currently open interval per fingerprint
    open: FxHashMap<FingerprintId, DateTime<Utc>>,
    aggregates: FxHashMap<(FingerprintId, NaiveDate), DailyAggregate>,
    /// Latest event timestamp seen
    watermark: Option<DateTime<Utc>>,
    /// Watermark date of the last full seal pass
    sealed_through: Option<NaiveDate>,
    /// Sealed aggregates older than this many days before the watermark are dropped
    retention_days: u32,
    #[cfg(test)]
    full_passes: usize,
}

impl DailyAggregator {
    pub fn new(retention_days: u32) -> Self {
        Self {
            open: FxHashMap::default(),
            aggregates: FxHashMap::default(),
            watermark: None,
            sealed_through: None,
            retention_days,
            #[cfg(test)]
            full_passes: 0,
        }
    }

    /// Apply one presence event
    pub fn apply(&mut self, event: &PresenceEvent) -> AggregateUpdate {
        let mut update = AggregateUpdate::default();
        let fingerprint = &event.fingerprint;
        let mut closed_dates: SmallVec<[NaiveDate; 2]> = SmallVec::new();

        match event.kind {
            TransitionKind::Enter => {
                if let Some(previous) = self.open.get(fingerprint) {
                    // ENTER without LEAVE (gap in history); keep the earlier interval open
                    warn!(
                        fingerprint = %fingerprint,
                        open_since = %previous,
                        "aggregate_enter_while_open"
                    );
                    update.anomaly = true;
                } else {
                    self.open.insert(fingerprint.clone(), event.timestamp);
                }
                let date = event.timestamp.date_naive();
                let aggregate = self.aggregate_mut(fingerprint, date);
                aggregate.enter_count += 1;
                update.touched.push(aggregate.clone());
            }
            TransitionKind::Leave => match self.open.remove(fingerprint) {
                Some(started) => {
                    let split = split_by_day(started, event.timestamp);
                    if split.clamped {
                        warn!(
                            fingerprint = %fingerprint,
                            started = %started,
                            ended = %event.timestamp,
                            "aggregate_negative_interval_clamped"
                        );
                        update.anomaly = true;
                    }
                    for (date, ms) in split.parts {
                        closed_dates.push(date);
                        let aggregate = self.aggregate_mut(fingerprint, date);
                        if aggregate.sealed {
                            warn!(fingerprint = %fingerprint, date = %date, "aggregate_credit_after_seal");
                            update.anomaly = true;
                        }
                        aggregate.dwell_ms += ms;
                        update.touched.push(aggregate.clone());
                    }
                }
                None => {
                    debug!(fingerprint = %fingerprint, "aggregate_leave_without_enter");
                    update.anomaly = true;
                }
            },
        }

        if self.watermark.map_or(true, |w| event.timestamp > w) {
            self.watermark = Some(event.timestamp);
        }
        update.sealed = self.seal(fingerprint, &closed_dates);

        // Touched aggregates that were sealed in the same step report as final
        for touched in &mut update.touched {
            if let Some(current) = self.aggregates.get(&(touched.fingerprint.clone(), touched.date))
            {
                touched.sealed = current.sealed;
            }
        }
        update
    }

    fn aggregate_mut(
        &mut self,
        fingerprint: &FingerprintId,
        date: NaiveDate,
    ) -> &mut DailyAggregate {
        self.aggregates
            .entry((fingerprint.clone(), date))
            .or_insert_with(|| DailyAggregate::new(fingerprint.clone(), date))
    }

    /// Seal what the latest event made final. A new watermark date runs
    /// the full pass; otherwise only the dates a LEAVE just closed can change.
    fn seal(
        &mut self,
        fingerprint: &FingerprintId,
        closed_dates: &[NaiveDate],
    ) -> Vec<DailyAggregate> {
        let Some(today) = self.watermark.map(|w| w.date_naive()) else {
            return Vec::new();
        };
        if self.sealed_through != Some(today) {
            self.sealed_through = Some(today);
            return self.seal_elapsed(today);
        }

        let mut sealed = Vec::new();
        for date in closed_dates {
            if let Some(aggregate) = self.aggregates.get_mut(&(fingerprint.clone(), *date)) {
                if try_seal(&self.open, aggregate, today) {
                    sealed.push(aggregate.clone());
                }
            }
        }
        sealed
    }

    /// Seal every date before `today` that no open interval covers, then
    /// prune sealed aggregates beyond retention.
    fn seal_elapsed(&mut self, today: NaiveDate) -> Vec<DailyAggregate> {
        #[cfg(test)]
        {
            self.full_passes += 1;
        }
        let mut sealed = Vec::new();
        for aggregate in self.aggregates.values_mut() {
            if try_seal(&self.open, aggregate, today) {
                sealed.push(aggregate.clone());
            }
        }

        if let Some(horizon) = today.checked_sub_days(Days::new(u64::from(self.retention_days))) {
            self.aggregates.retain(|(_, date), aggregate| !aggregate.sealed || *date >= horizon);
        }

        sealed.sort_by(|a, b| (a.date, &a.fingerprint).cmp(&(b.date, &b.fingerprint)));
        sealed
    }

    /// Current aggregate for a fingerprint and date
    pub fn get(&self, fingerprint: &FingerprintId, date: NaiveDate) -> Option<&DailyAggregate> {
        self.aggregates.get(&(fingerprint.clone(), date))
    }

    /// Total dwell credited to a fingerprint across retained dates
    pub fn total_dwell_ms(&self, fingerprint: &FingerprintId) -> u64 {
        self.aggregates
            .iter()
            .filter(|((fp, _), _)| fp == fingerprint)
            .map(|(_, aggregate)| aggregate.dwell_ms)
            .sum()
    }

    /// Whether a fingerprint has an open interval
    pub fn is_open(&self, fingerprint: &FingerprintId) -> bool {
        self.open.contains_key(fingerprint)
    }

    /// All non-final aggregates, ordered by date then fingerprint (shutdown flush)
    pub fn pending(&self) -> Vec<DailyAggregate> {
        let mut pending: Vec<DailyAggregate> =
            self.aggregates.values().filter(|a| !a.sealed).cloned().collect();
        pending.sort_by(|a, b| (a.date, &a.fingerprint).cmp(&(b.date, &b.fingerprint)));
        pending
    }

    /// All retained aggregates, ordered by date then fingerprint
    pub fn all(&self) -> Vec<DailyAggregate> {
        let mut all: Vec<DailyAggregate> = self.aggregates.values().cloned().collect();
        all.sort_by(|a, b| (a.date, &a.fingerprint).cmp(&(b.date, &b.fingerprint)));
        all
    }
}

/// Mark an elapsed, uncovered aggregate final. Returns whether it changed.
fn try_seal(
    open: &FxHashMap<FingerprintId, DateTime<Utc>>,
    aggregate: &mut DailyAggregate,
    today: NaiveDate,
) -> bool {
    if aggregate.sealed || aggregate.date >= today {
        return false;
    }
    let covered = open
        .get(&aggregate.fingerprint)
        .is_some_and(|start| start.date_naive() <= aggregate.date);
    if covered {
        return false;
    }
    aggregate.sealed = true;
    true
}
