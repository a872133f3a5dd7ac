//! Collects the per-worker reports emitted during shutdown

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

use forkline_ipc::{Outcome, WorkerId};

#[derive(Debug)]
struct ReportTable<P> {
    slots: Vec<Option<Outcome<P>>>,
    received: usize,
}

/// Table of at most one report per worker, with a bounded wait for all of them
#[derive(Debug)]
pub struct ReportAggregator<P> {
    table: Mutex<ReportTable<P>>,
    complete: Condvar,
}

impl<P> ReportAggregator<P> {
    /// Table of `worker_count` absent slots
    pub fn new(worker_count: usize) -> Self {
        Self {
            table: Mutex::new(ReportTable {
                slots: (0..worker_count).map(|_| None).collect(),
                received: 0,
            }),
            complete: Condvar::new(),
        }
    }

    /// Store the report of `worker_id`.
    ///
    /// Ids outside `[0, worker_count)` and second reports for the same
    /// worker are logged and dropped. Returns whether the report was stored.
    pub fn record(&self, worker_id: WorkerId, report: Outcome<P>) -> bool {
        let mut table = self.table.lock();
        let worker_count = table.slots.len();

        let Some(slot) = table.slots.get_mut(worker_id as usize) else {
            warn!(worker_id, worker_count, "Discarding report with out-of-range worker id");
            return false;
        };

        if slot.is_some() {
            warn!(worker_id, "Discarding duplicate report");
            return false;
        }

        *slot = Some(report);
        table.received += 1;
        if table.received == worker_count {
            self.complete.notify_all();
        }
        true
    }

    /// Number of reports received so far
    pub fn received(&self) -> usize {
        self.table.lock().received
    }

    /// Whether every worker has reported
    pub fn is_complete(&self) -> bool {
        let table = self.table.lock();
        table.received == table.slots.len()
    }

    /// Block until every worker reported or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();

        while table.received < table.slots.len() {
            if self.complete.wait_until(&mut table, deadline).timed_out() {
                return table.received == table.slots.len();
            }
        }
        true
    }

    /// Lowest worker id without a report
    pub fn first_missing(&self) -> Option<WorkerId> {
        self.missing().into_iter().next()
    }

    /// Every worker id without a report
    pub fn missing(&self) -> Vec<WorkerId> {
        let table = self.table.lock();
        table
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(id, _)| id as WorkerId)
            .collect()
    }

    /// Take the table, leaving absent slots behind
    pub fn take(&self) -> Vec<Option<Outcome<P>>> {
        let mut table = self.table.lock();
        table.received = 0;
        table.slots.iter_mut().map(Option::take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkline_ipc::{ErrorInfo, ErrorKind};

    #[test]
    fn test_records_and_completes() {
        let reports = ReportAggregator::new(2);
        assert!(!reports.is_complete());

        assert!(reports.record(1, Ok("b".to_string())));
        assert_eq!(reports.first_missing(), Some(0));
        assert!(reports.record(0, Ok("a".to_string())));

        assert!(reports.is_complete());
        assert!(reports.wait(Duration::from_millis(1)));
        assert_eq!(
            reports.take(),
            vec![Some(Ok("a".to_string())), Some(Ok("b".to_string()))]
        );
    }

    #[test]
    fn test_upper_bound_is_exclusive() {
        let reports = ReportAggregator::<u8>::new(2);
        assert!(!reports.record(2, Ok(1)));
        assert!(!reports.record(u32::MAX, Ok(1)));
        assert_eq!(reports.received(), 0);
        assert_eq!(reports.missing(), vec![0, 1]);
    }

    #[test]
    fn test_duplicate_report_is_ignored() {
        let reports = ReportAggregator::<u8>::new(2);
        assert!(reports.record(0, Ok(1)));
        assert!(!reports.record(0, Ok(2)));
        assert_eq!(reports.received(), 1);
        assert_eq!(reports.take()[0], Some(Ok(1)));
    }

    #[test]
    fn test_error_reports_fill_slots() {
        let reports = ReportAggregator::<u8>::new(1);
        let error = ErrorInfo::new(ErrorKind::Report, "stats unavailable");
        assert!(reports.record(0, Err(error.clone())));
        assert!(reports.is_complete());
        assert_eq!(reports.take(), vec![Some(Err(error))]);
    }

    #[test]
    fn test_wait_times_out_with_missing_worker() {
        let reports = ReportAggregator::<u8>::new(3);
        reports.record(0, Ok(0));
        reports.record(2, Ok(2));

        let started = Instant::now();
        assert!(!reports.wait(Duration::from_millis(40)));
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(reports.first_missing(), Some(1));
    }

    #[test]
    fn test_wait_wakes_on_last_report() {
        let reports = std::sync::Arc::new(ReportAggregator::<u8>::new(1));
        let writer = std::sync::Arc::clone(&reports);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.record(0, Ok(9));
        });

        assert!(reports.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
