//! Shutdown, report collection and failure paths of the worker pool

mod common;

use std::time::{Duration, Instant};

use common::{capture_warnings, serial, Bulky, Collected, Faults, Square, WAIT};
use forkline_config::PoolConfig;
use forkline_execution::{ErrorKind, Pool, PoolError, ResultHandlers};

#[test]
fn test_close_returns_one_report_per_worker() {
    let _serial = serial();

    let mut pool = Pool::new(Square::build, Faults::default(), PoolConfig::with_workers(3)).unwrap();
    let pids = pool.worker_pids();

    let result = pool.submit(0..30, None, None).unwrap();
    assert!(result.wait(WAIT));

    let reports = pool.close().unwrap();
    assert_eq!(reports.len(), 3);

    let summaries: Vec<_> = reports
        .into_iter()
        .map(|report| report.expect("every worker reports").expect("report succeeds"))
        .collect();

    // Slot i belongs to worker i
    for (summary, pid) in summaries.iter().zip(&pids) {
        assert_eq!(summary.pid, *pid);
    }
    assert_eq!(summaries.iter().map(|s| s.jobs).sum::<u64>(), 30);

    assert!(pool.is_closed());
    assert_eq!(pool.alive_workers(), 0);
}

#[test]
fn test_close_without_jobs() {
    let _serial = serial();

    let mut pool = Pool::new(Square::build, Faults::default(), PoolConfig::with_workers(2)).unwrap();
    let reports = pool.close().unwrap();

    assert_eq!(reports.len(), 2);
    for report in reports {
        assert_eq!(report.unwrap().unwrap().jobs, 0);
    }
}

#[test]
fn test_failed_initialize_leaves_absent_report() {
    let _serial = serial();

    let faults = Faults {
        fail_init: true,
        ..Faults::default()
    };
    let config = PoolConfig::with_workers(2).report_timeout(Duration::from_millis(200));
    let mut pool = Pool::new(Square::build, faults, config).unwrap();

    // Workers exit right after failing; fail fast instead of queueing jobs
    let deadline = Instant::now() + Duration::from_secs(10);
    while pool.alive_workers() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(matches!(
        pool.submit(vec![1, 2, 3], None, None),
        Err(PoolError::DeadWorker { .. })
    ));

    let started = Instant::now();
    let (reports, logged) = capture_warnings(|| pool.close().unwrap());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(Option::is_none));

    // The timeout warning names the lowest missing worker
    assert!(logged.contains("Timed out waiting for worker report"), "{}", logged);
    assert!(logged.contains("worker_id=0"), "{}", logged);
}

#[test]
fn test_failed_report_is_error_valued() {
    let _serial = serial();

    let faults = Faults {
        fail_report: true,
        ..Faults::default()
    };
    let mut pool = Pool::new(Square::build, faults, PoolConfig::with_workers(2)).unwrap();
    let result = pool.submit(0..4, None, None).unwrap();
    assert!(result.wait(WAIT));

    let reports = pool.close().unwrap();
    assert_eq!(reports.len(), 2);
    for (worker_id, report) in reports.into_iter().enumerate() {
        let error = report.expect("slot is filled").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Report);
        assert_eq!(error.message, "summary store unavailable");
        assert_eq!(error.worker_id, Some(worker_id as u32));
    }
}

#[test]
fn test_closed_pool_rejects_further_use() {
    let _serial = serial();

    let mut pool = Pool::new(Square::build, Faults::default(), PoolConfig::with_workers(1)).unwrap();
    pool.close().unwrap();

    assert!(matches!(pool.submit(vec![1], None, None), Err(PoolError::PoolClosed)));
    assert!(matches!(pool.submit(Vec::new(), None, None), Err(PoolError::PoolClosed)));
    assert!(matches!(pool.close(), Err(PoolError::PoolClosed)));
}

#[test]
fn test_terminate_kills_workers() {
    let _serial = serial();

    let mut pool = Pool::new(Square::build, Faults::default(), PoolConfig::with_workers(2)).unwrap();
    assert_eq!(pool.alive_workers(), 2);

    pool.terminate();

    assert!(pool.is_closed());
    assert_eq!(pool.alive_workers(), 0);
    assert!(matches!(pool.close(), Err(PoolError::PoolClosed)));
}

#[test]
fn test_terminate_busy_pool_returns_and_wakes_waiters() {
    let _serial = serial();

    let mut pool = Pool::new(|_: &()| Bulky, (), PoolConfig::with_workers(4)).unwrap();
    let slow_callback =
        ResultHandlers::new().on_success(|_, _: String| std::thread::sleep(Duration::from_millis(50)));

    // Workers block mid-write on a full result pipe behind the slow callback
    let result = pool.submit(0..200, Some(slow_callback), Some(1)).unwrap();
    let waiter = {
        let result = result.clone();
        std::thread::spawn(move || result.wait(None))
    };
    std::thread::sleep(Duration::from_millis(300));

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        pool.terminate();
        let _ = done_tx.send(pool.alive_workers());
    });

    let alive = done_rx
        .recv_timeout(Duration::from_secs(20))
        .expect("terminate should return on a busy pool");
    assert_eq!(alive, 0);

    assert!(!waiter.join().unwrap());
    assert!(result.is_aborted());
    assert!(!result.is_ready());
}

#[test]
fn test_drop_reaps_workers() {
    let _serial = serial();

    let pids = {
        let pool = Pool::new(Square::build, Faults::default(), PoolConfig::with_workers(2)).unwrap();
        pool.worker_pids()
    };

    // Reaped children no longer exist
    for pid in pids {
        assert!(!process_exists(pid), "worker {} still exists after drop", pid);
    }
}

#[test]
fn test_set_handler_applies_to_later_submissions() {
    let _serial = serial();

    let mut pool = Pool::new(Square::build, Faults::default(), PoolConfig::with_workers(2)).unwrap();
    let collected = Collected::new();
    pool.set_handler(collected.handlers());

    let result = pool.submit(1..=6, None, None).unwrap();
    assert!(result.wait(WAIT));
    assert_eq!(collected.success_count(), 6);

    // An override replaces the installed callbacks
    let other = Collected::new();
    let result = pool.submit(1..=2, Some(other.handlers()), None).unwrap();
    assert!(result.wait(WAIT));
    assert_eq!(other.success_count(), 2);
    assert_eq!(collected.success_count(), 6);

    pool.close().unwrap();
}

fn process_exists(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}
