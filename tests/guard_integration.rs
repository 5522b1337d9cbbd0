use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use ars::config::RateLimitSettings;
use ars::db::models::Tenant;
use ars::db::Database;
use ars::guard::{BlockReason, GuardDecision, RateLimiter};

fn temp_db_path() -> PathBuf {
    let root = std::env::temp_dir().join(format!("ars-guard-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    root.join("ars.db")
}

fn seeded(path: &Path) -> Database {
    let db = Database::open(path).expect("open db");
    db.upsert_tenant(&Tenant::new("t-1", "office@example.edu"))
        .expect("insert tenant");
    db
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 3, 10, 0, 0).unwrap()
}

/// Largest number of `sends` falling in any half-open window of `span`.
fn busiest_window(sends: &[DateTime<Utc>], span: Duration) -> usize {
    sends
        .iter()
        .map(|start| {
            sends
                .iter()
                .filter(|at| **at >= *start && **at < *start + span)
                .count()
        })
        .max()
        .unwrap_or(0)
}

fn open_limits() -> RateLimitSettings {
    RateLimitSettings {
        burst_limit: 1_000,
        burst_window_secs: 300,
        max_per_minute: 1_000,
        max_per_hour: 1_000,
        max_per_day: 1_000,
        min_interval_secs: 0,
        emergency_30s_threshold: 0,
        emergency_60s_threshold: 0,
    }
}

#[test]
fn concurrent_connections_never_exceed_the_burst_limit() {
    let path = temp_db_path();
    drop(seeded(&path));

    let limits = RateLimitSettings {
        burst_limit: 5,
        ..open_limits()
    };
    let now = start();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let db = Database::open(&path).expect("open db in worker");
                let limiter = RateLimiter::new(&db);
                barrier.wait();
                (0..10)
                    .filter(|_| {
                        limiter
                            .check_and_record("t-1", &limits, now)
                            .expect("check")
                            .is_allowed()
                    })
                    .count()
            })
        })
        .collect();

    let allowed: usize = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker thread"))
        .sum();
    assert_eq!(allowed, 5);

    let db = Database::open(&path).expect("reopen db");
    let state = db
        .get_rate_limit_state("t-1")
        .expect("load")
        .expect("state");
    assert_eq!(state.burst_count, 5);
    assert_eq!(state.hourly_count, 5);

    if let Some(root) = path.parent() {
        let _ = std::fs::remove_dir_all(root);
    }
}

#[test]
fn hourly_and_daily_caps_hold_over_two_days_of_attempts() {
    let path = temp_db_path();
    let db = seeded(&path);
    let limiter = RateLimiter::new(&db);
    let limits = RateLimitSettings {
        max_per_hour: 4,
        max_per_day: 30,
        ..open_limits()
    };

    let mut sends = Vec::new();
    let mut per_day = [0usize; 3];
    for hour in 0..48 {
        for attempt in 0..6 {
            let now = start() + Duration::hours(hour) + Duration::minutes(attempt * 5);
            if limiter
                .check_and_record("t-1", &limits, now)
                .expect("check")
                .is_allowed()
            {
                sends.push(now);
                let day = (now.date_naive() - start().date_naive()).num_days() as usize;
                per_day[day] += 1;
            }
        }
    }

    assert!(busiest_window(&sends, Duration::hours(1)) <= 4);
    assert_eq!(busiest_window(&sends, Duration::days(1)), 30);
    // 14 hours remain on the first day: 4 per hour reaches the daily cap.
    assert_eq!(per_day[0], 30);

    if let Some(root) = path.parent() {
        let _ = std::fs::remove_dir_all(root);
    }
}

#[test]
fn default_hourly_cap_holds_over_every_rolling_hour() {
    let path = temp_db_path();
    let db = seeded(&path);
    let limiter = RateLimiter::new(&db);
    let limits = RateLimitSettings::default();
    let first = start() + Duration::minutes(30);

    let sends: Vec<_> = (0..360)
        .map(|step| first + Duration::seconds(step * 30))
        .filter(|now| {
            limiter
                .check_and_record("t-1", &limits, *now)
                .expect("check")
                .is_allowed()
        })
        .collect();

    assert!(sends.len() > 15);
    assert_eq!(
        busiest_window(&sends, Duration::hours(1)),
        limits.max_per_hour as usize
    );

    if let Some(root) = path.parent() {
        let _ = std::fs::remove_dir_all(root);
    }
}

#[test]
fn minimum_interval_spaces_consecutive_sends() {
    let path = temp_db_path();
    let db = seeded(&path);
    let limiter = RateLimiter::new(&db);
    let limits = RateLimitSettings {
        min_interval_secs: 180,
        ..open_limits()
    };

    assert!(limiter
        .check_and_record("t-1", &limits, start())
        .expect("first")
        .is_allowed());
    match limiter
        .check_and_record("t-1", &limits, start() + Duration::seconds(60))
        .expect("second")
    {
        GuardDecision::Blocked(BlockReason::MinInterval { remaining_secs }) => {
            assert_eq!(remaining_secs, 120)
        }
        other => panic!("expected min-interval block, got {other:?}"),
    }
    assert!(limiter
        .check_and_record("t-1", &limits, start() + Duration::seconds(180))
        .expect("third")
        .is_allowed());

    let snapshot = limiter
        .snapshot("t-1", &limits, start() + Duration::seconds(200))
        .expect("snapshot");
    assert_eq!(snapshot.hour.used, 2);
    assert_eq!(snapshot.next_send_in_secs, 160);

    assert!(limiter.reset("t-1").expect("reset"));
    let cleared = limiter
        .snapshot("t-1", &limits, start() + Duration::seconds(200))
        .expect("snapshot");
    assert_eq!(cleared.hour.used, 0);
    assert_eq!(cleared.next_send_in_secs, 0);

    if let Some(root) = path.parent() {
        let _ = std::fs::remove_dir_all(root);
    }
}
