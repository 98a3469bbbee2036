//! Scheduled status automation: hourly auto-solve and auto-close sweeps and
//! the daily backlog snapshot. Each task is independently fallible; one
//! failing never stops the others in the same cycle.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::config::load_settings;
use crate::shared::state::AppState;
use crate::tickets::lifecycle;

// sec min hour day month weekday
const HOURLY: &str = "0 0 * * * *";
const DAILY_MIDNIGHT: &str = "0 0 0 * * *";

pub struct AutomationService {
    state: Arc<AppState>,
}

impl AutomationService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn run(self) {
        info!("automation service started");
        let hourly = Schedule::from_str(HOURLY).expect("hourly cron expression");
        let daily = Schedule::from_str(DAILY_MIDNIGHT).expect("daily cron expression");
        let mut last_hourly = Utc::now();
        let mut last_daily = Utc::now();

        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if due(&hourly, now, last_hourly) {
                last_hourly = now;
                self.run_hourly_cycle();
            }
            if due(&daily, now, last_daily) {
                last_daily = now;
                self.run_daily_cycle();
            }
        }
    }

    /// Auto-solve then auto-close. Thresholds are read fresh each cycle so
    /// settings changes apply without a restart.
    fn run_hourly_cycle(&self) {
        let mut conn = match self.state.conn.get() {
            Ok(conn) => conn,
            Err(e) => {
                error!("automation cycle skipped, no database connection: {e}");
                return;
            }
        };
        let settings = match load_settings(&mut conn) {
            Ok(settings) => settings,
            Err(e) => {
                error!("automation cycle skipped, settings unavailable: {e}");
                return;
            }
        };

        if settings.auto_solve_enabled {
            match lifecycle::run_auto_solve(&mut conn, &self.state.config, settings.auto_solve_hours)
            {
                Ok((_, jobs)) => self.state.mailer.dispatch(jobs),
                Err(e) => error!("auto-solve task failed: {e}"),
            }
        }
        if settings.auto_close_enabled {
            if let Err(e) = lifecycle::run_auto_close(&mut conn, settings.auto_close_hours) {
                error!("auto-close task failed: {e}");
            }
        }
    }

    fn run_daily_cycle(&self) {
        let mut conn = match self.state.conn.get() {
            Ok(conn) => conn,
            Err(e) => {
                error!("backlog snapshot skipped, no database connection: {e}");
                return;
            }
        };
        match lifecycle::capture_backlog_snapshot(&mut conn) {
            Ok(snapshot) => info!(
                "backlog snapshot for {}: new={} open={} pending={} on_hold={}",
                snapshot.snapshot_date,
                snapshot.new_count,
                snapshot.open_count,
                snapshot.pending_count,
                snapshot.on_hold_count,
            ),
            Err(e) => error!("backlog snapshot failed: {e}"),
        }
    }
}

/// A schedule is due when an occurrence falls between the previous firing
/// checkpoint and now. The caller advances the checkpoint on fire, so each
/// occurrence runs exactly once and never before its scheduled time.
fn due(schedule: &Schedule, now: DateTime<Utc>, since: DateTime<Utc>) -> bool {
    schedule
        .after(&since)
        .next()
        .map(|next| next <= now)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
        Utc::now()
            .date_naive()
            .and_hms_opt(hour, min, sec)
            .expect("valid time")
            .and_utc()
    }

    #[test]
    fn hourly_schedule_fires_only_once_the_hour_has_passed() {
        let schedule = Schedule::from_str(HOURLY).expect("cron");
        // Before the top of the hour nothing is due, however close.
        assert!(!due(&schedule, at(10, 59, 30), at(10, 30, 0)));
        // The first check after 11:00 fires.
        assert!(due(&schedule, at(11, 0, 30), at(10, 59, 30)));
    }

    #[test]
    fn fired_occurrence_does_not_refire() {
        let schedule = Schedule::from_str(HOURLY).expect("cron");
        // Checkpoint advanced past 11:00; next occurrence is 12:00.
        assert!(!due(&schedule, at(11, 1, 30), at(11, 0, 30)));
    }
}
