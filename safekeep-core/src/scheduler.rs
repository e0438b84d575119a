/*!
Scheduled backups.

The scheduler reads the persisted backup config and, when auto backup is
enabled, arms a background task that sleeps until the next matching local
time, runs a FULL backup and then enforces retention.

```text
STOPPED --initialize (auto on)--> ARMED
ARMED   --initialize-->           ARMED   (old timer stopped first)
ARMED   --stop | auto off-->      STOPPED
```
*/

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, TimeZone,
    Timelike, Utc,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backup::BackupOrchestrator;
use crate::model::{BackupConfig, BackupFrequency, BackupOptions, BackupRecord, BackupType};
use crate::{BackupError, Result};

/// Cron-style trigger for a frequency and `HH:MM` time of day
///
/// Unparseable times fall back to 02:00.
pub fn cron_expression(frequency: BackupFrequency, backup_time: &str) -> String {
    let (hour, minute) = crate::model::parse_time_of_day(backup_time).unwrap_or((2, 0));
    BackupSchedule {
        frequency,
        hour,
        minute,
    }
    .cron_expression()
}

/// When scheduled backups fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupSchedule {
    pub frequency: BackupFrequency,
    pub hour: u32,
    pub minute: u32,
}

impl BackupSchedule {
    pub fn from_config(config: &BackupConfig) -> Self {
        let (hour, minute) = config.backup_hour_minute();
        Self {
            frequency: config.backup_frequency,
            hour,
            minute,
        }
    }

    pub fn cron_expression(&self) -> String {
        let (h, m) = (self.hour, self.minute);
        match self.frequency {
            BackupFrequency::Hourly => format!("{m} * * * *"),
            BackupFrequency::Daily => format!("{m} {h} * * *"),
            BackupFrequency::Weekly => format!("{m} {h} * * 0"),
            BackupFrequency::Monthly => format!("{m} {h} 1 * *"),
        }
    }

    /// First matching minute strictly after `now`, in `now`'s time zone
    ///
    /// Local times skipped by a DST transition move to the next valid hour.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = now.timezone();
        let local_now = now.naive_local();
        let mut candidate = self.next_naive_after(local_now)?;

        for _ in 0..3 {
            if let Some(resolved) = tz.from_local_datetime(&candidate).earliest() {
                if resolved > *now {
                    return Some(resolved);
                }
            }
            candidate += ChronoDuration::hours(1);
        }
        None
    }

    fn next_naive_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let today = now.date();
        let at = |date: NaiveDate| date.and_hms_opt(self.hour, self.minute, 0);

        match self.frequency {
            BackupFrequency::Hourly => {
                let candidate = today.and_hms_opt(now.hour(), self.minute, 0)?;
                Some(if candidate > now {
                    candidate
                } else {
                    candidate + ChronoDuration::hours(1)
                })
            }
            BackupFrequency::Daily => {
                let candidate = at(today)?;
                Some(if candidate > now {
                    candidate
                } else {
                    candidate + ChronoDuration::days(1)
                })
            }
            BackupFrequency::Weekly => {
                let days_to_sunday = (7 - today.weekday().num_days_from_sunday()) % 7;
                let candidate = at(today + ChronoDuration::days(i64::from(days_to_sunday)))?;
                Some(if candidate > now {
                    candidate
                } else {
                    candidate + ChronoDuration::days(7)
                })
            }
            BackupFrequency::Monthly => {
                let candidate = at(today.with_day(1)?)?;
                if candidate > now {
                    return Some(candidate);
                }
                let (year, month) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                at(NaiveDate::from_ymd_opt(year, month, 1)?)
            }
        }
    }
}

enum SchedulerState {
    Stopped,
    Armed {
        schedule: BackupSchedule,
        next_run: Arc<Mutex<Option<DateTime<Utc>>>>,
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    },
}

/// Arms and disarms the scheduled backup timer
pub struct BackupScheduler {
    backups: Arc<BackupOrchestrator>,
    state: Mutex<SchedulerState>,
}

impl BackupScheduler {
    pub fn new(backups: Arc<BackupOrchestrator>) -> Self {
        Self {
            backups,
            state: Mutex::new(SchedulerState::Stopped),
        }
    }

    /// Re-read the backup config and (re)arm the timer
    ///
    /// Any existing timer is stopped first, so repeated calls never
    /// double-schedule. Returns whether a timer is armed afterwards.
    /// Must be called inside a tokio runtime.
    pub async fn initialize(&self) -> Result<bool> {
        let config = self.backups.ensure_initialized().await?;
        self.stop();

        if !config.auto_backup_enabled {
            info!("Auto backup disabled, scheduler not armed");
            return Ok(false);
        }

        let schedule = BackupSchedule::from_config(&config);
        let next_run = Arc::new(Mutex::new(None));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_timer(
            self.backups.clone(),
            schedule,
            next_run.clone(),
            shutdown_rx,
        ));

        *self.lock_state() = SchedulerState::Armed {
            schedule,
            next_run,
            shutdown,
            handle,
        };
        info!(
            cron = %schedule.cron_expression(),
            frequency = %schedule.frequency,
            "Backup scheduler armed"
        );
        Ok(true)
    }

    /// Disarm the timer
    ///
    /// A backup already running finishes; no further backups start.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), SchedulerState::Stopped);
        if let SchedulerState::Armed { shutdown, .. } = previous {
            // Err only when the timer task already exited
            let _ = shutdown.send(());
            debug!("Backup scheduler stopped");
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(
            &*self.lock_state(),
            SchedulerState::Armed { handle, .. } if !handle.is_finished()
        )
    }

    /// Active schedule, if armed
    pub fn schedule(&self) -> Option<BackupSchedule> {
        match &*self.lock_state() {
            SchedulerState::Armed { schedule, .. } => Some(*schedule),
            SchedulerState::Stopped => None,
        }
    }

    /// When the next scheduled backup fires
    ///
    /// Reports the armed timer's deadline, or, when not armed, the time a
    /// timer armed now would fire. `None` when auto backup is disabled.
    pub async fn next_backup_time(&self) -> Result<Option<DateTime<Utc>>> {
        let armed = match &*self.lock_state() {
            SchedulerState::Armed { next_run, .. } => {
                *next_run.lock().unwrap_or_else(PoisonError::into_inner)
            }
            SchedulerState::Stopped => None,
        };
        if armed.is_some() {
            return Ok(armed);
        }

        let config = self.backups.get_config().await?;
        if !config.auto_backup_enabled {
            return Ok(None);
        }
        Ok(BackupSchedule::from_config(&config)
            .next_after(&Local::now())
            .map(|next| next.with_timezone(&Utc)))
    }

    /// Run the scheduled job body immediately
    pub async fn run_now(&self) -> Result<BackupRecord> {
        run_scheduled_backup(&self.backups).await
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_timer(
    backups: Arc<BackupOrchestrator>,
    schedule: BackupSchedule,
    next_run: Arc<Mutex<Option<DateTime<Utc>>>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let now = Local::now();
        let Some(next) = schedule.next_after(&now) else {
            error!(cron = %schedule.cron_expression(), "No next run time, scheduler exiting");
            break;
        };
        *next_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(next.with_timezone(&Utc));
        let wait = (next - now).to_std().unwrap_or_default();
        debug!(next_run = %next, wait_secs = wait.as_secs(), "Waiting for next scheduled backup");

        tokio::select! {
            _ = &mut shutdown => {
                info!("Backup scheduler shutting down");
                break;
            }
            _ = tokio::time::sleep(wait) => {
                if let Err(e) = run_scheduled_backup(&backups).await {
                    error!(error = %e, "Scheduled backup failed");
                }
            }
        }
    }
}

/// FULL backup credited to the first administrator, then bookkeeping
async fn run_scheduled_backup(backups: &BackupOrchestrator) -> Result<BackupRecord> {
    let config = backups.ensure_initialized().await?;
    let admin = backups
        .catalog()
        .first_admin()
        .await?
        .ok_or_else(|| BackupError::Schedule("no administrator account to credit".to_string()))?;

    let name = format!(
        "Scheduled Backup - {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    let options = BackupOptions::new()
        .encrypt(config.encryption_enabled)
        .compress(true)
        .upload_to_cloud(config.cloud_sync_enabled());

    let record = backups
        .create_backup(BackupType::Full, &admin, Some(&name), options)
        .await?;

    let mut latest = backups.ensure_initialized().await?;
    latest.last_auto_backup = record.completed_at;
    backups.catalog().save_config(&latest).await?;

    match backups.enforce_retention().await {
        Ok(deleted) if !deleted.is_empty() => {
            info!(deleted = deleted.len(), "Retention applied after scheduled backup")
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Retention failed after scheduled backup"),
    }

    info!(backup_id = %record.id, credited_to = %admin, "Scheduled backup completed");
    Ok(record)
}
