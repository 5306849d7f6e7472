//! Cron-driven backup cadence
//!
//! [`BackupScheduler`] only ever calls [`BackupService::create_backup`]; it
//! decides when and which type, nothing else. A tick that finds another job
//! in flight is skipped. An incremental tick with no full backup to build on
//! is logged and dropped, never turned into a full backup.
//!
//! Cron expressions use the six-field form with seconds, e.g.
//! `"0 0 2 * * Sun"` for a weekly full at 02:00.

use crate::error::{BackupError, Result};
use crate::service::BackupService;
use crate::types::BackupType;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Runs backups on cron schedules
pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    service: Arc<BackupService>,
}

impl BackupScheduler {
    /// Create a stopped scheduler driving `service`
    pub async fn new(service: Arc<BackupService>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            service,
        })
    }

    /// Register a job creating a `backup_type` backup on `cron`
    pub async fn schedule(&self, cron: &str, backup_type: BackupType) -> Result<()> {
        let service = Arc::clone(&self.service);

        let job = Job::new_async(cron, move |_uuid, _lock| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                run_tick(&service, backup_type).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        info!(cron = %cron, backup_type = %backup_type, "Backup scheduled");
        Ok(())
    }

    /// Register the cadences from the service configuration
    ///
    /// Returns how many jobs were registered.
    pub async fn schedule_from_config(&self) -> Result<usize> {
        let Some(schedule) = self.service.config().schedule.clone() else {
            return Ok(0);
        };

        let mut count = 0;
        for (cron, backup_type) in [
            (schedule.full, BackupType::Full),
            (schedule.incremental, BackupType::Incremental),
        ] {
            if let Some(cron) = cron.filter(|c| !c.trim().is_empty()) {
                self.schedule(&cron, backup_type).await?;
                count += 1;
            }
        }
        info!(count, "Cron schedules initialized");
        Ok(count)
    }

    /// Register the configured cadences and start ticking
    pub async fn start_from_config(&self) -> Result<usize> {
        let count = self.schedule_from_config().await?;
        self.start().await?;
        Ok(count)
    }

    /// Start ticking
    pub async fn start(&self) -> Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    /// Stop ticking. In-flight backups run to completion.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        info!("Backup scheduler stopped");
        Ok(())
    }
}

/// Body of one scheduled tick
pub(crate) async fn run_tick(service: &BackupService, backup_type: BackupType) {
    if service.is_busy() {
        warn!(
            backup_type = %backup_type,
            "Skipping scheduled run: a backup job is already running"
        );
        return;
    }

    info!(backup_type = %backup_type, "Starting scheduled backup");
    match service.create_backup(backup_type).await {
        Ok(id) => info!(backup_id = %id, "Scheduled backup completed"),
        Err(BackupError::NoBaseline) => {
            warn!("Scheduled incremental skipped: no full backup to build on yet")
        }
        Err(e) => error!(backup_type = %backup_type, error = %e, "Scheduled backup failed"),
    }
}
