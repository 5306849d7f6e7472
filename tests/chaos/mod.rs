//! Chaos tests for tierback
//!
//! Damaged archives, damaged manifests, racing jobs and cancellation. Each
//! test checks that the failure is reported and that nothing is left half
//! written.

use ::tierback::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct ChaosFixture {
    temp_dir: TempDir,
    service: Arc<BackupService>,
}

impl ChaosFixture {
    async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let service = BackupService::builder()
            .backup_root(temp_dir.path().join("backups"))
            .data_root(temp_dir.path().join("data"))
            .build()
            .unwrap();
        service.initialize().await.unwrap();
        let fixture = Self {
            temp_dir,
            service: Arc::new(service),
        };
        for (i, level) in DataLevel::ALL.iter().enumerate() {
            for j in 0..10 {
                fixture.write(
                    &format!("{}/dir_{}/file_{}.dat", level, j % 3, j),
                    &format!("{}-{}-{}", level, i, j).repeat(50),
                );
            }
        }
        fixture
    }

    fn write(&self, relative: &str, content: &str) {
        let path = self.temp_dir.path().join("data").join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn archive_of(&self, id: &str) -> PathBuf {
        let record = self.service.catalog().get(id).unwrap();
        self.service.catalog().archive_path(&record)
    }

    fn target(&self) -> PathBuf {
        self.temp_dir.path().join("target")
    }

    fn temp_entries(&self) -> usize {
        fs::read_dir(self.service.catalog().temp_dir()).unwrap().count()
    }

    fn bulk(&self, files: usize) {
        for i in 0..files {
            self.write(&format!("cold/bulk/{}/{}.dat", i % 20, i), &"payload".repeat(200));
        }
    }
}

fn count_files(root: &Path) -> usize {
    utils::walk_files(root, &utils::ExcludeSet::default())
        .unwrap()
        .len()
}

fn truncate(path: &Path, len: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(len).unwrap();
}

#[tokio::test]
async fn test_truncated_archive_is_flagged() {
    let fixture = ChaosFixture::new().await;
    let id = fixture.service.create_backup(BackupType::Full).await.unwrap();
    let archive = fixture.archive_of(&id);
    let len = fs::metadata(&archive).unwrap().len();
    truncate(&archive, len / 2);

    let report = fixture.service.verify_backup(&id).await.unwrap();
    assert!(!report.valid);
    assert!(report.file_integrity);
    assert!(!report.checksum_match);
    assert!(!report.can_decompress);
    assert!(report.warnings.iter().any(|w| w.contains("bytes")));
}

#[tokio::test]
async fn test_deleted_archive_is_flagged() {
    let fixture = ChaosFixture::new().await;
    let id = fixture.service.create_backup(BackupType::Full).await.unwrap();
    fs::remove_file(fixture.archive_of(&id)).unwrap();

    let report = fixture.service.verify_backup(&id).await.unwrap();
    assert!(!report.valid);
    assert!(!report.file_integrity);
    assert!(!report.errors.is_empty());

    let err = fixture
        .service
        .restore_backup(&id, RestoreOptions::new(fixture.target()))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::NotFound(_)));
    assert!(!fixture.target().exists());
}

#[tokio::test]
async fn test_random_corruption_is_always_detected() {
    let fixture = ChaosFixture::new().await;
    let id = fixture.service.create_backup(BackupType::Full).await.unwrap();
    let archive = fixture.archive_of(&id);
    let pristine = fs::read(&archive).unwrap();
    let mut rng = StdRng::seed_from_u64(0x7135);

    for _ in 0..10 {
        let mut bytes = pristine.clone();
        let offset = rng.random_range(0..bytes.len());
        bytes[offset] ^= rng.random_range(1..=255u8);
        fs::write(&archive, &bytes).unwrap();

        let report = fixture.service.verify_backup(&id).await.unwrap();
        assert!(!report.valid, "corruption at byte {} went unnoticed", offset);
        assert!(!report.checksum_match);
    }

    fs::write(&archive, &pristine).unwrap();
    assert!(fixture.service.verify_backup(&id).await.unwrap().valid);
}

#[tokio::test]
async fn test_checksum_mismatch_leaves_target_untouched() {
    let fixture = ChaosFixture::new().await;
    let id = fixture.service.create_backup(BackupType::Full).await.unwrap();
    let archive = fixture.archive_of(&id);
    let mut bytes = fs::read(&archive).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(&archive, bytes).unwrap();

    let target = fixture.target();
    fs::create_dir_all(target.join("hot")).unwrap();
    fs::write(target.join("hot/precious.txt"), "do not touch").unwrap();

    let err = fixture
        .service
        .restore_backup(&id, RestoreOptions::new(&target).overwrite(true))
        .await
        .unwrap_err();
    match err {
        BackupError::ChecksumMismatch { id: failed, expected, actual } => {
            assert_eq!(failed, id);
            assert_ne!(expected, actual);
        }
        other => panic!("expected ChecksumMismatch, got {:?}", other),
    }
    assert_eq!(fs::read_to_string(target.join("hot/precious.txt")).unwrap(), "do not touch");
    assert_eq!(fs::read_dir(&target).unwrap().count(), 1);
    assert_eq!(fixture.temp_entries(), 0);
}

#[tokio::test]
async fn test_corrupt_archive_without_checksum_fails_to_decompress() {
    let fixture = ChaosFixture::new().await;
    let id = fixture.service.create_backup(BackupType::Full).await.unwrap();
    fs::write(fixture.archive_of(&id), b"this is not gzip").unwrap();

    let err = fixture
        .service
        .restore_backup(&id, RestoreOptions::new(fixture.target()).verify_checksum(false))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Decompression(_)));
    assert!(err.is_corruption());
}

#[tokio::test]
async fn test_missing_baseline_archive_blocks_restore_up_front() {
    let fixture = ChaosFixture::new().await;
    let full = fixture.service.create_backup(BackupType::Full).await.unwrap();
    fixture.write("hot/new.dat", "new");
    let inc = fixture.service.create_backup(BackupType::Incremental).await.unwrap();
    fs::remove_file(fixture.archive_of(&full)).unwrap();

    let err = fixture
        .service
        .restore_backup(&inc, RestoreOptions::new(fixture.target()))
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::NotFound(ref missing) if *missing == full));
    assert!(!fixture.target().exists());

    let report = fixture.service.verify_backup(&inc).await.unwrap();
    assert!(!report.valid);
    assert!(report.checksum_match);
}

#[tokio::test]
async fn test_corrupt_manifest_refuses_to_start() {
    let fixture = ChaosFixture::new().await;
    fixture.service.create_backup(BackupType::Full).await.unwrap();
    let manifest = fixture.temp_dir.path().join("backups/manifest.json");
    let text = fs::read_to_string(&manifest).unwrap();
    fs::write(&manifest, &text[..text.len() / 2]).unwrap();

    let reopened = BackupService::new(fixture.service.config().clone()).unwrap();
    let err = reopened.initialize().await.unwrap_err();
    assert!(matches!(err, BackupError::Json(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_are_serialized() {
    let fixture = ChaosFixture::new().await;
    fixture.service.create_backup(BackupType::Full).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..6 {
        let service = Arc::clone(&fixture.service);
        let backup_type = if i % 2 == 0 {
            BackupType::Incremental
        } else {
            BackupType::Full
        };
        handles.push(tokio::spawn(async move { service.create_backup(backup_type).await }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 6);

    let records = fixture.service.list_backups(None).await.unwrap();
    assert_eq!(records.len(), 7);
    for record in &records {
        assert!(fixture.service.catalog().archive_path(record).exists());
        assert!(fixture.service.verify_backup(&record.id).await.unwrap().valid);
    }
    assert_eq!(fixture.temp_entries(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_create_leaves_no_trace() {
    let fixture = ChaosFixture::new().await;
    for i in 0..200 {
        fixture.write(&format!("cold/bulk/{}.dat", i), &"payload".repeat(2_000));
    }

    let cancel = CancellationToken::new();
    let service = Arc::clone(&fixture.service);
    let token = cancel.clone();
    let job = tokio::spawn(async move {
        service
            .create_backup_with_cancel(BackupType::Full, token)
            .await
    });
    cancel.cancel();

    match job.await.unwrap() {
        Err(BackupError::Cancelled) => {
            assert!(fixture.service.list_backups(None).await.unwrap().is_empty());
        }
        Ok(id) => {
            // The job won the race and committed before the cancel landed
            assert!(fixture.service.verify_backup(&id).await.unwrap().valid);
        }
        Err(other) => panic!("unexpected error {:?}", other),
    }

    // The blocking step has stopped and released its scratch before returning
    assert_eq!(fixture.temp_entries(), 0);
    fixture.service.shutdown().await.unwrap();
    let blobs = fs::read_dir(fixture.temp_dir.path().join("backups/full")).unwrap().count();
    assert_eq!(blobs, fixture.service.list_backups(None).await.unwrap().len());
}

#[tokio::test]
async fn test_cancelled_restore_reports_cancelled() {
    let fixture = ChaosFixture::new().await;
    let id = fixture.service.create_backup(BackupType::Full).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = fixture
        .service
        .restore_backup_with_cancel(&id, RestoreOptions::new(fixture.target()), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Cancelled));
    assert!(err.is_recoverable());
    assert!(!fixture.target().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_mid_restore_stops_writing() {
    let fixture = ChaosFixture::new().await;
    fixture.bulk(3000);
    let id = fixture.service.create_backup(BackupType::Full).await.unwrap();

    let cancel = CancellationToken::new();
    let service = Arc::clone(&fixture.service);
    let token = cancel.clone();
    let target = fixture.target();
    let job = tokio::spawn(async move {
        service
            .restore_backup_with_cancel(&id, RestoreOptions::new(target), token)
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    cancel.cancel();

    let outcome = job.await.unwrap();
    let at_return = count_files(&fixture.target());
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(count_files(&fixture.target()), at_return);
    assert_eq!(fixture.temp_entries(), 0);

    match outcome {
        Err(BackupError::Cancelled) => {}
        Ok(restored) => assert_eq!(restored.files_restored as usize, at_return),
        Err(other) => panic!("unexpected error {:?}", other),
    }
    assert!(!fixture.service.is_busy());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initialize_waits_for_running_backup() {
    let fixture = ChaosFixture::new().await;
    fixture.bulk(3000);

    let service = Arc::clone(&fixture.service);
    let job = tokio::spawn(async move { service.create_backup(BackupType::Full).await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    fixture.service.initialize().await.unwrap();

    let id = job.await.unwrap().unwrap();
    let records = fixture.service.list_backups(None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].file_count, 3030);
    assert!(fixture.service.verify_backup(&id).await.unwrap().valid);

    // A fresh load agrees with the in-memory catalog
    fixture.service.initialize().await.unwrap();
    assert!(fixture.service.catalog().load(&id).is_ok());
    assert_eq!(fixture.temp_entries(), 0);
}
