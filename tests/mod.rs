//! Main test module for tierback
//!
//! This module includes all test suites:
//! - Integration tests for complete backup scenarios
//! - Chaos tests for corruption and concurrency
//! - Property-based tests for invariants

pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::tierback::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    async fn service(temp: &TempDir) -> BackupService {
        let service = BackupService::builder()
            .backup_root(temp.path().join("backups"))
            .data_root(temp.path().join("data"))
            .build()
            .unwrap();
        service.initialize().await.unwrap();
        service
    }

    fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_empty_data_root() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp).await;

        let id = service.create_backup(BackupType::Full).await.unwrap();
        let record = service.catalog().get(&id).unwrap();
        assert_eq!(record.file_count, 0);
        assert_eq!(record.original_size, 0);
        assert_eq!(record.compression_ratio, 0.0);
        assert_eq!(record.levels, DataLevel::ALL.to_vec());

        let report = service.verify_backup(&id).await.unwrap();
        assert!(report.valid, "{}", report.summary());
        assert_eq!(report.file_count, 0);
    }

    #[tokio::test]
    async fn test_special_filenames() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        let service = service(&temp).await;

        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file_with_underscores.txt",
            "file.multiple.dots.txt",
            "UPPERCASE.TXT",
            "émoji-🚀.txt",
            "中文.txt",
        ];
        for name in &names {
            write(&data, &format!("hot/{}", name), name.as_bytes());
        }

        let id = service.create_backup(BackupType::Full).await.unwrap();
        let target = temp.path().join("restore");
        service.restore_backup(&id, RestoreOptions::new(&target)).await.unwrap();

        for name in &names {
            assert_eq!(fs::read(target.join("hot").join(name)).unwrap(), name.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_deeply_nested_and_empty_dirs() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        let service = service(&temp).await;

        let deep: String = (0..30).map(|i| format!("d{}/", i)).collect();
        write(&data, &format!("warm/{}leaf.bin", deep), b"leaf");
        fs::create_dir_all(data.join("cold/empty/inside")).unwrap();

        let id = service.create_backup(BackupType::Full).await.unwrap();
        let target = temp.path().join("restore");
        service.restore_backup(&id, RestoreOptions::new(&target)).await.unwrap();

        assert_eq!(fs::read(target.join("warm").join(&deep).join("leaf.bin")).unwrap(), b"leaf");
        assert!(target.join("cold/empty/inside").is_dir());
    }

    #[tokio::test]
    async fn test_binary_and_large_files() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        let service = service(&temp).await;

        let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let large = vec![b'x'; 2 * 1024 * 1024];
        write(&data, "hot/binary.bin", &binary);
        write(&data, "cold/large.bin", &large);

        let id = service.create_backup(BackupType::Full).await.unwrap();
        let record = service.catalog().get(&id).unwrap();
        assert_eq!(record.original_size, (binary.len() + large.len()) as u64);
        assert!(record.compression_ratio > 90.0);
        assert!(record.compression_ratio < 100.0);

        let target = temp.path().join("restore");
        service.restore_backup(&id, RestoreOptions::new(&target)).await.unwrap();
        assert_eq!(fs::read(target.join("hot/binary.bin")).unwrap(), binary);
        assert_eq!(fs::read(target.join("cold/large.bin")).unwrap(), large);
    }

    #[tokio::test]
    async fn test_restore_without_overwrite_keeps_foreign_files() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        let service = service(&temp).await;
        write(&data, "hot/a.txt", b"backup");
        let id = service.create_backup(BackupType::Full).await.unwrap();

        let target = temp.path().join("restore");
        write(&target, "hot/local.txt", b"local");
        write(&target, "hot/a.txt", b"stale");

        service.restore_backup(&id, RestoreOptions::new(&target)).await.unwrap();
        assert_eq!(fs::read(target.join("hot/a.txt")).unwrap(), b"backup");
        assert!(target.join("hot/local.txt").exists());

        service
            .restore_backup(&id, RestoreOptions::new(&target).overwrite(true))
            .await
            .unwrap();
        assert!(!target.join("hot/local.txt").exists());
    }

    #[tokio::test]
    async fn test_incremental_cannot_express_deletions() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        let service = service(&temp).await;
        write(&data, "hot/keep.txt", b"keep");
        write(&data, "hot/gone.txt", b"gone");
        service.create_backup(BackupType::Full).await.unwrap();

        fs::remove_file(data.join("hot/gone.txt")).unwrap();
        let inc = service.create_backup(BackupType::Incremental).await.unwrap();

        let target = temp.path().join("restore");
        service
            .restore_backup(&inc, RestoreOptions::new(&target).overwrite(true))
            .await
            .unwrap();
        assert!(target.join("hot/gone.txt").exists());
    }

    #[tokio::test]
    async fn test_verify_and_restore_unknown_ids() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp).await;
        assert!(matches!(
            service.verify_backup("missing").await,
            Err(BackupError::NotFound(_))
        ));
        assert!(matches!(
            service
                .restore_backup("missing", RestoreOptions::new(temp.path().join("x")))
                .await,
            Err(BackupError::NotFound(_))
        ));
    }

    #[test]
    fn test_config_from_toml_defaults_and_errors() {
        let config = BackupConfig::from_toml_str("").unwrap();
        assert_eq!(config, BackupConfig::default());

        let err = BackupConfig::from_toml_str("compression_level = 12").unwrap_err();
        assert!(matches!(err, BackupError::InvalidConfiguration(_)));

        let err = BackupConfig::from_toml_str("include_levels = [\"lukewarm\"]").unwrap_err();
        assert!(matches!(err, BackupError::Toml(_)));

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tierback.toml");
        fs::write(&path, "change_detection = \"modified_time\"\ncompression_level = 9\n").unwrap();
        let config = BackupConfig::from_file(&path).unwrap();
        assert_eq!(config.change_detection, ChangeDetection::ModifiedTime);
        assert_eq!(config.compression_level, 9);
    }
}
