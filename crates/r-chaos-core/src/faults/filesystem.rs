//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Filesystem chaos: read-only flips and disk fill ballast."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use r_chaos_common::{ExperimentConfig, ExperimentType};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{FaultController, FaultEffect, FaultHandle, FileSystemChange};
use crate::error::FaultError;

const CHUNK: usize = 1024 * 1024;
const MAX_FILL_MB: u64 = 16 * 1024;

/// Applies filesystem faults to each target path.
///
/// `mode = "fill"` writes a `fill_mb` ballast file into each target
/// directory; `mode = "readonly"` clears write permission on each target.
#[derive(Debug, Default)]
pub struct FileSystemChaosController {
    sequence: AtomicU64,
}

impl FileSystemChaosController {
    pub fn new() -> Self {
        Self::default()
    }

    async fn fill(&self, dir: &Path, megabytes: u64) -> Result<FileSystemChange, FaultError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!(
            ".chaos-fill-{}-{}.bin",
            std::process::id(),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = tokio::fs::File::create(&path).await?;
        let chunk = vec![0u8; CHUNK];
        let written: Result<(), std::io::Error> = async {
            for _ in 0..megabytes {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(err.into());
        }
        Ok(FileSystemChange::Fill {
            path,
            bytes: megabytes * CHUNK as u64,
        })
    }

    async fn make_readonly(path: &Path) -> Result<FileSystemChange, FaultError> {
        let metadata = tokio::fs::metadata(path).await?;
        let mut permissions = metadata.permissions();
        let was_readonly = permissions.readonly();
        let original_mode = unix_mode(&permissions);
        permissions.set_readonly(true);
        tokio::fs::set_permissions(path, permissions).await?;
        Ok(FileSystemChange::ReadOnly {
            path: path.to_path_buf(),
            original_mode,
            was_readonly,
        })
    }

    async fn revert(change: &FileSystemChange) -> Result<(), FaultError> {
        let outcome = match change {
            FileSystemChange::Fill { path, .. } => tokio::fs::remove_file(path).await,
            FileSystemChange::ReadOnly {
                path,
                original_mode,
                was_readonly,
            } => match tokio::fs::metadata(path).await {
                Ok(metadata) => {
                    let mut permissions = metadata.permissions();
                    restore_permissions(&mut permissions, *original_mode, *was_readonly);
                    tokio::fs::set_permissions(path, permissions).await
                }
                Err(err) => Err(err),
            },
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(target: "r_chaos::faults::filesystem", change = ?change, "path already gone");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn revert_all(changes: &[FileSystemChange]) -> Result<(), FaultError> {
        let mut first_error = None;
        for change in changes.iter().rev() {
            if let Err(err) = Self::revert(change).await {
                warn!(
                    target: "r_chaos::faults::filesystem",
                    change = ?change,
                    error = %err,
                    "failed to revert filesystem change"
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(unix)]
fn unix_mode(permissions: &std::fs::Permissions) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(permissions.mode())
}

#[cfg(not(unix))]
fn unix_mode(_permissions: &std::fs::Permissions) -> Option<u32> {
    None
}

#[cfg(unix)]
fn restore_permissions(permissions: &mut std::fs::Permissions, mode: Option<u32>, was_readonly: bool) {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        Some(mode) => permissions.set_mode(mode),
        None => permissions.set_readonly(was_readonly),
    }
}

#[cfg(not(unix))]
#[allow(clippy::permissions_set_readonly_false)]
fn restore_permissions(permissions: &mut std::fs::Permissions, _mode: Option<u32>, was_readonly: bool) {
    permissions.set_readonly(was_readonly);
}

#[async_trait]
impl FaultController for FileSystemChaosController {
    fn experiment_type(&self) -> ExperimentType {
        ExperimentType::FileSystemChaos
    }

    async fn inject(&self, config: &ExperimentConfig) -> Result<FaultHandle, FaultError> {
        if config.targets.is_empty() {
            return Err(FaultError::InvalidConfig(
                "filesystem chaos needs at least one target path".into(),
            ));
        }
        let mode = config.param("mode").unwrap_or("fill");
        let fill_mb = config
            .param_u64("fill_mb", 16)
            .map_err(|err| FaultError::InvalidConfig(err.to_string()))?;
        if fill_mb > MAX_FILL_MB {
            return Err(FaultError::InvalidConfig(format!(
                "fill_mb {fill_mb} exceeds the {MAX_FILL_MB}MB cap"
            )));
        }

        let mut changes = Vec::with_capacity(config.targets.len());
        for target in &config.targets {
            let path = PathBuf::from(target);
            let change = match mode {
                "fill" => self.fill(&path, fill_mb).await,
                "readonly" => Self::make_readonly(&path).await,
                other => Err(FaultError::InvalidConfig(format!(
                    "unknown filesystem chaos mode '{other}'"
                ))),
            };
            match change {
                Ok(change) => changes.push(change),
                Err(err) => {
                    if let Err(rollback) = Self::revert_all(&changes).await {
                        warn!(
                            target: "r_chaos::faults::filesystem",
                            error = %rollback,
                            "rollback of partial filesystem fault failed"
                        );
                    }
                    return Err(err);
                }
            }
        }

        info!(
            target: "r_chaos::faults::filesystem",
            mode,
            targets = ?config.targets,
            "filesystem fault injected"
        );
        Ok(FaultHandle::applied(
            self.experiment_type(),
            FaultEffect::FileSystem { changes },
        ))
    }

    async fn recover(&self, handle: &FaultHandle) -> Result<(), FaultError> {
        handle.expect_type(self.experiment_type())?;
        let FaultEffect::FileSystem { changes } = handle.effect() else {
            return Err(FaultError::InvalidConfig("filesystem handle without changes".into()));
        };
        Self::revert_all(changes).await?;
        info!(target: "r_chaos::faults::filesystem", "filesystem fault reverted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_chaos_common::ExperimentOverrides;

    fn config(mode: &str, target: &Path) -> ExperimentConfig {
        ExperimentConfig::defaults_for(ExperimentType::FileSystemChaos).merged(
            &ExperimentOverrides::default()
                .with_targets([target.display().to_string()])
                .with_parameter("mode", mode)
                .with_parameter("fill_mb", "1"),
        )
    }

    #[tokio::test]
    async fn fill_creates_and_removes_ballast() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let controller = FileSystemChaosController::new();
        let handle = controller.inject(&config("fill", &scratch)).await.unwrap();

        let FaultEffect::FileSystem { changes } = handle.effect() else {
            panic!("unexpected effect");
        };
        let FileSystemChange::Fill { path, bytes } = &changes[0] else {
            panic!("expected fill change");
        };
        assert_eq!(*bytes, 1024 * 1024);
        assert_eq!(std::fs::metadata(path).unwrap().len(), 1024 * 1024);

        controller.recover(&handle).await.unwrap();
        assert!(!path.exists());
        controller.recover(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn readonly_restores_original_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, b"payload").unwrap();
        let before = std::fs::metadata(&file).unwrap().permissions();

        let controller = FileSystemChaosController::new();
        let handle = controller.inject(&config("readonly", &file)).await.unwrap();
        assert!(std::fs::metadata(&file).unwrap().permissions().readonly());

        controller.recover(&handle).await.unwrap();
        assert_eq!(std::fs::metadata(&file).unwrap().permissions(), before);
    }

    #[tokio::test]
    async fn unknown_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = FileSystemChaosController::new();
        let err = controller
            .inject(&config("shred", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, FaultError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn missing_readonly_target_fails_injection() {
        let dir = tempfile::tempdir().unwrap();
        let controller = FileSystemChaosController::new();
        let err = controller
            .inject(&config("readonly", &dir.path().join("absent")))
            .await
            .unwrap_err();
        assert!(matches!(err, FaultError::Io(_)));
    }
}
