//! Local filesystem copytool.
//!
//! Moves files between the work directory and a locally mounted storage
//! path (`file://` URLs). The cheapest backend, and the one exercised on
//! sites where an external mover picks outputs up from a drop directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use gridpilot_core::error::{ErrorCode, PilotError};
use gridpilot_core::filespec::FileSpec;

use crate::copytool::{Copytool, TransferContext};

pub struct MvCopytool;

fn local_path(url: &str) -> Result<PathBuf, PilotError> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if url.contains("://") {
        return Err(PilotError::new(ErrorCode::StageInFailed)
            .with_kwarg("reason", format!("mv cannot handle non-local url: {url}")));
    }
    Ok(PathBuf::from(url))
}

async fn copy_file(src: &Path, dst: &Path) -> Result<u64, std::io::Error> {
    if let Some(dir) = dst.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::copy(src, dst).await
}

#[async_trait]
impl Copytool for MvCopytool {
    fn name(&self) -> &'static str {
        "mv"
    }

    fn require_replicas(&self) -> bool {
        true
    }

    fn allowed_schemas(&self) -> &'static [&'static str] {
        &["file"]
    }

    fn is_valid_for_copy_in(&self, files: &[FileSpec]) -> bool {
        files.iter().all(|f| !f.turl.is_empty())
    }

    fn is_valid_for_copy_out(&self, files: &[FileSpec]) -> bool {
        files.iter().all(|f| !f.surl.is_empty() || !f.lfn.is_empty())
    }

    async fn copy_in(
        &self,
        files: &mut [FileSpec],
        ctx: &TransferContext,
    ) -> Result<(), PilotError> {
        for fspec in files.iter_mut() {
            let src = local_path(&fspec.turl)?;
            let dst = fspec
                .workdir
                .clone()
                .unwrap_or_else(|| ctx.workdir.clone())
                .join(&fspec.lfn);

            match copy_file(&src, &dst).await {
                Ok(copied) => {
                    if fspec.filesize != 0 && copied != fspec.filesize {
                        let err = PilotError::new(ErrorCode::StageInFailed).with_kwarg(
                            "reason",
                            format!(
                                "size mismatch for {}: copied {copied}, expected {}",
                                fspec.lfn, fspec.filesize
                            ),
                        );
                        fspec.set_failed(err.code());
                        return Err(err);
                    }
                    fspec.set_transferred();
                }
                Err(io) => {
                    let code = if io.kind() == std::io::ErrorKind::NotFound {
                        ErrorCode::NoSuchFile
                    } else {
                        ErrorCode::StageInFailed
                    };
                    fspec.set_failed(code);
                    return Err(PilotError::new(code)
                        .with_kwarg("path", src.display().to_string())
                        .with_kwarg("reason", io.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn copy_out(
        &self,
        files: &mut [FileSpec],
        _ctx: &TransferContext,
    ) -> Result<(), PilotError> {
        for fspec in files.iter_mut() {
            let src = PathBuf::from(&fspec.surl);
            if !src.is_file() {
                fspec.set_failed(ErrorCode::MissingOutputFile);
                return Err(PilotError::new(ErrorCode::MissingOutputFile)
                    .with_kwarg("path", src.display().to_string()));
            }
            let dst = local_path(&fspec.turl)?;

            if let Err(io) = copy_file(&src, &dst).await {
                fspec.set_failed(ErrorCode::StageOutFailed);
                return Err(PilotError::new(ErrorCode::StageOutFailed)
                    .with_kwarg("reason", format!("{} -> {}: {io}", src.display(), dst.display())));
            }
            fspec.set_transferred();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gridpilot_core::filespec::FileStatus;
    use gridpilot_core::infosys::InfoService;

    use super::*;

    fn ctx(workdir: &Path) -> TransferContext {
        TransferContext {
            info: Arc::new(InfoService::default()),
            http: reqwest::Client::new(),
            workdir: workdir.to_path_buf(),
            activity: "pr".into(),
            pandaqueue: String::new(),
        }
    }

    #[tokio::test]
    async fn copies_a_local_replica_into_the_workdir() {
        let storage = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        std::fs::write(storage.path().join("a.root"), b"data").unwrap();

        let mut files = vec![FileSpec::new("mc16", "a.root")];
        files[0].turl = format!("file://{}/a.root", storage.path().display());
        files[0].filesize = 4;

        MvCopytool.copy_in(&mut files, &ctx(workdir.path())).await.unwrap();

        assert_eq!(files[0].status, FileStatus::Transferred);
        assert!(workdir.path().join("a.root").is_file());
    }

    #[tokio::test]
    async fn missing_source_is_no_such_file() {
        let workdir = tempfile::tempdir().unwrap();
        let mut files = vec![FileSpec::new("mc16", "a.root")];
        files[0].turl = "file:///definitely/not/here/a.root".into();

        let err = MvCopytool.copy_in(&mut files, &ctx(workdir.path())).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoSuchFile);
        assert_eq!(files[0].status, FileStatus::Failed);
        assert_eq!(files[0].status_code, ErrorCode::NoSuchFile.value());
    }

    #[tokio::test]
    async fn size_mismatch_fails_the_transfer() {
        let storage = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        std::fs::write(storage.path().join("a.root"), b"data").unwrap();

        let mut files = vec![FileSpec::new("mc16", "a.root")];
        files[0].turl = format!("file://{}/a.root", storage.path().display());
        files[0].filesize = 999;

        let err = MvCopytool.copy_in(&mut files, &ctx(workdir.path())).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StageInFailed);
    }

    #[tokio::test]
    async fn stage_out_reports_missing_output_as_fatal() {
        let workdir = tempfile::tempdir().unwrap();
        let mut files = vec![FileSpec::new("mc16", "out.root")];
        files[0].surl = workdir.path().join("out.root").display().to_string();
        files[0].turl = format!("file://{}/dest/out.root", workdir.path().display());

        let err = MvCopytool.copy_out(&mut files, &ctx(workdir.path())).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingOutputFile);
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn stage_out_creates_destination_directories() {
        let workdir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(workdir.path().join("out.root"), b"result").unwrap();

        let mut files = vec![FileSpec::new("mc16", "out.root")];
        files[0].surl = workdir.path().join("out.root").display().to_string();
        files[0].turl = format!("file://{}/mc16/ab/cd/out.root", dest.path().display());

        MvCopytool.copy_out(&mut files, &ctx(workdir.path())).await.unwrap();
        assert!(dest.path().join("mc16/ab/cd/out.root").is_file());
        assert_eq!(files[0].status, FileStatus::Transferred);
    }

    #[test]
    fn remote_urls_are_rejected() {
        assert!(local_path("root://host/a").is_err());
        assert_eq!(local_path("file:///x/a").unwrap(), PathBuf::from("/x/a"));
        assert_eq!(local_path("/x/a").unwrap(), PathBuf::from("/x/a"));
    }
}
