//! HTTP(S)/WebDAV copytool.
//!
//! Downloads and uploads files over plain HTTPS; `davs://` URLs are WebDAV
//! endpoints and ride the same transport. Per-file timeouts are derived
//! from the file size, and a timeout maps onto the recoverable stage-in /
//! stage-out timeout codes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use gridpilot_core::error::{ErrorCode, PilotError};
use gridpilot_core::filespec::FileSpec;

use crate::copytool::{Copytool, TransferContext};
use crate::paths::transfer_timeout;

pub struct HttpCopytool;

/// Rewrite transport-equivalent schemes onto https.
pub(crate) fn http_url(url: &str) -> String {
    for scheme in ["davs://", "s3://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            return format!("https://{rest}");
        }
    }
    url.to_string()
}

fn transfer_error(err: &reqwest::Error, is_stagein: bool) -> PilotError {
    let code = if err.is_timeout() {
        gridpilot_core::error::timeout_code(is_stagein)
    } else if is_stagein {
        ErrorCode::StageInFailed
    } else {
        ErrorCode::StageOutFailed
    };
    PilotError::new(code).with_kwarg("reason", err.to_string())
}

pub(crate) async fn download_url(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    timeout: Duration,
) -> Result<u64, PilotError> {
    let response = http
        .get(http_url(url))
        .timeout(timeout)
        .send()
        .await
        .map_err(|err| transfer_error(&err, true))?;
    if !response.status().is_success() {
        return Err(PilotError::new(ErrorCode::StageInFailed)
            .with_kwarg("reason", format!("GET {url}: http {}", response.status())));
    }
    let body = response
        .bytes()
        .await
        .map_err(|err| transfer_error(&err, true))?;

    if let Some(dir) = dest.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(|err| {
            PilotError::new(ErrorCode::Mkdir).with_kwarg("path", format!("{}: {err}", dir.display()))
        })?;
    }
    tokio::fs::write(dest, &body).await.map_err(|err| {
        PilotError::new(ErrorCode::FileHandlingFailure)
            .with_kwarg("reason", format!("write {}: {err}", dest.display()))
    })?;
    Ok(body.len() as u64)
}

pub(crate) async fn upload_url(
    http: &reqwest::Client,
    src: &Path,
    url: &str,
    timeout: Duration,
) -> Result<(), PilotError> {
    let body = tokio::fs::read(src).await.map_err(|_| {
        PilotError::new(ErrorCode::MissingOutputFile).with_kwarg("path", src.display().to_string())
    })?;
    let response = http
        .put(http_url(url))
        .timeout(timeout)
        .body(body)
        .send()
        .await
        .map_err(|err| transfer_error(&err, false))?;
    if !response.status().is_success() {
        return Err(PilotError::new(ErrorCode::StageOutFailed)
            .with_kwarg("reason", format!("PUT {url}: http {}", response.status())));
    }
    Ok(())
}

#[async_trait]
impl Copytool for HttpCopytool {
    fn name(&self) -> &'static str {
        "http"
    }

    fn require_replicas(&self) -> bool {
        true
    }

    fn allowed_schemas(&self) -> &'static [&'static str] {
        &["https", "davs", "http"]
    }

    fn is_valid_for_copy_in(&self, files: &[FileSpec]) -> bool {
        files.iter().all(|f| !f.turl.is_empty())
    }

    async fn copy_in(
        &self,
        files: &mut [FileSpec],
        ctx: &TransferContext,
    ) -> Result<(), PilotError> {
        for fspec in files.iter_mut() {
            let dest = fspec
                .workdir
                .clone()
                .unwrap_or_else(|| ctx.workdir.clone())
                .join(&fspec.lfn);
            let timeout = transfer_timeout(fspec.filesize);
            info!("downloading {} to {} (timeout {timeout:?})", fspec.turl, dest.display());

            match download_url(&ctx.http, &fspec.turl, &dest, timeout).await {
                Ok(written) => {
                    if fspec.filesize != 0 && written != fspec.filesize {
                        let err = PilotError::new(ErrorCode::StageInFailed).with_kwarg(
                            "reason",
                            format!(
                                "size mismatch for {}: got {written}, expected {}",
                                fspec.lfn, fspec.filesize
                            ),
                        );
                        fspec.set_failed(err.code());
                        return Err(err);
                    }
                    fspec.set_transferred();
                }
                Err(err) => {
                    fspec.set_failed(err.code());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn copy_out(
        &self,
        files: &mut [FileSpec],
        ctx: &TransferContext,
    ) -> Result<(), PilotError> {
        for fspec in files.iter_mut() {
            let src = Path::new(&fspec.surl);
            let timeout = transfer_timeout(fspec.filesize);
            info!("uploading {} to {} (timeout {timeout:?})", src.display(), fspec.turl);

            match upload_url(&ctx.http, src, &fspec.turl, timeout).await {
                Ok(()) => fspec.set_transferred(),
                Err(err) => {
                    fspec.set_failed(err.code());
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}
