//! Artifact storage backends and content-addressed serving
//!
//! An artifact row points at its bytes through one of three storage
//! variants: inline in the row, a file under the project's artifact
//! directory, or an object-store key. Serving negotiates content encoding
//! and can answer with a cached bsdiff patch between two artifact bodies.

use crate::core::Core;
use crate::database::queries::Queries;
use crate::error::DoozerError;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Response};
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Write an uploaded artifact under `<base>/<jobid>/<name>`, directories
/// 0770 and the file itself 0640.
pub fn store_file(base: &Path, jobid: i64, name: &str, data: &[u8]) -> Result<(), DoozerError> {
    use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

    let dir = base.join(jobid.to_string());
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o770)
        .create(&dir)
        .map_err(|e| DoozerError::Io(format!("Unable to create dir {}: {}", dir.display(), e)))?;

    let path = dir.join(name);
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(0o640)
        .open(&path)
        .map_err(|e| DoozerError::Io(format!("Unable to open {}: {}", path.display(), e)))?;

    use std::io::Write;
    f.write_all(data)
        .map_err(|e| DoozerError::Io(format!("Unable to write {}: {}", path.display(), e)))?;
    Ok(())
}

/// Drop the stored bytes of a deleted artifact, dispatching on its storage
/// backend. Embedded rows have nothing outside the database.
pub async fn delete_stored(
    core: &Core,
    storage: &str,
    payload: &[u8],
    project: &str,
) -> Result<(), DoozerError> {
    match storage {
        "embedded" => Ok(()),
        "s3" => {
            let cfg = core
                .registry
                .get_cfg(project)
                .ok_or_else(|| DoozerError::Config("Project config gone".to_string()))?;
            let Some((bucket, awsid, secret)) = cfg.s3.credentials() else {
                return Err(DoozerError::Config(
                    "Missing S3 config for project. Unable to delete file".to_string(),
                ));
            };
            let key = String::from_utf8_lossy(payload).to_string();
            crate::s3::delete_file(&core.http_client, bucket, awsid, secret, &key).await
        }
        "file" => {
            let rel = String::from_utf8_lossy(payload).to_string();
            let path = core.artifact_path(project).join(rel);
            std::fs::remove_file(&path)
                .map_err(|e| DoozerError::Io(format!("Unable to unlink {}: {}", path.display(), e)))
        }
        other => Err(DoozerError::Config(format!(
            "Unknown storage type: {}",
            other
        ))),
    }
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, DoozerError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| DoozerError::Io(format!("gzip decode failed: {}", e)))?;
    Ok(out)
}

fn load_body(path: &Path, gzipped: bool) -> Result<Vec<u8>, DoozerError> {
    let raw = std::fs::read(path)
        .map_err(|e| DoozerError::Io(format!("Unable to read {}: {}", path.display(), e)))?;
    if gzipped {
        gunzip(&raw)
    } else {
        Ok(raw)
    }
}

fn accepted_encodings(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|e| e.split(';').next().unwrap_or("").trim().to_string())
                .filter(|e| !e.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Produce (or reuse) the bsdiff between two stored artifacts and serve it.
///
/// Returns None when patching is not possible, in which case the caller
/// falls back to serving the full body.
async fn send_patch(
    core: &Arc<Core>,
    old_sha1: &str,
    new_sha1: &str,
    new_path: &Path,
    new_encoding: Option<&str>,
) -> Option<Response> {
    if let Some(enc) = new_encoding {
        if enc != "gzip" {
            return None;
        }
    }

    let stash = PathBuf::from(&core.config.patchstash);
    if let Err(e) = std::fs::create_dir_all(&stash) {
        error!(
            "Unable to create patchstash directory {}: {}",
            stash.display(),
            e
        );
        return None;
    }

    let patchfile = stash.join(format!("{}-{}", old_sha1, new_sha1));

    // One patch generation at a time
    let _guard = core.patch_lock.lock().await;

    if !patchfile.is_file() {
        let old = match Queries::artifact_by_sha1(core.db.pool(), old_sha1).await {
            Ok(Some(a)) => a,
            _ => {
                debug!("Unable to patch from unknown SHA-1 {}", old_sha1);
                return None;
            }
        };
        if old.storage != "file" {
            return None;
        }

        let old_path = core
            .artifact_path(&old.project)
            .join(String::from_utf8_lossy(&old.payload).to_string());

        info!(
            "Generating new patch between {} ({}) => {} ({})",
            old_sha1,
            old_path.display(),
            new_sha1,
            new_path.display()
        );

        let old_gzipped = old.encoding.as_deref() == Some("gzip");
        let new_gzipped = new_encoding == Some("gzip");
        let new_path = new_path.to_path_buf();
        let target = patchfile.clone();

        let generated = tokio::task::spawn_blocking(move || -> Result<(), DoozerError> {
            let old_body = load_body(&old_path, old_gzipped)?;
            let new_body = load_body(&new_path, new_gzipped)?;

            let mut patch = Vec::new();
            bsdiff::diff(&old_body, &new_body, &mut patch)
                .map_err(|e| DoozerError::Io(format!("bsdiff failed: {}", e)))?;

            let tmp = target.with_extension("tmp");
            std::fs::write(&tmp, &patch)?;
            std::fs::rename(&tmp, &target)?;
            Ok(())
        })
        .await;

        match generated {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Unable to generate patch file: {}", e);
                return None;
            }
            Err(e) => {
                error!("Patch task failed: {}", e);
                return None;
            }
        }
    }

    let body = match std::fs::read(&patchfile) {
        Ok(b) => b,
        Err(e) => {
            error!("Unable to open patch file {}: {}", patchfile.display(), e);
            return None;
        }
    };

    Some(
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "binary/bsdiff".to_string()),
                (
                    header::CONTENT_ENCODING,
                    format!("bspatch-from-{}", old_sha1),
                ),
            ],
            body,
        )
            .into_response(),
    )
}

/// `GET /file/<sha1>`
pub async fn serve_artifact(
    State(core): State<Arc<Core>>,
    UrlPath(sha1): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let art = match Queries::artifact_by_sha1(core.db.pool(), &sha1).await {
        Ok(Some(a)) => a,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Artifact lookup failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let ct = art
        .contenttype
        .clone()
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "text/plain; charset=utf-8".to_string());
    let ce = art.encoding.clone().filter(|e| !e.is_empty());

    let mut base_headers: Vec<(header::HeaderName, String)> =
        vec![(header::CONTENT_TYPE, ct.clone())];
    if !ct.starts_with("text/plain") {
        base_headers.push((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", art.name),
        ));
    }

    match art.storage.as_str() {
        "embedded" => {
            let _ = Queries::increase_dlcount(core.db.pool(), &sha1).await;
            (StatusCode::OK, AppendHeaders(base_headers), art.payload).into_response()
        }

        "file" => {
            let path = core
                .artifact_path(&art.project)
                .join(String::from_utf8_lossy(&art.payload).to_string());

            let accepted = accepted_encodings(&headers);

            if let Some(old) = accepted
                .iter()
                .find_map(|e| e.strip_prefix("bspatch-from-"))
            {
                if let Some(resp) = send_patch(&core, old, &sha1, &path, ce.as_deref()).await {
                    let _ = Queries::increase_patchcount(core.db.pool(), &sha1).await;
                    return resp;
                }
            }

            let raw = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    info!(
                        "Missing file '{}' for artifact {} in project {}: {}",
                        path.display(),
                        sha1,
                        art.project,
                        e
                    );
                    return StatusCode::NOT_FOUND.into_response();
                }
            };

            let resp = match &ce {
                Some(enc) if accepted.iter().any(|a| a.eq_ignore_ascii_case(enc)) => {
                    base_headers.push((header::CONTENT_ENCODING, enc.clone()));
                    (StatusCode::OK, AppendHeaders(base_headers), raw).into_response()
                }
                Some(enc) if enc == "gzip" => {
                    // Stored gzipped but the client will not take it
                    match gunzip(&raw) {
                        Ok(plain) => {
                            (StatusCode::OK, AppendHeaders(base_headers), plain).into_response()
                        }
                        Err(e) => {
                            error!("Unable to inflate artifact {}: {}", sha1, e);
                            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                        }
                    }
                }
                Some(enc) => {
                    base_headers.push((header::CONTENT_ENCODING, enc.clone()));
                    (StatusCode::OK, AppendHeaders(base_headers), raw).into_response()
                }
                None => (StatusCode::OK, AppendHeaders(base_headers), raw).into_response(),
            };

            let _ = Queries::increase_dlcount(core.db.pool(), &sha1).await;
            resp
        }

        "s3" => {
            let Some(cfg) = core.registry.get_cfg(&art.project) else {
                return StatusCode::NOT_FOUND.into_response();
            };
            let Some((bucket, awsid, secret)) = cfg.s3.credentials() else {
                info!(
                    "Missing S3 config for project '{}'. Unable to serve files",
                    art.project
                );
                return StatusCode::PRECONDITION_FAILED.into_response();
            };

            let key = String::from_utf8_lossy(&art.payload).to_string();
            let location = crate::s3::signed_get_url(bucket, awsid, secret, &key, 60);

            let _ = Queries::increase_dlcount(core.db.pool(), &sha1).await;
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }

        _ => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn store_file_creates_job_directory() {
        let tmp = tempfile::tempdir().unwrap();
        store_file(tmp.path(), 42, "app.bin", b"hello").unwrap();
        let stored = std::fs::read(tmp.path().join("42/app.bin")).unwrap();
        assert_eq!(stored, b"hello");
    }

    #[test]
    fn gunzip_round_trip() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::new(9));
        enc.write_all(b"payload bytes").unwrap();
        let packed = enc.finish().unwrap();
        assert_eq!(gunzip(&packed).unwrap(), b"payload bytes");
    }

    #[test]
    fn accept_encoding_parsing_strips_quality() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT_ENCODING,
            "gzip;q=0.8, bspatch-from-abc".parse().unwrap(),
        );
        let enc = accepted_encodings(&headers);
        assert_eq!(enc, vec!["gzip", "bspatch-from-abc"]);
    }

    #[test]
    fn bsdiff_patch_reconstructs_new_body() {
        let old = b"The quick brown fox jumps over the lazy dog".to_vec();
        let new = b"The quick brown fox jumped over two lazy dogs".to_vec();

        let mut patch = Vec::new();
        bsdiff::diff(&old, &new, &mut patch).unwrap();

        let mut restored = Vec::new();
        bsdiff::patch(&old, &mut patch.as_slice(), &mut restored).unwrap();
        assert_eq!(restored, new);
    }
}
