//! Artifact upload pipeline
//!
//! Two detached worker pools: processors hash (and optionally gzip) queued
//! artifacts, transfer workers PUT them to the buildmaster. Digests are
//! taken over the bytes as produced by the build; compression happens after
//! and shrinks the reported size, with the original size carried separately.

use crate::agent::client::BuildmasterClient;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::info;

/// result values: -1 queued/processing, -2 transfer in progress,
/// 0 uploaded, >0 failed (HTTP status or 1).
const RESULT_PENDING: i32 = -1;
const RESULT_TRANSFERRING: i32 = -2;

pub struct ArtifactXfer {
    pub artifact_type: String,
    pub filename: String,
    pub content_type: String,
    gzip: AtomicBool,
    jobid: i64,
    jobsecret: String,
    data: Mutex<Option<Vec<u8>>>,
    sha1: Mutex<String>,
    md5: Mutex<String>,
    origsize: AtomicI64,
    result: AtomicI32,
    errbuf: Mutex<String>,
    do_abort: AtomicBool,
    job: Arc<JobArtifacts>,
}

impl ArtifactXfer {
    pub fn result(&self) -> i32 {
        self.result.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> String {
        self.errbuf.lock().unwrap().clone()
    }

    fn finish(&self, result: i32, err: &str) {
        if !err.is_empty() {
            *self.errbuf.lock().unwrap() = err.to_string();
        }
        // The mapping is dropped whether the transfer worked or not
        *self.data.lock().unwrap() = None;
        self.result.store(result, Ordering::SeqCst);
        self.job.notify.notify_waiters();
    }
}

/// Per-job view of in-flight uploads.
#[derive(Default)]
pub struct JobArtifacts {
    pub list: Mutex<Vec<Arc<ArtifactXfer>>>,
    pub notify: tokio::sync::Notify,
}

pub enum UploadStatus {
    /// Everything uploaded.
    Done,
    /// N artifacts still hashing or transferring.
    Waiting(usize),
    /// At least one upload failed.
    Failed { filename: String, error: String },
}

impl JobArtifacts {
    pub fn status(&self) -> UploadStatus {
        let list = self.list.lock().unwrap();

        if let Some(a) = list.iter().find(|a| a.result() > 0) {
            return UploadStatus::Failed {
                filename: a.filename.clone(),
                error: a.error(),
            };
        }

        let waiting = list.iter().filter(|a| a.result() < 0).count();
        if waiting > 0 {
            UploadStatus::Waiting(waiting)
        } else {
            UploadStatus::Done
        }
    }

    /// Ask every unfinished transfer to unwind.
    pub fn abort_all(&self) {
        let list = self.list.lock().unwrap();
        for a in list.iter() {
            if a.result() < 0 {
                a.do_abort.store(true, Ordering::SeqCst);
            }
        }
    }

    /// True while any artifact is still unresolved.
    pub fn busy(&self) -> bool {
        self.list
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.result() < 0)
    }
}

#[derive(Clone)]
pub struct UploadPool {
    process_tx: mpsc::UnboundedSender<Arc<ArtifactXfer>>,
}

impl UploadPool {
    pub fn new(client: BuildmasterClient) -> Self {
        let (process_tx, process_rx) = mpsc::unbounded_channel::<Arc<ArtifactXfer>>();
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel::<Arc<ArtifactXfer>>();

        let process_rx = Arc::new(tokio::sync::Mutex::new(process_rx));
        let transfer_rx = Arc::new(tokio::sync::Mutex::new(transfer_rx));

        for _ in 0..2 {
            let rx = process_rx.clone();
            let tx = transfer_tx.clone();
            tokio::spawn(async move {
                loop {
                    let a = { rx.lock().await.recv().await };
                    let Some(a) = a else { break };
                    process_artifact(&a).await;
                    if a.result() < 0 {
                        let _ = tx.send(a);
                    }
                }
            });
        }

        for _ in 0..2 {
            let rx = transfer_rx.clone();
            let client = client.clone();
            tokio::spawn(async move {
                loop {
                    let a = { rx.lock().await.recv().await };
                    let Some(a) = a else { break };
                    transfer_artifact(&client, &a).await;
                }
            });
        }

        Self { process_tx }
    }

    fn add(
        &self,
        job: &Arc<JobArtifacts>,
        jobid: i64,
        jobsecret: &str,
        artifact_type: &str,
        filename: &str,
        content_type: Option<&str>,
        data: Vec<u8>,
        gzip: bool,
    ) {
        info!(
            "Artifact {} ({} bytes) added to queue",
            filename,
            data.len()
        );

        let a = Arc::new(ArtifactXfer {
            artifact_type: artifact_type.to_string(),
            filename: filename.to_string(),
            content_type: content_type
                .unwrap_or("text/plain; charset=utf-8")
                .to_string(),
            gzip: AtomicBool::new(gzip),
            jobid,
            jobsecret: jobsecret.to_string(),
            origsize: AtomicI64::new(data.len() as i64),
            data: Mutex::new(Some(data)),
            sha1: Mutex::new(String::new()),
            md5: Mutex::new(String::new()),
            result: AtomicI32::new(RESULT_PENDING),
            errbuf: Mutex::new(String::new()),
            do_abort: AtomicBool::new(false),
            job: job.clone(),
        });

        job.list.lock().unwrap().push(a.clone());
        let _ = self.process_tx.send(a);
    }

    /// Queue a file from the checkout for upload.
    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &self,
        job: &Arc<JobArtifacts>,
        jobid: i64,
        jobsecret: &str,
        artifact_type: &str,
        filename: &str,
        content_type: Option<&str>,
        path: &std::path::Path,
        gzip: bool,
    ) -> Result<(), String> {
        let data = std::fs::read(path)
            .map_err(|e| format!("Unable to open {}: {}", path.display(), e))?;
        self.add(
            job,
            jobid,
            jobsecret,
            artifact_type,
            filename,
            content_type,
            data,
            gzip,
        );
        Ok(())
    }

    /// Queue an in-memory buffer (the captured build log).
    #[allow(clippy::too_many_arguments)]
    pub fn add_bytes(
        &self,
        job: &Arc<JobArtifacts>,
        jobid: i64,
        jobsecret: &str,
        artifact_type: &str,
        filename: &str,
        content_type: Option<&str>,
        data: Vec<u8>,
        gzip: bool,
    ) {
        self.add(
            job,
            jobid,
            jobsecret,
            artifact_type,
            filename,
            content_type,
            data,
            gzip,
        );
    }
}

/// Stage 1: digest, then optionally compress.
async fn process_artifact(a: &Arc<ArtifactXfer>) {
    if a.do_abort.load(Ordering::SeqCst) {
        a.finish(1, "Aborted");
        return;
    }

    let data = a.data.lock().unwrap().take();
    let Some(data) = data else {
        a.finish(1, "No data");
        return;
    };

    let gzip = a.gzip.load(Ordering::SeqCst);
    let result = tokio::task::spawn_blocking(move || {
        let sha1 = hex::encode(Sha1::digest(&data));
        let md5 = format!("{:x}", md5::compute(&data));

        if gzip {
            let mut enc = GzEncoder::new(Vec::new(), Compression::new(9));
            match enc.write_all(&data).and_then(|_| enc.finish()) {
                Ok(packed) => (sha1, md5, packed, true),
                // Compression failure falls back to the raw bytes
                Err(_) => (sha1, md5, data, false),
            }
        } else {
            (sha1, md5, data, false)
        }
    })
    .await;

    let Ok((sha1, md5, data, compressed)) = result else {
        a.finish(1, "Hashing task failed");
        return;
    };

    info!(
        "Artifact {} SHA1:{} MD5:{}{}",
        a.filename,
        sha1,
        md5,
        if compressed {
            format!(
                " compressed from {} to {} bytes",
                a.origsize.load(Ordering::SeqCst),
                data.len()
            )
        } else {
            String::new()
        }
    );

    if gzip && !compressed {
        a.gzip.store(false, Ordering::SeqCst);
    }
    *a.sha1.lock().unwrap() = sha1;
    *a.md5.lock().unwrap() = md5;
    *a.data.lock().unwrap() = Some(data);
}

/// Stage 2: PUT to the buildmaster, following a possible 307 to S3. The
/// body is a plain byte buffer so the redirect can replay it.
async fn transfer_artifact(client: &BuildmasterClient, a: &Arc<ArtifactXfer>) {
    if a.do_abort.load(Ordering::SeqCst) {
        a.finish(1, "Aborted");
        return;
    }

    a.result.store(RESULT_TRANSFERRING, Ordering::SeqCst);

    let data = a.data.lock().unwrap().clone().unwrap_or_default();
    let sha1 = a.sha1.lock().unwrap().clone();
    let md5 = a.md5.lock().unwrap().clone();
    let (user, pass) = client.credentials();

    let mut query: Vec<(String, String)> = vec![
        ("jobid".to_string(), a.jobid.to_string()),
        ("jobsecret".to_string(), a.jobsecret.clone()),
        ("name".to_string(), a.filename.clone()),
        ("type".to_string(), a.artifact_type.clone()),
        ("md5sum".to_string(), md5),
        ("sha1sum".to_string(), sha1),
    ];
    let gzip = a.gzip.load(Ordering::SeqCst);
    if gzip {
        query.push((
            "origsize".to_string(),
            a.origsize.load(Ordering::SeqCst).to_string(),
        ));
    }

    let mut req = client
        .http()
        .put(client.artifact_url())
        .basic_auth(user, Some(pass))
        .query(&query)
        .header(reqwest::header::CONTENT_TYPE, a.content_type.clone());
    if gzip {
        req = req.header(reqwest::header::CONTENT_ENCODING, "gzip");
    }

    info!("Artifact {} about to upload", a.filename);

    let send = req.body(data).send();
    tokio::pin!(send);

    let resp = loop {
        tokio::select! {
            r = &mut send => break r,
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                if a.do_abort.load(Ordering::SeqCst) {
                    a.finish(1, "Aborted");
                    return;
                }
            }
        }
    };

    match resp {
        Ok(r) if r.status().is_success() => {
            info!("Artifact {} uploaded: OK", a.filename);
            a.finish(0, "");
        }
        Ok(r) => {
            let code = r.status().as_u16() as i32;
            a.finish(code, &format!("HTTP Error {}", code));
        }
        Err(e) => {
            a.finish(1, &format!("Transfer failed: {}", e));
        }
    }
}
