//! Claimed job processing
//!
//! Runs one build end to end: field validation, heap and checkout setup,
//! build entry point selection, supervised execution with artifact
//! interception, upload draining and the final status report.

use crate::agent::artifact::{JobArtifacts, UploadStatus};
use crate::agent::client::JobMsg;
use crate::agent::spawn::{spawn_command, SpawnResult};
use crate::agent::AgentContext;
use crate::error::DoozerError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

struct Job<'a> {
    ctx: &'a AgentContext,
    jobid: i64,
    jobsecret: String,
    project: String,
    version: String,
    revision: String,
    target: String,
    repourl: String,
    can_temp_fail: bool,
    no_output: bool,
    repodir: PathBuf,
    artifacts: Arc<JobArtifacts>,
}

impl Job<'_> {
    /// Status reports are delivered with an indefinite retry loop; losing
    /// one would orphan the build on the coordinator.
    async fn report_status(&self, status: &str, msg: &str) {
        info!(
            "Project: {} ({}): {}: {}",
            self.project, self.version, status, msg
        );

        loop {
            match self
                .ctx
                .client
                .report(self.jobid, &self.jobsecret, status, msg)
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    warn!("Unable to report status '{}' -- {}. Retrying", status, e);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
    }

    async fn report_fail(&self, msg: &str) {
        self.report_status("failed", msg).await;
    }

    async fn report_temp_fail(&self, msg: &str) {
        let status = if self.can_temp_fail {
            "tempfailed"
        } else {
            "failed"
        };
        self.report_status(status, msg).await;
    }

    /// Intercept `doozer-artifact:` / `doozer-artifact-gzip:` lines:
    /// `<localpath>:<type>:<contenttype>:<filename>`
    fn intercept_artifact(&self, args: &str, gzipped: bool) -> Result<(), String> {
        let fields: Vec<&str> = args.splitn(4, ':').collect();
        let [localpath, filetype, contenttype, filename] = fields.as_slice() else {
            return Err("Invalid doozer-artifact line".to_string());
        };

        let path = if localpath.starts_with('/') {
            PathBuf::from(localpath)
        } else {
            self.repodir.join(localpath)
        };

        // app.tar.gz -> app.tar-1.0.3.gz
        let versioned = match filename.rsplit_once('.') {
            Some((base, ext)) => format!("{}-{}.{}", base, self.version, ext),
            None => format!("{}-{}", filename, self.version),
        };

        if self.no_output {
            info!(
                "Artifact {} ignored, build is marked no-output",
                versioned
            );
            return Ok(());
        }

        self.ctx.pool.add_file(
            &self.artifacts,
            self.jobid,
            &self.jobsecret,
            filetype,
            &versioned,
            Some(*contenttype),
            &path,
            gzipped,
        )
    }

    fn intercept_line(&self, line: &str) -> Result<(), String> {
        if let Some(args) = line.strip_prefix("doozer-artifact:") {
            self.intercept_artifact(args, false)
        } else if let Some(args) = line.strip_prefix("doozer-artifact-gzip:") {
            self.intercept_artifact(args, true)
        } else {
            Ok(())
        }
    }

    async fn run_command(
        &self,
        argv: &[String],
        output: &mut Vec<u8>,
    ) -> Result<SpawnResult, DoozerError> {
        spawn_command(
            argv,
            &self.repodir,
            self.ctx.cfg.build_uid,
            self.ctx.cfg.build_gid,
            output,
            self.ctx.cfg.no_output_timeout,
            |line| self.intercept_line(line),
        )
        .await
    }

    /// Block until every queued artifact settled. Returns false when an
    /// upload failed (already reported, remaining transfers aborted).
    async fn wait_for_uploads(&self) -> bool {
        let mut last_reported = 0usize;

        loop {
            match self.artifacts.status() {
                UploadStatus::Done => return true,
                UploadStatus::Failed { filename, error } => {
                    self.report_fail(&format!("Unable to upload {} -- {}", filename, error))
                        .await;
                    self.artifacts.abort_all();
                    while self.artifacts.busy() {
                        let _ = tokio::time::timeout(
                            Duration::from_secs(1),
                            self.artifacts.notify.notified(),
                        )
                        .await;
                    }
                    return false;
                }
                UploadStatus::Waiting(n) => {
                    if n != last_reported {
                        last_reported = n;
                        self.report_status(
                            "building",
                            &format!("Waiting for {} artifacts to upload", n),
                        )
                        .await;
                    }
                    let _ = tokio::time::timeout(
                        Duration::from_secs(1),
                        self.artifacts.notify.notified(),
                    )
                    .await;
                }
            }
        }
    }

    /// Common tail for every build flavor: attach the build log, drain
    /// uploads, map the spawn result onto a final report.
    async fn finish(&self, result: Result<SpawnResult, DoozerError>, output: Vec<u8>, cmd: &str) {
        let result = match result {
            Ok(r) => r,
            Err(DoozerError::BuildFailed(e)) => {
                self.report_fail(&e).await;
                return;
            }
            Err(e) => {
                self.report_temp_fail(&e.to_string()).await;
                return;
            }
        };

        if !output.is_empty() && !self.no_output {
            self.ctx.pool.add_bytes(
                &self.artifacts,
                self.jobid,
                &self.jobsecret,
                "buildlog",
                "buildlog",
                None,
                output,
                true,
            );
        }

        if !self.wait_for_uploads().await {
            return;
        }

        match result {
            SpawnResult::Exited(0) => self.report_status("done", "Build done").await,
            SpawnResult::Exited(127) => {
                self.report_fail(&format!("{}: Unable to execute", cmd)).await
            }
            SpawnResult::Exited(code) => {
                self.report_fail(&format!("{}: exited with {}", cmd, code))
                    .await
            }
            SpawnResult::NoOutput(secs) => {
                self.report_temp_fail(&format!("No output detected for {} seconds", secs))
                    .await
            }
            SpawnResult::Signaled(sig) => {
                self.report_temp_fail(&format!("Terminated by signal {}", sig))
                    .await
            }
        }
    }

    async fn autobuild_process(&self, script: &Path) {
        // Only protocol version 3 is supported
        let version = match tokio::process::Command::new(script)
            .arg("-v")
            .current_dir(&self.repodir)
            .output()
            .await
        {
            Ok(out) => String::from_utf8_lossy(&out.stdout)
                .lines()
                .next()
                .and_then(|l| l.trim().parse::<i32>().ok()),
            Err(e) => {
                self.report_fail(&format!("Failed to execute Autobuild.sh -- {}", e))
                    .await;
                return;
            }
        };

        match version {
            Some(3) => {}
            Some(v) => {
                self.report_fail(&format!("Unsupported autobuild version {}", v))
                    .await;
                return;
            }
            None => {
                self.report_fail("Failed to read version from Autobuild.sh")
                    .await;
                return;
            }
        }

        let script = script.to_string_lossy().to_string();
        let mut output = Vec::new();

        let deps = self
            .run_command(
                &[
                    script.clone(),
                    "-t".to_string(),
                    self.target.clone(),
                    "-o".to_string(),
                    "deps".to_string(),
                ],
                &mut output,
            )
            .await;

        match deps {
            Ok(SpawnResult::Exited(0)) => {}
            other => {
                self.finish(other, output, "Autobuild.sh").await;
                return;
            }
        }

        let build = self
            .run_command(
                &[
                    script,
                    "-t".to_string(),
                    self.target.clone(),
                    "-o".to_string(),
                    "build".to_string(),
                ],
                &mut output,
            )
            .await;

        self.finish(build, output, "Autobuild.sh").await;
    }

    /// `.doozer.json` carries an ordered list of shell commands.
    async fn doozer_json_process(&self, path: &Path) {
        #[derive(serde::Deserialize)]
        struct DoozerCtrl {
            #[serde(default)]
            commands: Vec<String>,
        }

        let ctrl: DoozerCtrl = match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
        {
            Ok(c) => c,
            Err(e) => {
                self.report_fail(&format!("Malformed .doozer.json -- {}", e))
                    .await;
                return;
            }
        };

        if ctrl.commands.is_empty() {
            self.report_fail("No commands in .doozer.json").await;
            return;
        }

        let mut output = Vec::new();
        let mut last = Ok(SpawnResult::Exited(0));

        for cmd in &ctrl.commands {
            last = self
                .run_command(
                    &[
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        cmd.clone(),
                    ],
                    &mut output,
                )
                .await;

            match &last {
                Ok(SpawnResult::Exited(0)) => continue,
                _ => break,
            }
        }

        self.finish(last, output, "doozer.json").await;
    }

    async fn makefile_process(&self) {
        let mut output = Vec::new();
        let r = self
            .run_command(
                &["/usr/bin/env".to_string(), "make".to_string()],
                &mut output,
            )
            .await;
        self.finish(r, output, "make").await;
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Process one `getjob` answer.
pub async fn process(ctx: &AgentContext, msg: JobMsg) {
    if msg.msg_type != "build" {
        return;
    }

    let Some(jobid) = msg.id else {
        error!("Job has no jobid");
        return;
    };
    let Some(jobsecret) = msg.jobsecret.clone() else {
        error!("Job has no jobsecret");
        return;
    };

    // From here on every failure is reported back to the coordinator
    let mut job = Job {
        ctx,
        jobid,
        jobsecret,
        project: String::new(),
        version: String::new(),
        revision: String::new(),
        target: String::new(),
        repourl: String::new(),
        can_temp_fail: msg.can_temp_fail,
        no_output: msg.no_output,
        repodir: PathBuf::new(),
        artifacts: Arc::new(JobArtifacts::default()),
    };

    match msg.project {
        Some(p) => job.project = p,
        None => {
            job.report_temp_fail("No 'project' field in work").await;
            return;
        }
    }
    match msg.version {
        Some(v) => job.version = v,
        None => {
            job.report_temp_fail("No 'version' field in work").await;
            return;
        }
    }
    match msg.revision {
        Some(r) => job.revision = r,
        None => {
            job.report_temp_fail("No 'revision' field in work").await;
            return;
        }
    }
    match msg.target {
        Some(t) => job.target = t,
        None => {
            job.report_temp_fail("No 'target' field in work").await;
            return;
        }
    }
    match msg.repo {
        Some(r) => job.repourl = r,
        None => {
            job.report_temp_fail("No 'repo' field in work").await;
            return;
        }
    }

    let projectdir = match ctx.heap.open_heap(&job.project, true) {
        Ok(d) => d,
        Err(e) => {
            job.report_fail(&e.to_string()).await;
            return;
        }
    };

    let repodir = projectdir.join("checkout").join(&job.project);
    let workdir = projectdir.join("workdir");
    for dir in [&repodir, &workdir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            job.report_temp_fail(&format!(
                "Unable to create dir {} -- {}",
                dir.display(),
                e
            ))
            .await;
            return;
        }
    }
    job.repodir = repodir.clone();

    // Checkout from GIT
    let repourl = job.repourl.clone();
    let revision = job.revision.clone();
    let checked_out = tokio::task::spawn_blocking(move || {
        crate::agent::git::checkout_repo(&repodir, &repourl, &revision)
    })
    .await;

    match checked_out {
        Ok(Ok(())) => {
            job.report_status("building", &format!("GIT: Checked out {}", job.revision))
                .await;
        }
        Ok(Err(DoozerError::BuildFailed(e))) => {
            job.report_fail(&e).await;
            return;
        }
        Ok(Err(e)) => {
            job.report_temp_fail(&e.to_string()).await;
            return;
        }
        Err(e) => {
            job.report_temp_fail(&format!("Checkout task failed: {}", e))
                .await;
            return;
        }
    }

    // Pick the build entry point
    let autobuild = job.repodir.join("Autobuild.sh");
    if is_executable(&autobuild) {
        job.report_status("building", "Building using Autobuild.sh")
            .await;
        job.autobuild_process(&autobuild).await;
        return;
    }

    let doozerctrl = job.repodir.join(".doozer.json");
    if doozerctrl.is_file() {
        job.report_status("building", "Building using .doozer.json")
            .await;
        job.doozer_json_process(&doozerctrl).await;
        return;
    }

    let makefile = job.repodir.join("Makefile");
    if makefile.is_file() {
        job.report_status("building", "Building using Makefile").await;
        job.makefile_process().await;
        return;
    }

    job.report_fail("No clue how to build from this repo").await;
}
