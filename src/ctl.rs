//! Line-oriented control socket
//!
//! Operators connect to a unix socket and issue one verb per line. Replies
//! are `:`-prefixed message lines followed by a single decimal status line
//! (0 on success).

use crate::core::Core;
use crate::database::models::BuildStatus;
use crate::database::queries::Queries;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info};

pub async fn run_ctrl_socket(core: Arc<Core>) {
    let path = core.config.ctrl_socket.clone();
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(l) => l,
        Err(e) => {
            error!("Unable to bind control socket {}: {}", path, e);
            return;
        }
    };

    info!("Control socket at {}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let core = core.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(core, stream).await {
                        error!("Control connection failed: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Control socket accept failed: {}", e);
                return;
            }
        }
    }
}

async fn handle_connection(core: Arc<Core>, stream: UnixStream) -> std::io::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let mut reply = Vec::new();
        let status = run_command(&core, &line, &mut reply).await;

        for msg in reply {
            wr.write_all(format!(":{}\n", msg).as_bytes()).await?;
        }
        wr.write_all(format!("{}\n", status).as_bytes()).await?;
    }

    Ok(())
}

async fn run_command(core: &Arc<Core>, line: &str, out: &mut Vec<String>) -> i32 {
    let argv: Vec<&str> = line.split_whitespace().collect();

    match argv.as_slice() {
        ["build", project, branch, target] => {
            match crate::buildmaster::add_build_by_name(
                core,
                project,
                branch,
                target,
                "Requested by ctl",
            )
            .await
            {
                Ok(()) => 0,
                Err(e) => {
                    out.push(format!("{}", e));
                    1
                }
            }
        }

        ["show", "builds", project] => show_builds(core, project, out).await,

        ["delete", "builds", project, filter] => {
            delete_builds(core, project, filter, out, false).await
        }

        ["count", "builds", project, filter] => {
            delete_builds(core, project, filter, out, true).await
        }

        ["s3", "delete", bucket, awsid, secret, path] => {
            match crate::s3::delete_file(&core.http_client, bucket, awsid, secret, path).await {
                Ok(()) => {
                    out.push(format!("Deleted {}", path));
                    0
                }
                Err(e) => {
                    out.push(format!("Unable to delete {} -- {}", path, e));
                    1
                }
            }
        }

        ["reload"] => match core.registry.reload() {
            Ok(()) => {
                out.push("Projects reloaded".to_string());
                0
            }
            Err(e) => {
                out.push(format!("{}", e));
                1
            }
        },

        _ => {
            out.push("Unknown command".to_string());
            1
        }
    }
}

async fn show_builds(core: &Arc<Core>, project: &str, out: &mut Vec<String>) -> i32 {
    let Some(p) = core.registry.get(project) else {
        out.push(format!("No such project: {}", project));
        return 1;
    };
    let Some(cfg) = core.registry.get_cfg(project) else {
        out.push(format!("No config for project: {}", project));
        return 1;
    };

    let builds = match crate::releasemaker::list_release_builds(core, &p, &cfg).await {
        Ok(b) => b,
        Err(e) => {
            out.push(format!("{}", e));
            return 1;
        }
    };

    out.push(format!("Active builds for {}", project));
    let mut targets: Vec<&str> = Vec::new();
    for b in &builds {
        if !targets.contains(&b.target.as_str()) {
            targets.push(b.target.as_str());
        }
    }
    for target in targets {
        out.push(format!("  For {}", target));
        for b in builds.iter().filter(|b| b.target == target) {
            out.push(format!(
                "    {} from branch {} (Build #{})",
                b.version, b.branch, b.id
            ));
            for a in &b.artifacts {
                out.push(format!(
                    "      #{:<5} {:<8} {} {} bytes",
                    a.id, a.artifact_type, a.sha1, a.size
                ));
            }
        }
    }
    0
}

async fn delete_builds(
    core: &Arc<Core>,
    project: &str,
    filter: &str,
    out: &mut Vec<String>,
    dry_run: bool,
) -> i32 {
    let pfx = if dry_run { "" } else { "Deleted " };

    let (status, keep_ids) = match filter {
        "deprecated" => {
            // Deprecated = done builds no release manifest still points at
            let Some(p) = core.registry.get(project) else {
                out.push(format!("No such project: {}", project));
                return 1;
            };
            let Some(cfg) = core.registry.get_cfg(project) else {
                out.push(format!("No config for project: {}", project));
                return 1;
            };
            let builds = match crate::releasemaker::list_release_builds(core, &p, &cfg).await {
                Ok(b) => b,
                Err(e) => {
                    out.push(format!("{}", e));
                    return 1;
                }
            };
            for b in &builds {
                out.push(format!(
                    "   Skipping active build #{:<6} {:<20} {:<16} {:<16}",
                    b.id, b.version, b.branch, b.target
                ));
            }
            (BuildStatus::Done, builds.iter().map(|b| b.id).collect())
        }
        "failed" => (BuildStatus::Failed, Vec::new()),
        "pending" => (BuildStatus::Pending, Vec::new()),
        _ => {
            out.push("Unknown filter".to_string());
            return 1;
        }
    };

    match Queries::delete_builds(core.db.pool(), project, status, &keep_ids, dry_run).await {
        Ok(n) => {
            let label = if filter == "deprecated" {
                "deprecated".to_string()
            } else {
                status.to_string()
            };
            out.push(format!("{}{} {} builds", pfx, n, label));
            0
        }
        Err(e) => {
            out.push(format!("{}", e));
            1
        }
    }
}
