//! Worker agent
//!
//! Connects to the buildmaster, long-polls for jobs matching its configured
//! targets and runs them. Errors back off exponentially up to two minutes.

pub mod artifact;
pub mod client;
pub mod git;
pub mod heap;
pub mod job;
pub mod spawn;

use crate::error::DoozerError;
use client::BuildmasterClient;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Clone, Deserialize)]
pub struct AgentBuildmasterConfig {
    pub url: String,
    pub agentid: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetEntry {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub buildmaster: AgentBuildmasterConfig,
    pub projectsdir: String,
    #[serde(default)]
    pub targets: Vec<TargetEntry>,
    /// Uid/gid the build script is dropped to before exec.
    pub build_uid: Option<u32>,
    pub build_gid: Option<u32>,
    /// Seconds of silence before a build script is killed.
    #[serde(default = "default_no_output_timeout")]
    pub no_output_timeout: u64,
}

fn default_no_output_timeout() -> u64 {
    spawn::DEFAULT_TIMEOUT
}

impl AgentConfig {
    pub fn load(path: Option<&str>) -> Result<Self, DoozerError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("agent").required(false));
        }

        builder
            .add_source(config::Environment::with_prefix("DOOZER_AGENT").separator("__"))
            .build()
            .and_then(|s| s.try_deserialize())
            .map_err(|e| DoozerError::Config(e.to_string()))
    }

    fn targets_csv(&self) -> String {
        self.targets
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub struct AgentContext {
    pub cfg: AgentConfig,
    pub client: BuildmasterClient,
    pub pool: artifact::UploadPool,
    pub heap: Box<dyn heap::HeapMgr>,
}

/// Run the agent forever.
pub async fn run(cfg: AgentConfig) -> Result<(), DoozerError> {
    if cfg.targets.is_empty() {
        return Err(DoozerError::Config("No targets configured".to_string()));
    }

    let client = BuildmasterClient::new(
        &cfg.buildmaster.url,
        &cfg.buildmaster.agentid,
        &cfg.buildmaster.secret,
    );

    let heap = heap::create_heap_mgr(std::path::Path::new(&cfg.projectsdir))?;
    let pool = artifact::UploadPool::new(client.clone());

    let ctx = AgentContext {
        cfg,
        client,
        pool,
        heap,
    };

    let mut sleeper = 1u64;
    loop {
        match agent_run(&ctx).await {
            Ok(()) => sleeper = 1,
            Err(e) => {
                sleeper = (sleeper * 2).min(120);
                error!("An error occurred, sleeping for {} seconds: {}", sleeper, e);
                tokio::time::sleep(Duration::from_secs(sleeper)).await;
            }
        }
    }
}

async fn agent_run(ctx: &AgentContext) -> Result<(), DoozerError> {
    ctx.client.hello().await?;
    debug!("Welcomed by buildmaster");

    let targets = ctx.cfg.targets_csv();
    loop {
        let msg = ctx.client.getjob(&targets).await?;
        if msg.msg_type == "build" {
            job::process(ctx, msg).await;
        }
    }
}
