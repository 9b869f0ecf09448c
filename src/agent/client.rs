//! HTTP RPC client towards the buildmaster

use crate::error::DoozerError;
use serde::Deserialize;
use tracing::debug;

/// A job descriptor as returned by `getjob`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct JobMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub id: Option<i64>,
    pub jobsecret: Option<String>,
    pub project: Option<String>,
    pub version: Option<String>,
    pub revision: Option<String>,
    pub target: Option<String>,
    pub repo: Option<String>,
    #[serde(default)]
    pub no_output: bool,
    /// Whether the coordinator retries tempfailed reports. Assumed unless
    /// the job says otherwise.
    #[serde(default = "default_true")]
    pub can_temp_fail: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone)]
pub struct BuildmasterClient {
    http: reqwest::Client,
    url: String,
    agentid: String,
    secret: String,
}

impl BuildmasterClient {
    pub fn new(url: &str, agentid: &str, secret: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            agentid: agentid.to_string(),
            secret: secret.to_string(),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn artifact_url(&self) -> String {
        format!("{}/buildmaster/artifact", self.url)
    }

    pub fn credentials(&self) -> (&str, &str) {
        (&self.agentid, &self.secret)
    }

    async fn call(
        &self,
        path: &str,
        query: &[(&str, &str)],
        json: bool,
    ) -> Result<String, DoozerError> {
        let url = format!("{}/buildmaster/{}", self.url, path);
        let mut req = self
            .http
            .get(&url)
            .basic_auth(&self.agentid, Some(&self.secret))
            .query(query);
        if json {
            req = req.header(reqwest::header::ACCEPT, "application/json");
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DoozerError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DoozerError::Http(format!("HTTP Error {}", status.as_u16())));
        }

        resp.text()
            .await
            .map_err(|e| DoozerError::Transient(e.to_string()))
    }

    pub async fn hello(&self) -> Result<(), DoozerError> {
        let body = self.call("hello", &[], false).await?;
        debug!("Welcomed by buildmaster: {}", body.trim());
        Ok(())
    }

    /// Long-poll for a job. Blocks server-side up to the configured
    /// long-poll timeout.
    pub async fn getjob(&self, targets: &str) -> Result<JobMsg, DoozerError> {
        let body = self.call("getjob", &[("targets", targets)], true).await?;
        serde_json::from_str(&body)
            .map_err(|e| DoozerError::Http(format!("Malformed job message: {}", e)))
    }

    pub async fn report(
        &self,
        jobid: i64,
        jobsecret: &str,
        status: &str,
        msg: &str,
    ) -> Result<(), DoozerError> {
        let jobid = jobid.to_string();
        self.call(
            "report",
            &[
                ("jobid", jobid.as_str()),
                ("jobsecret", jobsecret),
                ("status", status),
                ("msg", msg),
            ],
            false,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn hello_uses_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/buildmaster/hello"))
            .and(basic_auth("agent1", "sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_string("welcome\n"))
            .mount(&server)
            .await;

        let client = BuildmasterClient::new(&server.uri(), "agent1", "sekrit");
        client.hello().await.unwrap();
    }

    #[tokio::test]
    async fn hello_propagates_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/buildmaster/hello"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = BuildmasterClient::new(&server.uri(), "agent1", "wrong");
        let err = client.hello().await.unwrap_err();
        assert!(matches!(err, DoozerError::Http(_)));
    }

    #[tokio::test]
    async fn getjob_parses_build_and_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/buildmaster/getjob"))
            .and(query_param("targets", "linux-x64,darwin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "build",
                "id": 7,
                "revision": "ab".repeat(20),
                "target": "linux-x64",
                "jobsecret": "1234567",
                "project": "acme/widget",
                "repo": "https://git.example.com/widget.git",
                "version": "1.0.3",
                "no_output": false,
            })))
            .mount(&server)
            .await;

        let client = BuildmasterClient::new(&server.uri(), "agent1", "sekrit");
        let job = client.getjob("linux-x64,darwin").await.unwrap();
        assert_eq!(job.msg_type, "build");
        assert_eq!(job.id, Some(7));
        assert_eq!(job.target.as_deref(), Some("linux-x64"));
        assert!(job.can_temp_fail);

        let none: JobMsg = serde_json::from_str(r#"{"type":"none"}"#).unwrap();
        assert_eq!(none.msg_type, "none");
        assert_eq!(none.id, None);
    }
}
