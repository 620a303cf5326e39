use std::collections::BTreeSet;
use std::io::Write;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ArtifactorySettings, BuildKey, Secret};
use crate::error::{Error, Result};
use crate::workspace::file_name_of;

pub mod cli;

pub use cli::JfrogCli;

/// One file the repository knows for a build. Extra fields of the search
/// output are ignored; missing checksums read as empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: String,
    #[serde(default)]
    pub sha1: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub md5: String,
}

impl ArtifactRecord {
    pub fn file_name(&self) -> &str {
        file_name_of(&self.path)
    }
}

/// Everything needed by the later phases: the records plus their distinct names.
#[derive(Debug, Clone, Default)]
pub struct BuildMetadata {
    pub records: Vec<ArtifactRecord>,
    pub file_names: BTreeSet<String>,
}

impl BuildMetadata {
    pub fn from_records(records: Vec<ArtifactRecord>) -> Self {
        let file_names = records.iter().map(|r| r.file_name().to_string()).collect();
        Self {
            records,
            file_names,
        }
    }

    pub fn from_search_output(raw: &serde_json::Value) -> Result<Self> {
        let records: Vec<ArtifactRecord> = serde_json::from_value(raw.clone())
            .map_err(|e| Error::msg(format!("unexpected build search result: {e}")))?;
        Ok(Self::from_records(records))
    }
}

pub trait ArtifactRepository {
    /// Raw search result (a JSON array of records) for the build.
    fn search_build(&self, build: &BuildKey) -> Result<serde_json::Value>;

    /// Stream the artifact's bytes into `out`, returning the byte count.
    fn download(&self, record: &ArtifactRecord, out: &mut dyn Write) -> Result<u64>;
}

/// `jf` for the property search, plain HTTP with basic auth for file bytes.
pub struct Artifactory {
    cli: JfrogCli,
    base_url: String,
    username: String,
    password: Secret,
    http: reqwest::blocking::Client,
}

impl Artifactory {
    pub fn new(rt: &ArtifactorySettings, timeout: Option<Duration>) -> Result<Self> {
        // reqwest's blocking client defaults to a 30s timeout; an unset timeout means none.
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            cli: JfrogCli::new(&rt.jf_bin, &rt.server_id),
            base_url: rt.base_url.trim_end_matches('/').to_string(),
            username: rt.username.clone(),
            password: rt.password.clone(),
            http,
        })
    }

    /// Build the client and register credentials with `jf`.
    pub fn connect(rt: &ArtifactorySettings, timeout: Option<Duration>) -> Result<Self> {
        let repo = Self::new(rt, timeout)?;
        repo.cli.configure(rt)?;
        Ok(repo)
    }

    fn artifact_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl ArtifactRepository for Artifactory {
    fn search_build(&self, build: &BuildKey) -> Result<serde_json::Value> {
        self.cli.search_build(build)
    }

    fn download(&self, record: &ArtifactRecord, out: &mut dyn Write) -> Result<u64> {
        let url = self.artifact_url(&record.path);
        info!(url = %url, "downloading");
        let mut res = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(self.password.expose()))
            .send()
            .map_err(|e| Error::msg(format!("download of {} failed: {e}", record.path)))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "download of {} failed with status {}",
                record.path,
                res.status()
            )));
        }
        let n = std::io::copy(&mut res, out)
            .map_err(|e| Error::msg(format!("download of {} interrupted: {e}", record.path)))?;
        Ok(n)
    }
}
