use std::process::{Command, Output, Stdio};

use tracing::{debug, info};

use crate::config::{ArtifactorySettings, BuildKey};
use crate::error::{Error, Result};
use crate::log_redact::{clean_output_line, redact_command, redact_text};

/// Thin wrapper over the `jf` binary; every call blocks until the process exits.
#[derive(Debug, Clone)]
pub struct JfrogCli {
    bin: String,
    server_id: String,
}

impl JfrogCli {
    pub fn new(bin: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            server_id: server_id.into(),
        }
    }

    /// Register the server entry the searches run against, replacing any
    /// entry a previous run left under the same id.
    pub fn configure(&self, rt: &ArtifactorySettings) -> Result<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["config", "add", &self.server_id])
            .arg("--overwrite")
            .arg("--interactive=false")
            .arg("--enc-password=false")
            .arg("--basic-auth-only")
            .args(["--artifactory-url", &rt.base_url])
            .args(["--user", &rt.username])
            .args(["--password", rt.password.expose()]);
        info!(server_id = %self.server_id, url = %rt.base_url, "configuring jf server");
        let out = run_command_output(&mut cmd)?;
        if !out.status.success() {
            let msg = redact_text(&command_summary(&out), rt.password.expose());
            return Err(Error::msg(format!("jf config add failed: {msg}")));
        }
        Ok(())
    }

    /// Raw search output for every file tagged with the build's properties.
    pub fn search_build(&self, build: &BuildKey) -> Result<serde_json::Value> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(["rt", "search", "--server-id", &self.server_id])
            .arg("--props")
            .arg(format!(
                "build.name={};build.number={}",
                build.name, build.number
            ))
            .arg("*");
        info!(build = %build.name, number = %build.number, "searching build artifacts");
        let out = run_command_output(&mut cmd)?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "jf rt search failed: {}",
                command_summary(&out)
            )));
        }
        for line in String::from_utf8_lossy(&out.stderr).lines() {
            let line = clean_output_line(line);
            if !line.is_empty() {
                debug!(target: "release_promoter::jf", "{line}");
            }
        }
        serde_json::from_slice(&out.stdout)
            .map_err(|e| Error::msg(format!("jf rt search returned malformed JSON: {e}")))
    }
}

fn run_command_output(cmd: &mut Command) -> Result<Output> {
    debug!(command = %redact_command(cmd), "running");
    cmd.stdin(Stdio::null())
        .output()
        .map_err(|e| Error::msg(format!("failed to run {}: {e}", redact_command(cmd))))
}

fn command_summary(out: &Output) -> String {
    let stderr = clean_output_line(String::from_utf8_lossy(&out.stderr).trim());
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = clean_output_line(String::from_utf8_lossy(&out.stdout).trim());
    if !stdout.is_empty() {
        return stdout;
    }
    format!("status {}", out.status)
}
