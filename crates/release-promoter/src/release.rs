use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufWriter, IsTerminal, Write};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::artifactory::{ArtifactRecord, ArtifactRepository};
use crate::error::{Error, Result};
use crate::manifest::FileToLabelMap;
use crate::storage::{DestinationFolders, StorageService};
use crate::workspace::WorkDir;

/// File name (artifact or its `.sum` sidecar) -> destination label.
pub type ArtifactsToRelease = BTreeMap<String, String>;

pub const SUM_SUFFIX: &str = ".sum";

/// What a transfer phase does when a single artifact fails.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort the run on the first error.
    #[default]
    FailFast,
    /// Record the error, carry on, and fail the run at the end.
    Collect,
}

impl std::str::FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "fail-fast" => Ok(Self::FailFast),
            "collect" => Ok(Self::Collect),
            other => Err(Error::msg(format!(
                "unknown failure policy '{other}' (expected fail-fast or collect)"
            ))),
        }
    }
}

pub fn sidecar_name(file_name: &str) -> String {
    format!("{file_name}{SUM_SUFFIX}")
}

/// Exact-name intersection of the manifest and the build; every hit brings
/// its `.sum` sidecar along under the same label.
pub fn match_release(manifest: &FileToLabelMap, build_names: &BTreeSet<String>) -> ArtifactsToRelease {
    let mut out = ArtifactsToRelease::new();
    for name in build_names {
        if let Some(label) = manifest.get(name) {
            out.insert(name.clone(), label.clone());
            out.insert(sidecar_name(name), label.clone());
        }
    }
    out
}

pub fn checksum_text(record: &ArtifactRecord) -> String {
    format!(
        "sha1={}\nsha256={}\nmd5={}\n",
        record.sha1, record.sha256, record.md5
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub done: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl TransferReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "done={} skipped={} failed={}",
            self.done.len(),
            self.skipped.len(),
            self.failed.len()
        )
    }

    fn record_failure(&mut self, policy: FailurePolicy, name: &str, err: Error) -> Result<()> {
        match policy {
            FailurePolicy::FailFast => Err(err),
            FailurePolicy::Collect => {
                error!(file = %name, error = %err, "transfer failed; continuing");
                self.failed.push((name.to_string(), err.to_string()));
                Ok(())
            }
        }
    }
}

fn progress_bar(len: usize, what: &str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::with_template("{prefix} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    pb.set_style(style);
    pb.set_prefix(what.to_string());
    pb
}

/// Fetch one artifact into the work dir through a `.part` file so an
/// interrupted transfer never looks like a finished one.
fn fetch_one(repo: &dyn ArtifactRepository, record: &ArtifactRecord, wd: &WorkDir) -> Result<u64> {
    let name = record.file_name();
    let dest = wd.file(name)?;
    let part = wd.file(&format!("{name}.part"))?;
    let result = (|| -> Result<u64> {
        let f = File::create(&part)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", part.display())))?;
        let mut w = BufWriter::new(f);
        let n = repo.download(record, &mut w)?;
        w.flush()
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", part.display())))?;
        Ok(n)
    })();
    match result {
        Ok(n) => {
            fs::rename(&part, &dest).map_err(|e| {
                Error::msg(format!("failed to move {} into place: {e}", dest.display()))
            })?;
            Ok(n)
        }
        Err(e) => {
            let _ = fs::remove_file(&part);
            Err(e)
        }
    }
}

fn write_sidecar(record: &ArtifactRecord, wd: &WorkDir) -> Result<bool> {
    let name = sidecar_name(record.file_name());
    if wd.contains(&name)? {
        return Ok(false);
    }
    let path = wd.file(&name)?;
    fs::write(&path, checksum_text(record))
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
    Ok(true)
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOutcome {
    /// Names of matched artifacts, in record order.
    pub attempted: Vec<String>,
    pub report: TransferReport,
}

/// Download every record whose name is in `release`. Files already present
/// in the work dir are left alone; sidecars are written when missing.
pub fn download_artifacts(
    repo: &dyn ArtifactRepository,
    records: &[ArtifactRecord],
    release: &ArtifactsToRelease,
    wd: &WorkDir,
    policy: FailurePolicy,
) -> Result<DownloadOutcome> {
    let wanted: Vec<&ArtifactRecord> = records
        .iter()
        .filter(|r| release.contains_key(r.file_name()))
        .collect();
    let pb = progress_bar(wanted.len(), "download");
    let mut out = DownloadOutcome::default();

    for record in wanted {
        let name = record.file_name().to_string();
        pb.set_message(name.clone());
        out.attempted.push(name.clone());

        let step = (|| -> Result<bool> {
            let fetched = if wd.contains(&name)? {
                info!(file = %name, "already downloaded; skipping");
                false
            } else {
                let bytes = fetch_one(repo, record, wd)?;
                info!(file = %name, bytes, "download complete");
                true
            };
            if write_sidecar(record, wd)? {
                info!(file = %sidecar_name(&name), "checksum file written");
            }
            Ok(fetched)
        })();

        match step {
            Ok(true) => out.report.done.push(name),
            Ok(false) => out.report.skipped.push(name),
            Err(e) => {
                let e = e.context(format!("download {name}"));
                if let Err(e) = out.report.record_failure(policy, &name, e) {
                    pb.abandon();
                    return Err(e);
                }
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    info!(files = ?out.attempted, "release artifacts downloaded");
    Ok(out)
}

/// Upload every entry of `release` from the work dir into its label's folder.
pub fn upload_artifacts(
    storage: &dyn StorageService,
    release: &ArtifactsToRelease,
    folders: &DestinationFolders,
    wd: &WorkDir,
    policy: FailurePolicy,
) -> Result<TransferReport> {
    let pb = progress_bar(release.len(), "upload");
    let mut report = TransferReport::default();

    for (name, label) in release {
        pb.set_message(name.clone());
        let step = (|| -> Result<()> {
            let folder = folders
                .handle(label)
                .ok_or_else(|| Error::msg(format!("no destination folder for label '{label}'")))?;
            let path = wd.file(name)?;
            let file = File::open(&path)
                .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
            info!(file = %name, label = %label, folder = %folder.id, "uploading");
            let uploaded = storage.upload_stream(&folder.id, name, file)?;
            info!(file = %name, id = %uploaded.id, "uploaded");
            Ok(())
        })();

        match step {
            Ok(()) => report.done.push(name.clone()),
            Err(e) => {
                let e = e.context(format!("upload {name}"));
                if let Err(e) = report.record_failure(policy, name, e) {
                    pb.abandon();
                    return Err(e);
                }
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    if !report.is_clean() {
        warn!(failed = report.failed.len(), "some uploads failed");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn match_adds_sidecar_with_same_label() {
        let mut manifest = FileToLabelMap::new();
        manifest.insert("foo-1.0.zip".into(), "ee/server".into());
        let got = match_release(&manifest, &names(&["foo-1.0.zip"]));
        let want: ArtifactsToRelease = [
            ("foo-1.0.zip".to_string(), "ee/server".to_string()),
            ("foo-1.0.zip.sum".to_string(), "ee/server".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn match_is_exact_and_two_sided() {
        let mut manifest = FileToLabelMap::new();
        manifest.insert("a.zip".into(), "ee/server".into());
        manifest.insert("only-in-manifest.zip".into(), "ce/server".into());
        manifest.insert("B.zip".into(), "ce/other".into());
        let got = match_release(&manifest, &names(&["a.zip", "b.zip", "a.zip.bak", "only-in-build.zip"]));
        assert_eq!(got.len(), 2);
        assert!(got.contains_key("a.zip"));
        assert!(got.contains_key("a.zip.sum"));
    }

    #[test]
    fn match_of_empty_build_is_empty() {
        let mut manifest = FileToLabelMap::new();
        manifest.insert("a.zip".into(), "ee/server".into());
        assert!(match_release(&manifest, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn checksum_lines_are_in_fixed_order() {
        let record = ArtifactRecord {
            path: "x/foo-1.0.zip".into(),
            sha1: "a".into(),
            sha256: "b".into(),
            md5: "c".into(),
        };
        assert_eq!(checksum_text(&record), "sha1=a\nsha256=b\nmd5=c\n");
        assert_eq!(sidecar_name(record.file_name()), "foo-1.0.zip.sum");
    }

    #[test]
    fn failure_policy_parses() {
        assert_eq!("collect".parse::<FailurePolicy>().expect("parse"), FailurePolicy::Collect);
        assert_eq!("fail-fast".parse::<FailurePolicy>().expect("parse"), FailurePolicy::FailFast);
        assert!("retry".parse::<FailurePolicy>().is_err());
    }
}
