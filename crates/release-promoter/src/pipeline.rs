use std::fs;

use tracing::{info, warn};

use crate::artifactory::{ArtifactRepository, Artifactory, BuildMetadata};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, PhaseRegistry, execute_plan};
use crate::manifest::{self, FileToLabelMap};
use crate::planner::{Phase, Plan};
use crate::release::{
    ArtifactsToRelease, DownloadOutcome, TransferReport, download_artifacts, match_release,
    upload_artifacts,
};
use crate::storage::box_api::BoxClient;
use crate::storage::{Provisioned, StorageService, provision};
use crate::workspace::WorkDir;

pub const SESSION_CONNECT: &str = "session.connect";
pub const BUILD_FETCH: &str = "build.fetch";
pub const MANIFEST_RESOLVE: &str = "manifest.resolve";
pub const RELEASE_MATCH: &str = "release.match";
pub const ARTIFACTS_DOWNLOAD: &str = "artifacts.download";
pub const FOLDERS_PROVISION: &str = "folders.provision";
pub const ARTIFACTS_UPLOAD: &str = "artifacts.upload";

/// Everything a run produces, phase by phase. Clients left as `None` are
/// connected by the session phase; tests inject their own.
pub struct RunState {
    pub settings: Settings,
    pub repo: Option<Box<dyn ArtifactRepository>>,
    pub storage: Option<Box<dyn StorageService>>,
    pub workdir: Option<WorkDir>,
    pub metadata: BuildMetadata,
    pub manifest: FileToLabelMap,
    pub release: ArtifactsToRelease,
    pub downloads: Option<DownloadOutcome>,
    pub provisioned: Option<Provisioned>,
    pub uploads: Option<TransferReport>,
}

impl RunState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            repo: None,
            storage: None,
            workdir: None,
            metadata: BuildMetadata::default(),
            manifest: FileToLabelMap::new(),
            release: ArtifactsToRelease::new(),
            downloads: None,
            provisioned: None,
            uploads: None,
        }
    }

    pub fn with_repository(mut self, repo: Box<dyn ArtifactRepository>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn with_storage(mut self, storage: Box<dyn StorageService>) -> Self {
        self.storage = Some(storage);
        self
    }

    fn repository(&self) -> Result<&dyn ArtifactRepository> {
        self.repo
            .as_deref()
            .ok_or_else(|| Error::msg("artifact repository session is not established"))
    }

    fn storage_service(&self) -> Result<&dyn StorageService> {
        self.storage
            .as_deref()
            .ok_or_else(|| Error::msg("storage session is not established"))
    }

    fn work_dir(&self) -> Result<&WorkDir> {
        self.workdir
            .as_ref()
            .ok_or_else(|| Error::msg("work dir is not initialised"))
    }
}

pub fn builtin_plan() -> Result<Plan> {
    let rows: [(&'static str, &'static str, &[&'static str]); 7] = [
        (SESSION_CONNECT, "Open repository and storage sessions", &[]),
        (BUILD_FETCH, "Fetch build metadata", &[SESSION_CONNECT]),
        (MANIFEST_RESOLVE, "Resolve release manifest", &[BUILD_FETCH]),
        (RELEASE_MATCH, "Match build against manifest", &[MANIFEST_RESOLVE]),
        (ARTIFACTS_DOWNLOAD, "Download release artifacts", &[RELEASE_MATCH]),
        (FOLDERS_PROVISION, "Provision destination folders", &[ARTIFACTS_DOWNLOAD]),
        (ARTIFACTS_UPLOAD, "Upload release artifacts", &[FOLDERS_PROVISION]),
    ];
    let mut plan = Plan::default();
    for (id, label, after) in rows {
        plan.add(Phase {
            id,
            label,
            after: after.to_vec(),
        })?;
    }
    Ok(plan)
}

pub fn builtin_registry() -> Result<PhaseRegistry> {
    let mut reg = PhaseRegistry::default();
    reg.add(SESSION_CONNECT, session_connect)?;
    reg.add(BUILD_FETCH, build_fetch)?;
    reg.add(MANIFEST_RESOLVE, manifest_resolve)?;
    reg.add(RELEASE_MATCH, release_match)?;
    reg.add(ARTIFACTS_DOWNLOAD, artifacts_download)?;
    reg.add(FOLDERS_PROVISION, folders_provision)?;
    reg.add(ARTIFACTS_UPLOAD, artifacts_upload)?;
    Ok(reg)
}

/// Run the whole promotion once, end to end.
pub fn run(state: &mut RunState, ctx: &mut ExecCtx) -> Result<()> {
    let plan = builtin_plan()?;
    let reg = builtin_registry()?;
    execute_plan(&plan, &reg, state, ctx)
}

fn session_connect(state: &mut RunState, ctx: &mut ExecCtx) -> Result<()> {
    let wd = WorkDir::init(&state.settings.run.work_dir)?;
    info!(work_dir = %wd.root().display(), "work dir ready");
    state.workdir = Some(wd);

    let timeout = state.settings.run.http_timeout;
    if state.repo.is_none() {
        let repo = Artifactory::connect(&state.settings.artifactory, timeout)?;
        state.repo = Some(Box::new(repo));
    }
    if state.storage.is_none() {
        if ctx.dry_run {
            ctx.log("dry-run: storage session not opened");
        } else {
            let client = BoxClient::connect(&state.settings.storage, timeout)?;
            state.storage = Some(Box::new(client));
        }
    }
    Ok(())
}

fn build_fetch(state: &mut RunState, _ctx: &mut ExecCtx) -> Result<()> {
    let build = &state.settings.build;
    let raw = state.repository()?.search_build(build)?;

    let dump = state.work_dir()?.file(&state.settings.run.search_output)?;
    let pretty = serde_json::to_string_pretty(&raw)?;
    fs::write(&dump, pretty)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", dump.display())))?;

    let metadata = BuildMetadata::from_search_output(&raw)?;
    info!(
        build = %build.name,
        number = %build.number,
        records = metadata.records.len(),
        files = metadata.file_names.len(),
        dump = %dump.display(),
        "build metadata fetched"
    );
    state.metadata = metadata;
    Ok(())
}

fn manifest_resolve(state: &mut RunState, _ctx: &mut ExecCtx) -> Result<()> {
    let m = &state.settings.manifest;
    state.manifest = manifest::load(
        &m.path,
        &m.placeholder,
        &state.settings.build.version,
        m.unresolved,
    )?;
    Ok(())
}

fn release_match(state: &mut RunState, _ctx: &mut ExecCtx) -> Result<()> {
    state.release = match_release(&state.manifest, &state.metadata.file_names);
    let unknown = state
        .metadata
        .file_names
        .iter()
        .filter(|n| !state.manifest.contains_key(n.as_str()))
        .count();
    info!(
        release = state.release.len(),
        not_in_manifest = unknown,
        "release set computed"
    );
    Ok(())
}

fn artifacts_download(state: &mut RunState, ctx: &mut ExecCtx) -> Result<()> {
    if ctx.dry_run {
        for record in &state.metadata.records {
            if state.release.contains_key(record.file_name()) {
                ctx.log(&format!("dry-run: would download {}", record.path));
            }
        }
        return Ok(());
    }
    let outcome = download_artifacts(
        state.repository()?,
        &state.metadata.records,
        &state.release,
        state.work_dir()?,
        state.settings.run.failure_policy,
    )?;
    info!(summary = %outcome.report.summary(), "download phase finished");
    state.downloads = Some(outcome);
    Ok(())
}

fn folders_provision(state: &mut RunState, ctx: &mut ExecCtx) -> Result<()> {
    let bx = &state.settings.storage;
    if ctx.dry_run {
        ctx.log(&format!(
            "dry-run: would ensure folder '{}' under '{}'",
            bx.root_folder_name, bx.parent_folder_id
        ));
        for spec in &bx.folders {
            ctx.log(&format!("dry-run: would ensure folder '{}'", spec.label));
        }
        return Ok(());
    }
    let provisioned = provision(
        state.storage_service()?,
        &bx.parent_folder_id,
        &bx.root_folder_name,
        &bx.folders,
    )?;
    for (label, reason) in provisioned.folders.failures() {
        warn!(label = %label, reason = %reason, "destination folder unavailable");
    }
    state.provisioned = Some(provisioned);
    Ok(())
}

fn artifacts_upload(state: &mut RunState, ctx: &mut ExecCtx) -> Result<()> {
    if ctx.dry_run {
        for (name, label) in &state.release {
            ctx.log(&format!("dry-run: would upload {name} to {label}"));
        }
        return Ok(());
    }
    let folders = &state
        .provisioned
        .as_ref()
        .ok_or_else(|| Error::msg("destination folders were not provisioned"))?
        .folders;
    let report = upload_artifacts(
        state.storage_service()?,
        &state.release,
        folders,
        state.work_dir()?,
        state.settings.run.failure_policy,
    )?;
    info!(summary = %report.summary(), "upload phase finished");
    state.uploads = Some(report);
    transfer_verdict(state)
}

/// Collected per-file failures end the run with an error once everything
/// else has been attempted.
fn transfer_verdict(state: &RunState) -> Result<()> {
    let failed: Vec<&(String, String)> = state
        .downloads
        .iter()
        .map(|d| &d.report)
        .chain(state.uploads.iter())
        .flat_map(|r| r.failed.iter())
        .collect();
    if failed.is_empty() {
        return Ok(());
    }
    let detail = failed
        .iter()
        .map(|(name, reason)| format!("{name}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(Error::msg(format!(
        "{} transfer(s) failed: {detail}",
        failed.len()
    )))
}
