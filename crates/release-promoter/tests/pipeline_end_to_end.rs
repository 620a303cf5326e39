use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, mpsc};

use release_promoter::artifactory::{ArtifactRecord, ArtifactRepository};
use release_promoter::config::{
    ArtifactorySettings, BoxSettings, BuildKey, ManifestSettings, RunSettings, Secret, Settings,
};
use release_promoter::executor::{ChannelSink, ExecCtx, ExecEvent};
use release_promoter::manifest::UnresolvedPolicy;
use release_promoter::pipeline::{self, RunState};
use release_promoter::release::FailurePolicy;
use release_promoter::storage::{
    ApiError, FolderHandle, NAME_IN_USE, StorageService, UploadedFile, default_taxonomy,
};
use release_promoter::{Error, Result};

const MANIFEST: &str = r#"
ee:
  server:
    - pentaho-server-ee-${release.version}.zip
  plugins:
    - paz-plugin-ee-${release.version}.zip
ce:
  server:
    - pentaho-server-ce-${release.version}.zip
"#;

const VERSION: &str = "10.2.0.0-100";

#[derive(Clone, Default)]
struct FakeRepo {
    records: Vec<ArtifactRecord>,
    broken: BTreeSet<String>,
    fetched: Rc<RefCell<Vec<String>>>,
}

impl FakeRepo {
    fn with(records: Vec<ArtifactRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }
}

impl ArtifactRepository for FakeRepo {
    fn search_build(&self, _build: &BuildKey) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.records)?)
    }

    fn download(&self, record: &ArtifactRecord, out: &mut dyn Write) -> Result<u64> {
        self.fetched.borrow_mut().push(record.path.clone());
        if self.broken.contains(&record.path) {
            return Err(Error::msg(format!("connection reset fetching {}", record.path)));
        }
        let body = format!("bytes of {}", record.path);
        out.write_all(body.as_bytes())?;
        Ok(body.len() as u64)
    }
}

#[derive(Default)]
struct StorageState {
    next_id: u64,
    // (parent id, name) -> folder id
    folders: BTreeMap<(String, String), String>,
    // (folder id, name) -> content
    files: BTreeMap<(String, String), String>,
    // folder names whose creation is denied
    refused: BTreeSet<String>,
}

#[derive(Clone, Default)]
struct FakeStorage {
    state: Rc<RefCell<StorageState>>,
}

impl FakeStorage {
    fn refusing(name: &str) -> Self {
        let storage = Self::default();
        storage.state.borrow_mut().refused.insert(name.to_string());
        storage
    }

    fn folder_count(&self) -> usize {
        self.state.borrow().folders.len()
    }

    fn folder_id(&self, parent: &str, name: &str) -> Option<String> {
        self.state
            .borrow()
            .folders
            .get(&(parent.to_string(), name.to_string()))
            .cloned()
    }

    fn file(&self, folder: &str, name: &str) -> Option<String> {
        self.state
            .borrow()
            .files
            .get(&(folder.to_string(), name.to_string()))
            .cloned()
    }

    fn file_count(&self) -> usize {
        self.state.borrow().files.len()
    }

    /// Folder id for a label below the release root.
    fn label_id(&self, root: &str, label: &str) -> Option<String> {
        let mut id = self.folder_id("0", root)?;
        for seg in label.split('/') {
            id = self.folder_id(&id, seg)?;
        }
        Some(id)
    }
}

fn conflict(id: &str) -> ApiError {
    ApiError {
        status: 409,
        code: Some(NAME_IN_USE.to_string()),
        message: "Item with the same name already exists".into(),
        conflicts: vec![id.to_string()],
    }
}

impl StorageService for FakeStorage {
    fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> std::result::Result<FolderHandle, ApiError> {
        let mut s = self.state.borrow_mut();
        if s.refused.contains(name) {
            return Err(ApiError {
                status: 403,
                code: Some("access_denied_insufficient_permissions".into()),
                message: "Access denied".into(),
                conflicts: Vec::new(),
            });
        }
        let key = (parent_id.to_string(), name.to_string());
        if let Some(id) = s.folders.get(&key) {
            return Err(conflict(id));
        }
        s.next_id += 1;
        let id = format!("f{}", s.next_id);
        s.folders.insert(key, id.clone());
        Ok(FolderHandle {
            id,
            name: name.to_string(),
        })
    }

    fn get_folder(&self, id: &str) -> std::result::Result<FolderHandle, ApiError> {
        let s = self.state.borrow();
        s.folders
            .iter()
            .find(|(_, v)| v.as_str() == id)
            .map(|((_, name), v)| FolderHandle {
                id: v.clone(),
                name: name.clone(),
            })
            .ok_or_else(|| ApiError {
                status: 404,
                code: Some("not_found".into()),
                message: "no such folder".into(),
                conflicts: Vec::new(),
            })
    }

    fn upload_stream(
        &self,
        folder_id: &str,
        name: &str,
        mut file: File,
    ) -> std::result::Result<UploadedFile, ApiError> {
        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| ApiError::transport(e.to_string()))?;
        let mut s = self.state.borrow_mut();
        let key = (folder_id.to_string(), name.to_string());
        if s.files.contains_key(&key) {
            return Err(conflict("existing-file"));
        }
        s.next_id += 1;
        let id = format!("file{}", s.next_id);
        s.files.insert(key, content);
        Ok(UploadedFile {
            id,
            name: name.to_string(),
        })
    }
}

fn record(path: &str) -> ArtifactRecord {
    ArtifactRecord {
        path: path.to_string(),
        sha1: format!("sha1-{path}"),
        sha256: format!("sha256-{path}"),
        md5: format!("md5-{path}"),
    }
}

fn settings(root: &Path, policy: FailurePolicy) -> Settings {
    settings_with_manifest(root, policy, MANIFEST)
}

fn settings_with_manifest(root: &Path, policy: FailurePolicy, text: &str) -> Settings {
    let manifest = root.join("manifest.yaml");
    fs::write(&manifest, text).expect("write manifest");
    Settings {
        artifactory: ArtifactorySettings {
            base_url: "http://artifactory.invalid/artifactory".into(),
            username: "buildguy".into(),
            password: Secret::new("hunter2"),
            server_id: "orl-artifactory".into(),
            jf_bin: "jf".into(),
        },
        build: BuildKey {
            name: "pentaho".into(),
            number: VERSION.into(),
            version: VERSION.into(),
        },
        manifest: ManifestSettings {
            path: manifest,
            placeholder: "${release.version}".into(),
            unresolved: UnresolvedPolicy::Template,
        },
        storage: BoxSettings {
            client_id: "app-id".into(),
            client_secret: Secret::new("app-secret"),
            subject_id: "enterprise-7".into(),
            root_folder_name: "release-10.2".into(),
            parent_folder_id: "0".into(),
            token_url: "http://box.invalid/oauth2/token".into(),
            api_url: "http://box.invalid/2.0".into(),
            upload_url: "http://box.invalid/api/2.0".into(),
            folders: default_taxonomy(),
        },
        run: RunSettings {
            work_dir: root.join("work"),
            search_output: "artifacts.json".into(),
            failure_policy: policy,
            http_timeout: None,
        },
    }
}

fn ctx(dry_run: bool) -> (ExecCtx, mpsc::Receiver<ExecEvent>) {
    let (tx, rx) = mpsc::channel();
    (ExecCtx::new(dry_run, Arc::new(ChannelSink::new(tx))), rx)
}

fn run_once(
    root: &Path,
    policy: FailurePolicy,
    repo: &FakeRepo,
    storage: &FakeStorage,
) -> Result<()> {
    run_with(settings(root, policy), repo, storage)
}

fn run_with(settings: Settings, repo: &FakeRepo, storage: &FakeStorage) -> Result<()> {
    let mut state = RunState::new(settings)
        .with_repository(Box::new(repo.clone()))
        .with_storage(Box::new(storage.clone()));
    let (mut ctx, _rx) = ctx(false);
    pipeline::run(&mut state, &mut ctx)
}

#[test]
fn empty_build_still_provisions_the_folder_tree() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let repo = FakeRepo::default();
    let storage = FakeStorage::default();

    run_once(tmp.path(), FailurePolicy::FailFast, &repo, &storage).expect("run");

    // release root + 14 taxonomy folders
    assert_eq!(storage.folder_count(), 15);
    assert_eq!(storage.file_count(), 0);
    assert!(repo.fetched.borrow().is_empty());
    let dump = fs::read_to_string(tmp.path().join("work/artifacts.json")).expect("dump");
    assert_eq!(dump.trim(), "[]");
}

#[test]
fn matched_artifacts_land_in_their_label_folders() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let server = format!("libs/pentaho-server-ee-{VERSION}.zip");
    let ce = format!("libs/ce/pentaho-server-ce-{VERSION}.zip");
    let repo = FakeRepo::with(vec![
        record(&server),
        record(&ce),
        record("libs/not-released.zip"),
    ]);
    let storage = FakeStorage::default();

    run_once(tmp.path(), FailurePolicy::FailFast, &repo, &storage).expect("run");

    assert_eq!(*repo.fetched.borrow(), vec![server.clone(), ce.clone()]);
    let work = tmp.path().join("work");
    let ee_name = format!("pentaho-server-ee-{VERSION}.zip");
    assert_eq!(
        fs::read_to_string(work.join(format!("{ee_name}.sum"))).expect("sum"),
        format!("sha1=sha1-{server}\nsha256=sha256-{server}\nmd5=md5-{server}\n")
    );
    assert!(!work.join("not-released.zip").exists());
    assert!(!work.join(format!("{ee_name}.part")).exists());

    let ee_server = storage.label_id("release-10.2", "ee/server").expect("ee/server");
    assert_eq!(
        storage.file(&ee_server, &ee_name).as_deref(),
        Some(format!("bytes of {server}").as_str())
    );
    assert!(storage.file(&ee_server, &format!("{ee_name}.sum")).is_some());
    let ce_server = storage.label_id("release-10.2", "ce/server").expect("ce/server");
    assert!(
        storage
            .file(&ce_server, &format!("pentaho-server-ce-{VERSION}.zip"))
            .is_some()
    );
    assert_eq!(storage.file_count(), 4);
}

#[test]
fn existing_local_files_are_not_fetched_again() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let name = format!("pentaho-server-ee-{VERSION}.zip");
    let work = tmp.path().join("work");
    fs::create_dir_all(&work).expect("mkdir");
    fs::write(work.join(&name), "stale").expect("seed");

    let repo = FakeRepo::with(vec![record(&format!("libs/{name}"))]);
    let storage = FakeStorage::default();
    run_once(tmp.path(), FailurePolicy::FailFast, &repo, &storage).expect("run");

    assert!(repo.fetched.borrow().is_empty());
    assert_eq!(fs::read_to_string(work.join(&name)).expect("read"), "stale");
    assert!(work.join(format!("{name}.sum")).exists());
}

#[test]
fn rerun_reuses_folders_but_rejects_duplicate_uploads() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let name = format!("pentaho-server-ee-{VERSION}.zip");
    let repo = FakeRepo::with(vec![record(&format!("libs/{name}"))]);
    let storage = FakeStorage::default();

    run_once(tmp.path(), FailurePolicy::FailFast, &repo, &storage).expect("first run");
    let folders_after_first = storage.folder_count();

    let err = run_once(tmp.path(), FailurePolicy::Collect, &repo, &storage)
        .unwrap_err()
        .to_string();
    assert_eq!(storage.folder_count(), folders_after_first);
    assert_eq!(repo.fetched.borrow().len(), 1);
    assert!(err.contains("2 transfer(s) failed"), "{err}");
}

#[test]
fn collect_policy_keeps_going_after_a_failed_download() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let broken = format!("libs/pentaho-server-ee-{VERSION}.zip");
    let good = format!("libs/paz-plugin-ee-{VERSION}.zip");
    let mut repo = FakeRepo::with(vec![record(&broken), record(&good)]);
    repo.broken.insert(broken.clone());
    let storage = FakeStorage::default();

    let err = run_once(tmp.path(), FailurePolicy::Collect, &repo, &storage)
        .unwrap_err()
        .to_string();
    // the broken download, then its artifact and sidecar missing at upload
    assert!(err.contains("3 transfer(s) failed"), "{err}");

    let plugins = storage.label_id("release-10.2", "ee/plugins").expect("ee/plugins");
    assert!(
        storage
            .file(&plugins, &format!("paz-plugin-ee-{VERSION}.zip"))
            .is_some()
    );
    let work = tmp.path().join("work");
    assert!(!work.join(format!("pentaho-server-ee-{VERSION}.zip.part")).exists());
}

#[test]
fn fail_fast_stops_before_touching_storage() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let broken = format!("libs/pentaho-server-ee-{VERSION}.zip");
    let mut repo = FakeRepo::with(vec![record(&broken)]);
    repo.broken.insert(broken);
    let storage = FakeStorage::default();

    let err = run_once(tmp.path(), FailurePolicy::FailFast, &repo, &storage)
        .unwrap_err()
        .to_string();
    assert!(err.contains("artifacts.download"), "{err}");
    assert!(err.contains("connection reset"), "{err}");
    assert_eq!(storage.folder_count(), 0);
}

// ee/patches is refused by the storage fake; misc is not in the taxonomy.
const MANIFEST_WITH_GAPS: &str = r#"
ee:
  server:
    - pentaho-server-ee-${release.version}.zip
  patches:
    - pentaho-patch-${release.version}.zip
misc:
  - x.zip
"#;

fn gapped_build() -> FakeRepo {
    FakeRepo::with(vec![
        record(&format!("libs/pentaho-server-ee-{VERSION}.zip")),
        record(&format!("libs/pentaho-patch-{VERSION}.zip")),
        record("libs/x.zip"),
    ])
}

#[test]
fn fail_fast_aborts_on_a_label_without_a_folder() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let repo = gapped_build();
    let storage = FakeStorage::refusing("patches");

    let settings = settings_with_manifest(tmp.path(), FailurePolicy::FailFast, MANIFEST_WITH_GAPS);
    let err = run_with(settings, &repo, &storage).unwrap_err().to_string();
    assert!(err.contains("artifacts.upload"), "{err}");
    assert!(err.contains("no destination folder for label"), "{err}");
    assert_eq!(storage.file_count(), 0);
}

#[test]
fn collect_uploads_what_has_a_folder_and_reports_the_rest() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let repo = gapped_build();
    let storage = FakeStorage::refusing("patches");

    let settings = settings_with_manifest(tmp.path(), FailurePolicy::Collect, MANIFEST_WITH_GAPS);
    let err = run_with(settings, &repo, &storage).unwrap_err().to_string();
    // patch and x.zip, each with its sidecar
    assert!(err.contains("4 transfer(s) failed"), "{err}");
    assert!(err.contains("no destination folder for label 'ee/patches'"), "{err}");
    assert!(err.contains("no destination folder for label 'misc'"), "{err}");

    let server = storage.label_id("release-10.2", "ee/server").expect("ee/server");
    let name = format!("pentaho-server-ee-{VERSION}.zip");
    assert!(storage.file(&server, &name).is_some());
    assert!(storage.file(&server, &format!("{name}.sum")).is_some());
    assert_eq!(storage.file_count(), 2);
    assert!(storage.label_id("release-10.2", "ee/patches").is_none());
}

#[test]
fn dry_run_only_reports_transfers() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let name = format!("pentaho-server-ee-{VERSION}.zip");
    let repo = FakeRepo::with(vec![record(&format!("libs/{name}"))]);

    let mut state = RunState::new(settings(tmp.path(), FailurePolicy::FailFast))
        .with_repository(Box::new(repo.clone()));
    let (mut ctx, rx) = ctx(true);
    pipeline::run(&mut state, &mut ctx).expect("dry run");

    assert!(repo.fetched.borrow().is_empty());
    assert!(state.storage.is_none());
    assert_eq!(state.release.len(), 2);
    let work = tmp.path().join("work");
    assert!(work.join("artifacts.json").exists());
    assert!(!work.join(&name).exists());

    let events: Vec<ExecEvent> = rx.try_iter().collect();
    let finished = events
        .iter()
        .filter(|e| matches!(e, ExecEvent::PhaseFinished { ok: true, .. }))
        .count();
    assert_eq!(finished, 7);
    assert!(events.iter().any(|e| matches!(
        e,
        ExecEvent::PhaseLog { line, .. } if line == &format!("dry-run: would upload {name} to ee/server")
    )));
    assert!(matches!(
        events.last(),
        Some(ExecEvent::RunDone { ok: true, .. })
    ));
}
