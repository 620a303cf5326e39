use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub mod box_api;

pub use box_api::BoxClient;

/// Box error code for "a sibling with this name already exists".
pub const NAME_IN_USE: &str = "item_name_in_use";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FolderHandle {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A failed call against the storage service. `status` is 0 when no HTTP
/// response was received at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
    /// Ids of existing items that caused a conflict, if the service named any.
    pub conflicts: Vec<String>,
}

impl ApiError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: 0,
            code: None,
            message: message.into(),
            conflicts: Vec::new(),
        }
    }

    pub fn is_name_collision(&self) -> bool {
        self.code.as_deref() == Some(NAME_IN_USE)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, self.status) {
            (_, 0) => write!(f, "{}", self.message),
            (Some(code), status) => write!(f, "{} ({status} {code})", self.message),
            (None, status) => write!(f, "{} ({status})", self.message),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::msg(format!("storage API error: {err}"))
    }
}

pub trait StorageService {
    fn create_folder(&self, parent_id: &str, name: &str)
    -> std::result::Result<FolderHandle, ApiError>;

    fn get_folder(&self, id: &str) -> std::result::Result<FolderHandle, ApiError>;

    /// Stream `file` into the folder under `name`. No overwrite: an existing
    /// file of that name is an error.
    fn upload_stream(
        &self,
        folder_id: &str,
        name: &str,
        file: File,
    ) -> std::result::Result<UploadedFile, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderResult {
    Created(FolderHandle),
    AlreadyExists(FolderHandle),
    Failed(String),
}

impl FolderResult {
    pub fn handle(&self) -> Option<&FolderHandle> {
        match self {
            FolderResult::Created(h) | FolderResult::AlreadyExists(h) => Some(h),
            FolderResult::Failed(_) => None,
        }
    }
}

/// Create `name` under `parent_id`, or adopt the existing folder when the
/// service reports a name collision. Other failures are returned, not raised.
pub fn ensure_folder(storage: &dyn StorageService, parent_id: &str, name: &str) -> FolderResult {
    let err = match storage.create_folder(parent_id, name) {
        Ok(h) => {
            info!(name = %name, id = %h.id, "folder created");
            return FolderResult::Created(h);
        }
        Err(e) => e,
    };
    if !err.is_name_collision() {
        warn!(name = %name, parent = %parent_id, error = %err, "folder creation failed");
        return FolderResult::Failed(err.to_string());
    }
    let Some(existing_id) = err.conflicts.first() else {
        return FolderResult::Failed(format!(
            "folder '{name}' already exists but the service did not name it"
        ));
    };
    match storage.get_folder(existing_id) {
        Ok(h) => {
            info!(name = %name, id = %h.id, "folder already exists; reusing");
            FolderResult::AlreadyExists(h)
        }
        Err(e) => {
            warn!(name = %name, id = %existing_id, error = %e, "existing folder lookup failed");
            FolderResult::Failed(e.to_string())
        }
    }
}

/// One row of the destination taxonomy. The remote folder name is the last
/// `/` segment of `label`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FolderSpec {
    pub label: String,
    #[serde(default)]
    pub parent: Option<String>,
}

impl FolderSpec {
    pub fn new(label: &str, parent: Option<&str>) -> Self {
        Self {
            label: label.to_string(),
            parent: parent.map(ToOwned::to_owned),
        }
    }

    pub fn name(&self) -> &str {
        self.label.rsplit('/').next().unwrap_or(&self.label)
    }
}

const TAXONOMY: &[(&str, Option<&str>)] = &[
    ("ee", None),
    ("ee/client-tools", Some("ee")),
    ("ee/installers", Some("ee")),
    ("ee/other", Some("ee")),
    ("ee/patches", Some("ee")),
    ("ee/plugins", Some("ee")),
    ("ee/server", Some("ee")),
    ("ee/shims", Some("ee")),
    ("ee/upgrade", Some("ee")),
    ("ce", None),
    ("ce/client-tools", Some("ce")),
    ("ce/plugins", Some("ce")),
    ("ce/server", Some("ce")),
    ("ce/other", Some("ce")),
];

pub fn default_taxonomy() -> Vec<FolderSpec> {
    TAXONOMY
        .iter()
        .map(|(label, parent)| FolderSpec::new(label, *parent))
        .collect()
}

/// Labels must be unique and every parent must be listed before its children.
pub fn validate_taxonomy(specs: &[FolderSpec]) -> Result<()> {
    let mut seen = BTreeSet::<&str>::new();
    for spec in specs {
        let label = spec.label.trim();
        if label.is_empty() || spec.name().is_empty() {
            return Err(Error::msg(format!("invalid folder label '{}'", spec.label)));
        }
        if let Some(parent) = spec.parent.as_deref() {
            if !seen.contains(parent) {
                return Err(Error::msg(format!(
                    "folder '{}' names parent '{}' which is not listed before it",
                    label, parent
                )));
            }
        }
        if !seen.insert(label) {
            return Err(Error::msg(format!("duplicate folder label '{label}'")));
        }
    }
    Ok(())
}

/// Label -> outcome for every row of the taxonomy.
#[derive(Debug, Clone, Default)]
pub struct DestinationFolders {
    results: BTreeMap<String, FolderResult>,
}

impl DestinationFolders {
    pub fn handle(&self, label: &str) -> Option<&FolderHandle> {
        self.results.get(label).and_then(FolderResult::handle)
    }

    pub fn result(&self, label: &str) -> Option<&FolderResult> {
        self.results.get(label)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.results.iter().filter_map(|(k, v)| match v {
            FolderResult::Failed(reason) => Some((k.as_str(), reason.as_str())),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn insert(&mut self, label: impl Into<String>, result: FolderResult) {
        self.results.insert(label.into(), result);
    }
}

/// Walk the taxonomy in order, ensuring each folder under its parent (or
/// under `root_id` for top-level rows).
pub fn ensure_tree(
    storage: &dyn StorageService,
    root_id: &str,
    specs: &[FolderSpec],
) -> Result<DestinationFolders> {
    validate_taxonomy(specs)?;
    let mut out = DestinationFolders::default();
    for spec in specs {
        let parent_id = match spec.parent.as_deref() {
            None => Some(root_id.to_string()),
            Some(p) => out.handle(p).map(|h| h.id.clone()),
        };
        let result = match parent_id {
            Some(pid) => ensure_folder(storage, &pid, spec.name()),
            None => FolderResult::Failed(format!(
                "parent folder '{}' unavailable",
                spec.parent.as_deref().unwrap_or_default()
            )),
        };
        out.insert(spec.label.clone(), result);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub root: FolderHandle,
    pub folders: DestinationFolders,
}

/// Ensure the release root under `parent_id`, then the taxonomy beneath it.
pub fn provision(
    storage: &dyn StorageService,
    parent_id: &str,
    root_name: &str,
    specs: &[FolderSpec],
) -> Result<Provisioned> {
    let root = match ensure_folder(storage, parent_id, root_name) {
        FolderResult::Created(h) | FolderResult::AlreadyExists(h) => h,
        FolderResult::Failed(reason) => {
            return Err(Error::msg(format!(
                "failed to ensure release root folder '{root_name}': {reason}"
            )));
        }
    };
    let folders = ensure_tree(storage, &root.id, specs)?;
    let failed = folders.failures().count();
    info!(
        root = %root.id,
        folders = folders.len(),
        failed,
        "destination folders ready"
    );
    Ok(Provisioned { root, folders })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct ScriptedStorage {
        existing: RefCell<BTreeMap<(String, String), String>>,
        broken_names: BTreeSet<String>,
        next_id: RefCell<u32>,
    }

    impl StorageService for ScriptedStorage {
        fn create_folder(
            &self,
            parent_id: &str,
            name: &str,
        ) -> std::result::Result<FolderHandle, ApiError> {
            if self.broken_names.contains(name) {
                return Err(ApiError {
                    status: 403,
                    code: Some("access_denied_insufficient_permissions".into()),
                    message: "denied".into(),
                    conflicts: vec![],
                });
            }
            let key = (parent_id.to_string(), name.to_string());
            if let Some(id) = self.existing.borrow().get(&key) {
                return Err(ApiError {
                    status: 409,
                    code: Some(NAME_IN_USE.into()),
                    message: "Item with the same name already exists".into(),
                    conflicts: vec![id.clone()],
                });
            }
            let mut n = self.next_id.borrow_mut();
            *n += 1;
            let id = format!("f{n}");
            self.existing.borrow_mut().insert(key, id.clone());
            Ok(FolderHandle {
                id,
                name: name.to_string(),
            })
        }

        fn get_folder(&self, id: &str) -> std::result::Result<FolderHandle, ApiError> {
            self.existing
                .borrow()
                .iter()
                .find(|(_, v)| v.as_str() == id)
                .map(|((_, name), v)| FolderHandle {
                    id: v.clone(),
                    name: name.clone(),
                })
                .ok_or_else(|| ApiError {
                    status: 404,
                    code: Some("not_found".into()),
                    message: "not found".into(),
                    conflicts: vec![],
                })
        }

        fn upload_stream(
            &self,
            _folder_id: &str,
            _name: &str,
            _file: File,
        ) -> std::result::Result<UploadedFile, ApiError> {
            unreachable!("not used by folder tests")
        }
    }

    #[test]
    fn default_taxonomy_is_valid_and_complete() {
        let specs = default_taxonomy();
        validate_taxonomy(&specs).expect("valid");
        assert_eq!(specs.len(), 14);
        assert_eq!(specs[1].name(), "client-tools");
        assert_eq!(specs.iter().filter(|s| s.parent.is_none()).count(), 2);
    }

    #[test]
    fn taxonomy_rejects_child_before_parent_and_duplicates() {
        let bad_order = vec![FolderSpec::new("ee/server", Some("ee")), FolderSpec::new("ee", None)];
        assert!(validate_taxonomy(&bad_order).is_err());
        let dup = vec![FolderSpec::new("ee", None), FolderSpec::new("ee", None)];
        assert!(validate_taxonomy(&dup).is_err());
    }

    #[test]
    fn second_provision_resolves_the_same_folders() {
        let storage = ScriptedStorage::default();
        let specs = default_taxonomy();
        let first = provision(&storage, "0", "9.5.1.0", &specs).expect("first");
        let second = provision(&storage, "0", "9.5.1.0", &specs).expect("second");

        assert_eq!(first.root, second.root);
        for spec in &specs {
            let a = first.folders.handle(&spec.label).expect("first handle");
            let b = second.folders.handle(&spec.label).expect("second handle");
            assert_eq!(a, b, "label {}", spec.label);
            assert!(matches!(first.folders.result(&spec.label), Some(FolderResult::Created(_))));
            assert!(matches!(
                second.folders.result(&spec.label),
                Some(FolderResult::AlreadyExists(_))
            ));
        }
    }

    #[test]
    fn failures_are_recorded_and_cascade_to_children() {
        let storage = ScriptedStorage {
            broken_names: ["ce".to_string(), "shims".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let p = provision(&storage, "0", "root", &default_taxonomy()).expect("provision");
        assert!(p.folders.handle("ee/server").is_some());
        assert!(p.folders.handle("ee/shims").is_none());
        assert!(p.folders.handle("ce").is_none());
        match p.folders.result("ce/server") {
            Some(FolderResult::Failed(reason)) => assert!(reason.contains("'ce'"), "{reason}"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(p.folders.failures().count(), 6);
    }

    #[test]
    fn root_failure_aborts_provisioning() {
        let storage = ScriptedStorage {
            broken_names: ["root".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let err = provision(&storage, "0", "root", &default_taxonomy())
            .unwrap_err()
            .to_string();
        assert!(err.contains("release root folder"), "unexpected err: {err}");
    }

    #[test]
    fn collision_without_conflict_id_is_a_failure() {
        struct Conflicting;
        impl StorageService for Conflicting {
            fn create_folder(&self, _: &str, _: &str) -> std::result::Result<FolderHandle, ApiError> {
                Err(ApiError {
                    status: 409,
                    code: Some(NAME_IN_USE.into()),
                    message: "exists".into(),
                    conflicts: vec![],
                })
            }
            fn get_folder(&self, _: &str) -> std::result::Result<FolderHandle, ApiError> {
                unreachable!()
            }
            fn upload_stream(&self, _: &str, _: &str, _: File) -> std::result::Result<UploadedFile, ApiError> {
                unreachable!()
            }
        }
        assert!(matches!(ensure_folder(&Conflicting, "0", "x"), FolderResult::Failed(_)));
    }
}
