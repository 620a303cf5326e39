use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};
use crate::manifest::UnresolvedPolicy;
use crate::release::FailurePolicy;
use crate::storage::{FolderSpec, default_taxonomy};

pub const DEFAULT_SERVER_ID: &str = "orl-artifactory";
pub const DEFAULT_PLACEHOLDER: &str = "${release.version}";
pub const DEFAULT_TOKEN_URL: &str = "https://api.box.com/oauth2/token";
pub const DEFAULT_API_URL: &str = "https://api.box.com/2.0";
pub const DEFAULT_UPLOAD_URL: &str = "https://upload.box.com/api/2.0";

/// A raw config file after `extends`/`imports` have been folded in.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty() -> Self {
        Self {
            path: PathBuf::from("<none>"),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    /// Relative paths inside a config file are relative to that file.
    pub fn resolve_file_ref(&self, reference: &str) -> PathBuf {
        resolve_ref_path(&self.path, reference)
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, table: &mut toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = table.remove("imports") else {
        return Ok(Vec::new());
    };
    let Value::Array(arr) = raw else {
        return Err(Error::msg(format!(
            "'imports' in {} must be an array of strings",
            path.display()
        )));
    };
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::msg(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn load_value(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(tbl) = value.as_table_mut() {
        if let Some(ext) = tbl.remove("extends") {
            let Some(ext) = ext.as_str() else {
                return Err(Error::msg(format!(
                    "'extends' in {} must be a string",
                    path.display()
                )));
            };
            out = load_value(&resolve_ref_path(path, ext), stack)?;
        }
        // Imports are merged in order; the importing file wins over all of them.
        for imp in take_imports(path, tbl)? {
            let loaded = load_value(&resolve_ref_path(path, &imp), stack)?;
            merge_values(&mut out, loaded);
        }
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// String that never prints its contents.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ArtifactoryConfig {
    pub base_url: Option<String>,
    pub base_url_env: Option<String>,
    pub username: Option<String>,
    pub username_env: Option<String>,
    pub password: Option<String>,
    pub password_env: Option<String>,
    pub server_id: Option<String>,
    pub jf_bin: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BuildConfig {
    pub name: Option<String>,
    pub number: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ManifestConfig {
    pub path: Option<String>,
    pub placeholder: Option<String>,
    pub unresolved: Option<UnresolvedPolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BoxConfig {
    pub client_id: Option<String>,
    pub client_id_env: Option<String>,
    pub client_secret: Option<String>,
    pub client_secret_env: Option<String>,
    pub subject_id: Option<String>,
    pub subject_id_env: Option<String>,
    pub root_folder_name: Option<String>,
    pub parent_folder_id: Option<String>,
    pub token_url: Option<String>,
    pub api_url: Option<String>,
    pub upload_url: Option<String>,
    pub folders: Vec<FolderSpec>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RunConfig {
    pub work_dir: Option<String>,
    pub search_output: Option<String>,
    pub failure_policy: Option<FailurePolicy>,
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PromoteConfig {
    pub artifactory: ArtifactoryConfig,
    pub build: BuildConfig,
    pub manifest: ManifestConfig,
    #[serde(rename = "box")]
    pub storage: BoxConfig,
    pub run: RunConfig,
}

impl PromoteConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        Ok(doc.deserialize_path("")?.unwrap_or_default())
    }
}

/// Values given on the command line; each one beats the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub box_subject_id: Option<String>,
    pub build_name: Option<String>,
    pub build_number: Option<String>,
    pub release_version: Option<String>,
    pub rt_auth_username: Option<String>,
    pub rt_auth_password: Option<String>,
    pub box_root_folder_name: Option<String>,
    pub box_parent_folder_id: Option<String>,
    pub manifest_file_path: Option<String>,
    pub rt_base_url: Option<String>,
    pub work_dir: Option<String>,
    pub failure_policy: Option<FailurePolicy>,
}

#[derive(Debug, Clone)]
pub struct ArtifactorySettings {
    pub base_url: String,
    pub username: String,
    pub password: Secret,
    pub server_id: String,
    pub jf_bin: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildKey {
    pub name: String,
    pub number: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct ManifestSettings {
    pub path: PathBuf,
    pub placeholder: String,
    pub unresolved: UnresolvedPolicy,
}

#[derive(Debug, Clone)]
pub struct BoxSettings {
    pub client_id: String,
    pub client_secret: Secret,
    pub subject_id: String,
    pub root_folder_name: String,
    pub parent_folder_id: String,
    pub token_url: String,
    pub api_url: String,
    pub upload_url: String,
    pub folders: Vec<FolderSpec>,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub work_dir: PathBuf,
    pub search_output: String,
    pub failure_policy: FailurePolicy,
    pub http_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub artifactory: ArtifactorySettings,
    pub build: BuildKey,
    pub manifest: ManifestSettings,
    pub storage: BoxSettings,
    pub run: RunSettings,
}

impl Settings {
    pub fn resolve(doc: &ConfigDoc, cli: &Overrides) -> Result<Self> {
        let cfg = PromoteConfig::from_doc(doc)?;
        let rt = &cfg.artifactory;
        let bx = &cfg.storage;

        let artifactory = ArtifactorySettings {
            base_url: required(
                "artifactory.base_url",
                cli.rt_base_url.as_deref(),
                rt.base_url.as_deref(),
                rt.base_url_env.as_deref(),
            )?
            .trim_end_matches('/')
            .to_string(),
            username: required(
                "artifactory.username",
                cli.rt_auth_username.as_deref(),
                rt.username.as_deref(),
                rt.username_env.as_deref(),
            )?,
            password: Secret::new(required(
                "artifactory.password",
                cli.rt_auth_password.as_deref(),
                rt.password.as_deref(),
                rt.password_env.as_deref(),
            )?),
            server_id: non_empty(rt.server_id.as_deref())
                .unwrap_or_else(|| DEFAULT_SERVER_ID.to_string()),
            jf_bin: non_empty(rt.jf_bin.as_deref()).unwrap_or_else(|| "jf".to_string()),
        };

        let build = build_key(&cfg.build, cli)?;
        let manifest = manifest_settings(doc, &cfg.manifest, cli)?;

        let folders = if bx.folders.is_empty() {
            default_taxonomy()
        } else {
            bx.folders.clone()
        };
        let storage = BoxSettings {
            client_id: required(
                "box.client_id",
                cli.client_id.as_deref(),
                bx.client_id.as_deref(),
                bx.client_id_env.as_deref(),
            )?,
            client_secret: Secret::new(required(
                "box.client_secret",
                cli.client_secret.as_deref(),
                bx.client_secret.as_deref(),
                bx.client_secret_env.as_deref(),
            )?),
            subject_id: required(
                "box.subject_id",
                cli.box_subject_id.as_deref(),
                bx.subject_id.as_deref(),
                bx.subject_id_env.as_deref(),
            )?,
            root_folder_name: required(
                "box.root_folder_name",
                cli.box_root_folder_name.as_deref(),
                bx.root_folder_name.as_deref(),
                None,
            )?,
            parent_folder_id: pick(
                cli.box_parent_folder_id.as_deref(),
                bx.parent_folder_id.as_deref(),
                None,
            )
            .unwrap_or_else(|| "0".to_string()),
            token_url: non_empty(bx.token_url.as_deref())
                .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            api_url: non_empty(bx.api_url.as_deref())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            upload_url: non_empty(bx.upload_url.as_deref())
                .unwrap_or_else(|| DEFAULT_UPLOAD_URL.to_string()),
            folders,
        };

        let run = RunSettings {
            work_dir: PathBuf::from(
                pick(cli.work_dir.as_deref(), cfg.run.work_dir.as_deref(), None)
                    .unwrap_or_else(|| ".".to_string()),
            ),
            search_output: non_empty(cfg.run.search_output.as_deref())
                .unwrap_or_else(|| "artifacts.json".to_string()),
            failure_policy: cli
                .failure_policy
                .or(cfg.run.failure_policy)
                .unwrap_or_default(),
            http_timeout: cfg.run.http_timeout_secs.map(Duration::from_secs),
        };

        Ok(Self {
            artifactory,
            build,
            manifest,
            storage,
            run,
        })
    }
}

fn build_key(cfg: &BuildConfig, cli: &Overrides) -> Result<BuildKey> {
    let name = required(
        "build.name",
        cli.build_name.as_deref(),
        cfg.name.as_deref(),
        None,
    )?;
    let number = required(
        "build.number",
        cli.build_number.as_deref(),
        cfg.number.as_deref(),
        None,
    )?;
    // The manifest template is keyed on the build number unless told otherwise.
    let version = pick(cli.release_version.as_deref(), cfg.version.as_deref(), None)
        .unwrap_or_else(|| number.clone());
    Ok(BuildKey {
        name,
        number,
        version,
    })
}

/// Manifest location and placeholder rules, shared by `run` and `resolve`.
pub fn manifest_settings(
    doc: &ConfigDoc,
    cfg: &ManifestConfig,
    cli: &Overrides,
) -> Result<ManifestSettings> {
    let path = match non_empty(cli.manifest_file_path.as_deref()) {
        Some(p) => PathBuf::from(p),
        None => match non_empty(cfg.path.as_deref()) {
            Some(p) => doc.resolve_file_ref(&p),
            None => return Err(Error::msg("manifest.path is empty")),
        },
    };
    Ok(ManifestSettings {
        path,
        placeholder: cfg
            .placeholder
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_PLACEHOLDER.to_string()),
        unresolved: cfg.unresolved.unwrap_or_default(),
    })
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    env_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn pick(cli: Option<&str>, literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    non_empty(cli)
        .or_else(|| non_empty(literal))
        .or_else(|| resolve_env_ref(env_key))
}

fn required(
    cfg_path: &str,
    cli: Option<&str>,
    literal: Option<&str>,
    env_key: Option<&str>,
) -> Result<String> {
    pick(cli, literal, env_key).ok_or_else(|| {
        if let Some(k) = env_key.map(str::trim).filter(|s| !s.is_empty()) {
            Error::msg(format!("{cfg_path} is empty (also checked env var '{k}')"))
        } else {
            Error::msg(format!("{cfg_path} is empty"))
        }
    })
}
