use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use release_promoter::artifactory::BuildMetadata;
use release_promoter::config::{self, ConfigDoc, Overrides, PromoteConfig, Settings};
use release_promoter::executor::{ExecCtx, TracingSink};
use release_promoter::manifest::{self, UnresolvedPolicy};
use release_promoter::pipeline::{self, RunState};
use release_promoter::release::{FailurePolicy, match_release};
use release_promoter::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Promote a build's release artifacts into the storage folder tree
    Run(RunArgs),
    /// Print the ordered pipeline phases
    Plan {
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Flatten a manifest offline and print file -> label
    Resolve {
        /// Optional promote TOML supplying manifest settings
        #[arg(long)]
        config: Option<PathBuf>,
        /// Manifest template to resolve
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Value substituted for the version placeholder
        #[arg(long = "version")]
        version: String,
        /// Saved build search output; prints the release set instead
        #[arg(long)]
        artifacts: Option<PathBuf>,
        /// template | legacy
        #[arg(long)]
        unresolved: Option<UnresolvedPolicy>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Path to a promote TOML (optional; flags alone are enough)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, alias = "client_id")]
    client_id: Option<String>,
    #[arg(long, alias = "client_secret")]
    client_secret: Option<String>,
    #[arg(long, alias = "box_subject_id")]
    box_subject_id: Option<String>,
    #[arg(long, alias = "build_name")]
    build_name: Option<String>,
    #[arg(long, alias = "build_number")]
    build_number: Option<String>,
    /// Value substituted into the manifest (defaults to the build number)
    #[arg(long, alias = "release_version")]
    release_version: Option<String>,
    #[arg(long, alias = "rt_auth_username")]
    rt_auth_username: Option<String>,
    #[arg(long, alias = "rt_auth_password")]
    rt_auth_password: Option<String>,
    #[arg(long, alias = "box_root_folder_name")]
    box_root_folder_name: Option<String>,
    #[arg(long, alias = "box_parent_folder_id")]
    box_parent_folder_id: Option<String>,
    #[arg(long, alias = "manifest_file_path")]
    manifest_file_path: Option<String>,
    #[arg(long, alias = "rt_base_url")]
    rt_base_url: Option<String>,
    #[arg(long, alias = "work_dir")]
    work_dir: Option<String>,
    /// fail-fast | collect
    #[arg(long)]
    failure_policy: Option<FailurePolicy>,
    /// Fetch and match, but only log the transfers and folder changes
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            box_subject_id: self.box_subject_id.clone(),
            build_name: self.build_name.clone(),
            build_number: self.build_number.clone(),
            release_version: self.release_version.clone(),
            rt_auth_username: self.rt_auth_username.clone(),
            rt_auth_password: self.rt_auth_password.clone(),
            box_root_folder_name: self.box_root_folder_name.clone(),
            box_parent_folder_id: self.box_parent_folder_id.clone(),
            manifest_file_path: self.manifest_file_path.clone(),
            rt_base_url: self.rt_base_url.clone(),
            work_dir: self.work_dir.clone(),
            failure_policy: self.failure_policy,
        }
    }
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match cli.cmd {
        Command::Run(args) => cmd_run(&args),
        Command::Plan { dot } => cmd_plan(dot),
        Command::Resolve {
            config,
            manifest,
            version,
            artifacts,
            unresolved,
        } => cmd_resolve(
            config.as_deref(),
            manifest,
            &version,
            artifacts.as_deref(),
            unresolved,
        ),
    }
}

fn init_logging(format: LogFormat) -> Result<()> {
    let directive = "release_promoter=info"
        .parse()
        .map_err(|e| Error::msg(format!("bad log directive: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn load_doc(path: Option<&Path>) -> Result<ConfigDoc> {
    match path {
        Some(p) => config::load(p),
        None => Ok(ConfigDoc::empty()),
    }
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let doc = load_doc(args.config.as_deref())?;
    let settings = Settings::resolve(&doc, &args.overrides())?;

    let sink = Arc::new(TracingSink::default());
    let mut ctx = ExecCtx::new(args.dry_run, sink);
    let mut state = RunState::new(settings);
    pipeline::run(&mut state, &mut ctx)
}

fn cmd_plan(dot: bool) -> Result<()> {
    let plan = pipeline::builtin_plan()?;
    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }
    for (i, phase) in plan.ordered()?.iter().enumerate() {
        println!("{:>2}. {:<20}  {}", i + 1, phase.id, phase.label);
    }
    Ok(())
}

fn cmd_resolve(
    config: Option<&Path>,
    manifest_path: Option<PathBuf>,
    version: &str,
    artifacts: Option<&Path>,
    unresolved: Option<UnresolvedPolicy>,
) -> Result<()> {
    let doc = load_doc(config)?;
    let cfg = PromoteConfig::from_doc(&doc)?;
    let overrides = Overrides {
        manifest_file_path: manifest_path.map(|p| p.to_string_lossy().into_owned()),
        ..Overrides::default()
    };
    let mut m = config::manifest_settings(&doc, &cfg.manifest, &overrides)?;
    if let Some(policy) = unresolved {
        m.unresolved = policy;
    }
    let map = manifest::load(&m.path, &m.placeholder, version, m.unresolved)?;

    let out = match artifacts {
        None => map,
        Some(path) => {
            let raw = fs::read_to_string(path)
                .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            let metadata = BuildMetadata::from_search_output(&value)?;
            match_release(&map, &metadata.file_names)
        }
    };
    for (name, label) in &out {
        println!("{name}\t{label}");
    }
    Ok(())
}
