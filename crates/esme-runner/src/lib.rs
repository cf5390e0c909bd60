pub mod config;
pub mod fs;
pub mod manifest;

use std::fs as stdfs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{Local, NaiveDate, Utc};
use esme_core::render::{render, Variables};
use esme_core::{
    atomic_write_bytes, ensure_dir, guess_machine, hostname_candidates, EsmeError, IoContext,
    Result, SiteRegistry, STATE_DIR,
};
use esme_provenance::{check_identity, read_binding, BindingRecord, Outcome, Provenance, VersionControl};

pub use config::{ExperimentConfig, CONFIG_FILE};
pub use fs::{Filesystem, LocalFs};
pub use manifest::{populate, PopulateReport};

pub const SETTINGS_FILE: &str = "settings.yaml";
pub const SPEC_DIR: &str = "experiment_specifications";
pub const INPUT_MANIFEST: &str = "input/input_manifest.yaml";
pub const BUILD_MANIFEST: &str = "build/build_manifest.yaml";
pub const SITE_TEMPLATE_DIR: &str = "templates/site";
pub const LOAD_ENV_SCRIPT: &str = "load_env.sh";
const LOCK_FILE: &str = "stage.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Create,
    Setup,
    Build,
    Run,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Create => "create",
            Stage::Setup => "setup",
            Stage::Build => "build",
            Stage::Run => "run",
        }
    }
}

/// Per-site script templates shipped in an experiment's `templates/site`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteScript {
    LoadEnv,
    Build,
    Setup,
    Run,
}

impl SiteScript {
    pub const ALL: [SiteScript; 4] = [
        SiteScript::LoadEnv,
        SiteScript::Build,
        SiteScript::Setup,
        SiteScript::Run,
    ];

    fn stem(self) -> &'static str {
        match self {
            SiteScript::LoadEnv => "load_env",
            SiteScript::Build => "build",
            SiteScript::Setup => "setup",
            SiteScript::Run => "run",
        }
    }

    pub fn template_name(self, machine_name: &str) -> String {
        format!("{}.sh.{}.template", self.stem(), machine_name)
    }
}

/// Process-wide settings, loaded once from the install home.
#[derive(Debug, Clone)]
pub struct Settings {
    pub registry: SiteRegistry,
    pub spec_dir: PathBuf,
    pub install_path: PathBuf,
}

impl Settings {
    pub fn load(home: &Path) -> Result<Self> {
        let install_path = home.canonicalize().map_err(|e| {
            EsmeError::config(format!("install home {} is not usable: {}", home.display(), e))
        })?;
        let registry = SiteRegistry::load(&install_path.join(SETTINGS_FILE), &install_path)?;
        Ok(Self {
            registry,
            spec_dir: install_path.join(SPEC_DIR),
            install_path,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Experiment {
    name: String,
    path: PathBuf,
}

impl Experiment {
    /// An experiment named `name`, rooted at `./name`.
    pub fn new(name: &str) -> Result<Self> {
        Self::at(name, PathBuf::from(name))
    }

    pub fn at(name: &str, path: impl Into<PathBuf>) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(EsmeError::config("experiment name is empty"));
        }
        Ok(Self {
            name: name.to_string(),
            path: path.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn input_manifest(&self) -> PathBuf {
        self.path.join(INPUT_MANIFEST)
    }

    pub fn build_manifest(&self) -> PathBuf {
        self.path.join(BUILD_MANIFEST)
    }

    pub fn site_template(&self, script: SiteScript, machine_name: &str) -> PathBuf {
        self.path
            .join(SITE_TEMPLATE_DIR)
            .join(script.template_name(machine_name))
    }

    fn require_dir(&self) -> Result<()> {
        if self.path.is_dir() {
            Ok(())
        } else {
            Err(EsmeError::config(format!(
                "experiment `{}` does not exist at {}; run create first",
                self.name,
                self.path.display()
            )))
        }
    }
}

#[derive(Debug)]
struct StageLock {
    path: PathBuf,
}

impl Drop for StageLock {
    fn drop(&mut self) {
        let _ = stdfs::remove_file(&self.path);
    }
}

fn acquire_stage_lock(experiment_dir: &Path, stage: Stage) -> Result<StageLock> {
    let lock_path = experiment_dir.join(STATE_DIR).join(LOCK_FILE);
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent)?;
    }
    match stdfs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "pid: {}\nstage: {}\nacquired_at: {}\n",
                std::process::id(),
                stage.as_str(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(StageLock { path: lock_path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let holder = stdfs::read_to_string(&lock_path).unwrap_or_default();
            Err(EsmeError::StageInProgress(format!(
                "cannot start {}: {} exists; remove it if no stage is running\n{}",
                stage.as_str(),
                lock_path.display(),
                holder.trim()
            )))
        }
        Err(e) => Err(EsmeError::io(&lock_path, e)),
    }
}

#[derive(Debug, Clone)]
pub struct CreateReport {
    pub machine_name: String,
    pub config_path: PathBuf,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct SetupReport {
    pub input: PopulateReport,
    /// `None` when the experiment ships no build manifest.
    pub build: Option<PopulateReport>,
    pub installed: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ExperimentSummary {
    pub name: String,
    pub path: PathBuf,
    pub config: Option<ExperimentConfig>,
    pub binding: Option<BindingRecord>,
    pub head: Option<String>,
    /// Config key, script path, and whether it is installed.
    pub scripts: Vec<(&'static str, PathBuf, bool)>,
}

/// Drives an experiment through create, setup, build and run.
pub struct Controller<V: VersionControl, F: Filesystem> {
    settings: Settings,
    vcs: V,
    fs: F,
    today: NaiveDate,
}

impl<V: VersionControl, F: Filesystem> Controller<V, F> {
    pub fn new(settings: Settings, vcs: V, fs: F) -> Self {
        Self {
            settings,
            vcs,
            fs,
            today: Local::now().date_naive(),
        }
    }

    /// Fix the date used for `{{ today }}` and `{{ yesterday }}`.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// Render the experiment's config from `template` and bind it to its code repository.
    ///
    /// The config is rendered and validated in memory and the working copy is checked
    /// for local changes before anything is written; a blocked or invalid create leaves
    /// the directory as it found it (apart from creating it).
    pub fn create(
        &self,
        exp: &Experiment,
        template: &str,
        machine: Option<&str>,
    ) -> Result<CreateReport> {
        ensure_dir(exp.path())?;
        let _lock = acquire_stage_lock(exp.path(), Stage::Create)?;
        tracing::info!(experiment = exp.name(), template, "create");

        let machine_name = match machine {
            Some(m) => m.to_string(),
            None => {
                let guessed = guess_machine(&hostname_candidates());
                tracing::info!(machine = %guessed, "guessed machine");
                guessed
            }
        };
        let site = self.settings.registry.resolve(&machine_name)?;

        let template_config = self.settings.spec_dir.join(template).join(CONFIG_FILE);
        if !template_config.is_file() {
            return Err(EsmeError::config(format!(
                "experiment specification `{}` not found (looked for {})",
                template,
                template_config.display()
            )));
        }
        let template_text = stdfs::read_to_string(&template_config).at(&template_config)?;
        let base_dir = exp.path().canonicalize().at(exp.path())?;
        let vars = Variables::for_config(exp.name(), self.today, &base_dir, site);
        let rendered = ensure_trailing_newline(render(&template_text, &vars)?);

        let config_path = exp.config_path();
        let config = ExperimentConfig::parse(&rendered, &config_path)?;
        config.validate_identity()?;

        let prov = Provenance::open(&self.vcs, exp.path())?;
        if prov.is_dirty()? {
            tracing::warn!(experiment = exp.name(), "experiment has local changes, no action");
            return Ok(CreateReport {
                machine_name,
                config_path,
                outcome: Outcome::Blocked("local changes present".to_string()),
            });
        }
        if let Some(existing) =
            check_identity(&prov, &config.code_repository_url, &config.code_commit_hash)?
        {
            if config_path.exists() {
                tracing::info!(head = %existing.head, "experiment already bound, leaving config untouched");
            } else {
                tracing::warn!(config = %config_path.display(), "experiment already bound but config is missing, restoring it");
                atomic_write_bytes(&config_path, rendered.as_bytes())?;
            }
            return Ok(CreateReport {
                machine_name,
                config_path,
                outcome: Outcome::AlreadyBound(existing),
            });
        }

        atomic_write_bytes(&config_path, rendered.as_bytes())?;
        let record = prov.bind(&config.code_repository_url, &config.code_commit_hash)?;
        tracing::info!(experiment = exp.name(), machine = %machine_name, "created");
        Ok(CreateReport {
            machine_name,
            config_path,
            outcome: Outcome::Bound(record),
        })
    }

    /// Stage inputs and site scripts, then run the experiment's setup script.
    pub fn setup(&self, exp: &Experiment) -> Result<SetupReport> {
        exp.require_dir()?;
        let _lock = acquire_stage_lock(exp.path(), Stage::Setup)?;
        tracing::info!(experiment = exp.name(), "setup");

        let config = ExperimentConfig::load(&exp.config_path())?;
        let site_section = config.site()?;
        let machine_name = site_section.machine_name.as_str();
        let site = self.settings.registry.resolve(machine_name)?;
        let scripts = [
            (SiteScript::Build, config.build_script()?),
            (SiteScript::Setup, config.setup_script()?),
            (SiteScript::Run, config.run_script()?),
        ];

        let missing: Vec<String> = SiteScript::ALL
            .iter()
            .map(|s| exp.site_template(*s, machine_name))
            .filter(|p| !p.is_file())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(EsmeError::config(format!(
                "missing site templates for {}: {}",
                machine_name,
                missing.join(", ")
            )));
        }

        let input = populate(&self.fs, &exp.input_manifest(), &site_section.bucket_url)?;
        let build_manifest = exp.build_manifest();
        let build = if self.fs.entry_exists(&build_manifest) {
            Some(populate(&self.fs, &build_manifest, &site_section.bucket_url)?)
        } else {
            tracing::info!(manifest = %build_manifest.display(), "no build manifest, skipping");
            None
        };

        let base_dir = exp.path().canonicalize().at(exp.path())?;
        let vars = Variables::for_config(exp.name(), self.today, &base_dir, site);
        let load_env_template = exp.site_template(SiteScript::LoadEnv, machine_name);
        let load_env_text =
            stdfs::read_to_string(&load_env_template).at(&load_env_template)?;
        let load_env = exp.path().join(LOAD_ENV_SCRIPT);
        atomic_write_bytes(
            &load_env,
            ensure_trailing_newline(render(&load_env_text, &vars)?).as_bytes(),
        )?;
        make_executable(&load_env)?;

        let mut installed = vec![load_env];
        for (script, rel) in scripts {
            let dest = exp.path().join(rel);
            install_script(&exp.site_template(script, machine_name), &dest)?;
            installed.push(dest);
        }

        run_script(exp.path(), config.setup_script()?)?;
        tracing::info!(experiment = exp.name(), "setup complete");
        Ok(SetupReport {
            input,
            build,
            installed,
        })
    }

    pub fn build(&self, exp: &Experiment) -> Result<()> {
        exp.require_dir()?;
        let _lock = acquire_stage_lock(exp.path(), Stage::Build)?;
        tracing::info!(experiment = exp.name(), "build");
        let config = ExperimentConfig::load(&exp.config_path())?;
        run_script(exp.path(), config.build_script()?)
    }

    /// Hand the experiment to its run script. `step` is accepted but scripts take no arguments.
    pub fn run(&self, exp: &Experiment, step: Option<&str>) -> Result<()> {
        exp.require_dir()?;
        let _lock = acquire_stage_lock(exp.path(), Stage::Run)?;
        tracing::info!(experiment = exp.name(), "run");
        if let Some(step) = step {
            tracing::warn!(step, "run steps are not supported yet; running the whole script");
        }
        let config = ExperimentConfig::load(&exp.config_path())?;
        run_script(exp.path(), config.run_script()?)
    }

    pub fn describe(&self, exp: &Experiment) -> Result<ExperimentSummary> {
        exp.require_dir()?;
        let config_path = exp.config_path();
        let config = if config_path.exists() {
            Some(ExperimentConfig::load(&config_path)?)
        } else {
            None
        };
        let binding = read_binding(exp.path())?;
        let head = if exp.path().join(".git").exists() {
            self.vcs.head(exp.path())?
        } else {
            None
        };

        let mut scripts = Vec::new();
        if let Some(cfg) = &config {
            let entries: [(&'static str, Result<&Path>); 3] = [
                ("build.build_script", cfg.build_script()),
                ("setup.setup_script", cfg.setup_script()),
                ("run.run_script", cfg.run_script()),
            ];
            for (key, rel) in entries {
                if let Ok(rel) = rel {
                    let path = exp.path().join(rel);
                    let installed = path.is_file();
                    scripts.push((key, path, installed));
                }
            }
        }
        Ok(ExperimentSummary {
            name: exp.name().to_string(),
            path: exp.path().to_path_buf(),
            config,
            binding,
            head,
            scripts,
        })
    }
}

/// Stages that exist in the command surface but do nothing yet.
pub fn reserved(command: &str) -> Result<()> {
    tracing::warn!(command, "reserved stage invoked");
    Err(EsmeError::NotImplemented(command.to_string()))
}

fn ensure_trailing_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

fn install_script(template: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    tracing::debug!(from = %template.display(), to = %dest.display(), "installing script");
    stdfs::copy(template, dest).at(dest)?;
    make_executable(dest)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    stdfs::set_permissions(path, stdfs::Permissions::from_mode(0o755)).at(path)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Run `experiment_dir/rel` with no arguments and the experiment as working directory.
fn run_script(experiment_dir: &Path, rel: &Path) -> Result<()> {
    let dir = experiment_dir.canonicalize().at(experiment_dir)?;
    let program = dir.join(rel);
    if !program.is_file() {
        return Err(EsmeError::config(format!(
            "{} is not installed; run setup first",
            program.display()
        )));
    }
    tracing::info!(script = %program.display(), "running");
    let status = Command::new(&program)
        .current_dir(&dir)
        .status()
        .at(&program)?;
    if !status.success() {
        return Err(EsmeError::ExternalScriptFailure {
            script: rel.to_path_buf(),
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}
