use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use esme_core::EsmeError;
use esme_provenance::fake::FakeVcs;
use esme_provenance::Outcome;
use esme_runner::{Controller, Experiment, LocalFs, Settings};
use tempfile::TempDir;

const SPEC_CONFIG: &str = "\
code_repository_url: https://example.org/access-om2.git
code_commit_hash: 4f2a9c1
name: {{ name }}
start_date: {{ today }}
restart_date: {{ yesterday }}
base: {{ base_dir }}
site:
  bucket_url: file://{{ bucket_cache_location }}
  machine_name: {{ machine_name }}
build:
  build_script: build.sh
setup:
  setup_script: setup.sh
run:
  run_script: run.sh
";

const INPUT_MANIFEST: &str = "\
format: yamanifest
version: 1.0
---
restart.nc:
  fullpath: \"{{ bucket_url }}/restart.nc\"
forcing.tgz:
  fullpath: \"{{ bucket_url }}/forcing.tgz\"
";

struct Fixture {
    _root: TempDir,
    home: PathBuf,
    cache: PathBuf,
    exp: Experiment,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().expect("tempdir");
    let home = root.path().join("home");
    let cache = root.path().join("cache");
    let spec = home.join("experiment_specifications").join("om2");
    fs::create_dir_all(&spec).expect("spec dir");
    fs::create_dir_all(&cache).expect("cache dir");
    fs::write(
        home.join("settings.yaml"),
        format!(
            "site:\n  - machine_name: Gadi\n    esme_bucket_cache: {}\n",
            cache.display()
        ),
    )
    .expect("settings");
    fs::write(spec.join("config.yaml"), SPEC_CONFIG).expect("spec config");
    let exp = Experiment::at("exp1", root.path().join("exp1")).expect("experiment");
    Fixture {
        _root: root,
        home,
        cache,
        exp,
    }
}

fn controller(fx: &Fixture, vcs: FakeVcs) -> Controller<FakeVcs, LocalFs> {
    let settings = Settings::load(&fx.home).expect("settings");
    let today = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
    Controller::new(settings, vcs, LocalFs).with_today(today)
}

#[cfg(unix)]
fn write_tgz(path: &Path, name: &str, contents: &[u8]) {
    let file = fs::File::create(path).expect("create tgz");
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, name, contents)
        .expect("append");
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
}

/// Lay down what the experiment's code repository would have checked out.
#[cfg(unix)]
fn stage_checkout(fx: &Fixture, run_body: &str) {
    let dir = fx.exp.path();
    fs::create_dir_all(dir.join("input")).expect("input dir");
    fs::create_dir_all(dir.join("templates/site")).expect("templates dir");
    fs::write(dir.join("input/input_manifest.yaml"), INPUT_MANIFEST).expect("manifest");
    let site = dir.join("templates/site");
    fs::write(
        site.join("load_env.sh.Gadi.template"),
        "export EXP={{ name }}\nexport EXP_DIR={{ base_dir }}\n",
    )
    .expect("load_env");
    fs::write(site.join("build.sh.Gadi.template"), "#!/bin/sh\npwd > build_cwd\n").expect("build");
    fs::write(
        site.join("setup.sh.Gadi.template"),
        "#!/bin/sh\necho ok > setup_ran\n",
    )
    .expect("setup");
    fs::write(site.join("run.sh.Gadi.template"), format!("#!/bin/sh\n{}\n", run_body))
        .expect("run");

    fs::write(fx.cache.join("restart.nc"), b"restart").expect("restart");
    write_tgz(&fx.cache.join("forcing.tgz"), "INPUT/forcing.nc", b"forcing");
}

#[test]
fn create_renders_config_and_binds() {
    let fx = fixture();
    let ctl = controller(&fx, FakeVcs::new());
    let report = ctl.create(&fx.exp, "om2", Some("Gadi")).expect("create");

    assert_eq!(report.machine_name, "Gadi");
    let record = match &report.outcome {
        Outcome::Bound(r) => r,
        other => panic!("expected Bound, got {:?}", other),
    };
    assert_eq!(record.code_commit_hash, "4f2a9c1");

    let config = fs::read_to_string(fx.exp.config_path()).expect("config");
    assert!(config.contains("name: exp1\n"), "{}", config);
    assert!(config.contains("start_date: 2024-03-01\n"), "{}", config);
    assert!(config.contains("restart_date: 2024-02-29\n"), "{}", config);
    assert!(
        config.contains(&format!("bucket_url: file://{}\n", fx.cache.display())),
        "{}",
        config
    );
    let base = fx.exp.path().canonicalize().expect("canonical");
    assert!(config.contains(&format!("base: {}\n", base.display())), "{}", config);

    let calls = ctl.vcs().calls();
    assert!(calls.contains(&"ensure_remote origin https://example.org/access-om2.git".to_string()));
    assert!(calls.contains(&"pin 4f2a9c1".to_string()));
    assert_eq!(calls.last().map(String::as_str), Some("update_submodules"));
}

#[test]
fn create_with_local_changes_is_blocked_and_writes_nothing() {
    let fx = fixture();
    let ctl = controller(&fx, FakeVcs::new().dirty());
    let report = ctl.create(&fx.exp, "om2", Some("Gadi")).expect("create");

    assert!(report.outcome.is_blocked());
    assert!(!fx.exp.config_path().exists());
    assert_eq!(ctl.vcs().calls(), vec!["init", "is_dirty"]);
    assert_eq!(ctl.vcs().state().head, None);

    let err = report.outcome.into_result().expect_err("blocked");
    assert_eq!(err.code(), "provenance_blocked");
}

#[test]
fn repeated_create_is_already_bound() {
    let fx = fixture();
    controller(&fx, FakeVcs::new())
        .create(&fx.exp, "om2", Some("Gadi"))
        .expect("first");
    let before = fs::read_to_string(fx.exp.config_path()).expect("config");

    let ctl = controller(&fx, FakeVcs::new()).with_today(NaiveDate::from_ymd_opt(2024, 4, 2).expect("date"));
    let report = ctl.create(&fx.exp, "om2", Some("Gadi")).expect("second");
    assert!(matches!(report.outcome, Outcome::AlreadyBound(_)));
    assert_eq!(ctl.vcs().calls(), vec!["init", "is_dirty"]);
    assert_eq!(fs::read_to_string(fx.exp.config_path()).expect("config"), before);
}

#[test]
fn repeated_create_restores_missing_config() {
    let fx = fixture();
    controller(&fx, FakeVcs::new())
        .create(&fx.exp, "om2", Some("Gadi"))
        .expect("first");
    fs::remove_file(fx.exp.config_path()).expect("remove config");

    let ctl = controller(&fx, FakeVcs::new());
    let report = ctl.create(&fx.exp, "om2", Some("Gadi")).expect("second");
    assert!(matches!(report.outcome, Outcome::AlreadyBound(_)));
    assert_eq!(ctl.vcs().calls(), vec!["init", "is_dirty"]);
    let config = fs::read_to_string(fx.exp.config_path()).expect("config restored");
    assert!(config.contains("code_commit_hash: 4f2a9c1\n"), "{}", config);
    assert!(config.contains("name: exp1\n"), "{}", config);
}

#[test]
fn create_for_unknown_machine_fails_before_writing() {
    let fx = fixture();
    let ctl = controller(&fx, FakeVcs::new());
    let err = ctl
        .create(&fx.exp, "om2", Some("Setonix"))
        .expect_err("unknown machine");
    assert_eq!(err.code(), "configuration_error");
    assert!(!fx.exp.config_path().exists());
    assert!(ctl.vcs().calls().is_empty());
}

#[test]
fn create_with_unrecognized_template_variable_fails() {
    let fx = fixture();
    let spec = fx.home.join("experiment_specifications/bad");
    fs::create_dir_all(&spec).expect("spec");
    fs::write(
        spec.join("config.yaml"),
        "code_repository_url: u\ncode_commit_hash: h\nowner: {{ user }}\n",
    )
    .expect("write");
    let ctl = controller(&fx, FakeVcs::new());
    let err = ctl.create(&fx.exp, "bad", Some("Gadi")).expect_err("bad var");
    assert_eq!(err.code(), "configuration_error");
    assert!(err.to_string().contains("`user`"), "{}", err);
    assert!(!fx.exp.config_path().exists());
}

#[test]
fn create_with_missing_specification_fails() {
    let fx = fixture();
    let err = controller(&fx, FakeVcs::new())
        .create(&fx.exp, "nope", Some("Gadi"))
        .expect_err("missing spec");
    assert!(err.to_string().contains("`nope`"), "{}", err);
}

#[test]
fn failed_bind_is_a_provenance_failure() {
    let fx = fixture();
    let ctl = controller(&fx, FakeVcs::new().failing_on("fetch"));
    let err = ctl.create(&fx.exp, "om2", Some("Gadi")).expect_err("fetch");
    assert_eq!(err.code(), "provenance_failure");
    assert!(esme_provenance::read_binding(fx.exp.path()).expect("read").is_none());
}

#[test]
fn setup_requires_a_created_experiment() {
    let fx = fixture();
    let ctl = controller(&fx, FakeVcs::new());
    let err = ctl.setup(&fx.exp).expect_err("no experiment");
    assert!(err.to_string().contains("run create first"), "{}", err);
    fs::create_dir_all(fx.exp.path()).expect("mkdir");
    let err = ctl.setup(&fx.exp).expect_err("no config");
    assert_eq!(err.code(), "configuration_error");
}

#[cfg(unix)]
#[test]
fn setup_stages_inputs_and_scripts_and_is_rerunnable() {
    use std::os::unix::fs::PermissionsExt;

    let fx = fixture();
    let ctl = controller(&fx, FakeVcs::new());
    ctl.create(&fx.exp, "om2", Some("Gadi")).expect("create");
    stage_checkout(&fx, "exit 0");

    let report = ctl.setup(&fx.exp).expect("setup");
    let dir = fx.exp.path();
    assert_eq!(report.input.linked, 1);
    assert_eq!(report.input.extracted, 1);
    assert!(report.build.is_none());

    assert_eq!(
        fs::read_link(dir.join("input/restart.nc")).expect("link"),
        fx.cache.join("restart.nc")
    );
    assert_eq!(
        fs::read(dir.join("INPUT/forcing.nc")).expect("extracted"),
        b"forcing"
    );
    let manifest = fs::read_to_string(dir.join("input/input_manifest.yaml")).expect("manifest");
    assert!(!manifest.contains("{{"), "{}", manifest);

    let load_env = fs::read_to_string(dir.join("load_env.sh")).expect("load_env");
    let base = dir.canonicalize().expect("canonical");
    assert_eq!(
        load_env,
        format!("export EXP=exp1\nexport EXP_DIR={}\n", base.display())
    );
    for script in ["build.sh", "setup.sh", "run.sh"] {
        let mode = fs::metadata(dir.join(script))
            .expect("installed")
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111, "{} should be executable", script);
    }
    assert_eq!(
        fs::read_to_string(dir.join("setup_ran")).expect("setup ran"),
        "ok\n"
    );

    let again = ctl.setup(&fx.exp).expect("second setup");
    assert_eq!(again.input.linked, 0);
    assert_eq!(again.input.already_linked, 1);
    assert_eq!(again.input.extracted, 1);
    assert_eq!(
        fs::read_link(dir.join("input/restart.nc")).expect("link"),
        fx.cache.join("restart.nc")
    );
}

#[cfg(unix)]
#[test]
fn setup_with_missing_site_template_touches_nothing() {
    let fx = fixture();
    let ctl = controller(&fx, FakeVcs::new());
    ctl.create(&fx.exp, "om2", Some("Gadi")).expect("create");
    stage_checkout(&fx, "exit 0");
    fs::remove_file(fx.exp.path().join("templates/site/run.sh.Gadi.template")).expect("rm");

    let err = ctl.setup(&fx.exp).expect_err("missing template");
    assert_eq!(err.code(), "configuration_error");
    assert!(err.to_string().contains("run.sh.Gadi.template"), "{}", err);
    let manifest =
        fs::read_to_string(fx.exp.path().join("input/input_manifest.yaml")).expect("manifest");
    assert_eq!(manifest, INPUT_MANIFEST);
    assert!(!fx.exp.path().join("input/restart.nc").exists());
    assert!(!fx.exp.path().join("build.sh").exists());
}

#[cfg(unix)]
#[test]
fn build_and_run_execute_in_experiment_directory() {
    let fx = fixture();
    let ctl = controller(&fx, FakeVcs::new());
    ctl.create(&fx.exp, "om2", Some("Gadi")).expect("create");
    stage_checkout(&fx, "exit 3");
    ctl.setup(&fx.exp).expect("setup");

    let cwd_before = std::env::current_dir().expect("cwd");
    ctl.build(&fx.exp).expect("build");
    let built_in = fs::read_to_string(fx.exp.path().join("build_cwd")).expect("build_cwd");
    assert_eq!(
        PathBuf::from(built_in.trim()),
        fx.exp.path().canonicalize().expect("canonical")
    );

    match ctl.run(&fx.exp, Some("spinup")) {
        Err(EsmeError::ExternalScriptFailure { script, status }) => {
            assert_eq!(script, PathBuf::from("run.sh"));
            assert_eq!(status, 3);
        }
        other => panic!("expected script failure, got {:?}", other),
    }
    assert_eq!(std::env::current_dir().expect("cwd"), cwd_before);
}

#[test]
fn stages_refuse_to_start_while_locked() {
    let fx = fixture();
    let ctl = controller(&fx, FakeVcs::new());
    ctl.create(&fx.exp, "om2", Some("Gadi")).expect("create");
    let lock = fx.exp.path().join(".esme/stage.lock");
    fs::write(&lock, "pid: 1\nstage: setup\n").expect("lock");

    let err = ctl.build(&fx.exp).expect_err("locked");
    assert_eq!(err.code(), "stage_in_progress");
    fs::remove_file(&lock).expect("unlock");
    let err = ctl.build(&fx.exp).expect_err("not set up");
    assert!(err.to_string().contains("run setup first"), "{}", err);
}

#[cfg(unix)]
#[test]
fn describe_reports_config_binding_and_scripts() {
    let fx = fixture();
    let ctl = controller(&fx, FakeVcs::new());
    ctl.create(&fx.exp, "om2", Some("Gadi")).expect("create");

    let summary = ctl.describe(&fx.exp).expect("describe");
    assert_eq!(summary.name, "exp1");
    assert_eq!(
        summary.binding.as_ref().map(|b| b.code_commit_hash.as_str()),
        Some("4f2a9c1")
    );
    assert!(summary.scripts.iter().all(|(_, _, installed)| !installed));

    stage_checkout(&fx, "exit 0");
    ctl.setup(&fx.exp).expect("setup");
    let summary = ctl.describe(&fx.exp).expect("describe");
    assert_eq!(summary.scripts.len(), 3);
    assert!(summary.scripts.iter().all(|(_, _, installed)| *installed));
    assert_eq!(
        summary.config.and_then(|c| c.site).map(|s| s.machine_name),
        Some("Gadi".to_string())
    );
}
