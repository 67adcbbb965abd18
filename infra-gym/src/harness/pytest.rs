use anyhow::{Context, Result};
use log::{info, warn};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    junit::{parse_junit_file, parse_pytest_log_file, TestOutcomes},
    models::{Invocation, Outcome},
    services::CommandRunner,
};

pub const CONTAINER_WORKSPACE: &str = "/workspace";
const FORWARDED_ENV: [&str; 3] = ["HF_ENDPOINT", "HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"];
const LOCAL_TIMEOUT_BUFFER: u64 = 60;

/// One pytest phase: what to run, and where the report and log go.
#[derive(Clone, Debug)]
pub struct PytestRun<'a> {
    pub repo: &'a Path,
    pub targets: &'a [String],
    pub junit: &'a Path,
    pub log: &'a Path,
    /// Per-test timeout in seconds, passed to pytest-timeout.
    pub timeout: u64,
}

pub fn pytest_args(python: &str, junit: &str, timeout: u64, targets: &[String]) -> Vec<String> {
    let mut args = vec![
        python.to_owned(),
        "-m".into(),
        "pytest".into(),
        "--tb=short".into(),
        "--no-header".into(),
        "-rN".into(),
        "-v".into(),
        format!("--junit-xml={}", junit),
        format!("--timeout={}", timeout),
    ];
    args.extend(targets.iter().cloned());
    args
}

pub fn run_local(
    runner: &mut dyn CommandRunner,
    run: &PytestRun,
    python: &str,
) -> Result<TestOutcomes> {
    if run.targets.is_empty() {
        warn!("no test targets to run");
        return Ok(TestOutcomes::default());
    }

    let mut python_path = vec![run.repo.to_path_buf()];
    if let Some(existing) = env::var_os("PYTHONPATH").filter(|value| !value.is_empty()) {
        python_path.extend(env::split_paths(&existing));
    }
    let python_path = env::join_paths(python_path).context("invalid PYTHONPATH entry")?;

    let mut argv = pytest_args(
        python,
        &run.junit.to_string_lossy(),
        run.timeout,
        run.targets,
    )
    .into_iter();
    let program = argv.next().unwrap_or_else(|| python.to_owned());
    let limit = run.timeout + LOCAL_TIMEOUT_BUFFER;
    let invocation = Invocation::new(program)
        .args(argv)
        .cwd(run.repo)
        .env("PYTHONPATH", python_path.to_string_lossy())
        .timeout(Duration::from_secs(limit))
        .capture();

    info!("running pytest with {} target(s)", run.targets.len());
    let outcome = runner.run(&invocation)?;
    finish(run, &outcome, limit)
}

pub fn run_docker(
    runner: &mut dyn CommandRunner,
    run: &PytestRun,
    image: &str,
    category: &str,
    setup_timeout: u64,
) -> Result<TestOutcomes> {
    if run.targets.is_empty() {
        warn!("no test targets to run");
        return Ok(TestOutcomes::default());
    }

    let forwarded = FORWARDED_ENV
        .iter()
        .filter_map(|key| {
            env::var(key)
                .ok()
                .filter(|value| !value.is_empty())
                .map(|value| (key.to_string(), value))
        })
        .collect::<Vec<_>>();

    let invocation = docker_invocation(run, image, category, setup_timeout, &forwarded)?;
    let limit = run.timeout + setup_timeout;

    info!(
        "running pytest in docker ({}) with {} target(s)",
        image,
        run.targets.len()
    );
    let outcome = runner.run(&invocation.timeout(Duration::from_secs(limit)))?;

    // The report is written inside the mounted worktree; move it next to the log.
    if let Some(name) = run.junit.file_name() {
        let in_worktree = run.repo.join(name);
        if in_worktree.is_file() && in_worktree != run.junit {
            move_file(&in_worktree, run.junit)?;
        }
    }

    finish(run, &outcome, limit)
}

fn docker_invocation(
    run: &PytestRun,
    image: &str,
    category: &str,
    setup_timeout: u64,
    forwarded: &[(String, String)],
) -> Result<Invocation> {
    let repo = fs::canonicalize(run.repo)
        .with_context(|| format!("failed to resolve worktree {:?}", run.repo))?;
    let container_junit = match run.junit.file_name() {
        Some(name) => Path::new(CONTAINER_WORKSPACE).join(name),
        None => PathBuf::from(CONTAINER_WORKSPACE).join("junit.xml"),
    };

    let pytest = pytest_args(
        "python",
        &container_junit.to_string_lossy(),
        run.timeout,
        run.targets,
    );
    let mut script = docker_setup_commands(category, setup_timeout);
    script.push(shell_words::join(&pytest));

    let mut invocation = Invocation::new("docker")
        .args(vec!["run", "--rm", "-v"])
        .arg(format!("{}:{}", repo.to_string_lossy(), CONTAINER_WORKSPACE))
        .args(vec!["-w", CONTAINER_WORKSPACE, "--memory=16g"]);
    for (key, value) in forwarded {
        invocation = invocation.arg("-e").arg(format!("{}={}", key, value));
    }

    Ok(invocation
        .arg(image)
        .args(vec!["bash", "-c"])
        .arg(script.join("; "))
        .capture())
}

/// Shell steps run in the container before pytest: install the requirements and the
/// package itself, each bounded by `setup_timeout` and allowed to fail.
pub fn docker_setup_commands(category: &str, setup_timeout: u64) -> Vec<String> {
    let t = setup_timeout;
    let package_install = if category.contains("cpu") {
        format!(
            "timeout {t} bash -c 'VLLM_TARGET_DEVICE=empty pip install --no-build-isolation -e \".\"' \
             || timeout {t} bash -c 'pip install --no-build-isolation --no-deps -e \".\"' || true",
            t = t
        )
    } else {
        format!(
            "timeout {t} pip install --no-build-isolation -e \".\" \
             || timeout {t} pip install --no-build-isolation --no-deps -e \".\" || true",
            t = t
        )
    };

    vec![
        r#"export HF_ENDPOINT="${HF_ENDPOINT:-https://hf-mirror.com}""#.to_owned(),
        r#"if [ -n "${HF_TOKEN:-}" ]; then export HF_TOKEN="$HF_TOKEN"; fi"#.to_owned(),
        requirements_loop(
            &["requirements-common.txt", "requirements.txt", "requirements-cpu.txt"],
            t,
        ),
        requirements_loop(&["requirements-test.txt", "requirements-dev.txt"], t),
        package_install,
        format!("export PYTHONPATH={}:${{PYTHONPATH:-}}", CONTAINER_WORKSPACE),
        "[ -d tests/data ] && [ ! -e data ] && ln -s tests/data data || true".to_owned(),
    ]
}

fn requirements_loop(files: &[&str], setup_timeout: u64) -> String {
    format!(
        "for f in {}; do [ -f \"$f\" ] && timeout {} pip install -r \"$f\"; done || true",
        files.join(" "),
        setup_timeout
    )
}

/// Writes the phase log and reads the outcomes back, JUnit first.
fn finish(run: &PytestRun, outcome: &Outcome, limit: u64) -> Result<TestOutcomes> {
    if outcome.timed_out {
        warn!("pytest timed out after {}s", limit);
        fs::write(run.log, format!("TIMEOUT after {}s\n", limit))
            .with_context(|| format!("failed to write {:?}", run.log))?;
        return Ok(TestOutcomes::timed_out());
    }

    fs::write(
        run.log,
        format!("{}\n--- STDERR ---\n{}", outcome.stdout, outcome.stderr),
    )
    .with_context(|| format!("failed to write {:?}", run.log))?;

    let outcomes = parse_junit_file(run.junit);
    if !outcomes.is_empty() {
        return Ok(outcomes);
    }

    info!("JUnit XML empty or missing, falling back to log parsing");
    Ok(parse_pytest_log_file(run.log))
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to).with_context(|| format!("failed to copy {:?} to {:?}", from, to))?;
        fs::remove_file(from)?;
    }
    Ok(())
}
