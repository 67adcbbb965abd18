//! The two-phase FAIL_TO_PASS / PASS_TO_PASS harness.
//!
//! Each instance is checked out into its own worktree of a shared bare clone. Tests run
//! once with only the test patch applied and once more with the fix on top. Comparing
//! the two runs yields the test sets recorded in the result file.

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap as Map,
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    console::Console,
    errors::HarnessError,
    junit::TestOutcomes,
    services::CommandRunner,
    versions::VersionMapping,
};

mod classify;
mod dataset;
mod git;
mod pytest;

pub use classify::{classify, Classification};
pub use dataset::{filter_instances, load_dataset, Instance};

pub const DEFAULT_REPO_URL: &str = "https://github.com/vllm-project/vllm.git";
const PHASE1: &str = "phase1";
const PHASE2: &str = "phase2";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
    Partial,
    Timeout,
    #[serde(other)]
    Unknown,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Error => "error",
            Status::Partial => "partial",
            Status::Timeout => "timeout",
            Status::Unknown => "unknown",
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Unknown
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unix timestamps in seconds; zero when a step never started.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub phase1_start: f64,
    #[serde(default)]
    pub phase1_end: f64,
    #[serde(default)]
    pub phase2_start: f64,
    #[serde(default)]
    pub phase2_end: f64,
    #[serde(default)]
    pub end: f64,
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceResult {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub base_commit: String,
    #[serde(default)]
    pub phase1: TestOutcomes,
    #[serde(default)]
    pub phase2: TestOutcomes,
    #[serde(rename = "FAIL_TO_PASS", default)]
    pub fail_to_pass: Vec<String>,
    #[serde(rename = "PASS_TO_PASS", default)]
    pub pass_to_pass: Vec<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub timestamps: Timestamps,
    #[serde(default)]
    pub regressions: Vec<String>,
    #[serde(default)]
    pub both_failed: Vec<String>,
}

impl InstanceResult {
    fn started(instance: &Instance) -> InstanceResult {
        InstanceResult {
            instance_id: instance.instance_id.clone(),
            version: instance.version.clone(),
            base_commit: instance.base_commit.clone(),
            status: Status::Error,
            timestamps: Timestamps {
                start: now(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn failed(instance: &Instance, status: Status, message: String) -> InstanceResult {
        InstanceResult {
            instance_id: instance.instance_id.clone(),
            version: instance.version.clone(),
            base_commit: instance.base_commit.clone(),
            status,
            error_message: message,
            ..Default::default()
        }
    }

    fn abort(mut self, status: Status, message: String) -> InstanceResult {
        error!("{}: {}", self.instance_id, message);
        self.status = status;
        self.error_message = message;
        self.timestamps.end = now();
        self
    }
}

#[derive(Clone, Debug)]
pub struct HarnessOptions {
    pub workdir: PathBuf,
    pub output_dir: PathBuf,
    /// Per-test timeout in seconds.
    pub timeout: u64,
    pub setup_timeout: u64,
    pub docker: bool,
    pub image_prefix: String,
    pub keep_worktrees: bool,
    pub repo_url: String,
    pub python: String,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        HarnessOptions {
            workdir: PathBuf::from("/tmp/infra-gym-workdir"),
            output_dir: PathBuf::from("results"),
            timeout: 120,
            setup_timeout: 300,
            docker: false,
            image_prefix: "infra-gym".into(),
            keep_worktrees: false,
            repo_url: DEFAULT_REPO_URL.into(),
            python: "python".into(),
        }
    }
}

pub struct Harness {
    runner: Box<dyn CommandRunner>,
    console: Console,
    options: HarnessOptions,
    mapping: VersionMapping,
}

impl Harness {
    pub fn new<R>(
        runner: R,
        console: Console,
        options: HarnessOptions,
        mapping: VersionMapping,
    ) -> Harness
    where
        R: 'static + CommandRunner,
    {
        Harness {
            runner: Box::new(runner),
            console,
            options,
            mapping,
        }
    }

    /// Processes every instance in order and saves each result as soon as it is known.
    pub fn run_all(&mut self, instances: &[Instance]) -> Result<Vec<InstanceResult>> {
        fs::create_dir_all(&self.options.output_dir)
            .with_context(|| format!("failed to create {:?}", self.options.output_dir))?;

        let mut results = Vec::with_capacity(instances.len());
        for (index, instance) in instances.iter().enumerate() {
            self.console.info(format!(
                "[{}/{}] {} (version {})",
                index + 1,
                instances.len(),
                instance.instance_id,
                instance.version
            ))?;

            let result = match self.process_instance(instance) {
                Ok(result) => result,
                Err(err) if is_timeout(&err) => InstanceResult::failed(
                    instance,
                    Status::Timeout,
                    "Overall instance processing timed out".into(),
                ),
                Err(err) => {
                    error!("unexpected error processing {}: {:#}", instance.instance_id, err);
                    InstanceResult::failed(instance, Status::Error, format!("{:#}", err))
                }
            };

            let path = self.save_result(&result)?;
            match result.status {
                Status::Success => self.console.success(format!(
                    "{}: {} FAIL_TO_PASS, {} PASS_TO_PASS",
                    result.instance_id,
                    result.fail_to_pass.len(),
                    result.pass_to_pass.len()
                ))?,
                status => self.console.warn(format!(
                    "{}: {} ({}), saved to {:?}",
                    result.instance_id, status, result.error_message, path
                ))?,
            }
            results.push(result);
        }

        Ok(results)
    }

    pub fn process_instance(&mut self, instance: &Instance) -> Result<InstanceResult> {
        let mut result = InstanceResult::started(instance);
        let worktree = self
            .options
            .workdir
            .join(&instance.instance_id)
            .join("repo");
        let output = self.options.output_dir.join(&instance.instance_id);
        fs::create_dir_all(&output).with_context(|| format!("failed to create {:?}", output))?;

        let bare = match git::ensure_bare_clone(
            &mut *self.runner,
            &self.options.workdir,
            &self.options.repo_url,
        ) {
            Ok(bare) => bare,
            Err(err) if is_timeout(&err) => return Err(err),
            Err(err) => {
                let message = format!("failed to create or update bare clone: {:#}", err);
                return Ok(result.abort(Status::Error, message));
            }
        };

        match git::setup_worktree(&mut *self.runner, &bare, &worktree, &instance.base_commit) {
            Ok(()) => {}
            Err(err) if is_timeout(&err) => return Err(err),
            Err(err) => {
                let message = format!("failed to set up worktree: {:#}", err);
                return Ok(result.abort(Status::Error, message));
            }
        }

        if !git::apply_patch(&mut *self.runner, &worktree, instance.test_patch(), "test_patch")? {
            self.cleanup(&bare, &worktree)?;
            return Ok(result.abort(Status::Error, "failed to apply test_patch".into()));
        }

        let targets = instance.test_targets();
        if targets.is_empty() {
            self.cleanup(&bare, &worktree)?;
            return Ok(result.abort(
                Status::Error,
                "no test targets found for this instance".into(),
            ));
        }
        info!(
            "{} test target(s): {:?}",
            targets.len(),
            &targets[..targets.len().min(5)]
        );

        result.timestamps.phase1_start = now();
        result.phase1 = self.run_phase(instance, &worktree, &targets, &output, PHASE1)?;
        result.timestamps.phase1_end = now();

        if !git::apply_patch(
            &mut *self.runner,
            &worktree,
            instance.source_patch(),
            "source_patch",
        )? {
            self.cleanup(&bare, &worktree)?;
            return Ok(result.abort(Status::Partial, "failed to apply source patch".into()));
        }

        result.timestamps.phase2_start = now();
        result.phase2 = self.run_phase(instance, &worktree, &targets, &output, PHASE2)?;
        result.timestamps.phase2_end = now();

        let Classification {
            fail_to_pass,
            pass_to_pass,
            regressions,
            both_failed,
        } = classify(&result.phase1, &result.phase2);

        if !both_failed.is_empty() {
            warn!(
                "{} test(s) failed in both phases: {:?}",
                both_failed.len(),
                &both_failed[..both_failed.len().min(5)]
            );
        }
        if !regressions.is_empty() {
            warn!(
                "{} regression(s) (passed, then failed): {:?}",
                regressions.len(),
                &regressions[..regressions.len().min(5)]
            );
        }

        result.fail_to_pass = fail_to_pass;
        result.pass_to_pass = pass_to_pass;
        result.regressions = regressions;
        result.both_failed = both_failed;
        result.status = Status::Success;
        result.timestamps.end = now();

        self.cleanup(&bare, &worktree)?;
        Ok(result)
    }

    fn run_phase(
        &mut self,
        instance: &Instance,
        worktree: &Path,
        targets: &[String],
        output: &Path,
        phase: &str,
    ) -> Result<TestOutcomes> {
        let junit = output.join(format!("{}.xml", phase));
        let log = output.join(format!("{}.log", phase));
        let run = pytest::PytestRun {
            repo: worktree,
            targets,
            junit: &junit,
            log: &log,
            timeout: self.options.timeout,
        };

        let outcomes = if self.options.docker {
            let image = self
                .mapping
                .image_for(&self.options.image_prefix, &instance.version);
            pytest::run_docker(
                &mut *self.runner,
                &run,
                &image,
                instance.category(),
                self.options.setup_timeout,
            )?
        } else {
            pytest::run_local(&mut *self.runner, &run, &self.options.python)?
        };

        info!(
            "{}: {} passed, {} failed, {} errors, {} skipped",
            phase,
            outcomes.passed.len(),
            outcomes.failed.len(),
            outcomes.errors.len(),
            outcomes.skipped.len()
        );

        Ok(outcomes)
    }

    fn cleanup(&mut self, bare: &Path, worktree: &Path) -> Result<()> {
        if self.options.keep_worktrees {
            info!("keeping worktree at {:?}", worktree);
            return Ok(());
        }

        git::cleanup_worktree(&mut *self.runner, bare, worktree)
    }

    /// Writes `<output>/<id>/result.json` and the flat copy `<output>/<id>.json`.
    pub fn save_result(&self, result: &InstanceResult) -> Result<PathBuf> {
        let nested_dir = self.options.output_dir.join(&result.instance_id);
        fs::create_dir_all(&nested_dir)
            .with_context(|| format!("failed to create {:?}", nested_dir))?;
        let json = serde_json::to_string_pretty(result)?;

        let nested = nested_dir.join("result.json");
        fs::write(&nested, &json).with_context(|| format!("failed to write {:?}", nested))?;
        info!("saved result to {:?}", nested);

        let flat = self
            .options
            .output_dir
            .join(format!("{}.json", result.instance_id));
        fs::write(&flat, &json).with_context(|| format!("failed to write {:?}", flat))?;

        Ok(flat)
    }

    pub fn print_summary(&mut self, results: &[InstanceResult]) -> Result<()> {
        write_summary(self.console.writer(), results)
    }
}

fn is_timeout(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<HarnessError>() {
        Some(HarnessError::CommandTimedOut { .. }) => true,
        _ => false,
    }
}

pub fn write_summary(out: &mut dyn Write, results: &[InstanceResult]) -> Result<()> {
    let rule = "=".repeat(88);
    let thin = "-".repeat(88);

    writeln!(out, "\n{}\nSUMMARY\n{}", rule, rule)?;
    writeln!(out, "{:<50} {:>6} {:>6} {:>8}", "Instance", "F2P", "P2P", "Status")?;
    writeln!(out, "{}", thin)?;

    let mut sorted = results.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    let mut statuses = Map::new();
    let (mut total_f2p, mut total_p2p) = (0, 0);
    for result in sorted {
        let id = result.instance_id.chars().take(50).collect::<String>();
        writeln!(
            out,
            "{:<50} {:>6} {:>6} {:>8}",
            id,
            result.fail_to_pass.len(),
            result.pass_to_pass.len(),
            result.status.as_str()
        )?;
        total_f2p += result.fail_to_pass.len();
        total_p2p += result.pass_to_pass.len();
        *statuses.entry(result.status.as_str()).or_insert(0) += 1;
    }

    writeln!(out, "{}", thin)?;
    writeln!(out, "{:<50} {:>6} {:>6}", "TOTAL", total_f2p, total_p2p)?;
    let breakdown = statuses
        .iter()
        .map(|(status, count)| format!("{}={}", status, count))
        .collect::<Vec<_>>()
        .join(", ");
    writeln!(out, "\nStatus breakdown: {}\n{}", breakdown, rule)?;

    Ok(())
}
