use anyhow::{Context, Result};
use log::debug;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    console::Console,
    errors::HarnessError,
    models::{EnvSetupRequest, Invocation, Outcome},
    services::CommandRunner,
};

/// Set while installing in skip-build mode so no CUDA extension gets compiled.
const SKIP_BUILD_ENV: (&str, &str) = ("VLLM_TARGET_DEVICE", "empty");

/// Probed in this order, relative to the checkout.
pub const TEST_REQUIREMENTS: [&str; 5] = [
    "requirements-test.txt",
    "requirements-dev.txt",
    "requirements/test.txt",
    "requirements/dev.txt",
    "tests/requirements.txt",
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Checkout,
    ApplyTestPatch,
    ApplySourcePatch,
    Install,
    InstallTestRequirements,
    Report,
    Done,
}

impl Stage {
    fn next(self) -> Stage {
        match self {
            Stage::Checkout => Stage::ApplyTestPatch,
            Stage::ApplyTestPatch => Stage::ApplySourcePatch,
            Stage::ApplySourcePatch => Stage::Install,
            Stage::Install => Stage::InstallTestRequirements,
            Stage::InstallTestRequirements => Stage::Report,
            Stage::Report | Stage::Done => Stage::Done,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PrepareOptions {
    /// The mounted source tree.
    pub workdir: PathBuf,
    /// Import name checked by the report stage.
    pub package: String,
    pub python: String,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        PrepareOptions {
            workdir: PathBuf::from("/workspace"),
            package: "vllm".into(),
            python: "python".into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvReport {
    pub python_version: Option<String>,
    pub commit: Option<String>,
    pub package_version: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PrepareSummary {
    pub completed: Vec<Stage>,
    pub warnings: Vec<String>,
    pub installed_requirements: Vec<String>,
    pub report: EnvReport,
}

/// Brings the mounted checkout to the requested commit, patches it and installs it.
///
/// Stages run strictly in order. Only a patch that fails both `git apply` strategies stops
/// the run, everything else is downgraded to a warning.
pub struct EnvPreparer {
    runner: Box<dyn CommandRunner>,
    console: Console,
    options: PrepareOptions,
    summary: PrepareSummary,
}

impl EnvPreparer {
    pub fn new<R>(runner: R, console: Console, options: PrepareOptions) -> EnvPreparer
    where
        R: 'static + CommandRunner,
    {
        EnvPreparer {
            runner: Box::new(runner),
            console,
            options,
            summary: Default::default(),
        }
    }

    pub fn prepare(mut self, request: &EnvSetupRequest) -> Result<PrepareSummary> {
        if request.commit.trim().is_empty() {
            return Err(HarnessError::MissingCommit.into());
        }

        let mut stage = Stage::Checkout;
        loop {
            debug!("entering stage {:?}", stage);

            match stage {
                Stage::Checkout => self.checkout(request.commit.trim())?,
                Stage::ApplyTestPatch => {
                    self.apply_patch("test patch", request.test_patch.as_deref())?
                }
                Stage::ApplySourcePatch => {
                    self.apply_patch("source patch", request.source_patch.as_deref())?
                }
                Stage::Install => self.install(request)?,
                Stage::InstallTestRequirements => self.install_test_requirements()?,
                Stage::Report => self.report()?,
                Stage::Done => break,
            }

            self.summary.completed.push(stage);
            stage = stage.next();
        }

        if self.summary.warnings.is_empty() {
            self.console.success("Environment ready")?;
        } else {
            self.console.warn(format!(
                "Environment ready with {} warning(s)",
                self.summary.warnings.len()
            ))?;
        }

        Ok(self.summary)
    }

    fn checkout(&mut self, commit: &str) -> Result<()> {
        self.console.info(format!(
            "Checking out {} in {:?}",
            commit, self.options.workdir
        ))?;

        let steps = vec![
            (self.git(&["fetch", "--all"]), "git fetch"),
            (self.git(&["checkout", "-f", commit]), "git checkout"),
            (self.git(&["clean", "-fdx"]), "git clean"),
            (
                self.git(&["submodule", "update", "--init", "--recursive"]),
                "git submodule update",
            ),
        ];
        for (invocation, what) in steps {
            self.best_effort(invocation, what)?;
        }

        Ok(())
    }

    fn apply_patch(&mut self, label: &'static str, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(path) => path,
            None => return Ok(()),
        };

        if !path.exists() {
            return self.warning(format!("{} {:?} does not exist, skipping", label, path));
        }

        let path = fs::canonicalize(path)
            .with_context(|| format!("failed to resolve {} {:?}", label, path))?;
        let patch = path.to_string_lossy().into_owned();
        self.console.info(format!("Applying {} {}", label, patch))?;

        let invocation = self.git(&["apply", "--verbose", &patch]);
        let plain = self.runner.run(&invocation)?;
        if plain.success() {
            return self.console.success(format!("Applied {}", label));
        }

        self.warning(format!(
            "git apply failed for {} ({}), retrying with --3way",
            label,
            describe(&plain)
        ))?;

        let invocation = self.git(&["apply", "--3way", &patch]);
        let three_way = self.runner.run(&invocation)?;
        if three_way.success() {
            return self
                .console
                .success(format!("Applied {} with --3way", label));
        }

        debug!("git apply --3way failed: {}", describe(&three_way));
        Err(HarnessError::PatchFailed { label, path }.into())
    }

    fn install(&mut self, request: &EnvSetupRequest) -> Result<()> {
        let package = self.options.package.clone();
        self.console.info(format!(
            "Installing {} ({} mode{})",
            package,
            if request.editable { "editable" } else { "regular" },
            if request.skip_build {
                ", without native extensions"
            } else {
                ""
            }
        ))?;

        let invocation = self.pip_install(request, false);
        let outcome = self.runner.run(&invocation)?;
        if outcome.success() {
            return self.console.success(format!("Installed {}", package));
        }

        self.warning(format!(
            "installing {} failed ({}), retrying with --no-deps",
            package,
            describe(&outcome)
        ))?;

        let invocation = self.pip_install(request, true);
        let outcome = self.runner.run(&invocation)?;
        if outcome.success() {
            return self
                .console
                .success(format!("Installed {} without dependencies", package));
        }

        self.warning(format!(
            "installing {} failed ({}), continuing",
            package,
            describe(&outcome)
        ))
    }

    fn install_test_requirements(&mut self) -> Result<()> {
        let mut found = false;

        for candidate in TEST_REQUIREMENTS.iter() {
            if !self.options.workdir.join(candidate).is_file() {
                debug!("no {} in checkout", candidate);
                continue;
            }

            found = true;
            self.console
                .info(format!("Installing test requirements from {}", candidate))?;

            let invocation = self.pip(&["install", "-r", candidate]);
            if self.best_effort(invocation, &format!("installing {}", candidate))? {
                self.summary
                    .installed_requirements
                    .push(candidate.to_string());
            }
        }

        if !found {
            self.console.info("No test requirement files found")?;
        }

        Ok(())
    }

    fn report(&mut self) -> Result<()> {
        let python = Invocation::new(self.options.python.as_str())
            .arg("--version")
            .capture();
        let python = self.runner.run(&python)?;
        self.summary.report.python_version = python
            .first_line()
            .filter(|_| python.success())
            .map(str::to_owned);

        let commit = self.git(&["rev-parse", "HEAD"]).capture();
        let commit = self.runner.run(&commit)?;
        self.summary.report.commit = commit
            .first_line()
            .filter(|_| commit.success())
            .map(str::to_owned);

        let package = &self.options.package;
        let import = Invocation::new(self.options.python.as_str())
            .arg("-c")
            .arg(format!(
                "import {0}; print({0}.__version__)",
                package
            ))
            .cwd(&self.options.workdir)
            .capture();
        let import = self.runner.run(&import)?;
        self.summary.report.package_version = import
            .first_line()
            .filter(|_| import.success())
            .map(str::to_owned);

        let report = self.summary.report.clone();
        let unknown = || "unknown".to_owned();
        self.console.info(format!(
            "Python: {}",
            report.python_version.unwrap_or_else(unknown)
        ))?;
        self.console
            .info(format!("Commit: {}", report.commit.unwrap_or_else(unknown)))?;

        match report.package_version {
            Some(version) => self
                .console
                .info(format!("{}: {}", self.options.package, version)),
            None => self.warning(format!(
                "could not import {} ({})",
                self.options.package,
                describe(&import)
            )),
        }
    }

    fn git(&self, args: &[&str]) -> Invocation {
        Invocation::new("git")
            .args(args.iter().copied())
            .cwd(&self.options.workdir)
    }

    fn pip(&self, args: &[&str]) -> Invocation {
        Invocation::new(self.options.python.as_str())
            .args(vec!["-m", "pip"])
            .args(args.iter().copied())
            .cwd(&self.options.workdir)
    }

    fn pip_install(&self, request: &EnvSetupRequest, no_deps: bool) -> Invocation {
        let mut args = vec!["install", "--no-build-isolation"];
        if no_deps {
            args.push("--no-deps");
        }
        if request.editable {
            args.push("-e");
        }
        args.push(".");

        let invocation = self.pip(&args);
        if request.skip_build {
            invocation.env(SKIP_BUILD_ENV.0, SKIP_BUILD_ENV.1)
        } else {
            invocation
        }
    }

    /// Runs an invocation whose failure is only worth a warning.
    fn best_effort(&mut self, invocation: Invocation, what: &str) -> Result<bool> {
        let outcome = self.runner.run(&invocation)?;
        if outcome.success() {
            return Ok(true);
        }

        self.warning(format!("{} failed ({})", what, describe(&outcome)))?;
        Ok(false)
    }

    fn warning(&mut self, message: String) -> Result<()> {
        self.console.warn(&message)?;
        self.summary.warnings.push(message);
        Ok(())
    }
}

fn describe(outcome: &Outcome) -> String {
    let status = match outcome.code {
        _ if outcome.timed_out => "timed out".to_owned(),
        Some(code) => format!("exit status {}", code),
        None => "killed".to_owned(),
    };

    let last_error = outcome
        .stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty());

    match last_error {
        Some(line) => format!("{}: {}", status, line),
        None => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedRunner, SharedBuffer};
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use tempfile::TempDir;

    fn has_args(invocation: &Invocation, args: &[&str]) -> bool {
        args.iter()
            .all(|arg| invocation.args.iter().any(|candidate| candidate == arg))
    }

    fn report_outputs(invocation: &Invocation) -> Outcome {
        if has_args(invocation, &["--version"]) {
            Outcome::ok().with_stdout("Python 3.10.12\n")
        } else if has_args(invocation, &["rev-parse"]) {
            Outcome::ok().with_stdout("0123456789abcdef\n")
        } else if has_args(invocation, &["-c"]) {
            Outcome::ok().with_stdout("0.5.3\n")
        } else {
            Outcome::ok()
        }
    }

    struct Checkout {
        dir: TempDir,
    }

    impl Checkout {
        fn new() -> Checkout {
            Checkout {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn touch(&self, relative: &str) -> PathBuf {
            let path = self.dir.path().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            File::create(&path).unwrap();
            path
        }

        fn options(&self) -> PrepareOptions {
            PrepareOptions {
                workdir: self.dir.path().to_owned(),
                ..Default::default()
            }
        }
    }

    fn request(commit: &str) -> EnvSetupRequest {
        EnvSetupRequest {
            commit: commit.into(),
            ..Default::default()
        }
    }

    #[test]
    fn runs_every_stage_in_order() {
        let checkout = Checkout::new();
        let test_patch = checkout.touch("patches/test.diff");
        checkout.touch("requirements-test.txt");
        checkout.touch("tests/requirements.txt");

        let (runner, log) = ScriptedRunner::new(report_outputs);
        let preparer = EnvPreparer::new(
            runner,
            Console::new(SharedBuffer::default()),
            checkout.options(),
        );

        let request = EnvSetupRequest {
            test_patch: Some(test_patch.clone()),
            editable: true,
            ..request("abc123")
        };
        let summary = preparer.prepare(&request).unwrap();

        let patch = fs::canonicalize(&test_patch)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let argv = log.argv();
        assert_eq!(argv[0], vec!["git", "fetch", "--all"]);
        assert_eq!(argv[1], vec!["git", "checkout", "-f", "abc123"]);
        assert_eq!(argv[2], vec!["git", "clean", "-fdx"]);
        assert_eq!(
            argv[3],
            vec!["git", "submodule", "update", "--init", "--recursive"]
        );
        assert_eq!(argv[4], vec!["git".to_owned(), "apply".into(), "--verbose".into(), patch]);
        assert_eq!(
            argv[5],
            vec!["python", "-m", "pip", "install", "--no-build-isolation", "-e", "."]
        );
        assert_eq!(
            argv[6],
            vec!["python", "-m", "pip", "install", "-r", "requirements-test.txt"]
        );
        assert_eq!(
            argv[7],
            vec!["python", "-m", "pip", "install", "-r", "tests/requirements.txt"]
        );
        assert_eq!(argv.len(), 11);

        assert_eq!(
            summary.completed,
            vec![
                Stage::Checkout,
                Stage::ApplyTestPatch,
                Stage::ApplySourcePatch,
                Stage::Install,
                Stage::InstallTestRequirements,
                Stage::Report,
            ]
        );
        assert!(summary.warnings.is_empty());
        assert_eq!(
            summary.installed_requirements,
            vec!["requirements-test.txt", "tests/requirements.txt"]
        );
        assert_eq!(
            summary.report,
            EnvReport {
                python_version: Some("Python 3.10.12".into()),
                commit: Some("0123456789abcdef".into()),
                package_version: Some("0.5.3".into()),
            }
        );
    }

    #[test]
    fn missing_commit_is_fatal_before_any_command() {
        let checkout = Checkout::new();
        let (runner, log) = ScriptedRunner::succeeding();
        let preparer = EnvPreparer::new(
            runner,
            Console::new(SharedBuffer::default()),
            checkout.options(),
        );

        let err = preparer.prepare(&request("  ")).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::MissingCommit)
        ));
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn a_patch_failing_both_strategies_stops_everything() {
        let checkout = Checkout::new();
        let source_patch = checkout.touch("fix.diff");
        checkout.touch("requirements-test.txt");

        let (runner, log) = ScriptedRunner::new(|invocation| {
            if has_args(invocation, &["apply"]) {
                Outcome::exited(1).with_stderr("error: patch failed: vllm/config.py:12\n")
            } else {
                Outcome::ok()
            }
        });
        let preparer = EnvPreparer::new(
            runner,
            Console::new(SharedBuffer::default()),
            checkout.options(),
        );

        let request = EnvSetupRequest {
            source_patch: Some(source_patch),
            ..request("abc123")
        };
        let err = preparer.prepare(&request).unwrap_err();

        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::PatchFailed { label, .. }) => assert_eq!(*label, "source patch"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(log.len(), 6);
        assert!(log.any("--3way"));
        assert!(!log.any("pip"));
    }

    #[test]
    fn three_way_fallback_recovers() {
        let checkout = Checkout::new();
        let test_patch = checkout.touch("test.diff");

        let (runner, log) = ScriptedRunner::new(|invocation| {
            if has_args(invocation, &["apply", "--verbose"]) {
                Outcome::exited(1)
            } else {
                report_outputs(invocation)
            }
        });
        let preparer = EnvPreparer::new(
            runner,
            Console::new(SharedBuffer::default()),
            checkout.options(),
        );

        let request = EnvSetupRequest {
            test_patch: Some(test_patch),
            ..request("abc123")
        };
        let summary = preparer.prepare(&request).unwrap();

        assert_eq!(summary.completed.last(), Some(&Stage::Report));
        assert_eq!(summary.warnings.len(), 1);
        assert!(log.any("pip install"));
    }

    #[test]
    fn install_failures_with_skip_build_only_warn() {
        let checkout = Checkout::new();
        checkout.touch("requirements-dev.txt");

        let (runner, log) = ScriptedRunner::new(|invocation| {
            if has_args(invocation, &["install", "."]) {
                Outcome::exited(1).with_stderr("error: subprocess-exited-with-error\n")
            } else if has_args(invocation, &["-c"]) {
                Outcome::exited(1).with_stderr("ModuleNotFoundError: No module named 'vllm'\n")
            } else {
                report_outputs(invocation)
            }
        });
        let buffer = SharedBuffer::default();
        let preparer = EnvPreparer::new(runner, Console::new(buffer.clone()), checkout.options());

        let request = EnvSetupRequest {
            skip_build: true,
            ..request("abc123")
        };
        let summary = preparer.prepare(&request).unwrap();

        assert_eq!(summary.completed.last(), Some(&Stage::Report));
        assert_eq!(summary.installed_requirements, vec!["requirements-dev.txt"]);
        assert_eq!(summary.report.package_version, None);
        // Install, --no-deps retry, import check.
        assert_eq!(summary.warnings.len(), 3);
        assert!(summary.warnings[2].contains("No module named 'vllm'"));

        let installs = log
            .invocations()
            .into_iter()
            .filter(|invocation| has_args(invocation, &["install", "."]))
            .collect::<Vec<_>>();
        assert_eq!(installs.len(), 2);
        assert!(installs.iter().all(|invocation| {
            invocation.env.get("VLLM_TARGET_DEVICE").map(String::as_str) == Some("empty")
        }));
        assert!(has_args(&installs[1], &["--no-deps"]));
        assert!(buffer.contents().contains("Environment ready with 3 warning(s)"));
    }

    #[test]
    fn missing_patch_files_are_skipped() {
        let checkout = Checkout::new();
        let (runner, log) = ScriptedRunner::new(report_outputs);
        let preparer = EnvPreparer::new(
            runner,
            Console::new(SharedBuffer::default()),
            checkout.options(),
        );

        let request = EnvSetupRequest {
            test_patch: Some(checkout.dir.path().join("nope.diff")),
            ..request("abc123")
        };
        let summary = preparer.prepare(&request).unwrap();

        assert!(!log.any("apply"));
        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(summary.completed.len(), 6);
    }

    #[test]
    fn failed_checkout_steps_are_warnings() {
        let checkout = Checkout::new();
        let (runner, _log) = ScriptedRunner::new(|invocation| {
            if has_args(invocation, &["fetch"]) || has_args(invocation, &["submodule"]) {
                Outcome::exited(128)
            } else {
                report_outputs(invocation)
            }
        });
        let preparer = EnvPreparer::new(
            runner,
            Console::new(SharedBuffer::default()),
            checkout.options(),
        );

        let summary = preparer.prepare(&request("abc123")).unwrap();

        assert_eq!(summary.warnings.len(), 2);
        assert_eq!(summary.completed.len(), 6);
    }
}
