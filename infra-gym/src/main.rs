use anyhow::Result;
use log::{debug, info, warn, LevelFilter};
use std::{env, io, path::PathBuf, process};
use structopt::StructOpt;

use backends::{DryRunRunner, SystemRunner};
use builder::{BuildOptions, ImageBuilder};
use collect::CollectOptions;
use console::Console;
use errors::HarnessError;
use harness::{Harness, HarnessOptions, Status};
use models::EnvSetupRequest;
use prepare::{EnvPreparer, PrepareOptions};
use resolver::BuildTarget;
use versions::{VersionMapping, VersionTable};

mod backends;
mod builder;
mod collect;
mod console;
mod errors;
mod harness;
mod junit;
mod models;
mod prepare;
mod resolver;
mod services;
#[cfg(test)]
mod testing;
mod versions;

const DEFAULT_TAG_PREFIX: &str = "infra-gym";

#[derive(Debug, StructOpt)]
#[structopt(
    name = "infra-gym",
    about = "Builds the infra-gym Docker images and prepares vLLM checkouts for evaluation."
)]
struct Args {
    #[structopt(short, long, global = true)]
    /// Enable debug logging.
    verbose: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Builds base images and version-group images.
    Build {
        /// Any of `all`, `base` or a version group such as `v0.5`. Defaults to `all`.
        targets: Vec<BuildTarget>,

        #[structopt(long)]
        /// Build without the docker layer cache.
        no_cache: bool,

        #[structopt(long)]
        /// Print the docker commands instead of running them.
        dry_run: bool,

        #[structopt(long)]
        /// Push every built image to the registry.
        push: bool,

        #[structopt(long, env = "DOCKER_REGISTRY")]
        registry: Option<String>,

        #[structopt(long, env = "DOCKER_TAG_PREFIX", default_value = "infra-gym")]
        tag_prefix: String,

        #[structopt(long, env = "BUILD_JOBS")]
        /// Accepted for compatibility, images are built one at a time.
        jobs: Option<String>,

        #[structopt(long, default_value = ".", parse(from_os_str))]
        /// Directory holding the `docker/` Dockerfiles.
        context: PathBuf,
    },
    /// Checks out a commit in the mounted source tree, patches it and installs it.
    PrepareEnv {
        #[structopt(long)]
        commit: Option<String>,

        #[structopt(long, parse(from_os_str))]
        test_patch: Option<PathBuf>,

        #[structopt(long, parse(from_os_str))]
        source_patch: Option<PathBuf>,

        #[structopt(long)]
        /// Install without compiling the CUDA extensions.
        skip_build: bool,

        #[structopt(long)]
        /// Install in editable (development) mode.
        editable: bool,

        #[structopt(long, default_value = "/workspace", parse(from_os_str))]
        workdir: PathBuf,

        #[structopt(long, default_value = "vllm")]
        /// Import name reported after installation.
        package: String,

        #[structopt(long, default_value = "python")]
        python: String,
    },
    /// Runs each instance's tests before and after its fix and records the transitions.
    Run {
        #[structopt(long, default_value = "all")]
        /// `all`, one instance id, or a comma separated list of ids.
        instance_id: String,

        #[structopt(long)]
        /// Comma separated subset of gpu_distributed, gpu_model, api_server, unit_cpu.
        category: Option<String>,

        #[structopt(long, default_value = "vllm_infra_gym.json", parse(from_os_str))]
        dataset: PathBuf,

        #[structopt(long, default_value = "/tmp/infra-gym-workdir", parse(from_os_str))]
        workdir: PathBuf,

        #[structopt(long, default_value = "results", parse(from_os_str))]
        output_dir: PathBuf,

        #[structopt(long, default_value = "120")]
        /// Per-test timeout in seconds.
        timeout: u64,

        #[structopt(long, default_value = "300")]
        /// Timeout for the in-container install steps, also added to the container timeout.
        setup_timeout: u64,

        #[structopt(long)]
        /// Run pytest inside the version group's image.
        docker: bool,

        #[structopt(long, env = "DOCKER_TAG_PREFIX", default_value = "infra-gym")]
        image_prefix: String,

        #[structopt(long)]
        keep_worktrees: bool,

        #[structopt(long, parse(from_os_str))]
        /// JSON file with a `version_to_group` map.
        version_specs: Option<PathBuf>,

        #[structopt(long, default_value = "https://github.com/vllm-project/vllm.git")]
        repo_url: String,

        #[structopt(long, default_value = "python")]
        python: String,
    },
    /// Summarises result files and merges them into the dataset.
    Collect {
        #[structopt(long, default_value = "results", parse(from_os_str))]
        results_dir: PathBuf,

        #[structopt(long, default_value = "vllm_infra_gym.json", parse(from_os_str))]
        dataset: PathBuf,

        #[structopt(long, parse(from_os_str))]
        /// Where to write the merged dataset, defaults to the dataset itself.
        output: Option<PathBuf>,

        #[structopt(long)]
        summary_only: bool,

        #[structopt(long)]
        /// Store the test sets as plain arrays instead of JSON-encoded strings.
        no_swebench_format: bool,
    },
}

fn init_logging(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });

    if let Ok(filters) = env::var("LOG") {
        builder.parse_filters(&filters);
    }

    builder.init();
}

/// Empty, as an exported but unset `DOCKER_TAG_PREFIX` would be, means the default.
fn tag_prefix_or_default(prefix: String) -> String {
    if prefix.trim().is_empty() {
        DEFAULT_TAG_PREFIX.into()
    } else {
        prefix
    }
}

fn build_jobs(raw: Option<&str>) -> usize {
    match raw.map(str::trim) {
        None | Some("") => 1,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring BUILD_JOBS={:?}, not a number", raw);
            1
        }),
    }
}

fn build_targets(targets: Vec<BuildTarget>) -> Vec<BuildTarget> {
    if targets.is_empty() {
        vec![BuildTarget::All]
    } else {
        targets
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<HarnessError>()
        .map_or(1, HarnessError::exit_code)
}

fn main() {
    let args = Args::from_args();
    init_logging(args.verbose);

    if let Err(err) = run(args.command) {
        let code = exit_code(&err);

        if Console::new(io::stderr()).error(format!("{:#}", err)).is_err() {
            eprintln!("{:#}", err);
        }
        process::exit(code);
    }
}

fn run(command: Command) -> Result<()> {
    let mut console = Console::stdout();

    match command {
        Command::Build {
            targets,
            no_cache,
            dry_run,
            push,
            registry,
            tag_prefix,
            jobs,
            context,
        } => {
            let targets = build_targets(targets);
            let jobs = build_jobs(jobs.as_deref());
            if jobs > 1 {
                info!("BUILD_JOBS={} accepted, images still build one at a time", jobs);
            }

            let plan = resolver::resolve(&VersionTable::builtin()?, &targets);
            if plan.is_empty() {
                console.warn("Nothing to build, no target matched a known version group")?;
                return Ok(());
            }

            let options = BuildOptions {
                tag_prefix: tag_prefix_or_default(tag_prefix),
                registry,
                no_cache,
                push,
                context,
            };
            let built = if dry_run {
                let runner = DryRunRunner::new(Console::stdout());
                ImageBuilder::new(runner, Console::stdout(), options).build_plan(&plan)?
            } else {
                ImageBuilder::new(SystemRunner, Console::stdout(), options).build_plan(&plan)?
            };

            console.success(format!("{} image(s) done", built.len()))?;
        }
        Command::PrepareEnv {
            commit,
            test_patch,
            source_patch,
            skip_build,
            editable,
            workdir,
            package,
            python,
        } => {
            let request = EnvSetupRequest {
                commit: commit.ok_or(HarnessError::MissingCommit)?,
                test_patch,
                source_patch,
                skip_build,
                editable,
            };
            let options = PrepareOptions {
                workdir,
                package,
                python,
            };

            let summary = EnvPreparer::new(SystemRunner, console, options).prepare(&request)?;
            debug!("completed stages: {:?}", summary.completed);
        }
        Command::Run {
            instance_id,
            category,
            dataset,
            workdir,
            output_dir,
            timeout,
            setup_timeout,
            docker,
            image_prefix,
            keep_worktrees,
            version_specs,
            repo_url,
            python,
        } => {
            let instances = harness::filter_instances(
                harness::load_dataset(&dataset)?,
                &instance_id,
                category.as_deref(),
            )?;
            console.info(format!(
                "Processing {} instance(s) from {:?}",
                instances.len(),
                dataset
            ))?;

            let mapping = version_specs
                .map(VersionMapping::load)
                .unwrap_or_default();
            let options = HarnessOptions {
                workdir,
                output_dir,
                timeout,
                setup_timeout,
                docker,
                image_prefix: tag_prefix_or_default(image_prefix),
                keep_worktrees,
                repo_url,
                python,
            };

            let mut harness = Harness::new(SystemRunner, console, options, mapping);
            let results = harness.run_all(&instances)?;
            harness.print_summary(&results)?;

            let incomplete = results
                .iter()
                .filter(|result| result.status != Status::Success)
                .count();
            if incomplete > 0 {
                return Err(HarnessError::IncompleteInstances(incomplete).into());
            }
        }
        Command::Collect {
            results_dir,
            dataset,
            output,
            summary_only,
            no_swebench_format,
        } => {
            let options = CollectOptions {
                results_dir,
                dataset,
                output,
                summary_only,
                swebench_format: !no_swebench_format,
            };

            collect::collect(&options, &mut console)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    // Parsing reads the process environment, which tests share.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const BUILD_VARS: &[&str] = &["DOCKER_REGISTRY", "DOCKER_TAG_PREFIX", "BUILD_JOBS"];

    fn parse_with_env(argv: &[&str], vars: &[(&str, &str)]) -> Args {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for name in BUILD_VARS {
            env::remove_var(name);
        }
        for (name, value) in vars {
            env::set_var(name, value);
        }
        let parsed = Args::from_iter_safe(argv.iter().copied());
        for name in BUILD_VARS {
            env::remove_var(name);
        }
        parsed.unwrap()
    }

    #[test]
    fn build_without_targets_builds_everything() {
        let args = parse_with_env(&["infra-gym", "build", "--dry-run"], &[]);

        match args.command {
            Command::Build {
                targets,
                dry_run,
                registry,
                tag_prefix,
                jobs,
                ..
            } => {
                assert!(dry_run);
                assert_eq!(registry, None);
                assert_eq!(tag_prefix, "infra-gym");
                assert_eq!(build_jobs(jobs.as_deref()), 1);

                let targets = build_targets(targets);
                assert_eq!(targets, vec![BuildTarget::All]);
                let plan = resolver::resolve(&VersionTable::builtin().unwrap(), &targets);
                assert_eq!(plan.base_images.len(), 4);
                assert_eq!(plan.groups.len(), 6);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn build_reads_registry_prefix_and_jobs_from_the_environment() {
        let args = parse_with_env(
            &["infra-gym", "build", "v0.5", "base"],
            &[
                ("DOCKER_REGISTRY", "registry.local:5000"),
                ("DOCKER_TAG_PREFIX", "gym"),
                ("BUILD_JOBS", "4"),
            ],
        );

        match args.command {
            Command::Build {
                targets,
                registry,
                tag_prefix,
                jobs,
                ..
            } => {
                assert_eq!(
                    build_targets(targets),
                    vec![BuildTarget::Group("v0.5".into()), BuildTarget::Base]
                );
                assert_eq!(registry.as_deref(), Some("registry.local:5000"));
                assert_eq!(tag_prefix, "gym");
                assert_eq!(build_jobs(jobs.as_deref()), 4);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn empty_build_variables_fall_back_to_defaults() {
        let args = parse_with_env(
            &["infra-gym", "build", "--dry-run"],
            &[("DOCKER_TAG_PREFIX", ""), ("BUILD_JOBS", "")],
        );

        match args.command {
            Command::Build {
                tag_prefix, jobs, ..
            } => {
                assert_eq!(tag_prefix_or_default(tag_prefix), "infra-gym");
                assert_eq!(build_jobs(jobs.as_deref()), 1);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(build_jobs(Some("many")), 1);
        assert_eq!(tag_prefix_or_default("gym".into()), "gym");
    }

    #[test]
    fn run_image_prefix_shares_the_tag_prefix_variable() {
        let args = parse_with_env(
            &["infra-gym", "run", "--docker"],
            &[("DOCKER_TAG_PREFIX", "")],
        );

        match args.command {
            Command::Run {
                image_prefix,
                instance_id,
                timeout,
                setup_timeout,
                docker,
                ..
            } => {
                assert_eq!(tag_prefix_or_default(image_prefix), "infra-gym");
                assert_eq!(instance_id, "all");
                assert_eq!(timeout, 120);
                assert_eq!(setup_timeout, 300);
                assert!(docker);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn prepare_env_without_commit_exits_with_one() {
        let args = parse_with_env(&["infra-gym", "prepare-env", "--skip-build"], &[]);

        let err = run(args.command).unwrap_err();

        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::MissingCommit) => {}
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn exit_codes_come_from_harness_errors() {
        let failed: anyhow::Error = HarnessError::CommandFailed {
            command: "docker build .".into(),
            code: 125,
        }
        .into();
        let wrapped = failed.context("building v0.5");

        assert_eq!(exit_code(&wrapped), 125);
        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }
}
