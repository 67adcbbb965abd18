use anyhow::Result;
use log::{debug, info};
use std::{collections::BTreeMap as Map, path::PathBuf};

use crate::{
    console::Console,
    models::{BaseImageSpec, ImageTag, Invocation, VersionGroupSpec},
    resolver::BuildPlan,
    services::CommandRunner,
    versions::BASE_DOCKERFILE,
};

#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub tag_prefix: String,
    pub registry: Option<String>,
    pub no_cache: bool,
    pub push: bool,
    pub context: PathBuf,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            tag_prefix: "infra-gym".into(),
            registry: None,
            no_cache: false,
            push: false,
            context: PathBuf::from("."),
        }
    }
}

/// Builds the images of a plan with `docker build`, one at a time.
///
/// The first failing invocation aborts the run. Images built before it are kept.
pub struct ImageBuilder {
    runner: Box<dyn CommandRunner>,
    console: Console,
    options: BuildOptions,
}

impl ImageBuilder {
    pub fn new<R>(runner: R, console: Console, options: BuildOptions) -> ImageBuilder
    where
        R: 'static + CommandRunner,
    {
        ImageBuilder {
            runner: Box::new(runner),
            console,
            options,
        }
    }

    pub fn base_tag(&self, base: &BaseImageSpec) -> ImageTag {
        ImageTag(format!(
            "{}-base:cuda{}-py{}",
            self.options.tag_prefix, base.cuda_version, base.python_version
        ))
    }

    pub fn group_tag(&self, group: &VersionGroupSpec) -> ImageTag {
        ImageTag(format!("{}:{}", self.options.tag_prefix, group.name))
    }

    pub fn build_plan(&mut self, plan: &BuildPlan) -> Result<Vec<ImageTag>> {
        if self.options.push && self.registry().is_none() {
            self.console
                .warn("--push given but DOCKER_REGISTRY is not set, images stay local")?;
        }

        let mut built = Vec::new();

        for base in plan.base_images.iter() {
            built.push(self.build_base(base)?);
        }

        for group in plan.groups.iter() {
            built.push(self.build_group(group)?);
        }

        info!("built {} image(s)", built.len());
        Ok(built)
    }

    fn build_base(&mut self, base: &BaseImageSpec) -> Result<ImageTag> {
        let tag = self.base_tag(base);
        self.console.info(format!(
            "Building base image {} (CUDA {}, Python {})",
            tag.0, base.cuda_version, base.python_version
        ))?;

        let mut build_args = Map::new();
        build_args.insert("CUDA_VERSION", base.cuda_version.to_owned());
        build_args.insert("PYTHON_VERSION", base.python_version.to_owned());

        self.docker_build(BASE_DOCKERFILE, &tag, build_args)?;
        self.console.success(format!("Built {}", tag.0))?;
        self.push(&tag)?;

        Ok(tag)
    }

    fn build_group(&mut self, group: &VersionGroupSpec) -> Result<ImageTag> {
        let tag = self.group_tag(group);
        let base_tag = self.base_tag(&group.base_image());
        self.console.info(format!(
            "Building version group {} on top of {}",
            tag.0, base_tag.0
        ))?;

        let mut build_args = Map::new();
        build_args.insert("BASE_IMAGE", base_tag.0);

        self.docker_build(group.dockerfile, &tag, build_args)?;
        self.console.success(format!("Built {}", tag.0))?;
        self.push(&tag)?;

        Ok(tag)
    }

    fn docker_build(
        &mut self,
        dockerfile: &str,
        tag: &ImageTag,
        build_args: Map<&str, String>,
    ) -> Result<()> {
        let mut invocation = Invocation::new("docker").arg("build");
        if self.options.no_cache {
            invocation = invocation.arg("--no-cache");
        }
        for (key, value) in build_args {
            invocation = invocation
                .arg("--build-arg")
                .arg(format!("{}={}", key, value));
        }

        let invocation = invocation
            .arg("-f")
            .arg(self.options.context.join(dockerfile).to_string_lossy())
            .arg("-t")
            .arg(tag.0.as_str())
            .arg(self.options.context.to_string_lossy());

        self.runner.run_checked(&invocation)?;
        Ok(())
    }

    fn push(&mut self, tag: &ImageTag) -> Result<()> {
        let registry = match (self.options.push, self.registry()) {
            (true, Some(registry)) => registry.to_owned(),
            _ => return Ok(()),
        };

        let remote = format!("{}/{}", registry.trim_end_matches('/'), tag.0);
        debug!("pushing {} as {}", tag.0, remote);

        self.runner.run_checked(
            &Invocation::new("docker")
                .arg("tag")
                .arg(tag.0.as_str())
                .arg(remote.as_str()),
        )?;
        self.runner
            .run_checked(&Invocation::new("docker").arg("push").arg(remote.as_str()))?;
        self.console.success(format!("Pushed {}", remote))?;

        Ok(())
    }

    fn registry(&self) -> Option<&str> {
        self.options
            .registry
            .as_deref()
            .filter(|registry| !registry.is_empty())
    }
}
