use anyhow::{anyhow, Result};
use log::{debug, warn};
use serde::Deserialize;
use std::{
    collections::{BTreeMap as Map, BTreeSet as Set},
    fs::File,
    path::Path,
};

use crate::models::{BaseImageSpec, VersionGroupSpec};

pub const BASE_DOCKERFILE: &str = "docker/Dockerfile.base";

const VERSION_GROUPS: &[VersionGroupSpec] = &[
    VersionGroupSpec {
        name: "v0.2",
        cuda_version: "11.8.0",
        python_version: "3.9",
        dockerfile: "docker/Dockerfile.v0.2",
    },
    VersionGroupSpec {
        name: "v0.3",
        cuda_version: "12.1.0",
        python_version: "3.10",
        dockerfile: "docker/Dockerfile.v0.3",
    },
    VersionGroupSpec {
        name: "v0.4",
        cuda_version: "12.1.0",
        python_version: "3.10",
        dockerfile: "docker/Dockerfile.v0.4",
    },
    VersionGroupSpec {
        name: "v0.5",
        cuda_version: "12.4.0",
        python_version: "3.10",
        dockerfile: "docker/Dockerfile.v0.5",
    },
    VersionGroupSpec {
        name: "v0.6",
        cuda_version: "12.4.1",
        python_version: "3.12",
        dockerfile: "docker/Dockerfile.v0.6",
    },
    VersionGroupSpec {
        name: "v0.7",
        cuda_version: "12.4.1",
        python_version: "3.12",
        dockerfile: "docker/Dockerfile.v0.7",
    },
];

/// Ordered table of version groups, unique by name.
#[derive(Clone, Debug)]
pub struct VersionTable {
    groups: Vec<VersionGroupSpec>,
}

impl VersionTable {
    pub fn new(groups: Vec<VersionGroupSpec>) -> Result<VersionTable> {
        let mut names = Set::new();
        for group in groups.iter() {
            if !names.insert(group.name) {
                return Err(anyhow!("duplicate version group: {:?}", group.name));
            }
        }

        Ok(VersionTable { groups })
    }

    pub fn builtin() -> Result<VersionTable> {
        VersionTable::new(VERSION_GROUPS.to_vec())
    }

    pub fn groups(&self) -> &[VersionGroupSpec] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&VersionGroupSpec> {
        self.groups.iter().find(|group| group.name == name)
    }

    /// Unique (CUDA, Python) pairs in order of first appearance.
    pub fn base_images(&self) -> Vec<BaseImageSpec> {
        let mut seen = Set::new();
        self.groups
            .iter()
            .map(VersionGroupSpec::base_image)
            .filter(|base| seen.insert(*base))
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct VersionSpecsFile {
    #[serde(default)]
    version_to_group: Map<String, String>,
}

/// Maps release versions such as `0.5.3.post1` to version groups such as `v0.5`.
#[derive(Clone, Debug, Default)]
pub struct VersionMapping {
    version_to_group: Map<String, String>,
}

impl VersionMapping {
    /// Reads a `version_specs.json` file. A missing or malformed file only costs the explicit
    /// entries, the heuristic still applies.
    pub fn load<P: AsRef<Path>>(path: P) -> VersionMapping {
        let path = path.as_ref();
        let parsed = File::open(path)
            .map_err(anyhow::Error::from)
            .and_then(|file| Ok(serde_json::from_reader::<_, VersionSpecsFile>(file)?));

        match parsed {
            Ok(specs) => {
                debug!(
                    "loaded {} version mappings from {:?}",
                    specs.version_to_group.len(),
                    path
                );
                VersionMapping {
                    version_to_group: specs.version_to_group,
                }
            }
            Err(err) => {
                warn!("could not load version specs {:?}: {}", path, err);
                VersionMapping::default()
            }
        }
    }

    pub fn group_for(&self, version: &str) -> String {
        let mapped = self
            .version_to_group
            .get(version)
            .filter(|group| !group.is_empty());
        if let Some(group) = mapped {
            return group.clone();
        }

        let mut parts = version.split('.');
        match (parts.next(), parts.next()) {
            (Some(major), Some(minor)) => format!("v{}.{}", major, minor),
            _ => format!("v{}", version),
        }
    }

    /// Image tag for a release version; images exist per group, not per release.
    pub fn image_for(&self, image_prefix: &str, version: &str) -> String {
        format!("{}:{}", image_prefix, self.group_for(version))
    }
}
