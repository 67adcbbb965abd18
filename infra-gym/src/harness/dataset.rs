use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeSet as Set,
    fs::File,
    io::BufReader,
    path::Path,
    str::FromStr,
};

#[derive(Copy, Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub enum Category {
    GpuDistributed,
    GpuModel,
    ApiServer,
    UnitCpu,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::GpuDistributed,
        Category::GpuModel,
        Category::ApiServer,
        Category::UnitCpu,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::GpuDistributed => "gpu_distributed",
            Category::GpuModel => "gpu_model",
            Category::ApiServer => "api_server",
            Category::UnitCpu => "unit_cpu",
        }
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Category::ALL
            .iter()
            .copied()
            .find(|category| category.as_str() == value)
            .ok_or_else(|| {
                let valid = Category::ALL
                    .iter()
                    .map(|category| category.as_str())
                    .collect::<Vec<_>>();
                anyhow!("unknown category {:?}, valid categories: {:?}", value, valid)
            })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    #[serde(default)]
    pub base_commit: String,
    #[serde(default = "unknown_version")]
    pub version: String,
    #[serde(default)]
    pub tests: InstanceTests,
    #[serde(default)]
    pub fix: InstanceFix,
    #[serde(default)]
    pub environment: InstanceEnvironment,
}

fn unknown_version() -> String {
    "unknown".into()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstanceTests {
    #[serde(default)]
    pub test_patch: Option<String>,
    #[serde(default)]
    pub test_ids: TestIds,
    #[serde(default)]
    pub test_files: Vec<TestFile>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestIds {
    #[serde(default)]
    pub all_test_ids: Vec<String>,
    #[serde(default)]
    pub affected_test_files: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestFile {
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstanceFix {
    #[serde(default)]
    pub patch: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstanceEnvironment {
    #[serde(default)]
    pub category: Option<String>,
}

impl Instance {
    /// Pytest targets: explicit node ids, else affected files, else the PR's test files.
    pub fn test_targets(&self) -> Vec<String> {
        let ids = &self.tests.test_ids;
        if !ids.all_test_ids.is_empty() {
            return ids.all_test_ids.clone();
        }
        if !ids.affected_test_files.is_empty() {
            return ids.affected_test_files.clone();
        }

        self.tests
            .test_files
            .iter()
            .filter_map(|file| file.filename.clone())
            .collect()
    }

    pub fn category(&self) -> &str {
        self.environment.category.as_deref().unwrap_or("")
    }

    pub fn test_patch(&self) -> &str {
        self.tests.test_patch.as_deref().unwrap_or("")
    }

    pub fn source_patch(&self) -> &str {
        self.fix.patch.as_deref().unwrap_or("")
    }
}

/// Loads the dataset, which must be a JSON array of instances.
pub fn load_dataset<P: AsRef<Path>>(path: P) -> Result<Vec<Instance>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open dataset {:?}", path))?;
    let value: Value = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse dataset {:?}", path))?;

    if !value.is_array() {
        return Err(anyhow!(
            "expected a JSON array at the top level of {:?}",
            path
        ));
    }

    Ok(serde_json::from_value(value)?)
}

/// Selects instances by id (`all`, one id or a comma separated list) and optionally by
/// a comma separated list of categories.
pub fn filter_instances(
    dataset: Vec<Instance>,
    id_filter: &str,
    category_filter: Option<&str>,
) -> Result<Vec<Instance>> {
    let mut selected = if id_filter.eq_ignore_ascii_case("all") {
        dataset
    } else {
        let requested = id_filter
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .collect::<Set<_>>();

        let available = dataset
            .iter()
            .take(10)
            .map(|instance| instance.instance_id.clone())
            .collect::<Vec<_>>();

        let selected = dataset
            .into_iter()
            .filter(|instance| requested.contains(&instance.instance_id))
            .collect::<Vec<_>>();

        if selected.is_empty() {
            return Err(anyhow!(
                "no instances matched {:?}, available ids include: {:?}",
                id_filter,
                available
            ));
        }

        let found = selected
            .iter()
            .map(|instance| instance.instance_id.clone())
            .collect::<Set<_>>();
        let missing = requested.difference(&found).collect::<Vec<_>>();
        if !missing.is_empty() {
            warn!("requested instance ids not found in dataset: {:?}", missing);
        }

        selected
    };

    if let Some(category_filter) = category_filter {
        let categories = category_filter
            .split(',')
            .map(str::trim)
            .map(str::parse::<Category>)
            .collect::<Result<Set<_>>>()?;

        let before = selected.len();
        selected.retain(|instance| {
            categories
                .iter()
                .any(|category| category.as_str() == instance.category())
        });
        info!(
            "category filter {:?}: {} -> {} instances",
            category_filter,
            before,
            selected.len()
        );

        if selected.is_empty() {
            return Err(anyhow!(
                "no instances matched category {:?} (from {} candidates)",
                category_filter,
                before
            ));
        }
    }

    Ok(selected)
}
