use log::debug;
use std::{collections::BTreeSet as Set, str::FromStr};

use crate::{
    models::{BaseImageSpec, VersionGroupSpec},
    versions::VersionTable,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildTarget {
    All,
    Base,
    Group(String),
}

impl FromStr for BuildTarget {
    type Err = std::convert::Infallible;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Ok(match token {
            "all" => BuildTarget::All,
            "base" => BuildTarget::Base,
            name => BuildTarget::Group(name.into()),
        })
    }
}

/// What a build run has to produce: bases first, then groups, each at most once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildPlan {
    pub base_images: Vec<BaseImageSpec>,
    pub groups: Vec<VersionGroupSpec>,
}

impl BuildPlan {
    pub fn is_empty(&self) -> bool {
        self.base_images.is_empty() && self.groups.is_empty()
    }
}

/// Resolves requested targets against the table. Tokens naming no group match nothing.
pub fn resolve(table: &VersionTable, targets: &[BuildTarget]) -> BuildPlan {
    let all = targets.contains(&BuildTarget::All);
    let all_bases = all || targets.contains(&BuildTarget::Base);

    let requested = targets
        .iter()
        .filter_map(|target| match target {
            BuildTarget::Group(name) => Some(name.as_str()),
            _ => None,
        })
        .collect::<Set<_>>();

    for name in requested.iter() {
        if table.group(name).is_none() {
            debug!("target {:?} matches no version group", name);
        }
    }

    let groups = table
        .groups()
        .iter()
        .filter(|group| all || requested.contains(group.name))
        .cloned()
        .collect::<Vec<_>>();

    let needed_bases = table
        .groups()
        .iter()
        .filter(|group| requested.contains(group.name))
        .map(VersionGroupSpec::base_image)
        .collect::<Set<_>>();

    let base_images = table
        .base_images()
        .into_iter()
        .filter(|base| all_bases || needed_bases.contains(base))
        .collect();

    BuildPlan {
        base_images,
        groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn targets(tokens: &[&str]) -> Vec<BuildTarget> {
        tokens.iter().map(|token| token.parse().unwrap()).collect()
    }

    fn group_names(plan: &BuildPlan) -> Vec<&'static str> {
        plan.groups.iter().map(|group| group.name).collect()
    }

    #[test]
    fn all_selects_everything_once() {
        let table = VersionTable::builtin().unwrap();
        let plan = resolve(&table, &targets(&["all", "v0.5", "base", "all"]));

        assert_eq!(plan.base_images, table.base_images());
        assert_eq!(plan.groups, table.groups().to_vec());
    }

    #[test]
    fn a_single_group_selects_only_its_base() {
        let table = VersionTable::builtin().unwrap();
        let plan = resolve(&table, &targets(&["v0.5"]));

        assert_eq!(
            plan.base_images,
            vec![BaseImageSpec {
                cuda_version: "12.4.0",
                python_version: "3.10",
            }]
        );
        assert_eq!(group_names(&plan), vec!["v0.5"]);
    }

    #[test]
    fn base_selects_every_base_and_no_group() {
        let table = VersionTable::builtin().unwrap();
        let plan = resolve(&table, &targets(&["base"]));

        assert_eq!(plan.base_images.len(), 4);
        assert!(plan.groups.is_empty());
    }

    #[test]
    fn groups_sharing_a_base_build_it_once() {
        let table = VersionTable::builtin().unwrap();
        let plan = resolve(&table, &targets(&["v0.4", "v0.3"]));

        assert_eq!(
            plan.base_images,
            vec![BaseImageSpec {
                cuda_version: "12.1.0",
                python_version: "3.10",
            }]
        );
        assert_eq!(group_names(&plan), vec!["v0.3", "v0.4"]);
    }

    #[test]
    fn unknown_targets_are_ignored() {
        let table = VersionTable::builtin().unwrap();

        assert!(resolve(&table, &targets(&["v9.9"])).is_empty());

        let plan = resolve(&table, &targets(&["v9.9", "v0.2"]));
        assert_eq!(group_names(&plan), vec!["v0.2"]);
        assert_eq!(plan.base_images.len(), 1);
    }

    #[test]
    fn base_plus_group_builds_all_bases_and_that_group() {
        let table = VersionTable::builtin().unwrap();
        let plan = resolve(&table, &targets(&["base", "v0.6"]));

        assert_eq!(plan.base_images.len(), 4);
        assert_eq!(group_names(&plan), vec!["v0.6"]);
    }
}
