use std::collections::BTreeSet as Set;

use crate::junit::TestOutcomes;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub fail_to_pass: Vec<String>,
    pub pass_to_pass: Vec<String>,
    pub regressions: Vec<String>,
    pub both_failed: Vec<String>,
}

/// Compares the run without the fix (`before`) against the run with it (`after`).
///
/// A module-level error in `before` (an id without `::`, e.g. a collection error) counts
/// every test of that module passing in `after` as FAIL_TO_PASS.
pub fn classify(before: &TestOutcomes, after: &TestOutcomes) -> Classification {
    let failing_before = before
        .failed
        .iter()
        .chain(before.errors.iter())
        .map(String::as_str)
        .collect::<Set<_>>();
    let passing_before = before.passed.iter().map(String::as_str).collect::<Set<_>>();
    let passing_after = after.passed.iter().map(String::as_str).collect::<Set<_>>();

    let mut fail_to_pass = failing_before
        .intersection(&passing_after)
        .copied()
        .collect::<Set<_>>();

    let mut resolved_modules = Set::new();
    for module in before.errors.iter().map(String::as_str) {
        if module.contains("::") || passing_after.contains(module) {
            continue;
        }

        let prefix = if module.ends_with(".py") {
            format!("{}::", module)
        } else {
            format!("{}.py::", module)
        };
        for id in passing_after.iter().filter(|id| id.starts_with(&prefix)) {
            // Only ids not already counted resolve the module error.
            if fail_to_pass.insert(*id) {
                resolved_modules.insert(module);
            }
        }
    }

    let pass_to_pass = passing_before.intersection(&passing_after);
    let regressions = passing_before.difference(&passing_after);
    let both_failed = failing_before
        .difference(&passing_after)
        .filter(|id| !resolved_modules.contains(*id));

    Classification {
        fail_to_pass: owned(fail_to_pass.iter()),
        pass_to_pass: owned(pass_to_pass),
        regressions: owned(regressions),
        both_failed: owned(both_failed),
    }
}

fn owned<'a, 'b: 'a>(ids: impl Iterator<Item = &'a &'b str>) -> Vec<String> {
    ids.map(|id| (*id).to_owned()).collect()
}
