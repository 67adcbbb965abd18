//! Reading pytest results back: JUnit XML first, the verbose log as a fallback.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

pub const TIMEOUT_ID: &str = "TIMEOUT";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcomes {
    #[serde(default)]
    pub passed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
}

impl TestOutcomes {
    pub fn timed_out() -> TestOutcomes {
        TestOutcomes {
            errors: vec![TIMEOUT_ID.into()],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.passed.is_empty()
            && self.failed.is_empty()
            && self.errors.is_empty()
            && self.skipped.is_empty()
    }
}

/// Parses a pytest `--junit-xml` report. A missing or malformed file yields no outcomes.
pub fn parse_junit_file<P: AsRef<Path>>(path: P) -> TestOutcomes {
    let path = path.as_ref();
    if !path.is_file() {
        warn!("JUnit XML not found: {:?}", path);
        return TestOutcomes::default();
    }

    let parsed = fs::read_to_string(path)
        .with_context(|| format!("failed to read {:?}", path))
        .and_then(|text| parse_junit_str(&text));

    match parsed {
        Ok(outcomes) => outcomes,
        Err(err) => {
            warn!("failed to parse JUnit XML {:?}: {:#}", path, err);
            TestOutcomes::default()
        }
    }
}

pub fn parse_junit_str(text: &str) -> Result<TestOutcomes> {
    let document = roxmltree::Document::parse(text)?;
    let mut outcomes = TestOutcomes::default();

    for testcase in document
        .descendants()
        .filter(|node| node.has_tag_name("testcase"))
    {
        let id = node_id(
            testcase.attribute("classname").unwrap_or(""),
            testcase.attribute("name").unwrap_or(""),
        );
        let has_child = |tag: &str| testcase.children().any(|child| child.has_tag_name(tag));

        if has_child("failure") {
            outcomes.failed.push(id);
        } else if has_child("error") {
            outcomes.errors.push(id);
        } else if has_child("skipped") {
            outcomes.skipped.push(id);
        } else {
            outcomes.passed.push(id);
        }
    }

    debug!(
        "parsed JUnit XML: {} passed, {} failed, {} errors, {} skipped",
        outcomes.passed.len(),
        outcomes.failed.len(),
        outcomes.errors.len(),
        outcomes.skipped.len()
    );

    Ok(outcomes)
}

/// Rebuilds a pytest node id from JUnit `classname` and `name`.
///
/// `tests.core.test_block.TestBlock` + `test_alloc` becomes
/// `tests/core/test_block.py::TestBlock::test_alloc`. Module segments are the leading ones
/// that start lowercase (or with `test_`); the rest name the class.
pub fn node_id(classname: &str, name: &str) -> String {
    if classname.is_empty() {
        // Collection errors carry the dotted module path in `name`.
        if name.contains('.') && !name.contains("::") && !name.ends_with(".py") {
            return format!("{}.py", name.split('.').collect::<Vec<_>>().join("/"));
        }
        return name.to_owned();
    }

    let mut file_parts = Vec::new();
    let mut class_parts = Vec::new();
    for part in classname.split('.') {
        let module_like = part.chars().next().map_or(false, char::is_lowercase)
            || part.starts_with("test_");
        if class_parts.is_empty() && module_like {
            file_parts.push(part);
        } else {
            class_parts.push(part);
        }
    }

    let mut file_path = if file_parts.is_empty() {
        format!("{}.py", classname.replace('.', "/"))
    } else {
        format!("{}.py", file_parts.join("/"))
    };
    if file_path.ends_with(".py.py") {
        file_path.truncate(file_path.len() - 3);
    }

    if class_parts.is_empty() {
        format!("{}::{}", file_path, name)
    } else {
        format!("{}::{}::{}", file_path, class_parts.join("."), name)
    }
}

/// Classifies `path::test STATUS` lines of `pytest -v` output.
pub fn parse_pytest_log(text: &str) -> TestOutcomes {
    let mut outcomes = TestOutcomes::default();

    for line in text.lines().map(str::trim) {
        let markers: [(&str, &mut Vec<String>); 4] = [
            (" PASSED", &mut outcomes.passed),
            (" FAILED", &mut outcomes.failed),
            (" ERROR", &mut outcomes.errors),
            (" SKIPPED", &mut outcomes.skipped),
        ];

        for (marker, bucket) in markers {
            if let Some(index) = line.find(marker) {
                let id = line[..index].trim();
                if id.contains("::") {
                    bucket.push(id.to_owned());
                }
                break;
            }
        }
    }

    outcomes
}

pub fn parse_pytest_log_file<P: AsRef<Path>>(path: P) -> TestOutcomes {
    match fs::read(path.as_ref()) {
        Ok(bytes) => parse_pytest_log(&String::from_utf8_lossy(&bytes)),
        Err(err) => {
            debug!("no pytest log at {:?}: {}", path.as_ref(), err);
            TestOutcomes::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const REPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuites>
  <testsuite name="pytest" errors="1" failures="1" skipped="1" tests="5">
    <testcase classname="tests.core.test_block_manager" name="test_can_allocate" time="0.01" />
    <testcase classname="tests.core.test_block_manager.TestSwap" name="test_swap_in[cpu]" time="0.02">
      <failure message="assert 1 == 2">assert 1 == 2</failure>
    </testcase>
    <testcase classname="tests.test_logger" name="test_trace_function_call">
      <error message="fixture not found" />
    </testcase>
    <testcase classname="tests.test_utils" name="test_cuda_only">
      <skipped message="needs cuda" />
    </testcase>
    <testcase classname="" name="tests.test_config" />
  </testsuite>
</testsuites>"#;

    #[test]
    fn classifies_testcases() {
        let outcomes = parse_junit_str(REPORT).unwrap();

        assert_eq!(
            outcomes,
            TestOutcomes {
                passed: vec![
                    "tests/core/test_block_manager.py::test_can_allocate".into(),
                    "tests/test_config.py".into(),
                ],
                failed: vec![
                    "tests/core/test_block_manager.py::TestSwap::test_swap_in[cpu]".into(),
                ],
                errors: vec!["tests/test_logger.py::test_trace_function_call".into()],
                skipped: vec!["tests/test_utils.py::test_cuda_only".into()],
            }
        );
    }

    #[test]
    fn node_ids() {
        assert_eq!(node_id("", "tests/foo.py::test_x"), "tests/foo.py::test_x");
        assert_eq!(node_id("", "tests/foo.py"), "tests/foo.py");
        assert_eq!(node_id("", "tests.test_logger"), "tests/test_logger.py");
        assert_eq!(
            node_id("tests.entrypoints.test_chat_utils", "test_parse"),
            "tests/entrypoints/test_chat_utils.py::test_parse"
        );
        assert_eq!(
            node_id("tests.models.test_models.TestLlama.Nested", "test_a"),
            "tests/models/test_models.py::TestLlama.Nested::test_a"
        );
        assert_eq!(node_id("TestTop", "test_b"), "TestTop.py::TestTop::test_b");
    }

    #[test]
    fn malformed_reports_are_errors_and_missing_files_are_empty() {
        assert!(parse_junit_str("<testsuite>").is_err());

        let dir = tempfile::tempdir().unwrap();
        assert!(parse_junit_file(dir.path().join("phase1.xml")).is_empty());

        let broken = dir.path().join("broken.xml");
        fs::write(&broken, "<testsuite><testcase").unwrap();
        assert!(parse_junit_file(&broken).is_empty());
    }

    #[test]
    fn log_fallback_reads_verbose_lines() {
        let log = "\
============================= test session starts ==============================
tests/test_a.py::test_one PASSED                                         [ 25%]
tests/test_a.py::test_two FAILED                                         [ 50%]
tests/test_b.py::test_three ERROR                                        [ 75%]
tests/test_b.py::test_four SKIPPED (needs gpu)                           [100%]
FAILED tests/test_a.py::test_two - AssertionError
=========================== 1 failed, 1 passed ================================
";
        let outcomes = parse_pytest_log(log);

        assert_eq!(outcomes.passed, vec!["tests/test_a.py::test_one"]);
        assert_eq!(outcomes.failed, vec!["tests/test_a.py::test_two"]);
        assert_eq!(outcomes.errors, vec!["tests/test_b.py::test_three"]);
        assert_eq!(outcomes.skipped, vec!["tests/test_b.py::test_four"]);
    }
}
