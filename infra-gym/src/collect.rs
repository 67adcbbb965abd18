//! Gathers per-instance result files and merges the test sets back into the dataset.

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde_json::Value;
use std::{
    collections::{BTreeMap as Map, BTreeSet as Set},
    fs::{self, File},
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

use crate::{
    console::Console,
    errors::HarnessError,
    harness::{InstanceResult, Status},
};

#[derive(Clone, Debug)]
pub struct CollectOptions {
    pub results_dir: PathBuf,
    pub dataset: PathBuf,
    /// Defaults to overwriting the dataset.
    pub output: Option<PathBuf>,
    pub summary_only: bool,
    pub swebench_format: bool,
}

pub fn collect(options: &CollectOptions, console: &mut Console) -> Result<()> {
    let results = load_result_files(&options.results_dir)?;
    if results.is_empty() {
        return Err(HarnessError::NoResults(options.results_dir.clone()).into());
    }

    write_collection_summary(console.writer(), &results)?;

    if !options.dataset.is_file() {
        console.warn(format!(
            "dataset {:?} not found, skipping merge and validation",
            options.dataset
        ))?;
        return Ok(());
    }

    let mut dataset = load_dataset_values(&options.dataset)?;
    validate_results(console.writer(), &dataset, &results)?;

    if options.summary_only {
        info!("summary-only mode, not writing output");
        return Ok(());
    }

    merge_results_into_dataset(&mut dataset, &results, options.swebench_format);

    let output = options.output.as_ref().unwrap_or(&options.dataset);
    info!("writing merged dataset to {:?}", output);
    fs::write(output, serde_json::to_string_pretty(&dataset)?)
        .with_context(|| format!("failed to write {:?}", output))?;

    let with_f2p = dataset
        .iter()
        .filter(|entry| match entry.get("FAIL_TO_PASS") {
            Some(Value::String(text)) => !text.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            _ => false,
        })
        .count();
    console.success(format!(
        "Wrote {} instances to {:?}, {} with FAIL_TO_PASS data",
        dataset.len(),
        output,
        with_f2p
    ))?;

    Ok(())
}

/// Reads `<dir>/<id>.json` and `<dir>/<id>/result.json`. Flat files win when both exist.
pub fn load_result_files(dir: &Path) -> Result<Map<String, InstanceResult>> {
    let mut results = Map::new();
    if !dir.is_dir() {
        warn!("results directory does not exist: {:?}", dir);
        return Ok(results);
    }

    let mut nested = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {:?}", dir))? {
        let path = entry?.path();
        if path.is_dir() {
            nested.push(path);
        } else if path.extension().map_or(false, |ext| ext == "json") {
            if let Some(result) = read_result(&path) {
                results.insert(result.instance_id.clone(), result);
            }
        }
    }

    for path in nested {
        let file = path.join("result.json");
        if !file.is_file() {
            continue;
        }
        if let Some(result) = read_result(&file) {
            results.entry(result.instance_id.clone()).or_insert(result);
        }
    }

    info!("loaded {} result file(s) from {:?}", results.len(), dir);
    Ok(results)
}

fn read_result(path: &Path) -> Option<InstanceResult> {
    let parsed = File::open(path)
        .map_err(anyhow::Error::from)
        .and_then(|file| Ok(serde_json::from_reader::<_, InstanceResult>(BufReader::new(file))?));

    match parsed {
        Ok(mut result) => {
            if result.instance_id.is_empty() {
                // `<id>.json` or `<id>/result.json`
                let named_by = if path.file_name().map_or(false, |name| name == "result.json") {
                    path.parent().and_then(Path::file_name)
                } else {
                    path.file_stem()
                };
                result.instance_id = named_by
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
            }
            Some(result)
        }
        Err(err) => {
            warn!("failed to load {:?}: {:#}", path, err);
            None
        }
    }
}

fn load_dataset_values(path: &Path) -> Result<Vec<Value>> {
    let file = File::open(path).with_context(|| format!("failed to open dataset {:?}", path))?;
    match serde_json::from_reader::<_, Value>(BufReader::new(file))
        .with_context(|| format!("failed to parse dataset {:?}", path))?
    {
        Value::Array(entries) => Ok(entries),
        _ => Err(anyhow!("expected a JSON array at the top level of {:?}", path)),
    }
}

/// Writes the test sets of each matching result into its dataset entry, leaving every
/// other field untouched. Returns how many entries were updated.
pub fn merge_results_into_dataset(
    dataset: &mut [Value],
    results: &Map<String, InstanceResult>,
    swebench_format: bool,
) -> usize {
    let mut merged = 0;

    for entry in dataset.iter_mut() {
        let result = match entry
            .get("instance_id")
            .and_then(Value::as_str)
            .and_then(|id| results.get(id))
        {
            Some(result) => result,
            None => continue,
        };
        let object = match entry.as_object_mut() {
            Some(object) => object,
            None => continue,
        };

        let encode = |tests: &[String]| {
            if swebench_format {
                Value::String(serde_json::to_string(tests).unwrap_or_default())
            } else {
                Value::from(tests.to_vec())
            }
        };
        object.insert("FAIL_TO_PASS".into(), encode(&result.fail_to_pass));
        object.insert("PASS_TO_PASS".into(), encode(&result.pass_to_pass));
        object.insert("_eval_status".into(), result.status.as_str().into());
        object.insert("_eval_error".into(), result.error_message.as_str().into());
        merged += 1;
    }

    info!("merged results for {} / {} instances", merged, dataset.len());
    merged
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

pub fn write_collection_summary(
    out: &mut dyn Write,
    results: &Map<String, InstanceResult>,
) -> Result<()> {
    let total = results.len();
    let mut statuses = Map::new();
    let (mut f2p, mut p2p, mut with_f2p, mut with_p2p) = (0, 0, 0, 0);
    let (mut regressions, mut both_failed) = (0, 0);

    for result in results.values() {
        *statuses.entry(result.status.as_str()).or_insert(0) += 1;
        f2p += result.fail_to_pass.len();
        p2p += result.pass_to_pass.len();
        if !result.fail_to_pass.is_empty() {
            with_f2p += 1;
        }
        if !result.pass_to_pass.is_empty() {
            with_p2p += 1;
        }
        regressions += result.regressions.len();
        both_failed += result.both_failed.len();
    }

    let rule = "=".repeat(72);
    writeln!(out, "\n{}\nCOLLECTION SUMMARY\n{}\n", rule, rule)?;
    writeln!(out, "Total instances with results:     {}\n", total)?;
    writeln!(out, "Status breakdown:")?;
    for (status, count) in statuses.iter() {
        writeln!(
            out,
            "  {:<15} {:>5}  ({:.1}%)",
            status,
            count,
            percent(*count, total)
        )?;
    }

    let sets = [
        ("FAIL_TO_PASS", "F2P", f2p, with_f2p),
        ("PASS_TO_PASS", "P2P", p2p, with_p2p),
    ];
    for (label, short, transitions, instances) in sets.iter() {
        writeln!(out, "\n{}:", label)?;
        writeln!(out, "  Total test transitions:         {}", transitions)?;
        writeln!(
            out,
            "  Instances with >= 1 {}:        {} / {}  ({:.1}%)",
            short,
            instances,
            total,
            percent(*instances, total)
        )?;
    }
    writeln!(out)?;

    if regressions > 0 {
        writeln!(
            out,
            "WARNING: {} regressions detected (tests that passed before the fix but failed after)",
            regressions
        )?;
    }
    if both_failed > 0 {
        writeln!(
            out,
            "NOTE: {} tests failed in BOTH phases (potential environment issues)",
            both_failed
        )?;
    }

    writeln!(
        out,
        "\n{:<50} {:>6} {:>6} {:>6} {:>6} {:>8}",
        "Instance", "F2P", "P2P", "Regr", "BothF", "Status"
    )?;
    let thin = "-".repeat(88);
    writeln!(out, "{}", thin)?;
    for (id, result) in results.iter() {
        writeln!(
            out,
            "{:<50} {:>6} {:>6} {:>6} {:>6} {:>8}",
            id.chars().take(50).collect::<String>(),
            result.fail_to_pass.len(),
            result.pass_to_pass.len(),
            result.regressions.len(),
            result.both_failed.len(),
            result.status.as_str()
        )?;
    }
    writeln!(out, "{}", thin)?;
    writeln!(
        out,
        "{:<50} {:>6} {:>6} {:>6} {:>6}",
        "TOTAL", f2p, p2p, regressions, both_failed
    )?;
    writeln!(out, "{}", rule)?;

    Ok(())
}

/// Reports dataset entries without results, results without dataset entries, and
/// successful instances that found nothing to fix.
pub fn validate_results(
    out: &mut dyn Write,
    dataset: &[Value],
    results: &Map<String, InstanceResult>,
) -> Result<()> {
    let dataset_ids = dataset
        .iter()
        .filter_map(|entry| entry.get("instance_id").and_then(Value::as_str))
        .collect::<Set<_>>();
    let result_ids = results.keys().map(String::as_str).collect::<Set<_>>();

    let missing = dataset_ids.difference(&result_ids).collect::<Vec<_>>();
    if !missing.is_empty() {
        writeln!(
            out,
            "\nWARNING: {} instance(s) in dataset have no results:",
            missing.len()
        )?;
        write_ids(out, &missing, 20)?;
    }

    let extra = result_ids.difference(&dataset_ids).collect::<Vec<_>>();
    if !extra.is_empty() {
        writeln!(out, "\nWARNING: {} result(s) not found in dataset:", extra.len())?;
        write_ids(out, &extra, 10)?;
    }

    let no_f2p = results
        .iter()
        .filter(|(_, result)| result.status == Status::Success && result.fail_to_pass.is_empty())
        .map(|(id, _)| id.as_str())
        .collect::<Vec<_>>();
    if !no_f2p.is_empty() {
        writeln!(
            out,
            "\nNOTE: {} successful instance(s) have ZERO FAIL_TO_PASS tests:",
            no_f2p.len()
        )?;
        write_ids(out, &no_f2p.iter().collect::<Vec<_>>(), 10)?;
        writeln!(out, "  These may have tests that do not exercise the bug,")?;
        writeln!(out, "  or the test setup failed silently.")?;
    }

    Ok(())
}

fn write_ids(out: &mut dyn Write, ids: &[&&str], limit: usize) -> Result<()> {
    for id in ids.iter().take(limit) {
        writeln!(out, "  - {}", id)?;
    }
    if ids.len() > limit {
        writeln!(out, "  ... and {} more", ids.len() - limit)?;
    }
    Ok(())
}
