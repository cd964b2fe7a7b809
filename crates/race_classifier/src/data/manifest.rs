//! CSV manifest parsing

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Class names of the RFW race split, in label order.
pub const RFW_RACES: [&str; 4] = ["African", "Asian", "Caucasian", "Indian"];

const PATH_COLUMNS: [&str; 4] = ["image", "path", "file", "filename"];
const LABEL_COLUMNS: [&str; 3] = ["label", "race", "class"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: u32,
}

/// Column overrides; `None` falls back to the usual header names.
#[derive(Debug, Clone, Default)]
pub struct ManifestColumns {
    pub path: Option<String>,
    pub label: Option<String>,
}

fn find_column(headers: &csv::StringRecord, wanted: Option<&str>, fallbacks: &[&str]) -> Option<usize> {
    let matches = |h: &str, name: &str| h.trim().eq_ignore_ascii_case(name);
    match wanted {
        Some(name) => headers.iter().position(|h| matches(h, name)),
        None => fallbacks
            .iter()
            .find_map(|name| headers.iter().position(|h| matches(h, name))),
    }
}

/// Accepts an integer class index or an RFW race name.
pub fn parse_label(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    if let Ok(idx) = raw.parse::<u32>() {
        return Ok(idx);
    }
    RFW_RACES
        .iter()
        .position(|r| r.eq_ignore_ascii_case(raw))
        .map(|idx| idx as u32)
        .ok_or_else(|| anyhow::anyhow!("Unknown label '{}'", raw))
}

/// Reads a manifest with a header row; relative image paths are joined onto `data_root`.
pub fn read_manifest(
    csv_path: &Path,
    data_root: &Path,
    columns: &ManifestColumns,
    num_classes: usize,
) -> Result<Vec<Sample>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open manifest {:?}", csv_path))?;

    let headers = reader.headers()?.clone();
    let path_col = find_column(&headers, columns.path.as_deref(), &PATH_COLUMNS)
        .ok_or_else(|| anyhow::anyhow!("No image path column in {:?} (headers: {:?})", csv_path, headers))?;
    let label_col = find_column(&headers, columns.label.as_deref(), &LABEL_COLUMNS)
        .ok_or_else(|| anyhow::anyhow!("No label column in {:?} (headers: {:?})", csv_path, headers))?;

    let mut samples = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("{:?}: bad record at row {}", csv_path, row + 1))?;
        let rel = record
            .get(path_col)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("{:?}: missing image path at row {}", csv_path, row + 1))?;
        let raw_label = record.get(label_col).unwrap_or_default();
        let label = parse_label(raw_label)
            .with_context(|| format!("{:?}: row {}", csv_path, row + 1))?;
        if label as usize >= num_classes {
            anyhow::bail!(
                "{:?}: label {} at row {} is out of range for {} classes",
                csv_path,
                label,
                row + 1,
                num_classes
            );
        }
        samples.push(Sample {
            path: data_root.join(rel),
            label,
        });
    }

    tracing::info!("Manifest {:?}: {} samples", csv_path, samples.len());
    Ok(samples)
}
