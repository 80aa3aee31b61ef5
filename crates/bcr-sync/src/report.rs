use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use bcr_core::{CanonicalContact, Classification, ClassifiedContact, ComparisonRun, RunResults};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::index::{SourceOutcome, SourceReport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn outcome_label(outcome: &SourceOutcome) -> String {
    match outcome {
        SourceOutcome::Exhausted => "exhausted".to_string(),
        SourceOutcome::Capped => "capped".to_string(),
        SourceOutcome::PageFailed { page, error } => format!("page {page} failed: {error}"),
        SourceOutcome::Deferred => "per-email search".to_string(),
    }
}

fn summary_markdown(run: &ComparisonRun, results: &RunResults, sources: &[SourceReport]) -> String {
    let c = &run.counters;
    let mut lines = vec![
        format!("# Reconciliation `{}`", run.name),
        String::new(),
        format!("- Run ID: `{}`", run.id),
        format!("- Source file: `{}`", run.source_file),
        format!("- Status: {}", run.status.as_str()),
        format!("- Contacts in export: {}", c.total_local),
        format!("- Customers indexed: {}", c.total_remote),
        format!("- In canonical source: {}", c.found),
        format!("- In another source only: {}", c.found_elsewhere),
        format!("- Missing: {}", c.missing),
        format!("- Sync: {:.2}%", run.sync_percentage),
        String::new(),
        "## Sources".to_string(),
    ];
    for s in sources {
        lines.push(format!(
            "- {} ({}): {} customers ({} without email) over {} pages, {}",
            s.source_id,
            s.provider,
            s.customers,
            s.without_email,
            s.pages,
            outcome_label(&s.outcome)
        ));
    }
    if !results.found_elsewhere.is_empty() {
        lines.push(String::new());
        lines.push("## Needs manual reconciliation".to_string());
        for item in &results.found_elsewhere {
            lines.push(format!("- {}: {}", item.contact.email, source_ids(&item.classification)));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

fn source_ids(classification: &Classification) -> String {
    match classification {
        Classification::InOtherSource { sources } => sources
            .iter()
            .map(|p| p.source_id.as_str())
            .collect::<Vec<_>>()
            .join(","),
        _ => String::new(),
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_missing_users_parquet(path: &Path, missing: &[CanonicalContact]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("email", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, true),
        ArrowField::new("tags", DataType::Utf8, true),
        ArrowField::new("created_on", DataType::Utf8, true),
    ]));

    let emails = StringArray::from(missing.iter().map(|c| Some(c.email.as_str())).collect::<Vec<_>>());
    let names = StringArray::from(missing.iter().map(|c| Some(c.name.as_str())).collect::<Vec<_>>());
    let companies = StringArray::from(missing.iter().map(|c| c.company.as_deref()).collect::<Vec<_>>());
    let tags = StringArray::from(missing.iter().map(|c| c.tags.as_deref()).collect::<Vec<_>>());
    let created = StringArray::from(
        missing
            .iter()
            .map(|c| c.created_on.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(emails),
            Arc::new(names),
            Arc::new(companies),
            Arc::new(tags),
            Arc::new(created),
        ],
    )
    .context("building missing_users record batch")?;
    write_parquet(path, batch)
}

fn write_classifications_parquet(path: &Path, results: &RunResults) -> Result<()> {
    let mut rows: Vec<(&str, &str, bool, String, u32)> = Vec::new();
    let classified = results.found.iter().chain(&results.found_elsewhere);
    for ClassifiedContact { contact, classification } in classified {
        let (label, in_canonical, count) = match classification {
            Classification::InManualSource { .. } => ("in_manual_source", true, 1),
            Classification::InOtherSource { sources } => ("in_other_source", false, sources.len() as u32),
            Classification::Missing => ("missing", false, 0),
        };
        rows.push((contact.email.as_str(), label, in_canonical, source_ids(classification), count));
    }
    for contact in &results.missing {
        rows.push((contact.email.as_str(), "missing", false, String::new(), 0));
    }

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("email", DataType::Utf8, false),
        ArrowField::new("classification", DataType::Utf8, false),
        ArrowField::new("in_canonical_source", DataType::Boolean, false),
        ArrowField::new("other_sources", DataType::Utf8, false),
        ArrowField::new("source_count", DataType::UInt32, false),
    ]));
    let emails = StringArray::from(rows.iter().map(|r| Some(r.0)).collect::<Vec<_>>());
    let labels = StringArray::from(rows.iter().map(|r| Some(r.1)).collect::<Vec<_>>());
    let canonical = BooleanArray::from(rows.iter().map(|r| r.2).collect::<Vec<_>>());
    let others = StringArray::from(rows.iter().map(|r| Some(r.3.as_str())).collect::<Vec<_>>());
    let counts = UInt32Array::from(rows.iter().map(|r| r.4).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(emails),
            Arc::new(labels),
            Arc::new(canonical),
            Arc::new(others),
            Arc::new(counts),
        ],
    )
    .context("building classifications record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Write `<reports_root>/<run_id>/` with the summary, full results and Parquet snapshots.
pub async fn write_run_report(
    reports_root: &Path,
    run: &ComparisonRun,
    results: &RunResults,
    sources: &[SourceReport],
) -> Result<PathBuf> {
    let run_dir = reports_root.join(run.id.to_string());
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    fs::write(run_dir.join("summary.md"), summary_markdown(run, results, sources))
        .await
        .context("writing summary.md")?;

    let results_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": run,
        "results": results,
    }))
    .context("serializing run results")?;
    fs::write(run_dir.join("results.json"), results_json)
        .await
        .context("writing results.json")?;

    let missing_path = snapshot_dir.join("missing_users.parquet");
    let classifications_path = snapshot_dir.join("classifications.parquet");
    write_missing_users_parquet(&missing_path, &results.missing)?;
    write_classifications_parquet(&classifications_path, results)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("missing_users", &run_dir, &missing_path)?,
            manifest_entry("classifications", &run_dir, &classifications_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(run_dir)
}
