use bestrun_core::{Dataset, Group, PipelineError, Result};

/// Column that holds the artifact path prefix; the tag filter always applies here.
pub const FN_PREFIX_COLUMN: &str = "fn_prefix";
pub const RUN_ID_COLUMN: &str = "Run ID";

#[derive(Debug, Clone)]
pub struct SelectionSpec {
    pub group_column: String,
    pub metric_column: String,
    /// Sort key for the per-group diagnostic tables only.
    pub display_column: Option<String>,
    pub report_columns: Vec<String>,
    pub export_columns: Vec<String>,
    /// Keep only rows whose `fn_prefix` contains this tag.
    pub prefix_tag: Option<String>,
}

impl SelectionSpec {
    fn required_columns(&self) -> Vec<&str> {
        let mut cols = vec![self.group_column.as_str(), self.metric_column.as_str()];
        if let Some(d) = &self.display_column {
            cols.push(d);
        }
        if self.prefix_tag.is_some() {
            cols.push(FN_PREFIX_COLUMN);
        }
        cols.extend(self.report_columns.iter().map(String::as_str));
        cols.extend(self.export_columns.iter().map(String::as_str));
        cols
    }
}

/// Receives the per-group tables produced while selecting.
pub trait DiagnosticSink {
    fn on_group(&mut self, key: &str, table: &Dataset, winner: usize);
}

#[derive(Debug, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn on_group(&mut self, _key: &str, _table: &Dataset, _winner: usize) {}
}

/// Logs each group table at `debug`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn on_group(&mut self, key: &str, table: &Dataset, winner: usize) {
        tracing::debug!(group = key, winner, "\n{}", table.render_table());
    }
}

#[derive(Debug, Clone)]
pub struct Selection {
    /// Full winner rows, one per group, in group first-appearance order.
    pub winners: Dataset,
    /// `winners` projected onto the export columns.
    pub summary: Dataset,
    /// Sorted per-group tables followed by the summary.
    pub report: String,
}

/// Check every column `spec` names, then apply the `fn_prefix` tag filter.
pub fn filter_by_tag(dataset: &Dataset, spec: &SelectionSpec) -> Result<Dataset> {
    dataset.require(&spec.required_columns())?;

    let filtered = match &spec.prefix_tag {
        Some(tag) => dataset.filter(FN_PREFIX_COLUMN, |p| p.contains(tag.as_str()))?,
        None => dataset.clone(),
    };
    if filtered.is_empty() {
        return Err(PipelineError::EmptyDataset {
            tag: spec.prefix_tag.clone(),
        });
    }
    tracing::info!(
        rows = filtered.len(),
        dropped = dataset.len() - filtered.len(),
        "filtered dataset"
    );
    Ok(filtered)
}

/// Arg-max of the metric in each group, plus the report and export projection.
pub fn pick_winners(
    filtered: &Dataset,
    groups: &[Group],
    spec: &SelectionSpec,
    sink: &mut dyn DiagnosticSink,
) -> Result<Selection> {
    let mut report = String::new();
    let mut best = Vec::with_capacity(groups.len());
    for group in groups {
        let winner = group.rows.arg_max(&spec.metric_column).map_err(|e| match e {
            PipelineError::EmptyGroup { column, .. } => PipelineError::EmptyGroup {
                group: group.key.clone(),
                column,
            },
            other => other,
        })?;

        let shown = match &spec.display_column {
            Some(col) => group.rows.sorted_by(col)?,
            None => group.rows.clone(),
        };
        let shown = if spec.report_columns.is_empty() {
            shown
        } else {
            shown.project(&spec.report_columns)?
        };
        sink.on_group(&group.key, &shown, winner);
        report.push_str(&format!("[{}] {} = {}\n", winner, spec.group_column, group.key));
        report.push_str(&shown.render_table());
        report.push('\n');

        best.push(winner);
    }

    let winners = filtered.select(&best);
    let summary = winners.project(&spec.export_columns)?;
    report.push_str(&summary.render_table());
    tracing::info!(winners = ?best, "selected best runs");

    Ok(Selection {
        winners,
        summary,
        report,
    })
}

pub fn select_best(
    dataset: &Dataset,
    spec: &SelectionSpec,
    sink: &mut dyn DiagnosticSink,
) -> Result<Selection> {
    let filtered = filter_by_tag(dataset, spec)?;
    let groups = filtered.group_by(&spec.group_column)?;
    tracing::info!(groups = groups.len(), column = %spec.group_column, "grouped dataset");
    pick_winners(&filtered, &groups, spec, sink)
}

/// `best-<file name>` in the same directory as `input`.
pub fn summary_path(input: &std::path::Path) -> std::path::PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "runs.csv".to_string());
    input.with_file_name(format!("best-{}", name))
}
