//! Row/column addressable view over a delimited experiment log.
//!
//! Cells are kept as the raw strings found in the file; numeric
//! interpretation happens only where an operation needs it (`arg_max`,
//! `sorted_by`). Every row remembers its position in the loaded file so
//! selections can be reported against the original data.

use crate::error::{PipelineError, Result};
use crate::fs::atomic_write_bytes;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    index: usize,
    cells: Vec<String>,
}

impl Row {
    /// Position of this row in the originally loaded file (0-based, header excluded).
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// Borrowed view of one row with named access to its cells.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    row: &'a Row,
}

impl<'a> RowRef<'a> {
    pub fn index(&self) -> usize {
        self.row.index
    }

    pub fn get(&self, column: &str) -> Option<&'a str> {
        let pos = self.columns.iter().position(|c| c == column)?;
        self.row.cells.get(pos).map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.row.cells.iter().map(String::as_str))
    }
}

/// Rows sharing one value of the grouping column.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: String,
    pub rows: Dataset,
}

impl Dataset {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(index, cells)| Row { index, cells })
            .collect();
        Self { columns, rows }
    }

    /// Load a comma-separated file with a header row.
    ///
    /// `required` columns must all be present; ragged rows, duplicated
    /// headers and unreadable files are rejected.
    pub fn load(path: &Path, required: &[&str]) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| PipelineError::DatasetLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_reader(file, path, required)
    }

    pub fn from_reader<R: Read>(reader: R, origin: &Path, required: &[&str]) -> Result<Self> {
        let load_err = |reason: String| PipelineError::DatasetLoad {
            path: origin.to_path_buf(),
            reason,
        };
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(reader);

        let columns: Vec<String> = rdr
            .headers()
            .map_err(|e| load_err(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();
        if columns.is_empty() {
            return Err(load_err("missing header row".to_string()));
        }
        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.as_str()) {
                return Err(load_err(format!("duplicate column '{}'", c)));
            }
        }
        for req in required {
            if !seen.contains(req) {
                return Err(load_err(format!("required column '{}' is absent", req)));
            }
        }

        let mut rows = Vec::new();
        for (index, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| load_err(format!("row {}: {}", index + 1, e)))?;
            rows.push(Row {
                index,
                cells: record.iter().map(str::to_string).collect(),
            });
        }
        tracing::debug!(
            path = %origin.display(),
            rows = rows.len(),
            columns = columns.len(),
            "loaded dataset"
        );
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn column_index(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| PipelineError::column_not_found(column))
    }

    /// Fail with `ColumnNotFound` on the first absent column.
    pub fn require(&self, columns: &[&str]) -> Result<()> {
        for c in columns {
            self.column_index(c)?;
        }
        Ok(())
    }

    pub fn rows(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(move |row| RowRef {
            columns: &self.columns,
            row,
        })
    }

    pub fn indices(&self) -> Vec<usize> {
        self.rows.iter().map(|r| r.index).collect()
    }

    /// Rows whose `column` cell satisfies `predicate`, order preserved.
    pub fn filter<F>(&self, column: &str, predicate: F) -> Result<Self>
    where
        F: Fn(&str) -> bool,
    {
        let pos = self.column_index(column)?;
        let rows = self
            .rows
            .iter()
            .filter(|r| predicate(&r.cells[pos]))
            .cloned()
            .collect();
        Ok(Self {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// Partition rows by equality of `column`, groups in first-appearance order.
    pub fn group_by(&self, column: &str) -> Result<Vec<Group>> {
        let pos = self.column_index(column)?;
        let mut slots: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();
        for row in &self.rows {
            let key = row.cells[pos].as_str();
            let slot = *slots.entry(key).or_insert_with(|| {
                groups.push(Group {
                    key: key.to_string(),
                    rows: Self {
                        columns: self.columns.clone(),
                        rows: Vec::new(),
                    },
                });
                groups.len() - 1
            });
            groups[slot].rows.rows.push(row.clone());
        }
        Ok(groups)
    }

    /// Original index of the row holding the maximum numeric value of `column`.
    ///
    /// Empty and non-numeric cells (including `nan`) are skipped. Ties keep the
    /// earliest row.
    pub fn arg_max(&self, column: &str) -> Result<usize> {
        let pos = self.column_index(column)?;
        let mut best: Option<(usize, f64)> = None;
        for row in &self.rows {
            let Some(value) = parse_numeric(&row.cells[pos]) else {
                continue;
            };
            match best {
                Some((_, current)) if value <= current => {}
                _ => best = Some((row.index, value)),
            }
        }
        best.map(|(index, _)| index)
            .ok_or_else(|| PipelineError::EmptyGroup {
                group: self.describe_group(),
                column: column.to_string(),
            })
    }

    fn describe_group(&self) -> String {
        if self.rows.is_empty() {
            "<empty>".to_string()
        } else {
            format!("rows {:?}", self.indices())
        }
    }

    /// Column-restricted copy, columns in the requested order.
    pub fn project<S: AsRef<str>>(&self, columns: &[S]) -> Result<Self> {
        let positions = columns
            .iter()
            .map(|c| self.column_index(c.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let rows = self
            .rows
            .iter()
            .map(|r| Row {
                index: r.index,
                cells: positions.iter().map(|&p| r.cells[p].clone()).collect(),
            })
            .collect();
        Ok(Self {
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            rows,
        })
    }

    /// Rows with the given original indices, in the order given. Unknown
    /// indices are ignored.
    pub fn select(&self, indices: &[usize]) -> Self {
        let by_index: HashMap<usize, &Row> = self.rows.iter().map(|r| (r.index, r)).collect();
        let rows = indices
            .iter()
            .filter_map(|i| by_index.get(i).map(|r| (*r).clone()))
            .collect();
        Self {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Stable ascending sort on `column`: numbers first in numeric order, then
    /// the remaining cells lexically.
    pub fn sorted_by(&self, column: &str) -> Result<Self> {
        let pos = self.column_index(column)?;
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| compare_cells(&a.cells[pos], &b.cells[pos]));
        Ok(Self {
            columns: self.columns.clone(),
            rows,
        })
    }

    pub fn to_csv_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(&row.cells)?;
        }
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let bytes = self.to_csv_bytes().map_err(|source| PipelineError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        atomic_write_bytes(path, &bytes)
    }

    /// Fixed-width text table with the original row index in the first column.
    pub fn render_table(&self) -> String {
        let index_cells: Vec<String> = self.rows.iter().map(|r| r.index.to_string()).collect();
        let index_width = index_cells.iter().map(String::len).max().unwrap_or(0);
        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                self.rows
                    .iter()
                    .map(|r| r.cells[i].chars().count())
                    .chain(std::iter::once(c.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut out = String::new();
        out.push_str(&" ".repeat(index_width));
        for (c, w) in self.columns.iter().zip(&widths) {
            out.push_str(&format!("  {:>w$}", c, w = *w));
        }
        out.push('\n');
        for (row, idx) in self.rows.iter().zip(&index_cells) {
            out.push_str(&format!("{:<w$}", idx, w = index_width));
            for (cell, w) in row.cells.iter().zip(&widths) {
                out.push_str(&format!("  {:>w$}", cell, w = *w));
            }
            out.push('\n');
        }
        out
    }
}

pub fn parse_numeric(cell: &str) -> Option<f64> {
    let value = cell.trim().parse::<f64>().ok()?;
    if value.is_nan() {
        None
    } else {
        Some(value)
    }
}

fn compare_cells(a: &str, b: &str) -> Ordering {
    match (parse_numeric(a), parse_numeric(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}
