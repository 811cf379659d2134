//! Output sinks and the tabular interchange format.
//!
//! The engine is sink-agnostic: it pushes a names header, draw columns, and
//! string footer lines through the `OutputWriter` trait and never formats
//! files itself. `CsvWriter` is the bundled sink for the comma-separated
//! interchange format: `#`-prefixed key=value metadata, one header row, one
//! row per draw, optional `#`-prefixed adaptation records, and `#`-prefixed
//! footer lines.

use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Column-oriented sink for engine output. One draw per column; the header
/// is sent once before any data.
pub trait OutputWriter {
    fn names(&mut self, _names: &[String]) {}
    fn column(&mut self, _values: &ArrayView1<'_, f64>) {}
    fn matrix(&mut self, _values: &ArrayView2<'_, f64>) {}
    fn blank(&mut self) {}
    fn note(&mut self, _line: &str) {}
}

/// Sink that drops everything.
pub struct NullWriter;

impl OutputWriter for NullWriter {}

/// Sink that buffers draws in memory; useful for tests and embedding.
#[derive(Default)]
pub struct VecWriter {
    pub names: Vec<String>,
    pub columns: Vec<Array1<f64>>,
    pub notes: Vec<String>,
}

impl OutputWriter for VecWriter {
    fn names(&mut self, names: &[String]) {
        self.names = names.to_vec();
    }

    fn column(&mut self, values: &ArrayView1<'_, f64>) {
        self.columns.push(values.to_owned());
    }

    fn matrix(&mut self, values: &ArrayView2<'_, f64>) {
        for col in values.columns() {
            self.columns.push(col.to_owned());
        }
    }

    fn note(&mut self, line: &str) {
        self.notes.push(line.to_string());
    }
}

/// Run header of the interchange format, emitted as `#`-prefixed key=value
/// lines in the fixed order the downstream reader expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterchangeMetadata {
    pub version_major: i32,
    pub version_minor: i32,
    pub version_patch: i32,
    pub model: String,
    pub data_file: String,
    pub num_samples: u64,
    pub num_warmup: u64,
    pub save_warmup: bool,
    pub thin: u64,
    pub chain_id: u64,
    pub seed: u64,
    pub init: String,
    pub algorithm: String,
    pub engine: String,
    pub max_depth: u64,
    pub append_samples: bool,
}

/// Comma-separated sink writing the interchange grammar.
pub struct CsvWriter<W: Write> {
    out: W,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write_line(&mut self, line: &str) {
        if writeln!(self.out, "{line}").is_err() {
            log::warn!("output sink rejected a line; dropping it");
        }
    }

    /// Emit the metadata block. Keys and nesting follow the reader's
    /// grammar exactly.
    pub fn metadata(&mut self, meta: &InterchangeMetadata) {
        self.write_line(&format!("# stan_version_major = {}", meta.version_major));
        self.write_line(&format!("# stan_version_minor = {}", meta.version_minor));
        self.write_line(&format!("# stan_version_patch = {}", meta.version_patch));
        self.write_line(&format!("# model = {}", meta.model));
        self.write_line("# data");
        self.write_line(&format!("#    file = {}", meta.data_file));
        self.write_line(&format!("# num_samples = {}", meta.num_samples));
        self.write_line(&format!("# num_warmup = {}", meta.num_warmup));
        self.write_line(&format!("# save_warmup = {}", u8::from(meta.save_warmup)));
        self.write_line(&format!("# thin = {}", meta.thin));
        self.write_line(&format!("# id = {}", meta.chain_id));
        self.write_line(&format!("# seed = {}", meta.seed));
        self.write_line(&format!("# init = {}", meta.init));
        self.write_line(&format!("# algorithm = {}", meta.algorithm));
        self.write_line(&format!("# engine = {}", meta.engine));
        self.write_line(&format!("# max_depth = {}", meta.max_depth));
        self.write_line(&format!("# append_samples = {}", u8::from(meta.append_samples)));
    }

    /// Emit an adaptation record: step size plus a square metric matrix.
    pub fn adaptation(&mut self, step_size: f64, metric: &ArrayView2<'_, f64>) {
        self.write_line("# Adaptation terminated");
        self.write_line(&format!("# Step size = {step_size}"));
        self.write_line("# Elements of inverse mass matrix:");
        for row in metric.rows() {
            let joined = row
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.write_line(&format!("# {joined}"));
        }
    }

    fn write_row(&mut self, values: &ArrayView1<'_, f64>) {
        let joined = values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.write_line(&joined);
    }
}

impl<W: Write> OutputWriter for CsvWriter<W> {
    fn names(&mut self, names: &[String]) {
        self.write_line(&names.join(","));
    }

    fn column(&mut self, values: &ArrayView1<'_, f64>) {
        self.write_row(values);
    }

    fn matrix(&mut self, values: &ArrayView2<'_, f64>) {
        for col in values.columns() {
            self.write_row(&col);
        }
    }

    fn blank(&mut self) {
        self.write_line("#");
    }

    fn note(&mut self, line: &str) {
        self.write_line(&format!("# {line}"));
    }
}

/// Pretty-print a flattened variable name.
///
/// Each colon-separated segment carries dot-separated indices: the first dot
/// opens a bracket, the remaining dots become commas, and segments are
/// rejoined with dots, so `a.1.2:b.3` becomes `a[1,2].b[3]`.
pub fn prettify_name(name: &str) -> String {
    if !name.contains(':') && !name.contains('.') {
        return name.to_string();
    }
    name.split(':')
        .map(|part| match part.find('.') {
            Some(pos) if pos > 0 => {
                let (head, tail) = part.split_at(pos);
                format!("{head}[{}]", tail[1..].replace('.', ","))
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(".")
}
