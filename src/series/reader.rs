use crate::error::{PipelineError, PipelineResult};
use crate::series::record::{SeriesNames, TimeSeriesRecord};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Sequential reader over one plain-text time-series file.
///
/// Layout:
/// ```text
/// <tag> <columns> <tag> <rows>
/// <blank>
/// time <name1> ... <nameK>          K = columns - 1
/// <t> <v1> ... <vK>                 repeated `rows` times
/// ```
/// Blank lines between the header and the names line are skipped.
///
/// The reader owns its input exclusively and is deliberately not `Clone`.
pub struct TimeSeriesReader<R = BufReader<File>> {
    label: String,
    input: R,
    line_no: usize,
    buf: String,
    names: SeriesNames,
    total_steps: usize,
    step: usize,
    current: TimeSeriesRecord,
    failed: bool,
}

impl TimeSeriesReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            PipelineError::format(path.display(), 0, format!("could not be opened: {e}"))
        })?;
        Self::from_reader(path.display().to_string(), BufReader::new(file))
    }
}

impl<R: BufRead> TimeSeriesReader<R> {
    /// Parses the header from `input`. `label` names the input in errors.
    pub fn from_reader(label: impl Into<String>, input: R) -> PipelineResult<Self> {
        let mut reader = Self {
            label: label.into(),
            input,
            line_no: 0,
            buf: String::new(),
            names: SeriesNames::from(Vec::new()),
            total_steps: 0,
            step: 0,
            current: TimeSeriesRecord::from_parts(0.0, SeriesNames::from(Vec::new()), Vec::new()),
            failed: false,
        };

        let (columns, rows) = reader.read_header()?;
        let names = reader.read_names(columns)?;
        let width = names.len();

        reader.total_steps = rows;
        reader.current = TimeSeriesRecord::from_parts(0.0, names.clone(), vec![0.0; width]);
        reader.names = names;

        tracing::debug!(
            "[Reader] {}: {} series, {} rows",
            reader.label,
            width,
            reader.total_steps
        );
        Ok(reader)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Series names without the leading time column.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Rows consumed so far.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn has_next(&self) -> bool {
        self.step < self.total_steps
    }

    /// Parses the next row. On failure the step counter and the current
    /// record are left untouched.
    pub fn read_next(&mut self) -> PipelineResult<TimeSeriesRecord> {
        if !self.has_next() {
            return Err(self.error(format!(
                "no rows left: header declares {} rows",
                self.total_steps
            )));
        }

        if !self.next_line()? {
            return Err(self.error(format!(
                "unexpected end of file after {} of {} rows",
                self.step, self.total_steps
            )));
        }

        let mut tokens = self.buf.split_whitespace();
        let time = match tokens.next() {
            Some(tok) => self.parse_number(tok, "time")?,
            None => return Err(self.error("empty data row")),
        };

        let mut values = Vec::with_capacity(self.names.len());
        for tok in tokens {
            values.push(self.parse_number(tok, "value")?);
        }

        if values.len() != self.names.len() {
            return Err(self.error(format!(
                "row {} has {} values, {} series declared",
                self.step,
                values.len(),
                self.names.len()
            )));
        }

        let record = TimeSeriesRecord::from_parts(time, self.names.clone(), values);
        self.current = record.clone();
        self.step += 1;
        Ok(record)
    }

    /// Time of the last parsed row, 0 before the first read.
    pub fn current_time(&self) -> f64 {
        self.current.time()
    }

    /// Values of the last parsed row, zeros before the first read.
    pub fn current_values(&self) -> &[f64] {
        self.current.values()
    }

    pub fn current_record(&self) -> &TimeSeriesRecord {
        &self.current
    }

    fn read_header(&mut self) -> PipelineResult<(usize, usize)> {
        if !self.next_line()? {
            return Err(self.error("missing header line"));
        }

        let tokens: Vec<&str> = self.buf.split_whitespace().collect();
        if tokens.len() < 4 {
            return Err(self.error(format!(
                "header needs '<tag> <columns> <tag> <rows>', got '{}'",
                self.buf.trim()
            )));
        }

        let columns = self.parse_count(tokens[1], "column count")?;
        let rows = self.parse_count(tokens[3], "row count")?;
        if columns == 0 {
            return Err(self.error("column count must include the time column"));
        }
        Ok((columns, rows))
    }

    fn read_names(&mut self, columns: usize) -> PipelineResult<SeriesNames> {
        loop {
            if !self.next_line()? {
                return Err(self.error("missing column names line"));
            }
            if !self.buf.trim().is_empty() {
                break;
            }
        }

        // first column is the time column
        let names: Vec<String> = self
            .buf
            .split_whitespace()
            .skip(1)
            .map(str::to_string)
            .collect();

        if names.len() != columns - 1 {
            return Err(self.error(format!(
                "{} series declared in header, {} names found",
                columns - 1,
                names.len()
            )));
        }
        Ok(names.into())
    }

    /// Reads one line into `buf`. Returns false at end of input.
    fn next_line(&mut self) -> PipelineResult<bool> {
        self.buf.clear();
        let n = self
            .input
            .read_line(&mut self.buf)
            .map_err(|e| self.error(format!("read failed: {e}")))?;
        if n == 0 {
            return Ok(false);
        }
        self.line_no += 1;
        Ok(true)
    }

    fn parse_number(&self, tok: &str, what: &str) -> PipelineResult<f64> {
        tok.parse::<f64>()
            .map_err(|_| self.error(format!("invalid {what} '{tok}'")))
    }

    fn parse_count(&self, tok: &str, what: &str) -> PipelineResult<usize> {
        tok.parse::<usize>()
            .map_err(|_| self.error(format!("invalid {what} '{tok}'")))
    }

    fn error(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::format(&self.label, self.line_no, message)
    }
}

/// Yields remaining rows; stops for good after the first error.
impl<R: BufRead> Iterator for TimeSeriesReader<R> {
    type Item = PipelineResult<TimeSeriesRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.has_next() {
            return None;
        }
        let res = self.read_next();
        self.failed = res.is_err();
        Some(res)
    }
}
