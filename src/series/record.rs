use crate::error::{PipelineError, PipelineResult};
use std::sync::Arc;

/// Ordered series names shared by every record of one source.
pub type SeriesNames = Arc<[String]>;

/// One timestamped row of named values. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesRecord {
    time: f64,
    names: SeriesNames,
    values: Vec<f64>,
}

impl TimeSeriesRecord {
    /// Fails with [`PipelineError::RecordWidth`] unless `values` lines up with `names`.
    pub fn new(time: f64, names: SeriesNames, values: Vec<f64>) -> PipelineResult<Self> {
        if names.len() != values.len() {
            return Err(PipelineError::RecordWidth {
                names: names.len(),
                values: values.len(),
            });
        }
        Ok(Self::from_parts(time, names, values))
    }

    /// Caller guarantees the widths match.
    pub(crate) fn from_parts(time: f64, names: SeriesNames, values: Vec<f64>) -> Self {
        debug_assert_eq!(names.len(), values.len(), "record width mismatch");
        Self {
            time,
            names,
            values,
        }
    }

    /// Builds a record from owned names; used where no shared name list exists yet.
    pub fn from_pairs<N: Into<String>>(
        time: f64,
        pairs: impl IntoIterator<Item = (N, f64)>,
    ) -> Self {
        let (names, values): (Vec<String>, Vec<f64>) =
            pairs.into_iter().map(|(n, v)| (n.into(), v)).unzip();
        Self::from_parts(time, names.into(), values)
    }

    /// Same names, new time and values.
    pub fn with_values(&self, time: f64, values: Vec<f64>) -> PipelineResult<Self> {
        Self::new(time, self.names.clone(), values)
    }

    #[inline]
    pub fn time(&self) -> f64 {
        self.time
    }

    #[inline]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[inline]
    pub fn shared_names(&self) -> &SeriesNames {
        &self.names
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.index_of(name).and_then(|i| self.values.get(i).copied())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}
