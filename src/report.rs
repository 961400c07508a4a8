#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

//! The weighted report that reduces named partial scores into one grade.
//!
//! A report maps metric names to `(value, weight)` entries. The grade is
//! always derived: entries are reduced to their weighted mean (weights are
//! normalized on a copy when they do not already sum to one), the result is
//! rescaled linearly by a [`GradeScale`], and an optional normalizer is
//! applied last.

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Panel, Style, object::Rows},
};

use crate::{
    constants::{FLOAT_ABS_TOLERANCE, FLOAT_REL_TOLERANCE},
    error::ReportError,
};

/// `kwargs` key holding the lower bound of the raw range.
const GRADE_MIN_KEY: &str = "grade_min";
/// `kwargs` key holding the grade given to a raw score of `grade_min`.
const GRADE_MIN_VALUE_KEY: &str = "grade_min_value";
/// `kwargs` key holding the upper bound of both ranges.
const GRADE_MAX_KEY: &str = "grade_max";

/// Whether `a` and `b` are equal within the report's floating tolerance.
pub fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= FLOAT_ABS_TOLERANCE + FLOAT_REL_TOLERANCE * b.abs()
}

/// One named metric of a report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Score obtained for the metric.
    pub value:  f64,
    /// Relative importance of the metric.
    pub weight: f64,
}

impl Entry {
    /// `value × weight`.
    pub fn weighted(&self) -> f64 {
        self.value * self.weight
    }
}

/// Function applied to the rescaled grade, eg. rounding or clamping.
pub type Normalizer = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Linear map from the raw weighted score onto the final grade range.
///
/// `grade = (max − min_value) × (raw − min) / (max − min) + min_value`, then
/// the normalizer if any.
#[derive(Clone)]
pub struct GradeScale {
    /// Raw score mapped onto `grade_min_value`.
    grade_min:       f64,
    /// Grade given to a raw score of `grade_min`.
    grade_min_value: f64,
    /// Upper bound of both the raw and the final range.
    grade_max:       f64,
    /// Applied to the rescaled grade.
    normalizer:      Option<Normalizer>,
}

impl Default for GradeScale {
    fn default() -> Self {
        Self {
            grade_min:       0.0,
            grade_min_value: 0.0,
            grade_max:       100.0,
            normalizer:      None,
        }
    }
}

impl GradeScale {
    /// Creates a scale, rejecting bounds that would divide by zero or invert
    /// the range.
    pub fn new(grade_min: f64, grade_min_value: f64, grade_max: f64) -> Result<Self> {
        if !(grade_min.is_finite() && grade_max.is_finite() && grade_min_value.is_finite())
            || grade_max <= grade_min
        {
            return Err(ReportError::InvalidScale {
                min: grade_min,
                max: grade_max,
            }
            .into());
        }
        Ok(Self {
            grade_min,
            grade_min_value,
            grade_max,
            normalizer: None,
        })
    }

    /// Returns a copy applying `normalizer` last.
    pub fn with_normalizer(mut self, normalizer: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        self.normalizer = Some(Arc::new(normalizer));
        self
    }

    /// Lower bound of the raw range.
    pub fn grade_min(&self) -> f64 {
        self.grade_min
    }

    /// Grade given to a raw score of `grade_min`.
    pub fn grade_min_value(&self) -> f64 {
        self.grade_min_value
    }

    /// Upper bound of both ranges.
    pub fn grade_max(&self) -> f64 {
        self.grade_max
    }

    /// Maps a raw weighted score to a grade.
    pub fn apply(&self, raw: f64) -> f64 {
        let grade = (self.grade_max - self.grade_min_value) * (raw - self.grade_min)
            / (self.grade_max - self.grade_min)
            + self.grade_min_value;
        match &self.normalizer {
            Some(normalizer) => normalizer(grade),
            None => grade,
        }
    }

    /// Writes the bounds into `kwargs`.
    fn write_kwargs(&self, kwargs: &mut Map<String, Value>) {
        kwargs.insert(GRADE_MIN_KEY.into(), self.grade_min.into());
        kwargs.insert(GRADE_MIN_VALUE_KEY.into(), self.grade_min_value.into());
        kwargs.insert(GRADE_MAX_KEY.into(), self.grade_max.into());
    }

    /// Reads bounds back from `kwargs`; missing keys keep this scale's
    /// values, the normalizer is kept as is.
    fn read_kwargs(&self, kwargs: &Map<String, Value>) -> Result<Self> {
        let read = |key: &str, current: f64| -> Result<f64> {
            match kwargs.get(key) {
                None | Some(Value::Null) => Ok(current),
                Some(value) => value
                    .as_f64()
                    .with_context(|| format!("`{key}` must be a number, got {value}")),
            }
        };
        let scale = GradeScale::new(
            read(GRADE_MIN_KEY, self.grade_min)?,
            read(GRADE_MIN_VALUE_KEY, self.grade_min_value)?,
            read(GRADE_MAX_KEY, self.grade_max)?,
        )?;
        Ok(GradeScale {
            normalizer: self.normalizer.clone(),
            ..scale
        })
    }
}

impl fmt::Debug for GradeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradeScale")
            .field("grade_min", &self.grade_min)
            .field("grade_min_value", &self.grade_min_value)
            .field("grade_max", &self.grade_max)
            .field("normalizer", &self.normalizer.is_some())
            .finish()
    }
}

/// The persisted shape of a [`Report`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDocument {
    /// Grade computed when the document was written.
    pub grade:           f64,
    /// Raw entries.
    pub data:            BTreeMap<String, Entry>,
    /// Where the report lives.
    pub report_filepath: Option<PathBuf>,
    /// Positional construction arguments, kept for compatibility.
    #[serde(default)]
    pub args:            Vec<Value>,
    /// Keyword construction arguments, including the grade scale bounds.
    #[serde(default)]
    pub kwargs:          Map<String, Value>,
}

/// A row of the rendered report table.
#[derive(Tabled)]
struct EntryRow {
    /// Metric name.
    #[tabled(rename = "Metric")]
    metric:   String,
    /// Metric value.
    #[tabled(rename = "Value")]
    value:    String,
    /// Metric weight.
    #[tabled(rename = "Weight")]
    weight:   String,
    /// `value × weight`.
    #[tabled(rename = "Weighted")]
    weighted: String,
}

/// Weighted scoring container.
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// Metric name → entry.
    data:            BTreeMap<String, Entry>,
    /// Where `save` and `load` go by default.
    report_filepath: Option<PathBuf>,
    /// Rescaling applied by `grade`.
    scale:           GradeScale,
    /// Positional construction arguments, persisted untouched.
    args:            Vec<Value>,
    /// Extra keyword construction arguments, persisted untouched.
    kwargs:          Map<String, Value>,
}

impl Report {
    /// An empty report with the default scale (`[0, 100]` onto `[0, 100]`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy saving to and loading from `path` by default.
    pub fn with_filepath(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_filepath = Some(path.into());
        self
    }

    /// Returns a copy using `scale`.
    pub fn with_scale(mut self, scale: GradeScale) -> Self {
        self.scale = scale;
        self
    }

    /// Returns a copy carrying an extra keyword argument in its document.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Default file path, if any.
    pub fn report_filepath(&self) -> Option<&Path> {
        self.report_filepath.as_deref()
    }

    /// Rescaling applied by [`Self::grade`].
    pub fn scale(&self) -> &GradeScale {
        &self.scale
    }

    /// Inserts `name`, replacing any entry with the same name.
    ///
    /// Fails on a negative or non-finite weight.
    pub fn add(&mut self, name: impl Into<String>, value: f64, weight: f64) -> Result<()> {
        let name = name.into();
        if !weight.is_finite() || weight < 0.0 {
            return Err(ReportError::InvalidWeight { name, weight }.into());
        }
        self.data.insert(name, Entry { value, weight });
        Ok(())
    }

    /// Entry for `name`.
    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.data.get(name)
    }

    /// Value for `name`.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name).map(|e| e.value)
    }

    /// Weight for `name`.
    pub fn weight(&self, name: &str) -> Option<f64> {
        self.get(name).map(|e| e.weight)
    }

    /// `value × weight` for `name`.
    pub fn weighted(&self, name: &str) -> Option<f64> {
        self.get(name).map(Entry::weighted)
    }

    /// Metric names, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// Entries, in sorted name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether `name` has an entry.
    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    /// Sum of all weights.
    pub fn weight_sum(&self) -> f64 {
        self.data.values().map(|e| e.weight).sum()
    }

    /// Whether the weights sum to one.
    pub fn is_normalized(&self) -> bool {
        is_close(self.weight_sum(), 1.0)
    }

    /// A copy whose weights are divided by their sum. A report whose weights
    /// sum to zero is copied unchanged.
    pub fn normalized(&self) -> Report {
        let mut copy = self.clone();
        copy.normalize_weights_in_place();
        copy
    }

    /// Divides every weight by the weight sum, in place.
    pub fn normalize_weights_in_place(&mut self) -> &mut Self {
        let total = self.weight_sum();
        if total > 0.0 {
            for entry in self.data.values_mut() {
                entry.weight /= total;
            }
        }
        self
    }

    /// Weighted mean of the values, before rescaling. Zero when there is no
    /// weight at all.
    pub fn raw_score(&self) -> f64 {
        if self.is_normalized() {
            self.data.values().map(Entry::weighted).sum()
        } else {
            self.normalized().data.values().map(Entry::weighted).sum()
        }
    }

    /// The final grade: the rescaled weighted mean. Pure; the stored weights
    /// are never modified.
    pub fn grade(&self) -> f64 {
        self.scale.apply(self.raw_score())
    }

    /// Snapshot of the report, grade included.
    pub fn state(&self) -> ReportDocument {
        let mut kwargs = self.kwargs.clone();
        self.scale.write_kwargs(&mut kwargs);
        ReportDocument {
            grade: self.grade(),
            data: self.data.clone(),
            report_filepath: self.report_filepath.clone(),
            args: self.args.clone(),
            kwargs,
        }
    }

    /// Replaces the report's state with `doc`, checking that the stored grade
    /// matches the one recomputed from the loaded data and scale. The report
    /// is left untouched on failure.
    pub fn set_state(&mut self, doc: ReportDocument) -> Result<()> {
        for (name, entry) in &doc.data {
            if !entry.weight.is_finite() || entry.weight < 0.0 {
                return Err(ReportError::InvalidWeight {
                    name:   name.clone(),
                    weight: entry.weight,
                }
                .into());
            }
        }

        let mut kwargs = doc.kwargs;
        let scale = self.scale.read_kwargs(&kwargs)?;
        for key in [GRADE_MIN_KEY, GRADE_MIN_VALUE_KEY, GRADE_MAX_KEY] {
            kwargs.remove(key);
        }

        let candidate = Report {
            data: doc.data,
            report_filepath: doc.report_filepath.or_else(|| self.report_filepath.clone()),
            scale,
            args: doc.args,
            kwargs,
        };
        let recomputed = candidate.grade();
        if !is_close(recomputed, doc.grade) {
            return Err(ReportError::GradeMismatch {
                stored: doc.grade,
                recomputed,
            }
            .into());
        }

        *self = candidate;
        Ok(())
    }

    /// Writes the report document to `path` (or the configured file path)
    /// and returns where it went. The file is replaced atomically.
    pub fn save(&mut self, path: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = path {
            self.report_filepath = Some(path.to_path_buf());
        }
        let Some(path) = self.report_filepath.clone() else {
            return Err(ReportError::MissingFilepath("saving").into());
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Could not create {}", parent.display()))?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, self.to_json()?)
            .with_context(|| format!("Could not write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Could not move {} to {}", tmp.display(), path.display()))?;

        Ok(path)
    }

    /// Replaces the report's state with the document at `path` (or the
    /// configured file path), which becomes the report's file path. On
    /// failure the report is left untouched, file path included.
    pub fn load(&mut self, path: Option<&Path>) -> Result<&mut Self> {
        let Some(path) = path
            .map(Path::to_path_buf)
            .or_else(|| self.report_filepath.clone())
        else {
            return Err(ReportError::MissingFilepath("loading").into());
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let doc: ReportDocument = serde_json::from_str(&contents)
            .with_context(|| format!("Could not parse the report at {}", path.display()))?;
        self.set_state(doc)
            .with_context(|| format!("Could not load the report at {}", path.display()))?;
        self.report_filepath = Some(path);
        Ok(self)
    }

    /// Reads a report from `path` with the default scale bounds overridden by
    /// the ones stored in the document.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut report = Report::new();
        report.load(Some(path))?;
        Ok(report)
    }

    /// The report document as indented JSON.
    pub fn to_json(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.state()
            .serialize(&mut serializer)
            .context("Could not serialize the report")?;
        String::from_utf8(buf).context("Serialized report is not UTF-8")
    }

    /// The entries as a table, grade in the footer.
    pub fn table(&self) -> String {
        let rows = self
            .iter()
            .map(|(name, entry)| EntryRow {
                metric:   name.to_string(),
                value:    format!("{:.2}", entry.value),
                weight:   format!("{:.2}", entry.weight),
                weighted: format!("{:.2}", entry.weighted()),
            })
            .collect::<Vec<_>>();

        Table::new(&rows)
            .with(Panel::header("Grading Report"))
            .with(Panel::footer(format!("Grade: {:.2}", self.grade())))
            .with(
                Modify::new(Rows::first())
                    .with(Alignment::center())
                    .with(Alignment::center_vertical()),
            )
            .with(
                Modify::new(Rows::last())
                    .with(Alignment::center())
                    .with(Alignment::center_vertical()),
            )
            .with(Style::modern())
            .to_string()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Ok(json) => write!(f, "Report({json})"),
            Err(_) => write!(f, "Report(grade={}, entries={})", self.grade(), self.len()),
        }
    }
}

impl Serialize for Report {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.state().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_metrics() -> Report {
        let mut report = Report::new();
        report.add("a", 50.0, 1.0).unwrap();
        report.add("b", 100.0, 1.0).unwrap();
        report
    }

    #[test]
    fn grade_is_weighted_mean_on_default_scale() {
        assert!(is_close(two_metrics().grade(), 75.0));
    }

    #[test]
    fn grade_min_value_lifts_the_floor() {
        let report = two_metrics().with_scale(GradeScale::new(0.0, 50.0, 100.0).unwrap());
        assert!(is_close(report.grade(), 87.5));
    }

    #[test]
    fn normalizer_is_applied_last() {
        let scale = GradeScale::default().with_normalizer(|g| g.round().min(70.0));
        let report = two_metrics().with_scale(scale);
        assert_eq!(report.grade(), 70.0);
    }

    #[test]
    fn raw_and_prenormalized_reports_agree() {
        let mut report = Report::new();
        report.add("x", 12.5, 3.0).unwrap();
        report.add("y", 90.0, 0.5).unwrap();
        report.add("z", 40.0, 7.25).unwrap();

        let normalized = report.normalized();
        assert!(normalized.is_normalized());
        assert!(!report.is_normalized());
        assert!(is_close(report.grade(), normalized.grade()));
    }

    #[test]
    fn grade_does_not_touch_weights() {
        let report = two_metrics();
        let first = report.grade();
        let second = report.grade();
        assert_eq!(first, second);
        assert_eq!(report.weight("a"), Some(1.0));
    }

    #[test]
    fn normalize_in_place_divides_by_sum() {
        let mut report = two_metrics();
        report.normalize_weights_in_place();
        assert_eq!(report.weight("a"), Some(0.5));
        assert!(report.is_normalized());
    }

    #[test]
    fn add_overwrites_and_rejects_negative_weights() {
        let mut report = two_metrics();
        report.add("a", 0.0, 2.0).unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report.get("a"), Some(&Entry { value: 0.0, weight: 2.0 }));

        let err = report.add("c", 1.0, -1.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReportError>(),
            Some(ReportError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn empty_report_grades_to_scale_floor() {
        assert_eq!(Report::new().raw_score(), 0.0);
        assert_eq!(Report::new().grade(), 0.0);
    }

    #[test]
    fn inverted_scale_is_rejected() {
        assert!(GradeScale::new(10.0, 0.0, 10.0).is_err());
        assert!(GradeScale::new(10.0, 0.0, 5.0).is_err());
    }

    #[test]
    fn save_without_path_fails() {
        let err = Report::new().save(None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReportError>(),
            Some(ReportError::MissingFilepath(_))
        ));
        let err = Report::new().load(None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReportError>(),
            Some(ReportError::MissingFilepath(_))
        ));
    }

    #[test]
    fn state_carries_scale_in_kwargs() {
        let report = two_metrics().with_scale(GradeScale::new(0.0, 50.0, 100.0).unwrap());
        let doc = report.state();
        assert_eq!(doc.kwargs.get("grade_min_value"), Some(&Value::from(50.0)));
        assert!(is_close(doc.grade, 87.5));
    }

    #[test]
    fn tampered_grade_is_rejected_on_set_state() {
        let mut doc = two_metrics().state();
        doc.grade = 12.0;
        let mut target = Report::new();
        let err = target.set_state(doc).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReportError>(),
            Some(ReportError::GradeMismatch { .. })
        ));
        assert!(target.is_empty());
    }
}
