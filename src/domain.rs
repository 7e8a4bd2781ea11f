use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

pub const REPORT_FILE_PREFIX: &str = "model_inspection_";
pub const DEFAULT_REPORTS_DIR: &str = "reports";
pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";
pub const ARTIFACT_EXTENSIONS: [&str; 2] = ["joblib", "pkl"];

/// Hyperparameters and other loosely-typed mappings, sorted by key.
pub type Params = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Classification,
    Regression,
    Unknown,
}

impl Task {
    /// Heuristic: the class name decides, nothing else is consulted.
    pub fn from_class_name(class_name: &str) -> Self {
        let name = class_name.to_lowercase();
        if name.contains("classifier") {
            Task::Classification
        } else if name.contains("regressor") {
            Task::Regression
        } else {
            Task::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Classification => "classification",
            Task::Regression => "regression",
            Task::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureImportanceKind {
    SklearnStyle,
    XgboostBooster,
}

impl FeatureImportanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureImportanceKind::SklearnStyle => "sklearn_style",
            FeatureImportanceKind::XgboostBooster => "xgboost_booster",
        }
    }
}

impl fmt::Display for FeatureImportanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature-importance availability. A kind and its details are only ever
/// recorded together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureImportance {
    detected: Option<(FeatureImportanceKind, Params)>,
}

impl FeatureImportance {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn sklearn_style(length: usize) -> Self {
        Self::detected(FeatureImportanceKind::SklearnStyle, "length", length)
    }

    pub fn xgboost_booster(num_features: usize) -> Self {
        Self::detected(FeatureImportanceKind::XgboostBooster, "num_features", num_features)
    }

    fn detected(kind: FeatureImportanceKind, key: &str, count: usize) -> Self {
        let mut details = Params::new();
        details.insert(key.to_string(), ParamValue::from_count(count));
        Self {
            detected: Some((kind, details)),
        }
    }

    pub fn available(&self) -> bool {
        self.detected.is_some()
    }

    pub fn kind(&self) -> Option<FeatureImportanceKind> {
        self.detected.as_ref().map(|(kind, _)| *kind)
    }

    pub fn details(&self) -> Option<&Params> {
        self.detected.as_ref().map(|(_, details)| details)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub class_name: String,
    pub module: String,
    pub task: Task,
    pub hyperparameters: Params,
    pub has_coefficients: bool,
    pub feature_importance: FeatureImportance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalerInfo {
    pub class_name: String,
    pub module: String,
    pub parameters: Params,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    #[serde(rename = "class")]
    pub class_name: String,
    pub module: String,
    pub task: Task,
}

impl From<&ModelInfo> for ModelSummary {
    fn from(info: &ModelInfo) -> Self {
        Self {
            class_name: info.class_name.clone(),
            module: info.module.clone(),
            task: info.task,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectRequest {
    pub model_path: PathBuf,
    pub scaler_path: Option<PathBuf>,
}

impl InspectRequest {
    pub fn new(model_path: impl Into<PathBuf>, scaler_path: Option<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            scaler_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectResponse {
    pub model_summary: ModelSummary,
    pub report_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectorConfig {
    pub reports_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl InspectorConfig {
    pub fn new(reports_dir: impl Into<PathBuf>, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
            artifacts_dir: artifacts_dir.into(),
        }
    }
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REPORTS_DIR, DEFAULT_ARTIFACTS_DIR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectStep {
    Staging,
    Loading,
    Analyzing,
    WritingReport,
}

impl fmt::Display for InspectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InspectStep::Staging => "staging artifacts",
            InspectStep::Loading => "loading artifacts",
            InspectStep::Analyzing => "analyzing model",
            InspectStep::WritingReport => "writing report",
        };
        f.write_str(text)
    }
}

/// A value recovered from an artifact, rendered the way the producing
/// library would print it (`True`, `None`, `{'a': 1}`, `(1,)`).
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    None,
    Bool(bool),
    Int(i64),
    BigInt(String),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ParamValue>),
    Tuple(Vec<ParamValue>),
    Set { items: Vec<ParamValue>, frozen: bool },
    Dict(Vec<(ParamValue, ParamValue)>),
    Array { shape: Vec<usize>, dtype: String },
    Class { module: String, name: String },
    Object { module: String, name: String },
    Truncated,
}

impl ParamValue {
    pub fn from_count(count: usize) -> Self {
        match i64::try_from(count) {
            Ok(value) => ParamValue::Int(value),
            Err(_) => ParamValue::BigInt(count.to_string()),
        }
    }

    fn write_repr(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::None => f.write_str("None"),
            ParamValue::Bool(true) => f.write_str("True"),
            ParamValue::Bool(false) => f.write_str("False"),
            ParamValue::Int(value) => write!(f, "{value}"),
            ParamValue::BigInt(digits) => f.write_str(digits),
            ParamValue::Float(value) => f.write_str(&float_repr(*value)),
            ParamValue::Str(text) => f.write_str(&str_repr(text)),
            ParamValue::Bytes(data) => f.write_str(&bytes_repr(data)),
            ParamValue::List(items) => write_sequence(f, "[", items, "]"),
            ParamValue::Tuple(items) if items.len() == 1 => {
                f.write_str("(")?;
                items[0].write_repr(f)?;
                f.write_str(",)")
            }
            ParamValue::Tuple(items) => write_sequence(f, "(", items, ")"),
            ParamValue::Set { items, frozen } => match (items.is_empty(), frozen) {
                (true, false) => f.write_str("set()"),
                (true, true) => f.write_str("frozenset()"),
                (false, false) => write_sequence(f, "{", items, "}"),
                (false, true) => write_sequence(f, "frozenset({", items, "})"),
            },
            ParamValue::Dict(entries) => {
                f.write_str("{")?;
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    key.write_repr(f)?;
                    f.write_str(": ")?;
                    value.write_repr(f)?;
                }
                f.write_str("}")
            }
            ParamValue::Array { shape, dtype } => {
                let dims: Vec<ParamValue> = shape.iter().map(|dim| ParamValue::from_count(*dim)).collect();
                f.write_str("array(shape=")?;
                ParamValue::Tuple(dims).write_repr(f)?;
                write!(f, ", dtype={dtype})")
            }
            ParamValue::Class { module, name } => write!(f, "<class '{module}.{name}'>"),
            ParamValue::Object { module, name } => write!(f, "<{module}.{name} object>"),
            ParamValue::Truncated => f.write_str("..."),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(text) => f.write_str(text),
            other => other.write_repr(f),
        }
    }
}

fn write_sequence(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    items: &[ParamValue],
    close: &str,
) -> fmt::Result {
    f.write_str(open)?;
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        item.write_repr(f)?;
    }
    f.write_str(close)
}

fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let text = format!("{value:?}");
    match text.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => text,
    }
}

fn pick_quote(has_single: bool, has_double: bool) -> char {
    if has_single && !has_double { '"' } else { '\'' }
}

fn str_repr(text: &str) -> String {
    let quote = pick_quote(text.contains('\''), text.contains('"'));
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch if ch == quote => {
                out.push('\\');
                out.push(ch);
            }
            ch if (ch as u32) < 0x20 || ch as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", ch as u32));
            }
            ch => out.push(ch),
        }
    }
    out.push(quote);
    out
}

fn bytes_repr(data: &[u8]) -> String {
    let quote = pick_quote(data.contains(&b'\''), data.contains(&b'"'));
    let mut out = String::with_capacity(data.len() + 3);
    out.push('b');
    out.push(quote);
    for &byte in data {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            byte if byte as char == quote => {
                out.push('\\');
                out.push(quote);
            }
            0x20..=0x7e => out.push(byte as char),
            byte => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    out.push(quote);
    out
}
