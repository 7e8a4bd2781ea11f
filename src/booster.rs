//! Reads the raw model buffer a pickled XGBoost `Booster` carries in its
//! `handle` state and computes split-based feature importance from it.
//!
//! XGBoost serialises that buffer as UBJSON (2.x) or JSON; both decode into
//! the same document shape. A pickled booster carries the memory snapshot
//! (`{"Config": .., "Model": ..}`), while `save_raw` writes the model alone;
//! both are accepted. The legacy binary format is not understood.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use crate::application::{BoosterScores, ProbeError};

#[derive(Debug, thiserror::Error)]
pub enum BoosterError {
    #[error("booster buffer is empty")]
    Empty,
    #[error("legacy binary booster format is not supported")]
    LegacyFormat,
    #[error("invalid JSON booster model: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid UBJSON booster model at byte {offset}: {message}")]
    Ubjson { offset: usize, message: String },
    #[error("booster model field `{0}` is missing or malformed")]
    MissingField(&'static str),
    #[error("feature importance is not defined for booster type {0}")]
    UnsupportedBooster(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportanceType {
    Weight,
    Gain,
    Cover,
    TotalGain,
    TotalCover,
}

#[derive(Debug, Clone, PartialEq)]
struct TreeSplits {
    split_indices: Vec<u64>,
    left_children: Vec<i64>,
    loss_changes: Vec<f64>,
    sum_hessian: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoosterModel {
    feature_names: Vec<String>,
    num_features: Option<usize>,
    trees: Vec<TreeSplits>,
}

impl BoosterModel {
    pub fn from_raw(raw: &[u8]) -> Result<Self, BoosterError> {
        let document = decode_document(raw)?;
        Self::from_document(&document)
    }

    pub fn from_document(document: &Value) -> Result<Self, BoosterError> {
        let learner = learner_of(document)?;
        let booster = learner
            .get("gradient_booster")
            .ok_or(BoosterError::MissingField("gradient_booster"))?;
        let name = booster
            .get("name")
            .and_then(Value::as_str)
            .ok_or(BoosterError::MissingField("gradient_booster.name"))?;

        let model = match name {
            "gbtree" => booster.get("model"),
            "dart" => booster.get("gbtree").and_then(|gbtree| gbtree.get("model")),
            other => return Err(BoosterError::UnsupportedBooster(other.to_string())),
        }
        .ok_or(BoosterError::MissingField("model"))?;

        let trees = model
            .get("trees")
            .and_then(Value::as_array)
            .ok_or(BoosterError::MissingField("trees"))?
            .iter()
            .map(tree_splits)
            .collect::<Result<Vec<_>, _>>()?;

        let feature_names = learner
            .get("feature_names")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            feature_names,
            num_features: recorded_features(learner),
            trees,
        })
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn num_features(&self) -> Option<usize> {
        self.num_features
    }

    /// Per-feature importance over every split node. Features that never
    /// split are absent, as in XGBoost's own `get_score`.
    pub fn score(&self, importance: ImportanceType) -> BTreeMap<String, f64> {
        let mut totals: BTreeMap<u64, (f64, f64)> = BTreeMap::new();

        for tree in &self.trees {
            for (node, left) in tree.left_children.iter().enumerate() {
                if *left == -1 {
                    continue;
                }
                let Some(feature) = tree.split_indices.get(node) else {
                    continue;
                };
                let measure = match importance {
                    ImportanceType::Weight => 1.0,
                    ImportanceType::Gain | ImportanceType::TotalGain => {
                        tree.loss_changes.get(node).copied().unwrap_or(0.0)
                    }
                    ImportanceType::Cover | ImportanceType::TotalCover => {
                        tree.sum_hessian.get(node).copied().unwrap_or(0.0)
                    }
                };
                let entry = totals.entry(*feature).or_insert((0.0, 0.0));
                entry.0 += measure;
                entry.1 += 1.0;
            }
        }

        totals
            .into_iter()
            .map(|(feature, (total, splits))| {
                let value = match importance {
                    ImportanceType::Gain | ImportanceType::Cover => total / splits,
                    _ => total,
                };
                (self.feature_name(feature), value)
            })
            .collect()
    }

    fn feature_name(&self, index: u64) -> String {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.feature_names.get(index))
            .cloned()
            .unwrap_or_else(|| format!("f{index}"))
    }
}

impl BoosterScores for BoosterModel {
    fn get_score(&self, importance: ImportanceType) -> Result<BTreeMap<String, f64>, ProbeError> {
        Ok(self.score(importance))
    }
}

fn tree_splits(tree: &Value) -> Result<TreeSplits, BoosterError> {
    let split_indices = number_array(tree, "split_indices", Value::as_u64)?
        .ok_or(BoosterError::MissingField("split_indices"))?;
    let left_children = number_array(tree, "left_children", Value::as_i64)?
        .ok_or(BoosterError::MissingField("left_children"))?;
    let loss_changes = number_array(tree, "loss_changes", Value::as_f64)?.unwrap_or_default();
    let sum_hessian = number_array(tree, "sum_hessian", Value::as_f64)?.unwrap_or_default();

    Ok(TreeSplits {
        split_indices,
        left_children,
        loss_changes,
        sum_hessian,
    })
}

/// Input width recorded in a raw booster buffer, for any booster type
/// (`gblinear` included).
pub fn feature_count(raw: &[u8]) -> Result<Option<usize>, BoosterError> {
    let document = decode_document(raw)?;
    Ok(recorded_features(learner_of(&document)?))
}

/// The learner of either the pickle snapshot or the `save_raw` layout.
fn learner_of(document: &Value) -> Result<&Value, BoosterError> {
    document
        .get("Model")
        .unwrap_or(document)
        .get("learner")
        .ok_or(BoosterError::MissingField("learner"))
}

/// `num_feature` from the learner parameters, else the feature-name count.
fn recorded_features(learner: &Value) -> Option<usize> {
    learner
        .get("learner_model_param")
        .and_then(|param| param.get("num_feature"))
        .and_then(count_of)
        .or_else(|| {
            learner
                .get("feature_names")
                .and_then(Value::as_array)
                .filter(|names| !names.is_empty())
                .map(Vec::len)
        })
}

/// XGBoost stores learner parameters as strings (`"num_feature": "3"`).
fn count_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(text) => text.trim().parse().ok(),
        other => other.as_u64().and_then(|count| usize::try_from(count).ok()),
    }
}

fn number_array<T>(
    tree: &Value,
    field: &'static str,
    convert: fn(&Value) -> Option<T>,
) -> Result<Option<Vec<T>>, BoosterError> {
    let Some(values) = tree.get(field) else {
        return Ok(None);
    };
    let values = values.as_array().ok_or(BoosterError::MissingField(field))?;
    values
        .iter()
        .map(|value| convert(value).ok_or(BoosterError::MissingField(field)))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Decodes a raw booster buffer, telling JSON text from UBJSON by the byte
/// after the opening brace.
pub fn decode_document(raw: &[u8]) -> Result<Value, BoosterError> {
    let start = raw
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .ok_or(BoosterError::Empty)?;
    let body = &raw[start..];

    if body[0] != b'{' {
        return Err(BoosterError::LegacyFormat);
    }

    let next = body[1..].iter().find(|byte| !byte.is_ascii_whitespace());
    match next {
        Some(b'"') | Some(b'}') => Ok(serde_json::from_slice(body)?),
        _ => UbjsonReader::new(body).document(),
    }
}

/// Container nesting limit, matching `serde_json`'s recursion limit.
const MAX_UBJSON_DEPTH: usize = 128;

struct UbjsonReader<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> UbjsonReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    fn document(mut self) -> Result<Value, BoosterError> {
        self.value()
    }

    fn error(&self, message: impl Into<String>) -> BoosterError {
        BoosterError::Ubjson {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn read_u8(&mut self) -> Result<u8, BoosterError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| self.error("unexpected end of data"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], BoosterError> {
        let data: &'a [u8] = self.data;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| self.error("unexpected end of data"))?;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], BoosterError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn marker(&mut self) -> Result<u8, BoosterError> {
        loop {
            let marker = self.read_u8()?;
            if marker != b'N' {
                return Ok(marker);
            }
        }
    }

    fn value(&mut self) -> Result<Value, BoosterError> {
        let marker = self.marker()?;
        self.value_of(marker)
    }

    fn value_of(&mut self, marker: u8) -> Result<Value, BoosterError> {
        let value = match marker {
            b'Z' => Value::Null,
            b'T' => Value::Bool(true),
            b'F' => Value::Bool(false),
            b'i' => Value::from(i8::from_be_bytes(self.read_array()?)),
            b'U' => Value::from(self.read_u8()?),
            b'I' => Value::from(i16::from_be_bytes(self.read_array()?)),
            b'l' => Value::from(i32::from_be_bytes(self.read_array()?)),
            b'L' => Value::from(i64::from_be_bytes(self.read_array()?)),
            b'd' => float(f64::from(f32::from_be_bytes(self.read_array()?))),
            b'D' => float(f64::from_be_bytes(self.read_array()?)),
            b'C' => Value::String(char::from(self.read_u8()?).to_string()),
            b'S' => Value::String(self.string_body()?),
            b'H' => {
                let digits = self.string_body()?;
                serde_json::from_str::<Number>(&digits)
                    .map(Value::Number)
                    .unwrap_or(Value::String(digits))
            }
            b'[' => self.nested(Self::array)?,
            b'{' => self.nested(Self::object)?,
            other => return Err(self.error(format!("unknown marker 0x{other:02x}"))),
        };
        Ok(value)
    }

    fn nested(
        &mut self,
        read: fn(&mut Self) -> Result<Value, BoosterError>,
    ) -> Result<Value, BoosterError> {
        if self.depth >= MAX_UBJSON_DEPTH {
            return Err(self.error("containers are nested too deeply"));
        }
        self.depth += 1;
        let value = read(self);
        self.depth -= 1;
        value
    }

    fn length(&mut self) -> Result<usize, BoosterError> {
        let marker = self.marker()?;
        let len: i64 = match marker {
            b'i' => i64::from(i8::from_be_bytes(self.read_array()?)),
            b'U' => i64::from(self.read_u8()?),
            b'I' => i64::from(i16::from_be_bytes(self.read_array()?)),
            b'l' => i64::from(i32::from_be_bytes(self.read_array()?)),
            b'L' => i64::from_be_bytes(self.read_array()?),
            other => return Err(self.error(format!("invalid length marker 0x{other:02x}"))),
        };
        usize::try_from(len).map_err(|_| self.error("negative length"))
    }

    fn string_body(&mut self) -> Result<String, BoosterError> {
        let len = self.length()?;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.error("string is not valid UTF-8"))
    }

    /// Optional `$type` and `#count` after an opening bracket.
    fn container_header(&mut self) -> Result<(Option<u8>, Option<usize>), BoosterError> {
        let mut element_type = None;
        if self.peek() == Some(b'$') {
            self.pos += 1;
            element_type = Some(self.read_u8()?);
            if self.peek() != Some(b'#') {
                return Err(self.error("typed container without count"));
            }
        }
        let mut count = None;
        if self.peek() == Some(b'#') {
            self.pos += 1;
            count = Some(self.length()?);
        }
        Ok((element_type, count))
    }

    fn element(&mut self, element_type: Option<u8>) -> Result<Value, BoosterError> {
        match element_type {
            Some(marker) => self.value_of(marker),
            None => self.value(),
        }
    }

    fn array(&mut self) -> Result<Value, BoosterError> {
        let (element_type, count) = self.container_header()?;
        let mut items = Vec::new();

        match count {
            Some(count) => {
                items.reserve(count.min(self.data.len() - self.pos));
                for _ in 0..count {
                    items.push(self.element(element_type)?);
                }
            }
            None => loop {
                let marker = self.marker()?;
                if marker == b']' {
                    break;
                }
                items.push(self.value_of(marker)?);
            },
        }

        Ok(Value::Array(items))
    }

    fn object(&mut self) -> Result<Value, BoosterError> {
        let (element_type, count) = self.container_header()?;
        let mut map = Map::new();

        match count {
            Some(count) => {
                for _ in 0..count {
                    let key = self.string_body()?;
                    let value = self.element(element_type)?;
                    map.insert(key, value);
                }
            }
            None => loop {
                if self.peek() == Some(b'}') {
                    self.pos += 1;
                    break;
                }
                let key = self.string_body()?;
                let value = self.value()?;
                map.insert(key, value);
            },
        }

        Ok(Value::Object(map))
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}
