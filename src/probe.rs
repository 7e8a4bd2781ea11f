//! Capability probes for decoded pickle objects.
//!
//! The rules approximate what the producing library would answer without
//! running any of its code: `get_params` reads the public constructor
//! attributes stored in instance state, `coef_` and `feature_importances_`
//! are looked up as stored attributes, and tree ensembles that compute
//! `feature_importances_` on demand are recognised by module and class name.
//! Fitted XGBoost wrappers answer `feature_importances_` from the input width
//! recorded in their booster buffer.

use crate::application::{
    BoosterScores, HasBoosterAccessor, HasCoefficients, HasFeatureImportances, HasParams,
    ProbeError, TypeIdentity,
};
use crate::booster::{self, BoosterModel};
use crate::domain::{ParamValue, Params};
use crate::pickle::{Artifact, ClassRef, Instance, Node, Value};

const MAX_DEPTH: usize = 16;

/// Libraries whose estimators implement the `get_params` protocol.
const ESTIMATOR_MODULES: [&str; 4] = ["sklearn.", "xgboost.", "lightgbm.", "imblearn."];

/// Ensemble families whose `feature_importances_` is a computed property.
const IMPORTANCE_ENSEMBLES: [&str; 5] = [
    "Forest",
    "ExtraTrees",
    "GradientBoosting",
    "AdaBoost",
    "RandomTreesEmbedding",
];

/// Ensembles whose constructor takes the sub-estimator as a parameter.
const ESTIMATOR_ARG_ENSEMBLES: [&str; 2] = ["Bagging", "AdaBoost"];

impl Artifact {
    pub fn root_object(&self) -> ObjectView<'_> {
        ObjectView::new(self, self.root())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObjectView<'a> {
    artifact: &'a Artifact,
    value: &'a Value,
}

impl<'a> ObjectView<'a> {
    pub fn new(artifact: &'a Artifact, value: &'a Value) -> Self {
        Self { artifact, value }
    }

    pub fn value(&self) -> &'a Value {
        self.value
    }

    fn node(&self) -> Option<&'a Node> {
        self.artifact.node_of(self.value)
    }

    fn instance(&self) -> Option<&'a Instance> {
        match self.node()? {
            Node::Instance(instance) => Some(instance),
            _ => None,
        }
    }

    fn state_entries(&self) -> Option<&'a [(Value, Value)]> {
        let state = self.instance()?.state.as_ref()?;
        match self.artifact.node_of(state)? {
            Node::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// A stored instance attribute, as `getattr` would find it in `__dict__`.
    pub fn attr(&self, name: &str) -> Option<ObjectView<'a>> {
        let state = self.instance()?.state.as_ref()?;
        let value = self.artifact.dict_get(state, name)?;
        Some(Self::new(self.artifact, value))
    }

    pub fn len(&self) -> Option<usize> {
        match self.node()? {
            Node::List(items) | Node::Tuple(items) => Some(items.len()),
            Node::Dict(entries) => Some(entries.len()),
            Node::Set { items, .. } => Some(items.len()),
            Node::Bytes { data, .. } => Some(data.len()),
            Node::Array(array) => array.shape.first().copied(),
            Node::Class(_) | Node::Instance(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self.node()? {
            Node::Bytes { data, .. } => Some(data),
            _ => None,
        }
    }

    fn is_estimator(&self) -> bool {
        self.instance().is_some_and(|instance| {
            ESTIMATOR_MODULES
                .iter()
                .any(|prefix| instance.class.module.starts_with(prefix))
        })
    }

    pub fn to_param(&self) -> ParamValue {
        to_param(self.artifact, self.value, 0)
    }

    fn params_at_depth(&self, depth: usize) -> Result<Params, ProbeError> {
        if !self.is_estimator() {
            return Err(ProbeError::Missing("get_params"));
        }
        if depth > MAX_DEPTH {
            return Err(ProbeError::Incompatible("estimator nesting is too deep".to_string()));
        }
        let class = self
            .instance()
            .map(|instance| &instance.class)
            .ok_or(ProbeError::Missing("get_params"))?;
        let entries = self
            .state_entries()
            .ok_or_else(|| ProbeError::Incompatible("instance state is not a mapping".to_string()))?;

        let mut params = Params::new();
        for (key, value) in entries {
            let Some(key) = key.as_str() else {
                continue;
            };

            if key == "kwargs" {
                if let Some(Node::Dict(extra)) = self.artifact.node_of(value) {
                    for (extra_key, extra_value) in extra {
                        if let Some(extra_key) = extra_key.as_str() {
                            params.insert(extra_key.to_string(), to_param(self.artifact, extra_value, 0));
                        }
                    }
                }
                continue;
            }
            if !is_public_param(key) || is_ensemble_internal(class, key) {
                continue;
            }

            let nested = Self::new(self.artifact, value);
            if nested.is_estimator() {
                if let Ok(inner) = nested.params_at_depth(depth + 1) {
                    for (inner_key, inner_value) in inner {
                        params.insert(format!("{key}__{inner_key}"), inner_value);
                    }
                }
            }
            params.insert(key.to_string(), nested.to_param());
        }
        Ok(params)
    }

    fn derives_feature_importances(&self) -> bool {
        let Some(instance) = self.instance() else {
            return false;
        };
        let (module, name) = (instance.class.module.as_str(), instance.class.name.as_str());

        let family = if module.starts_with("sklearn.tree") {
            true
        } else {
            module.starts_with("sklearn.ensemble")
                && !name.starts_with("Hist")
                && !name.starts_with("Isolation")
                && IMPORTANCE_ENSEMBLES.iter().any(|marker| name.contains(marker))
        };

        family && self.attr("n_features_in_").is_some()
    }

    fn is_xgboost_wrapper(&self) -> bool {
        self.instance().is_some_and(|instance| {
            instance.class.module.starts_with("xgboost") && instance.class.name.starts_with("XGB")
        })
    }

    /// The wrapper's `_Booster`, or `None` before `fit`.
    fn fitted_booster(&self) -> Option<ObjectView<'a>> {
        self.attr("_Booster").filter(|booster| *booster.value() != Value::None)
    }

    fn booster_buffer(&self) -> Result<&'a [u8], ProbeError> {
        let booster = self.fitted_booster().ok_or_else(|| {
            ProbeError::Incompatible("need to call fit or load_model beforehand".to_string())
        })?;
        booster
            .attr("handle")
            .and_then(|handle| handle.as_bytes())
            .ok_or_else(|| ProbeError::Incompatible("booster carries no serialized model".to_string()))
    }
}

/// `BaseEnsemble` keeps its sub-estimator template and `estimator_params` as
/// attributes even where the concrete class does not take them.
fn is_ensemble_internal(class: &ClassRef, key: &str) -> bool {
    if !class.module.starts_with("sklearn.ensemble") {
        return false;
    }
    match key {
        "estimator_params" => true,
        "estimator" | "base_estimator" => !ESTIMATOR_ARG_ENSEMBLES
            .iter()
            .any(|family| class.name.contains(family)),
        _ => false,
    }
}

fn is_public_param(key: &str) -> bool {
    !key.is_empty() && !key.starts_with('_') && !key.ends_with('_')
}

impl TypeIdentity for ObjectView<'_> {
    fn class_name(&self) -> String {
        let name = match self.value {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::BigInt(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Node(_) => match self.node() {
                Some(Node::Bytes { mutable: true, .. }) => "bytearray",
                Some(Node::Bytes { mutable: false, .. }) => "bytes",
                Some(Node::List(_)) => "list",
                Some(Node::Tuple(_)) => "tuple",
                Some(Node::Dict(_)) => "dict",
                Some(Node::Set { frozen: true, .. }) => "frozenset",
                Some(Node::Set { frozen: false, .. }) => "set",
                Some(Node::Class(_)) => "type",
                Some(Node::Instance(instance)) => return instance.class.name.clone(),
                Some(Node::Array(_)) => "ndarray",
                None => "object",
            },
        };
        name.to_string()
    }

    fn module_name(&self) -> String {
        match self.node() {
            Some(Node::Instance(instance)) => instance.class.module.clone(),
            Some(Node::Array(_)) => "numpy".to_string(),
            _ => "builtins".to_string(),
        }
    }
}

impl HasParams for ObjectView<'_> {
    fn get_params(&self) -> Result<Params, ProbeError> {
        self.params_at_depth(0)
    }
}

impl HasCoefficients for ObjectView<'_> {
    fn has_coef(&self) -> Result<bool, ProbeError> {
        Ok(self.attr("coef_").is_some())
    }
}

impl HasFeatureImportances for ObjectView<'_> {
    fn exposes_feature_importances(&self) -> bool {
        self.attr("feature_importances_").is_some()
            || self.derives_feature_importances()
            || (self.is_xgboost_wrapper() && self.fitted_booster().is_some())
    }

    fn feature_importances_len(&self) -> Result<usize, ProbeError> {
        if let Some(stored) = self.attr("feature_importances_") {
            return stored.len().ok_or_else(|| {
                ProbeError::Incompatible(format!(
                    "feature_importances_ of type {} has no length",
                    stored.class_name()
                ))
            });
        }

        if self.is_xgboost_wrapper() {
            return booster::feature_count(self.booster_buffer()?)?.ok_or_else(|| {
                ProbeError::Incompatible("booster does not record its feature count".to_string())
            });
        }

        let width = self
            .attr("n_features_in_")
            .ok_or(ProbeError::Missing("feature_importances_"))?;
        width
            .value()
            .as_int()
            .and_then(|width| usize::try_from(width).ok())
            .ok_or_else(|| ProbeError::Incompatible("n_features_in_ is not a feature count".to_string()))
    }
}

impl HasBoosterAccessor for ObjectView<'_> {
    fn exposes_booster(&self) -> bool {
        self.is_xgboost_wrapper()
    }

    fn get_booster(&self) -> Result<Box<dyn BoosterScores + '_>, ProbeError> {
        let model = BoosterModel::from_raw(self.booster_buffer()?)?;
        Ok(Box::new(model))
    }
}

fn to_param(artifact: &Artifact, value: &Value, depth: usize) -> ParamValue {
    if depth > MAX_DEPTH {
        return ParamValue::Truncated;
    }
    let nested = |items: &[Value]| -> Vec<ParamValue> {
        items
            .iter()
            .map(|item| to_param(artifact, item, depth + 1))
            .collect()
    };

    match value {
        Value::None => ParamValue::None,
        Value::Bool(value) => ParamValue::Bool(*value),
        Value::Int(value) => ParamValue::Int(*value),
        Value::BigInt(digits) => ParamValue::BigInt(digits.clone()),
        Value::Float(value) => ParamValue::Float(*value),
        Value::Str(text) => ParamValue::Str(text.clone()),
        Value::Node(_) => match artifact.node_of(value) {
            Some(Node::Bytes { data, .. }) => ParamValue::Bytes(data.clone()),
            Some(Node::List(items)) => ParamValue::List(nested(items)),
            Some(Node::Tuple(items)) => ParamValue::Tuple(nested(items)),
            Some(Node::Set { items, frozen }) => ParamValue::Set {
                items: nested(items),
                frozen: *frozen,
            },
            Some(Node::Dict(entries)) => ParamValue::Dict(
                entries
                    .iter()
                    .map(|(key, value)| {
                        (
                            to_param(artifact, key, depth + 1),
                            to_param(artifact, value, depth + 1),
                        )
                    })
                    .collect(),
            ),
            Some(Node::Array(array)) => ParamValue::Array {
                shape: array.shape.clone(),
                dtype: array.dtype.clone(),
            },
            Some(Node::Class(class)) => ParamValue::Class {
                module: class.module.clone(),
                name: class.name.clone(),
            },
            Some(Node::Instance(instance)) => ParamValue::Object {
                module: instance.class.module.clone(),
                name: instance.class.name.clone(),
            },
            None => ParamValue::Truncated,
        },
    }
}
