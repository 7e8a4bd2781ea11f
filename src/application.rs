use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::booster::{BoosterError, ImportanceType};
use crate::domain::{
    FeatureImportance, InspectRequest, InspectResponse, InspectStep, InspectorConfig, ModelInfo,
    ModelSummary, Params, ScalerInfo, Task,
};
use crate::pickle::{Artifact, DecodeError};
use crate::report::{generate_report, print_console_summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Load,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("Path is not a file: {}", path.display())]
    NotAFile { path: PathBuf },
    #[error("Unsupported artifact type '{file_name}': expected one of .joblib, .pkl")]
    UnsupportedExtension { file_name: String },
    #[error("Failed to load artifact '{file_name}': {source}")]
    Load {
        file_name: String,
        #[source]
        source: DecodeError,
    },
}

impl ArtifactError {
    pub fn load(path: &Path, source: DecodeError) -> Self {
        ArtifactError::Load {
            file_name: file_name_of(path),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ArtifactError::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::Load,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("Inspector internal error: {0}")]
    Internal(String),
}

impl InspectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InspectError::Artifact(err) => err.kind(),
            InspectError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::Load => 400,
            ErrorKind::Internal => 500,
        }
    }
}

/// Why a single capability probe gave up. Never escapes the analyzers.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("object does not expose {0}")]
    Missing(&'static str),
    #[error("{0}")]
    Incompatible(String),
    #[error(transparent)]
    Booster(#[from] BoosterError),
}

pub trait TypeIdentity {
    fn class_name(&self) -> String;
    fn module_name(&self) -> String;
}

pub trait HasParams {
    fn get_params(&self) -> Result<Params, ProbeError> {
        Err(ProbeError::Missing("get_params"))
    }
}

pub trait HasCoefficients {
    fn has_coef(&self) -> Result<bool, ProbeError> {
        Ok(false)
    }
}

pub trait HasFeatureImportances {
    fn exposes_feature_importances(&self) -> bool {
        false
    }

    fn feature_importances_len(&self) -> Result<usize, ProbeError> {
        Err(ProbeError::Missing("feature_importances_"))
    }
}

pub trait BoosterScores {
    fn get_score(&self, importance: ImportanceType) -> Result<BTreeMap<String, f64>, ProbeError>;
}

pub trait HasBoosterAccessor {
    fn exposes_booster(&self) -> bool {
        false
    }

    fn get_booster(&self) -> Result<Box<dyn BoosterScores + '_>, ProbeError> {
        Err(ProbeError::Missing("get_booster"))
    }
}

/// Everything the analyzers may ask of an opaque deserialized object.
pub trait ArtifactObject:
    TypeIdentity + HasParams + HasCoefficients + HasFeatureImportances + HasBoosterAccessor
{
}

impl<T> ArtifactObject for T where
    T: TypeIdentity + HasParams + HasCoefficients + HasFeatureImportances + HasBoosterAccessor + ?Sized
{
}

pub trait ArtifactPorts {
    fn load_artifact(&self, path: &Path) -> Result<Artifact, ArtifactError>;
}

pub trait ProgressReporter {
    fn on_start(&self, model_path: &Path);
    fn on_step(&self, step: InspectStep);
    fn on_warning(&self, message: &str);
    fn on_finish(&self, response: &InspectResponse);
    fn on_failure(&self, error: &InspectError);
}

pub struct LoadedArtifacts {
    pub model: Artifact,
    pub scaler: Option<Artifact>,
}

pub fn load_model_and_scaler(
    ports: &dyn ArtifactPorts,
    model_path: &Path,
    scaler_path: Option<&Path>,
) -> Result<LoadedArtifacts, ArtifactError> {
    let model = ports.load_artifact(model_path)?;

    let scaler = match scaler_path.filter(|path| !path.as_os_str().is_empty()) {
        Some(path) => Some(ports.load_artifact(path)?),
        None => None,
    };

    Ok(LoadedArtifacts { model, scaler })
}

pub fn analyze_model(model: &dyn ArtifactObject) -> ModelInfo {
    let class_name = model.class_name();
    let module = model.module_name();

    let hyperparameters = model.get_params().unwrap_or_else(|err| {
        debug!("hyperparameters unavailable for {class_name}: {err}");
        Params::new()
    });

    let task = Task::from_class_name(&class_name);

    let has_coefficients = model.has_coef().unwrap_or_else(|err| {
        debug!("coefficient probe failed for {class_name}: {err}");
        false
    });

    let feature_importance = detect_feature_importance(model);

    ModelInfo {
        class_name,
        module,
        task,
        hyperparameters,
        has_coefficients,
        feature_importance,
    }
}

/// The attribute convention wins over the booster accessor, even when an
/// object exposes both.
fn detect_feature_importance(model: &dyn ArtifactObject) -> FeatureImportance {
    if model.exposes_feature_importances() {
        match model.feature_importances_len() {
            Ok(length) => FeatureImportance::sklearn_style(length),
            Err(err) => {
                debug!("feature_importances_ unreadable: {err}");
                FeatureImportance::unavailable()
            }
        }
    } else if model.exposes_booster() {
        let score = model
            .get_booster()
            .and_then(|booster| booster.get_score(ImportanceType::Weight));
        match score {
            Ok(score) => FeatureImportance::xgboost_booster(score.len()),
            Err(err) => {
                debug!("booster importance unavailable: {err}");
                FeatureImportance::unavailable()
            }
        }
    } else {
        FeatureImportance::unavailable()
    }
}

pub fn analyze_scaler(scaler: Option<&dyn ArtifactObject>) -> Option<ScalerInfo> {
    let scaler = scaler?;
    let class_name = scaler.class_name();

    let parameters = scaler.get_params().unwrap_or_else(|err| {
        debug!("parameters unavailable for {class_name}: {err}");
        Params::new()
    });

    Some(ScalerInfo {
        module: scaler.module_name(),
        class_name,
        parameters,
    })
}

pub fn inspect(
    ports: &dyn ArtifactPorts,
    progress: &dyn ProgressReporter,
    config: &InspectorConfig,
    request: &InspectRequest,
    console: &mut dyn Write,
) -> Result<InspectResponse, InspectError> {
    progress.on_start(&request.model_path);

    match run_inspection(ports, progress, config, request, console) {
        Ok(response) => {
            progress.on_finish(&response);
            Ok(response)
        }
        Err(err) => {
            progress.on_failure(&err);
            Err(err)
        }
    }
}

fn run_inspection(
    ports: &dyn ArtifactPorts,
    progress: &dyn ProgressReporter,
    config: &InspectorConfig,
    request: &InspectRequest,
    console: &mut dyn Write,
) -> Result<InspectResponse, InspectError> {
    progress.on_step(InspectStep::Loading);
    let artifacts = load_model_and_scaler(ports, &request.model_path, request.scaler_path.as_deref())?;

    progress.on_step(InspectStep::Analyzing);
    let model = artifacts.model.root_object();
    let model_info = analyze_model(&model);
    let scaler = artifacts.scaler.as_ref().map(Artifact::root_object);
    let scaler_info = analyze_scaler(scaler.as_ref().map(|scaler| scaler as &dyn ArtifactObject));

    // console output never fails the request
    if let Err(err) = print_console_summary(&model_info, scaler_info.as_ref(), console) {
        let message = format!("Console table warning: {err}");
        warn!("{message}");
        progress.on_warning(&message);
    }

    progress.on_step(InspectStep::WritingReport);
    let report_path = generate_report(&model_info, scaler_info.as_ref(), &config.reports_dir)
        .map_err(|err| InspectError::Internal(err.to_string()))?;

    Ok(InspectResponse {
        model_summary: ModelSummary::from(&model_info),
        report_path,
    })
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
