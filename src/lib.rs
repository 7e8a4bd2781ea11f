pub mod application;
pub mod booster;
pub mod domain;
pub mod infrastructure;
pub mod pickle;
pub mod probe;
pub mod report;

pub use crate::application::{
    analyze_model, analyze_scaler, inspect, load_model_and_scaler, ArtifactError, ArtifactObject,
    ArtifactPorts, BoosterScores, ErrorKind, HasBoosterAccessor, HasCoefficients,
    HasFeatureImportances, HasParams, InspectError, LoadedArtifacts, ProbeError,
    ProgressReporter, TypeIdentity,
};
pub use crate::booster::{BoosterError, BoosterModel, ImportanceType};
pub use crate::domain::{
    FeatureImportance, FeatureImportanceKind, InspectRequest, InspectResponse, InspectStep,
    InspectorConfig, ModelInfo, ModelSummary, ParamValue, Params, ScalerInfo, Task,
    ARTIFACT_EXTENSIONS, DEFAULT_ARTIFACTS_DIR, DEFAULT_REPORTS_DIR, REPORT_FILE_PREFIX,
};
pub use crate::infrastructure::{
    stage_artifact, stage_request, FsPorts, IndicatifProgressReporter, LineProgressReporter,
    NoProgressReporter,
};
pub use crate::pickle::{Artifact, DecodeError};
pub use crate::probe::ObjectView;
pub use crate::report::{
    generate_report, generate_report_at, print_console_summary, render_report, ReportError,
};
