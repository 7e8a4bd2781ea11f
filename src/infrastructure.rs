use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;

use crate::application::{
    file_name_of, ArtifactError, ArtifactPorts, InspectError, ProgressReporter,
};
use crate::domain::{InspectRequest, InspectResponse, InspectStep, ARTIFACT_EXTENSIONS};
use crate::pickle::{Artifact, DecodeError};

pub struct FsPorts;

impl FsPorts {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FsPorts {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactPorts for FsPorts {
    fn load_artifact(&self, path: &Path) -> Result<Artifact, ArtifactError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(err) => return Err(ArtifactError::load(path, DecodeError::from(err))),
        };

        if !metadata.is_file() {
            return Err(ArtifactError::NotAFile {
                path: path.to_path_buf(),
            });
        }

        debug!("loading {} ({} bytes)", path.display(), metadata.len());
        let file = fs::File::open(path)
            .map_err(|err| ArtifactError::load(path, DecodeError::from(err)))?;

        Artifact::from_reader(io::BufReader::new(file)).map_err(|err| ArtifactError::load(path, err))
    }
}

/// Copies an artifact into the staging directory under its own file name,
/// replacing any earlier upload of the same name.
pub fn stage_artifact(source: &Path, artifacts_dir: &Path) -> Result<PathBuf, InspectError> {
    if !source.exists() {
        return Err(ArtifactError::NotFound {
            path: source.to_path_buf(),
        }
        .into());
    }

    let accepted = source
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ARTIFACT_EXTENSIONS.contains(&ext));
    if !accepted {
        return Err(ArtifactError::UnsupportedExtension {
            file_name: file_name_of(source),
        }
        .into());
    }

    fs::create_dir_all(artifacts_dir).map_err(|err| {
        InspectError::Internal(format!(
            "failed to create artifacts directory {}: {err}",
            artifacts_dir.display()
        ))
    })?;

    let target = artifacts_dir.join(file_name_of(source));
    fs::copy(source, &target).map_err(|err| {
        InspectError::Internal(format!("failed to stage {}: {err}", source.display()))
    })?;

    Ok(target)
}

pub fn stage_request(
    request: &InspectRequest,
    artifacts_dir: &Path,
) -> Result<InspectRequest, InspectError> {
    let model_path = stage_artifact(&request.model_path, artifacts_dir)?;
    let scaler_path = match request
        .scaler_path
        .as_deref()
        .filter(|path| !path.as_os_str().is_empty())
    {
        Some(path) => Some(stage_artifact(path, artifacts_dir)?),
        None => None,
    };

    Ok(InspectRequest {
        model_path,
        scaler_path,
    })
}

pub struct NoProgressReporter;

impl NoProgressReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for NoProgressReporter {
    fn on_start(&self, _model_path: &Path) {}

    fn on_step(&self, _step: InspectStep) {}

    fn on_warning(&self, _message: &str) {}

    fn on_finish(&self, _response: &InspectResponse) {}

    fn on_failure(&self, _error: &InspectError) {}
}

pub struct IndicatifProgressReporter {
    bar: ProgressBar,
}

impl IndicatifProgressReporter {
    pub fn new() -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr())
    }

    pub fn with_draw_target(draw_target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(None, draw_target);
        let style = ProgressStyle::with_template("{spinner:.yellow} {msg:.blue}")
            .expect("invalid progress style template")
            .tick_chars("⣾⣽⣻⢿⡿⣟⣯⣷");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));

        Self { bar }
    }
}

impl Default for IndicatifProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for IndicatifProgressReporter {
    fn on_start(&self, model_path: &Path) {
        let _ = self
            .bar
            .println(format!("inspecting: {}", model_path.display()));
    }

    fn on_step(&self, step: InspectStep) {
        self.bar.set_message(step.to_string());
    }

    fn on_warning(&self, message: &str) {
        let _ = self.bar.println(style(message).yellow().to_string());
    }

    fn on_finish(&self, response: &InspectResponse) {
        self.bar.disable_steady_tick();
        self.bar
            .finish_with_message(format!("report: {}", response.report_path.display()));
    }

    fn on_failure(&self, error: &InspectError) {
        self.bar.disable_steady_tick();
        self.bar
            .abandon_with_message(style(error.to_string()).red().to_string());
    }
}

struct LineProgressState<W: Write> {
    writer: W,
    last_step: Option<InspectStep>,
    started: bool,
}

pub struct LineProgressReporter<W: Write + Send> {
    state: Mutex<LineProgressState<W>>,
}

impl LineProgressReporter<std::io::Stderr> {
    pub fn new() -> Self {
        Self::with_writer(std::io::stderr())
    }
}

impl Default for LineProgressReporter<std::io::Stderr> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> LineProgressReporter<W> {
    pub fn with_writer(writer: W) -> Self {
        Self {
            state: Mutex::new(LineProgressState {
                writer,
                last_step: None,
                started: false,
            }),
        }
    }

    pub fn into_inner(self) -> W {
        let state = match self.state.into_inner() {
            Ok(state) => state,
            Err(err) => err.into_inner(),
        };
        state.writer
    }

    fn write_line(&self, line: &str) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(err) => err.into_inner(),
        };
        let _ = writeln!(state.writer, "{line}");
        let _ = state.writer.flush();
    }
}

impl<W: Write + Send> ProgressReporter for LineProgressReporter<W> {
    fn on_start(&self, model_path: &Path) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(err) => err.into_inner(),
        };

        if state.started {
            return;
        }

        let _ = writeln!(state.writer, "inspecting: {}", model_path.display());
        let _ = state.writer.flush();
        state.started = true;
    }

    fn on_step(&self, step: InspectStep) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(err) => err.into_inner(),
        };

        if state.last_step == Some(step) {
            return;
        }

        let _ = writeln!(state.writer, "step: {step}");
        let _ = state.writer.flush();
        state.last_step = Some(step);
    }

    fn on_warning(&self, message: &str) {
        self.write_line(&format!("warning: {message}"));
    }

    fn on_finish(&self, response: &InspectResponse) {
        self.write_line(&format!("report: {}", response.report_path.display()));
    }

    fn on_failure(&self, error: &InspectError) {
        self.write_line(&format!("failed [{}]: {error}", error.status_code()));
    }
}
