use std::io::Cursor;
use std::path::{Path, PathBuf};

use model_inspector::{
    ArtifactError, InspectError, InspectResponse, InspectStep, LineProgressReporter, ModelSummary,
    ProgressReporter, Task,
};

#[test]
fn line_progress_reporter_writes_updates() {
    let writer = Cursor::new(Vec::new());
    let reporter = LineProgressReporter::with_writer(writer);

    reporter.on_start(Path::new("/tmp/forest.joblib"));
    reporter.on_step(InspectStep::Loading);
    reporter.on_step(InspectStep::Loading);
    reporter.on_step(InspectStep::Analyzing);

    let response = InspectResponse {
        model_summary: ModelSummary {
            class_name: "RandomForestClassifier".to_string(),
            module: "sklearn.ensemble._forest".to_string(),
            task: Task::Classification,
        },
        report_path: PathBuf::from("reports/model_inspection_2025_01_02_03_04_05.md"),
    };
    reporter.on_finish(&response);

    let output = String::from_utf8(reporter.into_inner().into_inner()).unwrap();
    assert!(output.contains("inspecting: /tmp/forest.joblib"));
    assert_eq!(output.matches("step: loading artifacts").count(), 1);
    assert!(output.contains("step: analyzing model"));
    assert!(output.contains("report: reports/model_inspection_2025_01_02_03_04_05.md"));
}

#[test]
fn line_progress_reporter_reports_warnings_and_failures() {
    let writer = Cursor::new(Vec::new());
    let reporter = LineProgressReporter::with_writer(writer);

    reporter.on_start(Path::new("/tmp/missing.pkl"));
    reporter.on_warning("Console table warning: broken pipe");
    reporter.on_failure(&InspectError::from(ArtifactError::NotFound {
        path: PathBuf::from("/tmp/missing.pkl"),
    }));

    let output = String::from_utf8(reporter.into_inner().into_inner()).unwrap();
    assert!(output.contains("warning: Console table warning: broken pipe"));
    assert!(output.contains("failed [400]: Artifact not found: /tmp/missing.pkl"));
}
