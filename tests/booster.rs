mod common;

use model_inspector::{
    analyze_model, Artifact, BoosterError, BoosterModel, BoosterScores, FeatureImportanceKind,
    HasBoosterAccessor, HasParams, ImportanceType, ParamValue, Task,
};

#[test]
fn weight_counts_split_nodes_per_feature() -> Result<(), Box<dyn std::error::Error>> {
    let model = BoosterModel::from_raw(common::booster_json(None).as_bytes())?;

    assert_eq!(model.num_trees(), 2);
    let weight = model.score(ImportanceType::Weight);
    assert_eq!(weight.len(), 2);
    assert_eq!(weight.get("f0"), Some(&2.0));
    assert_eq!(weight.get("f2"), Some(&1.0));
    assert_eq!(weight.get("f1"), None);

    Ok(())
}

#[test]
fn gain_and_cover_average_over_splits() -> Result<(), Box<dyn std::error::Error>> {
    let model = BoosterModel::from_raw(common::booster_json(None).as_bytes())?;

    assert_eq!(model.score(ImportanceType::Gain).get("f0"), Some(&2.5));
    assert_eq!(model.score(ImportanceType::TotalGain).get("f0"), Some(&5.0));
    assert_eq!(model.score(ImportanceType::Cover).get("f0"), Some(&7.5));
    assert_eq!(model.score(ImportanceType::TotalCover).get("f2"), Some(&8.0));

    Ok(())
}

#[test]
fn learner_feature_names_label_scores() -> Result<(), Box<dyn std::error::Error>> {
    let raw = common::booster_json(Some(&["age", "income", "score"]));
    let model = BoosterModel::from_raw(raw.as_bytes())?;

    let keys: Vec<String> = model.score(ImportanceType::Weight).into_keys().collect();
    assert_eq!(keys, ["age", "score"]);

    Ok(())
}

#[test]
fn ubjson_buffers_decode_like_json() -> Result<(), Box<dyn std::error::Error>> {
    fn key(out: &mut Vec<u8>, name: &str) {
        out.push(b'i');
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
    }

    let mut raw = vec![b'{'];
    key(&mut raw, "learner");
    raw.push(b'{');
    key(&mut raw, "gradient_booster");
    raw.push(b'{');
    key(&mut raw, "name");
    raw.extend_from_slice(b"Si\x06gbtree");
    key(&mut raw, "model");
    raw.push(b'{');
    key(&mut raw, "trees");
    raw.extend_from_slice(b"[#i\x01");
    raw.push(b'{');
    key(&mut raw, "split_indices");
    raw.extend_from_slice(b"[$l#i\x03\x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00");
    key(&mut raw, "left_children");
    raw.extend_from_slice(b"[$l#i\x03\x00\x00\x00\x01\xff\xff\xff\xff\xff\xff\xff\xff");
    raw.extend_from_slice(b"}}}}}");

    let model = BoosterModel::from_raw(&raw)?;
    let weight = model.score(ImportanceType::Weight);
    assert_eq!(weight.len(), 1);
    assert_eq!(weight.get("f1"), Some(&1.0));

    Ok(())
}

#[test]
fn dart_boosters_read_the_nested_tree_model() -> Result<(), Box<dyn std::error::Error>> {
    let raw = r#"{"learner":{"gradient_booster":{"name":"dart","gbtree":{"model":{"trees":[
        {"split_indices":[3,0,0],"left_children":[1,-1,-1]}
    ]}}}}}"#;
    let model = BoosterModel::from_raw(raw.as_bytes())?;

    assert_eq!(model.score(ImportanceType::Weight).get("f3"), Some(&1.0));

    Ok(())
}

#[test]
fn linear_boosters_have_no_split_importance() {
    let raw = br#"{"learner":{"gradient_booster":{"name":"gblinear","model":{"weights":[0.1]}}}}"#;
    let err = BoosterModel::from_raw(raw).unwrap_err();

    assert!(matches!(err, BoosterError::UnsupportedBooster(ref name) if name == "gblinear"));
}

#[test]
fn malformed_buffers_are_rejected() {
    assert!(matches!(
        BoosterModel::from_raw(b"{\"learner\": 1"),
        Err(BoosterError::Json(_))
    ));
    assert!(matches!(
        BoosterModel::from_raw(b"{\"version\": [2, 0, 3]}"),
        Err(BoosterError::MissingField("learner"))
    ));
}

#[test]
fn pickled_snapshot_unwraps_the_model() -> Result<(), Box<dyn std::error::Error>> {
    let raw = common::booster_snapshot(Some(&["age", "income", "score"]));
    let model = BoosterModel::from_raw(raw.as_bytes())?;

    assert_eq!(model.num_trees(), 2);
    assert_eq!(model.num_features(), Some(3));
    let weight = model.score(ImportanceType::Weight);
    assert_eq!(weight.get("age"), Some(&2.0));
    assert_eq!(weight.get("score"), Some(&1.0));

    Ok(())
}

#[test]
fn fitted_xgboost_wrapper_reports_attribute_importances() -> Result<(), Box<dyn std::error::Error>> {
    let raw = common::booster_snapshot(None);
    let data = common::xgb_wrapper("XGBClassifier", Some(raw.as_bytes()));

    let artifact = Artifact::from_bytes(&data)?;
    let root = artifact.root_object();
    let info = analyze_model(&root);

    assert_eq!(info.class_name, "XGBClassifier");
    assert_eq!(info.module, "xgboost.sklearn");
    assert_eq!(info.task, Task::Classification);
    // one entry per input feature, including f1 which never splits
    assert_eq!(
        info.feature_importance.kind(),
        Some(FeatureImportanceKind::SklearnStyle)
    );
    let details = info.feature_importance.details().ok_or("details missing")?;
    assert_eq!(details.get("length"), Some(&ParamValue::Int(3)));

    let scores = root.get_booster()?.get_score(ImportanceType::Weight)?;
    assert_eq!(scores.len(), 2);

    let params = root.get_params()?;
    assert_eq!(params.get("tree_method").map(ToString::to_string).as_deref(), Some("hist"));
    assert_eq!(params.get("learning_rate"), Some(&ParamValue::Float(0.1)));
    assert!(!params.contains_key("_Booster"));
    assert!(!params.contains_key("kwargs"));

    Ok(())
}

#[test]
fn linear_xgboost_wrapper_still_reports_its_width() -> Result<(), Box<dyn std::error::Error>> {
    let raw = br#"{"Config":{},"Model":{"learner":{"learner_model_param":{"num_feature":"5"},
        "gradient_booster":{"name":"gblinear","model":{"weights":[0.1,0.2,0.3,0.4,0.5,0.0]}}}}}"#;
    let data = common::xgb_wrapper("XGBRegressor", Some(raw));

    let artifact = Artifact::from_bytes(&data)?;
    let root = artifact.root_object();
    let info = analyze_model(&root);

    assert_eq!(info.feature_importance.kind(), Some(FeatureImportanceKind::SklearnStyle));
    let details = info.feature_importance.details().ok_or("details missing")?;
    assert_eq!(details.get("length"), Some(&ParamValue::Int(5)));
    assert!(root.get_booster().is_err());

    Ok(())
}

#[test]
fn unfitted_xgboost_wrapper_degrades_to_unavailable() -> Result<(), Box<dyn std::error::Error>> {
    let data = common::xgb_wrapper("XGBRegressor", None);

    let artifact = Artifact::from_bytes(&data)?;
    let info = analyze_model(&artifact.root_object());

    assert!(!info.feature_importance.available());
    assert_eq!(info.hyperparameters.get("n_estimators"), Some(&ParamValue::Int(2)));

    Ok(())
}

#[test]
fn deeply_nested_ubjson_is_rejected() {
    let mut raw = b"{i\x01a".to_vec();
    raw.extend(std::iter::repeat_n(b'[', 2_000_000));

    let err = BoosterModel::from_raw(&raw).unwrap_err();
    assert!(matches!(err, BoosterError::Ubjson { .. }));
}

#[test]
fn hostile_booster_buffer_degrades_to_unavailable() -> Result<(), Box<dyn std::error::Error>> {
    let mut raw = b"{i\x01a".to_vec();
    raw.extend(std::iter::repeat_n(b'[', 2_000_000));
    let data = common::xgb_wrapper("XGBRegressor", Some(&raw));

    let artifact = Artifact::from_bytes(&data)?;
    let info = analyze_model(&artifact.root_object());

    assert_eq!(info.class_name, "XGBRegressor");
    assert!(!info.feature_importance.available());
    assert_eq!(info.feature_importance.details(), None);
    assert_eq!(info.hyperparameters.get("max_depth"), Some(&ParamValue::Int(3)));

    Ok(())
}
