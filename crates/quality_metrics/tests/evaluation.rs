use approx::assert_relative_eq;
use quality_metrics::{
    compute_quality_metrics, evaluate_classification, LabelGrid, MetricsError, ProbabilityGrid,
    RESULTS_BANNER,
};

fn class_names() -> Vec<String> {
    ["background", "water", "forest"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn grids() -> (LabelGrid, LabelGrid) {
    #[rustfmt::skip]
    let truth = vec![
        0, 0, 0, 0,
        0, 1, 2, 0,
        0, 0, 2, 0,
        0, 0, 0, 0,
    ];
    let truth = LabelGrid::new(4, 4, truth).unwrap();
    let prediction = LabelGrid::new(2, 2, vec![1, 0, 2, 1]).unwrap();
    (prediction, truth)
}

#[test]
fn evaluation_crops_truth_and_drops_ignored_class() -> anyhow::Result<()> {
    let (prediction, truth) = grids();
    let dir = tempfile::tempdir()?;
    let (metrics, out) = evaluate_classification(
        &prediction,
        &truth,
        &class_names(),
        None,
        Some(dir.path()),
        "_test",
        &[0],
    )?;

    assert_eq!(metrics.class_names, vec!["water", "forest"]);
    assert_eq!(metrics.support, vec![1, 2]);
    assert_relative_eq!(metrics.precision[0], 1.0 / 3.0);
    assert_eq!(metrics.recall, vec![1.0, 0.0]);
    assert_eq!(metrics.f1_score, vec![0.5, 0.0]);
    assert_relative_eq!(metrics.accuracy, 1.0 / 3.0);
    assert_eq!(metrics.confusion_matrix, vec![vec![1.0, 0.0], vec![1.0, 0.0]]);
    assert_relative_eq!(metrics.auc_roc("water").unwrap(), 0.5);

    assert!(out.starts_with(RESULTS_BANNER));
    assert!(out.contains("F1-Score:\n  - water: 0.5\n  - forest: 0.0\n"));
    assert!(out.contains("Recall:\n  - water: 1.0\n"));
    assert!(out.contains("AUC-ROC forest: 0.5\n"));
    assert!(out.contains("Classification Report:\n"));
    assert!(out.contains("Confusion Matrix:\n[[1.0000 0.0000]\n [1.0000 0.0000]]"));

    let report = std::fs::read_to_string(dir.path().join("classification_report_test.txt"))?;
    assert_eq!(report, out);
    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(
        dir.path().join("classification_metrics_test.json"),
    )?)?;
    assert_eq!(json["class_ids"], serde_json::json!([1, 2]));
    assert!(json["curves"][0]["roc_curve"]["thresholds"][0].is_null());
    Ok(())
}

#[test]
fn probabilities_drive_the_curves() -> anyhow::Result<()> {
    let labels = [1, 1, 2, 2];
    let predictions = [1, 2, 2, 2];
    #[rustfmt::skip]
    let probs = vec![
        0.0, 0.9, 0.1,
        0.0, 0.4, 0.6,
        0.0, 0.35, 0.65,
        0.0, 0.2, 0.8,
    ];
    let grid = ProbabilityGrid::new(2, 2, 3, probs)?;
    let (metrics, _) =
        compute_quality_metrics(&labels, &predictions, &class_names(), Some(&grid), &[0])?;
    // water scores rank both water pixels first
    assert_relative_eq!(metrics.auc_roc("water").unwrap(), 1.0);
    assert_relative_eq!(metrics.auc_roc("forest").unwrap(), 1.0);
    let pr = &metrics.curves[0].prec_rec_curve;
    assert_eq!(pr.precision.len(), pr.recall.len());
    assert_eq!(pr.thresholds.len() + 1, pr.precision.len());
    Ok(())
}

#[test]
fn invalid_inputs_are_reported() {
    let names = class_names();
    assert!(matches!(
        compute_quality_metrics(&[1, 2], &[1], &names, None, &[0]),
        Err(MetricsError::Length { .. })
    ));
    assert!(matches!(
        compute_quality_metrics(&[1, 2], &[1, 2], &names, None, &[5]),
        Err(MetricsError::UnknownClass { id: 5, classes: 3 })
    ));
    assert!(matches!(
        compute_quality_metrics(&[0, 0], &[1, 2], &names, None, &[0]),
        Err(MetricsError::Empty)
    ));
    let grid = ProbabilityGrid::new(1, 2, 2, vec![0.5; 4]).unwrap();
    assert!(matches!(
        compute_quality_metrics(&[1, 2], &[1, 2], &names, Some(&grid), &[0]),
        Err(MetricsError::Length { what: "probability classes", .. })
    ));

    let (prediction, truth) = grids();
    assert!(matches!(
        evaluate_classification(&truth, &prediction, &names, None, None, "", &[0]),
        Err(MetricsError::Crop { .. })
    ));
}
