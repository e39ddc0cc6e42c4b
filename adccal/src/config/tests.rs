use super::*;

const PROCESS_PROFILE: &str = r#"
general:
  run: run01
  run_type: process
  n_cols: 32
  n_processes: 4
all:
  input: /data/all_in
  output: /data/all_out
process:
  method: process_pixel_calibration
  process_pixel_calibration:
    coarse_fitting_range: [1, 30]
    fine_fitting_range: mode
"#;

fn process(config: &PipelineConfig) -> &ProcessConfig {
    match &config.stage {
        StageConfig::Process(p) => p,
        other => panic!("expected a process config, got {other:?}"),
    }
}

fn missing_field(err: ConfigError) -> String {
    match err {
        ConfigError::MissingField(key) => key,
        other => panic!("expected MissingField, got {other:?}"),
    }
}

#[test]
fn test_process_profile() {
    let config = PipelineConfig::from_yaml_str(PROCESS_PROFILE, &Overrides::default()).unwrap();
    assert_eq!(config.run_type, RunType::Process);
    assert_eq!(config.detector, DetectorConfig::default());

    let orchestrator = config.orchestrator.clone().unwrap();
    assert_eq!(orchestrator.total_cols, 1440);
    assert_eq!(orchestrator.block_size, 32);
    assert_eq!(orchestrator.n_processes, 4);
    assert!(!orchestrator.skip_existing);

    let p = process(&config);
    assert_eq!(p.run_id, "run01");
    assert_eq!(p.input_dir, PathBuf::from("/data/all_in"));
    assert_eq!(p.method, ProcessMethod::ProcessPixelCalibration);
    assert_eq!(p.fit.fit_adc_part, FitAdcPart::Both);
    assert_eq!(p.fit.channels, vec![Channel::Sample, Channel::Reset]);
    assert_eq!(p.fit.coarse_band(), Some(CoarseBand::new(1, 30).unwrap()));
    assert_eq!(p.fit.fine_policy(), Some(FinePolicy::Mode));
    assert_eq!(p.fit.offset_reference, OffsetReference::Intercept);
    assert_eq!(p.fit.output_layout, OutputLayout::Physical);
}

#[test]
fn test_cli_overrides_win() {
    let overrides = Overrides {
        input: Some(PathBuf::from("/cli/in")),
        run_id: Some("run99".to_string()),
        method: Some("process_adccal_default".to_string()),
        n_cols: Some(48),
        ..Overrides::default()
    };
    let text = PROCESS_PROFILE.replace("process_pixel_calibration:", "process_adccal_default:");
    let config = PipelineConfig::from_yaml_str(&text, &overrides).unwrap();

    let p = process(&config);
    assert_eq!(p.input_dir, PathBuf::from("/cli/in"));
    assert_eq!(p.output_dir, PathBuf::from("/data/all_out"));
    assert_eq!(p.run_id, "run99");
    assert_eq!(p.method, ProcessMethod::ProcessAdccalDefault);
    assert_eq!(config.orchestrator.unwrap().block_size, 48);
}

#[test]
fn test_stage_section_beats_all() {
    let text = PROCESS_PROFILE.replace(
        "  method: process_pixel_calibration",
        "  input: /data/gathered\n  method: process_pixel_calibration",
    );
    let config = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap();
    assert_eq!(process(&config).input_dir, PathBuf::from("/data/gathered"));
}

#[test]
fn test_missing_method_reports_dotted_path() {
    let text = PROCESS_PROFILE.replace("  method: process_pixel_calibration\n", "");
    let err = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap_err();
    assert_eq!(missing_field(err), "process.method");
}

#[test]
fn test_missing_general_keys() {
    let no_run = PROCESS_PROFILE.replace("  run: run01\n", "");
    let err = PipelineConfig::from_yaml_str(&no_run, &Overrides::default()).unwrap_err();
    assert_eq!(missing_field(err), "general.run");

    let no_cols = PROCESS_PROFILE.replace("  n_cols: 32\n", "");
    let err = PipelineConfig::from_yaml_str(&no_cols, &Overrides::default()).unwrap_err();
    assert_eq!(missing_field(err), "general.n_cols");

    let no_type = PROCESS_PROFILE.replace("  run_type: process\n", "");
    let err = PipelineConfig::from_yaml_str(&no_type, &Overrides::default()).unwrap_err();
    assert_eq!(missing_field(err), "general.run_type");
}

#[test]
fn test_missing_directories() {
    let text = PROCESS_PROFILE.replace("  output: /data/all_out\n", "");
    let err = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap_err();
    assert_eq!(missing_field(err), "process.output");
}

#[test]
fn test_missing_fitting_range() {
    let text = PROCESS_PROFILE.replace("    fine_fitting_range: mode\n", "");
    let err = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap_err();
    assert_eq!(
        missing_field(err),
        "process.process_pixel_calibration.fine_fitting_range"
    );

    // Coarse only needs no fine range.
    let text = text.replace(
        "    coarse_fitting_range",
        "    fit_adc_part: coarse\n    coarse_fitting_range",
    );
    let config = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap();
    let p = process(&config);
    assert_eq!(p.fit.parts.len(), 1);
    assert_eq!(p.fit.fine_policy(), None);
}

#[test]
fn test_fine_range_fixed_value() {
    let text = PROCESS_PROFILE.replace("fine_fitting_range: mode", "fine_fitting_range: 12");
    let config = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap();
    assert_eq!(process(&config).fit.fine_policy(), Some(FinePolicy::Fixed(12)));

    let text = PROCESS_PROFILE.replace("fine_fitting_range: mode", "fine_fitting_range: median");
    let err = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { .. }));
}

#[test]
fn test_inverted_coarse_range_rejected() {
    let text = PROCESS_PROFILE.replace("[1, 30]", "[30, 1]");
    let err = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap_err();
    match err {
        ConfigError::InvalidValue { key, .. } => {
            assert_eq!(key, "process.process_pixel_calibration")
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_unknown_method() {
    let overrides = Overrides {
        method: Some("process_magic".to_string()),
        ..Overrides::default()
    };
    let err = PipelineConfig::from_yaml_str(PROCESS_PROFILE, &overrides).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::UnknownMethod { kind: "process", ref name } if name == "process_magic"
    ));
}

#[test]
fn test_unknown_run_type() {
    let overrides = Overrides {
        run_type: Some("plot".to_string()),
        ..Overrides::default()
    };
    let err = PipelineConfig::from_yaml_str(PROCESS_PROFILE, &overrides).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownRunType(ref t) if t == "plot"));
}

#[test]
fn test_uneven_partition() {
    let text = PROCESS_PROFILE.replace("n_cols: 32", "n_cols: 100");
    let err = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::UnevenPartition {
            total_cols: 1440,
            block_size: 100
        }
    ));
}

#[test]
fn test_detector_validation() {
    let text = format!("{PROCESS_PROFILE}detector:\n  n_rows: 100\n  n_adc: 7\n");
    let err = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "detector.n_rows"));

    let text = format!("{PROCESS_PROFILE}detector:\n  n_rows: 14\n  n_adc: 7\n  n_cols: 64\n");
    let config = PipelineConfig::from_yaml_str(&text, &Overrides::default()).unwrap();
    assert_eq!(config.detector.n_rows, 14);
    assert_eq!(config.orchestrator.unwrap().total_cols, 64);
}

#[test]
fn test_gather_profile() {
    let text = r#"
general:
  run: r7
  run_type: gather
  n_cols: 360
all:
  input: /raw
  output: /gathered
gather:
  method: file_per_vin_and_register_file
  file_per_vin_and_register_file:
    raw_file_template: "{prefix}_{run}.adc"
"#;
    let config = PipelineConfig::from_yaml_str(text, &Overrides::default()).unwrap();
    let StageConfig::Gather(gather) = &config.stage else {
        panic!("expected gather config");
    };
    assert_eq!(gather.register_file, PathBuf::from("/raw/file.dat"));
    assert_eq!(gather.raw_file("vin_0.5"), PathBuf::from("/raw/vin_0.5_r7.adc"));
    assert_eq!(gather.sample_path, "data");
    assert_eq!(gather.reset_path, "reset");
}

#[test]
fn test_gather_template_needs_prefix() {
    let text = r#"
general: {run: r7, run_type: gather, n_cols: 360}
all: {input: /raw, output: /gathered}
gather:
  method: file_per_vin_and_register_file
  file_per_vin_and_register_file:
    raw_file_template: "fixed.adc"
"#;
    let err = PipelineConfig::from_yaml_str(text, &Overrides::default()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { .. }));
}

#[test]
fn test_correction_defaults() {
    let text = r#"
general: {run_type: correction}
correction:
  input: /raw/frames.adc
  constants: /constants/merged.adc
  output: /corrected/frames.adc
"#;
    let config = PipelineConfig::from_yaml_str(text, &Overrides::default()).unwrap();
    assert!(config.orchestrator.is_none());
    let StageConfig::Correction(correction) = &config.stage else {
        panic!("expected correction config");
    };
    assert_eq!(correction.method, CorrectionMethod::CorrectionAdccalDefault);
    assert_eq!(correction.constants, CorrectionConstants::from_adu_max(4095.0));
    assert_eq!(correction.constants.coarse_scale, -2047.5);
}

#[test]
fn test_correction_scale_overrides() {
    let text = r#"
general: {run_type: correction}
detector: {adu_max: 1023}
correction:
  input: /raw/frames.adc
  constants: /constants/merged.adc
  output: /corrected/frames.adc
  correction_adccal_default:
    fine_scale: 2000
"#;
    let config = PipelineConfig::from_yaml_str(text, &Overrides::default()).unwrap();
    let StageConfig::Correction(correction) = &config.stage else {
        panic!("expected correction config");
    };
    assert_eq!(correction.constants.coarse_scale, -511.5);
    assert_eq!(correction.constants.fine_scale, 2000.0);
    assert_eq!(correction.constants.adu_max_offset, 1023.0);
}

#[test]
fn test_correction_missing_constants() {
    let text = r#"
general: {run_type: correction}
correction: {input: /raw/frames.adc, output: /out.adc}
"#;
    let err = PipelineConfig::from_yaml_str(text, &Overrides::default()).unwrap_err();
    assert_eq!(missing_field(err), "correction.constants");
}

#[test]
fn test_load_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profile.yaml");
    std::fs::write(&path, PROCESS_PROFILE).unwrap();
    assert!(PipelineConfig::load(&path, &Overrides::default()).is_ok());

    let missing = dir.path().join("nope.yaml");
    let err = PipelineConfig::load(&missing, &Overrides::default()).unwrap_err();
    assert!(err.to_string().contains("nope.yaml"));

    std::fs::write(&path, "general: [unclosed").unwrap();
    let err = PipelineConfig::load(&path, &Overrides::default()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn test_shipped_profile_is_valid() {
    let text = include_str!("../../conf/default.yaml");
    for run_type in ["gather", "process", "correction"] {
        let overrides = Overrides {
            run_type: Some(run_type.to_string()),
            ..Overrides::default()
        };
        let config = PipelineConfig::from_yaml_str(text, &overrides).unwrap();
        assert_eq!(config.run_type.to_string(), run_type);
        assert_eq!(config.detector.bits, BitLayout::default());
    }
}

#[test]
fn test_shipped_pooled_method_references_roi_start() {
    let text = include_str!("../../conf/default.yaml");
    let overrides = Overrides {
        run_type: Some("process".to_string()),
        method: Some("process_adccal_default".to_string()),
        ..Overrides::default()
    };
    let config = PipelineConfig::from_yaml_str(text, &overrides).unwrap();
    let pooled = process(&config);
    assert_eq!(pooled.method, ProcessMethod::ProcessAdccalDefault);
    assert_eq!(pooled.fit.offset_reference, OffsetReference::RoiStart);

    let overrides = Overrides {
        run_type: Some("process".to_string()),
        ..Overrides::default()
    };
    let config = PipelineConfig::from_yaml_str(text, &overrides).unwrap();
    assert_eq!(process(&config).fit.offset_reference, OffsetReference::Intercept);
}

#[test]
fn test_shipped_bits_decode_dlsraw_words() {
    let text = include_str!("../../conf/default.yaml");
    let overrides = Overrides {
        run_type: Some("process".to_string()),
        ..Overrides::default()
    };
    let config = PipelineConfig::from_yaml_str(text, &overrides).unwrap();
    let code = config.detector.bits.split((1 << 13) | (200 << 5) | 17);
    assert_eq!((code.coarse, code.fine, code.gain), (17, 200, 1));
}
