use std::path::{Path, PathBuf};

use ndarray::{arr1, Array4};

use super::*;
use crate::config::{FitAdcPart, FitSettings};
use crate::container::write_file;
use crate::metadata::CREATION_DATE;
use crate::roi::{CoarseBand, FinePolicy};

const EPS: f64 = 1e-9;

fn coarse_rule(low: u16, high: u16) -> PartRule {
    PartRule {
        part: Part::Coarse,
        rule: RoiRule::Coarse(CoarseBand::new(low, high).unwrap()),
    }
}

fn fine_rule(policy: FinePolicy) -> PartRule {
    PartRule {
        part: Part::Fine,
        rule: RoiRule::Fine(policy),
    }
}

fn codes(coarse: Array4<u8>, fine: Array4<u8>) -> ChannelCodes {
    ChannelCodes { coarse, fine }
}

/// `[adc, col, frame, group]` codes for `n_frames` frames, one frame per Vin.
fn ramp(n_adc: usize, n_cols: usize, n_frames: usize, n_groups: usize) -> ChannelCodes {
    let coarse = Array4::from_shape_fn((n_adc, n_cols, n_frames, n_groups), |(a, c, f, g)| {
        (f * (1 + a) + 2 + c + g) as u8
    });
    let fine = Array4::from_shape_fn((n_adc, n_cols, n_frames, n_groups), |(a, c, f, g)| {
        (200 - 3 * f - a - c - g) as u8
    });
    codes(coarse, fine)
}

fn settings(parts: Vec<PartRule>) -> FitSettings {
    FitSettings {
        fit_adc_part: FitAdcPart::Both,
        parts,
        channels: vec![Channel::Sample, Channel::Reset],
        enable_r_squared: true,
        offset_reference: OffsetReference::Intercept,
        output_layout: OutputLayout::Physical,
    }
}

fn write_gathered(path: &Path, codes: &ChannelCodes, vin: &[f64], frames_per_run: &[u32]) {
    let mut plan = WritePlan::new();
    for channel in ["sample", "reset"] {
        plan.push(format!("{channel}/coarse"), codes.coarse.clone());
        plan.push(format!("{channel}/fine"), codes.fine.clone());
        plan.push(format!("{channel}/gain"), Array4::<u8>::zeros(codes.coarse.raw_dim()));
    }
    plan.push("vin", arr1(vin));
    plan.push("collection/n_frames_per_run", arr1(frames_per_run));
    plan.push("collection/columns_used", arr1(&[64u32, 66]));
    write_file(path, &plan).unwrap();
}

fn process_config(dir: &Path, fit: FitSettings) -> ProcessConfig {
    ProcessConfig {
        run_id: "DLSraw".to_string(),
        input_dir: dir.join("gathered"),
        output_dir: dir.join("processed"),
        method: ProcessMethod::ProcessPixelCalibration,
        fit,
    }
}

fn run_process(config: &ProcessConfig, method: ProcessMethod, input: &Path, output: PathBuf) {
    ProcessStage::new(config.clone(), method, input.to_path_buf(), output)
        .run()
        .unwrap();
}

#[test]
fn test_per_pixel_fit_recovers_ramp() {
    let codes = ramp(2, 2, 6, 3);
    let vin: Vec<f64> = (0..6).map(f64::from).collect();
    let out = fit_part(
        &codes,
        &vin,
        coarse_rule(0, 31),
        FitGranularity::PerPixel,
        OffsetReference::Intercept,
        true,
    );

    assert_eq!(out.slope.dim(), (2, 2, 3));
    for a in 0..2 {
        for c in 0..2 {
            for g in 0..3 {
                assert!((out.slope[[a, c, g]] - (1 + a) as f64).abs() < EPS);
                assert!((out.offset[[a, c, g]] - (2 + c + g) as f64).abs() < EPS);
                assert!((out.r_squared.as_ref().unwrap()[[a, c, g]] - 1.0).abs() < EPS);
                assert_eq!(out.roi[[a, c, g]], 6.0);
            }
        }
    }
    assert_eq!(out.n_fitted(), 12);
}

#[test]
fn test_fine_fit_uses_fine_codes() {
    let codes = ramp(1, 1, 5, 1);
    let vin: Vec<f64> = (0..5).map(f64::from).collect();
    // fine = 200 - 3 * vin on every frame
    let out = fit_part(
        &codes,
        &vin,
        PartRule {
            part: Part::Fine,
            rule: RoiRule::Coarse(CoarseBand::new(0, 31).unwrap()),
        },
        FitGranularity::PerPixel,
        OffsetReference::Intercept,
        false,
    );
    assert!((out.slope[[0, 0, 0]] + 3.0).abs() < EPS);
    assert!((out.offset[[0, 0, 0]] - 200.0).abs() < EPS);
    assert!(out.r_squared.is_none());
}

#[test]
fn test_empty_roi_gives_nan() {
    let codes = ramp(1, 2, 4, 1);
    let vin: Vec<f64> = (0..4).map(f64::from).collect();
    let out = fit_part(
        &codes,
        &vin,
        coarse_rule(25, 31),
        FitGranularity::PerPixel,
        OffsetReference::Intercept,
        true,
    );
    assert!(out.slope.iter().all(|v| v.is_nan()));
    assert!(out.offset.iter().all(|v| v.is_nan()));
    assert!(out.r_squared.as_ref().unwrap().iter().all(|v| v.is_nan()));
    assert!(out.roi.iter().all(|&n| n == 0.0));
    assert_eq!(out.n_fitted(), 0);
}

#[test]
fn test_single_point_roi_gives_nan() {
    let codes = ramp(1, 1, 4, 1);
    let vin: Vec<f64> = (0..4).map(f64::from).collect();
    // coarse codes 2, 3, 4, 5: only 5 lies in (4, 31)
    let out = fit_part(
        &codes,
        &vin,
        coarse_rule(4, 31),
        FitGranularity::PerPixel,
        OffsetReference::Intercept,
        false,
    );
    assert!(out.slope[[0, 0, 0]].is_nan());
    assert_eq!(out.roi[[0, 0, 0]], 1.0);
}

#[test]
fn test_fine_mode_marker() {
    // coarse stays at 7 for the first four frames, then steps to 9
    let coarse = Array4::from_shape_fn((1, 1, 6, 1), |(_, _, f, _)| if f < 4 { 7 } else { 9 });
    let fine = Array4::from_shape_fn((1, 1, 6, 1), |(_, _, f, _)| (10 * f + 3) as u8);
    let vin: Vec<f64> = (0..6).map(f64::from).collect();

    let out = fit_part(
        &codes(coarse.clone(), fine.clone()),
        &vin,
        fine_rule(FinePolicy::Mode),
        FitGranularity::PerPixel,
        OffsetReference::Intercept,
        true,
    );
    assert_eq!(out.roi[[0, 0, 0]], 7.0);
    assert!((out.slope[[0, 0, 0]] - 10.0).abs() < EPS);
    assert!((out.offset[[0, 0, 0]] - 3.0).abs() < EPS);

    let fixed = fit_part(
        &codes(coarse, fine),
        &vin,
        fine_rule(FinePolicy::Fixed(23)),
        FitGranularity::PerPixel,
        OffsetReference::Intercept,
        false,
    );
    assert_eq!(fixed.roi[[0, 0, 0]], 23.0);
    assert!(fixed.slope[[0, 0, 0]].is_nan());
}

#[test]
fn test_roi_start_offset() {
    // coarse = 2 * vin + 1; band (2, 31) starts at vin = 1
    let coarse = Array4::from_shape_fn((1, 1, 5, 1), |(_, _, f, _)| (2 * f + 1) as u8);
    let fine = Array4::zeros((1, 1, 5, 1));
    let vin: Vec<f64> = (0..5).map(f64::from).collect();
    let out = fit_part(
        &codes(coarse, fine),
        &vin,
        coarse_rule(2, 31),
        FitGranularity::PerPixel,
        OffsetReference::RoiStart,
        false,
    );
    assert!((out.slope[[0, 0, 0]] - 2.0).abs() < EPS);
    assert!((out.offset[[0, 0, 0]] - 3.0).abs() < EPS);
}

#[test]
fn test_pooled_groups_broadcast() {
    // coarse = vin + group + 1, pooled over two groups: slope 1, offset 1.5
    let coarse = Array4::from_shape_fn((2, 1, 4, 2), |(_, _, f, g)| (f + g + 1) as u8);
    let fine = Array4::zeros((2, 1, 4, 2));
    let sweep = VinSweep::new(vec![0.0, 1.0, 2.0, 3.0], vec![1, 1, 1, 1]).unwrap();
    let vin = sweep.expand_repeated(2);

    let out = fit_part(
        &codes(coarse, fine),
        &vin,
        coarse_rule(0, 31),
        FitGranularity::PooledGroups,
        OffsetReference::Intercept,
        false,
    );
    assert_eq!(out.slope.dim(), (2, 1, 2));
    for v in out.slope.iter() {
        assert!((v - 1.0).abs() < EPS);
    }
    for v in out.offset.iter() {
        assert!((v - 1.5).abs() < EPS);
    }
    assert!(out.roi.iter().all(|&n| n == 8.0));
}

#[test]
fn test_stage_writes_physical_constants_and_provenance() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("gathered/col64-65_gathered.adc");
    std::fs::create_dir_all(input.parent().unwrap()).unwrap();
    let codes = ramp(2, 2, 6, 3);
    write_gathered(&input, &codes, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &[1; 6]);

    let mut fit = settings(vec![coarse_rule(0, 31), fine_rule(FinePolicy::Mode)]);
    fit.channels = vec![Channel::Sample];
    let config = process_config(dir.path(), fit);
    let output = dir.path().join("processed/col64-65_processed.adc");
    run_process(&config, ProcessMethod::ProcessPixelCalibration, &input, output.clone());

    let file = Container::open(&output).unwrap();
    let slope = file.read_as::<f64>("sample/coarse/slope").unwrap();
    assert_eq!(slope.shape(), &[6, 2]);
    // physical row 3 is adc 1, group 1
    assert!((slope[[3, 0]] - 2.0).abs() < EPS);
    assert!((slope[[0, 1]] - 1.0).abs() < EPS);
    let offset = file.read_as::<f64>("sample/coarse/offset").unwrap();
    assert!((offset[[3, 1]] - 4.0).abs() < EPS);

    assert!(file.contains("sample/coarse/r_squared"));
    assert!(file.contains("sample/coarse/roi_points"));
    assert!(file.contains("sample/fine/roi"));
    assert!(!file.contains("reset/coarse/slope"));

    assert_eq!(
        file.read_as::<u32>("collection/roi_coarse").unwrap().as_slice().unwrap(),
        &[0, 31]
    );
    assert_eq!(file.read_text("collection/roi_fine").unwrap(), "mode");
    assert_eq!(
        file.read_text("collection/method").unwrap(),
        "process_pixel_calibration"
    );
    assert!(file
        .read_text("collection/gathered_directory_coarse")
        .unwrap()
        .ends_with("gathered"));
    assert_eq!(
        file.read_as::<u32>("collection/columns_used").unwrap().as_slice().unwrap(),
        &[64, 66]
    );
    assert!(file.contains(CREATION_DATE));
}

#[test]
fn test_stage_acquisition_layout() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.adc");
    write_gathered(&input, &ramp(2, 2, 6, 3), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &[1; 6]);

    let mut fit = settings(vec![coarse_rule(0, 31)]);
    fit.output_layout = OutputLayout::Acquisition;
    let config = process_config(dir.path(), fit);
    let output = dir.path().join("out.adc");
    run_process(&config, ProcessMethod::ProcessPixelCalibration, &input, output.clone());

    let file = Container::open(&output).unwrap();
    let offset = file.read_as::<f64>("reset/coarse/offset").unwrap();
    assert_eq!(offset.shape(), &[2, 2, 3]);
    assert!((offset[[1, 1, 2]] - 5.0).abs() < EPS);
}

fn datasets_bit_identical(a: &Container, b: &Container) {
    let paths = a.dataset_paths().unwrap();
    assert_eq!(paths, b.dataset_paths().unwrap());
    for path in paths.iter().filter(|p| p.as_str() != CREATION_DATE) {
        match (a.read(path).unwrap(), b.read(path).unwrap()) {
            (Tensor::F64(x), Tensor::F64(y)) => {
                assert_eq!(x.shape(), y.shape());
                assert!(
                    x.iter().zip(y.iter()).all(|(p, q)| p.to_bits() == q.to_bits()),
                    "{path} differs"
                );
            }
            (x, y) => assert_eq!(x, y, "{path} differs"),
        }
    }
}

#[test]
fn test_process_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.adc");
    write_gathered(&input, &ramp(2, 3, 6, 2), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &[1; 6]);

    // adc 0 never reaches the band, so its constants are NaN
    let config = process_config(
        dir.path(),
        settings(vec![coarse_rule(12, 31), fine_rule(FinePolicy::Mode)]),
    );
    let first = dir.path().join("first.adc");
    let second = dir.path().join("second.adc");
    run_process(&config, ProcessMethod::ProcessAdccalDefault, &input, first.clone());
    run_process(&config, ProcessMethod::ProcessAdccalDefault, &input, second.clone());

    datasets_bit_identical(
        &Container::open(&first).unwrap(),
        &Container::open(&second).unwrap(),
    );
}

#[test]
fn test_frame_count_mismatch_fails() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.adc");
    write_gathered(&input, &ramp(1, 1, 6, 1), &[0.0, 1.0], &[2, 2]);

    let config = process_config(dir.path(), settings(vec![coarse_rule(0, 31)]));
    let mut stage = ProcessStage::new(
        config,
        ProcessMethod::ProcessPixelCalibration,
        input,
        dir.path().join("out.adc"),
    );
    stage.initiate().unwrap();
    assert!(matches!(
        stage.calculate().unwrap_err(),
        Error::FrameCountMismatch {
            expected: 4,
            actual: 6
        }
    ));
}

#[test]
fn test_missing_gathered_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = process_config(dir.path(), settings(vec![coarse_rule(0, 31)]));
    let mut stage = ProcessStage::new(
        config,
        ProcessMethod::ProcessPixelCalibration,
        dir.path().join("missing.adc"),
        dir.path().join("out.adc"),
    );
    assert!(matches!(stage.run().unwrap_err(), Error::Container(_)));
    assert!(!dir.path().join("out.adc").exists());
}

#[test]
fn test_write_before_calculate_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = process_config(dir.path(), settings(vec![coarse_rule(0, 31)]));
    let stage = ProcessStage::new(
        config,
        ProcessMethod::ProcessPixelCalibration,
        dir.path().join("in.adc"),
        dir.path().join("out.adc"),
    );
    assert!(matches!(
        stage.write_plan().unwrap_err(),
        Error::StageOrder { .. }
    ));
}
