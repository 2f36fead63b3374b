// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end pipeline properties
//!
//! Every test here drives the full chain (ingest → layers → egress) through
//! the public API only.

use qcnn_core::{BitWord, FixedPoint, IngestLayout, LayerConfig, TRANSPORT_BITS};
use qcnn_engine::transport::pack_image_lines;
use qcnn_engine::{
    argmax, Engine, EngineConfig, EngineError, InferenceExecutor, RecordingMonitor,
};
use qcnn_models::synthetic::{SELFTEST_FIXED, SELFTEST_IMAGE, SELFTEST_SCORES};
use qcnn_models::{
    reference_model, selftest_model, LayerSpec, Model, ModelError, RequantParams, WeightTensor,
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

fn hand_image(pixels: [u64; 16]) -> Vec<BitWord> {
    let layout = IngestLayout {
        line_bits: 16,
        lines_per_image: 1,
    };
    pack_image_lines(&pixels, 1, layout).unwrap()
}

/// Reference network with every feature layer refolded by `fold`.
fn refolded(seed: u64, fold: impl Fn(&LayerConfig) -> (usize, usize)) -> Model {
    let model = reference_model(seed).unwrap();
    let layers = model
        .layers()
        .iter()
        .cloned()
        .map(|mut layer| {
            if layer.kind.has_weights() {
                let (in_p, out_p) = fold(&layer.config);
                layer.config.in_p = in_p;
                layer.config.out_p = out_p;
            }
            layer
        })
        .collect();
    Model::new(model.fixed_point(), model.ingest(), layers).unwrap()
}

/// Largest divisor of `n` not above `cap`.
fn fold_at_most(n: usize, cap: usize) -> usize {
    (1..=cap.min(n)).rev().find(|d| n % d == 0).unwrap_or(1)
}

fn random_pixels(seed: u64, images: usize) -> Vec<Vec<u8>> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    (0..images)
        .map(|_| (0..28 * 28).map(|_| rng.random_range(0..=255u8)).collect())
        .collect()
}

fn run(engine: &Engine, input: &[BitWord], reps: usize) -> Vec<BitWord> {
    let mut output = vec![BitWord::zero(TRANSPORT_BITS); reps];
    engine.run(input, &mut output, reps).unwrap();
    output
}

#[test]
fn test_hand_computed_scores() {
    let engine = Engine::new(&selftest_model().unwrap(), EngineConfig::minimal()).unwrap();
    let mut input = hand_image(SELFTEST_IMAGE);
    input.extend(hand_image([0; 16]));
    let out = run(&engine, &input, 2);

    // conv map [4 2 0; 2 2 2; 0 2 4]
    // class 0: sum = 18; class 1: −8 + 2 + 0 + 2 + 2 + 2 + 0 + 2 − 8 = −6
    let layout = engine.score_layout();
    assert_eq!(layout.decode(&out[0]), SELFTEST_SCORES);
    assert_eq!(out[0].get(0, 16), 18);
    assert_eq!(out[0].get(16, 16), 0xfffa);
    assert!(out[0].extract(32, TRANSPORT_BITS - 32).is_zero());

    assert_eq!(layout.decode(&out[1]), vec![0, 0]);
    assert_eq!(argmax(&layout.decode(&out[0])), Some(0));
    // tie resolves to the first class
    assert_eq!(argmax(&layout.decode(&out[1])), Some(0));
}

#[test]
fn test_hand_scores_scale_bits_shift() {
    let mut model = selftest_model().unwrap();
    let fixed = FixedPoint {
        scale_bits: 2,
        factor_scale_bits: 8,
    };
    let mut layers = model.layers().to_vec();
    layers[1].config.mbit = 18;
    model = Model::new(fixed, model.ingest(), layers).unwrap();

    let engine = Engine::new(&model, EngineConfig::minimal()).unwrap();
    let out = run(&engine, &hand_image(SELFTEST_IMAGE), 1);
    assert_eq!(engine.score_layout().decode(&out[0]), vec![18 << 2, -6 << 2]);
}

#[test]
fn test_batch_equals_individual_runs() {
    let engine = Engine::new(&reference_model(3).unwrap(), EngineConfig::default()).unwrap();
    let pixels = random_pixels(11, 2);
    let layout = engine.ingest_layout();
    let a = qcnn_engine::transport::pack_pixel_batch(&[&pixels[0][..]], layout).unwrap();
    let b = qcnn_engine::transport::pack_pixel_batch(&[&pixels[1][..]], layout).unwrap();

    let mut both = a.clone();
    both.extend(b.iter().cloned());
    let batch = run(&engine, &both, 2);

    assert_eq!(batch[0], run(&engine, &a, 1)[0]);
    assert_eq!(batch[1], run(&engine, &b, 1)[0]);

    // repeated runs on the same engine carry nothing over
    assert_eq!(run(&engine, &both, 2), batch);
}

#[test]
fn test_folding_does_not_change_results() {
    let pixels = random_pixels(5, 3);
    let images: Vec<&[u8]> = pixels.iter().map(Vec::as_slice).collect();

    let unfolded = refolded(9, |_| (1, 1));
    let folded = refolded(9, |c| (fold_at_most(c.cin, 4), fold_at_most(c.cout, 8)));
    let fully = refolded(9, |c| (c.cin, c.cout));

    let baseline = InferenceExecutor::new(Engine::new(&unfolded, EngineConfig::minimal()).unwrap())
        .infer_pixels(&images)
        .unwrap();

    for (model, config) in [
        (&folded, EngineConfig::default()),
        (&fully, EngineConfig::default().with_channel_depth(1)),
        (&fully, EngineConfig::minimal().with_lane_threads(2)),
        (&unfolded, EngineConfig::default().with_channel_depth(1024)),
    ] {
        let result = InferenceExecutor::new(Engine::new(model, config).unwrap())
            .infer_pixels(&images)
            .unwrap();
        assert_eq!(result.output, baseline.output, "{config:?}");
        assert_eq!(result.predictions, baseline.predictions);
    }
}

#[test]
fn test_threaded_matches_sequential_on_reference() {
    let engine = Engine::new(&reference_model(1).unwrap(), EngineConfig::default()).unwrap();
    let pixels = random_pixels(2, 4);
    let images: Vec<&[u8]> = pixels.iter().map(Vec::as_slice).collect();

    let executor = InferenceExecutor::new(engine);
    let threaded = executor.infer_pixels(&images).unwrap();
    let executor = executor.sequential(true);
    let sequential = executor.infer_pixels(&images).unwrap();

    assert_eq!(threaded.output, sequential.output);
    assert_eq!(threaded.scores.len(), 4);
    assert!(threaded.scores.iter().all(|s| s.len() == 10));
    assert!(threaded.predictions.iter().all(|&p| p < 10));
}

#[test]
fn test_zero_weights_give_zero_scores() {
    let conv = LayerConfig {
        k: 2,
        s: 1,
        din: 4,
        cin: 1,
        cout: 2,
        ibit: 8,
        wbit: 2,
        mbit: 12,
        abit: 4,
        in_p: 1,
        out_p: 2,
    };
    let pool = LayerConfig {
        k: 2,
        s: 2,
        din: 3,
        cin: 2,
        cout: 2,
        ibit: 4,
        wbit: 0,
        mbit: 0,
        abit: 4,
        in_p: 1,
        out_p: 1,
    };
    let dense = LayerConfig {
        k: 1,
        s: 1,
        din: 1,
        cin: 2,
        cout: 3,
        ibit: 4,
        wbit: 2,
        mbit: 12,
        abit: 0,
        in_p: 2,
        out_p: 3,
    };
    let model = Model::new(
        SELFTEST_FIXED,
        IngestLayout {
            line_bits: 64,
            lines_per_image: 2,
        },
        vec![
            LayerSpec::conv(
                "conv",
                conv,
                WeightTensor::new(2, vec![0; 8]).unwrap(),
                RequantParams::new(vec![1 << 8, 3 << 8], vec![0, 0]).unwrap(),
            ),
            LayerSpec::pool("pool", pool),
            LayerSpec::dense_no_act(
                "scores",
                dense,
                WeightTensor::new(2, vec![0; 6]).unwrap(),
                None,
            ),
        ],
    )
    .unwrap();

    let engine = Engine::new(&model, EngineConfig::default()).unwrap();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(77);
    let input: Vec<BitWord> = (0..6)
        .map(|_| BitWord::from_u64(64, rng.random()).resized(TRANSPORT_BITS))
        .collect();
    let out = run(&engine, &input, 3);
    assert!(out.iter().all(BitWord::is_zero));
}

#[test]
fn test_monitors_do_not_change_results() {
    let model = reference_model(4).unwrap();
    let pixels = random_pixels(8, 2);
    let images: Vec<&[u8]> = pixels.iter().map(Vec::as_slice).collect();

    let plain = InferenceExecutor::new(Engine::new(&model, EngineConfig::default()).unwrap())
        .infer_pixels(&images)
        .unwrap();

    let mut engine = Engine::new(&model, EngineConfig::default()).unwrap();
    let rec = RecordingMonitor::shared();
    for stream in ["input", "pool0", "dense0", "egress"] {
        engine.attach_monitor(stream, rec.clone()).unwrap();
    }
    let observed = InferenceExecutor::new(engine).infer_pixels(&images).unwrap();

    assert_eq!(observed.output, plain.output);
    assert_eq!(rec.words("input").len(), 2 * 14);
    assert_eq!(rec.words("pool0").len(), 2 * 13 * 13);
    assert_eq!(rec.words("dense0").len(), 2);
    assert_eq!(rec.words("egress"), plain.output);
}

#[test]
fn test_terminal_layer_must_be_dense_no_act() {
    let model = reference_model(0).unwrap();
    let truncated = model.layers()[..model.layer_count() - 1].to_vec();
    let model = Model::new(model.fixed_point(), model.ingest(), truncated).unwrap();
    assert!(matches!(
        Engine::new(&model, EngineConfig::minimal()),
        Err(EngineError::Model(_))
    ));
}

#[test]
fn test_incompatible_neighbours_rejected() {
    let model = selftest_model().unwrap();
    let mut layers = model.layers().to_vec();
    // dense expects 2-bit inputs, conv emits 3-bit activations
    layers[1].config.ibit = 2;
    let model = Model::new(SELFTEST_FIXED, model.ingest(), layers).unwrap();
    assert!(matches!(
        Engine::new(&model, EngineConfig::minimal()),
        Err(EngineError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_zero_weight_dense_activation_gives_zero_scores() {
    let hidden = LayerConfig {
        k: 1,
        s: 1,
        din: 1,
        cin: 4,
        cout: 3,
        ibit: 8,
        wbit: 2,
        mbit: 12,
        abit: 4,
        in_p: 2,
        out_p: 3,
    };
    let scores = LayerConfig {
        k: 1,
        s: 1,
        din: 1,
        cin: 3,
        cout: 2,
        ibit: 4,
        wbit: 3,
        mbit: 12,
        abit: 0,
        in_p: 1,
        out_p: 1,
    };
    let ingest = IngestLayout {
        line_bits: 32,
        lines_per_image: 1,
    };

    for abit in [1, 4] {
        let hidden = LayerConfig { abit, ..hidden };
        let scores = LayerConfig { ibit: abit, ..scores };
        let model = Model::new(
            SELFTEST_FIXED,
            ingest,
            vec![
                LayerSpec::dense(
                    "hidden",
                    hidden,
                    WeightTensor::new(2, vec![0; 12]).unwrap(),
                    RequantParams::new(vec![1 << 8, 5 << 8, -(2 << 8)], vec![0; 3]).unwrap(),
                ),
                LayerSpec::dense_no_act(
                    "scores",
                    scores,
                    WeightTensor::new(3, vec![3, -4, 1, -1, 2, 3]).unwrap(),
                    None,
                ),
            ],
        )
        .unwrap();

        let engine = Engine::new(&model, EngineConfig::default()).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(u64::from(abit));
        let input: Vec<BitWord> = (0..4)
            .map(|_| BitWord::from_u64(32, rng.random_range(0..=u64::from(u32::MAX))).resized(TRANSPORT_BITS))
            .collect();
        let out = run(&engine, &input, 4);
        assert!(out.iter().all(BitWord::is_zero), "abit = {abit}");
    }
}

#[test]
fn test_line_width_must_hold_whole_elements() {
    // one 24-bit input element per image split over two 12-bit lines
    let scores = LayerConfig {
        k: 1,
        s: 1,
        din: 1,
        cin: 3,
        cout: 1,
        ibit: 8,
        wbit: 2,
        mbit: 16,
        abit: 0,
        in_p: 1,
        out_p: 1,
    };
    let layer = LayerSpec::dense_no_act(
        "scores",
        scores,
        WeightTensor::new(2, vec![1, 1, 1]).unwrap(),
        None,
    );
    let split = IngestLayout {
        line_bits: 12,
        lines_per_image: 2,
    };
    let model = Model::new(SELFTEST_FIXED, split, vec![layer.clone()]).unwrap();
    assert!(matches!(
        Engine::new(&model, EngineConfig::minimal()),
        Err(EngineError::PayloadWidth { .. })
    ));

    let whole = IngestLayout {
        line_bits: 24,
        lines_per_image: 1,
    };
    let model = Model::new(SELFTEST_FIXED, whole, vec![layer]).unwrap();
    assert!(Engine::new(&model, EngineConfig::minimal()).is_ok());
}

/// One 3-bit input scaled by 16 into a raw score of `mbit` bits.
fn loud_scores(mbit: u32) -> Result<Model, ModelError> {
    let config = LayerConfig {
        k: 1,
        s: 1,
        din: 1,
        cin: 1,
        cout: 1,
        ibit: 3,
        wbit: 2,
        mbit,
        abit: 0,
        in_p: 1,
        out_p: 1,
    };
    Model::new(
        SELFTEST_FIXED,
        IngestLayout {
            line_bits: 3,
            lines_per_image: 1,
        },
        vec![LayerSpec::dense_no_act(
            "scores",
            config,
            WeightTensor::new(2, vec![1]).unwrap(),
            Some(RequantParams::new(vec![16 << 8], vec![0]).unwrap()),
        )],
    )
}

#[test]
fn test_scaled_scores_never_wrap() {
    // max |acc| = 7 · 2 = 14, · 16 = 224 needs 9 signed bits
    assert!(matches!(
        loud_scores(5),
        Err(ModelError::AccumulatorOverflow { mbit: 5, required: 9, .. })
    ));

    let model = loud_scores(9).unwrap();
    let engine = Engine::new(&model, EngineConfig::minimal()).unwrap();
    let input: Vec<BitWord> = (0..8u64)
        .flat_map(|p| pack_image_lines(&[p], 3, model.ingest()).unwrap())
        .collect();
    let out = run(&engine, &input, 8);
    let scores: Vec<i64> = out.iter().map(|w| engine.score_layout().decode(w)[0]).collect();
    assert_eq!(scores, (0..8).map(|p| 16 * p).collect::<Vec<i64>>());
}
