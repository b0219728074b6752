//! End-to-end tests for the emergence pipeline.
//!
//! These drive the full gap -> coalition -> validation path over an
//! [`InMemoryGraph`] and verify the physical state of each stage's
//! telemetry afterwards, not just the returned values.

use std::collections::HashMap;

use emergence_core::coalition::{CoalitionAssembler, CoalitionAssemblyConfig};
use emergence_core::gap::{GapDetectionConfig, GapDetector, GapType, RetrievedNode};
use emergence_core::gate::{ComparisonMode, GateConfig, GateStatus, QuantileGate};
use emergence_core::membership::{
    FrameState, MembershipLearnerConfig, MembershipWeightLearner, NodeState, SubEntityState,
};
use emergence_core::stubs::InMemoryGraph;
use emergence_core::validator::{
    EmergenceDecision, EmergenceValidator, EmergenceValidatorConfig, ExistingSubEntity,
};

/// Fully connected graph over `count` nodes named `n0..n{count-1}`.
fn clique(count: usize) -> InMemoryGraph {
    let mut graph = InMemoryGraph::new();
    for i in 0..count {
        graph.insert_typed_node(format!("n{i}"), "memory");
    }
    for i in 0..count {
        for j in (i + 1)..count {
            graph.insert_edge(format!("n{i}"), format!("n{j}"), 0.8);
        }
    }
    graph
}

/// Retrieval whose embeddings are orthogonal to the stimulus, guaranteeing
/// a maximal semantic gap over the named nodes.
fn orthogonal_retrieval(ids: &[&str]) -> Vec<RetrievedNode> {
    ids.iter()
        .map(|id| {
            RetrievedNode::new(*id)
                .with_embedding(vec![0.0, 1.0])
                .with_type("memory")
        })
        .collect()
}

// =============================================================================
// Gate behavior across the cold/warm boundary
// =============================================================================

#[test]
fn gate_stays_unknown_until_min_samples_then_evaluates() {
    let mut gate = QuantileGate::new(
        GateConfig::new("coverage", 0.70, ComparisonMode::Above).with_min_samples(30),
    )
    .unwrap();

    for i in 0..29 {
        gate.record(i as f32 / 29.0);
        assert_eq!(gate.evaluate(0.95).status, GateStatus::Unknown);
    }
    assert!(gate.get_threshold().is_none());

    // The 30th sample flips the gate active.
    gate.record(1.0);
    let result = gate.evaluate(0.95);
    assert_eq!(result.status, GateStatus::Pass);
    // Q70 of 30 uniform samples over [0, 1] sits near 0.7.
    let threshold = result.threshold.unwrap();
    assert!((threshold - 0.7).abs() < 0.05, "threshold was {threshold}");
}

#[test]
fn gate_threshold_tracks_drifting_distribution() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(42);
    let mut gate = QuantileGate::new(
        GateConfig::new("coverage", 0.70, ComparisonMode::Above)
            .with_min_samples(30)
            .with_window_size(200),
    )
    .unwrap();

    for _ in 0..200 {
        gate.record(rng.gen_range(0.0..0.5f32));
    }
    let low_regime = gate.get_threshold().unwrap();
    assert!(low_regime < 0.5);
    assert_eq!(gate.evaluate(0.6).status, GateStatus::Pass);

    // The retrieval quality improves; old samples age out of the window and
    // the same 0.6 stops clearing Q70.
    for _ in 0..200 {
        gate.record(rng.gen_range(0.5..1.0f32));
    }
    let high_regime = gate.get_threshold().unwrap();
    assert!(high_regime > low_regime);
    assert_eq!(gate.evaluate(0.6).status, GateStatus::Fail);
}

// =============================================================================
// Stage 1: gap detection
// =============================================================================

#[test]
fn empty_retrieval_emits_maximal_semantic_gap() {
    let mut detector = GapDetector::new(GapDetectionConfig::default()).unwrap();
    let gaps = detector.detect_gaps("stim-1", &[1.0, 0.0], &[], None);

    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].gap_type, GapType::Semantic);
    assert_eq!(gaps[0].strength, 1.0);
    assert!(gaps[0].retrieved_node_ids.is_empty());
    assert_eq!(detector.telemetry().semantic_gaps, 1);
}

#[test]
fn poor_coverage_fires_below_absolute_floor_even_while_cold() {
    let mut detector = GapDetector::new(GapDetectionConfig::default()).unwrap();
    let nodes = orthogonal_retrieval(&["n0", "n1", "n2"]);
    let gaps = detector.detect_gaps("stim-1", &[1.0, 0.0], &nodes, None);

    let semantic: Vec<_> = gaps
        .iter()
        .filter(|g| g.gap_type == GapType::Semantic)
        .collect();
    assert_eq!(semantic.len(), 1);
    assert_eq!(semantic[0].strength, 1.0);
    assert_eq!(
        semantic[0].retrieved_node_ids,
        vec!["n0".to_string(), "n1".to_string(), "n2".to_string()]
    );
}

// =============================================================================
// Stage 2: coalition assembly
// =============================================================================

#[test]
fn assembler_rejects_undersized_coalition_and_counts_it() {
    let mut detector = GapDetector::new(GapDetectionConfig::default()).unwrap();
    let mut assembler = CoalitionAssembler::new(CoalitionAssemblyConfig::default()).unwrap();

    // One isolated node cannot reach the minimum coalition size of 3.
    let mut graph = InMemoryGraph::new();
    graph.insert_typed_node("lonely", "memory");
    let nodes = orthogonal_retrieval(&["lonely"]);
    let gaps = detector.detect_gaps("stim-1", &[1.0, 0.0], &nodes, None);

    let coalition = assembler.assemble_coalition(&gaps[0], &graph);
    assert!(coalition.is_none());
    let telemetry = assembler.telemetry();
    assert_eq!(telemetry.coalitions_rejected, 1);
    assert_eq!(telemetry.coalitions_formed, 0);
}

// =============================================================================
// Full pipeline: gap -> coalition -> spawn -> membership learning
// =============================================================================

#[test]
fn full_pipeline_spawns_from_dense_cluster() {
    let graph = clique(6);
    let mut detector = GapDetector::new(GapDetectionConfig::default()).unwrap();
    let mut assembler = CoalitionAssembler::new(CoalitionAssemblyConfig::default()).unwrap();
    let mut validator = EmergenceValidator::new(EmergenceValidatorConfig::default()).unwrap();

    let nodes = orthogonal_retrieval(&["n0", "n1", "n2"]);
    let gaps = detector.detect_gaps("stim-1", &[1.0, 0.0], &nodes, None);
    assert!(!gaps.is_empty());

    let coalition = assembler
        .assemble_coalition(&gaps[0], &graph)
        .expect("clique should form a coalition");
    // Expansion pulls in clique neighbors beyond the three seeds.
    assert!(coalition.nodes.len() > 3);
    assert_eq!(coalition.density, 1.0);

    let size = coalition.nodes.len();
    let result = validator.validate_emergence(coalition, &graph, &[]);
    assert_eq!(result.decision, EmergenceDecision::Spawn);
    assert_eq!(result.reason, "All quality gates passed");

    let bundle = result.spawn_bundle.expect("spawn carries a bundle");
    let node_ids = bundle["node_ids"].as_array().unwrap();
    assert_eq!(node_ids.len(), size);

    // The spawned cluster now feeds the membership learner.
    let member_ids: Vec<String> = node_ids
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    let mut learner = MembershipWeightLearner::new(MembershipLearnerConfig::default()).unwrap();
    let frame = FrameState {
        subentities: HashMap::from([(
            "se1".to_string(),
            SubEntityState {
                energy: 0.9,
                member_nodes: member_ids.clone(),
            },
        )]),
        nodes: member_ids
            .iter()
            .map(|id| (id.clone(), NodeState { energy: 0.8 }))
            .collect(),
    };
    learner.observe_frame(&frame);
    let telemetry = learner.telemetry();
    assert_eq!(telemetry.observations_recorded, member_ids.len() as u64);
    assert_eq!(telemetry.tracked_subentities, 1);
}

// =============================================================================
// Terminal decisions: hard bounds and redirect
// =============================================================================

#[test]
fn validator_hard_bound_rejects_without_consulting_gates() {
    let graph = clique(6);
    let mut detector = GapDetector::new(GapDetectionConfig::default()).unwrap();
    let mut assembler = CoalitionAssembler::new(CoalitionAssemblyConfig::default()).unwrap();

    let mut config = EmergenceValidatorConfig::default();
    config.min_coalition_size = 10;
    let mut validator = EmergenceValidator::new(config).unwrap();

    let nodes = orthogonal_retrieval(&["n0", "n1", "n2"]);
    let gaps = detector.detect_gaps("stim-1", &[1.0, 0.0], &nodes, None);
    let coalition = assembler.assemble_coalition(&gaps[0], &graph).unwrap();

    let result = validator.validate_emergence(coalition, &graph, &[]);
    assert_eq!(result.decision, EmergenceDecision::Reject);
    assert!(result.reason.contains("too small"));
    assert!(result.gate_results.is_empty());
    assert_eq!(validator.telemetry().reject_count, 1);
}

#[test]
fn heavy_overlap_with_existing_cluster_redirects() {
    let graph = clique(10);
    let mut detector = GapDetector::new(GapDetectionConfig::default()).unwrap();
    let mut assembler = CoalitionAssembler::new(CoalitionAssemblyConfig::default()).unwrap();
    let mut validator = EmergenceValidator::new(EmergenceValidatorConfig::default()).unwrap();

    let nodes = orthogonal_retrieval(&["n0", "n1", "n2"]);
    let gaps = detector.detect_gaps("stim-1", &[1.0, 0.0], &nodes, None);
    let coalition = assembler.assemble_coalition(&gaps[0], &graph).unwrap();

    // An existing cluster already holds every coalition node.
    let existing = vec![ExistingSubEntity {
        id: "se_existing".to_string(),
        member_ids: coalition.node_ids(),
    }];
    let result = validator.validate_emergence(coalition, &graph, &existing);
    assert_eq!(result.decision, EmergenceDecision::Redirect);
    assert_eq!(result.redirect_target.as_deref(), Some("se_existing"));
    assert_eq!(validator.telemetry().redirect_count, 1);
}
