use cycleforge_core::ir::{Choice, Decision, DecisionKind, Model, Node, NodeId, Op, Operand};
use cycleforge_core::rng::Rng;
use proptest::prelude::*;

/// A random DAG in topological order: each node depends on a subset of its
/// predecessors, some with a hot two-way decision.
fn arb_model() -> impl Strategy<Value = Model> {
    (2usize..24, any::<u64>()).prop_map(|(n, seed)| {
        let mut rng = Rng::with_seed(seed);
        let nodes: Vec<Node> = (0..n as NodeId)
            .map(|i| {
                let mut args = vec![Operand::Imm(i as u64), Operand::Imm(1)];
                if i > 0 {
                    let dep_count = rng.uniform_index(2.min(i as usize) + 1);
                    for _ in 0..dep_count {
                        let d = rng.uniform_index(i as usize) as NodeId;
                        args[0] = Operand::node_ref(d);
                    }
                }
                let mut node = Node::new(i, Op::Lea, args);
                if rng.coin() {
                    node.decisions.push(Decision::new(
                        DecisionKind::CarryFlag,
                        vec![Choice::FlagC, Choice::FlagO],
                        0,
                        true,
                    ));
                }
                node
            })
            .collect();
        Model::new(nodes).expect("generated order is topological")
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn mutation_then_revert_restores_the_exported_state(
        model in arb_model(),
        seed in any::<u64>(),
        steps in 1usize..40,
    ) {
        let mut model = model;
        let mut rng = Rng::with_seed(seed);
        for _ in 0..steps {
            let before = model.export().unwrap();
            if rng.coin() {
                model.mutate_permutation(&mut rng);
            } else if model.mutate_decision(&mut rng).is_none() {
                model.mutate_permutation(&mut rng);
            }
            model.revert_last_mutation().unwrap();
            prop_assert_eq!(model.export().unwrap(), before);
        }
    }

    #[test]
    fn every_permutation_keeps_a_valid_topological_order(
        model in arb_model(),
        seed in any::<u64>(),
        steps in 1usize..60,
    ) {
        let mut model = model;
        let mut rng = Rng::with_seed(seed);
        for _ in 0..steps {
            model.mutate_permutation(&mut rng);
            prop_assert!(model.is_topologically_ordered());
        }
    }

    #[test]
    fn snapshot_survives_arbitrary_mutation_storms(
        model in arb_model(),
        seed in any::<u64>(),
        steps in 1usize..60,
    ) {
        let mut model = model;
        let mut rng = Rng::with_seed(seed);
        model.save_snapshot("pin");
        let pinned = model.export().unwrap();
        for _ in 0..steps {
            if model.mutate_decision(&mut rng).is_none() {
                model.mutate_permutation(&mut rng);
            }
        }
        model.restore_snapshot("pin").unwrap();
        prop_assert_eq!(model.export().unwrap(), pinned);
    }

    #[test]
    fn export_import_is_lossless(
        model in arb_model(),
        seed in any::<u64>(),
    ) {
        let mut model = model;
        let mut rng = Rng::with_seed(seed);
        for _ in 0..10 {
            model.mutate_permutation(&mut rng);
        }
        let json = model.export().unwrap();
        let back = Model::import_str(&json).unwrap();
        prop_assert_eq!(back.export().unwrap(), json);
    }
}
