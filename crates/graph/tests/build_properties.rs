//! Build/topological-order properties over generated graphs.
//!
//! Graphs come from a small deterministic generator so failures reproduce.

use std::collections::HashMap;

use exgraf_core::{NodeId, OpKind};
use exgraf_graph::{Graph, GraphError, GraphSpec, NodeSpec};

/// Minimal LCG so the test needs no extra dependencies.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// Random DAG: node k only reads from nodes with smaller k. Ids are
/// scrambled so id order and dependency order disagree.
fn random_dag(rng: &mut Lcg, size: u64) -> GraphSpec {
    let id_of = |k: u64| (k * 7919) % 10007;
    let mut nodes = Vec::new();
    for k in 0..size {
        let spec = if k < 2 {
            NodeSpec::new(id_of(k), OpKind::Placeholder { name: format!("p{k}") })
        } else if rng.below(2) == 0 {
            NodeSpec::new(id_of(k), OpKind::Neg).inputs([id_of(rng.below(k))])
        } else {
            NodeSpec::new(id_of(k), OpKind::Add).inputs([id_of(rng.below(k)), id_of(rng.below(k))])
        };
        nodes.push(spec);
    }
    GraphSpec::new(nodes, [id_of(size - 1)])
}

fn assert_topological(graph: &Graph) {
    let order: Vec<NodeId> = graph.topological_order().collect();
    assert_eq!(order.len(), graph.len());
    let pos: HashMap<NodeId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    for node in graph.nodes() {
        for input in &node.inputs {
            assert!(pos[input] < pos[&node.id]);
        }
    }
}

#[test]
fn acyclic_graphs_always_build_in_valid_order() {
    let mut rng = Lcg(0x5eed);
    for size in 2..40 {
        let spec = random_dag(&mut rng, size);
        let graph = Graph::build(spec).expect("acyclic spec must build");
        assert_topological(&graph);
    }
}

#[test]
fn back_edge_is_reported_as_cycle_containing_its_nodes() {
    let mut rng = Lcg(42);
    for size in 3..30 {
        let mut spec = random_dag(&mut rng, size);
        // Re-point the first Neg node at the last node: closes a cycle iff
        // the last node depends on it, otherwise the graph stays acyclic.
        let Some(pos) = spec.nodes.iter().position(|n| n.op == OpKind::Neg) else {
            continue;
        };
        let last = spec.nodes.last().map(|n| n.id).unwrap();
        let target = spec.nodes[pos].id;
        spec.nodes[pos].inputs = vec![last];

        let reachable = depends_on(&spec, last, target);

        match Graph::build(spec) {
            Err(GraphError::CycleDetected { nodes }) => {
                assert!(reachable || last == target);
                assert!(nodes.contains(&target), "{target} should be on the cycle {nodes:?}");
                assert!(nodes.contains(&last));
            }
            Ok(graph) => {
                assert!(!reachable);
                assert_topological(&graph);
            }
            Err(other) => panic!("unexpected error {other}"),
        }
    }
}

/// Whether `from` transitively reads `target` in the (possibly cyclic) spec.
fn depends_on(spec: &GraphSpec, from: NodeId, target: NodeId) -> bool {
    let by_id: HashMap<NodeId, &NodeSpec> = spec.nodes.iter().map(|n| (n.id, n)).collect();
    let mut stack = vec![from];
    let mut seen = std::collections::HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        for input in &by_id[&id].inputs {
            if *input == target {
                return true;
            }
            stack.push(*input);
        }
    }
    false
}
