use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use exgraf_core::{NodeId, OpKind, Shape};
use tracing::debug;

use crate::error::GraphError;
use crate::spec::{GraphSpec, Placement};
use crate::topo::TopologicalOrder;

/// A validated node. Shape is the inferred output shape when known.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: OpKind,
    pub inputs: Vec<NodeId>,
    pub shape: Option<Shape>,
    pub placement: Placement,
}

/// Validated, immutable dependency graph.
///
/// Nodes live in an arena ordered by id; every edge list refers to arena
/// indices. A node listing the same input twice contributes two edges.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    inputs: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// Position of each node in the topological order.
    rank: Vec<usize>,
    outputs: Vec<NodeId>,
    is_output: Vec<bool>,
}

impl Graph {
    /// Validate a spec and freeze it into a graph.
    ///
    /// Checks run in order: duplicate ids, dangling inputs, cycles, arity,
    /// output ids, then shape inference.
    pub fn build(spec: GraphSpec) -> Result<Graph, GraphError> {
        let GraphSpec {
            nodes: mut specs,
            outputs,
        } = spec;
        specs.sort_by_key(|n| n.id);

        let mut index = HashMap::with_capacity(specs.len());
        for (i, node) in specs.iter().enumerate() {
            if index.insert(node.id, i).is_some() {
                return Err(GraphError::DuplicateNode(node.id));
            }
        }

        let mut inputs = Vec::with_capacity(specs.len());
        let mut dependents = vec![Vec::new(); specs.len()];
        for (i, node) in specs.iter().enumerate() {
            let mut resolved = Vec::with_capacity(node.inputs.len());
            for input in &node.inputs {
                let &j = index.get(input).ok_or(GraphError::DanglingInput {
                    node: node.id,
                    input: *input,
                })?;
                resolved.push(j);
                dependents[j].push(i);
            }
            inputs.push(resolved);
        }

        let order = kahn_order(&inputs, &dependents);
        if order.len() != specs.len() {
            let ids: Vec<NodeId> = specs.iter().map(|n| n.id).collect();
            return Err(GraphError::CycleDetected {
                nodes: find_cycle(&inputs, &order, &ids),
            });
        }

        for node in &specs {
            if node.inputs.len() != node.op.arity() {
                return Err(GraphError::ArityMismatch {
                    node: node.id,
                    op: node.op.name(),
                    expected: node.op.arity(),
                    actual: node.inputs.len(),
                });
            }
        }

        let mut is_output = vec![false; specs.len()];
        let mut unique_outputs = Vec::with_capacity(outputs.len());
        for id in outputs {
            let &i = index.get(&id).ok_or(GraphError::UnknownOutput(id))?;
            if !is_output[i] {
                is_output[i] = true;
                unique_outputs.push(id);
            }
        }

        let mut rank = vec![0; specs.len()];
        for (pos, &i) in order.iter().enumerate() {
            rank[i] = pos;
        }
        unique_outputs.sort_by_key(|id| rank[index[id]]);

        let mut nodes: Vec<Node> = specs
            .into_iter()
            .map(|s| Node {
                id: s.id,
                op: s.op,
                inputs: s.inputs,
                shape: s.shape,
                placement: s.placement,
            })
            .collect();
        infer_shapes(&mut nodes, &inputs, &order)?;

        debug!(
            nodes = nodes.len(),
            outputs = unique_outputs.len(),
            "graph built"
        );

        Ok(Graph {
            nodes,
            index,
            inputs,
            dependents,
            rank,
            outputs: unique_outputs,
            is_output,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Arena index of a node id.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Input indices of a node, in input order.
    pub fn inputs(&self, idx: usize) -> &[usize] {
        &self.inputs[idx]
    }

    /// Indices of nodes consuming this node, one entry per edge.
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Position of a node in [`Graph::topological_order`].
    pub fn rank(&self, idx: usize) -> usize {
        self.rank[idx]
    }

    /// Output ids, in topological order.
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn is_output(&self, idx: usize) -> bool {
        self.is_output[idx]
    }

    /// Lazy, restartable topological order with node id as tie-break.
    pub fn topological_order(&self) -> TopologicalOrder<'_> {
        TopologicalOrder::new(self)
    }

    /// Mask of nodes that are outputs or ancestors of outputs.
    pub fn output_ancestors(&self) -> Vec<bool> {
        let mut mask = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = self.outputs.iter().map(|id| self.index[id]).collect();
        while let Some(i) = stack.pop() {
            if mask[i] {
                continue;
            }
            mask[i] = true;
            stack.extend(self.inputs[i].iter().copied().filter(|&j| !mask[j]));
        }
        mask
    }

    /// Every node reachable from `idx` through dependent edges, excluding `idx`.
    pub fn downstream(&self, idx: usize) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = self.dependents[idx].clone();
        let mut out = Vec::new();
        while let Some(i) = stack.pop() {
            if seen[i] {
                continue;
            }
            seen[i] = true;
            out.push(i);
            stack.extend(self.dependents[i].iter().copied());
        }
        out.sort_by_key(|&i| self.rank[i]);
        out
    }
}

/// Kahn's algorithm with a min-heap on node id (arena order follows id order).
///
/// Returns fewer indices than nodes when a cycle exists.
fn kahn_order(inputs: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = inputs.iter().map(Vec::len).collect();
    let mut heap: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(inputs.len());
    while let Some(Reverse(i)) = heap.pop() {
        order.push(i);
        for &dep in &dependents[i] {
            in_degree[dep] -= 1;
            if in_degree[dep] == 0 {
                heap.push(Reverse(dep));
            }
        }
    }
    order
}

/// Extract one concrete cycle among the nodes Kahn could not order.
///
/// Every leftover node has a leftover input, so walking inputs from any
/// leftover node must revisit a node; the walk from that node is the cycle.
/// Starts at the smallest id and prefers the smallest input to stay deterministic.
fn find_cycle(inputs: &[Vec<usize>], ordered: &[usize], ids: &[NodeId]) -> Vec<NodeId> {
    let mut done = vec![false; inputs.len()];
    for &i in ordered {
        done[i] = true;
    }
    let Some(start) = (0..inputs.len()).find(|&i| !done[i]) else {
        return Vec::new();
    };

    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut path = Vec::new();
    let mut current = start;
    while !position.contains_key(&current) {
        position.insert(current, path.len());
        path.push(current);
        match inputs[current].iter().copied().filter(|&j| !done[j]).min() {
            Some(next) => current = next,
            None => break,
        }
    }
    let from = position.get(&current).copied().unwrap_or(0);
    // Walked against edge direction; reverse so the cycle reads producer -> consumer.
    let mut cycle: Vec<NodeId> = path[from..].iter().map(|&i| ids[i]).collect();
    cycle.reverse();
    cycle
}

fn infer_shapes(nodes: &mut [Node], inputs: &[Vec<usize>], order: &[usize]) -> Result<(), GraphError> {
    for &i in order {
        let known: Option<Vec<Shape>> = inputs[i].iter().map(|&j| nodes[j].shape).collect();
        let node = &nodes[i];
        let inferred = match &node.op {
            OpKind::Placeholder { .. } => None,
            OpKind::Constant { value } => Some(value.shape()),
            op => match known {
                Some(shapes) => Some(op.infer_shape(&shapes).map_err(|source| {
                    GraphError::ShapeMismatch {
                        node: node.id,
                        source,
                    }
                })?),
                None => None,
            },
        };
        match (node.shape, inferred) {
            (Some(declared), Some(inferred)) if declared != inferred => {
                return Err(GraphError::DeclaredShapeConflict {
                    node: node.id,
                    declared,
                    inferred,
                });
            }
            (_, Some(inferred)) => nodes[i].shape = Some(inferred),
            (_, None) => {}
        }
    }
    Ok(())
}
