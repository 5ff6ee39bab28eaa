use std::cmp::Reverse;
use std::collections::BinaryHeap;

use exgraf_core::NodeId;

use crate::graph::Graph;

/// Lazy topological walk over a [`Graph`].
///
/// Each call to `next` releases at most one node, smallest id first among
/// those whose inputs have all been yielded. Two graphs built from the same
/// node set therefore yield the same sequence. Call
/// [`Graph::topological_order`] again (or clone) to restart.
#[derive(Debug, Clone)]
pub struct TopologicalOrder<'g> {
    graph: &'g Graph,
    in_degree: Vec<usize>,
    ready: BinaryHeap<Reverse<usize>>,
}

impl<'g> TopologicalOrder<'g> {
    pub(crate) fn new(graph: &'g Graph) -> Self {
        let in_degree: Vec<usize> = (0..graph.len()).map(|i| graph.inputs(i).len()).collect();
        let ready = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        Self {
            graph,
            in_degree,
            ready,
        }
    }

    /// Like `next`, but yields arena indices.
    pub fn next_index(&mut self) -> Option<usize> {
        let Reverse(i) = self.ready.pop()?;
        for &dep in self.graph.dependents(i) {
            self.in_degree[dep] -= 1;
            if self.in_degree[dep] == 0 {
                self.ready.push(Reverse(dep));
            }
        }
        Some(i)
    }
}

impl Iterator for TopologicalOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        self.next_index().map(|i| self.graph.node(i).id)
    }
}
