//! Graphviz rendering of a built graph.

use std::fmt::Write;

use crate::graph::Graph;
use crate::spec::Placement;

impl Graph {
    /// Render the graph in DOT. Outputs are drawn with a double border,
    /// pinned nodes carry their worker in the label.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph exgraf {\n    rankdir=LR;\n    node [shape=box];\n");
        for idx in self.topological_order().filter_map(|id| self.index_of(id)) {
            let node = self.node(idx);
            let mut label = format!("{}\\n{}", node.id, node.op);
            if let Some(shape) = node.shape {
                let _ = write!(label, " {shape}");
            }
            if let Placement::Pinned(worker) = &node.placement {
                let _ = write!(label, "\\n@{worker}");
            }
            let style = if self.is_output(idx) { ", peripheries=2" } else { "" };
            let _ = writeln!(out, "    {} [label=\"{}\"{}];", node.id, label, style);
        }
        for node in self.nodes() {
            for input in &node.inputs {
                let _ = writeln!(out, "    {} -> {};", input, node.id);
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use exgraf_core::{OpKind, WorkerId};

    use crate::graph::Graph;
    use crate::spec::{GraphSpec, NodeSpec, Placement};

    #[test]
    fn dot_lists_nodes_and_edges() {
        let g = Graph::build(GraphSpec::new(
            vec![
                NodeSpec::new(1, OpKind::Placeholder { name: "x".into() }).shape(1, 3),
                NodeSpec::new(2, OpKind::Softmax)
                    .inputs([1])
                    .placement(Placement::Pinned(WorkerId::from("gpu0"))),
            ],
            [2],
        ))
        .unwrap();

        let dot = g.to_dot();
        assert!(dot.starts_with("digraph exgraf {"));
        assert!(dot.contains("n1 -> n2;"));
        assert!(dot.contains("placeholder(x) (1, 3)"));
        assert!(dot.contains("@gpu0"));
        assert!(dot.contains("n2 [label=\"n2\\nsoftmax (1, 3)\\n@gpu0\", peripheries=2];"));
    }
}
