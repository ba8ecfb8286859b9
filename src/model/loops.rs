//! Natural loop detection using dominance analysis
//!
//! Populates per-block loop metadata (back-edge predecessors, enclosing
//! loop headers) that the refinement and the IPET model rely on. A back
//! edge is an edge whose target dominates its source; the loop body is the
//! header plus all blocks that reach the tail without passing the header.

use super::{Block, Function};
use petgraph::algo::dominators::simple_fast;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashSet;

/// Compute back edges and loop membership for every block of `function`.
///
/// Runs the Cooper et al. dominator algorithm on the block graph, then the
/// standard worklist for natural loop bodies. Loop headers on each block
/// are ordered outermost first. Blocks unreachable from the entry get no
/// loop metadata.
pub(crate) fn analyze_loops(function: &mut Function) {
    for block in &mut function.blocks {
        block.back_edge_preds.clear();
        block.loop_headers.clear();
    }
    if function.blocks.is_empty() {
        return;
    }

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    for block in &function.blocks {
        graph.add_node(block.index);
    }
    for block in &function.blocks {
        for &succ in &block.successors {
            graph.add_edge(NodeIndex::new(block.index), NodeIndex::new(succ), ());
        }
    }

    let entry = NodeIndex::new(0);
    let dominators = simple_fast(&graph, entry);

    // Back edges: (tail -> header) where header dominates tail
    let mut back_edges = Vec::new();
    for block in &function.blocks {
        let tail = NodeIndex::new(block.index);
        let Some(tail_doms) = dominators.dominators(tail) else {
            continue; // unreachable from entry
        };
        let doms: HashSet<NodeIndex> = tail_doms.collect();
        for &succ in &block.successors {
            if doms.contains(&NodeIndex::new(succ)) {
                back_edges.push((block.index, succ));
            }
        }
    }

    // Loop bodies, keyed by header; multiple back edges to one header
    // contribute to the same loop
    let mut headers: Vec<usize> = Vec::new();
    let mut bodies: Vec<HashSet<usize>> = Vec::new();
    for &(tail, header) in &back_edges {
        function.blocks[header].back_edge_preds.push(tail);
        let body = compute_loop_body(&function.blocks, header, tail);
        match headers.iter().position(|&h| h == header) {
            Some(ix) => bodies[ix].extend(body),
            None => {
                headers.push(header);
                bodies.push(body);
            }
        }
    }

    // Enclosing headers per block, outermost (largest body) first
    for block_ix in 0..function.blocks.len() {
        let mut enclosing: Vec<(usize, usize)> = headers
            .iter()
            .zip(&bodies)
            .filter(|(_, body)| body.contains(&block_ix))
            .map(|(&h, body)| (body.len(), h))
            .collect();
        enclosing.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        function.blocks[block_ix].loop_headers = enclosing.into_iter().map(|(_, h)| h).collect();
    }
}

/// Worklist over predecessors: everything that reaches `tail` without
/// passing through `header`, plus the header itself.
fn compute_loop_body(blocks: &[Block], header: usize, tail: usize) -> HashSet<usize> {
    let mut body = HashSet::new();
    let mut worklist = vec![tail];

    while let Some(node) = worklist.pop() {
        if node == header || body.contains(&node) {
            continue;
        }
        body.insert(node);
        for &pred in &blocks[node].predecessors {
            if pred != header && !body.contains(&pred) {
                worklist.push(pred);
            }
        }
    }

    body.insert(header);
    body
}

#[cfg(test)]
mod tests {
    use crate::model::{Level, Program};

    #[test]
    fn test_simple_loop_back_edge() {
        // h <-> body, h -> exit
        let mut pb = Program::builder();
        let f = pb.add_function(Level::Machinecode, "main", 0);
        let h = pb.add_block(f, false);
        let body = pb.add_block(f, false);
        let exit = pb.add_block(f, true);
        pb.add_edge(h, body);
        pb.add_edge(h, exit);
        pb.add_edge(body, h);
        let program = pb.finish();

        let header = program.block(h);
        assert!(header.is_loop_header());
        assert!(header.is_back_edge_from(body.block));
        assert_eq!(header.loop_headers, vec![h.block]);
        assert_eq!(program.block(body).loop_headers, vec![h.block]);
        assert_eq!(program.block(exit).loopnest(), 0);
    }

    #[test]
    fn test_nested_loops_outermost_first() {
        // outer: b0 -> b1 -> b2 -> b1 (inner), b2 -> b0 (outer), b0 -> b3
        let mut pb = Program::builder();
        let f = pb.add_function(Level::Machinecode, "main", 0);
        let pre = pb.add_block(f, false);
        let outer = pb.add_block(f, false);
        let inner = pb.add_block(f, false);
        let latch = pb.add_block(f, false);
        let done = pb.add_block(f, true);
        pb.add_edge(pre, outer);
        pb.add_edge(outer, inner);
        pb.add_edge(inner, inner); // self loop
        pb.add_edge(inner, latch);
        pb.add_edge(latch, outer);
        pb.add_edge(outer, done);
        let program = pb.finish();

        let inner_block = program.block(inner);
        assert_eq!(inner_block.loopnest(), 2);
        assert_eq!(inner_block.loop_headers, vec![outer.block, inner.block]);
        assert_eq!(program.block(latch).loop_headers, vec![outer.block]);
        assert_eq!(program.block(pre).loopnest(), 0);
    }

    #[test]
    fn test_acyclic_graph_has_no_loops() {
        let mut pb = Program::builder();
        let f = pb.add_function(Level::Machinecode, "main", 0);
        let b0 = pb.add_block(f, false);
        let b1 = pb.add_block(f, false);
        let b2 = pb.add_block(f, true);
        pb.add_edge(b0, b1);
        pb.add_edge(b0, b2);
        pb.add_edge(b1, b2);
        let program = pb.finish();

        for block in &program.function(f).blocks {
            assert!(!block.is_loop_header());
            assert_eq!(block.loopnest(), 0);
        }
    }

    #[test]
    fn test_diamond_merge_is_not_back_edge() {
        let mut pb = Program::builder();
        let f = pb.add_function(Level::Machinecode, "main", 0);
        let b0 = pb.add_block(f, false);
        let b1 = pb.add_block(f, false);
        let b2 = pb.add_block(f, false);
        let b3 = pb.add_block(f, true);
        pb.add_edge(b0, b1);
        pb.add_edge(b0, b2);
        pb.add_edge(b1, b3);
        pb.add_edge(b2, b3);
        let program = pb.finish();

        assert!(program.block(b3).back_edge_preds.is_empty());
    }
}
