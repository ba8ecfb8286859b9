//! Relation-graph coupling and marker resolution
//!
//! Builds a function pair (bitcode and machine code) tied by a relation
//! graph and checks the three coupling constraint families, plus the
//! marker-to-block expansion of bitcode flow facts.

use anyhow::Result;
use ipet::model::{
    FlowFact, Level, Program, ProgramPoint, RelationGraph, RelationGraphStatus, RelationNodeKind,
    Rhs, RgNodeRef, RgSide, Scope, Term,
};
use ipet::{
    BuildOptions, ConstraintOp, ConstraintSink, ConstraintTag, EdgeId, IpetBuilder, LinearSystem,
    Variable, ZeroCost,
};

struct Paired {
    program: Program,
    mc_blocks: Vec<ipet::model::BlockRef>,
    bc_blocks: Vec<ipet::model::BlockRef>,
}

/// Two-block `main` on both sides, related entry -> progress -> exit.
fn paired_program(status: RelationGraphStatus, markers: &[(usize, &str)]) -> Paired {
    let mut pb = Program::builder();
    let mc = pb.add_function(Level::Machinecode, "main", 0x100);
    let m0 = pb.add_block(mc, false);
    let m1 = pb.add_block(mc, true);
    pb.add_edge(m0, m1);

    let bc = pb.add_function(Level::Bitcode, "main", 0);
    let s0 = pb.add_block(bc, false);
    let s1 = pb.add_block(bc, true);
    pb.add_edge(s0, s1);
    for &(block, marker) in markers {
        pb.add_marker([s0, s1][block], marker);
    }

    let mut rg = RelationGraph::new(0, bc, mc, status);
    let entry = rg.add_node(RelationNodeKind::Entry, Some(0), Some(0));
    let progress = rg.add_node(RelationNodeKind::Progress, Some(1), Some(1));
    let exit = rg.add_node(RelationNodeKind::Exit, None, None);
    rg.add_successor(RgSide::Src, entry, progress);
    rg.add_successor(RgSide::Dst, entry, progress);
    rg.add_successor(RgSide::Src, progress, exit);
    rg.add_successor(RgSide::Dst, progress, exit);
    pb.add_relation_graph(rg);

    Paired { program: pb.finish(), mc_blocks: vec![m0, m1], bc_blocks: vec![s0, s1] }
}

/// Route dropped-fact warnings through the usual subscriber when a test
/// run asks for them (RUST_LOG).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .try_init()
        .ok();
}

fn build_bitcode(program: &Program, flowfacts: &[FlowFact], accept_corrected: bool) -> Result<LinearSystem> {
    init_tracing();
    let options = BuildOptions {
        use_bitcode: true,
        accept_corrected_rgs: accept_corrected,
        ..BuildOptions::default()
    };
    let mut builder = IpetBuilder::new(program, options, &ZeroCost);
    let mut sink = LinearSystem::new();
    builder.build(&mut sink, flowfacts)?;
    Ok(sink)
}

fn rg_edge(side: RgSide, from: usize, to: usize) -> Variable {
    Variable::Edge(EdgeId::relation_edge(
        side,
        RgNodeRef { graph: 0, node: from },
        RgNodeRef { graph: 0, node: to },
    ))
}

#[test]
fn relation_edges_couple_both_sides() -> Result<()> {
    let p = paired_program(RelationGraphStatus::Valid, &[]);
    let sink = build_bitcode(&p.program, &[], false)?;

    let mc_edge = Variable::Edge(EdgeId::block_edge(Level::Machinecode, p.mc_blocks[0], p.mc_blocks[1]));
    let bc_edge = Variable::Edge(EdgeId::block_edge(Level::Bitcode, p.bc_blocks[0], p.bc_blocks[1]));
    let mc_exit = Variable::Edge(EdgeId::exit_edge(Level::Machinecode, p.mc_blocks[1]));
    let bc_exit = Variable::Edge(EdgeId::exit_edge(Level::Bitcode, p.bc_blocks[1]));

    // all four relation edges are declared, once per side
    for side in [RgSide::Src, RgSide::Dst] {
        assert!(sink.has_variable(&rg_edge(side, 0, 1)));
        assert!(sink.has_variable(&rg_edge(side, 1, 2)));
    }

    // (3),(4): each CFG edge equals the relation edges projecting onto it
    let bc_coupling = sink.constraint_by_name("rg_edge_main/0->main/1|bitcode").unwrap();
    assert_eq!(bc_coupling.terms, vec![(rg_edge(RgSide::Src, 0, 1), 1), (bc_edge, -1)]);
    assert_eq!((bc_coupling.op, bc_coupling.rhs), (ConstraintOp::Equal, 0));

    let mc_coupling = sink.constraint_by_name("rg_edge_main/0->main/1|machinecode").unwrap();
    assert_eq!(mc_coupling.terms, vec![(rg_edge(RgSide::Dst, 0, 1), 1), (mc_edge, -1)]);

    let bc_exit_coupling = sink.constraint_by_name("rg_edge_main/1->exit|bitcode").unwrap();
    assert_eq!(bc_exit_coupling.terms, vec![(rg_edge(RgSide::Src, 1, 2), 1), (bc_exit, -1)]);

    let mc_exit_coupling = sink.constraint_by_name("rg_edge_main/1->exit|machinecode").unwrap();
    assert_eq!(mc_exit_coupling.terms, vec![(rg_edge(RgSide::Dst, 1, 2), 1), (mc_exit, -1)]);

    // (5): at entry/progress nodes both sides flow equally
    let entry_progress = sink.constraint_by_name("rg_progress_main_0").unwrap();
    assert_eq!(
        entry_progress.terms,
        vec![(rg_edge(RgSide::Src, 0, 1), 1), (rg_edge(RgSide::Dst, 0, 1), -1)]
    );
    let progress = sink.constraint_by_name("rg_progress_main_1").unwrap();
    assert_eq!(
        progress.terms,
        vec![(rg_edge(RgSide::Src, 1, 2), 1), (rg_edge(RgSide::Dst, 1, 2), -1)]
    );

    // bitcode flow conservation was emitted alongside the machine one
    let structurals: Vec<_> = sink
        .constraints()
        .iter()
        .filter(|c| c.name == "structural_main/1")
        .collect();
    assert_eq!(structurals.len(), 2);
    assert_eq!(structurals[1].terms, vec![(bc_exit, 1), (bc_edge, -1)]);
    Ok(())
}

#[test]
fn marker_facts_lower_to_block_frequencies() -> Result<()> {
    // the marker appears in both bitcode blocks
    let p = paired_program(RelationGraphStatus::Valid, &[(0, "lap"), (1, "lap")]);
    let bc = p.program.lookup(Level::Bitcode, "main").unwrap();

    let fact = FlowFact::new(
        "lap-bound",
        Level::Bitcode,
        Scope::function(bc),
        vec![Term::new(2, ProgramPoint::Marker("lap".to_string()))],
        ConstraintOp::LessEqual,
        Rhs::Constant(10),
    );
    let sink = build_bitcode(&p.program, &[fact], false)?;

    let bc_edge = Variable::Edge(EdgeId::block_edge(Level::Bitcode, p.bc_blocks[0], p.bc_blocks[1]));
    let bc_exit = Variable::Edge(EdgeId::exit_edge(Level::Bitcode, p.bc_blocks[1]));

    // 2*freq(s0) + 2*freq(s1) - 10*freq(main) <= 0, coefficient-merged
    let ff = sink.constraint_by_name("ff_1").unwrap();
    assert_eq!(ff.tag, ConstraintTag::Flowfact);
    assert_eq!(ff.op, ConstraintOp::LessEqual);
    assert_eq!(ff.terms, vec![(bc_edge, -8), (bc_exit, 2)]);
    Ok(())
}

#[test]
fn unknown_marker_drops_the_fact() -> Result<()> {
    let p = paired_program(RelationGraphStatus::Valid, &[(0, "lap")]);
    let bc = p.program.lookup(Level::Bitcode, "main").unwrap();

    let fact = FlowFact::new(
        "missing-marker",
        Level::Bitcode,
        Scope::function(bc),
        vec![Term::new(1, ProgramPoint::Marker("not-there".to_string()))],
        ConstraintOp::LessEqual,
        Rhs::Constant(1),
    );
    let sink = build_bitcode(&p.program, &[fact], false)?;

    assert_eq!(sink.constraints_tagged(ConstraintTag::Flowfact).count(), 0);
    Ok(())
}

#[test]
fn corrected_relation_graph_needs_opt_in() -> Result<()> {
    let p = paired_program(RelationGraphStatus::Corrected, &[]);
    let bc_edge = Variable::Edge(EdgeId::block_edge(Level::Bitcode, p.bc_blocks[0], p.bc_blocks[1]));

    // rejected by default: no bitcode variables at all
    let sink = build_bitcode(&p.program, &[], false)?;
    assert!(!sink.has_variable(&bc_edge));

    // accepted when the build opts in
    let sink = build_bitcode(&p.program, &[], true)?;
    assert!(sink.has_variable(&bc_edge));
    Ok(())
}

#[test]
fn bitcode_fact_without_bitcode_level_is_dropped() -> Result<()> {
    let p = paired_program(RelationGraphStatus::Valid, &[]);
    let bc = p.program.lookup(Level::Bitcode, "main").unwrap();

    let fact = FlowFact::new(
        "bc-only",
        Level::Bitcode,
        Scope::function(bc),
        vec![Term::new(1, ProgramPoint::Block(p.bc_blocks[1]))],
        ConstraintOp::LessEqual,
        Rhs::Constant(3),
    );

    // plain machine-code build: the bitcode fact is skipped with a warning
    init_tracing();
    let mut builder = IpetBuilder::new(&p.program, BuildOptions::default(), &ZeroCost);
    let mut sink = LinearSystem::new();
    builder.build(&mut sink, &[fact])?;
    assert_eq!(sink.constraints_tagged(ConstraintTag::Flowfact).count(), 0);
    Ok(())
}

#[test]
fn integer_constant_terms_move_to_the_rhs() -> Result<()> {
    let p = paired_program(RelationGraphStatus::Valid, &[]);
    let mc = p.program.lookup(Level::Machinecode, "main").unwrap();

    // freq(m1) + 3 <= 10  ~>  freq(m1) <= 7
    let fact = FlowFact::new(
        "const-term",
        Level::Machinecode,
        Scope::function(mc),
        vec![
            Term::new(1, ProgramPoint::Block(p.mc_blocks[1])),
            Term::new(3, ProgramPoint::Constant(1)),
        ],
        ConstraintOp::LessEqual,
        Rhs::Constant(10),
    );
    let sink = build_bitcode(&p.program, &[fact], false)?;

    let mc_exit = Variable::Edge(EdgeId::exit_edge(Level::Machinecode, p.mc_blocks[1]));
    let mc_edge = Variable::Edge(EdgeId::block_edge(Level::Machinecode, p.mc_blocks[0], p.mc_blocks[1]));
    let ff = sink.constraint_by_name("ff_1").unwrap();
    // freq(m1) - 7*freq(main) <= 0
    assert_eq!(ff.terms, vec![(mc_exit, 1), (mc_edge, -7)]);
    Ok(())
}
