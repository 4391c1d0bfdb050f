// Runtime tests: check → assemble → drive sessions end-to-end.
//
// The assembler must expose exactly the match nodes the checker computed,
// and the single-threaded pump must carry session data from the input
// virtual nodes through flowunits to the output virtual nodes, with end
// markers, errors, and aborts handled per the node contract.

use std::collections::HashMap;
use std::time::Duration;

use flowgraph::assemble::{AssembleOptions, ExecutableGraph};
use flowgraph::buffer::{Buffer, FlowunitError};
use flowgraph::checker::{check, CheckedGraph};
use flowgraph::descriptor::{DescriptorRegistry, FlowunitCategory, FlowunitDesc};
use flowgraph::graph::{DeviceBinding, GraphBuilder, GraphNode};
use flowgraph::node::{Flowunit, NodeState, ProcessContext};
use flowgraph::session::{RecvResult, OutputMap};

// ── Fixtures ────────────────────────────────────────────────────────────────

fn registry() -> DescriptorRegistry {
    let mut r = DescriptorRegistry::new();
    let stream = |name: &str, ins: &[&str], outs: &[&str]| {
        FlowunitDesc::new(name, ins, outs, FlowunitCategory::Stream)
    };
    r.register(stream("test_1_1", &["In_1"], &["Out_1"])).unwrap();
    r.register(stream("test_2_1", &["In_1", "In_2"], &["Out_1"])).unwrap();
    r.register(FlowunitDesc::new(
        "condition_1_2",
        &["In_1"],
        &["Out_1", "Out_2"],
        FlowunitCategory::Condition,
    ))
    .unwrap();
    r.register(FlowunitDesc::new(
        "expand_1_1",
        &["In_1"],
        &["Out_1"],
        FlowunitCategory::Expand,
    ))
    .unwrap();
    r.register(FlowunitDesc::new(
        "collapse_1_1",
        &["In_1"],
        &["Out_1"],
        FlowunitCategory::Collapse,
    ))
    .unwrap();
    r
}

/// Forwards every input buffer to `Out_1`.
struct Passthrough;

impl Flowunit for Passthrough {
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FlowunitError> {
        let buffers: Vec<Buffer> = ctx.inputs().values().flatten().cloned().collect();
        for buffer in buffers {
            ctx.emit("Out_1", buffer);
        }
        Ok(())
    }
}

struct FailingOpen;

impl Flowunit for FailingOpen {
    fn open(&mut self) -> Result<(), FlowunitError> {
        Err(FlowunitError::new("decode", "device unavailable"))
    }

    fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<(), FlowunitError> {
        Ok(())
    }
}

struct FailingProcess;

impl Flowunit for FailingProcess {
    fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<(), FlowunitError> {
        Err(FlowunitError::new("decode", "bad frame"))
    }
}

fn passthrough_provider() -> impl Fn(&GraphNode) -> Box<dyn Flowunit> {
    |_node: &GraphNode| Box::new(Passthrough) as Box<dyn Flowunit>
}

fn linear_graph(registry: &DescriptorRegistry) -> CheckedGraph {
    let mut b = GraphBuilder::new(registry);
    b.add_input("input1").unwrap();
    b.add_output("output1").unwrap();
    b.add_node("b", "test_1_1", DeviceBinding::cpu()).unwrap();
    b.connect_input("input1", "b", "In_1").unwrap();
    b.connect_output("b", "Out_1", "output1").unwrap();
    check(b.build()).unwrap()
}

fn drain(io: &flowgraph::session::SessionIo) -> (Vec<OutputMap>, bool) {
    let mut maps = Vec::new();
    loop {
        match io.recv(Some(Duration::from_millis(10))) {
            RecvResult::Ok(map) => maps.push(map),
            RecvResult::NoData => return (maps, true),
            RecvResult::Timeout => return (maps, false),
        }
    }
}

// ── Round trip ──────────────────────────────────────────────────────────────

#[test]
fn assembled_match_nodes_mirror_the_checker() {
    let registry = registry();
    let mut b = GraphBuilder::new(&registry);
    b.add_input("input1").unwrap();
    b.add_output("output1").unwrap();
    for (name, flowunit) in [
        ("b", "expand_1_1"),
        ("c", "condition_1_2"),
        ("d", "test_1_1"),
        ("e", "collapse_1_1"),
    ] {
        b.add_node(name, flowunit, DeviceBinding::cpu()).unwrap();
    }
    b.connect_input("input1", "b", "In_1").unwrap();
    b.connect("b", "Out_1", "c", "In_1").unwrap();
    b.connect("c", "Out_1", "d", "In_1").unwrap();
    b.connect("c", "Out_2", "d", "In_1").unwrap();
    b.connect("d", "Out_1", "e", "In_1").unwrap();
    b.connect_output("e", "Out_1", "output1").unwrap();

    let checked = check(b.build()).unwrap();
    let graph = ExecutableGraph::assemble(
        &checked,
        &passthrough_provider(),
        &AssembleOptions::default(),
    );

    for node in checked.graph().nodes() {
        let runtime = graph.get_node(&node.name).expect("every node assembled");
        let expected = checked.match_node(&node.name).map(|m| m.name.clone());
        let actual = runtime.match_node().map(|m| m.name().to_string());
        assert_eq!(actual, expected, "match mismatch on '{}'", node.name);
    }

    // Spot checks on the interesting nodes.
    let match_of = |name: &str| {
        graph
            .get_node(name)
            .unwrap()
            .match_node()
            .map(|m| m.name().to_string())
    };
    assert_eq!(match_of("c"), Some("b".into()));
    assert_eq!(match_of("d"), Some("c".into()));
    assert_eq!(match_of("e"), Some("b".into()));
    assert_eq!(match_of("b"), None);
}

#[test]
fn independent_outputs_are_decided_one_by_one() {
    // Two internally consistent outputs: one fed straight from the top
    // level, one from a collapse closing its own expand. Neither output's
    // own producers disagree, so neither falls back to the cache-based
    // unmatched variant, even though the two outputs' matches differ.
    let registry = registry();
    let mut b = GraphBuilder::new(&registry);
    b.add_input("input1").unwrap();
    b.add_output("output1").unwrap();
    b.add_output("output2").unwrap();
    for (name, flowunit) in [
        ("plain", "test_1_1"),
        ("open", "expand_1_1"),
        ("inner", "test_1_1"),
        ("fold", "collapse_1_1"),
    ] {
        b.add_node(name, flowunit, DeviceBinding::cpu()).unwrap();
    }
    b.connect_input("input1", "plain", "In_1").unwrap();
    b.connect_output("plain", "Out_1", "output1").unwrap();
    b.connect_input("input1", "open", "In_1").unwrap();
    b.connect("open", "Out_1", "inner", "In_1").unwrap();
    b.connect("inner", "Out_1", "fold", "In_1").unwrap();
    b.connect_output("fold", "Out_1", "output2").unwrap();

    let checked = check(b.build()).unwrap();
    let graph = ExecutableGraph::assemble(
        &checked,
        &passthrough_provider(),
        &AssembleOptions::default(),
    );
    assert!(!graph.get_node("output1").unwrap().is_unmatch_output());
    assert!(!graph.get_node("output2").unwrap().is_unmatch_output());

    graph.open_all().unwrap();
    let io = graph.create_session();
    io.push_data("input1", vec![5u8], None).unwrap();
    io.close();
    graph.run_until_idle().unwrap();

    let (maps, ended) = drain(&io);
    assert!(ended, "session must end only after both outputs drained it");
    let per_port = |port: &str| -> Vec<u8> {
        maps.iter()
            .flat_map(|m| m.get(port).into_iter().flatten())
            .map(|b| b.payload[0])
            .collect()
    };
    assert_eq!(per_port("output1"), vec![5]);
    assert_eq!(per_port("output2"), vec![5]);
    assert!(io.last_error().is_none());
}

#[test]
fn disagreeing_producers_put_an_output_on_the_cache_path() {
    // One branch of the condition reaches the output through a node (whose
    // match is the condition), the other arrives straight from the
    // condition (match none): that single output caches per session.
    let registry = registry();
    let mut b = GraphBuilder::new(&registry);
    b.add_input("input1").unwrap();
    b.add_output("output1").unwrap();
    b.add_node("gate", "condition_1_2", DeviceBinding::cpu()).unwrap();
    b.add_node("c", "test_1_1", DeviceBinding::cpu()).unwrap();
    b.connect_input("input1", "gate", "In_1").unwrap();
    b.connect("gate", "Out_1", "c", "In_1").unwrap();
    b.connect_output("c", "Out_1", "output1").unwrap();
    b.connect_output("gate", "Out_2", "output1").unwrap();

    let checked = check(b.build()).unwrap();
    let graph = ExecutableGraph::assemble(
        &checked,
        &passthrough_provider(),
        &AssembleOptions::default(),
    );
    assert!(graph.get_node("output1").unwrap().is_unmatch_output());

    graph.open_all().unwrap();
    let io = graph.create_session();
    io.push_data("input1", vec![3u8], None).unwrap();
    io.close();
    graph.run_until_idle().unwrap();

    let (maps, ended) = drain(&io);
    assert!(ended);
    let payloads: Vec<u8> = maps
        .iter()
        .flat_map(|m| m.get("output1").into_iter().flatten())
        .map(|b| b.payload[0])
        .collect();
    assert_eq!(payloads, vec![3]);
}

// ── Session data flow ───────────────────────────────────────────────────────

#[test]
fn linear_session_delivers_buffers_in_order() {
    let registry = registry();
    let checked = linear_graph(&registry);
    let graph = ExecutableGraph::assemble(
        &checked,
        &passthrough_provider(),
        &AssembleOptions::default(),
    );
    graph.open_all().unwrap();

    let io = graph.create_session();
    for i in 0..3u8 {
        io.push_data("input1", vec![i], None).unwrap();
    }
    io.close();
    graph.run_until_idle().unwrap();

    let (maps, ended) = drain(&io);
    assert!(ended, "session should report NoData after its end marker");
    let payloads: Vec<u8> = maps
        .iter()
        .flat_map(|m| m.get("output1").into_iter().flatten())
        .map(|b| b.payload[0])
        .collect();
    assert_eq!(payloads, vec![0, 1, 2]);
    assert!(io.last_error().is_none());

    graph.close_all();
    assert_eq!(graph.get_node("b").unwrap().state(), NodeState::Closed);
}

#[test]
fn sessions_are_isolated_from_each_other() {
    let registry = registry();
    let checked = linear_graph(&registry);
    let graph = ExecutableGraph::assemble(
        &checked,
        &passthrough_provider(),
        &AssembleOptions::default(),
    );
    graph.open_all().unwrap();

    let first = graph.create_session();
    let second = graph.create_session();
    first.push_data("input1", vec![1u8], None).unwrap();
    second.push_data("input1", vec![2u8], None).unwrap();
    first.close();
    second.close();
    graph.run_until_idle().unwrap();

    let (first_maps, _) = drain(&first);
    let (second_maps, _) = drain(&second);
    let only = |maps: &[OutputMap]| -> Vec<u8> {
        maps.iter()
            .flat_map(|m| m.get("output1").into_iter().flatten())
            .map(|b| b.payload[0])
            .collect()
    };
    assert_eq!(only(&first_maps), vec![1]);
    assert_eq!(only(&second_maps), vec![2]);
}

#[test]
fn batch_size_limits_buffers_per_tick_but_not_delivery() {
    let registry = registry();
    let checked = linear_graph(&registry);
    let options = AssembleOptions {
        per_node: HashMap::from([(
            "b".to_string(),
            flowgraph::node::NodeConfig {
                batch_size: 1,
                ..Default::default()
            },
        )]),
        ..Default::default()
    };
    let graph = ExecutableGraph::assemble(&checked, &passthrough_provider(), &options);
    graph.open_all().unwrap();

    let io = graph.create_session();
    for i in 0..5u8 {
        io.push_data("input1", vec![i], None).unwrap();
    }
    io.close();
    graph.run_until_idle().unwrap();

    let (maps, ended) = drain(&io);
    assert!(ended);
    let payloads: Vec<u8> = maps
        .iter()
        .flat_map(|m| m.get("output1").into_iter().flatten())
        .map(|b| b.payload[0])
        .collect();
    assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
}

// ── Lifecycle and errors ────────────────────────────────────────────────────

#[test]
fn node_state_machine_is_linear() {
    let registry = registry();
    let checked = linear_graph(&registry);
    let graph = ExecutableGraph::assemble(
        &checked,
        &passthrough_provider(),
        &AssembleOptions::default(),
    );

    let node = graph.get_node("b").unwrap();
    assert_eq!(node.state(), NodeState::Initialized);
    graph.open_all().unwrap();
    assert_eq!(node.state(), NodeState::Opened);
    graph.run_until_idle().unwrap();
    assert_eq!(node.state(), NodeState::Running);

    // Re-opening a running node is a state error.
    assert!(node.open().is_err());

    graph.close_all();
    assert_eq!(node.state(), NodeState::Closed);
    // A closed node ignores further ticks.
    graph.run_until_idle().unwrap();
}

#[test]
fn failed_open_demotes_node_to_closed() {
    let registry = registry();
    let checked = linear_graph(&registry);
    let provider = |_node: &GraphNode| Box::new(FailingOpen) as Box<dyn Flowunit>;
    let graph = ExecutableGraph::assemble(&checked, &provider, &AssembleOptions::default());

    assert!(graph.open_all().is_err());
    assert_eq!(graph.get_node("b").unwrap().state(), NodeState::Closed);
    // Virtual nodes opened fine.
    assert_eq!(
        graph.get_node("input1").unwrap().state(),
        NodeState::Opened
    );
}

#[test]
fn process_errors_reach_the_session_and_end_flags_still_propagate() {
    let registry = registry();
    let checked = linear_graph(&registry);
    let provider = |_node: &GraphNode| Box::new(FailingProcess) as Box<dyn Flowunit>;
    let graph = ExecutableGraph::assemble(&checked, &provider, &AssembleOptions::default());
    graph.open_all().unwrap();

    let io = graph.create_session();
    io.push_data("input1", vec![7u8], None).unwrap();
    io.close();
    graph.run_until_idle().unwrap();

    let (_maps, ended) = drain(&io);
    assert!(ended, "end flags must propagate despite the error");
    let error = io.last_error().expect("error must be recorded");
    assert!(error.to_string().contains("bad frame"));
}

#[test]
fn aborted_sessions_drop_their_buffers() {
    let registry = registry();
    let checked = linear_graph(&registry);
    let graph = ExecutableGraph::assemble(
        &checked,
        &passthrough_provider(),
        &AssembleOptions::default(),
    );
    graph.open_all().unwrap();

    let io = graph.create_session();
    io.push_data("input1", vec![9u8], None).unwrap();
    io.abort();
    graph.run_until_idle().unwrap();

    match io.recv(Some(Duration::from_millis(10))) {
        RecvResult::Ok(map) => panic!("aborted session surfaced data: {map:?}"),
        RecvResult::NoData | RecvResult::Timeout => {}
    }
}
