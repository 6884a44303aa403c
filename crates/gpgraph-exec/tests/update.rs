//! Integration tests for instantiation, per-node patching and whole-graph
//! update.

use std::sync::Arc;

use gpgraph_core::{
    ChildGraphParams, DeviceOrdinal, DevicePtr, Dim3, FunctionHandle, Graph, HostParams,
    KernelParams, Key, MemAllocParams, MemFreeParams, MemsetParams, NodeId, NodeParams,
    ResourceRef,
};
use gpgraph_exec::{
    instantiate, CompiledOp, Executable, InstantiateOptions, ResourceError, ResourceProvider,
    UpdateError, UpdateErrorKind,
};

struct AlwaysLive;

impl ResourceProvider for AlwaysLive {
    fn is_live(&self, _: ResourceRef) -> bool {
        true
    }

    fn bind_allocation(&self, _: DevicePtr, _: u64, _: DeviceOrdinal) -> Result<(), ResourceError> {
        Ok(())
    }

    fn release_allocation(&self, _: DevicePtr) {}
}

fn provider() -> Arc<dyn ResourceProvider> {
    Arc::new(AlwaysLive)
}

fn function(index: u32) -> FunctionHandle {
    FunctionHandle(Key {
        index,
        generation: 0,
    })
}

fn kernel(f: u32, grid: u32) -> NodeParams {
    NodeParams::Kernel(KernelParams::new(function(f), Dim3::linear(grid), Dim3::linear(128)))
}

fn memset(value: u8) -> NodeParams {
    NodeParams::Memset(MemsetParams::bytes(DevicePtr(0x4000), DeviceOrdinal(0), value, 256))
}

/// kernel -> memset -> host
fn pipeline(grid: u32, value: u8) -> (Graph, Vec<NodeId>) {
    let mut graph = Graph::new();
    let k = graph.add_node(kernel(0, grid), &[]).unwrap();
    let m = graph.add_node(memset(value), &[k]).unwrap();
    let h = graph
        .add_node(NodeParams::Host(HostParams::new(|_| {})), &[m])
        .unwrap();
    (graph, vec![k, m, h])
}

fn grid_of(exec: &Executable, node: NodeId) -> Dim3 {
    let index = exec.compiled_index(node).unwrap();
    match &exec.program().nodes()[index].op {
        CompiledOp::Kernel(k) => k.grid,
        other => panic!("expected kernel op, got {:?}", other),
    }
}

#[test]
fn update_with_same_topology_replaces_parameters() {
    let (graph, ids) = pipeline(1, 0);
    let mut exec = instantiate(&graph, provider(), &InstantiateOptions::default()).unwrap();
    let before = exec.program();

    let (candidate, _) = pipeline(64, 0xff);
    exec.update(&candidate).unwrap();

    assert_eq!(grid_of(&exec, ids[0]), Dim3::linear(64));
    // A replay holding the previous program still sees the old parameters.
    match &before.nodes()[0].op {
        CompiledOp::Kernel(k) => assert_eq!(k.grid, Dim3::linear(1)),
        other => panic!("expected kernel op, got {:?}", other),
    }
    match exec.node_params(ids[1]) {
        Some(NodeParams::Memset(s)) => assert_eq!(s.value, 0xff),
        other => panic!("expected memset params, got {:?}", other),
    }
}

#[test]
fn changed_function_is_rejected_and_executable_unchanged() {
    let (graph, ids) = pipeline(1, 0);
    let mut exec = instantiate(&graph, provider(), &InstantiateOptions::default()).unwrap();

    let mut candidate = Graph::new();
    let k = candidate.add_node(kernel(9, 32), &[]).unwrap();
    let m = candidate.add_node(memset(1), &[k]).unwrap();
    candidate
        .add_node(NodeParams::Host(HostParams::new(|_| {})), &[m])
        .unwrap();

    let err = exec.update(&candidate).unwrap_err();
    assert_eq!(err, UpdateError::new(UpdateErrorKind::FunctionChanged, Some(k)));
    assert_eq!(grid_of(&exec, ids[0]), Dim3::linear(1));

    // Still updatable afterwards.
    let (ok, _) = pipeline(2, 0);
    exec.update(&ok).unwrap();
    assert_eq!(grid_of(&exec, ids[0]), Dim3::linear(2));
}

#[test]
fn late_rejection_leaves_earlier_nodes_unpatched() {
    let (inner, _) = pipeline(1, 0);
    let mut graph = Graph::new();
    let k = graph.add_node(kernel(0, 1), &[]).unwrap();
    graph
        .add_node(NodeParams::ChildGraph(ChildGraphParams::new(&inner)), &[k])
        .unwrap();
    let mut exec = instantiate(&graph, provider(), &InstantiateOptions::default()).unwrap();

    // The kernel change alone is fine; the child swaps its function.
    let mut inner2 = Graph::new();
    let ik = inner2.add_node(kernel(5, 1), &[]).unwrap();
    let im = inner2.add_node(memset(0), &[ik]).unwrap();
    inner2
        .add_node(NodeParams::Host(HostParams::new(|_| {})), &[im])
        .unwrap();
    let mut candidate = Graph::new();
    let ck = candidate.add_node(kernel(0, 32), &[]).unwrap();
    candidate
        .add_node(NodeParams::ChildGraph(ChildGraphParams::new(&inner2)), &[ck])
        .unwrap();

    let err = exec.update(&candidate).unwrap_err();
    assert_eq!(err.kind, UpdateErrorKind::FunctionChanged);
    assert_eq!(grid_of(&exec, k), Dim3::linear(1));
    match exec.node_params(k) {
        Some(NodeParams::Kernel(p)) => assert_eq!(p.grid, Dim3::linear(1)),
        other => panic!("expected kernel params, got {:?}", other),
    }
}

#[test]
fn rewired_graph_is_a_topology_change() {
    let (graph, _) = pipeline(1, 0);
    let mut exec = instantiate(&graph, provider(), &InstantiateOptions::default()).unwrap();

    let mut candidate = Graph::new();
    let k = candidate.add_node(kernel(0, 1), &[]).unwrap();
    let m = candidate.add_node(memset(0), &[]).unwrap();
    candidate
        .add_node(NodeParams::Host(HostParams::new(|_| {})), &[k, m])
        .unwrap();

    let err = exec.update(&candidate).unwrap_err();
    assert_eq!(err.kind, UpdateErrorKind::TopologyChanged);
    assert_eq!(err.node, Some(m));

    let (mut longer, _) = pipeline(1, 0);
    longer.add_node(NodeParams::Empty, &[]).unwrap();
    let err = exec.update(&longer).unwrap_err();
    assert_eq!(err, UpdateError::new(UpdateErrorKind::TopologyChanged, None));
}

#[test]
fn child_graphs_update_recursively() {
    let (inner, _) = pipeline(1, 0);
    let mut graph = Graph::new();
    let child = graph
        .add_node(NodeParams::ChildGraph(ChildGraphParams::new(&inner)), &[])
        .unwrap();
    let mut exec = instantiate(&graph, provider(), &InstantiateOptions::default()).unwrap();

    let (inner2, _) = pipeline(16, 3);
    let mut candidate = Graph::new();
    candidate
        .add_node(NodeParams::ChildGraph(ChildGraphParams::new(&inner2)), &[])
        .unwrap();
    exec.update(&candidate).unwrap();

    let index = exec.compiled_index(child).unwrap();
    let compiled = exec.program();
    let CompiledOp::Child(program) = &compiled.nodes()[index].op else {
        panic!("expected child program");
    };
    match &program.nodes()[0].op {
        CompiledOp::Kernel(k) => assert_eq!(k.grid, Dim3::linear(16)),
        other => panic!("expected kernel op, got {:?}", other),
    }
}

#[test]
fn per_node_patch_follows_kind_rules() {
    let (graph, ids) = pipeline(1, 0);
    let mut exec = instantiate(&graph, provider(), &InstantiateOptions::default()).unwrap();

    exec.set_node_params(ids[0], kernel(0, 8)).unwrap();
    assert_eq!(grid_of(&exec, ids[0]), Dim3::linear(8));

    let err = exec.set_node_params(ids[0], kernel(1, 8)).unwrap_err();
    assert_eq!(err.kind, UpdateErrorKind::FunctionChanged);

    let err = exec.set_node_params(ids[1], NodeParams::Empty).unwrap_err();
    assert_eq!(err.kind, UpdateErrorKind::TopologyChanged);
    assert_eq!(grid_of(&exec, ids[0]), Dim3::linear(8));
}

#[test]
fn only_work_nodes_can_be_disabled() {
    let (graph, ids) = pipeline(1, 0);
    let mut exec = instantiate(&graph, provider(), &InstantiateOptions::default()).unwrap();

    exec.set_node_enabled(ids[1], false).unwrap();
    assert_eq!(exec.is_node_enabled(ids[1]), Some(false));
    let err = exec.set_node_enabled(ids[2], false).unwrap_err();
    assert_eq!(err.kind, UpdateErrorKind::NotSupported);

    // Disabled state survives a whole-graph update.
    let (candidate, _) = pipeline(4, 9);
    exec.update(&candidate).unwrap();
    assert_eq!(exec.is_node_enabled(ids[1]), Some(false));
}

#[test]
fn foreign_node_cannot_be_patched() {
    let (graph, _) = pipeline(1, 0);
    let (_, other_ids) = pipeline(1, 0);
    let mut exec = instantiate(&graph, provider(), &InstantiateOptions::default()).unwrap();
    let err = exec.set_node_params(other_ids[0], kernel(0, 2)).unwrap_err();
    assert_eq!(err.kind, UpdateErrorKind::NotSupported);
}

#[test]
fn alloc_nodes_must_stay_identical() {
    let mut graph = Graph::new();
    let alloc = graph
        .add_node(
            NodeParams::MemAlloc(MemAllocParams::new(4096, DeviceOrdinal(0))),
            &[],
        )
        .unwrap();
    let address = match &graph.node(alloc).unwrap().params {
        NodeParams::MemAlloc(a) => a.address.unwrap(),
        _ => unreachable!(),
    };
    graph
        .add_node(NodeParams::MemFree(MemFreeParams { address }), &[alloc])
        .unwrap();
    let mut exec = instantiate(&graph, provider(), &InstantiateOptions::default()).unwrap();

    // A snapshot keeps the reserved addresses and updates cleanly.
    exec.update(&graph).unwrap();
    exec.update(&graph.snapshot()).unwrap();

    // A clone owns relocated allocations, so it cannot stand in for the original.
    let copy = graph.clone();
    let err = exec.update(&copy).unwrap_err();
    assert_eq!(
        err,
        UpdateError::new(UpdateErrorKind::ParametersChanged, copy.find_in_clone(alloc))
    );

    // Rebuilding reserves a fresh address, which is a parameter change.
    let mut rebuilt = Graph::new();
    let a2 = rebuilt
        .add_node(
            NodeParams::MemAlloc(MemAllocParams::new(4096, DeviceOrdinal(0))),
            &[],
        )
        .unwrap();
    rebuilt
        .add_node(NodeParams::MemFree(MemFreeParams { address }), &[a2])
        .unwrap();
    let err = exec.update(&rebuilt).unwrap_err();
    assert_eq!(err, UpdateError::new(UpdateErrorKind::ParametersChanged, Some(a2)));
}

#[test]
fn destroy_releases_lease_for_reinstantiation() {
    let mut graph = Graph::new();
    graph
        .add_node(
            NodeParams::MemAlloc(MemAllocParams::new(1 << 20, DeviceOrdinal(0))),
            &[],
        )
        .unwrap();
    let exec = instantiate(&graph, provider(), &InstantiateOptions::default()).unwrap();
    assert!(instantiate(&graph, provider(), &InstantiateOptions::default()).is_err());
    exec.destroy();
    assert!(instantiate(&graph, provider(), &InstantiateOptions::default()).is_ok());
}
