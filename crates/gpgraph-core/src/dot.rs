//! Graphviz rendering of a graph for debugging.
//!
//! Child graphs are rendered as nested clusters. Node names are derived from
//! insertion positions so that two structurally equal graphs render the same
//! text regardless of their ids.

use std::fmt::Write;

use crate::graph::Graph;
use crate::node::NodeParams;

/// Renders `graph` as a DOT digraph.
pub fn to_dot(graph: &Graph) -> String {
    let mut out = String::new();
    out.push_str("digraph gpgraph {\n");
    out.push_str("  node [shape=box];\n");
    write_body(graph, "n", 1, &mut out);
    out.push_str("}\n");
    out
}

fn write_body(graph: &Graph, prefix: &str, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for (pos, (_, node)) in graph.nodes().enumerate() {
        let name = format!("{}{}", prefix, pos);
        let _ = writeln!(out, "{}{} [label=\"{}\"];", indent, name, describe(&node.params));
        if let NodeParams::ChildGraph(child) = &node.params {
            let _ = writeln!(out, "{}subgraph cluster_{} {{", indent, name);
            let _ = writeln!(out, "{}  label=\"{}\";", indent, name);
            write_body(&child.graph, &format!("{}_", name), depth + 1, out);
            let _ = writeln!(out, "{}}}", indent);
        }
    }
    for (from, to) in graph.edges() {
        let (Some(f), Some(t)) = (graph.position(from), graph.position(to)) else {
            continue;
        };
        let _ = writeln!(out, "{}{}{} -> {}{};", indent, prefix, f, prefix, t);
    }
}

/// One-line label for a node.
pub fn describe(params: &NodeParams) -> String {
    match params {
        NodeParams::Kernel(k) => format!(
            "kernel {} grid=({},{},{}) block=({},{},{})",
            k.function, k.grid.x, k.grid.y, k.grid.z, k.block.x, k.block.y, k.block.z
        ),
        NodeParams::Memcpy(c) => format!(
            "memcpy {}:{} -> {}:{} ({}D)",
            c.src.space,
            c.src.ptr,
            c.dst.space,
            c.dst.ptr,
            c.shape.dimensionality()
        ),
        NodeParams::Memset(s) => format!("memset {} value={:#x} {} bytes", s.dst, s.value, s.span()),
        NodeParams::Host(h) => match &h.label {
            Some(label) => format!("host {}", label),
            None => "host".to_string(),
        },
        NodeParams::ChildGraph(c) => format!("child_graph ({} nodes)", c.graph.node_count()),
        NodeParams::EventRecord(e) => format!("event_record {}", e),
        NodeParams::EventWait(e) => format!("event_wait {}", e),
        NodeParams::SemaphoreSignal(p) => format!("semaphore_signal x{}", p.semaphores.len()),
        NodeParams::SemaphoreWait(p) => format!("semaphore_wait x{}", p.semaphores.len()),
        NodeParams::MemAlloc(a) => match a.address {
            Some(addr) => format!("mem_alloc {} bytes @ {}", a.size, addr),
            None => format!("mem_alloc {} bytes", a.size),
        },
        NodeParams::MemFree(f) => format!("mem_free {}", f.address),
        NodeParams::Empty => "empty".to_string(),
    }
}
