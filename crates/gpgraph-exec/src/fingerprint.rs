//! Deterministic topology hashing using blake3.
//!
//! The fingerprint covers what the update engine compares structurally:
//! node count, the kind sequence in insertion order, and every node's
//! dependency positions. Child graphs are hashed recursively in place.
//! Parameters are not hashed: two graphs that differ only in parameters
//! share a fingerprint.
//!
//! # Determinism
//!
//! - Nodes are visited in insertion order.
//! - Dependencies are hashed as sorted insertion positions, never as ids,
//!   so a graph and its clone hash the same.

use gpgraph_core::{Graph, NodeParams};

/// Computes the topology fingerprint of `graph`.
pub fn topology_fingerprint(graph: &Graph) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hash_graph(graph, &mut hasher);
    hasher.finalize()
}

fn hash_graph(graph: &Graph, hasher: &mut blake3::Hasher) {
    hasher.update(&(graph.node_count() as u64).to_le_bytes());
    for (id, node) in graph.nodes() {
        hasher.update(&[node.kind().tag()]);

        let mut deps: Vec<u32> = graph
            .dependencies(id)
            .unwrap_or_default()
            .iter()
            .filter_map(|d| graph.position(*d))
            .map(|p| p as u32)
            .collect();
        deps.sort_unstable();
        hasher.update(&(deps.len() as u32).to_le_bytes());
        for pos in deps {
            hasher.update(&pos.to_le_bytes());
        }

        if let NodeParams::ChildGraph(child) = &node.params {
            hash_graph(&child.graph, hasher);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpgraph_core::{ChildGraphParams, DeviceOrdinal, DevicePtr, MemsetParams};

    fn memset(value: u8) -> NodeParams {
        NodeParams::Memset(MemsetParams::bytes(DevicePtr(0x1000), DeviceOrdinal(0), value, 16))
    }

    #[test]
    fn parameters_do_not_affect_fingerprint() {
        let mut a = Graph::new();
        let a0 = a.add_node(memset(1), &[]).unwrap();
        a.add_node(memset(2), &[a0]).unwrap();

        let mut b = Graph::new();
        let b0 = b.add_node(memset(7), &[]).unwrap();
        b.add_node(memset(9), &[b0]).unwrap();

        assert_eq!(topology_fingerprint(&a), topology_fingerprint(&b));
        assert_eq!(topology_fingerprint(&a), topology_fingerprint(&a.clone()));
    }

    #[test]
    fn edges_and_kinds_affect_fingerprint() {
        let mut chained = Graph::new();
        let c0 = chained.add_node(memset(0), &[]).unwrap();
        chained.add_node(memset(0), &[c0]).unwrap();

        let mut parallel = Graph::new();
        parallel.add_node(memset(0), &[]).unwrap();
        parallel.add_node(memset(0), &[]).unwrap();

        let mut kinds = Graph::new();
        let k0 = kinds.add_node(memset(0), &[]).unwrap();
        kinds.add_node(NodeParams::Empty, &[k0]).unwrap();

        let fc = topology_fingerprint(&chained);
        assert_ne!(fc, topology_fingerprint(&parallel));
        assert_ne!(fc, topology_fingerprint(&kinds));
    }

    #[test]
    fn child_structure_is_included() {
        let mut one = Graph::new();
        one.add_node(NodeParams::Empty, &[]).unwrap();
        let mut two = one.clone();
        two.add_node(NodeParams::Empty, &[]).unwrap();

        let mut pa = Graph::new();
        pa.add_node(NodeParams::ChildGraph(ChildGraphParams::new(&one)), &[])
            .unwrap();
        let mut pb = Graph::new();
        pb.add_node(NodeParams::ChildGraph(ChildGraphParams::new(&two)), &[])
            .unwrap();
        assert_ne!(topology_fingerprint(&pa), topology_fingerprint(&pb));
    }
}
