//! Whole-graph validation run before instantiation.
//!
//! [`validate_graph`] scans the entire graph (child graphs included) and
//! reports every problem at once instead of stopping at the first one. It
//! is pure: it reads the graph and queries the provider but changes
//! nothing.
//!
//! Checks, per graph level:
//! - acyclicity (re-checked; builders never allow a cycle);
//! - parameter blocks;
//! - liveness of every external handle;
//! - alloc/free pairing: each free matches an alloc of the same graph,
//!   at most once, and is ordered after it;
//! - memcpy/memset ranges touching an allocation must be ordered after its
//!   alloc and before its free.

use gpgraph_core::{address, DevicePtr, Graph, NodeId, NodeParams, StructuralError};

use crate::error::ValidationError;
use crate::provider::ResourceProvider;

/// Validates `graph`, returning every problem found (empty if valid).
pub fn validate_graph(graph: &Graph, provider: &dyn ResourceProvider) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    validate_level(graph, provider, &mut errors);
    errors
}

fn validate_level(graph: &Graph, provider: &dyn ResourceProvider, errors: &mut Vec<ValidationError>) {
    if let Err(node) = graph.topological_order() {
        // Reachability is meaningless on a cyclic graph.
        errors.push(ValidationError::Cycle { node });
        return;
    }

    for (id, node) in graph.nodes() {
        if let Err(err) = node.params.validate() {
            let reason = match err {
                StructuralError::InvalidParameters { reason } => reason,
                other => other.to_string(),
            };
            errors.push(ValidationError::InvalidParameters { node: id, reason });
        }
        for resource in node.params.resources() {
            if !provider.is_live(resource) {
                errors.push(ValidationError::StaleHandle { node: id, resource });
            }
        }
        if let NodeParams::ChildGraph(child) = &node.params {
            validate_level(&child.graph, provider, errors);
        }
    }

    check_allocations(graph, errors);
}

/// An allocation's lifetime window within one graph level.
struct Lifetime {
    alloc: NodeId,
    address: DevicePtr,
    size: u64,
    free: Option<NodeId>,
}

impl Lifetime {
    fn overlaps(&self, base: DevicePtr, len: u64) -> bool {
        len > 0 && base.0 < self.address.0 + self.size && self.address.0 < base.0 + len
    }
}

fn check_allocations(graph: &Graph, errors: &mut Vec<ValidationError>) {
    let reaches = |from: NodeId, to: NodeId| from != to && graph.has_path(from, to).unwrap_or(false);

    let mut lifetimes: Vec<Lifetime> = graph
        .nodes()
        .filter_map(|(id, node)| match &node.params {
            NodeParams::MemAlloc(a) => a.address.map(|address| Lifetime {
                alloc: id,
                address,
                size: address::aligned_size(a.size),
                free: None,
            }),
            _ => None,
        })
        .collect();

    for (id, node) in graph.nodes() {
        let NodeParams::MemFree(free) = &node.params else {
            continue;
        };
        match lifetimes.iter_mut().find(|l| l.address == free.address) {
            None => errors.push(ValidationError::FreeWithoutAlloc {
                node: id,
                address: free.address,
            }),
            Some(lifetime) if lifetime.free.is_some() => errors.push(ValidationError::DoubleFree {
                node: id,
                address: free.address,
            }),
            Some(lifetime) => {
                if reaches(lifetime.alloc, id) {
                    lifetime.free = Some(id);
                } else {
                    errors.push(ValidationError::FreeBeforeAlloc {
                        node: id,
                        alloc: lifetime.alloc,
                    });
                }
            }
        }
    }

    for (id, node) in graph.nodes() {
        for (base, len) in node.params.accessed_ranges() {
            for lifetime in lifetimes.iter().filter(|l| l.overlaps(base, len)) {
                let after_alloc = reaches(lifetime.alloc, id);
                let before_free = lifetime.free.map_or(true, |free| reaches(id, free));
                let error = ValidationError::UseOutsideLifetime {
                    node: id,
                    address: lifetime.address,
                };
                if !(after_alloc && before_free) && !errors.contains(&error) {
                    errors.push(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpgraph_core::{
        DeviceOrdinal, Dim3, EventHandle, FunctionHandle, Key, KernelParams, MemAllocParams,
        MemFreeParams, MemsetParams, ResourceRef,
    };

    use crate::error::ResourceError;

    /// Treats every handle with a non-zero generation as released.
    struct Provider;

    impl ResourceProvider for Provider {
        fn is_live(&self, resource: ResourceRef) -> bool {
            let key = match resource {
                ResourceRef::Function(f) => f.0,
                ResourceRef::Event(e) => e.0,
                ResourceRef::Semaphore(s) => s.0,
            };
            key.generation == 0
        }

        fn bind_allocation(&self, _: DevicePtr, _: u64, _: DeviceOrdinal) -> Result<(), ResourceError> {
            Ok(())
        }

        fn release_allocation(&self, _: DevicePtr) {}
    }

    fn alloc(graph: &mut Graph, deps: &[NodeId]) -> (NodeId, DevicePtr) {
        let id = graph
            .add_node(
                NodeParams::MemAlloc(MemAllocParams::new(1024, DeviceOrdinal(0))),
                deps,
            )
            .unwrap();
        let address = match &graph.node(id).unwrap().params {
            NodeParams::MemAlloc(a) => a.address.unwrap(),
            _ => unreachable!(),
        };
        (id, address)
    }

    fn free(address: DevicePtr) -> NodeParams {
        NodeParams::MemFree(MemFreeParams { address })
    }

    fn memset(address: DevicePtr) -> NodeParams {
        NodeParams::Memset(MemsetParams::bytes(address, DeviceOrdinal(0), 0, 64))
    }

    #[test]
    fn well_formed_lifetime_passes() {
        let mut graph = Graph::new();
        let (a, addr) = alloc(&mut graph, &[]);
        let set = graph.add_node(memset(addr), &[a]).unwrap();
        graph.add_node(free(addr), &[set]).unwrap();
        assert!(validate_graph(&graph, &Provider).is_empty());
    }

    #[test]
    fn free_without_alloc_names_the_free() {
        let mut graph = Graph::new();
        let f = graph.add_node(free(DevicePtr(0x1234)), &[]).unwrap();
        assert_eq!(
            validate_graph(&graph, &Provider),
            vec![ValidationError::FreeWithoutAlloc {
                node: f,
                address: DevicePtr(0x1234)
            }]
        );
    }

    #[test]
    fn double_free_and_unordered_free_are_reported() {
        let mut graph = Graph::new();
        let (a, addr) = alloc(&mut graph, &[]);
        let f1 = graph.add_node(free(addr), &[a]).unwrap();
        let f2 = graph.add_node(free(addr), &[f1]).unwrap();
        let errors = validate_graph(&graph, &Provider);
        assert_eq!(
            errors,
            vec![ValidationError::DoubleFree {
                node: f2,
                address: addr
            }]
        );

        let mut graph = Graph::new();
        let (a, addr) = alloc(&mut graph, &[]);
        let f = graph.add_node(free(addr), &[]).unwrap();
        assert_eq!(
            validate_graph(&graph, &Provider),
            vec![ValidationError::FreeBeforeAlloc { node: f, alloc: a }]
        );
    }

    #[test]
    fn access_after_free_is_outside_lifetime() {
        let mut graph = Graph::new();
        let (a, addr) = alloc(&mut graph, &[]);
        let f = graph.add_node(free(addr), &[a]).unwrap();
        let late = graph.add_node(memset(addr.offset(128)), &[f]).unwrap();
        let unordered = graph.add_node(memset(addr), &[]).unwrap();
        assert_eq!(
            validate_graph(&graph, &Provider),
            vec![
                ValidationError::UseOutsideLifetime {
                    node: late,
                    address: addr
                },
                ValidationError::UseOutsideLifetime {
                    node: unordered,
                    address: addr
                },
            ]
        );
    }

    #[test]
    fn stale_handles_are_all_collected() {
        let stale = Key {
            index: 3,
            generation: 1,
        };
        let mut graph = Graph::new();
        let k = graph
            .add_node(
                NodeParams::Kernel(KernelParams::new(
                    FunctionHandle(stale),
                    Dim3::linear(1),
                    Dim3::linear(1),
                )),
                &[],
            )
            .unwrap();
        let e = graph
            .add_node(NodeParams::EventWait(EventHandle(stale)), &[k])
            .unwrap();
        let errors = validate_graph(&graph, &Provider);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].node(), Some(k));
        assert_eq!(errors[1].node(), Some(e));
    }
}
