//! Capture controller: records queue submissions into graphs.
//!
//! A queue taking part in a capture session is either its origin (the queue
//! `begin` was called on) or a branch that joined by waiting on an event
//! recorded inside the session. Every member keeps a frontier: the nodes its
//! next submission depends on. A submission appends one node depending on
//! the frontier, and the frontier becomes exactly that node.
//!
//! Events carry frontiers between queues. Recording an event on a capturing
//! queue snapshots its frontier; a queue waiting on it either joins the
//! session (if it is not capturing) or merges the snapshot into its own
//! frontier (if it is a member of the same session).
//!
//! Illegal actions return an error and invalidate the session, which then
//! stays invalidated until its origin ends it:
//!
//! - synchronizing a capturing queue;
//! - waiting on an event recorded by a different session;
//! - waiting, while capturing, on an event last recorded by uncaptured work;
//! - an unsafe call that conflicts with the session under the calling
//!   thread's [`CaptureMode`];
//! - ending the session from a branch instead of its origin.
//!
//! All session state sits behind one mutex; every operation is a short
//! critical section on the control plane.

mod mode;

pub use mode::{CaptureMode, ModeGuard, ModeRegistry};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{info, warn};

use gpgraph_core::{EventHandle, Graph, NodeId, NodeParams, StructuralError};

use crate::error::{CaptureError, InvalidationReason};

/// Identifies a queue to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(pub u32);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Identifies a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaptureId(pub u64);

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Inactive,
    Active,
    Invalidated,
}

/// How [`CaptureController::update_dependencies`] edits a frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyUpdate {
    /// Add the nodes to the frontier.
    Add,
    /// Replace the frontier with the nodes.
    Set,
}

/// Snapshot of a queue's capture state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub capture: Option<CaptureId>,
    pub origin: Option<QueueId>,
    pub frontier: Vec<NodeId>,
    /// Nodes captured so far by the whole session.
    pub node_count: usize,
}

/// What a queue should do after [`CaptureController::wait_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The wait was recorded into a capture; nothing to execute.
    Captured,
    /// The queue is not capturing; execute the wait.
    Eager,
}

type Frontier = SmallVec<[NodeId; 4]>;

#[derive(Debug)]
struct Member {
    capture: CaptureId,
    frontier: Frontier,
}

#[derive(Debug)]
struct Session {
    origin: QueueId,
    mode: CaptureMode,
    thread: ThreadId,
    graph: Graph,
    members: Vec<QueueId>,
    invalidated: Option<InvalidationReason>,
}

#[derive(Debug)]
enum EventOrigin {
    Captured { capture: CaptureId, frontier: Frontier },
    Uncaptured,
}

#[derive(Debug, Default)]
struct CaptureTable {
    members: HashMap<QueueId, Member>,
    sessions: HashMap<CaptureId, Session>,
    events: HashMap<EventHandle, EventOrigin>,
    legacy: HashSet<QueueId>,
}

impl CaptureTable {
    fn invalidate(&mut self, capture: CaptureId, reason: InvalidationReason) -> InvalidationReason {
        let Some(session) = self.sessions.get_mut(&capture) else {
            return reason;
        };
        match &session.invalidated {
            Some(first) => first.clone(),
            None => {
                warn!(%capture, origin = %session.origin, %reason, "capture invalidated");
                session.invalidated = Some(reason.clone());
                reason
            }
        }
    }

    fn invalidated(&self, capture: CaptureId) -> Option<&InvalidationReason> {
        self.sessions.get(&capture).and_then(|s| s.invalidated.as_ref())
    }
}

/// Drives per-queue capture state.
#[derive(Debug, Default)]
pub struct CaptureController {
    table: Mutex<CaptureTable>,
    modes: ModeRegistry,
    next_capture: AtomicU64,
}

impl CaptureController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The per-thread interaction-mode registry.
    pub fn modes(&self) -> &ModeRegistry {
        &self.modes
    }

    /// Marks `queue` as the legacy queue, which can never capture.
    pub fn register_legacy(&self, queue: QueueId) {
        self.lock().legacy.insert(queue);
    }

    pub fn is_capturing(&self, queue: QueueId) -> bool {
        self.lock().members.contains_key(&queue)
    }

    /// Starts a capture session with `queue` as its origin.
    pub fn begin(&self, queue: QueueId, mode: CaptureMode) -> Result<CaptureId, CaptureError> {
        let mut table = self.lock();
        if table.legacy.contains(&queue) {
            return Err(CaptureError::LegacyQueue { queue });
        }
        if table.members.contains_key(&queue) {
            return Err(CaptureError::AlreadyCapturing { queue });
        }

        let capture = CaptureId(self.next_capture.fetch_add(1, Ordering::Relaxed) + 1);
        table.sessions.insert(
            capture,
            Session {
                origin: queue,
                mode,
                thread: thread::current().id(),
                graph: Graph::new(),
                members: vec![queue],
                invalidated: None,
            },
        );
        table.members.insert(
            queue,
            Member {
                capture,
                frontier: Frontier::new(),
            },
        );
        info!(%capture, %queue, ?mode, "capture started");
        Ok(capture)
    }

    /// Appends a node depending on the queue's frontier, which then becomes
    /// exactly the new node.
    pub fn submit(&self, queue: QueueId, params: NodeParams) -> Result<NodeId, CaptureError> {
        let mut table = self.lock();
        let table = &mut *table;
        let member = table
            .members
            .get_mut(&queue)
            .ok_or(CaptureError::NotCapturing { queue })?;
        let session = table
            .sessions
            .get_mut(&member.capture)
            .ok_or(CaptureError::NotCapturing { queue })?;
        if let Some(reason) = &session.invalidated {
            return Err(CaptureError::Invalidated {
                reason: reason.clone(),
            });
        }

        let node = session.graph.add_node(params, &member.frontier)?;
        member.frontier.clear();
        member.frontier.push(node);
        Ok(node)
    }

    /// Records `event` on `queue`. Returns `true` if the record was
    /// captured, `false` if the queue should record it eagerly.
    pub fn record_event(&self, queue: QueueId, event: EventHandle) -> Result<bool, CaptureError> {
        let mut table = self.lock();
        let table = &mut *table;
        let Some(member) = table.members.get(&queue) else {
            table.events.insert(event, EventOrigin::Uncaptured);
            return Ok(false);
        };
        let capture = member.capture;
        let frontier = member.frontier.clone();
        if let Some(reason) = table.invalidated(capture) {
            return Err(CaptureError::Invalidated {
                reason: reason.clone(),
            });
        }
        table
            .events
            .insert(event, EventOrigin::Captured { capture, frontier });
        Ok(true)
    }

    /// Makes `queue` wait on `event`.
    pub fn wait_event(&self, queue: QueueId, event: EventHandle) -> Result<WaitOutcome, CaptureError> {
        let mut table = self.lock();
        let table = &mut *table;
        let waiter = table.members.get(&queue).map(|m| m.capture);

        match (waiter, table.events.get(&event)) {
            // Never recorded: the wait completes immediately.
            (None, None) | (None, Some(EventOrigin::Uncaptured)) => Ok(WaitOutcome::Eager),
            (Some(capture), None) => match table.invalidated(capture) {
                Some(reason) => Err(CaptureError::Invalidated {
                    reason: reason.clone(),
                }),
                None => Ok(WaitOutcome::Captured),
            },
            (Some(capture), Some(EventOrigin::Uncaptured)) => {
                let reason = table.invalidate(
                    capture,
                    InvalidationReason::UncapturedWait { queue, event },
                );
                Err(CaptureError::Invalidated { reason })
            }
            (None, Some(EventOrigin::Captured { capture, frontier })) => {
                let capture = *capture;
                let frontier = frontier.clone();
                if let Some(session) = table.sessions.get_mut(&capture) {
                    session.members.push(queue);
                }
                table.members.insert(queue, Member { capture, frontier });
                info!(%capture, %queue, "queue joined capture");
                match table.invalidated(capture) {
                    Some(reason) => Err(CaptureError::Invalidated {
                        reason: reason.clone(),
                    }),
                    None => Ok(WaitOutcome::Captured),
                }
            }
            (Some(mine), Some(EventOrigin::Captured { capture, frontier })) => {
                if mine != *capture {
                    let reason = table.invalidate(
                        mine,
                        InvalidationReason::CrossCaptureWait { queue, event },
                    );
                    return Err(CaptureError::Invalidated { reason });
                }
                if let Some(reason) = table.invalidated(mine) {
                    return Err(CaptureError::Invalidated {
                        reason: reason.clone(),
                    });
                }
                let snapshot = frontier.clone();
                if let Some(member) = table.members.get_mut(&queue) {
                    for node in snapshot {
                        if !member.frontier.contains(&node) {
                            member.frontier.push(node);
                        }
                    }
                }
                Ok(WaitOutcome::Captured)
            }
        }
    }

    /// Called before a queue synchronizes. Synchronizing a capturing queue
    /// is illegal and invalidates its session.
    pub fn synchronize(&self, queue: QueueId) -> Result<(), CaptureError> {
        let mut table = self.lock();
        let Some(capture) = table.members.get(&queue).map(|m| m.capture) else {
            return Ok(());
        };
        let reason = table.invalidate(capture, InvalidationReason::Synchronized { queue });
        Err(CaptureError::Invalidated { reason })
    }

    /// Checks a potentially unsafe call against active captures. Every
    /// conflicting session is invalidated.
    pub fn check_unsafe(&self, operation: &str) -> Result<(), CaptureError> {
        let caller = thread::current().id();
        let mode = self.modes.mode_of(caller);
        let mut table = self.lock();

        let mut conflicts: Vec<CaptureId> = table
            .sessions
            .iter()
            .filter(|(_, s)| conflicts_with(mode, caller, s))
            .map(|(id, _)| *id)
            .collect();
        conflicts.sort_unstable();
        for capture in &conflicts {
            table.invalidate(
                *capture,
                InvalidationReason::UnsafeCall {
                    operation: operation.to_string(),
                },
            );
        }
        match conflicts.first() {
            Some(capture) => Err(CaptureError::UnsafeDuringCapture {
                operation: operation.to_string(),
                capture: *capture,
            }),
            None => Ok(()),
        }
    }

    /// Ends the session `queue` originated, returning the captured graph.
    /// Every member queue returns to inactive, unless the call fails with
    /// `NotCapturing` or `NotOrigin`.
    pub fn end(&self, queue: QueueId) -> Result<Graph, CaptureError> {
        let mut table = self.lock();
        let capture = table
            .members
            .get(&queue)
            .map(|m| m.capture)
            .ok_or(CaptureError::NotCapturing { queue })?;
        let origin = table
            .sessions
            .get(&capture)
            .map(|s| s.origin)
            .ok_or(CaptureError::NotCapturing { queue })?;
        if origin != queue {
            table.invalidate(capture, InvalidationReason::EndedOnBranch { queue });
            return Err(CaptureError::NotOrigin {
                queue,
                origin,
                capture,
            });
        }

        let session = table
            .sessions
            .remove(&capture)
            .ok_or(CaptureError::NotCapturing { queue })?;
        for member in &session.members {
            table.members.remove(member);
        }
        table.events.retain(|_, recorded| {
            !matches!(recorded, EventOrigin::Captured { capture: c, .. } if *c == capture)
        });

        match session.invalidated {
            Some(reason) => {
                info!(%capture, %queue, "invalidated capture ended");
                Err(CaptureError::Invalidated { reason })
            }
            None => {
                info!(
                    %capture,
                    %queue,
                    nodes = session.graph.node_count(),
                    branches = session.members.len() - 1,
                    "capture ended"
                );
                Ok(session.graph)
            }
        }
    }

    pub fn status(&self, queue: QueueId) -> CaptureStatus {
        let table = self.lock();
        let Some(member) = table.members.get(&queue) else {
            return CaptureStatus {
                state: CaptureState::Inactive,
                capture: None,
                origin: None,
                frontier: Vec::new(),
                node_count: 0,
            };
        };
        let session = table.sessions.get(&member.capture);
        CaptureStatus {
            state: match session.and_then(|s| s.invalidated.as_ref()) {
                Some(_) => CaptureState::Invalidated,
                None => CaptureState::Active,
            },
            capture: Some(member.capture),
            origin: session.map(|s| s.origin),
            frontier: member.frontier.to_vec(),
            node_count: session.map_or(0, |s| s.graph.node_count()),
        }
    }

    /// Edits the frontier of a capturing queue. Every node must belong to
    /// the session's graph.
    pub fn update_dependencies(
        &self,
        queue: QueueId,
        nodes: &[NodeId],
        update: DependencyUpdate,
    ) -> Result<(), CaptureError> {
        let mut table = self.lock();
        let table = &mut *table;
        let member = table
            .members
            .get_mut(&queue)
            .ok_or(CaptureError::NotCapturing { queue })?;
        let session = table
            .sessions
            .get(&member.capture)
            .ok_or(CaptureError::NotCapturing { queue })?;
        if let Some(reason) = &session.invalidated {
            return Err(CaptureError::Invalidated {
                reason: reason.clone(),
            });
        }
        if let Some(node) = nodes.iter().find(|n| !session.graph.contains(**n)) {
            return Err(StructuralError::InvalidDependency { node: *node }.into());
        }

        if update == DependencyUpdate::Set {
            member.frontier.clear();
        }
        for node in nodes {
            if !member.frontier.contains(node) {
                member.frontier.push(*node);
            }
        }
        Ok(())
    }

    /// Drops what the controller knows about a destroyed event.
    pub fn forget_event(&self, event: EventHandle) {
        self.lock().events.remove(&event);
    }

    fn lock(&self) -> MutexGuard<'_, CaptureTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn conflicts_with(mode: CaptureMode, caller: ThreadId, session: &Session) -> bool {
    let own = session.thread == caller && session.mode != CaptureMode::Relaxed;
    match mode {
        CaptureMode::Global => own || session.mode == CaptureMode::Global,
        CaptureMode::ThreadLocal => own,
        CaptureMode::Relaxed => false,
    }
}
