//! Graph walk - runs nodes on a bounded worker pool as their upstreams finish

use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeKind};
use crate::hooks::{Hooks, StopHandle};
use petgraph::graph::NodeIndex;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;

/// Default cap on concurrently running nodes
pub const DEFAULT_PARALLELISM: usize = 10;

/// Lifecycle of one node during a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    /// Some upstream node has not finished
    Waiting,
    Running,
    Succeeded,
    Failed,
    /// Never ran: an upstream node failed or the walk was stopped
    Skipped,
}

impl NodeStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// What a node visit produced
#[derive(Debug, Default)]
pub struct NodeResult {
    pub diagnostics: Diagnostics,
    failed: bool,
}

impl NodeResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(diag: Diagnostic) -> Self {
        Self {
            diagnostics: diag.into(),
            failed: true,
        }
    }

    /// Failed if any diagnostic is an error
    pub fn from_diagnostics(diagnostics: Diagnostics) -> Self {
        let failed = diagnostics.has_errors();
        Self { diagnostics, failed }
    }

    pub const fn is_failed(&self) -> bool {
        self.failed
    }
}

/// Outcome of a whole walk
#[derive(Debug, Default)]
pub struct WalkReport {
    pub statuses: Vec<(NodeKind, NodeStatus)>,
    pub diagnostics: Diagnostics,
}

impl WalkReport {
    pub fn status_of(&self, node: &NodeKind) -> Option<NodeStatus> {
        self.statuses.iter().find(|(k, _)| k == node).map(|(_, s)| *s)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.statuses.iter().filter(|(_, s)| *s == status).count()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Walk `graph`, calling `visit` once per node after all of its upstream
/// nodes are terminal.
///
/// A node whose upstream failed or was skipped is skipped without a visit.
/// Once `stop` is set no further node starts; running nodes finish and
/// their results are kept.
pub fn walk<F>(
    graph: &Graph,
    parallelism: usize,
    stop: &StopHandle,
    hooks: &Hooks,
    visit: F,
) -> Result<WalkReport>
where
    F: Fn(&NodeKind) -> NodeResult + Sync,
{
    let size = graph.len();
    let mut status = vec![NodeStatus::Pending; size];
    let mut waiting_on: Vec<usize> = graph.indices().map(|i| graph.upstream(i).count()).collect();
    let mut diagnostics = Diagnostics::new();

    if size == 0 {
        return Ok(WalkReport::default());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism.max(1))
        .thread_name(|i| format!("walk-{i}"))
        .build()
        .map_err(|e| Error::Walk {
            message: e.to_string(),
        })?;

    let (tx, rx) = mpsc::channel::<(NodeIndex, NodeResult)>();
    let visit = &visit;

    pool.in_place_scope(|scope| {
        let mut ready: VecDeque<NodeIndex> = VecDeque::new();
        for idx in graph.indices() {
            if waiting_on[idx.index()] == 0 {
                ready.push_back(idx);
            } else {
                status[idx.index()] = NodeStatus::Waiting;
            }
        }

        let mut finished = 0;
        let mut running = 0;
        while finished < size {
            while let Some(idx) = ready.pop_front() {
                let node = graph.node(idx);
                let blocked = graph.upstream(idx).find(|u| {
                    matches!(status[u.index()], NodeStatus::Failed | NodeStatus::Skipped)
                });

                let skip = if stop.is_stopped() {
                    Some(Diagnostic::warning(
                        DiagnosticKind::Cancelled,
                        "Operation cancelled",
                        format!("{node} was not started because the operation was stopped"),
                    ))
                } else {
                    blocked.map(|upstream| {
                        Diagnostic::warning(
                            DiagnosticKind::UpstreamFailure,
                            "Blocked by upstream failure",
                            format!(
                                "{node} did not run because {} did not complete",
                                graph.node(upstream)
                            ),
                        )
                    })
                };

                if let Some(diag) = skip {
                    log::warn!("skipping {node}: {}", diag.detail);
                    hooks.node_skipped(node, &diag.detail);
                    diagnostics.push(diag.with_subject(node));
                    status[idx.index()] = NodeStatus::Skipped;
                    finished += 1;
                    release(graph, idx, &mut waiting_on, &mut ready);
                    continue;
                }

                log::debug!("starting {node}");
                status[idx.index()] = NodeStatus::Running;
                running += 1;
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let result =
                        catch_unwind(AssertUnwindSafe(|| visit(node))).unwrap_or_else(|payload| {
                            NodeResult::failed(
                                Diagnostic::error(
                                    DiagnosticKind::InvalidResult,
                                    "Node panicked",
                                    panic_message(payload.as_ref()),
                                )
                                .with_subject(node),
                            )
                        });
                    let _ = tx.send((idx, result));
                });
            }

            if finished == size || running == 0 {
                break;
            }
            let Ok((idx, result)) = rx.recv() else {
                break;
            };
            running -= 1;
            let node = graph.node(idx);
            let outcome = if result.is_failed() {
                log::warn!("{node} failed");
                NodeStatus::Failed
            } else {
                log::debug!("{node} succeeded");
                NodeStatus::Succeeded
            };
            status[idx.index()] = outcome;
            diagnostics.extend(result.diagnostics);
            finished += 1;
            release(graph, idx, &mut waiting_on, &mut ready);
        }
    });

    let statuses = graph
        .indices()
        .map(|i| (graph.node(i).clone(), status[i.index()]))
        .collect();
    Ok(WalkReport {
        statuses,
        diagnostics,
    })
}

fn release(
    graph: &Graph,
    idx: NodeIndex,
    waiting_on: &mut [usize],
    ready: &mut VecDeque<NodeIndex>,
) {
    for next in graph.downstream(idx) {
        let remaining = &mut waiting_on[next.index()];
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            ready.push_back(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::ProviderConfigAddr;
    use crate::graph::{EdgeKind, ObjectRef, Phase, ResourceNode};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn res(addr: &str) -> NodeKind {
        NodeKind::Resource(ResourceNode {
            addr: addr.parse().unwrap(),
            object: ObjectRef::Current,
            phase: Phase::Apply,
            provider: ProviderConfigAddr::root("test"),
        })
    }

    fn chain(names: &[&str]) -> Graph {
        let mut g = Graph::new();
        let mut prev = None;
        for name in names {
            let idx = g.add(res(name));
            if let Some(p) = prev {
                g.connect(p, idx, EdgeKind::Reference);
            }
            prev = Some(idx);
        }
        g
    }

    #[test]
    fn test_walk_respects_edges() {
        let g = chain(&["test_object.a", "test_object.b", "test_object.c"]);
        let order = Mutex::new(Vec::new());
        let report = walk(&g, 4, &StopHandle::new(), &Hooks::default(), |node| {
            order.lock().unwrap().push(node.to_string());
            NodeResult::ok()
        })
        .unwrap();
        assert_eq!(
            order.into_inner().unwrap(),
            vec!["test_object.a", "test_object.b", "test_object.c"]
        );
        assert_eq!(report.count(NodeStatus::Succeeded), 3);
        assert!(report.diagnostics.is_empty());
    }

    #[test]
    fn test_failure_skips_dependents_only() {
        let mut g = chain(&["test_object.a", "test_object.b", "test_object.c"]);
        g.add(res("test_object.independent"));
        let report = walk(&g, 2, &StopHandle::new(), &Hooks::default(), |node| {
            if node.to_string() == "test_object.b" {
                NodeResult::failed(Diagnostic::error(DiagnosticKind::ProviderOperation, "boom", ""))
            } else {
                NodeResult::ok()
            }
        })
        .unwrap();

        assert_eq!(report.status_of(&res("test_object.a")), Some(NodeStatus::Succeeded));
        assert_eq!(report.status_of(&res("test_object.b")), Some(NodeStatus::Failed));
        assert_eq!(report.status_of(&res("test_object.c")), Some(NodeStatus::Skipped));
        assert_eq!(report.status_of(&res("test_object.independent")), Some(NodeStatus::Succeeded));
        assert_eq!(report.diagnostics.errors().count(), 1);
        let blocked: Vec<_> =
            report.diagnostics.of_kind(DiagnosticKind::UpstreamFailure).collect();
        assert_eq!(blocked.len(), 1);
        assert_eq!(
            blocked[0].detail,
            "test_object.c did not run because test_object.b did not complete"
        );
    }

    #[test]
    fn test_stop_prevents_new_nodes() {
        let g = chain(&["test_object.a", "test_object.b"]);
        let stop = StopHandle::new();
        let report = walk(&g, 1, &stop, &Hooks::default(), |_| {
            stop.stop();
            NodeResult::ok()
        })
        .unwrap();
        assert_eq!(report.status_of(&res("test_object.a")), Some(NodeStatus::Succeeded));
        assert_eq!(report.status_of(&res("test_object.b")), Some(NodeStatus::Skipped));
        assert_eq!(report.diagnostics.of_kind(DiagnosticKind::Cancelled).count(), 1);
    }

    #[test]
    fn test_panic_becomes_failure() {
        let g = chain(&["test_object.a", "test_object.b"]);
        let report = walk(&g, 2, &StopHandle::new(), &Hooks::default(), |node| {
            if node.to_string() == "test_object.a" {
                panic!("provider crashed");
            }
            NodeResult::ok()
        })
        .unwrap();
        assert_eq!(report.status_of(&res("test_object.a")), Some(NodeStatus::Failed));
        assert_eq!(report.status_of(&res("test_object.b")), Some(NodeStatus::Skipped));
    }

    #[test]
    fn test_parallelism_is_bounded() {
        let mut g = Graph::new();
        for i in 0..16 {
            g.add(res(&format!("test_object.n{i}")));
        }
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let visits = AtomicUsize::new(0);
        walk(&g, 3, &StopHandle::new(), &Hooks::default(), |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
            visits.fetch_add(1, Ordering::SeqCst);
            NodeResult::ok()
        })
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(visits.load(Ordering::SeqCst), 16);
    }
}
