//! Cascading-replication topology model.
//!
//! Maintains a directed graph whose vertices are cluster names and
//! whose edges are (source → sink) cascade relationships, and answers
//! "what is the next hop" queries for messages travelling along a
//! cascade.
//!
//! # Next-hop selection
//!
//! [`CascadeGraph::choose_nexts`] keeps an out-neighbour `n` of the
//! current cluster only when no competing in-neighbour of `n` beats us
//! at delivering to it:
//!
//! - the cascade origin always wins (a direct edge from the origin to
//!   `n` rejects `n` here);
//! - a competitor strictly closer to the origin wins; one strictly
//!   farther loses;
//! - ties are broken by cluster-name order against the current
//!   cluster.
//!
//! # Snapshots
//!
//! [`CascadeTopology`] is the shared process-wide handle. Mutations go
//! through its methods; queries run on a cloned [`CascadeGraph`]
//! snapshot, so results are consistent within a single call and never
//! observe concurrent mutation.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Opaque, totally-ordered cluster identifier.
pub type ClusterName = String;

/// A mutable directed graph of cluster cascade relationships.
///
/// Adding an edge implicitly adds absent endpoints. Edge identity is
/// the (source, sink) pair; duplicates collapse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeGraph {
    out: BTreeMap<ClusterName, BTreeSet<ClusterName>>,
    r#in: BTreeMap<ClusterName, BTreeSet<ClusterName>>,
}

impl CascadeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cluster vertex. No-op if present.
    pub fn add_cluster(&mut self, cluster: impl Into<ClusterName>) {
        let cluster = cluster.into();
        self.out.entry(cluster.clone()).or_default();
        self.r#in.entry(cluster).or_default();
    }

    /// Remove a cluster and all incident cascades.
    pub fn drop_cluster(&mut self, cluster: &str) {
        if let Some(sinks) = self.out.remove(cluster) {
            for sink in sinks {
                if let Some(sources) = self.r#in.get_mut(&sink) {
                    sources.remove(cluster);
                }
            }
        }
        if let Some(sources) = self.r#in.remove(cluster) {
            for source in sources {
                if let Some(sinks) = self.out.get_mut(&source) {
                    sinks.remove(cluster);
                }
            }
        }
    }

    /// Add a cascade edge, creating absent endpoints.
    pub fn add_cascade(&mut self, source: impl Into<ClusterName>, sink: impl Into<ClusterName>) {
        let source = source.into();
        let sink = sink.into();
        self.add_cluster(source.clone());
        self.add_cluster(sink.clone());
        self.out.entry(source.clone()).or_default().insert(sink.clone());
        self.r#in.entry(sink).or_default().insert(source);
    }

    /// Remove one cascade edge. Endpoints stay.
    pub fn drop_cascade(&mut self, source: &str, sink: &str) {
        if let Some(sinks) = self.out.get_mut(source) {
            sinks.remove(sink);
        }
        if let Some(sources) = self.r#in.get_mut(sink) {
            sources.remove(source);
        }
    }

    /// Remove every cascade leaving `sink`.
    pub fn drop_sink_cascades(&mut self, sink: &str) {
        let targets: Vec<ClusterName> = self
            .out
            .get(sink)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for target in targets {
            self.drop_cascade(sink, &target);
        }
    }

    /// All clusters, in name order.
    pub fn clusters(&self) -> Vec<ClusterName> {
        self.out.keys().cloned().collect()
    }

    /// All cascades as an ordered source → sorted-sink-set mapping.
    /// Sources with no outgoing cascades are omitted.
    pub fn cascades(&self) -> BTreeMap<ClusterName, BTreeSet<ClusterName>> {
        self.out
            .iter()
            .filter(|(_, sinks)| !sinks.is_empty())
            .map(|(source, sinks)| (source.clone(), sinks.clone()))
            .collect()
    }

    /// Out-neighbours of a cluster, in name order.
    pub fn out_neighbours(&self, cluster: &str) -> BTreeSet<ClusterName> {
        self.out.get(cluster).cloned().unwrap_or_default()
    }

    /// In-neighbours of a cluster, in name order.
    pub fn in_neighbours(&self, cluster: &str) -> BTreeSet<ClusterName> {
        self.r#in.get(cluster).cloned().unwrap_or_default()
    }

    /// A shortest path from `from` to `to` as a vertex list, endpoints
    /// included. `None` when unreachable. `path(a, a) == [a]`.
    pub fn path(&self, from: &str, to: &str) -> Option<Vec<ClusterName>> {
        if !self.out.contains_key(from) || !self.out.contains_key(to) {
            return None;
        }
        if from == to {
            return Some(vec![from.to_string()]);
        }
        let mut prev: HashMap<ClusterName, ClusterName> = HashMap::new();
        let mut queue: VecDeque<ClusterName> = VecDeque::new();
        queue.push_back(from.to_string());
        while let Some(vertex) = queue.pop_front() {
            for next in self.out_neighbours(&vertex) {
                if next == from || prev.contains_key(&next) {
                    continue;
                }
                prev.insert(next.clone(), vertex.clone());
                if next == to {
                    let mut path = vec![to.to_string()];
                    let mut cursor = to.to_string();
                    while let Some(p) = prev.get(&cursor) {
                        path.push(p.clone());
                        cursor = p.clone();
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Shortest-path length in vertices; `None` when unreachable.
    fn path_len(&self, from: &str, to: &str) -> Option<usize> {
        self.path(from, to).map(|p| p.len())
    }

    /// Valid next hops for a message that originated at `started` and
    /// currently sits at `current`.
    pub fn choose_nexts(&self, started: &str, current: &str) -> BTreeSet<ClusterName> {
        let candidates = self.out_neighbours(current);
        if started == current {
            return candidates;
        }
        let here = self.path_len(started, current);
        candidates
            .into_iter()
            .filter(|n| n != started)
            .filter(|n| self.wins_delivery(started, current, here, n))
            .collect()
    }

    /// Whether `current` beats every competing in-neighbour of `n` at
    /// delivering the cascade to `n`.
    fn wins_delivery(
        &self,
        started: &str,
        current: &str,
        here: Option<usize>,
        n: &str,
    ) -> bool {
        for m in self.in_neighbours(n) {
            if m == current {
                continue;
            }
            if m == started {
                // The origin has a direct edge to n; origin wins.
                return false;
            }
            // Unreachable competitors have an infinite path and lose.
            let theirs = self.path_len(started, &m);
            let m_wins = match (theirs, here) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(q), Some(h)) => match q.cmp(&h) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Greater => false,
                    std::cmp::Ordering::Equal => m.as_str() < current,
                },
            };
            if m_wins {
                return false;
            }
        }
        true
    }
}

/// Shared process-wide topology handle.
///
/// Mutations serialize through an internal lock; every query clones a
/// [`CascadeGraph`] snapshot first, so readers never race writers.
#[derive(Clone, Default)]
pub struct CascadeTopology {
    graph: Arc<RwLock<CascadeGraph>>,
}

impl CascadeTopology {
    /// Start an empty topology.
    pub fn start() -> Self {
        Self::default()
    }

    /// Stop the topology, clearing the graph. Clones of this handle
    /// observe the empty graph afterwards.
    pub async fn stop(&self) {
        *self.graph.write().await = CascadeGraph::new();
    }

    /// Current graph snapshot for queries.
    pub async fn snapshot(&self) -> CascadeGraph {
        self.graph.read().await.clone()
    }

    pub async fn add_cluster(&self, cluster: impl Into<ClusterName>) {
        self.graph.write().await.add_cluster(cluster);
    }

    pub async fn drop_cluster(&self, cluster: &str) {
        self.graph.write().await.drop_cluster(cluster);
    }

    pub async fn add_cascade(
        &self,
        source: impl Into<ClusterName>,
        sink: impl Into<ClusterName>,
    ) {
        self.graph.write().await.add_cascade(source, sink);
    }

    pub async fn drop_cascade(&self, source: &str, sink: &str) {
        self.graph.write().await.drop_cascade(source, sink);
    }

    pub async fn drop_sink_cascades(&self, sink: &str) {
        self.graph.write().await.drop_sink_cascades(sink);
    }

    pub async fn clusters(&self) -> Vec<ClusterName> {
        self.graph.read().await.clusters()
    }

    pub async fn cascades(&self) -> BTreeMap<ClusterName, BTreeSet<ClusterName>> {
        self.graph.read().await.cascades()
    }

    pub async fn path(&self, from: &str, to: &str) -> Option<Vec<ClusterName>> {
        self.graph.read().await.path(from, to)
    }

    pub async fn choose_nexts(&self, started: &str, current: &str) -> BTreeSet<ClusterName> {
        self.graph.read().await.choose_nexts(started, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(set: &BTreeSet<ClusterName>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    fn chain() -> CascadeGraph {
        let mut g = CascadeGraph::new();
        g.add_cascade("a", "b");
        g.add_cascade("b", "c");
        g
    }

    #[test]
    fn test_add_edge_creates_vertices() {
        let g = chain();
        assert_eq!(g.clusters(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_drop_cluster_removes_incident_edges() {
        let mut g = chain();
        g.drop_cluster("b");
        assert_eq!(g.clusters(), vec!["a", "c"]);
        assert!(g.out_neighbours("a").is_empty());
        assert!(g.in_neighbours("c").is_empty());
    }

    #[test]
    fn test_drop_cascade_keeps_vertices() {
        let mut g = chain();
        g.drop_cascade("a", "b");
        assert_eq!(g.clusters(), vec!["a", "b", "c"]);
        assert!(g.out_neighbours("a").is_empty());
        assert_eq!(names(&g.out_neighbours("b")), vec!["c"]);
    }

    #[test]
    fn test_drop_sink_cascades() {
        let mut g = chain();
        g.add_cascade("b", "d");
        g.drop_sink_cascades("b");
        assert!(g.out_neighbours("b").is_empty());
        // Inbound edge to b survives.
        assert_eq!(names(&g.out_neighbours("a")), vec!["b"]);
    }

    #[test]
    fn test_cascades_enumeration() {
        let g = chain();
        let cascades = g.cascades();
        assert_eq!(cascades.len(), 2);
        assert_eq!(names(&cascades["a"]), vec!["b"]);
        assert_eq!(names(&cascades["b"]), vec!["c"]);
        assert!(!cascades.contains_key("c"));
    }

    #[test]
    fn test_path_simple_chain() {
        let g = chain();
        assert_eq!(g.path("a", "c").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_path_self_and_unreachable() {
        let g = chain();
        assert_eq!(g.path("a", "a").unwrap(), vec!["a"]);
        assert_eq!(g.path("c", "a"), None);
        assert_eq!(g.path("a", "nope"), None);
    }

    #[test]
    fn test_path_prefers_shortest() {
        let mut g = chain();
        g.add_cascade("a", "c");
        assert_eq!(g.path("a", "c").unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn test_choose_nexts_at_origin_is_out_set() {
        let mut g = CascadeGraph::new();
        g.add_cascade("s", "x");
        g.add_cascade("s", "y");
        assert_eq!(names(&g.choose_nexts("s", "s")), vec!["x", "y"]);
    }

    #[test]
    fn test_choose_nexts_simple_chain() {
        let g = chain();
        assert_eq!(names(&g.choose_nexts("a", "b")), vec!["c"]);
    }

    #[test]
    fn test_choose_nexts_origin_wins() {
        // a→b, a→c, b→c: a delivers to c directly, so b must not.
        let mut g = CascadeGraph::new();
        g.add_cascade("a", "b");
        g.add_cascade("a", "c");
        g.add_cascade("b", "c");
        assert!(g.choose_nexts("a", "b").is_empty());
    }

    #[test]
    fn test_choose_nexts_never_returns_origin() {
        // Cycle back to the origin is not a next hop.
        let mut g = CascadeGraph::new();
        g.add_cascade("a", "b");
        g.add_cascade("b", "a");
        assert!(g.choose_nexts("a", "b").is_empty());
    }

    #[test]
    fn test_choose_nexts_closer_competitor_wins() {
        // a→b→c→n and a→m→n: m (distance 2) beats c (distance 3).
        let mut g = CascadeGraph::new();
        g.add_cascade("a", "b");
        g.add_cascade("b", "c");
        g.add_cascade("c", "n");
        g.add_cascade("a", "m");
        g.add_cascade("m", "n");
        assert!(g.choose_nexts("a", "c").is_empty());
        assert_eq!(names(&g.choose_nexts("a", "m")), vec!["n"]);
    }

    #[test]
    fn test_choose_nexts_tie_broken_by_name() {
        // a→b→n and a→c→n: equal distance, smaller name wins.
        let mut g = CascadeGraph::new();
        g.add_cascade("a", "b");
        g.add_cascade("a", "c");
        g.add_cascade("b", "n");
        g.add_cascade("c", "n");
        assert_eq!(names(&g.choose_nexts("a", "b")), vec!["n"]);
        assert!(g.choose_nexts("a", "c").is_empty());
    }

    #[test]
    fn test_choose_nexts_unreachable_competitor_loses() {
        // z→n exists but z is unreachable from a, so b still delivers.
        let mut g = CascadeGraph::new();
        g.add_cascade("a", "b");
        g.add_cascade("b", "n");
        g.add_cascade("z", "n");
        assert_eq!(names(&g.choose_nexts("a", "b")), vec!["n"]);
    }

    #[tokio::test]
    async fn test_topology_snapshot_isolation() {
        let topo = CascadeTopology::start();
        topo.add_cascade("a", "b").await;
        let snap = topo.snapshot().await;
        topo.add_cascade("b", "c").await;
        // The earlier snapshot does not observe the later mutation.
        assert_eq!(snap.clusters(), vec!["a", "b"]);
        assert_eq!(topo.clusters().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_topology_stop_clears() {
        let topo = CascadeTopology::start();
        topo.add_cascade("a", "b").await;
        topo.stop().await;
        assert!(topo.clusters().await.is_empty());
    }
}
