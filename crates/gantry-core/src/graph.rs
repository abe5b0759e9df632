//! Directed multigraph over job labels with named dependency edges.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

/// A single dependency edge: `from` depends on `to` under the dependency
/// name `name`. The same pair of nodes may be connected by several edges
/// carrying different names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub name: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            name: name.into(),
        }
    }
}

/// Immutable directed multigraph over string labels.
///
/// Nodes and edges live in sorted sets, so two graphs compare equal exactly
/// when they hold the same labels and edges, and every traversal of the same
/// graph is identical run to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    nodes: BTreeSet<String>,
    edges: BTreeSet<Edge>,
}

impl Graph {
    /// Build a graph, rejecting edges whose endpoints are not nodes.
    pub fn new(nodes: BTreeSet<String>, edges: BTreeSet<Edge>) -> Result<Self> {
        for edge in &edges {
            if !nodes.contains(&edge.from) {
                return Err(Error::UnknownNode(edge.from.clone()));
            }
            if !nodes.contains(&edge.to) {
                return Err(Error::UnknownNode(edge.to.clone()));
            }
        }
        Ok(Self { nodes, edges })
    }

    /// A graph with no nodes.
    pub fn empty() -> Self {
        Self {
            nodes: BTreeSet::new(),
            edges: BTreeSet::new(),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn node_set(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.nodes.contains(label)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Dependencies of each node: label -> labels it depends on.
    pub fn links_dict(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        let mut links: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for edge in &self.edges {
            links
                .entry(edge.from.as_str())
                .or_default()
                .insert(edge.to.as_str());
        }
        links
    }

    /// Dependents of each node: label -> labels depending on it.
    pub fn reverse_links_dict(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        let mut links: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for edge in &self.edges {
            links
                .entry(edge.to.as_str())
                .or_default()
                .insert(edge.from.as_str());
        }
        links
    }

    /// Dependencies of each node keyed by dependency name.
    pub fn named_links_dict(&self) -> BTreeMap<&str, BTreeMap<&str, &str>> {
        let mut links: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
        for edge in &self.edges {
            links
                .entry(edge.from.as_str())
                .or_default()
                .insert(edge.name.as_str(), edge.to.as_str());
        }
        links
    }

    /// The subgraph reachable by following dependency edges forward from
    /// `roots`. Always contains `roots`; roots must be nodes of this graph.
    pub fn transitive_closure(&self, roots: &BTreeSet<String>) -> Result<Graph> {
        for root in roots {
            if !self.nodes.contains(root) {
                return Err(Error::UnknownRoot(root.clone()));
            }
        }
        let links = self.links_dict();
        let mut nodes: BTreeSet<String> = roots.clone();
        let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();
        while let Some(label) = stack.pop() {
            if let Some(deps) = links.get(label) {
                for dep in deps {
                    if nodes.insert((*dep).to_string()) {
                        stack.push(dep);
                    }
                }
            }
        }
        let edges = self
            .edges
            .iter()
            .filter(|edge| nodes.contains(&edge.from))
            .cloned()
            .collect();
        Graph::new(nodes, edges)
    }

    /// Visit every node after all of its dependencies: for every edge
    /// A -> B, B is yielded before A.
    pub fn visit_postorder(&self) -> Traversal<'_> {
        Traversal::new(self, self.links_dict())
    }

    /// Visit every node after all of its dependents: for every edge
    /// A -> B, A is yielded before B.
    pub fn visit_preorder(&self) -> Traversal<'_> {
        Traversal::new(self, self.reverse_links_dict())
    }
}

/// Lazy graph traversal yielding each node exactly once.
///
/// A node is only released once every node linked to it has been released.
/// The graph is assumed acyclic; if a cycle is nevertheless present, the
/// traversal surfaces it as an error instead of looping.
pub struct Traversal<'a> {
    graph: &'a Graph,
    links: BTreeMap<&'a str, BTreeSet<&'a str>>,
    queue: VecDeque<&'a str>,
    seen: BTreeSet<&'a str>,
    // nodes requeued since the last yield; a repeat means a full pass made
    // no progress, which only a cycle can cause
    stalled: BTreeSet<&'a str>,
    failed: bool,
}

impl<'a> Traversal<'a> {
    fn new(graph: &'a Graph, links: BTreeMap<&'a str, BTreeSet<&'a str>>) -> Self {
        Self {
            graph,
            links,
            queue: graph.nodes().collect(),
            seen: BTreeSet::new(),
            stalled: BTreeSet::new(),
            failed: false,
        }
    }

    fn unvisited(&self) -> Vec<String> {
        self.graph
            .nodes()
            .filter(|label| !self.seen.contains(label))
            .map(str::to_string)
            .collect()
    }
}

impl<'a> Iterator for Traversal<'a> {
    type Item = Result<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while let Some(label) = self.queue.pop_front() {
            if self.seen.contains(label) {
                continue;
            }
            let blockers: Vec<&str> = match self.links.get(label) {
                Some(linked) => linked
                    .iter()
                    .filter(|l| !self.seen.contains(*l))
                    .copied()
                    .collect(),
                None => Vec::new(),
            };
            if blockers.is_empty() {
                self.seen.insert(label);
                self.stalled.clear();
                return Some(Ok(label));
            }
            if !self.stalled.insert(label) {
                self.failed = true;
                return Some(Err(Error::CycleDetected(self.unvisited())));
            }
            for linked in blockers {
                self.queue.push_back(linked);
            }
            self.queue.push_back(label);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_graph(nodes: &[&str], edges: &[(&str, &str, &str)]) -> Graph {
        Graph::new(
            nodes.iter().map(|n| n.to_string()).collect(),
            edges
                .iter()
                .map(|(from, to, name)| Edge::new(*from, *to, *name))
                .collect(),
        )
        .unwrap()
    }

    fn collect(traversal: Traversal<'_>) -> Vec<String> {
        traversal.map(|label| label.unwrap().to_string()).collect()
    }

    #[test]
    fn test_construction_rejects_unknown_endpoint() {
        let err = Graph::new(
            ["a".to_string()].into_iter().collect(),
            [Edge::new("a", "b", "dep")].into_iter().collect(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownNode(node) if node == "b"));
    }

    #[test]
    fn test_postorder_linear_chain() {
        let graph = make_graph(
            &["t1", "t2", "t3"],
            &[("t2", "t1", "dep"), ("t3", "t2", "dep")],
        );
        assert_eq!(collect(graph.visit_postorder()), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_preorder_linear_chain() {
        let graph = make_graph(
            &["t1", "t2", "t3"],
            &[("t2", "t1", "dep"), ("t3", "t2", "dep")],
        );
        assert_eq!(collect(graph.visit_preorder()), vec!["t3", "t2", "t1"]);
    }

    #[test]
    fn test_traversal_respects_every_edge() {
        let graph = make_graph(
            &["app", "build", "image", "lint", "test"],
            &[
                ("app", "test", "tests"),
                ("build", "image", "image"),
                ("test", "build", "build"),
                ("test", "image", "image"),
                ("test", "lint", "lint"),
            ],
        );
        let postorder = collect(graph.visit_postorder());
        let preorder = collect(graph.visit_preorder());
        assert_eq!(postorder.len(), 5);
        for edge in graph.edges() {
            let post_from = postorder.iter().position(|l| *l == edge.from).unwrap();
            let post_to = postorder.iter().position(|l| *l == edge.to).unwrap();
            assert!(post_to < post_from, "postorder violates {edge:?}");
            let pre_from = preorder.iter().position(|l| *l == edge.from).unwrap();
            let pre_to = preorder.iter().position(|l| *l == edge.to).unwrap();
            assert!(pre_from < pre_to, "preorder violates {edge:?}");
        }
    }

    #[test]
    fn test_traversal_is_deterministic() {
        let graph = make_graph(
            &["a", "b", "c", "d"],
            &[("d", "b", "x"), ("d", "c", "y"), ("b", "a", "z"), ("c", "a", "z")],
        );
        assert_eq!(
            collect(graph.visit_postorder()),
            collect(graph.visit_postorder())
        );
    }

    #[test]
    fn test_cycle_is_reported() {
        let graph = make_graph(&["a", "b"], &[("a", "b", "x"), ("b", "a", "y")]);
        let result: Result<Vec<&str>> = graph.visit_postorder().collect();
        match result {
            Err(Error::CycleDetected(stuck)) => {
                assert_eq!(stuck, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_transitive_closure_contains_roots_and_is_closed() {
        let graph = make_graph(
            &["a", "b", "c", "d", "e"],
            &[
                ("b", "a", "dep"),
                ("c", "b", "dep"),
                ("d", "c", "dep"),
                ("e", "a", "dep"),
            ],
        );
        let closure = graph
            .transitive_closure(&["c".to_string()].into_iter().collect())
            .unwrap();
        let nodes: Vec<&str> = closure.nodes().collect();
        assert_eq!(nodes, vec!["a", "b", "c"]);
        assert_eq!(closure.edge_count(), 2);
        let links = closure.links_dict();
        for (_, deps) in links {
            for dep in deps {
                assert!(closure.contains(dep));
            }
        }
    }

    #[test]
    fn test_transitive_closure_unknown_root() {
        let graph = make_graph(&["a"], &[]);
        let err = graph
            .transitive_closure(&["zz".to_string()].into_iter().collect())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRoot(root) if root == "zz"));
    }

    #[test]
    fn test_named_links_with_parallel_edges() {
        let graph = make_graph(
            &["a", "b"],
            &[("a", "b", "build"), ("a", "b", "signing")],
        );
        assert_eq!(graph.edge_count(), 2);
        let named = graph.named_links_dict();
        let deps = &named["a"];
        assert_eq!(deps["build"], "b");
        assert_eq!(deps["signing"], "b");
    }

    #[test]
    fn test_links_and_reverse_links() {
        let graph = make_graph(&["a", "b", "c"], &[("c", "a", "x"), ("c", "b", "y")]);
        let links = graph.links_dict();
        assert_eq!(
            links["c"],
            ["a", "b"].into_iter().collect::<BTreeSet<&str>>()
        );
        let reverse = graph.reverse_links_dict();
        assert_eq!(reverse["a"], ["c"].into_iter().collect::<BTreeSet<&str>>());
        assert!(!reverse.contains_key("c"));
    }
}
