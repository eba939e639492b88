//! A directed graph that is just enough for topological sorting.
//!
//! Vertices are identified by value; petgraph's stable indices are an
//! implementation detail behind a lookup table, so nothing outside this
//! module ever holds a reference into the graph.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use itertools::Itertools;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;

/// A cycle has been detected while tsorting a graph. The payload is the
/// shortest cycle through the offending edge, closed (first == last vertex;
/// a self-loop on `v` yields `[v, v]`).
#[derive(Debug)]
pub struct NotADag<V: fmt::Display + fmt::Debug> {
    pub cycle: Vec<V>,
}

impl<V: fmt::Display + fmt::Debug> fmt::Display for NotADag<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "found a cycle: {}",
            self.cycle.iter().map(ToString::to_string).join(" -> ")
        )
    }
}

impl<V: fmt::Display + fmt::Debug> std::error::Error for NotADag<V> {}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

pub struct DepGraph<V> {
    graph: StableDiGraph<V, ()>,
    index: BTreeMap<V, NodeIndex>,
    tsort_cache: Mutex<Option<Vec<V>>>,
}

impl<V> Default for DepGraph<V> {
    fn default() -> Self {
        DepGraph {
            graph: StableDiGraph::new(),
            index: BTreeMap::new(),
            tsort_cache: Mutex::new(None),
        }
    }
}

impl<V: Clone> Clone for DepGraph<V>
where
    V: Ord,
{
    fn clone(&self) -> Self {
        DepGraph {
            graph: self.graph.clone(),
            index: self.index.clone(),
            tsort_cache: Mutex::new(None),
        }
    }
}

impl<V> DepGraph<V>
where
    V: Clone + Ord + fmt::Display + fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn invalidate(&mut self) {
        *self.tsort_cache.lock().unwrap() = None;
    }

    fn get_or_insert(&mut self, value: &V) -> NodeIndex {
        if let Some(ix) = self.index.get(value) {
            return *ix;
        }
        let ix = self.graph.add_node(value.clone());
        self.index.insert(value.clone(), ix);
        self.invalidate();
        ix
    }

    /// Add a vertex if it does not already exist.
    pub fn add_vertex(&mut self, value: V) {
        self.get_or_insert(&value);
    }

    pub fn has_vertex(&self, value: &V) -> bool {
        self.index.contains_key(value)
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn vertices(&self) -> impl Iterator<Item = &V> {
        self.graph.node_indices().map(|ix| &self.graph[ix])
    }

    pub fn remove_vertex(&mut self, value: &V) {
        if let Some(ix) = self.index.remove(value) {
            self.graph.remove_node(ix);
            self.invalidate();
        }
    }

    /// Add an edge, inserting either endpoint first if needed. Duplicate
    /// edges collapse into one.
    pub fn add_edge(&mut self, src: &V, dest: &V) {
        let src_ix = self.get_or_insert(src);
        let dest_ix = self.get_or_insert(dest);
        if self.graph.find_edge(src_ix, dest_ix).is_none() {
            self.graph.add_edge(src_ix, dest_ix, ());
            self.invalidate();
        }
    }

    pub fn remove_edge(&mut self, src: &V, dest: &V) {
        if let (Some(&src_ix), Some(&dest_ix)) = (self.index.get(src), self.index.get(dest)) {
            if let Some(edge) = self.graph.find_edge(src_ix, dest_ix) {
                self.graph.remove_edge(edge);
                self.invalidate();
            }
        }
    }

    pub fn remove_out_edges(&mut self, value: &V) {
        if let Some(&ix) = self.index.get(value) {
            let edges: Vec<_> = self
                .graph
                .neighbors_directed(ix, Direction::Outgoing)
                .filter_map(|out| self.graph.find_edge(ix, out))
                .collect();
            if !edges.is_empty() {
                for edge in edges {
                    self.graph.remove_edge(edge);
                }
                self.invalidate();
            }
        }
    }

    pub fn remove_in_edges(&mut self, value: &V) {
        if let Some(&ix) = self.index.get(value) {
            let edges: Vec<_> = self
                .graph
                .neighbors_directed(ix, Direction::Incoming)
                .filter_map(|src| self.graph.find_edge(src, ix))
                .collect();
            if !edges.is_empty() {
                for edge in edges {
                    self.graph.remove_edge(edge);
                }
                self.invalidate();
            }
        }
    }

    /// The out-neighbours of a vertex, ordered by value, or `None` if the
    /// vertex does not exist. Returned by value so callers may mutate the
    /// graph while still holding the set.
    pub fn out_edges(&self, value: &V) -> Option<std::collections::BTreeSet<V>> {
        let &ix = self.index.get(value)?;
        Some(
            self.graph
                .neighbors_directed(ix, Direction::Outgoing)
                .map(|out| self.graph[out].clone())
                .collect(),
        )
    }

    /// The in-neighbours of a vertex, ordered by value.
    pub fn in_edges(&self, value: &V) -> Option<std::collections::BTreeSet<V>> {
        let &ix = self.index.get(value)?;
        Some(
            self.graph
                .neighbors_directed(ix, Direction::Incoming)
                .map(|src| self.graph[src].clone())
                .collect(),
        )
    }

    /// Topologically sort the graph, leaves (vertices with no out-edges)
    /// first: for every edge `u -> v`, `v` appears before `u`. Iterating
    /// the result in reverse therefore visits dependents before their
    /// dependencies. With `cache` the result is remembered until the next
    /// mutation.
    pub fn tsort(&self, cache: bool) -> Result<Vec<V>, NotADag<V>> {
        if cache {
            if let Some(sorted) = self.tsort_cache.lock().unwrap().as_ref() {
                return Ok(sorted.clone());
            }
        }

        let mut colour: HashMap<NodeIndex, Colour> = self
            .graph
            .node_indices()
            .map(|ix| (ix, Colour::White))
            .collect();
        let mut sorted = Vec::with_capacity(self.graph.node_count());

        for ix in self.graph.node_indices() {
            self.visit(ix, &mut colour, &mut sorted)?;
        }

        if cache {
            *self.tsort_cache.lock().unwrap() = Some(sorted.clone());
        }
        Ok(sorted)
    }

    fn visit(
        &self,
        ix: NodeIndex,
        colour: &mut HashMap<NodeIndex, Colour>,
        sorted: &mut Vec<V>,
    ) -> Result<(), NotADag<V>> {
        match colour[&ix] {
            Colour::White => {
                colour.insert(ix, Colour::Grey);
            }
            // Already visited.
            Colour::Grey | Colour::Black => return Ok(()),
        }

        let outs: Vec<_> = self
            .graph
            .neighbors_directed(ix, Direction::Outgoing)
            .collect();
        for out in outs {
            match colour[&out] {
                Colour::White => self.visit(out, colour, sorted)?,
                Colour::Grey => {
                    // The edge ix -> out closes a cycle: out is somewhere
                    // up the current DFS stack, so a path out -> .. -> ix
                    // must exist. Reconstruct the shortest one with BFS.
                    let mut cycle = self
                        .shortest_path_ix(out, ix)
                        .expect("a grey vertex must be reachable from its grey descendant")
                        .iter()
                        .map(|&i| self.graph[i].clone())
                        .collect::<Vec<_>>();
                    cycle.push(self.graph[out].clone());
                    return Err(NotADag { cycle });
                }
                // Visited before, definitely not a cycle.
                Colour::Black => {}
            }
        }

        sorted.push(self.graph[ix].clone());
        colour.insert(ix, Colour::Black);
        Ok(())
    }

    /// The shortest path from `src` to `dest` over out-edges, endpoints
    /// included, if one exists. Edges all weigh the same.
    pub fn shortest_path(&self, src: &V, dest: &V) -> Option<Vec<V>> {
        let &src_ix = self.index.get(src)?;
        let &dest_ix = self.index.get(dest)?;
        self.shortest_path_ix(src_ix, dest_ix)
            .map(|path| path.iter().map(|&ix| self.graph[ix].clone()).collect())
    }

    fn shortest_path_ix(&self, src: NodeIndex, dest: NodeIndex) -> Option<Vec<NodeIndex>> {
        let mut predecessor: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut seen: HashMap<NodeIndex, bool> =
            self.graph.node_indices().map(|ix| (ix, ix == src)).collect();
        let mut queue = VecDeque::from([src]);

        while let Some(ix) = queue.pop_front() {
            for out in self.graph.neighbors_directed(ix, Direction::Outgoing) {
                if !seen[&out] {
                    seen.insert(out, true);
                    predecessor.insert(out, ix);
                    queue.push_back(out);
                }
                if out == dest {
                    // Walk the predecessor chain back to src. When src ==
                    // dest the chain is empty and the path degenerates to
                    // [src, src] via the explicit endpoints.
                    let mut path = VecDeque::from([dest]);
                    let mut at = dest;
                    while let Some(&pred) = predecessor.get(&at) {
                        path.push_front(pred);
                        at = pred;
                        if at == src {
                            break;
                        }
                    }
                    return Some(path.into());
                }
            }
        }
        None
    }
}

impl<V> fmt::Debug for DepGraph<V>
where
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepGraph")
            .field("vertices", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> DepGraph<String> {
        let mut g = DepGraph::new();
        for (src, dest) in edges {
            g.add_edge(&(*src).to_owned(), &(*dest).to_owned());
        }
        g
    }

    fn position(sorted: &[String], v: &str) -> usize {
        sorted.iter().position(|x| x == v).unwrap()
    }

    #[test]
    fn empty_graph_sorts_to_nothing() {
        let g: DepGraph<String> = DepGraph::new();
        assert_eq!(g.tsort(false).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn leaves_come_first() {
        let g = graph(&[("a", "b")]);
        assert_eq!(g.tsort(false).unwrap(), ["b".to_owned(), "a".to_owned()]);
    }

    #[test]
    fn every_edge_points_backwards_in_the_result() {
        let edges = [
            ("a", "b"),
            ("b", "c"),
            ("a", "c"),
            ("d", "b"),
            ("e", "a"),
            ("f", "f2"),
        ];
        let g = graph(&edges);
        let sorted = g.tsort(false).unwrap();
        assert_eq!(sorted.len(), 8);
        for (src, dest) in edges {
            assert!(
                position(&sorted, src) > position(&sorted, dest),
                "{src} must come after {dest} in {sorted:?}"
            );
        }
    }

    #[test]
    fn self_loop_reports_a_two_element_cycle() {
        let g = graph(&[("v", "v")]);
        let err = g.tsort(false).unwrap_err();
        assert_eq!(err.cycle, ["v".to_owned(), "v".to_owned()]);
    }

    #[test]
    fn cycle_error_carries_the_shortest_cycle() {
        // Two cycles share the edge b -> c; the reported one must be the
        // short way round.
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "a"), ("c", "b")]);
        let err = g.tsort(false).unwrap_err();
        assert!(err.cycle.len() >= 3);
        assert_eq!(err.cycle.first(), err.cycle.last());
        assert!(err.to_string().starts_with("found a cycle: "));
    }

    #[test]
    fn mutation_invalidates_the_cache() {
        let mut g = graph(&[("a", "b")]);
        assert_eq!(g.tsort(true).unwrap(), ["b".to_owned(), "a".to_owned()]);
        g.add_edge(&"b".to_owned(), &"c".to_owned());
        let sorted = g.tsort(true).unwrap();
        assert_eq!(
            sorted,
            ["c".to_owned(), "b".to_owned(), "a".to_owned()]
        );
    }

    #[test]
    fn adding_an_existing_vertex_is_a_no_op() {
        let mut g = graph(&[("a", "b")]);
        g.add_vertex("a".to_owned());
        assert_eq!(g.vertex_count(), 2);
    }

    #[test]
    fn out_and_in_edges() {
        let mut g = graph(&[("a", "b"), ("a", "c"), ("d", "a")]);
        let outs = g.out_edges(&"a".to_owned()).unwrap();
        assert_eq!(outs.into_iter().collect::<Vec<_>>(), ["b", "c"]);
        let ins = g.in_edges(&"a".to_owned()).unwrap();
        assert_eq!(ins.into_iter().collect::<Vec<_>>(), ["d"]);
        assert!(g.out_edges(&"nope".to_owned()).is_none());

        g.remove_in_edges(&"a".to_owned());
        assert!(g.in_edges(&"a".to_owned()).unwrap().is_empty());
        assert!(g.out_edges(&"d".to_owned()).unwrap().is_empty());

        g.remove_out_edges(&"a".to_owned());
        assert!(g.out_edges(&"a".to_owned()).unwrap().is_empty());
    }

    #[test]
    fn shortest_path_prefers_fewer_hops() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "d"), ("a", "d")]);
        let path = g.shortest_path(&"a".to_owned(), &"d".to_owned()).unwrap();
        assert_eq!(path, ["a".to_owned(), "d".to_owned()]);
        assert!(g.shortest_path(&"d".to_owned(), &"a".to_owned()).is_none());
    }
}
