//! Object graph snapshot used by a full cyclic pass.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::object::ManagedObject;

/// Nodes reachable from the atomic roots, with their outgoing edges.
///
/// Built only while every worker is at a safepoint, so the edges are a
/// consistent snapshot.
pub(crate) struct ObjectGraph {
    nodes: Vec<ManagedObject>,
    index: HashMap<ManagedObject, usize>,
    edges: Vec<Vec<usize>>,
}

impl ObjectGraph {
    /// Discovers every object reachable from `seeds` in breadth-first order.
    pub(crate) fn discover(
        seeds: impl IntoIterator<Item = ManagedObject>,
        mut references: impl FnMut(ManagedObject) -> Vec<ManagedObject>,
    ) -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
        };
        let mut queue = VecDeque::new();
        for seed in seeds {
            if let Some(id) = graph.intern(seed) {
                queue.push_back(id);
            }
        }

        while let Some(id) = queue.pop_front() {
            let children = references(graph.nodes[id]);
            let mut out = Vec::with_capacity(children.len());
            for child in children {
                let child_id = match graph.intern(child) {
                    Some(new_id) => {
                        queue.push_back(new_id);
                        new_id
                    }
                    None => graph.index[&child],
                };
                out.push(child_id);
            }
            graph.edges[id] = out;
        }
        graph
    }

    /// Adds `obj` if unseen, returning its new id.
    fn intern(&mut self, obj: ManagedObject) -> Option<usize> {
        if self.index.contains_key(&obj) {
            return None;
        }
        let id = self.nodes.len();
        self.nodes.push(obj);
        self.edges.push(Vec::new());
        self.index.insert(obj, id);
        Some(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn node(&self, id: usize) -> ManagedObject {
        self.nodes[id]
    }

    pub(crate) fn id(&self, obj: ManagedObject) -> Option<usize> {
        self.index.get(&obj).copied()
    }

    /// Marks every node reachable from `starts`.
    ///
    /// Paths may leave the graph: objects outside it are followed through
    /// `references`, so an ordinary object pointing into the graph keeps its
    /// targets live.
    pub(crate) fn reachable_from(
        &self,
        starts: impl IntoIterator<Item = ManagedObject>,
        mut references: impl FnMut(ManagedObject) -> Vec<ManagedObject>,
    ) -> Vec<bool> {
        let mut marked = vec![false; self.nodes.len()];
        let mut outside = HashSet::new();
        let mut stack: Vec<ManagedObject> = starts.into_iter().collect();
        while let Some(obj) = stack.pop() {
            if let Some(&id) = self.index.get(&obj) {
                if std::mem::replace(&mut marked[id], true) {
                    continue;
                }
                stack.extend(
                    self.edges[id]
                        .iter()
                        .filter(|&&next| !marked[next])
                        .map(|&next| self.nodes[next]),
                );
            } else if outside.insert(obj) {
                stack.extend(references(obj));
            }
        }
        marked
    }

    /// Strongly connected components, in the order Tarjan's algorithm
    /// completes them.
    ///
    /// Iterative, so deep chains cannot overflow the stack.
    pub(crate) fn strongly_connected_components(&self) -> Vec<Vec<usize>> {
        const UNVISITED: usize = usize::MAX;

        let n = self.nodes.len();
        let mut order = vec![UNVISITED; n];
        let mut low = vec![0; n];
        let mut on_stack = vec![false; n];
        let mut stack = Vec::new();
        let mut components = Vec::new();
        let mut counter = 0;
        // (node, next edge to examine)
        let mut frames: Vec<(usize, usize)> = Vec::new();

        for root in 0..n {
            if order[root] != UNVISITED {
                continue;
            }
            frames.push((root, 0));
            order[root] = counter;
            low[root] = counter;
            counter += 1;
            stack.push(root);
            on_stack[root] = true;

            while let Some(&(node, edge)) = frames.last() {
                if let Some(&next) = self.edges[node].get(edge) {
                    if let Some(top) = frames.last_mut() {
                        top.1 += 1;
                    }
                    if order[next] == UNVISITED {
                        order[next] = counter;
                        low[next] = counter;
                        counter += 1;
                        stack.push(next);
                        on_stack[next] = true;
                        frames.push((next, 0));
                    } else if on_stack[next] {
                        low[node] = low[node].min(order[next]);
                    }
                    continue;
                }

                frames.pop();
                if let Some(&(parent, _)) = frames.last() {
                    low[parent] = low[parent].min(low[node]);
                }
                if low[node] == order[node] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack[member] = false;
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }
        components
    }

    /// Marks nodes that lie on at least one cycle.
    pub(crate) fn cyclic_nodes(&self) -> Vec<bool> {
        let mut cyclic = vec![false; self.nodes.len()];
        for component in self.strongly_connected_components() {
            let on_cycle = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&id| self.edges[id].contains(&id));
            if on_cycle {
                for id in component {
                    cyclic[id] = true;
                }
            }
        }
        cyclic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(n: usize) -> ManagedObject {
        ManagedObject::from_addr(n * 0x10).unwrap()
    }

    fn graph(edges: &[(usize, usize)], seeds: &[usize]) -> ObjectGraph {
        let adjacency: HashMap<ManagedObject, Vec<ManagedObject>> =
            edges.iter().fold(HashMap::new(), |mut map, &(from, to)| {
                map.entry(obj(from)).or_default().push(obj(to));
                map
            });
        ObjectGraph::discover(seeds.iter().map(|&s| obj(s)), |o| {
            adjacency.get(&o).cloned().unwrap_or_default()
        })
    }

    fn component_sets(graph: &ObjectGraph) -> Vec<Vec<ManagedObject>> {
        let mut sets: Vec<Vec<ManagedObject>> = graph
            .strongly_connected_components()
            .into_iter()
            .map(|c| {
                let mut members: Vec<_> = c.into_iter().map(|id| graph.node(id)).collect();
                members.sort();
                members
            })
            .collect();
        sets.sort();
        sets
    }

    #[test]
    fn discovers_transitively() {
        let g = graph(&[(1, 2), (2, 3), (3, 1), (4, 5)], &[1]);
        assert_eq!(g.len(), 3);
        assert!(g.id(obj(3)).is_some());
        assert!(g.id(obj(4)).is_none());
    }

    #[test]
    fn finds_cycle_and_tail() {
        let g = graph(&[(1, 2), (2, 1), (2, 3)], &[1]);
        assert_eq!(
            component_sets(&g),
            vec![vec![obj(1), obj(2)], vec![obj(3)]]
        );
        let cyclic = g.cyclic_nodes();
        let on_cycle: Vec<_> = (0..g.len()).filter(|&i| cyclic[i]).map(|i| g.node(i)).collect();
        assert_eq!(on_cycle.len(), 2);
        assert!(!on_cycle.contains(&obj(3)));
    }

    #[test]
    fn self_loop_is_cyclic() {
        let g = graph(&[(1, 1)], &[1]);
        assert_eq!(g.cyclic_nodes(), vec![true]);
    }

    #[test]
    fn reachability_follows_paths_outside_the_graph() {
        let edges = [(1, 2), (3, 4), (50, 51), (51, 3)];
        let adjacency: HashMap<ManagedObject, Vec<ManagedObject>> =
            edges.iter().fold(HashMap::new(), |mut map, &(from, to)| {
                map.entry(obj(from)).or_default().push(obj(to));
                map
            });
        let g = graph(&edges, &[1, 3]);
        assert_eq!(g.len(), 4);

        // 50 -> 51 -> 3 -> 4, where only 3 and 4 are in the graph.
        let marked = g.reachable_from([obj(50), obj(99)], |o| {
            adjacency.get(&o).cloned().unwrap_or_default()
        });
        let mut live: Vec<_> = (0..g.len()).filter(|&i| marked[i]).map(|i| g.node(i)).collect();
        live.sort();
        assert_eq!(live, vec![obj(3), obj(4)]);
    }

    #[test]
    fn deep_chain_does_not_overflow() {
        let edges: Vec<(usize, usize)> = (1..50_000).map(|i| (i, i + 1)).collect();
        let g = graph(&edges, &[1]);
        assert_eq!(g.strongly_connected_components().len(), 50_000);
    }
}
