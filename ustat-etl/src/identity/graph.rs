use std::collections::{BTreeSet, HashMap};
use std::iter;

/// Parent to child graph over identity ids, assembled from ancestor path
/// listings for the identities of one event.
#[derive(Debug, Default, Clone)]
pub struct HierarchyGraph {
    index: HashMap<String, usize>,
    ids: Vec<String>,
    parents: Vec<BTreeSet<usize>>,
}

impl HierarchyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, id: &str) -> usize {
        if let Some(n) = self.index.get(id) {
            return *n;
        }
        let n = self.ids.len();
        self.index.insert(id.to_string(), n);
        self.ids.push(id.to_string());
        self.parents.push(BTreeSet::new());
        n
    }

    pub fn add_node(&mut self, id: &str) {
        self.node(id);
    }

    /// Adds `path` (root first, ending with the direct parent) as one way
    /// of reaching `id`.
    pub fn add_path<S: AsRef<str>>(&mut self, id: &str, path: &[S]) {
        let mut prev = None;
        for hop in path.iter().map(AsRef::as_ref).chain(iter::once(id)) {
            let n = self.node(hop);
            if let Some(p) = prev {
                if p != n {
                    self.parents[n].insert(p);
                }
            }
            prev = Some(n);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Longest distance from any root for every node. Computed by repeated
    /// relaxation over the edge list; a cycle stops growing after one round
    /// per node.
    pub fn depths(&self) -> HashMap<&str, usize> {
        let n = self.ids.len();
        let mut depth = vec![0usize; n];
        for _ in 0..n {
            let mut changed = false;
            for child in 0..n {
                for &parent in &self.parents[child] {
                    let via = depth[parent] + 1;
                    if via > depth[child] && via <= n {
                        depth[child] = via;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        self.ids
            .iter()
            .map(String::as_str)
            .zip(depth)
            .collect()
    }

    /// Every node above `id`, excluding `id` itself.
    pub fn ancestors(&self, id: &str) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return out;
        };
        let mut seen = vec![false; self.ids.len()];
        seen[start] = true;
        let mut stack: Vec<usize> = self.parents[start].iter().copied().collect();
        while let Some(n) = stack.pop() {
            if std::mem::replace(&mut seen[n], true) {
                continue;
            }
            out.insert(self.ids[n].as_str());
            stack.extend(self.parents[n].iter().copied());
        }
        out
    }
}
