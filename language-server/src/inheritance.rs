use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub const ROOT_TYPE: &str = "object";

#[derive(Debug, Clone)]
struct Vertex {
    name: String,
    parents: BTreeSet<String>,
}

/// Type inheritance as a directed graph of child → parent edges.
///
/// Vertices are keyed case-insensitively and keep the spelling they were
/// first declared with. Edges that would close a cycle are refused, so the
/// graph stays acyclic.
#[derive(Debug, Clone, Default)]
pub struct TypeInheritance {
    vertices: BTreeMap<String, Vertex>,
}

impl TypeInheritance {
    pub fn add_type(&mut self, name: &str) {
        self.vertices
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| Vertex {
                name: name.to_string(),
                parents: BTreeSet::new(),
            });
    }

    /// Returns false (and adds nothing) when the edge would create a cycle.
    pub fn add_edge(&mut self, child: &str, parent: &str) -> bool {
        let child_key = child.to_ascii_lowercase();
        let parent_key = parent.to_ascii_lowercase();
        if child_key == parent_key || self.is_ancestor_key(&child_key, &parent_key) {
            return false;
        }
        self.add_type(child);
        self.add_type(parent);
        if let Some(vertex) = self.vertices.get_mut(&child_key) {
            vertex.parents.insert(parent_key);
        }
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vertices.contains_key(&name.to_ascii_lowercase())
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.vertices.values().map(|vertex| vertex.name.as_str())
    }

    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for vertex in self.vertices.values() {
            for parent in &vertex.parents {
                edges.push((vertex.name.clone(), self.display_name(parent)));
            }
        }
        edges
    }

    pub fn get_parents(&self, name: &str) -> Vec<String> {
        self.vertices
            .get(&name.to_ascii_lowercase())
            .map(|vertex| {
                vertex
                    .parents
                    .iter()
                    .map(|parent| self.display_name(parent))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All types that inherit from `name`, directly or transitively.
    pub fn get_types_inheriting_from(&self, name: &str) -> Vec<String> {
        let target = name.to_ascii_lowercase();
        let mut result = BTreeSet::new();
        let mut queue = VecDeque::from([target]);
        while let Some(current) = queue.pop_front() {
            for (key, vertex) in &self.vertices {
                if vertex.parents.contains(&current) && result.insert(key.clone()) {
                    queue.push_back(key.clone());
                }
            }
        }
        result.iter().map(|key| self.display_name(key)).collect()
    }

    /// Ancestors of `name`, nearest first.
    pub fn get_ancestors(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        let mut queue = VecDeque::from([name.to_ascii_lowercase()]);
        while let Some(current) = queue.pop_front() {
            if let Some(vertex) = self.vertices.get(&current) {
                for parent in &vertex.parents {
                    if seen.insert(parent.clone()) {
                        ordered.push(self.display_name(parent));
                        queue.push_back(parent.clone());
                    }
                }
            }
        }
        ordered
    }

    pub fn is_subtype_of(&self, child: &str, ancestor: &str) -> bool {
        child.eq_ignore_ascii_case(ancestor)
            || self.is_ancestor_key(&ancestor.to_ascii_lowercase(), &child.to_ascii_lowercase())
    }

    /// Whether `ancestor` is reachable from `descendant` along parent edges.
    fn is_ancestor_key(&self, ancestor: &str, descendant: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([descendant.to_string()]);
        while let Some(current) = queue.pop_front() {
            if let Some(vertex) = self.vertices.get(&current) {
                for parent in &vertex.parents {
                    if parent == ancestor {
                        return true;
                    }
                    if seen.insert(parent.clone()) {
                        queue.push_back(parent.clone());
                    }
                }
            }
        }
        false
    }

    fn display_name(&self, key: &str) -> String {
        self.vertices
            .get(key)
            .map(|vertex| vertex.name.clone())
            .unwrap_or_else(|| key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_inheritance_queries() {
        let mut graph = TypeInheritance::default();
        assert!(graph.add_edge("truck", "vehicle"));
        assert!(graph.add_edge("plane", "vehicle"));
        assert!(graph.add_edge("vehicle", ROOT_TYPE));

        assert_eq!(graph.get_types_inheriting_from("vehicle"), vec!["plane", "truck"]);
        assert_eq!(
            graph.get_types_inheriting_from(ROOT_TYPE),
            vec!["plane", "truck", "vehicle"]
        );
        assert_eq!(graph.get_ancestors("Truck"), vec!["vehicle", "object"]);
        assert!(graph.is_subtype_of("truck", "object"));
        assert!(!graph.is_subtype_of("vehicle", "truck"));
    }

    #[test]
    fn refuses_cycles() {
        let mut graph = TypeInheritance::default();
        assert!(graph.add_edge("a", "b"));
        assert!(graph.add_edge("b", "c"));
        assert!(!graph.add_edge("c", "a"));
        assert!(!graph.add_edge("a", "A"));
        assert_eq!(graph.get_parents("c"), Vec::<String>::new());
    }
}
