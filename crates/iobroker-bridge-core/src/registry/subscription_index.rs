//! Per-`ServerId` mapping from state/object pattern to interested consumers,
//! plus the log-listener set. Exact ids live in a `HashMap` for O(1) lookup;
//! wildcard patterns are compiled once (via [`crate::pattern::pattern_to_regex`])
//! and kept in a `Vec` scanned on every event.

use std::collections::{HashMap, HashSet};

use iobroker_bridge_commons::Result;
use regex::Regex;

use crate::pattern::pattern_to_regex;
use crate::server_id::NodeId;

#[derive(Default)]
pub struct SubscriptionIndex {
    state_exact: HashMap<String, HashSet<NodeId>>,
    state_wild: Vec<(String, Regex, HashSet<NodeId>)>,
    object_exact: HashMap<String, HashSet<NodeId>>,
    object_wild: Vec<(String, Regex, HashSet<NodeId>)>,
    log_listeners: HashSet<NodeId>,
}

impl SubscriptionIndex {
    pub fn add_state(&mut self, node_id: NodeId, pattern: &str) -> Result<()> {
        Self::add(&mut self.state_exact, &mut self.state_wild, node_id, pattern)
    }

    pub fn remove_state(&mut self, node_id: &NodeId, pattern: &str) {
        Self::remove(&mut self.state_exact, &mut self.state_wild, node_id, pattern);
    }

    pub fn match_state(&self, id: &str) -> HashSet<NodeId> {
        Self::match_id(&self.state_exact, &self.state_wild, id)
    }

    pub fn state_patterns(&self) -> Vec<String> {
        Self::patterns(&self.state_exact, &self.state_wild)
    }

    pub fn add_object(&mut self, node_id: NodeId, pattern: &str) -> Result<()> {
        Self::add(&mut self.object_exact, &mut self.object_wild, node_id, pattern)
    }

    pub fn remove_object(&mut self, node_id: &NodeId, pattern: &str) {
        Self::remove(&mut self.object_exact, &mut self.object_wild, node_id, pattern);
    }

    pub fn match_object(&self, id: &str) -> HashSet<NodeId> {
        Self::match_id(&self.object_exact, &self.object_wild, id)
    }

    pub fn object_patterns(&self) -> Vec<String> {
        Self::patterns(&self.object_exact, &self.object_wild)
    }

    pub fn add_log(&mut self, node_id: NodeId) {
        self.log_listeners.insert(node_id);
    }

    pub fn remove_log(&mut self, node_id: &NodeId) {
        self.log_listeners.remove(node_id);
    }

    pub fn log_listeners(&self) -> HashSet<NodeId> {
        self.log_listeners.clone()
    }

    pub fn has_log_listeners(&self) -> bool {
        !self.log_listeners.is_empty()
    }

    fn add(
        exact: &mut HashMap<String, HashSet<NodeId>>, wild: &mut Vec<(String, Regex, HashSet<NodeId>)>,
        node_id: NodeId, pattern: &str,
    ) -> Result<()> {
        if pattern.contains('*') {
            if let Some((_, _, nodes)) = wild.iter_mut().find(|(p, _, _)| p == pattern) {
                nodes.insert(node_id);
            } else {
                let regex = pattern_to_regex(pattern)?;
                wild.push((pattern.to_string(), regex, HashSet::from([node_id])));
            }
        } else {
            exact.entry(pattern.to_string()).or_default().insert(node_id);
        }
        Ok(())
    }

    fn remove(
        exact: &mut HashMap<String, HashSet<NodeId>>, wild: &mut Vec<(String, Regex, HashSet<NodeId>)>,
        node_id: &NodeId, pattern: &str,
    ) {
        if pattern.contains('*') {
            wild.retain_mut(|(p, _, nodes)| {
                if p == pattern {
                    nodes.remove(node_id);
                    !nodes.is_empty()
                } else {
                    true
                }
            });
        } else if let Some(nodes) = exact.get_mut(pattern) {
            nodes.remove(node_id);
            if nodes.is_empty() {
                exact.remove(pattern);
            }
        }
    }

    fn match_id(
        exact: &HashMap<String, HashSet<NodeId>>, wild: &[(String, Regex, HashSet<NodeId>)], id: &str,
    ) -> HashSet<NodeId> {
        let mut out = HashSet::new();
        if let Some(nodes) = exact.get(id) {
            out.extend(nodes.iter().cloned());
        }
        for (_, regex, nodes) in wild {
            if regex.is_match(id) {
                out.extend(nodes.iter().cloned());
            }
        }
        out
    }

    fn patterns(exact: &HashMap<String, HashSet<NodeId>>, wild: &[(String, Regex, HashSet<NodeId>)]) -> Vec<String> {
        let mut out: Vec<String> = exact.keys().cloned().collect();
        out.extend(wild.iter().map(|(p, _, _)| p.clone()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_match_independently() {
        let mut index = SubscriptionIndex::default();
        let n1 = NodeId::new("n1");
        let n2 = NodeId::new("n2");
        index.add_state(n1.clone(), "sensors.temp").unwrap();
        index.add_state(n2.clone(), "lights.*").unwrap();

        assert_eq!(index.match_state("sensors.temp"), HashSet::from([n1.clone()]));
        assert_eq!(index.match_state("lights.kitchen"), HashSet::from([n2.clone()]));
        assert!(index.match_state("sensors.humidity").is_empty());
    }

    #[test]
    fn removing_the_last_node_drops_the_pattern_entry() {
        let mut index = SubscriptionIndex::default();
        let n1 = NodeId::new("n1");
        index.add_state(n1.clone(), "lights.*").unwrap();
        assert_eq!(index.state_patterns(), vec!["lights.*".to_string()]);

        index.remove_state(&n1, "lights.*");
        assert!(index.state_patterns().is_empty());
    }

    #[test]
    fn duplicate_pattern_registration_is_deduplicated() {
        let mut index = SubscriptionIndex::default();
        let n1 = NodeId::new("n1");
        let n2 = NodeId::new("n2");
        index.add_state(n1.clone(), "lights.*").unwrap();
        index.add_state(n2.clone(), "lights.*").unwrap();
        assert_eq!(index.state_patterns().len(), 1);
        assert_eq!(index.match_state("lights.kitchen").len(), 2);
    }
}
