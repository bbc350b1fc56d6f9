//! Reconstruction of the causal event forest.

use super::AuditEvent;

use serde::Serialize;
use std::collections::HashMap;

/// An event together with the events it caused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainNode {
    /// The event
    #[serde(flatten)]
    pub event: AuditEvent,
    /// Child events, in input order
    pub children: Vec<ExplainNode>,
}

impl ExplainNode {
    fn leaf(event: AuditEvent, capacity: usize) -> Self {
        Self {
            event,
            children: Vec::with_capacity(capacity),
        }
    }

    /// Total number of events in this subtree.
    pub fn size(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }

    /// Render the subtree as indented text, one event per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(self, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            for _ in 0..depth {
                out.push_str("  ");
            }
            out.push_str(&node.event.summary());
            out.push('\n');
            stack.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
        }
        out
    }
}

// Long parent chains would otherwise drop one nested frame per level.
impl Drop for ExplainNode {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.children);
        while let Some(mut node) = stack.pop() {
            stack.append(&mut node.children);
        }
    }
}

/// Rebuild the causal forest from a flat, possibly out-of-order event list.
///
/// Events are first indexed by id, then linked to their parent. An event whose
/// parent is not in the list becomes a root instead of being dropped, so the
/// output may hold several trees (one per evaluation, plus orphans). Roots and
/// children keep their input order. Events caught in a `parentId` cycle are
/// also surfaced as roots.
pub fn build_explain_tree(events: &[AuditEvent]) -> Vec<ExplainNode> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(events.len());
    for (i, event) in events.iter().enumerate() {
        index.entry(event.id.as_str()).or_insert(i);
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); events.len()];
    let mut roots = Vec::new();
    for (i, event) in events.iter().enumerate() {
        match event
            .parent_id
            .as_deref()
            .and_then(|parent| index.get(parent).copied())
        {
            Some(parent) if parent != i => children[parent].push(i),
            _ => roots.push(i),
        }
    }

    let mut visited = vec![false; events.len()];
    let mut forest: Vec<ExplainNode> = roots
        .into_iter()
        .filter_map(|root| materialise(root, events, &children, &mut visited))
        .collect();

    for i in 0..events.len() {
        if !visited[i] {
            forest.extend(materialise(i, events, &children, &mut visited));
        }
    }

    forest
}

/// Build the subtree under `root` depth-first without recursion. A child is
/// claimed by the first parent that reaches it.
fn materialise(
    root: usize,
    events: &[AuditEvent],
    children: &[Vec<usize>],
    visited: &mut [bool],
) -> Option<ExplainNode> {
    visited[root] = true;
    // (event index, next child cursor, node under construction)
    let mut stack = vec![(
        root,
        0usize,
        ExplainNode::leaf(events[root].clone(), children[root].len()),
    )];
    let mut finished = None;

    while let Some((at, cursor, _)) = stack.last_mut() {
        if let Some(&child) = children[*at].get(*cursor) {
            *cursor += 1;
            if !visited[child] {
                visited[child] = true;
                let node = ExplainNode::leaf(events[child].clone(), children[child].len());
                stack.push((child, 0, node));
            }
            continue;
        }

        if let Some((_, _, done)) = stack.pop() {
            match stack.last_mut() {
                Some((_, _, parent)) => parent.children.push(done),
                None => finished = Some(done),
            }
        }
    }

    finished
}
