//! Minimal patch computation between two rendered trees.
//!
//! Nodes at the same position with the same `(type, key, component)` are
//! diffed prop by prop. Node lists are reconciled by key, unkeyed entries by
//! position. Duplicate keys among siblings: the first occurrence is matched,
//! later occurrences are treated as unmatched (removed from the previous
//! list, inserted into the next one).

use crate::patch::{Patch, PatchOp, Path};
use crate::tree::{Node, Prop, Props};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Ignore the previous tree and emit a full root replace.
    pub force: bool,
}

pub fn diff(previous: Option<&Node>, next: &Node) -> Patch {
    diff_with(previous, next, DiffOptions::default())
}

pub fn diff_with(previous: Option<&Node>, next: &Node, options: DiffOptions) -> Patch {
    let mut out = Vec::new();
    match previous {
        Some(previous) if !options.force => diff_node(previous, next, &Path::root(), &mut out),
        _ => out.push(PatchOp::replace(Path::root(), next.to_value())),
    }
    out
}

fn diff_node(previous: &Node, next: &Node, path: &Path, out: &mut Patch) {
    if !previous.same_identity(next) {
        out.push(PatchOp::replace(path.clone(), next.to_value()));
        return;
    }
    diff_props(&previous.props, &next.props, path, out);
}

fn diff_props(previous: &Props, next: &Props, path: &Path, out: &mut Patch) {
    for (key, next_prop) in next {
        let prop_path = path.key(key);
        match previous.get(key) {
            Some(previous_prop) => diff_prop(previous_prop, next_prop, &prop_path, out),
            None => out.push(PatchOp::replace(prop_path, next_prop.to_value())),
        }
    }
    for key in previous.keys() {
        if !next.contains_key(key) {
            out.push(PatchOp::remove(path.key(key)));
        }
    }
}

fn diff_prop(previous: &Prop, next: &Prop, path: &Path, out: &mut Patch) {
    match (previous, next) {
        (Prop::Node(previous), Prop::Node(next)) => diff_node(previous, next, path, out),
        (Prop::List(previous), Prop::List(next)) => diff_list(previous, next, path, out),
        (previous, next) if previous == next => {}
        (_, next) => out.push(PatchOp::replace(path.clone(), next.to_value())),
    }
}

fn diff_list(previous: &[Node], next: &[Node], path: &Path, out: &mut Patch) {
    let matches = match_children(previous, next);

    let mut retained = vec![false; previous.len()];
    for prev_index in matches.iter().flatten() {
        retained[*prev_index] = true;
    }

    for (prev_index, kept) in retained.iter().enumerate().rev() {
        if !kept {
            out.push(PatchOp::remove(path.index(prev_index)));
        }
    }

    // After removals the list holds the retained entries in previous order.
    let current: Vec<usize> = (0..previous.len()).filter(|i| retained[*i]).collect();
    let wanted: Vec<usize> = matches.iter().flatten().copied().collect();
    if current != wanted {
        let position: HashMap<usize, usize> = current
            .iter()
            .enumerate()
            .map(|(pos, prev_index)| (*prev_index, pos))
            .collect();
        let order = wanted.iter().map(|prev_index| position[prev_index]).collect();
        out.push(PatchOp::reorder(path.clone(), order));
    }

    for (next_index, matched) in matches.iter().enumerate() {
        if matched.is_none() {
            out.push(PatchOp::insert(path.index(next_index), next[next_index].to_value()));
        }
    }

    for (next_index, matched) in matches.iter().enumerate() {
        if let Some(prev_index) = matched {
            diff_node(&previous[*prev_index], &next[next_index], &path.index(next_index), out);
        }
    }
}

/// For each entry of `next`, the index of the previous entry it continues.
fn match_children(previous: &[Node], next: &[Node]) -> Vec<Option<usize>> {
    let mut first_by_key: HashMap<&str, usize> = HashMap::new();
    for (index, node) in previous.iter().enumerate() {
        if let Some(key) = node.key.as_deref() {
            first_by_key.entry(key).or_insert(index);
        }
    }

    let mut used = vec![false; previous.len()];
    let mut seen_keys: HashSet<&str> = HashSet::new();
    let mut matches = Vec::with_capacity(next.len());
    for (index, node) in next.iter().enumerate() {
        let candidate = match node.key.as_deref() {
            Some(key) => {
                if seen_keys.insert(key) {
                    first_by_key.get(key).copied()
                } else {
                    None
                }
            }
            None => previous
                .get(index)
                .filter(|prev| prev.key.is_none())
                .map(|_| index),
        };
        let matched = candidate.filter(|prev_index| !used[*prev_index]);
        if let Some(prev_index) = matched {
            used[prev_index] = true;
        }
        matches.push(matched);
    }
    matches
}
