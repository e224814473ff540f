use crate::tree::{Node, Prop};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

/// Location of a prop or list entry, starting at the root node. Key segments
/// address a node's props, index segments address entries of a node list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathSegment>);

impl Path {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn key(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key.to_string()));
        Self(segments)
    }

    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        Self(segments)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (position, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if position == 0 => write!(f, "{key}")?,
                PathSegment::Key(key) => write!(f, ".props.{key}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOpKind {
    Replace,
    Insert,
    Remove,
    Reorder,
}

impl PatchOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOpKind::Replace => "replace",
            PatchOpKind::Insert => "insert",
            PatchOpKind::Remove => "remove",
            PatchOpKind::Reorder => "reorder",
        }
    }
}

impl fmt::Display for PatchOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub path: Path,
    pub op: PatchOpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

pub type Patch = Vec<PatchOp>;

impl PatchOp {
    pub fn replace(path: Path, value: Value) -> Self {
        Self {
            path,
            op: PatchOpKind::Replace,
            value: Some(value),
        }
    }

    pub fn insert(path: Path, value: Value) -> Self {
        Self {
            path,
            op: PatchOpKind::Insert,
            value: Some(value),
        }
    }

    pub fn remove(path: Path) -> Self {
        Self {
            path,
            op: PatchOpKind::Remove,
            value: None,
        }
    }

    /// `order[i]` is the current index of the entry that moves to position `i`.
    pub fn reorder(path: Path, order: Vec<usize>) -> Self {
        Self {
            path,
            op: PatchOpKind::Reorder,
            value: Some(Value::from(order)),
        }
    }
}

pub fn is_root_replace(patch: &[PatchOp]) -> bool {
    patch
        .iter()
        .any(|op| op.op == PatchOpKind::Replace && op.path.is_root())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("{op} at {path} requires a value")]
    MissingValue { path: String, op: PatchOpKind },
    #[error("invalid value for {op} at {path}: {reason}")]
    InvalidValue {
        path: String,
        op: PatchOpKind,
        reason: String,
    },
}

enum Slot<'a> {
    Node(&'a mut Node),
    List(&'a mut Vec<Node>),
}

/// Applies `patch` in order. On error the tree may be partially patched;
/// callers recover by requesting a full tree.
pub fn apply_patch(tree: &mut Node, patch: &[PatchOp]) -> Result<(), PatchError> {
    for op in patch {
        apply_op(tree, op)?;
    }
    Ok(())
}

fn apply_op(tree: &mut Node, op: &PatchOp) -> Result<(), PatchError> {
    if op.op == PatchOpKind::Reorder {
        let order = reorder_value(op)?;
        return match resolve(tree, op.path.segments(), &op.path)? {
            Slot::List(items) => permute(items, &order, op),
            Slot::Node(_) => Err(invalid_path(&op.path, "reorder target is not a list")),
        };
    }

    let Some((last, parent)) = op.path.segments().split_last() else {
        return match op.op {
            PatchOpKind::Replace => {
                *tree = node_value(op)?;
                Ok(())
            }
            _ => Err(invalid_path(&op.path, "only replace can target the root")),
        };
    };

    match (resolve(tree, parent, &op.path)?, last, op.op) {
        (Slot::Node(node), PathSegment::Key(key), PatchOpKind::Replace) => {
            let value = required_value(op)?;
            node.props.insert(key.clone(), Prop::from_value(value.clone()));
            Ok(())
        }
        (Slot::Node(node), PathSegment::Key(key), PatchOpKind::Remove) => {
            if node.props.shift_remove(key).is_none() {
                return Err(invalid_path(&op.path, "prop does not exist"));
            }
            Ok(())
        }
        (Slot::List(items), PathSegment::Index(index), PatchOpKind::Replace) => {
            let node = node_value(op)?;
            let slot = items
                .get_mut(*index)
                .ok_or_else(|| invalid_path(&op.path, "index out of bounds"))?;
            *slot = node;
            Ok(())
        }
        (Slot::List(items), PathSegment::Index(index), PatchOpKind::Insert) => {
            if *index > items.len() {
                return Err(invalid_path(&op.path, "index out of bounds"));
            }
            let node = node_value(op)?;
            items.insert(*index, node);
            Ok(())
        }
        (Slot::List(items), PathSegment::Index(index), PatchOpKind::Remove) => {
            if *index >= items.len() {
                return Err(invalid_path(&op.path, "index out of bounds"));
            }
            items.remove(*index);
            Ok(())
        }
        (_, _, kind) => Err(invalid_path(
            &op.path,
            &format!("{kind} does not apply to this location"),
        )),
    }
}

fn resolve<'a>(
    tree: &'a mut Node,
    segments: &[PathSegment],
    full: &Path,
) -> Result<Slot<'a>, PatchError> {
    let mut slot = Slot::Node(tree);
    for segment in segments {
        slot = match (slot, segment) {
            (Slot::Node(node), PathSegment::Key(key)) => match node.props.get_mut(key) {
                Some(Prop::Node(child)) => Slot::Node(child),
                Some(Prop::List(items)) => Slot::List(items),
                Some(Prop::Value(_)) => {
                    return Err(invalid_path(full, "cannot descend into a plain value"))
                }
                None => return Err(invalid_path(full, "prop does not exist")),
            },
            (Slot::List(items), PathSegment::Index(index)) => match items.get_mut(*index) {
                Some(node) => Slot::Node(node),
                None => return Err(invalid_path(full, "index out of bounds")),
            },
            (Slot::Node(_), PathSegment::Index(_)) => {
                return Err(invalid_path(full, "index segment on a node"))
            }
            (Slot::List(_), PathSegment::Key(_)) => {
                return Err(invalid_path(full, "key segment on a list"))
            }
        };
    }
    Ok(slot)
}

fn permute(items: &mut Vec<Node>, order: &[usize], op: &PatchOp) -> Result<(), PatchError> {
    if order.len() != items.len() {
        return Err(invalid_value(op, "permutation length mismatch"));
    }
    let mut seen = vec![false; order.len()];
    for &index in order {
        if index >= seen.len() || seen[index] {
            return Err(invalid_value(op, "not a permutation"));
        }
        seen[index] = true;
    }
    let mut current: Vec<Option<Node>> = items.drain(..).map(Some).collect();
    for &index in order {
        if let Some(node) = current[index].take() {
            items.push(node);
        }
    }
    Ok(())
}

fn reorder_value(op: &PatchOp) -> Result<Vec<usize>, PatchError> {
    let value = required_value(op)?;
    serde_json::from_value::<Vec<usize>>(value.clone())
        .map_err(|err| invalid_value(op, &err.to_string()))
}

fn required_value(op: &PatchOp) -> Result<&Value, PatchError> {
    op.value.as_ref().ok_or_else(|| PatchError::MissingValue {
        path: op.path.to_string(),
        op: op.op,
    })
}

fn node_value(op: &PatchOp) -> Result<Node, PatchError> {
    let value = required_value(op)?;
    Node::from_value(value.clone()).map_err(|err| invalid_value(op, &err.to_string()))
}

fn invalid_path(path: &Path, reason: &str) -> PatchError {
    PatchError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn invalid_value(op: &PatchOp, reason: &str) -> PatchError {
    PatchError::InvalidValue {
        path: op.path.to_string(),
        op: op.op,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn list() -> Node {
        Node::new("ul").children(vec![
            Node::text("a").with_key("a"),
            Node::text("b").with_key("b"),
            Node::text("c").with_key("c"),
        ])
    }

    fn contents(node: &Node) -> Vec<String> {
        node.child_nodes()
            .iter()
            .filter_map(|child| child.get("content").and_then(Prop::as_str))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn path_display_uses_props_notation() {
        let path = Path::root().key("children").index(0).key("content");
        assert_eq!(path.to_string(), "children[0].props.content");
        assert_eq!(Path::root().to_string(), "<root>");
    }

    #[test]
    fn patch_op_wire_shape() {
        let op = PatchOp::replace(Path::root().key("children").index(0).key("content"), json!("1"));
        assert_eq!(
            serde_json::to_value(&op).expect("encode"),
            json!({"path": ["children", 0, "content"], "op": "replace", "value": "1"})
        );
        let removed: PatchOp =
            serde_json::from_value(json!({"path": ["title"], "op": "remove"})).expect("decode");
        assert_eq!(removed, PatchOp::remove(Path::root().key("title")));
    }

    #[test]
    fn insert_remove_and_reorder_list_entries() {
        let mut tree = list();
        let children = Path::root().key("children");
        apply_patch(
            &mut tree,
            &[
                PatchOp::remove(children.index(1)),
                PatchOp::reorder(children.clone(), vec![1, 0]),
                PatchOp::insert(children.index(1), Node::text("d").to_value()),
            ],
        )
        .expect("apply");
        assert_eq!(contents(&tree), vec!["c", "d", "a"]);
    }

    #[test]
    fn replace_root_and_props() {
        let mut tree = list();
        apply_patch(
            &mut tree,
            &[
                PatchOp::replace(Path::root().key("title"), json!("Items")),
                PatchOp::replace(
                    Path::root().key("children").index(2).key("content"),
                    json!("z"),
                ),
            ],
        )
        .expect("apply");
        assert_eq!(tree.get("title").and_then(Prop::as_str), Some("Items"));
        assert_eq!(contents(&tree), vec!["a", "b", "z"]);

        apply_patch(&mut tree, &[PatchOp::replace(Path::root(), Node::text("x").to_value())])
            .expect("apply root");
        assert_eq!(tree, Node::text("x"));
    }

    #[test]
    fn rejects_invalid_operations() {
        let mut tree = list();
        let out_of_bounds = apply_patch(
            &mut tree,
            &[PatchOp::remove(Path::root().key("children").index(7))],
        );
        assert!(matches!(out_of_bounds, Err(PatchError::InvalidPath { .. })));

        let bad_order = apply_patch(
            &mut tree,
            &[PatchOp::reorder(Path::root().key("children"), vec![0, 0, 1])],
        );
        assert!(matches!(bad_order, Err(PatchError::InvalidValue { .. })));

        let missing = apply_patch(
            &mut tree,
            &[PatchOp {
                path: Path::root().key("title"),
                op: PatchOpKind::Replace,
                value: None,
            }],
        );
        assert!(matches!(missing, Err(PatchError::MissingValue { .. })));

        let into_value = apply_patch(
            &mut tree,
            &[PatchOp::replace(
                Path::root().key("children").index(0).key("content").key("x"),
                json!(1),
            )],
        );
        assert!(matches!(into_value, Err(PatchError::InvalidPath { .. })));
    }
}
