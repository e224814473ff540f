use trellis_core::patch::{apply_patch, Patch, PatchError};
use trellis_core::tree::Node;

/// Local copy of the server's tree for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct View {
    pub session_id: Option<String>,
    pub version: u64,
    pub tree: Option<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Changed,
    /// Update at or below the current version; dropped.
    Stale,
    /// The mirror can no longer follow with patches and needs a full tree.
    OutOfSync(String),
}

impl View {
    pub fn init(&mut self, session_id: String, version: u64, tree: Node) -> Applied {
        // Always taken: a restarted session worker counts versions from 1 again.
        self.session_id = Some(session_id);
        self.version = version;
        self.tree = Some(tree);
        Applied::Changed
    }

    pub fn update(&mut self, version: u64, patch: &Patch) -> Applied {
        let Some(current) = self.tree.as_ref() else {
            return Applied::OutOfSync("update before init".to_string());
        };
        if version <= self.version {
            return Applied::Stale;
        }
        if version != self.version + 1 {
            return Applied::OutOfSync(format!(
                "missed versions {}..{}",
                self.version + 1,
                version
            ));
        }
        let mut next = current.clone();
        match apply_patch(&mut next, patch) {
            Ok(()) => {
                self.tree = Some(next);
                self.version = version;
                Applied::Changed
            }
            Err(err) => Applied::OutOfSync(describe(&err)),
        }
    }
}

fn describe(err: &PatchError) -> String {
    format!("patch rejected: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::patch::{Path, PatchOp};

    fn counter(count: &str) -> Node {
        Node::new("div").child(Node::text(count))
    }

    fn content_path() -> Path {
        Path::root().key("children").index(0).key("content")
    }

    fn initialised() -> View {
        let mut view = View::default();
        view.init("s1".to_string(), 1, counter("0"));
        view
    }

    #[test]
    fn update_patches_tree_and_advances_version() {
        let mut view = initialised();
        let patch = vec![PatchOp::replace(content_path(), json!("1"))];
        assert_eq!(view.update(2, &patch), Applied::Changed);
        assert_eq!(view.version, 2);
        assert_eq!(view.tree, Some(counter("1")));
    }

    #[test]
    fn stale_updates_leave_the_tree_alone() {
        let mut view = initialised();
        view.update(2, &vec![PatchOp::replace(content_path(), json!("1"))]);

        let late = vec![PatchOp::replace(content_path(), json!("late"))];
        assert_eq!(view.update(2, &late), Applied::Stale);
        assert_eq!(view.update(1, &late), Applied::Stale);
        assert_eq!(view.tree, Some(counter("1")));
    }

    #[test]
    fn gaps_and_bad_patches_need_a_full_tree() {
        let mut view = initialised();
        let patch = vec![PatchOp::replace(content_path(), json!("1"))];
        assert!(matches!(view.update(3, &patch), Applied::OutOfSync(_)));

        let broken = vec![PatchOp::remove(Path::root().key("children").index(7))];
        assert!(matches!(view.update(2, &broken), Applied::OutOfSync(_)));
        assert_eq!(view.version, 1);
        assert_eq!(view.tree, Some(counter("0")));

        let mut empty = View::default();
        assert!(matches!(empty.update(1, &patch), Applied::OutOfSync(_)));
    }

    #[test]
    fn init_replaces_even_with_lower_version() {
        let mut view = initialised();
        view.update(2, &vec![PatchOp::replace(content_path(), json!("1"))]);
        view.init("s1".to_string(), 1, counter("9"));
        assert_eq!(view.version, 1);
        assert_eq!(view.tree, Some(counter("9")));
    }
}
