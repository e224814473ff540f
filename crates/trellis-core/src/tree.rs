use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub type Props = IndexMap<String, Prop>;

pub const CHILDREN: &str = "children";

const NODE_FIELDS: [&str; 4] = ["type", "props", "key", "component"];

/// A declarative UI node as rendered by the server and mirrored by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: String,
    pub props: Props,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

/// A prop value. Nested nodes and node lists are diffed structurally, plain
/// JSON values are compared and replaced as a whole.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Prop {
    Node(Box<Node>),
    List(Vec<Node>),
    Value(Value),
}

impl Node {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            props: Props::new(),
            key: None,
            component: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new("text").prop("content", content.into())
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Prop>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn children(self, children: Vec<Node>) -> Self {
        self.prop(CHILDREN, Prop::List(children))
    }

    pub fn child(mut self, child: Node) -> Self {
        match self.props.get_mut(CHILDREN) {
            Some(Prop::List(items)) => items.push(child),
            _ => {
                self.props
                    .insert(CHILDREN.to_string(), Prop::List(vec![child]));
            }
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Prop> {
        self.props.get(key)
    }

    pub fn child_nodes(&self) -> &[Node] {
        match self.props.get(CHILDREN) {
            Some(Prop::List(items)) => items,
            _ => &[],
        }
    }

    /// Same `(type, key, component)`: diffing treats the two as one logical node.
    pub fn same_identity(&self, other: &Node) -> bool {
        self.kind == other.kind && self.key == other.key && self.component == other.component
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

impl Prop {
    /// Classifies a JSON value: node-shaped objects become `Node`, arrays made
    /// only of node-shaped objects (including the empty array) become `List`.
    pub fn from_value(value: Value) -> Self {
        match &value {
            Value::Object(map) if looks_like_node(map) => {
                match serde_json::from_value::<Node>(value.clone()) {
                    Ok(node) => Prop::Node(Box::new(node)),
                    Err(_) => Prop::Value(value),
                }
            }
            Value::Array(items)
                if items
                    .iter()
                    .all(|item| item.as_object().is_some_and(looks_like_node)) =>
            {
                match serde_json::from_value::<Vec<Node>>(value.clone()) {
                    Ok(nodes) => Prop::List(nodes),
                    Err(_) => Prop::Value(value),
                }
            }
            _ => Prop::Value(value),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Prop::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }
}

impl<'de> Deserialize<'de> for Prop {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(Prop::from_value(value))
    }
}

fn looks_like_node(map: &Map<String, Value>) -> bool {
    map.get("type").is_some_and(Value::is_string)
        && map.get("props").is_some_and(Value::is_object)
        && map.keys().all(|key| NODE_FIELDS.contains(&key.as_str()))
}

impl From<Value> for Prop {
    fn from(value: Value) -> Self {
        Prop::from_value(value)
    }
}

impl From<Node> for Prop {
    fn from(node: Node) -> Self {
        Prop::Node(Box::new(node))
    }
}

impl From<Vec<Node>> for Prop {
    fn from(nodes: Vec<Node>) -> Self {
        Prop::List(nodes)
    }
}

impl From<&str> for Prop {
    fn from(value: &str) -> Self {
        Prop::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Prop {
    fn from(value: String) -> Self {
        Prop::Value(Value::String(value))
    }
}

impl From<bool> for Prop {
    fn from(value: bool) -> Self {
        Prop::Value(Value::Bool(value))
    }
}

impl From<i64> for Prop {
    fn from(value: i64) -> Self {
        Prop::Value(Value::from(value))
    }
}

impl From<i32> for Prop {
    fn from(value: i32) -> Self {
        Prop::Value(Value::from(value))
    }
}

impl From<u64> for Prop {
    fn from(value: u64) -> Self {
        Prop::Value(Value::from(value))
    }
}

impl From<f64> for Prop {
    fn from(value: f64) -> Self {
        Prop::Value(Value::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_serializes_to_wire_shape() {
        let tree = Node::new("div").child(Node::text("0"));
        assert_eq!(
            tree.to_value(),
            json!({"type":"div","props":{"children":[{"type":"text","props":{"content":"0"}}]}})
        );
    }

    #[test]
    fn props_classify_nodes_lists_and_plain_values() {
        let raw = json!({
            "type": "card",
            "props": {
                "header": {"type": "text", "props": {"content": "hi"}},
                "children": [],
                "style": {"type": "bold"},
                "tags": [1, 2],
                "mixed": [{"type": "text", "props": {}}, 3]
            },
            "key": "c1"
        });
        let node = Node::from_value(raw).expect("node");
        assert!(matches!(node.get("header"), Some(Prop::Node(_))));
        assert!(matches!(node.get("children"), Some(Prop::List(items)) if items.is_empty()));
        assert!(matches!(node.get("style"), Some(Prop::Value(_))));
        assert!(matches!(node.get("tags"), Some(Prop::Value(_))));
        assert!(matches!(node.get("mixed"), Some(Prop::Value(_))));
        assert_eq!(node.key.as_deref(), Some("c1"));
    }

    #[test]
    fn unknown_fields_keep_object_as_plain_value() {
        let prop = Prop::from_value(json!({"type": "x", "props": {}, "extra": true}));
        assert!(matches!(prop, Prop::Value(_)));
    }

    #[test]
    fn prop_order_is_preserved() {
        let node = Node::new("input")
            .prop("value", "a")
            .prop("placeholder", "b")
            .prop("disabled", false);
        let keys: Vec<_> = node.props.keys().cloned().collect();
        assert_eq!(keys, vec!["value", "placeholder", "disabled"]);
        let text = serde_json::to_string(&node).expect("encode");
        assert!(text.find("value").unwrap() < text.find("placeholder").unwrap());
    }
}
