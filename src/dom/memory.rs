use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use indexmap::IndexMap;

use crate::dom::{
    DomEvent, DomProvider, EventHandler, HandlerId, MutationCallback, NodeId, NodeKind,
    is_void_tag,
};
use crate::engine::value::Value;

struct NodeData {
    kind: NodeKind,
    tag: String,
    text: String,
    attributes: IndexMap<String, String>,
    properties: HashMap<String, Value>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    listeners: Vec<(HandlerId, String, EventHandler)>,
    observers: Vec<(HandlerId, MutationCallback)>,
}

impl NodeData {
    fn new(kind: NodeKind, tag: &str, text: &str) -> Self {
        Self {
            kind,
            tag: tag.to_string(),
            text: text.to_string(),
            attributes: IndexMap::new(),
            properties: HashMap::new(),
            parent: None,
            children: Vec::new(),
            listeners: Vec::new(),
            observers: Vec::new(),
        }
    }
}

/// メモリ上の要素ツリー
///
/// ネイティブ環境でのテストとデモ用。HTML への書き出しもできる。
#[derive(Default)]
pub struct MemoryDom {
    nodes: RefCell<Vec<NodeData>>,
    next_handler: Cell<HandlerId>,
}

impl MemoryDom {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_handler_id(&self) -> HandlerId {
        let id = self.next_handler.get() + 1;
        self.next_handler.set(id);
        id
    }

    fn with_node<R>(&self, node: NodeId, f: impl FnOnce(&NodeData) -> R) -> Option<R> {
        self.nodes.borrow().get(node.0).map(f)
    }

    fn with_node_mut<R>(&self, node: NodeId, f: impl FnOnce(&mut NodeData) -> R) -> Option<R> {
        self.nodes.borrow_mut().get_mut(node.0).map(f)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// 利用者の入力のような外部起因の変更を再現する。
    /// プロパティを書き換え、変更監視と `input` イベントを発火する。
    pub fn input(&self, node: NodeId, name: &str, value: impl Into<Value>) {
        let value = value.into();
        self.with_node_mut(node, |data| {
            data.properties.insert(name.to_string(), value.clone());
        });
        let observers: Vec<MutationCallback> = self
            .with_node(node, |data| data.observers.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for observer in observers {
            observer(node, name, &value);
        }
        self.dispatch_event(&DomEvent::new("input", node).with_detail(value));
    }

    /// クリックを再現する
    pub fn click(&self, node: NodeId) {
        self.dispatch_event(&DomEvent::new("click", node));
    }

    pub fn listener_count(&self, node: NodeId) -> usize {
        self.with_node(node, |data| data.listeners.len()).unwrap_or(0)
    }

    pub fn observer_count(&self, node: NodeId) -> usize {
        self.with_node(node, |data| data.observers.len()).unwrap_or(0)
    }

    /// 最初に見つかった指定タグの要素（深さ優先）
    pub fn find_by_tag(&self, root: NodeId, tag: &str) -> Option<NodeId> {
        self.find_all_by_tag(root, tag).into_iter().next()
    }

    pub fn find_all_by_tag(&self, root: NodeId, tag: &str) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if self.tag(node).as_deref() == Some(tag) {
                found.push(node);
            }
            let mut children = self.children(node);
            children.reverse();
            stack.extend(children);
        }
        found
    }

    /// 子孫のテキストを連結したもの
    pub fn text_content(&self, node: NodeId) -> String {
        match self.kind(node) {
            Some(NodeKind::Text) => self.text(node).unwrap_or_default(),
            Some(NodeKind::Element) => self
                .children(node)
                .into_iter()
                .map(|child| self.text_content(child))
                .collect(),
            None => String::new(),
        }
    }

    /// サブツリーを HTML として書き出す
    pub fn to_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.write_html(node, &mut out);
        out
    }

    /// 子要素だけを書き出す
    pub fn inner_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        for child in self.children(node) {
            self.write_html(child, &mut out);
        }
        out
    }

    fn write_html(&self, node: NodeId, out: &mut String) {
        match self.kind(node) {
            Some(NodeKind::Text) => out.push_str(&escape_html(&self.text(node).unwrap_or_default())),
            Some(NodeKind::Element) => {
                let tag = self.tag(node).unwrap_or_default();
                out.push('<');
                out.push_str(&tag);
                for (name, value) in self.attributes(node) {
                    out.push_str(&format!(" {}=\"{}\"", name, escape_html(&value)));
                }
                out.push('>');
                if is_void_tag(&tag) {
                    return;
                }
                for child in self.children(node) {
                    self.write_html(child, out);
                }
                out.push_str(&format!("</{}>", tag));
            }
            None => {}
        }
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

impl DomProvider for MemoryDom {
    fn create_element(&self, tag: &str) -> NodeId {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(NodeData::new(NodeKind::Element, tag, ""));
        NodeId(nodes.len() - 1)
    }

    fn create_text(&self, text: &str) -> NodeId {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(NodeData::new(NodeKind::Text, "", text));
        NodeId(nodes.len() - 1)
    }

    fn append_child(&self, parent: NodeId, child: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        if parent.0 >= nodes.len() || child.0 >= nodes.len() {
            log::warn!("append_child on unknown node: {} <- {}", parent, child);
            return;
        }
        if let Some(old_parent) = nodes[child.0].parent {
            nodes[old_parent.0].children.retain(|c| *c != child);
        }
        nodes[child.0].parent = Some(parent);
        nodes[parent.0].children.push(child);
    }

    fn kind(&self, node: NodeId) -> Option<NodeKind> {
        self.with_node(node, |data| data.kind)
    }

    fn tag(&self, node: NodeId) -> Option<String> {
        self.with_node(node, |data| data.tag.clone())
            .filter(|_| self.kind(node) == Some(NodeKind::Element))
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.with_node(node, |data| data.parent).flatten()
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.with_node(node, |data| data.children.clone()).unwrap_or_default()
    }

    fn attributes(&self, node: NodeId) -> Vec<(String, String)> {
        self.with_node(node, |data| {
            data.attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
    }

    fn get_attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.with_node(node, |data| data.attributes.get(name).cloned()).flatten()
    }

    fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        self.with_node_mut(node, |data| {
            data.attributes.insert(name.to_string(), value.to_string());
        });
    }

    fn remove_attribute(&self, node: NodeId, name: &str) {
        self.with_node_mut(node, |data| {
            data.attributes.shift_remove(name);
        });
    }

    fn get_property(&self, node: NodeId, name: &str) -> Option<Value> {
        self.with_node(node, |data| {
            data.properties
                .get(name)
                .cloned()
                .or_else(|| data.attributes.get(name).map(|v| Value::from(v.as_str())))
        })
        .flatten()
    }

    fn set_property(&self, node: NodeId, name: &str, value: Value) {
        self.with_node_mut(node, |data| {
            data.properties.insert(name.to_string(), value);
        });
    }

    fn text(&self, node: NodeId) -> Option<String> {
        self.with_node(node, |data| data.text.clone())
            .filter(|_| self.kind(node) == Some(NodeKind::Text))
    }

    fn set_text(&self, node: NodeId, text: &str) {
        self.with_node_mut(node, |data| data.text = text.to_string());
    }

    fn add_event_listener(&self, node: NodeId, kind: &str, handler: EventHandler) -> HandlerId {
        let id = self.next_handler_id();
        self.with_node_mut(node, |data| data.listeners.push((id, kind.to_string(), handler)));
        id
    }

    fn remove_event_listener(&self, node: NodeId, id: HandlerId) {
        self.with_node_mut(node, |data| data.listeners.retain(|(hid, _, _)| *hid != id));
    }

    fn dispatch_event(&self, event: &DomEvent) {
        let mut current = event.target;
        while let Some(node) = current {
            let handlers: Vec<EventHandler> = self
                .with_node(node, |data| {
                    data.listeners
                        .iter()
                        .filter(|(_, kind, _)| *kind == event.kind)
                        .map(|(_, _, handler)| handler.clone())
                        .collect()
                })
                .unwrap_or_default();
            for handler in handlers {
                handler(event);
            }
            current = self.parent(node);
        }
    }

    fn observe(&self, node: NodeId, callback: MutationCallback) -> HandlerId {
        let id = self.next_handler_id();
        self.with_node_mut(node, |data| data.observers.push((id, callback)));
        id
    }

    fn unobserve(&self, node: NodeId, id: HandlerId) {
        self.with_node_mut(node, |data| data.observers.retain(|(oid, _)| *oid != id));
    }
}
