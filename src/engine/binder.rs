// ========================================
// ツリーバインダー
// ========================================
//
// 要素ツリーを走査して属性を分類し、バインディング・補間・イベントハンドラを張る。
// 外部から書き換えられる属性には逆方向の変更検知を仕込む。

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::dom::{DomProvider, HandlerId, NodeId, NodeKind};
use crate::engine::binding::BindingExpression;
use crate::engine::error::BindError;
use crate::engine::live_value::LiveValue;
use crate::engine::object::{LiveObject, PropertyHost};
use crate::engine::observable::{ChangeEvent, Observable};
use crate::engine::text::{LiveText, TextNodeBinding, has_live_text};
use crate::engine::value::Value;

/// バインダーの設定
#[derive(Debug, Clone)]
pub struct BinderConfig {
    /// 子要素をライブバインドしないタグ
    pub no_recurse_tags: Vec<String>,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            no_recurse_tags: vec!["style".to_string(), "script".to_string()],
        }
    }
}

impl BinderConfig {
    pub fn is_no_recurse(&self, tag: &str) -> bool {
        self.no_recurse_tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// 属性の分類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    /// `on*` 属性
    EventHandler { event: String, path: String },
    /// `@path` 形式
    Binding(String),
    /// `{path}` を含む
    Interpolated(String),
    Literal(String),
}

impl AttributeKind {
    pub fn classify(name: &str, value: &str) -> Self {
        if name.len() > 2 && name.starts_with("on") {
            AttributeKind::EventHandler {
                event: name[2..].to_string(),
                path: value.trim().to_string(),
            }
        } else if let Some(expression) = value.strip_prefix('@') {
            AttributeKind::Binding(expression.to_string())
        } else if has_live_text(value) {
            AttributeKind::Interpolated(value.to_string())
        } else {
            AttributeKind::Literal(value.to_string())
        }
    }
}

// ========================================
// 要素ホスト
// ========================================

/// 要素の属性をセルとして見せるホスト
///
/// セルへの書き込みは要素のプロパティに反映される。
/// 真偽値の true は属性を立て、false は属性を外す。
pub struct ElementHost {
    dom: Rc<dyn DomProvider>,
    node: NodeId,
    tag: String,
    cells: RefCell<HashMap<String, LiveValue>>,
}

impl ElementHost {
    pub fn new(dom: Rc<dyn DomProvider>, node: NodeId) -> Self {
        let tag = dom.tag(node).unwrap_or_default();
        Self {
            dom,
            node,
            tag,
            cells: RefCell::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn cell(&self, name: &str) -> Option<LiveValue> {
        self.cells.borrow().get(name).cloned()
    }

    /// 属性のセルを用意する。初期値は要素の現在のプロパティ
    pub fn ensure_cell(&self, name: &str) -> LiveValue {
        if let Some(cell) = self.cell(name) {
            return cell;
        }
        let initial = self.dom.get_property(self.node, name).unwrap_or_default();
        let cell = LiveValue::new(initial, name, &self.tag);

        let dom = self.dom.clone();
        let node = self.node;
        let attribute = name.to_string();
        cell.subscribe(Rc::new(move |event: &ChangeEvent| {
            reflect(dom.as_ref(), node, &attribute, &event.value);
        }));

        self.cells.borrow_mut().insert(name.to_string(), cell.clone());
        cell
    }

    /// 外部から観測された値でセルを上書きする（値が異なるときだけ）
    fn on_external_change(&self, name: &str, value: &Value) {
        let Some(cell) = self.cell(name) else {
            return;
        };
        if cell.get() != *value {
            log::debug!("<{}> {} changed externally", self.tag, name);
            cell.override_value(value.clone());
        }
    }

    fn detach_all(&self) {
        for cell in self.cells.borrow().values() {
            cell.detach();
        }
    }
}

fn reflect(dom: &dyn DomProvider, node: NodeId, name: &str, value: &Value) {
    dom.set_property(node, name, value.clone());
    match value {
        Value::Bool(true) => dom.set_attribute(node, name, "true"),
        Value::Bool(false) | Value::Null => dom.remove_attribute(node, name),
        Value::Number(_) | Value::Text(_) => dom.set_attribute(node, name, &value.to_string()),
        Value::Object(_) | Value::List(_) => {}
    }
}

impl PropertyHost for ElementHost {
    fn type_name(&self) -> String {
        self.tag.clone()
    }

    fn has_property(&self, name: &str) -> bool {
        self.cells.borrow().contains_key(name) || self.dom.get_property(self.node, name).is_some()
    }

    fn live_cell(&self, name: &str) -> Option<Rc<dyn Observable>> {
        self.cell(name).map(|cell| Rc::new(cell) as Rc<dyn Observable>)
    }

    fn raw_get(&self, name: &str) -> Option<Value> {
        match self.cell(name) {
            Some(cell) => Some(cell.get()),
            None => self.dom.get_property(self.node, name),
        }
    }

    fn raw_set(&self, name: &str, value: Value) -> bool {
        match self.cell(name) {
            Some(cell) => cell.set(value),
            None => self.dom.set_property(self.node, name, value),
        }
        true
    }
}

impl fmt::Debug for ElementHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementHost")
            .field("node", &self.node)
            .field("tag", &self.tag)
            .field("cells", &self.cells.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

// ========================================
// バインダー本体
// ========================================

/// サブツリーをコンテキストに結びつける
///
/// 作成したバインディングは全てこのバインダーが所有し、unbind か drop で破棄する。
pub struct TreeBinder {
    dom: Rc<dyn DomProvider>,
    config: BinderConfig,
    hosts: HashMap<NodeId, Rc<ElementHost>>,
    /// 逆方向検知を仕込んだ要素と監視ハンドル
    instrumented: HashMap<NodeId, HandlerId>,
    bindings: Vec<BindingExpression>,
    live_attributes: Vec<(LiveValue, LiveText)>,
    texts: Vec<TextNodeBinding>,
    handlers: Vec<(NodeId, HandlerId)>,
}

impl TreeBinder {
    pub fn new(dom: Rc<dyn DomProvider>, config: BinderConfig) -> Self {
        Self {
            dom,
            config,
            hosts: HashMap::new(),
            instrumented: HashMap::new(),
            bindings: Vec::new(),
            live_attributes: Vec::new(),
            texts: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn config(&self) -> &BinderConfig {
        &self.config
    }

    /// root とその子孫を context に結びつける
    pub fn bind(&mut self, context: &LiveObject, root: NodeId) -> Result<(), BindError> {
        log::info!("binding <{}> to {}", self.dom.tag(root).unwrap_or_default(), context.type_name());
        self.bind_node(context, root)?;
        log::debug!(
            "bound {} expressions, {} live attributes, {} text nodes, {} handlers",
            self.bindings.len(),
            self.live_attributes.len(),
            self.texts.len(),
            self.handlers.len()
        );
        Ok(())
    }

    fn bind_node(&mut self, context: &LiveObject, node: NodeId) -> Result<(), BindError> {
        match self.dom.kind(node) {
            Some(NodeKind::Text) => {
                let text = self.dom.text(node).unwrap_or_default();
                if has_live_text(&text) {
                    let binding = TextNodeBinding::new(self.dom.clone(), node, Rc::new(context.clone()))?;
                    self.texts.push(binding);
                }
                Ok(())
            }
            Some(NodeKind::Element) => {
                let tag = self.dom.tag(node).unwrap_or_default();
                self.bind_attributes(context, node)?;

                if let Some(key) = self.dom.get_attribute(node, "key") {
                    context.set_child(&key, node);
                }

                if self.config.is_no_recurse(&tag) {
                    self.reconstruct_static(context, node);
                    return Ok(());
                }
                for child in self.dom.children(node) {
                    self.bind_node(context, child)?;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// 非再帰タグの中身は一度だけ補間して書き戻す
    fn reconstruct_static(&self, context: &LiveObject, node: NodeId) {
        for child in self.dom.children(node) {
            if self.dom.kind(child) != Some(NodeKind::Text) {
                continue;
            }
            let text = self.dom.text(child).unwrap_or_default();
            if has_live_text(&text) {
                self.dom.set_text(child, &context.interpolate(&text));
            }
        }
    }

    fn bind_attributes(&mut self, context: &LiveObject, node: NodeId) -> Result<(), BindError> {
        for (name, value) in self.dom.attributes(node) {
            match AttributeKind::classify(&name, &value) {
                AttributeKind::EventHandler { event, path } => {
                    let handler = context.resolve_handler(&path)?;
                    let id = self.dom.add_event_listener(node, &event, handler);
                    self.dom.set_attribute(node, &name, "");
                    self.handlers.push((node, id));
                    log::debug!("{} -> handler `{}`", name, path);
                }
                AttributeKind::Binding(expression) => {
                    let host = self.instrument(node);
                    host.ensure_cell(&name);
                    let binding = BindingExpression::with_target(
                        &expression,
                        Rc::new(context.clone()),
                        host,
                        &name,
                    )?;
                    log::debug!("{} bound to `{}`", name, expression);
                    self.bindings.push(binding);
                }
                AttributeKind::Interpolated(template) => {
                    let host = self.instrument(node);
                    let cell = host.ensure_cell(&name);
                    let text = LiveText::new(&template, Rc::new(context.clone()))?;
                    cell.set_source(Rc::new(text.clone()));
                    log::debug!("{} interpolates `{}`", name, template);
                    self.live_attributes.push((cell, text));
                }
                AttributeKind::Literal(literal) => match self.hosts.get(&node).and_then(|host| host.cell(&name)) {
                    Some(cell) => cell.set(literal),
                    None => self.dom.set_property(node, &name, Value::Text(literal)),
                },
            }
        }
        Ok(())
    }

    fn host(&mut self, node: NodeId) -> Rc<ElementHost> {
        self.hosts
            .entry(node)
            .or_insert_with(|| Rc::new(ElementHost::new(self.dom.clone(), node)))
            .clone()
    }

    /// 逆方向の変更検知を一度だけ仕込む
    fn instrument(&mut self, node: NodeId) -> Rc<ElementHost> {
        let host = self.host(node);
        if self.instrumented.contains_key(&node) {
            return host;
        }
        let weak: Weak<ElementHost> = Rc::downgrade(&host);
        let id = self.dom.observe(
            node,
            Rc::new(move |_node: NodeId, name: &str, value: &Value| {
                if let Some(host) = weak.upgrade() {
                    host.on_external_change(name, value);
                }
            }),
        );
        self.instrumented.insert(node, id);
        host
    }

    pub fn element_host(&self, node: NodeId) -> Option<Rc<ElementHost>> {
        self.hosts.get(&node).cloned()
    }

    pub fn is_instrumented(&self, node: NodeId) -> bool {
        self.instrumented.contains_key(&node)
    }

    pub fn bindings(&self) -> &[BindingExpression] {
        &self.bindings
    }

    pub fn text_count(&self) -> usize {
        self.texts.len()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// 所有している購読を全て外す
    pub fn unbind(&mut self) {
        for binding in self.bindings.drain(..) {
            binding.destroy();
        }
        for (cell, text) in self.live_attributes.drain(..) {
            cell.detach();
            text.destroy();
        }
        for text in self.texts.drain(..) {
            text.destroy();
        }
        for (node, id) in self.handlers.drain(..) {
            self.dom.remove_event_listener(node, id);
        }
        for (node, id) in self.instrumented.drain() {
            self.dom.unobserve(node, id);
        }
        for host in self.hosts.values() {
            host.detach_all();
        }
        self.hosts.clear();
    }
}

impl Drop for TreeBinder {
    fn drop(&mut self) {
        self.unbind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{DomEvent, MemoryDom};
    use std::cell::Cell;

    fn person() -> LiveObject {
        let object = LiveObject::new("Person");
        object.add_property("name", "Widgy");
        object.add_property("count", 3);
        object.add_property("visible", true);
        object.add_method("bump", |this, _event| {
            let next = this.get("count").and_then(|v| v.as_number()).unwrap_or(0.0) + 1.0;
            this.set("count", next);
        });
        object
    }

    fn element(dom: &MemoryDom, parent: NodeId, tag: &str, attributes: &[(&str, &str)]) -> NodeId {
        let node = dom.create_element(tag);
        for (name, value) in attributes {
            dom.set_attribute(node, name, value);
        }
        dom.append_child(parent, node);
        node
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            AttributeKind::classify("onclick", "bump"),
            AttributeKind::EventHandler {
                event: "click".to_string(),
                path: "bump".to_string()
            }
        );
        assert_eq!(
            AttributeKind::classify("value", "@=name"),
            AttributeKind::Binding("=name".to_string())
        );
        assert_eq!(
            AttributeKind::classify("title", "Hi {name}"),
            AttributeKind::Interpolated("Hi {name}".to_string())
        );
        assert_eq!(
            AttributeKind::classify("title", "Hi \\{name}"),
            AttributeKind::Literal("Hi \\{name}".to_string())
        );
    }

    #[test]
    fn test_two_way_input_with_reverse_sync() {
        let dom = Rc::new(MemoryDom::new());
        let root = dom.create_element("template");
        let input = element(&dom, root, "input", &[("value", "@=name")]);
        let context = person();

        let mut binder = TreeBinder::new(dom.clone(), BinderConfig::default());
        binder.bind(&context, root).expect("bind");
        assert!(binder.is_instrumented(input));
        assert_eq!(dom.get_property(input, "value"), Some(Value::from("Widgy")));

        dom.input(input, "value", "Typed");
        assert_eq!(context.get("name"), Some(Value::from("Typed")));

        context.set("name", "Model");
        assert_eq!(dom.get_property(input, "value"), Some(Value::from("Model")));
        assert_eq!(dom.get_attribute(input, "value").as_deref(), Some("Model"));
    }

    #[test]
    fn test_reverse_sync_skips_equal_values() {
        let dom = Rc::new(MemoryDom::new());
        let root = dom.create_element("template");
        let input = element(&dom, root, "input", &[("value", "@name")]);
        let context = person();
        let mut binder = TreeBinder::new(dom.clone(), BinderConfig::default());
        binder.bind(&context, root).expect("bind");

        let cell = binder.element_host(input).and_then(|h| h.cell("value")).expect("cell");
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        cell.subscribe(Rc::new(move |_: &ChangeEvent| h.set(h.get() + 1)));

        dom.input(input, "value", "Widgy");
        assert_eq!(hits.get(), 0);
        dom.input(input, "value", "Other");
        assert_eq!(hits.get(), 1);
        // 単方向なのでモデルは変わらない
        assert_eq!(context.get("name"), Some(Value::from("Widgy")));
    }

    #[test]
    fn test_interpolated_attribute_and_text() {
        let dom = Rc::new(MemoryDom::new());
        let root = dom.create_element("template");
        let p = element(&dom, root, "p", &[("title", "{name} ({count})")]);
        let text = dom.create_text("Count: {count}");
        dom.append_child(p, text);
        let context = person();

        let mut binder = TreeBinder::new(dom.clone(), BinderConfig::default());
        binder.bind(&context, root).expect("bind");
        assert_eq!(dom.get_attribute(p, "title").as_deref(), Some("Widgy (3)"));
        assert_eq!(dom.text(text).as_deref(), Some("Count: 3"));
        assert_eq!(binder.text_count(), 1);

        context.set("count", 4);
        assert_eq!(dom.get_attribute(p, "title").as_deref(), Some("Widgy (4)"));
        assert_eq!(dom.text(text).as_deref(), Some("Count: 4"));
    }

    #[test]
    fn test_event_handler_attribute() {
        let dom = Rc::new(MemoryDom::new());
        let root = dom.create_element("template");
        let button = element(&dom, root, "button", &[("onclick", "bump")]);
        let context = person();

        let mut binder = TreeBinder::new(dom.clone(), BinderConfig::default());
        binder.bind(&context, root).expect("bind");
        assert_eq!(dom.get_attribute(button, "onclick").as_deref(), Some(""));

        dom.dispatch_event(&DomEvent::new("click", button));
        assert_eq!(context.get("count"), Some(Value::from(4)));
    }

    #[test]
    fn test_missing_handler_fails() {
        let dom = Rc::new(MemoryDom::new());
        let root = dom.create_element("template");
        element(&dom, root, "button", &[("onclick", "launch")]);
        let mut binder = TreeBinder::new(dom.clone(), BinderConfig::default());
        let err = binder.bind(&person(), root).expect_err("missing handler");
        assert_eq!(err, BindError::handler("Person", "launch"));
    }

    #[test]
    fn test_boolean_attribute_reflection() {
        let dom = Rc::new(MemoryDom::new());
        let root = dom.create_element("template");
        let div = element(&dom, root, "div", &[("hidden", "@visible")]);
        let context = person();
        let mut binder = TreeBinder::new(dom.clone(), BinderConfig::default());
        binder.bind(&context, root).expect("bind");

        assert_eq!(dom.get_attribute(div, "hidden").as_deref(), Some("true"));
        context.set("visible", false);
        assert_eq!(dom.get_attribute(div, "hidden"), None);
        assert_eq!(dom.get_property(div, "hidden"), Some(Value::Bool(false)));
    }

    #[test]
    fn test_key_registers_child_and_no_recurse_is_static() {
        let dom = Rc::new(MemoryDom::new());
        let root = dom.create_element("template");
        let section = element(&dom, root, "section", &[("key", "main")]);
        let style = element(&dom, section, "style", &[]);
        let css = dom.create_text("/* {name} */");
        dom.append_child(style, css);
        let context = person();

        let mut binder = TreeBinder::new(dom.clone(), BinderConfig::default());
        binder.bind(&context, root).expect("bind");
        assert_eq!(context.child("main"), Some(section));
        assert_eq!(binder.text_count(), 0);

        assert_eq!(dom.text(css).as_deref(), Some("/* Widgy */"));
        context.set("name", "Changed");
        assert_eq!(dom.text(css).as_deref(), Some("/* Widgy */"));
    }

    #[test]
    fn test_unbind_releases_everything() {
        let dom = Rc::new(MemoryDom::new());
        let root = dom.create_element("template");
        let input = element(&dom, root, "input", &[("value", "@=name"), ("onchange", "bump")]);
        let text = dom.create_text("{name}");
        dom.append_child(root, text);
        let context = person();
        let name = context.cell("name").expect("name");

        let mut binder = TreeBinder::new(dom.clone(), BinderConfig::default());
        binder.bind(&context, root).expect("bind");
        assert!(name.listener_count() >= 2);

        binder.unbind();
        assert_eq!(name.listener_count(), 0);
        assert_eq!(dom.listener_count(input), 0);
        assert_eq!(dom.observer_count(input), 0);

        context.set("name", "After");
        assert_eq!(dom.text(text).as_deref(), Some("Widgy"));
    }
}
