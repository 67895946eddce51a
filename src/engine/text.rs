// ========================================
// テキスト補間
// ========================================
//
// `Hello {user.name}` のようなテンプレートを、リテラルとプレースホルダーに分けて
// 一度だけ解析する。`\` は直後の一文字をリテラルにする。

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::dom::{DomProvider, NodeId};
use crate::engine::binding::BindingExpression;
use crate::engine::error::BindError;
use crate::engine::object::PropertyHost;
use crate::engine::observable::{
    CellId, ChangeEvent, Listener, ListenerId, ListenerSet, Observable,
};
use crate::engine::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    Literal(String),
    /// `{...}` の中身（前後の空白は除去済み）
    Placeholder(String),
}

/// テンプレートを分解する
///
/// 閉じていない `{` はそのままリテラルとして残す。
/// プレースホルダー内ではエスケープを解釈しない。
pub fn parse_template(template: &str) -> Vec<TemplatePart> {
    scan_template(template).0
}

/// 閉じていない `{` が残っているか
pub fn has_unterminated_placeholder(template: &str) -> bool {
    scan_template(template).1
}

fn scan_template(template: &str) -> (Vec<TemplatePart>, bool) {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut capture: Option<String> = None;
    let mut escaped = false;

    for chr in template.chars() {
        if let Some(path) = capture.as_mut() {
            if chr == '}' {
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(TemplatePart::Placeholder(path.trim().to_string()));
                capture = None;
            } else {
                path.push(chr);
            }
        } else if escaped {
            literal.push(chr);
            escaped = false;
        } else if chr == '\\' {
            escaped = true;
        } else if chr == '{' {
            capture = Some(String::new());
        } else {
            literal.push(chr);
        }
    }

    if escaped {
        literal.push('\\');
    }
    let unterminated = capture.is_some();
    if let Some(rest) = capture {
        literal.push('{');
        literal.push_str(&rest);
    }
    if !literal.is_empty() {
        parts.push(TemplatePart::Literal(literal));
    }
    (parts, unterminated)
}

/// エスケープされていない `{` を含むか
pub fn has_live_text(text: &str) -> bool {
    let mut escaped = false;
    for chr in text.chars() {
        if escaped {
            escaped = false;
        } else if chr == '\\' {
            escaped = true;
        } else if chr == '{' {
            return true;
        }
    }
    false
}

struct LiveTextInner {
    id: CellId,
    template: String,
    parts: Vec<TemplatePart>,
    bindings: Vec<BindingExpression>,
    value: RefCell<String>,
    listeners: ListenerSet,
}

/// 補間結果を観測可能な文字列として持つ
#[derive(Clone)]
pub struct LiveText {
    inner: Rc<LiveTextInner>,
}

impl LiveText {
    /// プレースホルダーごとに読み取り専用のバインディングを作る
    pub fn new(template: &str, context: Rc<dyn PropertyHost>) -> Result<Self, BindError> {
        let parts = parse_template(template);
        let bindings = parts
            .iter()
            .filter_map(|part| match part {
                TemplatePart::Placeholder(path) => Some(path),
                TemplatePart::Literal(_) => None,
            })
            .map(|path| BindingExpression::new(path, context.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let text = Self {
            inner: Rc::new(LiveTextInner {
                id: CellId::next(),
                template: template.to_string(),
                parts,
                bindings,
                value: RefCell::new(String::new()),
                listeners: ListenerSet::new(),
            }),
        };
        *text.inner.value.borrow_mut() = text.render();

        for binding in &text.inner.bindings {
            let weak = Rc::downgrade(&text.inner);
            binding.subscribe(Rc::new(move |_event: &ChangeEvent| {
                if let Some(inner) = weak.upgrade() {
                    LiveText { inner }.on_binding_changed();
                }
            }));
        }
        Ok(text)
    }

    pub fn template(&self) -> &str {
        &self.inner.template
    }

    pub fn get(&self) -> String {
        self.inner.value.borrow().clone()
    }

    pub fn bindings(&self) -> &[BindingExpression] {
        &self.inner.bindings
    }

    fn render(&self) -> String {
        let mut bindings = self.inner.bindings.iter();
        let mut out = String::new();
        for part in &self.inner.parts {
            match part {
                TemplatePart::Literal(literal) => out.push_str(literal),
                TemplatePart::Placeholder(_) => {
                    if let Some(binding) = bindings.next() {
                        out.push_str(&binding.get().to_string());
                    }
                }
            }
        }
        out
    }

    fn on_binding_changed(&self) {
        let rendered = self.render();
        if *self.inner.value.borrow() == rendered {
            return;
        }
        let old_value = self.inner.value.replace(rendered.clone());
        let event = ChangeEvent::new(
            self.inner.id,
            &self.inner.template,
            Value::Text(rendered),
            Some(Value::Text(old_value)),
        );
        self.inner.listeners.notify(&event);
    }

    /// 構成バインディングを全て破棄する
    pub fn destroy(&self) {
        for binding in &self.inner.bindings {
            binding.destroy();
        }
    }
}

impl Observable for LiveText {
    fn id(&self) -> CellId {
        self.inner.id
    }

    fn name(&self) -> String {
        self.inner.template.clone()
    }

    fn value(&self) -> Value {
        Value::Text(self.get())
    }

    fn set_value(&self, _value: Value) {
        log::trace!("write to interpolated text ignored");
    }

    fn is_changing(&self) -> bool {
        false
    }

    fn subscribe(&self, listener: Listener) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }
}

impl fmt::Debug for LiveText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveText")
            .field("template", &self.inner.template)
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}

/// テキストノードの内容を補間結果で描き直し続ける
pub struct TextNodeBinding {
    node: NodeId,
    text: LiveText,
    listener: ListenerId,
}

impl TextNodeBinding {
    pub fn new(dom: Rc<dyn DomProvider>, node: NodeId, context: Rc<dyn PropertyHost>) -> Result<Self, BindError> {
        let template = dom.text(node).unwrap_or_default();
        let text = LiveText::new(&template, context)?;
        let listener = text.add_listener(Rc::new(move |event: &ChangeEvent| {
            dom.set_text(node, &event.value.to_string());
        }));
        Ok(Self { node, text, listener })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn text(&self) -> &LiveText {
        &self.text
    }

    pub fn destroy(&self) {
        self.text.unsubscribe(self.listener);
        self.text.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::MemoryDom;
    use crate::engine::object::LiveObject;

    fn widgy() -> LiveObject {
        let object = LiveObject::new("Widget");
        object.add_property("name", "Widgy");
        object.add_property("count", 3);
        object
    }

    #[test]
    fn test_parse_template() {
        assert_eq!(
            parse_template("a {x.y} b"),
            vec![
                TemplatePart::Literal("a ".to_string()),
                TemplatePart::Placeholder("x.y".to_string()),
                TemplatePart::Literal(" b".to_string()),
            ]
        );
        assert_eq!(
            parse_template("\\{x\\}"),
            vec![TemplatePart::Literal("{x}".to_string())]
        );
        assert_eq!(
            parse_template("open {x"),
            vec![TemplatePart::Literal("open {x".to_string())]
        );
        assert_eq!(
            parse_template("end\\"),
            vec![TemplatePart::Literal("end\\".to_string())]
        );
    }

    #[test]
    fn test_has_live_text() {
        assert!(has_live_text("Hi {name}"));
        assert!(!has_live_text("Hi \\{name}"));
        assert!(!has_live_text("plain"));
        assert!(has_unterminated_placeholder("Hi {name"));
        assert!(!has_unterminated_placeholder("Hi {name} \\{x"));
    }

    #[test]
    fn test_escaped_brace_around_placeholder() {
        let object = widgy();
        let text = LiveText::new(
            "Hello \\{{name}\\}, you have {count} items",
            Rc::new(object.clone()),
        )
        .expect("template");
        assert_eq!(text.get(), "Hello {Widgy}, you have 3 items");

        let escaped = LiveText::new("Hello \\{name\\}, you have {count} items", Rc::new(object.clone()))
            .expect("template");
        assert_eq!(escaped.get(), "Hello {name}, you have 3 items");

        object.set("count", 4);
        assert_eq!(escaped.get(), "Hello {name}, you have 4 items");
    }

    #[test]
    fn test_notifies_only_on_change() {
        let object = widgy();
        let text = LiveText::new("{name}!", Rc::new(object.clone())).expect("template");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        text.subscribe(Rc::new(move |e: &ChangeEvent| s.borrow_mut().push(e.value.to_string())));

        object.set("count", 10);
        object.set("name", "Gadget");
        object.set("name", "Gadget");
        assert_eq!(*seen.borrow(), vec!["Gadget!".to_string()]);
    }

    #[test]
    fn test_missing_placeholder_fails() {
        let object = widgy();
        let err = LiveText::new("{nope}", Rc::new(object)).expect_err("missing");
        assert!(matches!(err, BindError::Resolution { .. }));
    }

    #[test]
    fn test_text_node_rerenders() {
        let dom = Rc::new(MemoryDom::new());
        let node = dom.create_text("{count} left");
        let object = widgy();
        let binding = TextNodeBinding::new(dom.clone(), node, Rc::new(object.clone())).expect("bind");
        assert_eq!(dom.text(node).as_deref(), Some("3 left"));

        object.set("count", 2);
        assert_eq!(dom.text(node).as_deref(), Some("2 left"));

        binding.destroy();
        object.set("count", 1);
        assert_eq!(dom.text(node).as_deref(), Some("2 left"));
    }
}
