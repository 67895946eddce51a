// ========================================
// 観測可能オブジェクト（LiveObject）
// ========================================
//
// 宣言されたプロパティごとにセルを持つオブジェクト。
// プロパティ表は記述子の列から構築時に組み立てる。

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::dom::{DomEvent, EventHandler, NodeId};
use crate::engine::derived::DerivedValue;
use crate::engine::error::BindError;
use crate::engine::live_list::{ElementModel, LiveList};
use crate::engine::live_value::{Coercion, LiveValue};
use crate::engine::observable::{ChangeEvent, ListenerId, Observable};
use crate::engine::text::{TemplatePart, parse_template};
use crate::engine::value::Value;

/// パス探索が辿る対象の能力
///
/// LiveObject / LiveList / 要素ホストが実装する。
pub trait PropertyHost {
    fn type_name(&self) -> String;

    fn has_property(&self, name: &str) -> bool;

    /// プロパティに対応するセル。生のプロパティなら None
    fn live_cell(&self, name: &str) -> Option<Rc<dyn Observable>>;

    fn raw_get(&self, name: &str) -> Option<Value>;

    /// 書き込めたら true
    fn raw_set(&self, name: &str, value: Value) -> bool;

    /// メソッドをイベントハンドラとして取り出す
    fn handler(&self, _name: &str) -> Option<EventHandler> {
        None
    }
}

/// メソッド。呼び出し元のオブジェクトとイベントを受け取る
pub type Method = Rc<dyn Fn(&LiveObject, &DomEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropertyKind {
    /// セルを持つ観測可能なプロパティ
    #[default]
    Live,
    /// セルを持たない生のプロパティ
    Raw,
}

/// プロパティ宣言
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub initial: Value,
    pub coercion: Coercion,
    pub kind: PropertyKind,
}

impl PropertyDescriptor {
    pub fn live(name: &str, initial: impl Into<Value>) -> Self {
        Self {
            name: name.to_string(),
            initial: initial.into(),
            coercion: Coercion::Identity,
            kind: PropertyKind::Live,
        }
    }

    pub fn raw(name: &str, initial: impl Into<Value>) -> Self {
        Self {
            kind: PropertyKind::Raw,
            ..Self::live(name, initial)
        }
    }

    pub fn with_coercion(mut self, coercion: Coercion) -> Self {
        self.coercion = coercion;
        self
    }
}

/// 静的なプロパティ宣言を持つモデル型
///
/// 通常は `#[derive(LiveModel)]` で実装する。
pub trait ModelSchema {
    fn type_name() -> &'static str;

    fn into_descriptors(self) -> Vec<PropertyDescriptor>;
}

#[derive(Clone)]
enum Slot {
    Live(LiveValue),
    Derived(DerivedValue),
    Raw(Value),
}

impl Slot {
    fn value(&self) -> Value {
        match self {
            Slot::Live(cell) => cell.get(),
            Slot::Derived(derived) => derived.get(),
            Slot::Raw(value) => value.clone(),
        }
    }
}

struct ObjectInner {
    type_name: String,
    slots: RefCell<IndexMap<String, Slot>>,
    methods: RefCell<HashMap<String, Method>>,
    children: RefCell<HashMap<String, NodeId>>,
    event_slots: RefCell<HashMap<String, Vec<EventHandler>>>,
}

/// 観測可能オブジェクト
///
/// クローンは同じオブジェクトへのハンドル。比較は同一性で行う。
#[derive(Clone)]
pub struct LiveObject {
    inner: Rc<ObjectInner>,
}

impl LiveObject {
    pub fn new(type_name: &str) -> Self {
        Self {
            inner: Rc::new(ObjectInner {
                type_name: type_name.to_string(),
                slots: RefCell::new(IndexMap::new()),
                methods: RefCell::new(HashMap::new()),
                children: RefCell::new(HashMap::new()),
                event_slots: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn from_descriptors(type_name: &str, descriptors: Vec<PropertyDescriptor>) -> Self {
        let object = Self::new(type_name);
        for descriptor in descriptors {
            object.declare(descriptor);
        }
        object
    }

    pub fn from_model<M: ModelSchema>(model: M) -> Self {
        Self::from_descriptors(M::type_name(), model.into_descriptors())
    }

    /// 名前だけを並べた簡易モデル。初期値は全て Null
    pub fn with_properties(type_name: &str, names: &[&str]) -> Self {
        Self::from_descriptors(
            type_name,
            names.iter().map(|name| PropertyDescriptor::live(name, Value::Null)).collect(),
        )
    }

    /// JSON オブジェクトのキーをそのまま観測可能プロパティにする
    pub fn from_json_map(map: &serde_json::Map<String, serde_json::Value>) -> Self {
        let object = Self::new("Object");
        for (key, value) in map {
            object.add_property(key, Value::from_json(value));
        }
        object
    }

    pub fn type_name(&self) -> String {
        self.inner.type_name.clone()
    }

    pub fn ptr_eq(&self, other: &LiveObject) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ========================================
    // プロパティ宣言
    // ========================================

    fn declare(&self, descriptor: PropertyDescriptor) {
        match descriptor.kind {
            PropertyKind::Live => {
                self.add_property_with(&descriptor.name, descriptor.initial, descriptor.coercion);
            }
            PropertyKind::Raw => self.add_raw(&descriptor.name, descriptor.initial),
        }
    }

    pub fn add_property(&self, name: &str, initial: impl Into<Value>) -> LiveValue {
        self.add_property_with(name, initial, Coercion::Identity)
    }

    /// 観測可能プロパティを宣言する。再宣言すると古いセルは切り離される
    pub fn add_property_with(&self, name: &str, initial: impl Into<Value>, coercion: Coercion) -> LiveValue {
        let cell = LiveValue::with_coercion(initial, name, &self.inner.type_name, coercion);
        self.replace_slot(name, Slot::Live(cell.clone()));
        cell
    }

    /// 自身の観測可能プロパティから計算される派生プロパティ
    pub fn add_derived(
        &self,
        name: &str,
        watch: &[&str],
        compute: impl Fn(&[Value]) -> Value + 'static,
    ) -> Result<DerivedValue, BindError> {
        let cells = watch
            .iter()
            .map(|watched| {
                self.property(watched).ok_or_else(|| {
                    BindError::resolution(&self.inner.type_name, watched, watched, Some(name.to_string()))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let derived = DerivedValue::new(name, cells, compute);
        self.add_derived_value(name, derived.clone());
        Ok(derived)
    }

    pub fn add_derived_value(&self, name: &str, derived: DerivedValue) {
        self.replace_slot(name, Slot::Derived(derived));
    }

    pub fn add_raw(&self, name: &str, value: impl Into<Value>) {
        self.replace_slot(name, Slot::Raw(value.into()));
    }

    fn replace_slot(&self, name: &str, slot: Slot) {
        let previous = self.inner.slots.borrow_mut().insert(name.to_string(), slot);
        match previous {
            Some(Slot::Live(old)) => old.detach(),
            Some(Slot::Derived(old)) => old.destroy(),
            _ => {}
        }
    }

    pub fn add_method(&self, name: &str, method: impl Fn(&LiveObject, &DomEvent) + 'static) {
        self.inner
            .methods
            .borrow_mut()
            .insert(name.to_string(), Rc::new(method));
    }

    /// プロパティの変更を購読する
    pub fn on_change(&self, name: &str, listener: impl Fn(&ChangeEvent) + 'static) -> Option<ListenerId> {
        self.property(name).map(|cell| cell.subscribe(Rc::new(listener)))
    }

    // ========================================
    // 読み書き
    // ========================================

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.slots.borrow().get(name).map(Slot::value)
    }

    /// プロパティへの書き込み。セルがあればセル経由で通知する
    pub fn set(&self, name: &str, value: impl Into<Value>) -> bool {
        let slot = self.inner.slots.borrow().get(name).cloned();
        match slot {
            Some(Slot::Live(cell)) => {
                cell.set(value);
                true
            }
            Some(Slot::Derived(_)) => {
                log::trace!("write to derived property `{}` ignored", name);
                false
            }
            Some(Slot::Raw(_)) => {
                if let Some(slot) = self.inner.slots.borrow_mut().get_mut(name) {
                    *slot = Slot::Raw(value.into());
                }
                true
            }
            None => false,
        }
    }

    /// 観測可能プロパティのセル
    pub fn cell(&self, name: &str) -> Option<LiveValue> {
        match self.inner.slots.borrow().get(name) {
            Some(Slot::Live(cell)) => Some(cell.clone()),
            _ => None,
        }
    }

    /// 観測可能プロパティ（派生を含む）
    pub fn property(&self, name: &str) -> Option<Rc<dyn Observable>> {
        match self.inner.slots.borrow().get(name) {
            Some(Slot::Live(cell)) => Some(Rc::new(cell.clone())),
            Some(Slot::Derived(derived)) => Some(Rc::new(derived.clone())),
            _ => None,
        }
    }

    /// 宣言順のプロパティ名
    pub fn property_names(&self) -> Vec<String> {
        self.inner.slots.borrow().keys().cloned().collect()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.inner.methods.borrow().contains_key(name)
    }

    // ========================================
    // 一回きりのパス参照
    // ========================================

    /// 見つからなかった場合はそこまで辿った部分を含む `#ERR-noprop-` 文字列を返す
    fn walk(&self, path: &str) -> Result<Value, String> {
        let mut navigated = String::new();
        let mut host: Option<Rc<dyn PropertyHost>> = Some(Rc::new(self.clone()));
        let mut value = Value::Object(self.clone());

        for part in path.split('.').map(str::trim) {
            match host.take().filter(|h| h.has_property(part)) {
                Some(h) => {
                    value = h.raw_get(part).unwrap_or_default();
                    navigated.push_str(part);
                    navigated.push('.');
                    host = value.as_host();
                }
                None => return Err(format!("#ERR-noprop-{}{}", navigated, part)),
            }
        }
        Ok(value)
    }

    pub fn property_value(&self, path: &str) -> Option<Value> {
        self.walk(path).ok()
    }

    pub fn property_string(&self, path: &str) -> String {
        match self.walk(path) {
            Ok(value) => value.to_string(),
            Err(marker) => marker,
        }
    }

    /// `{path}` を現在値で置き換えた文字列（購読はしない）
    pub fn interpolate(&self, text: &str) -> String {
        parse_template(text)
            .iter()
            .map(|part| match part {
                TemplatePart::Literal(literal) => literal.clone(),
                TemplatePart::Placeholder(path) => self.property_string(path),
            })
            .collect()
    }

    /// `a.b.method` 形式の参照をハンドラに解決する
    pub fn resolve_handler(&self, path: &str) -> Result<EventHandler, BindError> {
        let mut parts: Vec<&str> = path.split('.').map(str::trim).collect();
        let method = parts.pop().unwrap_or_default();
        let mut host: Rc<dyn PropertyHost> = Rc::new(self.clone());

        for part in parts {
            let next = host
                .raw_get(part)
                .filter(|_| host.has_property(part))
                .and_then(|value| value.as_host());
            host = next.ok_or_else(|| BindError::handler(&self.inner.type_name, path))?;
        }

        host.handler(method)
            .ok_or_else(|| BindError::handler(&self.inner.type_name, path))
    }

    // ========================================
    // 子要素とイベントスロット
    // ========================================

    /// `key` 属性付きの要素を登録する
    pub fn set_child(&self, key: &str, node: NodeId) {
        self.inner.children.borrow_mut().insert(key.to_string(), node);
    }

    pub fn child(&self, key: &str) -> Option<NodeId> {
        self.inner.children.borrow().get(key).copied()
    }

    pub fn children(&self) -> HashMap<String, NodeId> {
        self.inner.children.borrow().clone()
    }

    pub fn add_event_slot(&self, name: &str) {
        self.inner
            .event_slots
            .borrow_mut()
            .entry(name.to_lowercase())
            .or_default();
    }

    pub fn has_event_slot(&self, name: &str) -> bool {
        self.inner.event_slots.borrow().contains_key(&name.to_lowercase())
    }

    /// スロットが無ければ false
    pub fn bind_event(&self, name: &str, handler: EventHandler) -> bool {
        match self.inner.event_slots.borrow_mut().get_mut(&name.to_lowercase()) {
            Some(handlers) => {
                handlers.push(handler);
                true
            }
            None => {
                log::warn!("{} has no event slot `{}`", self.inner.type_name, name);
                false
            }
        }
    }

    /// context 上のメソッドパスをスロットに結びつける
    pub fn bind_event_path(&self, name: &str, context: &LiveObject, path: &str) -> Result<bool, BindError> {
        let handler = context.resolve_handler(path)?;
        Ok(self.bind_event(name, handler))
    }

    pub fn trigger_event(&self, name: &str, data: impl Into<Value>) {
        let key = name.to_lowercase();
        let handlers = self
            .inner
            .event_slots
            .borrow()
            .get(&key)
            .cloned()
            .unwrap_or_default();
        let event = DomEvent::slotted(&key, data);
        for handler in handlers {
            handler(&event);
        }
    }

    // ========================================
    // 読み込み・書き出し
    // ========================================

    /// 別のオブジェクトから同名プロパティを取り込む。
    /// リストは空にしてから詰め直す（通知は一回）。
    pub fn load_from(&self, template: &LiveObject) {
        for name in self.property_names() {
            let Some(incoming) = template.get(&name) else {
                continue;
            };
            self.load_property(&name, incoming);
        }
    }

    pub fn load_json(&self, json: &serde_json::Value) {
        let Some(map) = json.as_object() else {
            log::warn!("load_json expects an object, got {}", json);
            return;
        };
        for name in self.property_names() {
            if let Some(incoming) = map.get(&name) {
                self.load_property(&name, Value::from_json(incoming));
            }
        }
    }

    fn load_property(&self, name: &str, incoming: Value) {
        match (self.get(name), incoming) {
            (Some(Value::List(list)), Value::List(source)) => {
                list.splice(0, list.len(), source.values());
            }
            (_, incoming) => {
                self.set(name, incoming);
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let slots = self.inner.slots.borrow().clone();
        let map = slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.value().to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    /// 全てのセルの別名購読と派生セルの購読を外す
    pub fn destroy(&self) {
        let slots: Vec<Slot> = self.inner.slots.borrow().values().cloned().collect();
        for slot in slots {
            match slot {
                Slot::Live(cell) => cell.detach(),
                Slot::Derived(derived) => derived.destroy(),
                Slot::Raw(_) => {}
            }
        }
        self.inner.event_slots.borrow_mut().clear();
    }
}

impl PropertyHost for LiveObject {
    fn type_name(&self) -> String {
        self.inner.type_name.clone()
    }

    fn has_property(&self, name: &str) -> bool {
        self.inner.slots.borrow().contains_key(name) || self.has_method(name)
    }

    fn live_cell(&self, name: &str) -> Option<Rc<dyn Observable>> {
        self.property(name)
    }

    fn raw_get(&self, name: &str) -> Option<Value> {
        self.get(name)
    }

    fn raw_set(&self, name: &str, value: Value) -> bool {
        self.set(name, value)
    }

    fn handler(&self, name: &str) -> Option<EventHandler> {
        let method = self.inner.methods.borrow().get(name).cloned()?;
        let object = self.clone();
        Some(Rc::new(move |event: &DomEvent| method(&object, event)))
    }
}

impl fmt::Debug for LiveObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(&self.inner.type_name);
        for (name, slot) in self.inner.slots.borrow().iter() {
            s.field(name, &slot.value());
        }
        s.finish()
    }
}

impl ElementModel {
    /// 挿入された生の値からモデルを作り、同名プロパティを取り込む
    pub fn from_schema<M: ModelSchema + Default + 'static>() -> Self {
        ElementModel::new(M::type_name(), |raw| {
            let object = LiveObject::from_model(M::default());
            match &raw {
                Value::Object(source) => object.load_from(source),
                _ => log::debug!("{} built from non-object {:?}", M::type_name(), raw),
            }
            Value::Object(object)
        })
    }
}

impl LiveList {
    /// モデル付きリストを JSON 配列から作る
    pub fn from_json_with_model(json: &serde_json::Value, model: ElementModel) -> Self {
        let items = json
            .as_array()
            .map(|items| items.iter().map(Value::from_json).collect::<Vec<_>>())
            .unwrap_or_default();
        LiveList::from_values_with_model(items, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn person() -> LiveObject {
        let object = LiveObject::from_descriptors(
            "Person",
            vec![
                PropertyDescriptor::live("name", "Widgy"),
                PropertyDescriptor::live("active", "true").with_coercion(Coercion::Boolean),
                PropertyDescriptor::raw("note", "plain"),
            ],
        );
        object.add_method("greet", |this, _event| {
            this.set("name", "greeted");
        });
        object
    }

    #[test]
    fn test_descriptors() {
        let p = person();
        assert_eq!(p.property_names(), vec!["name", "active", "note"]);
        assert_eq!(p.get("active"), Some(Value::Bool(true)));
        assert!(p.cell("name").is_some());
        assert!(p.cell("note").is_none());
        assert!(p.live_cell("note").is_none());
        assert!(p.has_property("greet"));
    }

    #[test]
    fn test_redeclare_detaches_old_cell() {
        let source = LiveValue::new(1, "source", "Test");
        let p = person();
        let old = p.add_property("count", 0);
        old.set_source(Rc::new(source.clone()));
        assert_eq!(source.listener_count(), 1);

        let fresh = p.add_property("count", 5);
        assert_eq!(source.listener_count(), 0);
        assert!(!fresh.ptr_eq(&old));
        assert_eq!(p.get("count"), Some(Value::from(5)));
    }

    #[test]
    fn test_derived_property() {
        let p = LiveObject::new("Rect");
        p.add_property("w", 2);
        p.add_property("h", 3);
        p.add_derived("area", &["w", "h"], |v| {
            Value::from(v[0].to_number().unwrap_or(0.0) * v[1].to_number().unwrap_or(0.0))
        })
        .expect("derived");
        assert_eq!(p.get("area"), Some(Value::from(6)));
        p.set("w", 10);
        assert_eq!(p.get("area"), Some(Value::from(30)));
        assert!(!p.set("area", 1));

        let err = p.add_derived("bad", &["depth"], |v| v[0].clone());
        assert!(matches!(err, Err(BindError::Resolution { .. })));
    }

    #[test]
    fn test_property_string_and_interpolate() {
        let inner = LiveObject::new("Inner");
        inner.add_property("c", 7);
        let p = person();
        p.add_property("child", inner);

        assert_eq!(p.property_string("child.c"), "7");
        assert_eq!(p.property_string("child.d"), "#ERR-noprop-child.d");
        assert_eq!(p.property_value("name"), Some(Value::from("Widgy")));
        assert_eq!(
            p.interpolate("Hi {name}, c={child.c} \\{literal\\}"),
            "Hi Widgy, c=7 {literal}"
        );
    }

    #[test]
    fn test_resolve_handler() {
        let p = person();
        let inner = person();
        p.add_property("friend", inner.clone());

        let handler = p.resolve_handler("friend.greet").expect("handler");
        handler(&DomEvent::slotted("click", Value::Null));
        assert_eq!(inner.get("name"), Some(Value::from("greeted")));
        assert_eq!(p.get("name"), Some(Value::from("Widgy")));

        assert!(matches!(p.resolve_handler("missing"), Err(BindError::Handler { .. })));
        assert!(matches!(p.resolve_handler("nobody.greet"), Err(BindError::Handler { .. })));
        assert!(matches!(p.resolve_handler("name"), Err(BindError::Handler { .. })));
    }

    #[test]
    fn test_event_slots() {
        let p = person();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        assert!(!p.bind_event("Saved", Rc::new(|_: &DomEvent| {})));

        p.add_event_slot("Saved");
        assert!(p.has_event_slot("saved"));
        assert!(p.bind_event("saved", Rc::new(move |e: &DomEvent| {
            assert_eq!(e.detail, Value::from(42));
            h.set(h.get() + 1);
        })));
        p.trigger_event("SAVED", 42);
        assert_eq!(hits.get(), 1);

        let listener = person();
        assert!(p.bind_event_path("saved", &listener, "greet").expect("bind"));
        p.trigger_event("saved", 42);
        assert_eq!(listener.get("name"), Some(Value::from("greeted")));
    }

    #[test]
    fn test_load_json_refills_lists_once() {
        let p = LiveObject::new("Todo");
        let tags = LiveList::from_values([Value::from("old")]);
        p.add_property("title", "");
        p.add_property("tags", tags.clone());
        let notifications = Rc::new(Cell::new(0));
        let n = notifications.clone();
        tags.subscribe(Rc::new(move |_: &ChangeEvent| n.set(n.get() + 1)));

        p.load_json(&serde_json::json!({"title": "Write", "tags": ["a", "b"], "extra": 1}));

        assert_eq!(p.get("title"), Some(Value::from("Write")));
        assert_eq!(tags.join(","), "a,b");
        assert_eq!(notifications.get(), 1);
        assert!(p.get("extra").is_none());
        assert_eq!(p.to_json(), serde_json::json!({"title": "Write", "tags": ["a", "b"]}));
    }

    #[derive(Default)]
    struct Tag {
        label: String,
    }

    impl ModelSchema for Tag {
        fn type_name() -> &'static str {
            "Tag"
        }

        fn into_descriptors(self) -> Vec<PropertyDescriptor> {
            vec![PropertyDescriptor::live("label", self.label)]
        }
    }

    #[test]
    fn test_element_model_from_schema() {
        let list = LiveList::from_json_with_model(
            &serde_json::json!([{"label": "x"}, {"label": "y", "ignored": true}]),
            ElementModel::from_schema::<Tag>(),
        );
        let labels = list.map(|v| v.as_object().map(|o| o.property_string("label")).unwrap_or_default());
        assert_eq!(labels, vec!["x", "y"]);
        assert_eq!(list.get(0).map(|v| v.type_name()), Some("Tag".to_string()));
    }
}
