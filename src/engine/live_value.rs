// ========================================
// 観測可能セル（LiveValue）
// ========================================
//
// オブジェクトのプロパティ一つ分の値を保持し、変更を通知する。
// 別のセルを「別名」として参照でき、その場合は参照元の値を常に映す。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::engine::object::PropertyHost;
use crate::engine::observable::{
    CellId, ChangeEvent, Listener, ListenerId, ListenerSet, Observable, PropagationGuard,
};
use crate::engine::value::Value;

/// 書き込み時の型変換
#[derive(Clone, Default)]
pub enum Coercion {
    #[default]
    Identity,
    /// 文字列 "true" だけを true とし、それ以外は真偽判定
    Boolean,
    Number,
    Text,
    Custom(Rc<dyn Fn(Value) -> Value>),
}

impl Coercion {
    pub fn custom(f: impl Fn(Value) -> Value + 'static) -> Self {
        Coercion::Custom(Rc::new(f))
    }

    pub fn apply(&self, value: Value) -> Value {
        match self {
            Coercion::Identity => value,
            Coercion::Boolean => match value {
                Value::Text(s) => Value::Bool(s == "true"),
                other => Value::Bool(other.truthy()),
            },
            Coercion::Number => match value.to_number() {
                Some(n) => Value::Number(n),
                None => Value::Number(f64::NAN),
            },
            Coercion::Text => match value {
                Value::Text(s) => Value::Text(s),
                other => Value::Text(other.to_string()),
            },
            Coercion::Custom(f) => f(value),
        }
    }

    /// derive マクロの `coerce = "..."` 属性名から
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "identity" => Some(Coercion::Identity),
            "bool" | "boolean" => Some(Coercion::Boolean),
            "number" => Some(Coercion::Number),
            "text" | "string" => Some(Coercion::Text),
            _ => None,
        }
    }
}

impl fmt::Debug for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coercion::Identity => f.write_str("Identity"),
            Coercion::Boolean => f.write_str("Boolean"),
            Coercion::Number => f.write_str("Number"),
            Coercion::Text => f.write_str("Text"),
            Coercion::Custom(_) => f.write_str("Custom"),
        }
    }
}

struct AliasSource {
    cell: Rc<dyn Observable>,
    listener: ListenerId,
}

struct LiveValueInner {
    id: CellId,
    name: String,
    owner: String,
    value: RefCell<Value>,
    coercion: Coercion,
    source: RefCell<Option<AliasSource>>,
    changing: Cell<bool>,
    listeners: ListenerSet,
}

/// 観測可能セル
///
/// クローンは同じセルへのハンドルになる。
#[derive(Clone)]
pub struct LiveValue {
    inner: Rc<LiveValueInner>,
}

impl LiveValue {
    pub fn new(value: impl Into<Value>, name: &str, owner: &str) -> Self {
        Self::with_coercion(value, name, owner, Coercion::Identity)
    }

    pub fn with_coercion(value: impl Into<Value>, name: &str, owner: &str, coercion: Coercion) -> Self {
        let value = coercion.apply(value.into());
        Self {
            inner: Rc::new(LiveValueInner {
                id: CellId::next(),
                name: name.to_string(),
                owner: owner.to_string(),
                value: RefCell::new(value),
                coercion,
                source: RefCell::new(None),
                changing: Cell::new(false),
                listeners: ListenerSet::new(),
            }),
        }
    }

    pub fn get(&self) -> Value {
        self.inner.value.borrow().clone()
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn coerce(&self, value: Value) -> Value {
        self.inner.coercion.apply(value)
    }

    pub fn ptr_eq(&self, other: &LiveValue) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// 値を書き込み、必ず一度通知する。通知中の再入書き込みは無視する。
    pub fn set(&self, value: impl Into<Value>) {
        let Some(_guard) = PropagationGuard::enter(&self.inner.changing) else {
            log::trace!("re-entrant write to `{}` ignored", self.inner.name);
            return;
        };
        let new_value = self.inner.coercion.apply(value.into());
        let old_value = self.inner.value.replace(new_value.clone());
        self.dispatch(new_value, old_value);
    }

    /// 別のセルを参照元として設定する。
    /// 以前の参照元の購読は外し、参照元の値を取り込んで通知する。
    pub fn set_source(&self, source: Rc<dyn Observable>) {
        let Some(_guard) = PropagationGuard::enter(&self.inner.changing) else {
            log::trace!("re-entrant alias of `{}` ignored", self.inner.name);
            return;
        };

        self.detach();

        let weak = Rc::downgrade(&self.inner);
        let listener: Listener = Rc::new(move |event: &ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                LiveValue { inner }.on_source_changed(&event.value);
            }
        });
        let listener_id = source.subscribe(listener);
        let source_value = source.value();
        *self.inner.source.borrow_mut() = Some(AliasSource {
            cell: source,
            listener: listener_id,
        });

        let new_value = self.inner.coercion.apply(source_value);
        let old_value = self.inner.value.replace(new_value.clone());
        self.dispatch(new_value, old_value);
    }

    /// 参照元の購読を外す
    pub fn detach(&self) {
        if let Some(alias) = self.inner.source.borrow_mut().take() {
            alias.cell.unsubscribe(alias.listener);
        }
    }

    pub fn alias_source(&self) -> Option<Rc<dyn Observable>> {
        self.inner.source.borrow().as_ref().map(|alias| alias.cell.clone())
    }

    /// 外部（描画済み要素）が正である場合の書き込み。
    /// 型変換と別名処理を経由せず、値が変わったときだけ通知する。
    pub fn override_value(&self, value: impl Into<Value>) {
        let value = value.into();
        let old_value = self.inner.value.replace(value.clone());
        if old_value != value {
            log::trace!("`{}` overridden externally", self.inner.name);
            self.dispatch(value, old_value);
        }
    }

    fn on_source_changed(&self, source_value: &Value) {
        let new_value = self.inner.coercion.apply(source_value.clone());
        let old_value = self.inner.value.replace(new_value.clone());
        if old_value != new_value {
            self.dispatch(new_value, old_value);
        }
    }

    fn dispatch(&self, value: Value, old_value: Value) {
        let event = ChangeEvent::new(self.inner.id, &self.inner.name, value, Some(old_value));
        self.inner.listeners.notify(&event);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl Observable for LiveValue {
    fn id(&self) -> CellId {
        self.inner.id
    }

    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn value(&self) -> Value {
        self.get()
    }

    fn set_value(&self, value: Value) {
        self.set(value);
    }

    fn is_changing(&self) -> bool {
        self.inner.changing.get()
    }

    fn subscribe(&self, listener: Listener) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }
}

impl fmt::Debug for LiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveValue")
            .field("name", &self.inner.name)
            .field("owner", &self.inner.owner)
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}

impl Drop for LiveValueInner {
    fn drop(&mut self) {
        if let Some(alias) = self.source.get_mut().take() {
            alias.cell.unsubscribe(alias.listener);
        }
    }
}

/// セルを持たない生プロパティのラッパー。
/// 読み書きはホストの生の値に直接行い、通知は一切しない。
pub struct DeadValue {
    id: CellId,
    name: String,
    host: Rc<dyn PropertyHost>,
}

impl DeadValue {
    pub fn new(host: &Rc<dyn PropertyHost>, name: &str) -> Self {
        Self {
            id: CellId::next(),
            name: name.to_string(),
            host: host.clone(),
        }
    }
}

impl Observable for DeadValue {
    fn id(&self) -> CellId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn value(&self) -> Value {
        self.host.raw_get(&self.name).unwrap_or_default()
    }

    fn set_value(&self, value: Value) {
        self.host.raw_set(&self.name, value);
    }

    fn is_changing(&self) -> bool {
        false
    }

    fn subscribe(&self, _listener: Listener) -> ListenerId {
        0
    }

    fn unsubscribe(&self, _id: ListenerId) {}

    fn is_live(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(cell: &LiveValue) -> Rc<RefCell<Vec<(Value, Option<Value>)>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        cell.add_listener(Rc::new(move |e: &ChangeEvent| {
            log.borrow_mut().push((e.value.clone(), e.old_value.clone()));
        }));
        seen
    }

    #[test]
    fn test_add_listener_fires_immediately() {
        let cell = LiveValue::new(7, "count", "Test");
        let seen = recorder(&cell);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0], (Value::from(7), None));
    }

    #[test]
    fn test_set_notifies_once_with_old_value() {
        let cell = LiveValue::new(1, "count", "Test");
        let seen = recorder(&cell);
        cell.set(2);
        assert_eq!(cell.get(), Value::from(2));
        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(seen.borrow()[1], (Value::from(2), Some(Value::from(1))));
    }

    #[test]
    fn test_boolean_coercion() {
        let cell = LiveValue::with_coercion(false, "hidden", "Test", Coercion::Boolean);
        cell.set("true");
        assert_eq!(cell.get(), Value::Bool(true));
        cell.set("yes");
        assert_eq!(cell.get(), Value::Bool(false));
        cell.set(1);
        assert_eq!(cell.get(), Value::Bool(true));
    }

    #[test]
    fn test_reentrant_write_is_ignored() {
        let cell = LiveValue::new(0, "count", "Test");
        let notifications = Rc::new(Cell::new(0));
        let inner_cell = cell.clone();
        let counter = notifications.clone();
        cell.subscribe(Rc::new(move |_: &ChangeEvent| {
            counter.set(counter.get() + 1);
            inner_cell.set(99);
        }));

        cell.set(1);
        assert_eq!(notifications.get(), 1);
        assert_eq!(cell.get(), Value::from(1));
        assert!(!cell.is_changing());
    }

    #[test]
    fn test_alias_follows_source() {
        let source = LiveValue::new("a", "title", "Source");
        let alias = LiveValue::new(Value::Null, "label", "Alias");
        alias.set_source(Rc::new(source.clone()));
        assert_eq!(alias.get(), Value::from("a"));

        source.set("b");
        assert_eq!(alias.get(), Value::from("b"));

        // 直接の書き込みは参照関係を自動では外さない
        alias.set("local");
        assert_eq!(alias.get(), Value::from("local"));
        source.set("c");
        assert_eq!(alias.get(), Value::from("c"));

        alias.detach();
        source.set("d");
        assert_eq!(alias.get(), Value::from("c"));
        assert_eq!(source.listener_count(), 0);
    }

    #[test]
    fn test_realias_detaches_previous_source() {
        let first = LiveValue::new(1, "a", "Source");
        let second = LiveValue::new(2, "b", "Source");
        let alias = LiveValue::new(0, "v", "Alias");
        alias.set_source(Rc::new(first.clone()));
        alias.set_source(Rc::new(second.clone()));
        assert_eq!(first.listener_count(), 0);
        assert_eq!(second.listener_count(), 1);
        first.set(10);
        assert_eq!(alias.get(), Value::from(2));
    }

    #[test]
    fn test_override_only_notifies_on_change() {
        let cell = LiveValue::new("x", "value", "Input");
        let seen = recorder(&cell);
        cell.override_value("x");
        assert_eq!(seen.borrow().len(), 1);
        cell.override_value("y");
        assert_eq!(seen.borrow().len(), 2);
    }
}
