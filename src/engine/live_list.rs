// ========================================
// 観測可能コレクション（LiveList）
// ========================================
//
// 要素一つ一つを LiveValue で包んだ順序付き列。
// 構造変更は何要素に触れても一回だけ通知する。

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::engine::live_value::{Coercion, LiveValue};
use crate::engine::object::PropertyHost;
use crate::engine::observable::{
    CellId, ChangeEvent, Listener, ListenerId, ListenerSet, Observable,
};
use crate::engine::value::Value;

/// 生の要素を挿入時にモデルへ変換するコンストラクタ
#[derive(Clone)]
pub struct ElementModel {
    type_name: String,
    build: Rc<dyn Fn(Value) -> Value>,
}

impl ElementModel {
    pub fn new(type_name: &str, build: impl Fn(Value) -> Value + 'static) -> Self {
        Self {
            type_name: type_name.to_string(),
            build: Rc::new(build),
        }
    }

    /// 既に同じモデル型のオブジェクトならそのまま
    pub fn apply(&self, value: Value) -> Value {
        match &value {
            Value::Object(obj) if obj.type_name() == self.type_name => value,
            _ => (self.build)(value),
        }
    }
}

impl fmt::Debug for ElementModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementModel").field("type_name", &self.type_name).finish()
    }
}

struct ListInner {
    id: CellId,
    items: RefCell<Vec<LiveValue>>,
    length: LiveValue,
    model: Option<ElementModel>,
    listeners: ListenerSet,
    item_listeners: RefCell<HashMap<CellId, ListenerId>>,
}

/// 観測可能コレクション
#[derive(Clone)]
pub struct LiveList {
    inner: Rc<ListInner>,
}

impl Default for LiveList {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveList {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_model(model: ElementModel) -> Self {
        Self::build(Some(model))
    }

    fn build(model: Option<ElementModel>) -> Self {
        Self {
            inner: Rc::new(ListInner {
                id: CellId::next(),
                items: RefCell::new(Vec::new()),
                length: LiveValue::with_coercion(0, "length", "LiveList", Coercion::Number),
                model,
                listeners: ListenerSet::new(),
                item_listeners: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let list = Self::new();
        list.fill(values);
        list
    }

    pub fn from_values_with_model(values: impl IntoIterator<Item = Value>, model: ElementModel) -> Self {
        let list = Self::with_model(model);
        list.fill(values);
        list
    }

    // 構築時の充填は購読者がいないので通知しても無害
    fn fill(&self, values: impl IntoIterator<Item = Value>) {
        let cells: Vec<LiveValue> = values.into_iter().map(|v| self.wrap(v)).collect();
        if cells.is_empty() {
            return;
        }
        self.inner.items.borrow_mut().extend(cells.iter().cloned());
        self.commit(&cells, &[]);
    }

    pub fn ptr_eq(&self, other: &LiveList) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn model(&self) -> Option<&ElementModel> {
        self.inner.model.as_ref()
    }

    fn wrap(&self, value: Value) -> LiveValue {
        let value = match &self.inner.model {
            Some(model) => model.apply(value),
            None => value,
        };
        LiveValue::new(value, "item", "LiveList")
    }

    fn attach(&self, cell: &LiveValue) {
        let weak = Rc::downgrade(&self.inner);
        let id = cell.subscribe(Rc::new(move |_event: &ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                LiveList { inner }.dispatch_changed();
            }
        }));
        self.inner.item_listeners.borrow_mut().insert(cell.id(), id);
    }

    fn detach(&self, cell: &LiveValue) {
        let removed = self.inner.item_listeners.borrow_mut().remove(&cell.id());
        if let Some(id) = removed {
            cell.unsubscribe(id);
        }
    }

    /// 長さセルの更新 → 購読の付け外し → 構造変更通知を一回
    fn commit(&self, inserted: &[LiveValue], removed: &[LiveValue]) {
        let len = self.len();
        self.inner.length.set(len);
        for cell in removed {
            self.detach(cell);
        }
        for cell in inserted {
            self.attach(cell);
        }
        self.dispatch_changed();
    }

    fn dispatch_changed(&self) {
        let value = Value::List(self.clone());
        let event = ChangeEvent::new(self.inner.id, "list", value.clone(), Some(value));
        self.inner.listeners.notify(&event);
    }

    // ---- 変更操作 ----

    /// 末尾に追加し、新しい長さを返す
    pub fn push(&self, value: impl Into<Value>) -> usize {
        self.extend([value.into()])
    }

    /// まとめて末尾に追加する。通知は一回
    pub fn extend(&self, values: impl IntoIterator<Item = Value>) -> usize {
        let cells: Vec<LiveValue> = values.into_iter().map(|v| self.wrap(v)).collect();
        if cells.is_empty() {
            return self.len();
        }
        self.inner.items.borrow_mut().extend(cells.iter().cloned());
        self.commit(&cells, &[]);
        self.len()
    }

    pub fn pop(&self) -> Option<Value> {
        let cell = self.inner.items.borrow_mut().pop()?;
        self.commit(&[], std::slice::from_ref(&cell));
        Some(cell.get())
    }

    pub fn shift(&self) -> Option<Value> {
        let cell = {
            let mut items = self.inner.items.borrow_mut();
            if items.is_empty() {
                return None;
            }
            items.remove(0)
        };
        self.commit(&[], std::slice::from_ref(&cell));
        Some(cell.get())
    }

    /// 先頭に追加し、新しい長さを返す
    pub fn unshift(&self, value: impl Into<Value>) -> usize {
        let cell = self.wrap(value.into());
        self.inner.items.borrow_mut().insert(0, cell.clone());
        self.commit(std::slice::from_ref(&cell), &[]);
        self.len()
    }

    /// start から delete_count 個を取り除いて items を挿入し、取り除いた値を返す
    pub fn splice(&self, start: usize, delete_count: usize, items: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let inserted: Vec<LiveValue> = items.into_iter().map(|v| self.wrap(v)).collect();
        let removed: Vec<LiveValue> = {
            let mut cells = self.inner.items.borrow_mut();
            let start = start.min(cells.len());
            let end = start.saturating_add(delete_count).min(cells.len());
            cells.splice(start..end, inserted.iter().cloned()).collect()
        };
        self.commit(&inserted, &removed);
        removed.iter().map(LiveValue::get).collect()
    }

    pub fn clear(&self) -> Vec<Value> {
        self.splice(0, self.len(), std::iter::empty())
    }

    /// 値で並べ替える。セル自体は保たれるので購読も維持される
    ///
    /// 比較関数の中からこのリストを読んでもよい（並べ替え前の並びが見える）。
    pub fn sort_by(&self, mut compare: impl FnMut(&Value, &Value) -> Ordering) {
        let mut cells = self.cells();
        cells.sort_by(|a, b| compare(&a.get(), &b.get()));
        *self.inner.items.borrow_mut() = cells;
        self.dispatch_changed();
    }

    /// インデックス位置のセルの値を置き換える（セルは置き換えない）
    pub fn set(&self, index: usize, value: impl Into<Value>) -> bool {
        let Some(cell) = self.cell(index) else {
            log::debug!("LiveList::set out of range: {}", index);
            return false;
        };
        let value = match &self.inner.model {
            Some(model) => model.apply(value.into()),
            None => value.into(),
        };
        cell.set(value);
        true
    }

    // ---- 読み取り ----

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn length_cell(&self) -> LiveValue {
        self.inner.length.clone()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.inner.items.borrow().get(index).map(LiveValue::get)
    }

    /// その位置に現在あるセル
    pub fn cell(&self, index: usize) -> Option<LiveValue> {
        self.inner.items.borrow().get(index).cloned()
    }

    pub fn cells(&self) -> Vec<LiveValue> {
        self.inner.items.borrow().clone()
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner.items.borrow().iter().map(LiveValue::get).collect()
    }

    pub fn map<T>(&self, f: impl FnMut(Value) -> T) -> Vec<T> {
        self.values().into_iter().map(f).collect()
    }

    pub fn for_each(&self, f: impl FnMut(Value)) {
        self.values().into_iter().for_each(f);
    }

    /// 条件に合う要素だけを持つ新しい LiveList
    pub fn filter(&self, mut predicate: impl FnMut(&Value) -> bool) -> LiveList {
        let matching = self.values().into_iter().filter(|v| predicate(v));
        match &self.inner.model {
            Some(model) => LiveList::from_values_with_model(matching, model.clone()),
            None => LiveList::from_values(matching),
        }
    }

    pub fn find(&self, mut predicate: impl FnMut(&Value) -> bool) -> Option<Value> {
        self.values().into_iter().find(|v| predicate(v))
    }

    pub fn find_index(&self, mut predicate: impl FnMut(&Value) -> bool) -> Option<usize> {
        self.values().iter().position(|v| predicate(v))
    }

    pub fn some(&self, predicate: impl FnMut(&Value) -> bool) -> bool {
        self.find_index(predicate).is_some()
    }

    pub fn reduce<A>(&self, init: A, f: impl FnMut(A, Value) -> A) -> A {
        self.values().into_iter().fold(init, f)
    }

    /// 末尾から畳み込む
    pub fn reduce_right<A>(&self, init: A, f: impl FnMut(A, Value) -> A) -> A {
        self.values().into_iter().rev().fold(init, f)
    }

    pub fn join(&self, separator: &str) -> String {
        self.values()
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(separator)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.values().iter().map(Value::to_json).collect())
    }
}

impl Observable for LiveList {
    fn id(&self) -> CellId {
        self.inner.id
    }

    fn name(&self) -> String {
        "list".to_string()
    }

    fn value(&self) -> Value {
        Value::List(self.clone())
    }

    fn set_value(&self, _value: Value) {
        log::trace!("write to LiveList as a whole ignored");
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

// `length` と数値インデックスでパスを辿れるようにする
impl PropertyHost for LiveList {
    fn type_name(&self) -> String {
        "LiveList".to_string()
    }

    fn has_property(&self, name: &str) -> bool {
        name == "length" || name.parse::<usize>().is_ok_and(|idx| idx < self.len())
    }

    fn live_cell(&self, name: &str) -> Option<Rc<dyn Observable>> {
        if name == "length" {
            return Some(Rc::new(self.length_cell()));
        }
        let index = name.parse::<usize>().ok()?;
        self.cell(index).map(|cell| Rc::new(cell) as Rc<dyn Observable>)
    }

    fn raw_get(&self, name: &str) -> Option<Value> {
        if name == "length" {
            return Some(Value::from(self.len()));
        }
        self.get(name.parse::<usize>().ok()?)
    }

    fn raw_set(&self, name: &str, value: Value) -> bool {
        match name.parse::<usize>() {
            Ok(index) => self.set(index, value),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for LiveList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values()).finish()
    }
}
