// ========================================
// ビュー（View / LiveListView）
// ========================================
//
// View はモデルの上に載る表示用オブジェクト。
// モデルか自身のプロパティが変わるたびにビュープロパティを計算し直す。
// LiveListView は元リストを絞り込み・変換した読み取り用のリスト。

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::dom::EventHandler;
use crate::engine::live_list::LiveList;
use crate::engine::live_value::LiveValue;
use crate::engine::object::{LiveObject, PropertyHost};
use crate::engine::observable::{CellId, ChangeEvent, Listener, ListenerId, Observable};
use crate::engine::value::Value;

pub type ViewFn = Rc<dyn Fn(&View) -> Value>;

struct ViewInner {
    object: LiveObject,
    model: LiveObject,
    updates: RefCell<Vec<(LiveValue, ViewFn)>>,
    watching: RefCell<Vec<(Rc<dyn Observable>, ListenerId)>>,
}

impl Drop for ViewInner {
    fn drop(&mut self) {
        for (cell, id) in self.watching.borrow_mut().drain(..) {
            cell.unsubscribe(id);
        }
    }
}

/// モデルに追従する表示用オブジェクト
///
/// ビュープロパティは `object()` が返す LiveObject に載る。
/// View を手放すと再計算も止まる。
#[derive(Clone)]
pub struct View {
    inner: Rc<ViewInner>,
}

impl View {
    /// モデルの観測可能プロパティを全て監視する
    pub fn new(type_name: &str, model: LiveObject) -> Self {
        let view = Self {
            inner: Rc::new(ViewInner {
                object: LiveObject::new(type_name),
                model,
                updates: RefCell::new(Vec::new()),
                watching: RefCell::new(Vec::new()),
            }),
        };
        for name in view.inner.model.property_names() {
            if let Some(cell) = view.inner.model.property(&name) {
                view.watch(cell);
            }
        }
        view
    }

    pub fn model(&self) -> &LiveObject {
        &self.inner.model
    }

    pub fn object(&self) -> &LiveObject {
        &self.inner.object
    }

    /// 自身のプロパティ。変更でもビュープロパティを計算し直す
    pub fn add_property(&self, name: &str, initial: impl Into<Value>) -> LiveValue {
        let cell = self.inner.object.add_property(name, initial);
        self.watch(Rc::new(cell.clone()));
        cell
    }

    /// 計算されるビュープロパティ。構築時に一度計算する
    pub fn add_view(&self, name: &str, compute: impl Fn(&View) -> Value + 'static) -> LiveValue {
        let compute: ViewFn = Rc::new(compute);
        let cell = self.inner.object.add_property(name, compute(self));
        self.inner.updates.borrow_mut().push((cell.clone(), compute));
        cell
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.object.get(name)
    }

    /// 全てのビュープロパティを計算し直す。値が同じなら通知されない
    pub fn update_properties(&self) {
        let updates = self.inner.updates.borrow().clone();
        for (cell, compute) in updates {
            let value = compute(self);
            if cell.get() != value {
                cell.set(value);
            }
        }
    }

    fn watch(&self, cell: Rc<dyn Observable>) {
        let weak: Weak<ViewInner> = Rc::downgrade(&self.inner);
        let id = cell.subscribe(Rc::new(move |_event: &ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                View { inner }.update_properties();
            }
        }));
        self.inner.watching.borrow_mut().push((cell, id));
    }
}

impl PropertyHost for View {
    fn type_name(&self) -> String {
        self.inner.object.type_name()
    }

    fn has_property(&self, name: &str) -> bool {
        self.inner.object.has_property(name)
    }

    fn live_cell(&self, name: &str) -> Option<Rc<dyn Observable>> {
        self.inner.object.live_cell(name)
    }

    fn raw_get(&self, name: &str) -> Option<Value> {
        self.inner.object.raw_get(name)
    }

    fn raw_set(&self, name: &str, value: Value) -> bool {
        self.inner.object.raw_set(name, value)
    }

    fn handler(&self, name: &str) -> Option<EventHandler> {
        PropertyHost::handler(&self.inner.object, name)
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("object", &self.inner.object)
            .field("views", &self.inner.updates.borrow().len())
            .finish()
    }
}

// ========================================
// LiveListView
// ========================================

pub type ViewFilter = Rc<dyn Fn(&Value) -> bool>;
pub type ItemView = Rc<dyn Fn(Value) -> Value>;

struct ListViewInner {
    view: LiveList,
    contents: RefCell<LiveList>,
    filter: RefCell<Option<ViewFilter>>,
    item_view: RefCell<Option<ItemView>>,
    source_listener: RefCell<Option<ListenerId>>,
}

impl ListViewInner {
    fn release(&self) {
        if let Some(id) = self.source_listener.borrow_mut().take() {
            self.contents.borrow().unsubscribe(id);
        }
    }
}

impl Drop for ListViewInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// 元リストを絞り込み・変換したリスト
///
/// 元リストの変更・`set_contents`・`set_filter` のたびに作り直し、
/// 作り直し一回につき一度だけ通知する。`list()` への直接の書き込みは
/// 次の作り直しで失われる。
#[derive(Clone)]
pub struct LiveListView {
    inner: Rc<ListViewInner>,
}

impl LiveListView {
    pub fn new(contents: LiveList) -> Self {
        let view = Self {
            inner: Rc::new(ListViewInner {
                view: LiveList::new(),
                contents: RefCell::new(LiveList::new()),
                filter: RefCell::new(None),
                item_view: RefCell::new(None),
                source_listener: RefCell::new(None),
            }),
        };
        view.set_contents(contents);
        view
    }

    pub fn with_filter(self, filter: impl Fn(&Value) -> bool + 'static) -> Self {
        self.set_filter(Some(Rc::new(filter)));
        self
    }

    /// 残った要素を包み直す。作り直しのたびに新しく包む
    pub fn with_item_view(self, item_view: impl Fn(Value) -> Value + 'static) -> Self {
        *self.inner.item_view.borrow_mut() = Some(Rc::new(item_view));
        self.reset_view();
        self
    }

    /// 元リストを差し替える
    pub fn set_contents(&self, contents: LiveList) {
        self.inner.release();
        let weak = Rc::downgrade(&self.inner);
        let id = contents.subscribe(Rc::new(move |_event: &ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                LiveListView { inner }.reset_view();
            }
        }));
        *self.inner.contents.borrow_mut() = contents;
        *self.inner.source_listener.borrow_mut() = Some(id);
        self.reset_view();
    }

    /// None なら全要素を通す
    pub fn set_filter(&self, filter: Option<ViewFilter>) {
        *self.inner.filter.borrow_mut() = filter;
        self.reset_view();
    }

    pub fn contents(&self) -> LiveList {
        self.inner.contents.borrow().clone()
    }

    /// 絞り込み結果のリスト。バインディングにはこれを渡す
    pub fn list(&self) -> LiveList {
        self.inner.view.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.view.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.inner.view.get(index)
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner.view.values()
    }

    fn reset_view(&self) {
        let filter = self.inner.filter.borrow().clone();
        let item_view = self.inner.item_view.borrow().clone();
        let items: Vec<Value> = self
            .contents()
            .values()
            .into_iter()
            .filter(|item| filter.as_ref().is_none_or(|keep| keep(item)))
            .map(|item| match &item_view {
                Some(wrap) => wrap(item),
                None => item,
            })
            .collect();
        log::trace!("list view rebuilt with {} items", items.len());
        self.inner.view.splice(0, self.inner.view.len(), items);
    }
}

impl Observable for LiveListView {
    fn id(&self) -> CellId {
        self.inner.view.id()
    }

    fn name(&self) -> String {
        "view".to_string()
    }

    fn value(&self) -> Value {
        Value::List(self.list())
    }

    fn set_value(&self, _value: Value) {
        log::trace!("write to LiveListView ignored");
    }

    fn is_changing(&self) -> bool {
        false
    }

    fn subscribe(&self, listener: Listener) -> ListenerId {
        self.inner.view.subscribe(listener)
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.inner.view.unsubscribe(id);
    }
}

impl fmt::Debug for LiveListView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values()).finish()
    }
}
