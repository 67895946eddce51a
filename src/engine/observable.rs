// ========================================
// 観測可能インターフェース
// ========================================
//
// セル・派生セル・コレクション・バインディング式が共通で実装する
// 変更通知の能力インターフェース。プレーンな値は決してObservableにならない。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::value::Value;

/// セルID生成用カウンター
static CELL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// リスナーID生成用カウンター（0はDeadValueのダミー用に予約）
static LISTENER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// 観測可能オブジェクトの一意な識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    pub fn next() -> Self {
        CellId(CELL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// 購読解除に使うハンドル
pub type ListenerId = u64;

pub fn next_listener_id() -> ListenerId {
    LISTENER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// 変更通知イベント
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// 通知元のセル
    pub origin: CellId,
    pub name: String,
    /// 新しい値
    pub value: Value,
    /// 変更前の値。add_listener直後の初回呼び出しでは None
    pub old_value: Option<Value>,
}

impl ChangeEvent {
    pub fn new(origin: CellId, name: &str, value: Value, old_value: Option<Value>) -> Self {
        Self {
            origin,
            name: name.to_string(),
            value,
            old_value,
        }
    }

    /// add_listener の即時呼び出しかどうか
    pub fn is_initial(&self) -> bool {
        self.old_value.is_none()
    }
}

pub type Listener = Rc<dyn Fn(&ChangeEvent)>;

/// 値の変更を購読できるもの
pub trait Observable {
    fn id(&self) -> CellId;

    fn name(&self) -> String;

    fn value(&self) -> Value;

    /// 書き込み。読み取り専用のものは何もしない
    fn set_value(&self, value: Value);

    /// 通知を配信中かどうか
    fn is_changing(&self) -> bool;

    /// 今後の通知を購読する（即時呼び出しはしない）
    fn subscribe(&self, listener: Listener) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId);

    /// DeadValue のように実際には通知しないラッパーは false
    fn is_live(&self) -> bool {
        true
    }

    /// 購読したうえで現在値で一度だけ即時に呼び出す。
    /// 利用側は初期値の読み出しを別に行う必要がない。
    fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = self.subscribe(listener.clone());
        let event = ChangeEvent::new(self.id(), &self.name(), self.value(), None);
        listener(&event);
        id
    }
}

impl fmt::Debug for dyn Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// 登録順に通知するリスナー表
#[derive(Default)]
pub struct ListenerSet {
    entries: RefCell<Vec<(ListenerId, Listener)>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener) -> ListenerId {
        let id = next_listener_id();
        self.entries.borrow_mut().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.entries.borrow().iter().any(|(entry_id, _)| *entry_id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// スナップショットに対して配信する。
    /// 配信中に外されたリスナーは呼ばない。
    pub fn notify(&self, event: &ChangeEvent) {
        let snapshot: Vec<(ListenerId, Listener)> = self.entries.borrow().clone();
        for (id, listener) in snapshot {
            if self.contains(id) {
                listener(event);
            }
        }
    }
}

/// isPropagating フラグのガード。
/// パニックで巻き戻っても drop でフラグを戻す。
pub struct PropagationGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> PropagationGuard<'a> {
    /// 既に配信中なら None
    pub fn enter(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.get() {
            return None;
        }
        flag.set(true);
        Some(Self { flag })
    }
}

impl Drop for PropagationGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(value: i32) -> ChangeEvent {
        ChangeEvent::new(CellId::next(), "test", Value::from(value), Some(Value::Null))
    }

    #[test]
    fn test_listener_order() {
        let set = ListenerSet::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let log = log.clone();
            set.add(Rc::new(move |_: &ChangeEvent| log.borrow_mut().push(tag)));
        }
        set.notify(&event(1));

        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_removed_during_dispatch_is_skipped() {
        let set = Rc::new(ListenerSet::new());
        let hits = Rc::new(Cell::new(0));
        let second_id = Rc::new(Cell::new(0));

        let set_ref = set.clone();
        let second = second_id.clone();
        set.add(Rc::new(move |_: &ChangeEvent| {
            set_ref.remove(second.get());
        }));
        let counter = hits.clone();
        second_id.set(set.add(Rc::new(move |_: &ChangeEvent| counter.set(counter.get() + 1))));

        set.notify(&event(1));
        assert_eq!(hits.get(), 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_guard_resets_flag() {
        let flag = Cell::new(false);
        {
            let guard = PropagationGuard::enter(&flag);
            assert!(guard.is_some());
            assert!(PropagationGuard::enter(&flag).is_none());
        }
        assert!(!flag.get());
    }
}
