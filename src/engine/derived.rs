// ========================================
// 派生セル（DerivedValue）
// ========================================
//
// 監視セル群の現在値から計算される読み取り専用セル。
// 監視セルの値自体が観測可能（LiveList）なら、その中身の変更も追いかける。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use crate::engine::observable::{
    CellId, ChangeEvent, Listener, ListenerId, ListenerSet, Observable, PropagationGuard,
};
use crate::engine::value::Value;

/// 計算関数の結果
pub enum Computation {
    Ready(Value),
    /// 非同期計算。確定するまで古い値が見え続ける
    Pending(Pin<Box<dyn Future<Output = Value>>>),
}

pub type ComputeFn = Box<dyn Fn(&[Value]) -> Computation>;

struct NestedWatch {
    cell: Rc<dyn Observable>,
    listener: ListenerId,
}

struct DerivedInner {
    id: CellId,
    name: String,
    watched: Vec<Rc<dyn Observable>>,
    watch_listeners: RefCell<Vec<ListenerId>>,
    nested: RefCell<Vec<Option<NestedWatch>>>,
    compute: ComputeFn,
    value: RefCell<Value>,
    changing: Cell<bool>,
    /// 通知中に値が変わった印。通知の最後に最新値を流し直す
    stale: Cell<bool>,
    /// 非同期計算の世代。古い世代の結果は捨てる
    generation: Cell<u64>,
    listeners: ListenerSet,
}

impl DerivedInner {
    fn release(&self) {
        let ids: Vec<ListenerId> = self.watch_listeners.borrow_mut().drain(..).collect();
        for (cell, id) in self.watched.iter().zip(ids) {
            cell.unsubscribe(id);
        }
        let nested: Vec<Option<NestedWatch>> = self.nested.borrow_mut().drain(..).collect();
        for watch in nested.into_iter().flatten() {
            watch.cell.unsubscribe(watch.listener);
        }
    }
}

impl Drop for DerivedInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// 派生セル
#[derive(Clone)]
pub struct DerivedValue {
    inner: Rc<DerivedInner>,
}

impl DerivedValue {
    /// 同期計算の派生セル。構築時に一度計算する
    pub fn new(
        name: &str,
        watch: Vec<Rc<dyn Observable>>,
        compute: impl Fn(&[Value]) -> Value + 'static,
    ) -> Self {
        Self::with_computation(name, watch, Box::new(move |values| Computation::Ready(compute(values))))
    }

    /// 非同期計算の派生セル
    ///
    /// 計算は `tokio::task::spawn_local` で駆動されるため、
    /// `LocalSet` の中で構築・更新すること。
    ///
    /// # Panics
    ///
    /// `LocalSet` の外で構築すると、最初の計算を起動した時点で panic する。
    /// 監視セルの変更で `recompute` が走る場合も同じ。
    pub fn new_async<F, Fut>(name: &str, watch: Vec<Rc<dyn Observable>>, compute: F) -> Self
    where
        F: Fn(&[Value]) -> Fut + 'static,
        Fut: Future<Output = Value> + 'static,
    {
        Self::with_computation(
            name,
            watch,
            Box::new(move |values| Computation::Pending(Box::pin(compute(values)))),
        )
    }

    pub fn with_computation(name: &str, watch: Vec<Rc<dyn Observable>>, compute: ComputeFn) -> Self {
        let nested = watch.iter().map(|_| None).collect();
        let derived = Self {
            inner: Rc::new(DerivedInner {
                id: CellId::next(),
                name: name.to_string(),
                watched: watch,
                watch_listeners: RefCell::new(Vec::new()),
                nested: RefCell::new(nested),
                compute,
                value: RefCell::new(Value::Null),
                changing: Cell::new(false),
                stale: Cell::new(false),
                generation: Cell::new(0),
                listeners: ListenerSet::new(),
            }),
        };

        for (index, cell) in derived.inner.watched.iter().enumerate() {
            let weak = Rc::downgrade(&derived.inner);
            let id = cell.subscribe(Rc::new(move |_event: &ChangeEvent| {
                if let Some(inner) = weak.upgrade() {
                    DerivedValue { inner }.on_watched_changed(index);
                }
            }));
            derived.inner.watch_listeners.borrow_mut().push(id);
            derived.track_nested(index);
        }

        derived.recompute();
        derived
    }

    pub fn get(&self) -> Value {
        self.inner.value.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &DerivedValue) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// 監視セルの現在値で計算し直す。結果が変わったときだけ通知する
    ///
    /// # Panics
    ///
    /// 非同期計算のセルを `LocalSet` の外で計算し直すと panic する。
    pub fn recompute(&self) {
        let values: Vec<Value> = self.inner.watched.iter().map(|cell| cell.value()).collect();
        let generation = self.inner.generation.get() + 1;
        self.inner.generation.set(generation);

        match (self.inner.compute)(&values) {
            Computation::Ready(value) => self.settle(value),
            Computation::Pending(future) => {
                let weak = Rc::downgrade(&self.inner);
                tokio::task::spawn_local(async move {
                    let value = future.await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if inner.generation.get() != generation {
                        log::trace!("superseded async result for `{}` discarded", inner.name);
                        return;
                    }
                    DerivedValue { inner }.settle(value);
                });
            }
        }
    }

    /// 全ての購読を外す
    pub fn destroy(&self) {
        self.inner.release();
    }

    fn on_watched_changed(&self, index: usize) {
        self.track_nested(index);
        self.recompute();
    }

    /// 監視セルの値が観測可能なら、その中身の購読を張り替える
    fn track_nested(&self, index: usize) {
        let Some(cell) = self.inner.watched.get(index) else {
            return;
        };
        let next = cell.value().as_observable();

        let unchanged = {
            let nested = self.inner.nested.borrow();
            match (nested.get(index).and_then(Option::as_ref), &next) {
                (Some(current), Some(next)) => current.cell.id() == next.id(),
                (None, None) => true,
                _ => false,
            }
        };
        if unchanged {
            return;
        }

        let previous = self
            .inner
            .nested
            .borrow_mut()
            .get_mut(index)
            .and_then(Option::take);
        if let Some(previous) = previous {
            previous.cell.unsubscribe(previous.listener);
        }

        if let Some(observable) = next {
            let weak = Rc::downgrade(&self.inner);
            let listener = observable.subscribe(Rc::new(move |_event: &ChangeEvent| {
                if let Some(inner) = weak.upgrade() {
                    DerivedValue { inner }.recompute();
                }
            }));
            if let Some(slot) = self.inner.nested.borrow_mut().get_mut(index) {
                *slot = Some(NestedWatch {
                    cell: observable,
                    listener,
                });
            }
        }
    }

    fn settle(&self, value: Value) {
        if *self.inner.value.borrow() == value {
            return;
        }
        let mut old_value = self.inner.value.replace(value.clone());
        let Some(_guard) = PropagationGuard::enter(&self.inner.changing) else {
            log::trace!("`{}` recomputed during its own dispatch, re-announcing", self.inner.name);
            self.inner.stale.set(true);
            return;
        };
        self.inner.stale.set(false);
        let mut announced = value;
        loop {
            let event = ChangeEvent::new(self.inner.id, &self.inner.name, announced.clone(), Some(old_value));
            self.inner.listeners.notify(&event);
            if !self.inner.stale.replace(false) {
                break;
            }
            let latest = self.get();
            if latest == announced {
                break;
            }
            old_value = std::mem::replace(&mut announced, latest);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl Observable for DerivedValue {
    fn id(&self) -> CellId {
        self.inner.id
    }

    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn value(&self) -> Value {
        self.get()
    }

    fn set_value(&self, _value: Value) {
        log::trace!("write to derived `{}` ignored", self.inner.name);
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

impl fmt::Debug for DerivedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedValue")
            .field("name", &self.inner.name)
            .field("watched", &self.inner.watched.len())
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::live_list::LiveList;
    use crate::engine::live_value::LiveValue;

    fn sum(values: &[Value]) -> Value {
        Value::from(values.iter().filter_map(Value::as_number).sum::<f64>())
    }

    fn counter(derived: &DerivedValue) -> Rc<Cell<usize>> {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        derived.subscribe(Rc::new(move |_: &ChangeEvent| c.set(c.get() + 1)));
        count
    }

    #[test]
    fn test_recomputes_on_each_watched_change() {
        let a = LiveValue::new(1, "a", "Test");
        let b = LiveValue::new(2, "b", "Test");
        let total = DerivedValue::new("total", vec![Rc::new(a.clone()), Rc::new(b.clone())], sum);
        assert_eq!(total.get(), Value::from(3));

        let count = counter(&total);
        a.set(10);
        b.set(20);
        assert_eq!(total.get(), Value::from(30));
        // バッチ化はしないので一回の操作でも二回通知される
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_recompute_without_change_is_silent() {
        let a = LiveValue::new(4, "a", "Test");
        let double = DerivedValue::new("double", vec![Rc::new(a.clone())], |v| {
            Value::from(v[0].as_number().unwrap_or(0.0) * 2.0)
        });
        let count = counter(&double);
        double.recompute();
        double.recompute();
        assert_eq!(count.get(), 0);
        a.set(4);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_writes_are_ignored() {
        let a = LiveValue::new(1, "a", "Test");
        let derived = DerivedValue::new("copy", vec![Rc::new(a)], |v| v[0].clone());
        derived.set_value(Value::from(99));
        assert_eq!(derived.get(), Value::from(1));
    }

    #[test]
    fn test_tracks_nested_list_and_swaps_on_identity_change() {
        let first = LiveList::from_values([Value::from(1)]);
        let second = LiveList::from_values([Value::from(5), Value::from(5)]);
        let holder = LiveValue::new(first.clone(), "items", "Test");
        let length = DerivedValue::new("count", vec![Rc::new(holder.clone())], |v| {
            Value::from(v[0].as_list().map(LiveList::len).unwrap_or(0))
        });

        first.push(2);
        assert_eq!(length.get(), Value::from(2));

        holder.set(second.clone());
        assert_eq!(length.get(), Value::from(2));

        let count = counter(&length);
        first.push(3);
        assert_eq!(count.get(), 0);
        second.push(6);
        assert_eq!(length.get(), Value::from(3));
        assert_eq!(count.get(), 1);
        assert_eq!(first.listener_count(), 0);
    }

    #[test]
    fn test_destroy_detaches() {
        let a = LiveValue::new(1, "a", "Test");
        let derived = DerivedValue::new("copy", vec![Rc::new(a.clone())], |v| v[0].clone());
        assert_eq!(a.listener_count(), 1);
        derived.destroy();
        assert_eq!(a.listener_count(), 0);
        a.set(2);
        assert_eq!(derived.get(), Value::from(1));
    }

    #[test]
    fn test_drop_detaches() {
        let a = LiveValue::new(1, "a", "Test");
        {
            let _derived = DerivedValue::new("copy", vec![Rc::new(a.clone())], |v| v[0].clone());
            assert_eq!(a.listener_count(), 1);
        }
        assert_eq!(a.listener_count(), 0);
    }

    #[test]
    fn test_panicking_compute_propagates_and_keeps_value() {
        let a = LiveValue::new(1, "a", "Test");
        let derived = DerivedValue::new("checked", vec![Rc::new(a.clone())], |v| {
            if v[0].as_number() == Some(13.0) {
                panic!("unlucky");
            }
            v[0].clone()
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| a.set(13)));
        assert!(result.is_err());
        assert_eq!(derived.get(), Value::from(1));
        assert!(!a.is_changing());

        a.set(2);
        assert_eq!(derived.get(), Value::from(2));
    }

    #[test]
    fn test_change_during_dispatch_is_announced() {
        let a = LiveValue::new(0, "a", "Test");
        let b = LiveValue::new(0, "b", "Test");
        let total = DerivedValue::new("total", vec![Rc::new(a.clone()), Rc::new(b.clone())], sum);

        let feedback = b.clone();
        total.subscribe(Rc::new(move |e: &ChangeEvent| {
            if e.value == Value::from(1) {
                feedback.set(10);
            }
        }));
        let shown = LiveValue::new(0, "shown", "Test");
        let mirror = shown.clone();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        total.subscribe(Rc::new(move |e: &ChangeEvent| {
            s.borrow_mut().push((e.value.clone(), e.old_value.clone()));
            mirror.set(e.value.clone());
        }));

        a.set(1);
        assert_eq!(total.get(), Value::from(11));
        assert_eq!(shown.get(), Value::from(11));
        assert_eq!(
            *seen.borrow(),
            vec![
                (Value::from(1), Some(Value::from(0))),
                (Value::from(11), Some(Value::from(1)))
            ]
        );
        assert!(!total.is_changing());
    }

    #[test]
    #[should_panic]
    fn test_async_outside_local_set_panics() {
        let a = LiveValue::new(1, "a", "Test");
        let _derived = DerivedValue::new_async("slow", vec![Rc::new(a)], |v| {
            let value = v[0].clone();
            async move { value }
        });
    }

    #[tokio::test]
    async fn test_async_value_settles_later() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let a = LiveValue::new(2, "a", "Test");
                let derived = DerivedValue::new_async("slow", vec![Rc::new(a.clone())], |v| {
                    let n = v[0].as_number().unwrap_or(0.0);
                    async move {
                        tokio::task::yield_now().await;
                        Value::from(n * 100.0)
                    }
                });
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
                derived.subscribe(Rc::new(move |e: &ChangeEvent| {
                    let _ = tx.send(e.value.clone());
                }));

                assert_eq!(derived.get(), Value::Null);
                assert_eq!(rx.recv().await, Some(Value::from(200)));

                a.set(3);
                assert_eq!(derived.get(), Value::from(200));
                assert_eq!(rx.recv().await, Some(Value::from(300)));
            })
            .await;
    }

    #[tokio::test]
    async fn test_superseded_async_result_is_discarded() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let gate = Rc::new(tokio::sync::Notify::new());
                let a = LiveValue::new(0, "a", "Test");
                let compute_gate = gate.clone();
                let derived = DerivedValue::new_async("gated", vec![Rc::new(a.clone())], move |v| {
                    let n = v[0].as_number().unwrap_or(0.0);
                    let gate = compute_gate.clone();
                    async move {
                        if n == 1.0 {
                            gate.notified().await;
                        }
                        Value::from(n * 10.0)
                    }
                });
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
                derived.subscribe(Rc::new(move |e: &ChangeEvent| {
                    let _ = tx.send(e.value.clone());
                }));
                assert_eq!(rx.recv().await, Some(Value::from(0)));

                a.set(1);
                a.set(2);
                assert_eq!(rx.recv().await, Some(Value::from(20)));

                gate.notify_one();
                for _ in 0..8 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(derived.get(), Value::from(20));
                assert!(rx.try_recv().is_err());
            })
            .await;
    }
}
