// ========================================
// バインディング式
// ========================================
//
// コンテキストからのドット区切りパスをターゲットのセルへ結びつける。
// パス途中のオブジェクトが差し替わると、後続のセグメントを張り直す。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::engine::error::BindError;
use crate::engine::live_value::DeadValue;
use crate::engine::object::PropertyHost;
use crate::engine::observable::{
    CellId, ChangeEvent, Listener, ListenerId, ListenerSet, Observable, PropagationGuard,
};
use crate::engine::value::Value;

/// 値の流れる向き
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// `>` ソース → ターゲット
    #[default]
    ToTarget,
    /// `<` ターゲット → ソース
    ToSource,
    /// `=` 双方向
    TwoWay,
}

impl Direction {
    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            '>' => Some(Direction::ToTarget),
            '<' => Some(Direction::ToSource),
            '=' => Some(Direction::TwoWay),
            _ => None,
        }
    }

    pub fn marker(self) -> char {
        match self {
            Direction::ToTarget => '>',
            Direction::ToSource => '<',
            Direction::TwoWay => '=',
        }
    }

    /// ターゲットへ書き込むか
    pub fn pushes(self) -> bool {
        matches!(self, Direction::ToTarget | Direction::TwoWay)
    }

    /// ソースへ書き戻すか
    pub fn pulls(self) -> bool {
        matches!(self, Direction::ToSource | Direction::TwoWay)
    }
}

/// 解析済みのパス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingPath {
    pub direction: Direction,
    pub segments: Vec<String>,
}

impl BindingPath {
    /// `=user.profile.name` のような式を解析する
    pub fn parse(expression: &str) -> Self {
        let expression = expression.trim();
        let mut chars = expression.chars();
        let (direction, rest) = match chars.next().and_then(Direction::from_marker) {
            Some(direction) => (direction, chars.as_str()),
            None => (Direction::default(), expression),
        };
        Self {
            direction,
            segments: rest.split('.').map(|s| s.trim().to_string()).collect(),
        }
    }

    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }
}

impl fmt::Display for BindingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.direction.marker(), self.dotted())
    }
}

struct ResolvedSegment {
    cell: Rc<dyn Observable>,
    listener: ListenerId,
    /// セルの値自体が観測可能（LiveList）な場合の購読
    nested: Option<(Rc<dyn Observable>, ListenerId)>,
}

impl ResolvedSegment {
    fn release(self) {
        self.cell.unsubscribe(self.listener);
        if let Some((observable, id)) = self.nested {
            observable.unsubscribe(id);
        }
    }
}

struct TargetSlot {
    description: String,
    cell: Rc<dyn Observable>,
    listener: Cell<Option<ListenerId>>,
}

struct BindingInner {
    id: CellId,
    expression: String,
    path: BindingPath,
    context: Rc<dyn PropertyHost>,
    target: Option<TargetSlot>,
    resolved: RefCell<Vec<ResolvedSegment>>,
    current: RefCell<Value>,
    changing: Cell<bool>,
    listeners: ListenerSet,
}

impl BindingInner {
    fn release(&self) {
        let segments: Vec<ResolvedSegment> = self.resolved.borrow_mut().drain(..).collect();
        for segment in segments {
            segment.release();
        }
        if let Some(target) = &self.target {
            if let Some(id) = target.listener.take() {
                target.cell.unsubscribe(id);
            }
        }
    }
}

impl Drop for BindingInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// バインディング式
///
/// それ自体も Observable で、解決済みの値が変わるたびに通知する。
#[derive(Clone)]
pub struct BindingExpression {
    inner: Rc<BindingInner>,
}

impl BindingExpression {
    /// ターゲットを持たない読み取り専用のバインディング（テキスト補間用）
    pub fn new(expression: &str, context: Rc<dyn PropertyHost>) -> Result<Self, BindError> {
        Self::build(expression, context, None)
    }

    /// target_host の target_name へ結びつける
    pub fn with_target(
        expression: &str,
        context: Rc<dyn PropertyHost>,
        target_host: Rc<dyn PropertyHost>,
        target_name: &str,
    ) -> Result<Self, BindError> {
        let cell = target_host
            .live_cell(target_name)
            .unwrap_or_else(|| Rc::new(DeadValue::new(&target_host, target_name)));
        let target = TargetSlot {
            description: format!("{}.{}", target_host.type_name(), target_name),
            cell,
            listener: Cell::new(None),
        };
        Self::build(expression, context, Some(target))
    }

    fn build(expression: &str, context: Rc<dyn PropertyHost>, target: Option<TargetSlot>) -> Result<Self, BindError> {
        let path = BindingPath::parse(expression);
        let binding = Self {
            inner: Rc::new(BindingInner {
                id: CellId::next(),
                expression: expression.to_string(),
                path,
                context,
                target,
                resolved: RefCell::new(Vec::new()),
                current: RefCell::new(Value::Null),
                changing: Cell::new(false),
                listeners: ListenerSet::new(),
            }),
        };

        // 書き戻す向きならターゲットを先に購読し、その値を基準にする
        if binding.direction().pulls() {
            if let Some(target) = &binding.inner.target {
                *binding.inner.current.borrow_mut() = target.cell.value();
                let weak = Rc::downgrade(&binding.inner);
                let listener: Listener = Rc::new(move |_event: &ChangeEvent| {
                    if let Some(inner) = weak.upgrade() {
                        BindingExpression { inner }.on_target_changed();
                    }
                });
                target.listener.set(Some(target.cell.subscribe(listener)));
            }
        }

        binding.rebind_from(0, Some(binding.inner.context.clone()), true)?;

        // 初回はソースが優先される
        if let Some(source) = binding.source() {
            let value = source.value();
            if value != *binding.inner.current.borrow() {
                *binding.inner.current.borrow_mut() = value.clone();
                if binding.direction().pushes() {
                    binding.write_target(value);
                }
            }
        }

        log::debug!(
            "bound `{}` on {} ({} segments resolved)",
            binding.inner.expression,
            binding.inner.context.type_name(),
            binding.resolved_count()
        );
        Ok(binding)
    }

    pub fn expression(&self) -> &str {
        &self.inner.expression
    }

    pub fn path(&self) -> &BindingPath {
        &self.inner.path
    }

    pub fn direction(&self) -> Direction {
        self.inner.path.direction
    }

    /// 最後に解決された値
    pub fn get(&self) -> Value {
        self.inner.current.borrow().clone()
    }

    pub fn resolved_count(&self) -> usize {
        self.inner.resolved.borrow().len()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_count() == self.inner.path.segments.len()
    }

    /// パス終端のセル。途中までしか解決できていなければ None
    pub fn source(&self) -> Option<Rc<dyn Observable>> {
        let resolved = self.inner.resolved.borrow();
        if resolved.len() == self.inner.path.segments.len() {
            resolved.last().map(|segment| segment.cell.clone())
        } else {
            None
        }
    }

    /// start 番目以降のセグメントを host から解決し直す
    fn rebind_from(&self, start: usize, host: Option<Rc<dyn PropertyHost>>, strict: bool) -> Result<(), BindError> {
        let stale: Vec<ResolvedSegment> = {
            let mut resolved = self.inner.resolved.borrow_mut();
            let start = start.min(resolved.len());
            resolved.drain(start..).collect()
        };
        for segment in stale {
            segment.release();
        }

        let mut host = host;
        for index in start..self.inner.path.segments.len() {
            let name = &self.inner.path.segments[index];
            let Some(current) = host.take() else {
                log::debug!(
                    "`{}` left unresolved at segment `{}`",
                    self.inner.expression,
                    name
                );
                break;
            };

            let cell: Rc<dyn Observable> = match current.live_cell(name) {
                Some(cell) => cell,
                None if current.has_property(name) => Rc::new(DeadValue::new(&current, name)),
                None if strict => {
                    return Err(BindError::resolution(
                        &current.type_name(),
                        name,
                        &self.inner.path.dotted(),
                        self.inner.target.as_ref().map(|t| t.description.clone()),
                    ));
                }
                None => {
                    log::debug!(
                        "{} has no property `{}` while rebinding `{}`",
                        current.type_name(),
                        name,
                        self.inner.expression
                    );
                    break;
                }
            };

            let listener = cell.subscribe(self.source_listener());
            let value = cell.value();
            let nested = value
                .as_observable()
                .map(|observable| {
                    let id = observable.subscribe(self.source_listener());
                    (observable, id)
                });
            host = value.as_host();
            self.inner.resolved.borrow_mut().push(ResolvedSegment { cell, listener, nested });
        }
        Ok(())
    }

    fn source_listener(&self) -> Listener {
        let weak = Rc::downgrade(&self.inner);
        Rc::new(move |event: &ChangeEvent| {
            if let Some(inner) = weak.upgrade() {
                BindingExpression { inner }.on_source_changed(event);
            }
        })
    }

    /// セグメントの値が別のリストに替わったら、リストへの購読を張り替える
    fn refresh_nested(&self, index: usize) {
        let next = self
            .inner
            .resolved
            .borrow()
            .get(index)
            .and_then(|segment| segment.cell.value().as_observable());

        let stale = {
            let mut resolved = self.inner.resolved.borrow_mut();
            let Some(segment) = resolved.get_mut(index) else {
                return;
            };
            match (&segment.nested, &next) {
                (Some((current, _)), Some(next)) if current.id() == next.id() => return,
                (None, None) => return,
                _ => segment.nested.take(),
            }
        };
        if let Some((observable, id)) = stale {
            observable.unsubscribe(id);
        }
        if let Some(observable) = next {
            let id = observable.subscribe(self.source_listener());
            if let Some(segment) = self.inner.resolved.borrow_mut().get_mut(index) {
                segment.nested = Some((observable, id));
            }
        }
    }

    fn on_source_changed(&self, event: &ChangeEvent) {
        let position = self
            .inner
            .resolved
            .borrow()
            .iter()
            .position(|segment| {
                segment.cell.id() == event.origin
                    || segment
                        .nested
                        .as_ref()
                        .is_some_and(|(observable, _)| observable.id() == event.origin)
            });
        let Some(index) = position else {
            return;
        };

        self.refresh_nested(index);
        let rebound = index + 1 < self.inner.path.segments.len();
        if rebound {
            let host = self
                .inner
                .resolved
                .borrow()
                .get(index)
                .and_then(|segment| segment.cell.value().as_host());
            // 再バインドは厳密にしない。解決できない部分は次の変更を待つ
            let _ = self.rebind_from(index + 1, host, false);
        }

        let Some(source) = self.source() else {
            return;
        };
        let value = source.value();
        if value == *self.inner.current.borrow() {
            return;
        }
        let Some(_guard) = PropagationGuard::enter(&self.inner.changing) else {
            log::trace!("`{}` source change during propagation ignored", self.inner.expression);
            return;
        };
        // 書き戻し専用なら、付け替わった先のソースへターゲットの値を書き込む
        if rebound && self.direction() == Direction::ToSource {
            if let Some(target) = &self.inner.target {
                let pulled = target.cell.value();
                log::debug!("`{}` rebound, writing target value back", self.inner.expression);
                source.set_value(pulled.clone());
                let old_value = self.inner.current.replace(pulled.clone());
                if pulled != old_value {
                    self.dispatch(pulled, old_value);
                }
                return;
            }
        }
        let old_value = self.inner.current.replace(value.clone());
        if self.direction().pushes() {
            self.write_target(value.clone());
        }
        self.dispatch(value, old_value);
    }

    fn on_target_changed(&self) {
        let Some(target) = &self.inner.target else {
            return;
        };
        let Some(_guard) = PropagationGuard::enter(&self.inner.changing) else {
            return;
        };
        let value = target.cell.value();
        if value == *self.inner.current.borrow() {
            return;
        }
        let old_value = self.inner.current.replace(value.clone());
        if let Some(source) = self.source() {
            source.set_value(value.clone());
            self.dispatch(value, old_value);
        }
    }

    fn write_target(&self, value: Value) {
        if let Some(target) = &self.inner.target {
            target.cell.set_value(value);
        }
    }

    fn dispatch(&self, value: Value, old_value: Value) {
        let event = ChangeEvent::new(self.inner.id, &self.inner.expression, value, Some(old_value));
        self.inner.listeners.notify(&event);
    }

    /// 全てのセグメントとターゲットの購読を外す
    pub fn destroy(&self) {
        self.inner.release();
    }
}

impl Observable for BindingExpression {
    fn id(&self) -> CellId {
        self.inner.id
    }

    fn name(&self) -> String {
        self.inner.expression.clone()
    }

    fn value(&self) -> Value {
        self.get()
    }

    /// パス終端へ書き込む
    fn set_value(&self, value: Value) {
        if let Some(source) = self.source() {
            source.set_value(value);
        }
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

impl fmt::Debug for BindingExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingExpression")
            .field("expression", &self.inner.expression)
            .field("resolved", &self.resolved_count())
            .field("current", &*self.inner.current.borrow())
            .finish()
    }
}
