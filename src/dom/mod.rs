// ========================================
// DOM プロバイダ境界
// ========================================
//
// エンジンは要素ツリーを不透明な能力の集合として扱う。
// ブラウザ実装の代わりにメモリ上の実装（MemoryDom）を同梱している。

pub mod memory;

use std::fmt;
use std::rc::Rc;

use crate::engine::value::Value;

pub use memory::MemoryDom;

/// ノードの識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Element,
    Text,
}

/// 要素に配送されるイベント
#[derive(Debug, Clone)]
pub struct DomEvent {
    pub kind: String,
    /// 要素を持たないイベント（イベントスロット経由）では None
    pub target: Option<NodeId>,
    pub detail: Value,
}

impl DomEvent {
    pub fn new(kind: &str, target: NodeId) -> Self {
        Self {
            kind: kind.to_string(),
            target: Some(target),
            detail: Value::Null,
        }
    }

    /// オブジェクトのイベントスロットから発火されるイベント
    pub fn slotted(kind: &str, detail: impl Into<Value>) -> Self {
        Self {
            kind: kind.to_string(),
            target: None,
            detail: detail.into(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<Value>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// イベントハンドラ
pub type EventHandler = Rc<dyn Fn(&DomEvent)>;

/// 外部起因のプロパティ変更の通知 (ノード, プロパティ名, 新しい値)
pub type MutationCallback = Rc<dyn Fn(NodeId, &str, &Value)>;

/// リスナー解除用のハンドル
pub type HandlerId = u64;

/// エンジンが要素ツリーに要求する能力
///
/// エンジン側からの書き込み（set_attribute / set_property / set_text）は
/// 変更監視を発火させない。発火させるのは外部起因の変更だけ。
pub trait DomProvider {
    // ---- 構築 ----
    fn create_element(&self, tag: &str) -> NodeId;
    fn create_text(&self, text: &str) -> NodeId;
    fn append_child(&self, parent: NodeId, child: NodeId);

    // ---- 構造 ----
    fn kind(&self, node: NodeId) -> Option<NodeKind>;
    fn tag(&self, node: NodeId) -> Option<String>;
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    fn children(&self, node: NodeId) -> Vec<NodeId>;

    // ---- 属性・プロパティ ----
    fn attributes(&self, node: NodeId) -> Vec<(String, String)>;
    fn get_attribute(&self, node: NodeId, name: &str) -> Option<String>;
    fn set_attribute(&self, node: NodeId, name: &str, value: &str);
    fn remove_attribute(&self, node: NodeId, name: &str);
    /// プロパティが未設定なら同名属性の文字列値
    fn get_property(&self, node: NodeId, name: &str) -> Option<Value>;
    fn set_property(&self, node: NodeId, name: &str, value: Value);

    // ---- テキスト ----
    fn text(&self, node: NodeId) -> Option<String>;
    fn set_text(&self, node: NodeId, text: &str);

    // ---- イベント ----
    fn add_event_listener(&self, node: NodeId, kind: &str, handler: EventHandler) -> HandlerId;
    fn remove_event_listener(&self, node: NodeId, id: HandlerId);
    /// 対象要素から親へ向かって配送する
    fn dispatch_event(&self, event: &DomEvent);

    // ---- 変更監視 ----
    fn observe(&self, node: NodeId, callback: MutationCallback) -> HandlerId;
    fn unobserve(&self, node: NodeId, id: HandlerId);
}

/// 開始タグだけで閉じる要素
pub fn is_void_tag(tag: &str) -> bool {
    matches!(tag, "input" | "br" | "img" | "hr" | "meta" | "link")
}

/// ノードの位置を `template > div > input` の形で表す
pub fn element_path(dom: &dyn DomProvider, node: NodeId) -> String {
    let mut parts = Vec::new();
    let mut current = Some(node);
    while let Some(id) = current {
        match dom.kind(id) {
            Some(NodeKind::Element) => parts.push(dom.tag(id).unwrap_or_default()),
            Some(NodeKind::Text) => parts.push("#text".to_string()),
            None => break,
        }
        current = dom.parent(id);
    }
    parts.reverse();
    parts.join(" > ")
}
