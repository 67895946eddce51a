pub mod markup;

use std::fs;
use std::path::Path;

use crate::dom::{DomProvider, NodeId};

pub use markup::parse_fragment;

// テンプレートファイルを読み込んでノードツリーにする
pub fn parse_template_file<P: AsRef<Path>>(dom: &dyn DomProvider, path: P) -> Result<NodeId, String> {
    let source = fs::read_to_string(path).map_err(|e| format!("IO error: {}", e))?;

    parse_fragment(dom, &source)
}
