// ========================================
// マークアップパーサー
// ========================================
//
// HTML 風のテンプレート文字列を DomProvider 上のノードツリーに組み立てる。
// 戻り値は `template` 要素で、解析した全ノードはその子になる。

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::dom::{DomProvider, NodeId, is_void_tag};

#[derive(Parser)]
#[grammar = "parser/markup.pest"]
pub struct MarkupParser;

/// 開始タグの内容
#[derive(Debug, Clone, PartialEq)]
struct OpenTag {
    name: String,
    attributes: Vec<(String, String)>,
    self_closing: bool,
}

/// テンプレート文字列をノードツリーにする
///
/// * 空白だけのテキストは捨てる
/// * void 要素（input, br など）は終了タグを持たない
/// * 対応しない終了タグ・閉じられていない要素はエラー
pub fn parse_fragment(dom: &dyn DomProvider, source: &str) -> Result<NodeId, String> {
    log::debug!("parsing template, length: {} chars", source.len());

    let document = MarkupParser::parse(Rule::document, source)
        .map_err(|e| format!("構文解析エラー: {}", e))?
        .next()
        .ok_or_else(|| "ドキュメントが空です".to_string())?;

    let root = dom.create_element("template");
    let mut stack: Vec<(String, NodeId)> = vec![("template".to_string(), root)];

    for pair in document.into_inner() {
        let parent = stack.last().map(|(_, node)| *node).unwrap_or(root);
        match pair.as_rule() {
            Rule::text => {
                let raw = pair.as_str();
                if raw.trim().is_empty() {
                    continue;
                }
                let node = dom.create_text(&decode_entities(raw));
                dom.append_child(parent, node);
            }
            Rule::open_tag => {
                let tag = parse_open_tag(pair);
                let node = dom.create_element(&tag.name);
                for (name, value) in &tag.attributes {
                    dom.set_attribute(node, name, value);
                }
                dom.append_child(parent, node);
                if !tag.self_closing && !is_void_tag(&tag.name) {
                    stack.push((tag.name, node));
                }
            }
            Rule::close_tag => {
                let name = tag_name(pair);
                if is_void_tag(&name) {
                    continue;
                }
                if stack.len() <= 1 {
                    return Err(format!("対応する開始タグのない終了タグ </{}>", name));
                }
                let open = stack.last().map(|(open, _)| open.clone()).unwrap_or_default();
                if open != name {
                    return Err(format!("終了タグ </{}> が <{}> と対応していません", name, open));
                }
                stack.pop();
            }
            Rule::comment | Rule::EOI => {}
            rule => log::trace!("ignored rule {:?}", rule),
        }
    }

    if stack.len() > 1 {
        let unclosed: Vec<_> = stack[1..].iter().map(|(name, _)| format!("<{}>", name)).collect();
        return Err(format!("閉じられていない要素: {}", unclosed.join(", ")));
    }

    log::debug!("parsed {} top-level nodes", dom.children(root).len());
    Ok(root)
}

fn tag_name(pair: Pair<Rule>) -> String {
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::tag_name)
        .map(|p| p.as_str().to_ascii_lowercase())
        .unwrap_or_default()
}

fn parse_open_tag(pair: Pair<Rule>) -> OpenTag {
    let mut tag = OpenTag {
        name: String::new(),
        attributes: Vec::new(),
        self_closing: false,
    };
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::tag_name => tag.name = inner.as_str().to_ascii_lowercase(),
            Rule::self_close => tag.self_closing = true,
            Rule::attribute => tag.attributes.push(parse_attribute(inner)),
            _ => {}
        }
    }
    tag
}

fn parse_attribute(pair: Pair<Rule>) -> (String, String) {
    let mut name = String::new();
    let mut value = String::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::attr_name => name = inner.as_str().to_ascii_lowercase(),
            Rule::dq_value | Rule::sq_value | Rule::bare_value => value = decode_entities(inner.as_str()),
            _ => {}
        }
    }
    (name, value)
}

/// 基本的な文字参照だけを戻す
fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{MemoryDom, NodeKind};

    #[test]
    fn test_parse_nested_elements() {
        let dom = MemoryDom::new();
        let root = parse_fragment(
            &dom,
            r#"
            <div class="card">
                <input value="@=name" disabled>
                <p title='Hi {name}'>Count: {count}</p>
            </div>
            "#,
        )
        .expect("parse");

        assert_eq!(dom.tag(root).as_deref(), Some("template"));
        let div = dom.children(root)[0];
        assert_eq!(dom.get_attribute(div, "class").as_deref(), Some("card"));

        let children = dom.children(div);
        assert_eq!(children.len(), 2);
        assert_eq!(dom.get_attribute(children[0], "value").as_deref(), Some("@=name"));
        assert_eq!(dom.get_attribute(children[0], "disabled").as_deref(), Some(""));
        assert_eq!(dom.get_attribute(children[1], "title").as_deref(), Some("Hi {name}"));

        let text = dom.children(children[1])[0];
        assert_eq!(dom.kind(text), Some(NodeKind::Text));
        assert_eq!(dom.text(text).as_deref(), Some("Count: {count}"));
    }

    #[test]
    fn test_void_and_self_closing() {
        let dom = MemoryDom::new();
        let root = parse_fragment(&dom, r#"<p>a<br>b<img src="x.png"/></p><hr />"#).expect("parse");
        let top = dom.children(root);
        assert_eq!(top.len(), 2);
        assert_eq!(dom.children(top[0]).len(), 4);
        assert_eq!(dom.to_html(top[0]), "<p>a<br>b<img src=\"x.png\"></p>");
    }

    #[test]
    fn test_comments_and_entities() {
        let dom = MemoryDom::new();
        let root = parse_fragment(&dom, "<!-- note --><span>a &lt; b</span>").expect("parse");
        let span = dom.children(root)[0];
        assert_eq!(dom.text_content(span), "a < b");
    }

    #[test]
    fn test_mismatched_close_tag() {
        let dom = MemoryDom::new();
        let err = parse_fragment(&dom, "<div><span></div>").expect_err("mismatch");
        assert!(err.contains("</div>"));

        let err = parse_fragment(&dom, "<div>").expect_err("unclosed");
        assert!(err.contains("<div>"));

        assert!(parse_fragment(&dom, "</p>").is_err());
    }

    #[test]
    fn test_syntax_error() {
        let dom = MemoryDom::new();
        assert!(parse_fragment(&dom, "<div a=\"1></div>").is_err());
    }
}
