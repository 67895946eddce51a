use std::collections::HashMap;

use regex::Regex;

use super::error::Diagnostic;
use crate::dom::{DomProvider, NodeId, NodeKind, element_path};
use crate::engine::binder::AttributeKind;
use crate::engine::binding::Direction;
use crate::engine::text::{TemplatePart, has_live_text, has_unterminated_placeholder, parse_template};

lazy_static::lazy_static! {
    // パスの各セグメント（識別子か配列添字）
    static ref SEGMENT: Regex = Regex::new(r"^(?:[A-Za-z_$][\w$]*|\d+)$").expect("segment pattern");
}

pub fn run_lints(dom: &dyn DomProvider, root: NodeId) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    let mut keys = HashMap::<String, Vec<String>>::new();

    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match dom.kind(node) {
            Some(NodeKind::Text) => {
                let text = dom.text(node).unwrap_or_default();
                check_template(&text, &element_path(dom, node), &mut diags);
            }
            Some(NodeKind::Element) => {
                let path = element_path(dom, node);
                for (name, value) in dom.attributes(node) {
                    let location = format!("{}[{}]", path, name);
                    if name == "key" {
                        keys.entry(value.clone()).or_default().push(location.clone());
                    }
                    check_attribute(&name, &value, &location, &mut diags);
                }
                let mut children = dom.children(node);
                children.reverse();
                stack.extend(children);
            }
            None => {}
        }
    }

    // 重複キーチェック
    let mut duplicated: Vec<_> = keys.into_iter().filter(|(_, locs)| locs.len() > 1).collect();
    duplicated.sort();
    for (key, locations) in duplicated {
        diags.push(
            Diagnostic::warning(format!(
                "key '{}' is used more than once ({} times); the last element wins",
                key,
                locations.len()
            ))
            .at(locations.join(", ")),
        );
    }

    diags
}

fn check_attribute(name: &str, value: &str, location: &str, diags: &mut Vec<Diagnostic>) {
    match AttributeKind::classify(name, value) {
        AttributeKind::EventHandler { path, .. } => {
            if path.is_empty() {
                diags.push(Diagnostic::error(format!("`{}` has an empty handler path", name)).at(location));
            } else if let Some(segment) = invalid_segment(&path) {
                diags.push(
                    Diagnostic::error(format!("handler path '{}' has an invalid segment '{}'", path, segment))
                        .at(location),
                );
            }
        }
        AttributeKind::Binding(expression) => {
            let mut chars = expression.chars();
            let path = match chars.next().and_then(Direction::from_marker) {
                Some(_) => chars.as_str(),
                None => expression.as_str(),
            };
            check_path(path, "binding", location, diags);
        }
        AttributeKind::Interpolated(template) => check_template(&template, location, diags),
        AttributeKind::Literal(literal) => {
            if has_unterminated_placeholder(&literal) {
                diags.push(Diagnostic::warning("unterminated placeholder is rendered literally").at(location));
            }
        }
    }
}

fn check_template(template: &str, location: &str, diags: &mut Vec<Diagnostic>) {
    if !has_live_text(template) {
        return;
    }
    if has_unterminated_placeholder(template) {
        diags.push(Diagnostic::error(format!("unterminated placeholder in \"{}\"", template)).at(location));
    }
    for part in parse_template(template) {
        let TemplatePart::Placeholder(path) = part else {
            continue;
        };
        match path.chars().next().and_then(Direction::from_marker) {
            Some(direction) => {
                diags.push(
                    Diagnostic::warning(format!(
                        "direction marker '{}' has no effect in placeholder {{{}}}",
                        direction.marker(),
                        path
                    ))
                    .at(location),
                );
                check_path(&path[1..], "placeholder", location, diags);
            }
            None => check_path(&path, "placeholder", location, diags),
        }
    }
}

fn check_path(path: &str, what: &str, location: &str, diags: &mut Vec<Diagnostic>) {
    let path = path.trim();
    if path.is_empty() {
        diags.push(Diagnostic::error(format!("empty {} path", what)).at(location));
    } else if let Some(segment) = invalid_segment(path) {
        diags.push(
            Diagnostic::error(format!("{} path '{}' has an invalid segment '{}'", what, path, segment)).at(location),
        );
    }
}

fn invalid_segment(path: &str) -> Option<String> {
    path.split('.')
        .map(str::trim)
        .find(|segment| !SEGMENT.is_match(segment))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::error::DiagnosticLevel;
    use crate::dom::MemoryDom;
    use crate::parser::parse_fragment;

    fn lint(source: &str) -> Vec<Diagnostic> {
        let dom = MemoryDom::new();
        let root = parse_fragment(&dom, source).expect("parse");
        run_lints(&dom, root)
    }

    #[test]
    fn test_clean_template() {
        let diags = lint(r#"<div key="main"><input value="@=user.name"><p>{items.0} {count}</p></div>"#);
        assert!(diags.is_empty(), "{:?}", diags);
    }

    #[test]
    fn test_malformed_binding_path() {
        let diags = lint(r#"<div><input value="@user..name"></div>"#);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].level, DiagnosticLevel::Error);
        assert_eq!(diags[0].location.as_deref(), Some("template > div > input[value]"));
    }

    #[test]
    fn test_empty_paths() {
        let diags = lint(r#"<button onclick=" ">go</button><input value="@=">"#);
        assert_eq!(diags.iter().filter(|d| d.is_error()).count(), 2);
    }

    #[test]
    fn test_unterminated_placeholder() {
        let diags = lint("<p>Hello {name</p>");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].is_error());
        assert_eq!(diags[0].location.as_deref(), Some("template > p > #text"));
    }

    #[test]
    fn test_direction_marker_in_placeholder() {
        let diags = lint("<p title=\"{=name}\"></p>");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].level, DiagnosticLevel::Warning);
    }

    #[test]
    fn test_duplicate_keys() {
        let diags = lint(r#"<div key="a"></div><span key="a"></span><p key="b"></p>"#);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].level, DiagnosticLevel::Warning);
        assert!(diags[0].message.contains("'a'"));
    }
}
