use thiserror::Error;

/// バインド時のエラー
///
/// どちらも構築時に即座に失敗させる。実行中に黙って劣化させない。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    /// パスの途中のプロパティが存在しない
    #[error(
        "cannot resolve property '{property}' of path '{path}' on {context}{}",
        target.as_ref().map(|t| format!(" (binding target: {t})")).unwrap_or_default()
    )]
    Resolution {
        /// 探索元のコンテキストの型名
        context: String,
        property: String,
        path: String,
        target: Option<String>,
    },

    /// `on*` 属性のハンドラが見つからない、または関数ではない
    #[error("no handler method '{path}' on {context}")]
    Handler { context: String, path: String },
}

impl BindError {
    pub fn resolution(context: &str, property: &str, path: &str, target: Option<String>) -> Self {
        BindError::Resolution {
            context: context.to_string(),
            property: property.to_string(),
            path: path.to_string(),
            target,
        }
    }

    pub fn handler(context: &str, path: &str) -> Self {
        BindError::Handler {
            context: context.to_string(),
            path: path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = BindError::resolution("Person", "nmae", "nmae", Some("input.value".to_string()));
        assert_eq!(
            err.to_string(),
            "cannot resolve property 'nmae' of path 'nmae' on Person (binding target: input.value)"
        );
        let err = BindError::handler("Person", "save");
        assert_eq!(err.to_string(), "no handler method 'save' on Person");
    }
}
