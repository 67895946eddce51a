pub mod error;
pub mod lint;

use crate::dom::{DomProvider, NodeId};

use error::{Diagnostic, DiagnosticLevel};
use lint::run_lints;

#[derive(Debug, Default)]
pub struct AnalysisResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl AnalysisResult {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.level == DiagnosticLevel::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.level == DiagnosticLevel::Warning)
    }
}

/// バインド前にテンプレートツリーを検査する
pub fn analyze_tree(dom: &dyn DomProvider, root: NodeId) -> AnalysisResult {
    let diagnostics = run_lints(dom, root);
    log::debug!("analysis finished with {} diagnostics", diagnostics.len());
    AnalysisResult { diagnostics }
}
