extern crate self as kizuna;

pub mod analysis;
pub mod dom;
pub mod engine;
pub mod parser;

use colored::*;
use std::env;
use std::path::PathBuf;
use log::{error, info, warn};

use dom::{DomProvider, NodeId};
use parser::{parse_fragment, parse_template_file};

pub use dom::{DomEvent, MemoryDom};
pub use engine::{
    BindError, BinderConfig, BindingExpression, ChangeEvent, Coercion, Computation, DerivedValue, Direction,
    ElementModel, LiveList, LiveObject, LiveText, LiveValue, ModelSchema, Observable, PropertyDescriptor,
    PropertyHost, TreeBinder, Value, View, LiveListView,
};
pub use kizuna_model_derive::LiveModel;

// ========================================
// コマンドライン引数構造体
// ========================================

/// コマンドライン引数の設定
#[derive(Debug)]
pub struct CliArgs {
    pub enable_lint: bool,
    pub enable_debug: bool,
    pub quiet: bool,  // panic以外のログを抑制
    pub log_level: LogLevel,
    /// 組み込みのデモテンプレートの代わりに読むファイル
    pub template: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLevel {
    Off,      // ログを一切表示しない（panicは除く）
    Error,    // エラーレベルのみ
    Warn,     // 警告レベル以上
    Info,     // 情報レベル以上
    Debug,    // デバッグレベル以上
    Trace,    // 全てのログ
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            enable_lint: true,
            enable_debug: false,
            quiet: false,
            log_level: LogLevel::Info,
            template: None,
        }
    }
}

pub fn parse_args() -> CliArgs {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        show_help();
        std::process::exit(0);
    }
    parse_args_from(&args)
}

/// 引数列から設定を組み立てる（プログラム名は含めない）
pub fn parse_args_from(args: &[String]) -> CliArgs {
    let mut cli_args = CliArgs::default();

    for arg in args {
        match arg.as_str() {
            "--no-lint" => cli_args.enable_lint = false,
            "--lint" => cli_args.enable_lint = true,
            "--debug" => {
                cli_args.enable_debug = true;
                cli_args.log_level = LogLevel::Debug;
            }
            "--quiet" | "-q" => {
                cli_args.quiet = true;
                cli_args.log_level = LogLevel::Off;
            }
            "--log-level=off" => cli_args.log_level = LogLevel::Off,
            "--log-level=error" => cli_args.log_level = LogLevel::Error,
            "--log-level=warn" => cli_args.log_level = LogLevel::Warn,
            "--log-level=info" => cli_args.log_level = LogLevel::Info,
            "--log-level=debug" => cli_args.log_level = LogLevel::Debug,
            "--log-level=trace" => cli_args.log_level = LogLevel::Trace,
            other => {
                if let Some(path) = other.strip_prefix("--template=") {
                    cli_args.template = Some(PathBuf::from(path));
                }
            }
        }
    }
    cli_args
}

pub fn show_help() {
    info!("Kizuna binding demo

USAGE:
    kizuna [OPTIONS]

OPTIONS:
    --lint/--no-lint         Enable/disable template lint (default: enabled)
    --debug                  Enable debug mode (implies --log-level=debug)
    --quiet, -q              Suppress all logs except panics
    --log-level=LEVEL        Set log level (off/error/warn/info/debug/trace)
    --template=PATH          Bind the demo model to a template file
    --help, -h               Show this help");
}

/// ログレベルを初期化する関数
pub fn init_logger(log_level: &LogLevel) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::sync::Once;

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let level = match log_level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        };

        let mut builder = Builder::from_default_env();

        if matches!(log_level, LogLevel::Off) {
            builder
                .filter_level(LevelFilter::Off)
                .format(|_, _| Ok(()))
                .try_init()
                .ok(); // エラーを無視
        } else {
            builder
                .filter_level(level)
                .format_timestamp_secs()
                .try_init()
                .ok(); // エラーを無視
        }
    });
}

/// 解析結果をログに出す。エラーがあれば true
pub fn report_diagnostics(result: &analysis::AnalysisResult) -> bool {
    for diag in &result.diagnostics {
        let loc = diag.location.as_deref().unwrap_or("");
        match diag.level {
            analysis::error::DiagnosticLevel::Error => {
                error!("[{:?}] {}", diag.level, format!("{} {}", loc, diag.message).red().bold())
            }
            analysis::error::DiagnosticLevel::Warning => {
                warn!("[{:?}] {}", diag.level, format!("{} {}", loc, diag.message).yellow().bold())
            }
            analysis::error::DiagnosticLevel::Info => {
                info!("[{:?}] {}", diag.level, format!("{} {}", loc, diag.message).blue())
            }
        }
    }

    let has_error = result.has_errors();
    if has_error {
        error!("\nLint errors found. Use --no-lint to skip lint checks.");
    }
    has_error
}

/// テンプレートファイルを読み込み、必要なら lint を掛ける
pub fn load_template<P: AsRef<std::path::Path>>(
    dom: &dyn DomProvider,
    path: P,
    enable_lint: bool,
    quiet: bool,
) -> Result<NodeId, String> {
    let root = parse_template_file(dom, &path)?;
    if enable_lint && !quiet {
        report_diagnostics(&analysis::analyze_tree(dom, root));
    }
    Ok(root)
}

// 埋め込まれたテンプレートをロードする関数
pub fn load_embedded_template(
    dom: &dyn DomProvider,
    source: &str,
    enable_lint: bool,
    quiet: bool,
) -> Result<NodeId, String> {
    let root = parse_fragment(dom, source)?;
    if enable_lint && !quiet {
        report_diagnostics(&analysis::analyze_tree(dom, root));
    }
    Ok(root)
}
