//! Hinoki 式評価エンジンのコア機能
//!
//! このクレートは、停止中のターゲットで式を評価するための中核となるロジックを提供します。
//! 式中の名前の解決、実行時に渡す構造体のレイアウト、ターゲットメモリへの実体化と書き戻し、
//! 評価をまたいで残る永続変数を扱います。

pub mod breakpoint;
pub mod command;
pub mod context;
pub mod debugger;
pub mod decl;
pub mod decl_map;
pub mod errors;
pub mod expr_eval;
pub mod lookup;
pub mod materializer;
pub mod parse;
pub mod persistent;
pub mod session;
pub mod struct_layout;
pub mod variable;

pub use breakpoint::BreakpointCondition;
pub use command::Command;
pub use context::{ExecutionContext, FunctionKind, FunctionMatch, StackFrame};
pub use debugger::{Debugger, DebuggerFrame};
pub use decl::{DeclId, DeclKind, IrValue, NameSearchContext, NamedDecl, ParserAst};
pub use decl_map::{EntityRef, ExpressionDeclMap, StructElement};
pub use errors::{ExprError, ExprResult};
pub use expr_eval::{
    CaptureRunner, EvaluationOutcome, ExpressionEvaluator, ExpressionFrontend, ExpressionRunner,
    IdentifierFrontend, NoopRunner, StructPlan,
};
pub use persistent::{PersistentId, PersistentVariables};
pub use session::Session;
pub use struct_layout::StructInfo;
pub use variable::{ExpressionVariable, ExpressionVariableList, ValueLocation};

// 他のクレートから使用するために再エクスポート
pub use hinoki_target::StopReason;

/// デバッガの結果型
pub type Result<T> = anyhow::Result<T>;
