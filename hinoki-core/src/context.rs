//! 実行コンテキスト
//!
//! 式の評価は停止中のスタックフレームを基準に行います。
//! フレームから見える変数・関数・型の検索は [`StackFrame`] トレイトとして抽象化し、
//! DWARF を読むデバッガ本体とテスト用のフレームの両方が実装します。

use crate::errors::{ExprError, ExprResult};
use hinoki_dwarf::{CompilerType, ContextId, TypeContext, Variable};
use hinoki_target::{RegisterContext, TargetMemory};

/// 名前で見つかった関数の種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionKind {
    /// デバッグ情報のある関数
    Function { ty: CompilerType },
    /// シンボルテーブルにしかない関数
    Symbol { external: bool },
}

/// 関数検索の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionMatch {
    pub name: String,
    /// ファイル上のアドレス
    pub address: u64,
    pub kind: FunctionKind,
}

/// 停止中のスタックフレーム
pub trait StackFrame {
    /// 現在の PC（ロードアドレス）
    fn pc(&self) -> u64;

    /// フレームベース（DW_OP_fbreg の基準）
    fn frame_base(&self) -> Option<u64>;

    /// モジュールのロードバイアス
    fn load_bias(&self) -> u64;

    /// フレームのレキシカルスコープから変数を探す
    fn find_local_variable(&self, name: &str) -> Option<Variable>;

    /// フレームが属するモジュールのグローバル変数
    fn find_module_globals(&self, name: &str, max_matches: usize) -> Vec<Variable>;

    /// 読み込まれている全モジュールのグローバル変数
    fn find_program_globals(&self, name: &str, max_matches: usize) -> Vec<Variable>;

    fn find_functions_by_name(&self, name: &str) -> Vec<FunctionMatch>;

    fn find_type_by_name(&self, name: &str) -> Option<CompilerType>;

    /// 型コンテキストを ID で取得する
    fn type_context(&self, id: ContextId) -> Option<&TypeContext>;
}

/// 実行コンテキスト
///
/// どの要素も欠けていてよい。必要な操作で `require_*` を使う。
#[derive(Clone, Copy, Default)]
pub struct ExecutionContext<'a> {
    pub process: Option<&'a dyn TargetMemory>,
    pub registers: Option<&'a dyn RegisterContext>,
    pub frame: Option<&'a dyn StackFrame>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        process: &'a dyn TargetMemory,
        registers: &'a dyn RegisterContext,
        frame: &'a dyn StackFrame,
    ) -> Self {
        Self {
            process: Some(process),
            registers: Some(registers),
            frame: Some(frame),
        }
    }

    /// フレームを外したコンテキスト
    pub fn without_frame(self) -> Self {
        Self { frame: None, ..self }
    }

    pub fn require_process(&self) -> ExprResult<&'a dyn TargetMemory> {
        self.process.ok_or(ExprError::NoProcess)
    }

    pub fn require_frame(&self) -> ExprResult<&'a dyn StackFrame> {
        self.frame.ok_or(ExprError::NullFrame)
    }

    pub fn require_registers(&self, what: &str) -> ExprResult<&'a dyn RegisterContext> {
        self.registers
            .ok_or_else(|| ExprError::NoRegisterContext(what.to_string()))
    }
}
