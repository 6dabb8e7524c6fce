//! デバッガのメインロジック
//!
//! ptrace で止めたプロセスと、実行ファイルの DWARF 情報を組み合わせて
//! 停止中のフレームを [`StackFrame`] として公開し、その上で式を評価します。

use crate::breakpoint::BreakpointCondition;
use crate::context::{ExecutionContext, FunctionKind, FunctionMatch, StackFrame};
use crate::decl::ParserAst;
use crate::decl_map::ExpressionDeclMap;
use crate::errors::{ERR_DWARF_NOT_LOADED, ERR_NOT_ATTACHED};
use crate::expr_eval::{CaptureRunner, EvaluationOutcome, ExpressionEvaluator, IdentifierFrontend};
use crate::persistent::PersistentId;
use crate::session::Session;
use crate::Result;
use hinoki_dwarf::{CompilerType, ContextId, DwarfModule, Encoding, TypeContext, Variable};
use hinoki_target::{Process, StopReason, TargetMemory};
use std::path::Path;
use tracing::{debug, info};

/// 停止中のプロセスのフレーム
///
/// PC とフレームベースは作成時点のレジスタから取る。
pub struct DebuggerFrame<'a> {
    module: &'a DwarfModule,
    pc: u64,
    frame_base: Option<u64>,
    load_bias: u64,
}

impl<'a> DebuggerFrame<'a> {
    pub fn new(module: &'a DwarfModule, pc: u64, frame_base: Option<u64>, load_bias: u64) -> Self {
        Self {
            module,
            pc,
            frame_base,
            load_bias,
        }
    }

    /// DWARF 上のアドレスに直した PC
    fn file_pc(&self) -> u64 {
        self.pc.wrapping_sub(self.load_bias)
    }

    fn globals(&self, name: &str, max_matches: usize) -> Vec<Variable> {
        self.module
            .find_globals(name)
            .into_iter()
            .take(max_matches)
            .cloned()
            .collect()
    }
}

impl StackFrame for DebuggerFrame<'_> {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn frame_base(&self) -> Option<u64> {
        self.frame_base
    }

    fn load_bias(&self) -> u64 {
        self.load_bias
    }

    fn find_local_variable(&self, name: &str) -> Option<Variable> {
        self.module.find_local(self.file_pc(), name).cloned()
    }

    fn find_module_globals(&self, name: &str, max_matches: usize) -> Vec<Variable> {
        self.globals(name, max_matches)
    }

    // 読み込むモジュールは1つだけ
    fn find_program_globals(&self, name: &str, max_matches: usize) -> Vec<Variable> {
        self.globals(name, max_matches)
    }

    fn find_functions_by_name(&self, name: &str) -> Vec<FunctionMatch> {
        let types = self.module.types();
        let functions = self.module.functions_named(name).into_iter().map(|f| FunctionMatch {
            name: f.name.clone(),
            address: f.range.0,
            kind: FunctionKind::Function {
                ty: types.compiler_type(f.ty),
            },
        });

        let symbols = self
            .module
            .symbols()
            .functions_named(name)
            .into_iter()
            .map(|sym| FunctionMatch {
                name: sym.display_name().to_string(),
                address: sym.address,
                kind: FunctionKind::Symbol {
                    external: sym.external,
                },
            });

        functions.chain(symbols).collect()
    }

    fn find_type_by_name(&self, name: &str) -> Option<CompilerType> {
        self.module.find_type(name)
    }

    fn type_context(&self, id: ContextId) -> Option<&TypeContext> {
        let types = self.module.types();
        (types.id() == id).then_some(types)
    }
}

fn load_bias(process: &Process, module: &DwarfModule) -> Result<u64> {
    if module.loader().is_pie() {
        process.memory().get_base_address()
    } else {
        Ok(0)
    }
}

/// 停止中のレジスタからフレームを作る
///
/// フレームベースは RBP とする。
fn current_frame<'a>(process: &Process, module: &'a DwarfModule) -> Result<DebuggerFrame<'a>> {
    let registers = process.registers();
    let frame = DebuggerFrame::new(
        module,
        registers.get_pc()?,
        Some(registers.get_rbp()?),
        load_bias(process, module)?,
    );
    debug!("frame at pc 0x{:x} (file 0x{:x})", frame.pc, frame.file_pc());
    Ok(frame)
}

/// デバッガ
pub struct Debugger {
    /// デバッグ対象プロセス
    process: Option<Process>,
    /// 実行ファイルのデバッグ情報
    module: Option<DwarfModule>,
    /// 評価をまたいで残る状態
    session: Session,
    /// 停止時に評価する条件
    condition: BreakpointCondition,
}

impl Debugger {
    /// 新しいデバッガを作成する
    pub fn new() -> Self {
        Self {
            process: None,
            module: None,
            session: Session::new(),
            condition: BreakpointCondition::default(),
        }
    }

    fn require_process(&self) -> Result<&Process> {
        self.process
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))
    }

    fn require_module(&self) -> Result<&DwarfModule> {
        self.module
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_DWARF_NOT_LOADED))
    }

    /// 実行可能ファイルを起動してデバッグを開始する
    ///
    /// プロセスはexecve直後に停止状態で開始されます。
    pub fn spawn<P: AsRef<Path>>(&mut self, program: P, args: &[String]) -> Result<()> {
        let process = Process::spawn(program, args)?;
        info!("spawned pid {}", process.pid());
        self.process = Some(process);
        Ok(())
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(&mut self, pid: i32) -> Result<()> {
        let process = Process::attach(pid)?;
        info!("attached to pid {}", pid);
        self.process = Some(process);
        Ok(())
    }

    /// ELFバイナリからDWARF情報を読み込む
    ///
    /// 型は新しく払い出した型コンテキストに登録される。
    pub fn load_binary<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let context = self.session.allocate_context_id();
        let module = DwarfModule::load(path, context)?;
        self.module = Some(module);
        Ok(())
    }

    /// プロセスを実行継続する
    pub fn continue_execution(&self) -> Result<StopReason> {
        self.require_process()?.continue_and_wait()
    }

    /// 1命令だけ実行する
    pub fn step(&self) -> Result<StopReason> {
        self.require_process()?.step()
    }

    /// プログラムカウンタを取得する
    pub fn get_pc(&self) -> Result<u64> {
        self.require_process()?.registers().get_pc()
    }

    /// 実行時アドレスを含む関数名（DWARF になければシンボル表から）
    pub fn function_name_at(&self, pc: u64) -> Result<Option<String>> {
        let module = self.require_module()?;
        let file_pc = pc.wrapping_sub(self.load_bias()?);

        if let Some(function) = module.function_at(file_pc) {
            return Ok(Some(function.name.clone()));
        }
        Ok(module
            .symbols()
            .reverse_resolve(file_pc)
            .map(|sym| sym.display_name().to_string()))
    }

    /// ロードバイアス（PIE ならベースアドレス）
    pub fn load_bias(&self) -> Result<u64> {
        load_bias(self.require_process()?, self.require_module()?)
    }

    /// 現在の停止位置のフレームを作る
    pub fn frame(&self) -> Result<DebuggerFrame<'_>> {
        current_frame(self.require_process()?, self.require_module()?)
    }

    /// 式中の変数を取り込み、最初の変数の値を結果の永続変数に残す
    pub fn capture(&mut self, expr: &str) -> Result<EvaluationOutcome> {
        let Self {
            process,
            module,
            session,
            ..
        } = self;
        let process = process.as_ref().ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        let module = module.as_ref().ok_or_else(|| anyhow::anyhow!(ERR_DWARF_NOT_LOADED))?;
        let frame = current_frame(process, module)?;
        let exe_ctx = ExecutionContext::new(process, process, &frame);

        let outcome = ExpressionEvaluator::new(session).evaluate(
            expr,
            &mut IdentifierFrontend::with_result(),
            &mut CaptureRunner,
            &exe_ctx,
        )?;
        Ok(outcome)
    }

    /// 64ビット符号付き整数の永続変数を作る
    ///
    /// プロセスがあればそのバイトオーダーで格納する。
    pub fn set_integer(&mut self, name: &str, value: u64) -> Result<PersistentId> {
        let Self {
            process, session, ..
        } = self;
        let exe_ctx = ExecutionContext {
            process: process.as_ref().map(|p| p as &dyn TargetMemory),
            ..Default::default()
        };

        let mut ast = ParserAst::new(session.allocate_context_id());
        let ty = ast.types_mut().builtin_for_encoding(Encoding::Signed, 64);

        let mut map = ExpressionDeclMap::new(session);
        map.will_parse(&exe_ctx);
        let created = map.build_integer_variable(name, &ast, ty, value);
        map.did_parse();
        Ok(created?)
    }

    /// 停止条件を設定する（`None` で解除）
    pub fn set_condition(&mut self, text: Option<&str>) {
        self.condition.set_condition(text);
    }

    pub fn condition(&self) -> &BreakpointCondition {
        &self.condition
    }

    /// 現在の停止位置で条件を評価する
    ///
    /// 条件がなければ `false`。
    pub fn condition_says_stop(&mut self) -> Result<bool> {
        if self.condition.condition_text().is_none() {
            return Ok(false);
        }

        let Self {
            process,
            module,
            session,
            condition,
        } = self;
        let process = process.as_ref().ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        let module = module.as_ref().ok_or_else(|| anyhow::anyhow!(ERR_DWARF_NOT_LOADED))?;
        let frame = current_frame(process, module)?;
        let exe_ctx = ExecutionContext::new(process, process, &frame);

        let stop = condition.condition_says_stop(
            session,
            &mut IdentifierFrontend::with_result(),
            &mut CaptureRunner,
            &exe_ctx,
        )?;
        Ok(stop)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}
