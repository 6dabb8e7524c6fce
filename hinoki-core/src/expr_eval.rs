//! 式評価パイプライン
//!
//! 構文解析 → レイアウト → 実体化 → 実行 → 逆実体化 を順に行います。
//! 構文解析と実行はトレイトで差し替えられ、実行が失敗しても逆実体化は必ず行います。

use crate::context::ExecutionContext;
use crate::decl::{DeclKind, IrValue, NameSearchContext, ParserAst};
use crate::decl_map::{ExpressionDeclMap, StructElement};
use crate::errors::{ExprError, ExprResult};
use crate::persistent::PersistentId;
use crate::session::Session;
use crate::struct_layout::StructInfo;
use hinoki_dwarf::{TypeContext, TypeId};
use hinoki_target::{read_exact, write_all};
use tracing::{debug, info};

/// 構文解析・型検査・IR 書き換え
///
/// 名前解決には [`ExpressionDeclMap::get_decls`] を使い、構造体に入れる値を
/// [`ExpressionDeclMap::add_value_to_struct`] で登録する。
pub trait ExpressionFrontend {
    fn parse(
        &mut self,
        text: &str,
        map: &mut ExpressionDeclMap<'_>,
        ast: &mut ParserAst,
        exe_ctx: &ExecutionContext,
    ) -> ExprResult<()>;
}

/// 停止中のターゲットで式を実行する
pub trait ExpressionRunner {
    fn run(&mut self, exe_ctx: &ExecutionContext, plan: &StructPlan) -> ExprResult<()>;
}

/// 実行時に渡される構造体の配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructPlan {
    /// 実体化した構造体のアドレス（メンバがなければ `None`）
    pub address: Option<u64>,
    pub info: StructInfo,
    pub elements: Vec<StructElement>,
}

impl StructPlan {
    /// 名前でメンバを探す
    pub fn element(&self, name: &str) -> Option<&StructElement> {
        self.elements.iter().find(|element| element.name == name)
    }
}

/// 評価結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationOutcome {
    /// 結果の永続変数
    pub result: Option<PersistentId>,
    pub result_name: Option<String>,
    /// 結果の値（ターゲットのバイトオーダー）
    pub result_bytes: Option<Vec<u8>>,
    pub info: StructInfo,
}

/// 式評価器
pub struct ExpressionEvaluator<'s> {
    session: &'s mut Session,
}

impl<'s> ExpressionEvaluator<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        Self { session }
    }

    /// 式を評価する
    pub fn evaluate(
        &mut self,
        text: &str,
        frontend: &mut dyn ExpressionFrontend,
        runner: &mut dyn ExpressionRunner,
        exe_ctx: &ExecutionContext,
    ) -> ExprResult<EvaluationOutcome> {
        let mut ast = ParserAst::new(self.session.allocate_context_id());
        let (result, info) = {
            let mut map = ExpressionDeclMap::new(&mut *self.session);
            Self::drive(&mut map, &mut ast, text, frontend, runner, exe_ctx)?
        };

        let persistent = self.session.persistent_variables();
        let result_var = result.and_then(|id| persistent.get(id));
        Ok(EvaluationOutcome {
            result,
            result_name: result_var.map(|var| var.name.clone()),
            result_bytes: result_var.and_then(|var| var.value_bytes().map(<[u8]>::to_vec)),
            info,
        })
    }

    fn drive(
        map: &mut ExpressionDeclMap<'_>,
        ast: &mut ParserAst,
        text: &str,
        frontend: &mut dyn ExpressionFrontend,
        runner: &mut dyn ExpressionRunner,
        exe_ctx: &ExecutionContext,
    ) -> ExprResult<(Option<PersistentId>, StructInfo)> {
        map.will_parse(exe_ctx);
        let parsed = frontend
            .parse(text, map, ast, exe_ctx)
            .and_then(|()| map.do_struct_layout())
            .and_then(|()| Self::plan(map));
        map.did_parse();
        let mut plan = parsed?;

        debug!(
            "evaluating '{}' with {} struct members",
            text, plan.info.num_elements
        );

        plan.address = match map.materialize(exe_ctx) {
            Ok(address) => address,
            Err(e) => {
                if let Err(cleanup) = map.dematerialize(exe_ctx) {
                    debug!("cleanup after a failed materialize: {}", cleanup);
                }
                return Err(e);
            }
        };

        let ran = runner.run(exe_ctx, &plan);
        let dematerialized = map.dematerialize(exe_ctx);
        ran?;
        let result = dematerialized?;

        info!("evaluated '{}'", text);
        Ok((result, plan.info))
    }

    /// 構文解析用の作業領域が消える前に、メンバの配置を控えておく
    fn plan(map: &ExpressionDeclMap<'_>) -> ExprResult<StructPlan> {
        let info = map.get_struct_info()?;
        let mut elements = Vec::with_capacity(info.num_elements);
        for index in 0..info.num_elements {
            if let Some(element) = map.get_struct_element(index)? {
                elements.push(element);
            }
        }
        Ok(StructPlan {
            address: None,
            info,
            elements,
        })
    }
}

/// 式中の識別子をそのまま構造体メンバとして取り込むフロントエンド
///
/// 構文は解釈せず、識別子を出現順に名前解決する。
/// `with_result` を指定すると、最初に取り込んだ変数と同じ型の結果変数を末尾に追加する。
#[derive(Debug, Default)]
pub struct IdentifierFrontend {
    with_result: bool,
}

impl IdentifierFrontend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result() -> Self {
        Self { with_result: true }
    }
}

/// 識別子を出現順に重複なく取り出す
pub fn scan_identifiers(text: &str) -> Vec<&str> {
    let is_start = |c: char| c.is_ascii_alphabetic() || c == '_' || c == '$';
    let is_continue = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$';

    let mut identifiers: Vec<&str> = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c.is_ascii_digit() {
            // 数値リテラルの残り（0x1f など）を読み飛ばす
            while chars.next_if(|&(_, c)| is_continue(c)).is_some() {}
            continue;
        }
        if !is_start(c) {
            continue;
        }
        let mut end = start + c.len_utf8();
        while let Some((index, c)) = chars.next_if(|&(_, c)| is_continue(c)) {
            end = index + c.len_utf8();
        }
        let identifier = &text[start..end];
        if !identifiers.contains(&identifier) {
            identifiers.push(identifier);
        }
    }
    identifiers
}

/// 型のサイズとアラインメント
///
/// どちらかが分からなければ (0, 0) を返し、レイアウトで失敗させる。
fn member_layout(types: &TypeContext, ty: TypeId) -> (u64, u64) {
    match (types.byte_size(ty), types.alignment(ty)) {
        (Some(size), Some(alignment)) => (size, alignment),
        _ => (0, 0),
    }
}

impl ExpressionFrontend for IdentifierFrontend {
    fn parse(
        &mut self,
        text: &str,
        map: &mut ExpressionDeclMap<'_>,
        ast: &mut ParserAst,
        exe_ctx: &ExecutionContext,
    ) -> ExprResult<()> {
        let mut next_value = 0u64;
        let mut result_type = None;

        for name in scan_identifiers(text) {
            let decls = {
                let mut ctx = NameSearchContext::new(ast, name);
                map.get_decls(&mut ctx, exe_ctx);
                ctx.decls().to_vec()
            };
            if decls.is_empty() {
                return Err(ExprError::Parse(format!("use of undeclared identifier '{}'", name)));
            }

            for decl in decls {
                let Some(DeclKind::Variable { ty }) = ast.decl(decl).map(|d| d.kind.clone()) else {
                    continue;
                };
                let (size, alignment) = member_layout(ast.types(), ty);
                if map.add_value_to_struct(decl, name, IrValue(next_value), size, alignment) {
                    next_value += 1;
                    result_type.get_or_insert(ty);
                }
            }
        }

        if self.with_result {
            let ty = result_type.ok_or(ExprError::NoResult)?;
            let name = map.persistent_result_name();
            let decl = NameSearchContext::new(ast, &name).add_var_decl(ty);
            map.add_persistent_variable(decl, &name, ast, ty)?;

            let (size, alignment) = member_layout(ast.types(), ty);
            if !map.add_value_to_struct(decl, &name, IrValue(next_value), size, alignment) {
                return Err(ExprError::Parse(format!("couldn't add {} to the struct", name)));
            }
        }
        Ok(())
    }
}

/// 何もしない実行器（構造体の実体化と書き戻しだけを行う）
#[derive(Debug, Default)]
pub struct NoopRunner;

impl ExpressionRunner for NoopRunner {
    fn run(&mut self, _exe_ctx: &ExecutionContext, _plan: &StructPlan) -> ExprResult<()> {
        Ok(())
    }
}

/// 最初のメンバの値を、末尾のメンバ（結果変数）にコピーする実行器
///
/// [`IdentifierFrontend::with_result`] と組み合わせて、変数の値を永続変数に取り込む。
#[derive(Debug, Default)]
pub struct CaptureRunner;

impl ExpressionRunner for CaptureRunner {
    fn run(&mut self, exe_ctx: &ExecutionContext, plan: &StructPlan) -> ExprResult<()> {
        let (Some(address), [first, .., last]) = (plan.address, plan.elements.as_slice()) else {
            return Ok(());
        };
        let process = exe_ctx.require_process()?;

        let size = plan.info.size.saturating_sub(last.offset) as usize;
        let mut data = vec![0u8; size];
        read_exact(process, address + first.offset, &mut data)
            .and_then(|()| write_all(process, address + last.offset, &data))
            .map_err(|e| ExprError::Execution(e.to_string()))?;

        debug!("copied {} into {} ({} bytes)", first.name, last.name, size);
        Ok(())
    }
}
