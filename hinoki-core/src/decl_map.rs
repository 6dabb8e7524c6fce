//! 式の宣言マップ
//!
//! 1つの式の評価に必要な状態をまとめて持ちます。
//!
//! - 構文解析中: 名前解決で見つかった実体（[`ExpressionDeclMap::get_decls`]）
//! - IR 書き換え中: 引数構造体のメンバ登録とレイアウト
//! - 実行前後: 構造体の実体化と逆実体化
//!
//! 実体は、この式だけで使う「見つかった実体」と、セッションの永続変数のどちらか一方に置かれ、
//! それ以外の場所からは [`EntityRef`] で参照します。

use crate::context::ExecutionContext;
use crate::decl::{DeclId, IrValue, ParserAst};
use crate::errors::{ExprError, ExprResult};
use crate::lookup::guarded_copy_type;
use crate::persistent::PersistentId;
use crate::session::Session;
use crate::struct_layout::{compute_layout, MemberSpec, StructInfo};
use crate::variable::{ExpressionVariable, ExpressionVariableList, JitVars, ValueLocation};
use hinoki_dwarf::{CompilerType, TypeId};
use hinoki_target::ByteOrder;
use std::cell::Cell;
use tracing::{debug, warn};

/// 実体への参照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    /// この式の名前解決で見つかった実体
    Found(usize),
    /// セッションの永続変数
    Persistent(PersistentId),
}

/// 構造体メンバ1つ分の情報（IR 書き換え向け）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructElement {
    pub decl: DeclId,
    pub ir_value: IrValue,
    pub offset: u64,
    pub name: String,
}

/// 構文解析中の状態
#[derive(Debug)]
pub(crate) struct ParserState {
    pub(crate) byte_order: ByteOrder,
    pub(crate) address_byte_size: u32,
    /// 型コピー中に発生した名前検索を無視するためのフラグ
    pub(crate) importing: Cell<bool>,
}

/// 構造体の状態
#[derive(Debug, Default)]
pub(crate) struct StructVars {
    pub(crate) members: Vec<EntityRef>,
    pub(crate) laid_out: bool,
    pub(crate) size: u64,
    pub(crate) alignment: u64,
    pub(crate) result_name: Option<String>,
    /// `this` / `self` の型（デバッグ対象側）
    pub(crate) object_pointer_type: Option<CompilerType>,
}

/// 実体化の状態
#[derive(Debug, Default)]
pub(crate) struct MaterialVars {
    /// 確保した領域の先頭
    pub(crate) allocated_area: Option<u64>,
    /// アラインメント調整後の構造体アドレス
    pub(crate) materialized_location: Option<u64>,
    /// 実体化を終えたメンバの数
    pub(crate) materialized_count: usize,
}

/// 式の宣言マップ
///
/// セッションを評価の間ずっと可変借用するため、1つのセッションで同時に2つの式は評価できない。
pub struct ExpressionDeclMap<'s> {
    pub(crate) session: &'s mut Session,
    pub(crate) found_entities: ExpressionVariableList,
    pub(crate) parser: Option<ParserState>,
    pub(crate) struct_vars: StructVars,
    pub(crate) material: Option<MaterialVars>,
}

impl<'s> ExpressionDeclMap<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        Self {
            session,
            found_entities: ExpressionVariableList::new(),
            parser: None,
            struct_vars: StructVars::default(),
            material: None,
        }
    }

    /// 構文解析を開始する
    pub fn will_parse(&mut self, exe_ctx: &ExecutionContext) {
        let (byte_order, address_byte_size) = match exe_ctx.process {
            Some(process) => (process.byte_order(), process.address_byte_size()),
            None => (ByteOrder::native(), std::mem::size_of::<u64>() as u32),
        };
        self.parser = Some(ParserState {
            byte_order,
            address_byte_size,
            importing: Cell::new(false),
        });
    }

    /// 構文解析を終了し、実体と永続変数の構文解析用の作業領域を破棄する
    pub fn did_parse(&mut self) {
        if self.parser.is_none() {
            return;
        }
        for var in self.found_entities.iter_mut() {
            var.disable_parser_vars();
        }
        for var in self.session.persistent_variables_mut().iter_mut() {
            var.disable_parser_vars();
        }
        self.parser = None;
    }

    /// 構文解析中か
    pub fn is_parsing(&self) -> bool {
        self.parser.is_some()
    }

    /// 永続変数を作るときのバイトオーダーとアドレス幅
    ///
    /// 構文解析中でなければホストの値を使う。
    pub(crate) fn target_layout(&self) -> (ByteOrder, u32) {
        match &self.parser {
            Some(parser) => (parser.byte_order, parser.address_byte_size),
            None => (ByteOrder::native(), std::mem::size_of::<u64>() as u32),
        }
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    /// 結果変数の名前（マップごとに1回だけ払い出す）
    pub fn persistent_result_name(&mut self) -> String {
        if let Some(name) = &self.struct_vars.result_name {
            return name.clone();
        }
        let name = self
            .session
            .persistent_variables_mut()
            .next_persistent_variable_name();
        self.struct_vars.result_name = Some(name.clone());
        name
    }

    /// パーサの型をスクラッチ型コンテキストにコピーし、永続変数を作る
    fn create_persistent(&mut self, name: &str, ast: &ParserAst, parser_type: TypeId) -> ExprResult<PersistentId> {
        let (byte_order, address_byte_size) = self.target_layout();
        let importing = self.parser.as_ref().map(|parser| &parser.importing);
        let (persistent, scratch) = self.session.split_mut();

        let user_id = guarded_copy_type(importing, scratch, ast.types(), parser_type)
            .ok_or_else(|| ExprError::TypeCopy(name.to_string()))?;
        let byte_size = scratch
            .byte_size(user_id)
            .ok_or_else(|| ExprError::MissingLayoutInfo(name.to_string()))?;
        let user_type = scratch.compiler_type(user_id);

        persistent.create(name, user_type, byte_size, byte_order, address_byte_size)
    }

    /// 宣言に対応する永続変数を作る
    pub fn add_persistent_variable(
        &mut self,
        decl: DeclId,
        name: &str,
        ast: &ParserAst,
        parser_type: TypeId,
    ) -> ExprResult<PersistentId> {
        let id = self.create_persistent(name, ast, parser_type)?;
        if let Some(var) = self.session.persistent_variables_mut().get_mut(id) {
            let parser_vars = var.enable_parser_vars();
            parser_vars.named_decl = Some(decl);
            parser_vars.parser_type = Some(parser_type);
        }
        debug!("added persistent variable {} for {:?}", name, decl);
        Ok(id)
    }

    /// 整数値を持つ永続変数を作る
    ///
    /// 値は変数のバイトサイズに切り詰め、ターゲットのバイトオーダーで格納する。
    pub fn build_integer_variable(
        &mut self,
        name: &str,
        ast: &ParserAst,
        parser_type: TypeId,
        value: u64,
    ) -> ExprResult<PersistentId> {
        let id = self.create_persistent(name, ast, parser_type)?;
        if let Some(var) = self.session.persistent_variables_mut().get_mut(id) {
            let byte_order = var.byte_order;
            let encoded = byte_order.encode_u64(value, var.byte_size as usize);
            if let Some(bytes) = var.value_bytes_mut() {
                // 8バイトより大きい型では、値を下位側に置き残りはゼロのまま
                let start = match byte_order {
                    ByteOrder::Little => 0,
                    ByteOrder::Big => bytes.len() - encoded.len(),
                };
                bytes[start..start + encoded.len()].copy_from_slice(&encoded);
            }
        }
        Ok(id)
    }

    /// 宣言から実体を探す（見つかった実体を優先）
    fn entity_for_decl(&self, decl: DeclId) -> Option<EntityRef> {
        self.found_entities
            .find_by_decl(decl)
            .map(EntityRef::Found)
            .or_else(|| {
                self.session
                    .persistent_variables()
                    .get_by_decl(decl)
                    .map(EntityRef::Persistent)
            })
    }

    /// 実体を構造体のメンバとして登録する
    ///
    /// 宣言に対応する実体がなければ `false`。登録済みなら何もしない（レイアウトも無効にしない）。
    pub fn add_value_to_struct(
        &mut self,
        decl: DeclId,
        name: &str,
        ir_value: IrValue,
        size: u64,
        alignment: u64,
    ) -> bool {
        let Some(entity) = self.entity_for_decl(decl) else {
            debug!("no entity for {} ({:?})", name, decl);
            return false;
        };

        if self.struct_vars.members.contains(&entity) {
            return true;
        }

        let Some(var) = self.entity_mut(entity) else {
            return false;
        };
        var.enable_parser_vars().ir_value = Some(ir_value);
        *var.enable_jit_vars() = JitVars {
            alignment,
            size,
            offset: 0,
        };

        debug!(
            "added {} to the struct (size {}, alignment {})",
            name, size, alignment
        );

        self.struct_vars.members.push(entity);
        self.struct_vars.laid_out = false;
        true
    }

    /// メンバのオフセットと構造体のサイズ・アラインメントを計算する
    ///
    /// 失敗した場合、レイアウト済みの状態にはならない。
    pub fn do_struct_layout(&mut self) -> ExprResult<()> {
        if self.struct_vars.laid_out {
            return Ok(());
        }

        let mut specs = Vec::with_capacity(self.struct_vars.members.len());
        for &member in &self.struct_vars.members {
            let var = self
                .entity(member)
                .ok_or_else(|| ExprError::MissingLayoutInfo(format!("{:?}", member)))?;
            let jit = var
                .jit_vars
                .ok_or_else(|| ExprError::MissingLayoutInfo(var.name.clone()))?;
            specs.push(MemberSpec {
                size: jit.size,
                alignment: jit.alignment,
            });
        }

        let layout = compute_layout(&specs).map_err(|index| {
            let name = self
                .struct_vars
                .members
                .get(index)
                .and_then(|&member| self.entity(member))
                .map(|var| var.name.clone())
                .unwrap_or_default();
            ExprError::MissingLayoutInfo(name)
        })?;

        let members = self.struct_vars.members.clone();
        for (member, offset) in members.into_iter().zip(&layout.offsets) {
            if let Some(jit) = self.entity_mut(member).and_then(|var| var.jit_vars.as_mut()) {
                jit.offset = *offset;
            }
        }

        self.struct_vars.size = layout.info.size;
        self.struct_vars.alignment = layout.info.alignment;
        self.struct_vars.laid_out = true;
        debug!(
            "laid out {} members: size {}, alignment {}",
            layout.info.num_elements, layout.info.size, layout.info.alignment
        );
        Ok(())
    }

    pub fn is_laid_out(&self) -> bool {
        self.struct_vars.laid_out
    }

    /// 構造体のメンバを外し、各メンバの配置情報を消す
    ///
    /// 永続変数は次の式でも使われるので、古いオフセットを残さない。
    pub(crate) fn disable_struct_vars(&mut self) {
        let members = std::mem::take(&mut self.struct_vars.members);
        for member in members {
            if let Some(var) = self.entity_mut(member) {
                var.disable_jit_vars();
            }
        }
        self.struct_vars.laid_out = false;
        self.struct_vars.size = 0;
        self.struct_vars.alignment = 0;
    }

    pub fn get_struct_info(&self) -> ExprResult<StructInfo> {
        if !self.struct_vars.laid_out {
            return Err(ExprError::NotLaidOut);
        }
        Ok(StructInfo {
            num_elements: self.struct_vars.members.len(),
            size: self.struct_vars.size,
            alignment: self.struct_vars.alignment,
        })
    }

    /// `index` 番目のメンバ
    ///
    /// 範囲外、または宣言と IR 値がそろっていないメンバは `None`。
    pub fn get_struct_element(&self, index: usize) -> ExprResult<Option<StructElement>> {
        if !self.struct_vars.laid_out {
            return Err(ExprError::NotLaidOut);
        }
        let element = self
            .struct_vars
            .members
            .get(index)
            .and_then(|&member| self.entity(member))
            .and_then(|var| {
                let parser_vars = var.parser_vars.as_ref()?;
                Some(StructElement {
                    decl: parser_vars.named_decl?,
                    ir_value: parser_vars.ir_value?,
                    offset: var.jit_vars?.offset,
                    name: var.name.clone(),
                })
            });
        Ok(element)
    }

    /// 関数の宣言から IR 値とロードアドレスを得る
    pub fn get_function_info(&self, decl: DeclId) -> Option<(Option<IrValue>, u64)> {
        let index = self.found_entities.find_by_decl(decl)?;
        let parser_vars = self.found_entities.get(index)?.parser_vars.as_ref()?;
        match parser_vars.location {
            Some(ValueLocation::LoadAddress(addr)) => Some((parser_vars.ir_value, addr)),
            _ => None,
        }
    }

    /// 名前から関数のロードアドレスを得る（最初に見つかったもの）
    pub fn get_function_address(&self, exe_ctx: &ExecutionContext, name: &str) -> Option<u64> {
        let frame = exe_ctx.frame?;
        let function = frame.find_functions_by_name(name).into_iter().next()?;
        Some(function.address.wrapping_add(frame.load_bias()))
    }

    pub fn entity(&self, entity: EntityRef) -> Option<&ExpressionVariable> {
        match entity {
            EntityRef::Found(index) => self.found_entities.get(index),
            EntityRef::Persistent(id) => self.session.persistent_variables().get(id),
        }
    }

    pub fn entity_mut(&mut self, entity: EntityRef) -> Option<&mut ExpressionVariable> {
        match entity {
            EntityRef::Found(index) => self.found_entities.get_mut(index),
            EntityRef::Persistent(id) => self.session.persistent_variables_mut().get_mut(id),
        }
    }

    pub fn found_entities(&self) -> &ExpressionVariableList {
        &self.found_entities
    }

    /// 構造体メンバ（追加順）
    pub fn members(&self) -> &[EntityRef] {
        &self.struct_vars.members
    }

    /// 直近の `this` / `self` 検索で記録した型
    pub fn object_pointer_type(&self) -> Option<CompilerType> {
        self.struct_vars.object_pointer_type
    }

    /// 実体化した構造体のアドレス
    pub fn materialized_location(&self) -> Option<u64> {
        self.material.as_ref()?.materialized_location
    }
}

impl Drop for ExpressionDeclMap<'_> {
    fn drop(&mut self) {
        if let Some(addr) = self.material.as_ref().and_then(|m| m.allocated_area) {
            warn!(
                "expression struct at 0x{:x} was never released; call did_dematerialize before dropping the map",
                addr
            );
        }
        self.disable_struct_vars();
    }
}
