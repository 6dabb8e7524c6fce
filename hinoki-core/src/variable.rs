//! 式変数
//!
//! 式から参照された名前1つ分の値と、その値を扱うための作業領域を表します。
//! 作業領域は2つあり、構文解析中に使う [`ParserVars`] と、
//! 構造体への配置と実体化に使う [`JitVars`] です。

use crate::decl::{DeclId, IrValue};
use hinoki_dwarf::{CompilerType, TypeId};
use hinoki_target::{ByteOrder, RegisterInfo};

/// 値の実際の置き場所
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueLocation {
    /// ターゲットプロセスのメモリ上のアドレス
    LoadAddress(u64),
    /// レジスタ
    Register(RegisterInfo),
}

/// 構文解析中の作業領域
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserVars {
    /// パーサ側の型コンテキストでの型
    pub parser_type: Option<TypeId>,
    /// 対応する宣言
    pub named_decl: Option<DeclId>,
    /// IR 書き換えで割り当てられた値
    pub ir_value: Option<IrValue>,
    pub location: Option<ValueLocation>,
}

/// 構造体メンバとしての配置情報
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitVars {
    pub alignment: u64,
    pub size: u64,
    /// 構造体先頭からのオフセット（レイアウト後に確定）
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariableFlags {
    /// 逆実体化で値が書き戻された
    pub value_updated: bool,
}

/// 式変数
#[derive(Debug, Clone)]
pub struct ExpressionVariable {
    pub name: String,
    /// デバッグ対象側の型
    pub user_type: Option<CompilerType>,
    pub byte_size: u64,
    pub byte_order: ByteOrder,
    pub address_byte_size: u32,
    value_bytes: Option<Vec<u8>>,
    /// `$reg` で参照されたレジスタ
    pub register_info: Option<RegisterInfo>,
    pub flags: VariableFlags,
    pub parser_vars: Option<ParserVars>,
    pub jit_vars: Option<JitVars>,
}

impl ExpressionVariable {
    pub fn new(
        name: &str,
        user_type: Option<CompilerType>,
        byte_size: u64,
        byte_order: ByteOrder,
        address_byte_size: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            user_type,
            byte_size,
            byte_order,
            address_byte_size,
            value_bytes: None,
            register_info: None,
            flags: VariableFlags::default(),
            parser_vars: None,
            jit_vars: None,
        }
    }

    /// レジスタを表す式変数を作成する
    pub fn for_register(name: &str, register: RegisterInfo, byte_order: ByteOrder, address_byte_size: u32) -> Self {
        let mut var = Self::new(name, None, u64::from(register.byte_size), byte_order, address_byte_size);
        var.register_info = Some(register);
        var
    }

    /// 値バッファをバイトサイズ分ゼロで確保する
    pub fn allocate_value_buffer(&mut self) {
        self.value_bytes = Some(vec![0; self.byte_size as usize]);
    }

    pub fn value_bytes(&self) -> Option<&[u8]> {
        self.value_bytes.as_deref()
    }

    pub fn value_bytes_mut(&mut self) -> Option<&mut [u8]> {
        self.value_bytes.as_deref_mut()
    }

    /// 構文解析用の作業領域を有効にする（既にあればそれを返す）
    pub fn enable_parser_vars(&mut self) -> &mut ParserVars {
        self.parser_vars.get_or_insert_with(ParserVars::default)
    }

    pub fn disable_parser_vars(&mut self) {
        self.parser_vars = None;
    }

    pub fn enable_jit_vars(&mut self) -> &mut JitVars {
        self.jit_vars.get_or_insert_with(JitVars::default)
    }

    pub fn disable_jit_vars(&mut self) {
        self.jit_vars = None;
    }

    /// 宣言が一致するか
    pub fn has_decl(&self, decl: DeclId) -> bool {
        self.parser_vars
            .as_ref()
            .and_then(|vars| vars.named_decl)
            == Some(decl)
    }
}

/// 式変数のアリーナ
///
/// 要素はインデックスで参照され、削除はまとめて [`clear`](Self::clear) でのみ行う。
#[derive(Debug, Clone, Default)]
pub struct ExpressionVariableList {
    variables: Vec<ExpressionVariable>,
}

impl ExpressionVariableList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加して、そのインデックスを返す
    pub fn add(&mut self, var: ExpressionVariable) -> usize {
        self.variables.push(var);
        self.variables.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&ExpressionVariable> {
        self.variables.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ExpressionVariable> {
        self.variables.get_mut(index)
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|var| var.name == name)
    }

    pub fn find_by_decl(&self, decl: DeclId) -> Option<usize> {
        self.variables.iter().position(|var| var.has_decl(decl))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExpressionVariable> {
        self.variables.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ExpressionVariable> {
        self.variables.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_by_decl_uses_parser_vars() {
        let mut list = ExpressionVariableList::new();
        let a = list.add(ExpressionVariable::new("a", None, 4, ByteOrder::Little, 8));
        let b = list.add(ExpressionVariable::new("b", None, 8, ByteOrder::Little, 8));
        list.get_mut(b).unwrap().enable_parser_vars().named_decl = Some(DeclId(3));

        assert_eq!(list.find_by_decl(DeclId(3)), Some(b));
        assert_eq!(list.find_by_name("a"), Some(a));

        list.get_mut(b).unwrap().disable_parser_vars();
        assert_eq!(list.find_by_decl(DeclId(3)), None);
    }

    #[test]
    fn test_register_variable_takes_register_size() {
        let reg = RegisterInfo::new("eax", 0, None, 4, hinoki_target::RegisterEncoding::Uint);
        let var = ExpressionVariable::for_register("$eax", reg, ByteOrder::Little, 8);
        assert_eq!(var.byte_size, 4);
        assert!(var.value_bytes().is_none());
    }
}
