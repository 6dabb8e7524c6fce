//! 変数情報とロケーションの解釈

use crate::type_info::CompilerType;
use gimli::Reader;

/// 変数情報
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    /// 変数の型（デバッグ情報側の型コンテキスト）
    pub ty: Option<CompilerType>,
    pub location: VariableLocation,
}

impl Variable {
    pub fn new(name: &str, ty: Option<CompilerType>, location: VariableLocation) -> Self {
        Self {
            name: name.to_string(),
            ty,
            location,
        }
    }
}

/// 変数のロケーション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableLocation {
    /// フレームベースからのオフセット
    FrameOffset(i64),
    /// DWARFレジスタ番号
    Register(u16),
    /// ファイル上のアドレス（ロードバイアス適用前）
    Address(u64),
    /// 最適化により削除された
    OptimizedOut,
    /// 不明
    Unknown,
}

/// スコープ内の変数（PC範囲付き）
#[derive(Debug, Clone)]
pub struct ScopedVariable {
    /// 変数が見える PC 範囲 `[low, high)`（ファイルアドレス）
    pub range: (u64, u64),
    /// 入れ子の深さ。内側のスコープほど大きい
    pub depth: usize,
    pub variable: Variable,
}

/// DW_AT_location を解釈する
///
/// 単一オペレーションの式（fbreg / addr / regN）のみ対応する。
pub fn decode_location<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>) -> VariableLocation {
    let location_attr = match entry.attr_value(gimli::DW_AT_location) {
        Ok(Some(attr)) => attr,
        Ok(None) => return VariableLocation::OptimizedOut,
        Err(_) => return VariableLocation::Unknown,
    };

    let gimli::AttributeValue::Exprloc(expr) = location_attr else {
        return VariableLocation::Unknown;
    };

    let mut data = expr.0;
    let Ok(op) = data.read_u8() else {
        return VariableLocation::Unknown;
    };

    match op {
        // DW_OP_fbreg: フレームベースからのオフセット
        op if op == gimli::constants::DW_OP_fbreg.0 => data
            .read_sleb128()
            .map(VariableLocation::FrameOffset)
            .unwrap_or(VariableLocation::Unknown),
        // DW_OP_addr: 静的アドレス
        op if op == gimli::constants::DW_OP_addr.0 => data
            .read_address(8)
            .map(VariableLocation::Address)
            .unwrap_or(VariableLocation::Unknown),
        // DW_OP_regN: レジスタ
        op if (gimli::constants::DW_OP_reg0.0..=gimli::constants::DW_OP_reg31.0).contains(&op) => {
            VariableLocation::Register((op - gimli::constants::DW_OP_reg0.0) as u16)
        }
        // DW_OP_regx
        op if op == gimli::constants::DW_OP_regx.0 => data
            .read_uleb128()
            .map(|reg| VariableLocation::Register(reg as u16))
            .unwrap_or(VariableLocation::Unknown),
        _ => VariableLocation::Unknown,
    }
}
