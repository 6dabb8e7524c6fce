//! 永続変数ストア
//!
//! 式の評価をまたいで残る名前付きの値（`$0` など）を保持します。
//! 値はデバッガ側のバイト列として持ち、ターゲット上には置きません。

use crate::decl::DeclId;
use crate::errors::{ExprError, ExprResult};
use crate::variable::{ExpressionVariable, ExpressionVariableList};
use hinoki_dwarf::CompilerType;
use hinoki_target::ByteOrder;
use tracing::debug;

/// 永続変数のインデックス
pub type PersistentId = usize;

/// 永続変数ストア
#[derive(Debug, Default)]
pub struct PersistentVariables {
    variables: ExpressionVariableList,
    next_result_id: u64,
}

impl PersistentVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// 永続変数を作成する
    ///
    /// 値バッファは型のバイトサイズ分ゼロで埋める。同名の変数があればエラー。
    pub fn create(
        &mut self,
        name: &str,
        user_type: CompilerType,
        byte_size: u64,
        byte_order: ByteOrder,
        address_byte_size: u32,
    ) -> ExprResult<PersistentId> {
        if self.variables.find_by_name(name).is_some() {
            return Err(ExprError::DuplicatePersistent(name.to_string()));
        }

        let mut var = ExpressionVariable::new(name, Some(user_type), byte_size, byte_order, address_byte_size);
        var.allocate_value_buffer();
        debug!("created persistent variable {} ({} bytes)", name, byte_size);
        Ok(self.variables.add(var))
    }

    pub fn get_by_name(&self, name: &str) -> Option<PersistentId> {
        self.variables.find_by_name(name)
    }

    pub fn get_by_decl(&self, decl: DeclId) -> Option<PersistentId> {
        self.variables.find_by_decl(decl)
    }

    pub fn get(&self, id: PersistentId) -> Option<&ExpressionVariable> {
        self.variables.get(id)
    }

    pub fn get_mut(&mut self, id: PersistentId) -> Option<&mut ExpressionVariable> {
        self.variables.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExpressionVariable> {
        self.variables.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ExpressionVariable> {
        self.variables.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// 次の結果変数名（`$0`, `$1`, ...）を払い出す
    pub fn next_persistent_variable_name(&mut self) -> String {
        let name = format!("${}", self.next_result_id);
        self.next_result_id += 1;
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hinoki_dwarf::{ContextId, TypeId};

    fn int_type() -> CompilerType {
        CompilerType::new(ContextId(0), TypeId(0))
    }

    #[test]
    fn test_create_zero_fills_buffer() {
        let mut store = PersistentVariables::new();
        let id = store.create("$x", int_type(), 4, ByteOrder::Little, 8).unwrap();
        let var = store.get(id).unwrap();
        assert_eq!(var.value_bytes(), Some(&[0u8, 0, 0, 0][..]));
        assert!(!var.flags.value_updated);
        assert_eq!(store.get_by_name("$x"), Some(id));
    }

    #[test]
    fn test_create_duplicate_fails() {
        let mut store = PersistentVariables::new();
        store.create("$x", int_type(), 4, ByteOrder::Little, 8).unwrap();
        let err = store.create("$x", int_type(), 8, ByteOrder::Little, 8).unwrap_err();
        assert_eq!(err, ExprError::DuplicatePersistent("$x".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_result_names_are_sequential() {
        let mut store = PersistentVariables::new();
        assert_eq!(store.next_persistent_variable_name(), "$0");
        assert_eq!(store.next_persistent_variable_name(), "$1");
        assert_eq!(store.next_persistent_variable_name(), "$2");
    }
}
