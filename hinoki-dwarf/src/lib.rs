//! Hinoki デバッグ情報と型システム
//!
//! このクレートは、式の評価で使う型コンテキストと、ELF/DWARF デバッグ情報からの
//! 関数・変数・型の検索機能を提供します。

pub mod loader;
pub mod module;
pub mod symbols;
pub mod type_info;
pub mod utils;
pub mod variables;

pub use loader::DwarfLoader;
pub use module::{DwarfModule, FunctionInfo};
pub use symbols::{Symbol, SymbolResolver};
pub use type_info::{
    copy_type, CompilerType, ContextId, Encoding, FieldInfo, MethodInfo, TypeContext, TypeId,
    TypeInfo, TypeInfoExtractor,
};
pub use variables::{ScopedVariable, Variable, VariableLocation};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
