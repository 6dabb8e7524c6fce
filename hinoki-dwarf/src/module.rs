//! 実行ファイル1つ分のデバッグ情報
//!
//! 読み込み時に全コンパイルユニットを走査し、関数・グローバル変数・名前付きの型を索引します。
//! 型はモジュール固有の [`TypeContext`] に登録されます。

use crate::type_info::{CompilerType, ContextId, TypeContext, TypeId, TypeInfoExtractor};
use crate::utils::{die_flag, die_linkage_name, die_name, die_type, pc_range};
use crate::variables::{decode_location, ScopedVariable, Variable, VariableLocation};
use crate::{DwarfLoader, Result, SymbolResolver};
use gimli::Reader;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// 関数情報
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    pub linkage_name: Option<String>,
    /// 関数の PC 範囲 `[low, high)`（ファイルアドレス）
    pub range: (u64, u64),
    /// 関数型
    pub ty: TypeId,
    /// 外部リンケージを持つか
    pub external: bool,
    locals: Vec<ScopedVariable>,
}

impl FunctionInfo {
    /// PC がこの関数の範囲内か
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.range.0 && pc < self.range.1
    }

    /// 引数とローカル変数
    pub fn locals(&self) -> &[ScopedVariable] {
        &self.locals
    }
}

/// モジュールの索引
struct ModuleIndex {
    types: TypeContext,
    functions: Vec<FunctionInfo>,
    globals: Vec<Variable>,
    named_types: HashMap<String, TypeId>,
}

impl ModuleIndex {
    fn build<R: Reader<Offset = usize>>(dwarf: &gimli::Dwarf<R>, context: ContextId) -> Result<Self> {
        let mut index = Self {
            types: TypeContext::new(context),
            functions: Vec::new(),
            globals: Vec::new(),
            named_types: HashMap::new(),
        };

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let extractor = TypeInfoExtractor::new(dwarf, &unit);
            let mut tree = unit.entries_tree(None)?;
            let root = tree.root()?;
            index.index_scope(dwarf, &unit, &extractor, root)?;
        }

        Ok(index)
    }

    /// CU や名前空間の直下を走査する
    fn index_scope<R: Reader<Offset = usize>>(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        extractor: &TypeInfoExtractor<R>,
        node: gimli::EntriesTreeNode<R>,
    ) -> Result<()> {
        let mut children = node.children();
        while let Some(child) = children.next()? {
            let tag = child.entry().tag();
            match tag {
                gimli::DW_TAG_namespace => self.index_scope(dwarf, unit, extractor, child)?,
                gimli::DW_TAG_subprogram => self.index_function(dwarf, unit, extractor, child)?,
                gimli::DW_TAG_variable => {
                    if let Some(var) = self.variable(dwarf, unit, extractor, child.entry()) {
                        if matches!(var.location, VariableLocation::Address(_)) {
                            self.globals.push(var);
                        }
                    }
                }
                gimli::DW_TAG_base_type
                | gimli::DW_TAG_structure_type
                | gimli::DW_TAG_class_type
                | gimli::DW_TAG_union_type
                | gimli::DW_TAG_enumeration_type
                | gimli::DW_TAG_typedef => {
                    let entry = child.entry();
                    if die_flag(entry, gimli::DW_AT_declaration) {
                        continue;
                    }
                    let Some(name) = die_name(dwarf, unit, entry) else {
                        continue;
                    };
                    if self.named_types.contains_key(&name) {
                        continue;
                    }
                    match extractor.extract(&mut self.types, entry.offset()) {
                        Ok(ty) => {
                            self.named_types.insert(name, ty);
                        }
                        Err(e) => debug!("skipping type {}: {}", name, e),
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn index_function<R: Reader<Offset = usize>>(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        extractor: &TypeInfoExtractor<R>,
        node: gimli::EntriesTreeNode<R>,
    ) -> Result<()> {
        let entry = node.entry();
        let (Some(name), Some(range)) = (die_name(dwarf, unit, entry), pc_range(entry)) else {
            return Ok(());
        };
        let linkage_name = die_linkage_name(dwarf, unit, entry);
        let external = die_flag(entry, gimli::DW_AT_external);
        let ty = extractor.extract(&mut self.types, entry.offset())?;

        let mut locals = Vec::new();
        self.collect_locals(dwarf, unit, extractor, node, range, 0, &mut locals)?;

        self.functions.push(FunctionInfo {
            name,
            linkage_name,
            range,
            ty,
            external,
            locals,
        });
        Ok(())
    }

    /// 関数とレキシカルブロック内の変数を集める
    #[allow(clippy::too_many_arguments)]
    fn collect_locals<R: Reader<Offset = usize>>(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        extractor: &TypeInfoExtractor<R>,
        node: gimli::EntriesTreeNode<R>,
        range: (u64, u64),
        depth: usize,
        out: &mut Vec<ScopedVariable>,
    ) -> Result<()> {
        let mut children = node.children();
        while let Some(child) = children.next()? {
            let tag = child.entry().tag();
            match tag {
                gimli::DW_TAG_formal_parameter | gimli::DW_TAG_variable => {
                    if let Some(variable) = self.variable(dwarf, unit, extractor, child.entry()) {
                        out.push(ScopedVariable {
                            range,
                            depth,
                            variable,
                        });
                    }
                }
                gimli::DW_TAG_lexical_block => {
                    // DW_AT_ranges しか持たないブロックは親の範囲で代用する
                    let block_range = pc_range(child.entry()).unwrap_or(range);
                    self.collect_locals(dwarf, unit, extractor, child, block_range, depth + 1, out)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn variable<R: Reader<Offset = usize>>(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        extractor: &TypeInfoExtractor<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Option<Variable> {
        let name = die_name(dwarf, unit, entry)?;
        let ty = die_type(entry)
            .and_then(|offset| extractor.extract(&mut self.types, offset).ok())
            .map(|id| self.types.compiler_type(id));

        Some(Variable {
            name,
            ty,
            location: decode_location(entry),
        })
    }
}

/// 実行ファイル1つ分のデバッグ情報
pub struct DwarfModule {
    loader: DwarfLoader,
    symbols: SymbolResolver,
    index: ModuleIndex,
}

impl DwarfModule {
    /// ELFファイルを読み込み、型を `context` の型コンテキストに登録する
    pub fn load<P: AsRef<Path>>(path: P, context: ContextId) -> Result<Self> {
        let loader = DwarfLoader::load(path)?;
        let symbols = SymbolResolver::new(&loader)?;
        let index = ModuleIndex::build(loader.dwarf(), context)?;

        if index.functions.is_empty() {
            warn!("{:?} has no DWARF subprograms", loader.path());
        }
        debug!(
            "indexed {:?}: {} functions, {} globals, {} types",
            loader.path(),
            index.functions.len(),
            index.globals.len(),
            index.types.len()
        );

        Ok(Self {
            loader,
            symbols,
            index,
        })
    }

    pub fn loader(&self) -> &DwarfLoader {
        &self.loader
    }

    pub fn symbols(&self) -> &SymbolResolver {
        &self.symbols
    }

    /// このモジュールの型コンテキスト
    pub fn types(&self) -> &TypeContext {
        &self.index.types
    }

    /// PC（ファイルアドレス）を含む関数
    pub fn function_at(&self, pc: u64) -> Option<&FunctionInfo> {
        self.index.functions.iter().find(|f| f.contains(pc))
    }

    /// PC から見えるローカル変数を名前で検索する
    ///
    /// 複数のスコープに同名の変数があれば、最も内側のものを返す。
    pub fn find_local(&self, pc: u64, name: &str) -> Option<&Variable> {
        self.function_at(pc)?
            .locals
            .iter()
            .filter(|local| local.variable.name == name)
            .filter(|local| pc >= local.range.0 && pc < local.range.1)
            .max_by_key(|local| local.depth)
            .map(|local| &local.variable)
    }

    /// グローバル変数を名前で検索する
    pub fn find_globals(&self, name: &str) -> Vec<&Variable> {
        self.index
            .globals
            .iter()
            .filter(|var| var.name == name)
            .collect()
    }

    /// DWARF上の関数を名前で検索する
    pub fn functions_named(&self, name: &str) -> Vec<&FunctionInfo> {
        self.index
            .functions
            .iter()
            .filter(|f| f.name == name || f.linkage_name.as_deref() == Some(name))
            .collect()
    }

    /// 名前付きの型を検索する
    pub fn find_type(&self, name: &str) -> Option<CompilerType> {
        self.index
            .named_types
            .get(name)
            .map(|id| self.index.types.compiler_type(*id))
    }
}
