//! パーサ側の宣言
//!
//! 名前解決の結果は、パーサの型コンテキストに置かれた宣言として返します。

use hinoki_dwarf::{ContextId, TypeContext, TypeId};

/// 宣言のID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeclId(pub u32);

/// IR 書き換えが割り当てる値のハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrValue(pub u64);

/// 宣言の種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclKind {
    Variable { ty: TypeId },
    Function { ty: TypeId },
    /// 型のわからないシンボル
    GenericFunction { ty: TypeId },
    Type { ty: TypeId },
}

/// 名前付きの宣言
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedDecl {
    pub name: String,
    pub kind: DeclKind,
}

/// パーサの型コンテキストと宣言のアリーナ
#[derive(Debug)]
pub struct ParserAst {
    types: TypeContext,
    decls: Vec<NamedDecl>,
}

impl ParserAst {
    pub fn new(context: ContextId) -> Self {
        Self {
            types: TypeContext::new(context),
            decls: Vec::new(),
        }
    }

    pub fn types(&self) -> &TypeContext {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeContext {
        &mut self.types
    }

    pub fn decl(&self, id: DeclId) -> Option<&NamedDecl> {
        self.decls.get(id.0 as usize)
    }

    pub fn decls(&self) -> &[NamedDecl] {
        &self.decls
    }

    fn add_decl(&mut self, name: &str, kind: DeclKind) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        self.decls.push(NamedDecl {
            name: name.to_string(),
            kind,
        });
        id
    }
}

/// 1回の名前検索の文脈
///
/// 検索対象の名前と、この検索で追加された宣言を持つ。
pub struct NameSearchContext<'a> {
    ast: &'a mut ParserAst,
    name: String,
    decls: Vec<DeclId>,
}

impl<'a> NameSearchContext<'a> {
    pub fn new(ast: &'a mut ParserAst, name: &str) -> Self {
        Self {
            ast,
            name: name.to_string(),
            decls: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn types(&self) -> &TypeContext {
        &self.ast.types
    }

    pub fn types_mut(&mut self) -> &mut TypeContext {
        &mut self.ast.types
    }

    /// この検索で追加された宣言
    pub fn decls(&self) -> &[DeclId] {
        &self.decls
    }

    fn push(&mut self, kind: DeclKind) -> DeclId {
        let id = self.ast.add_decl(&self.name, kind);
        self.decls.push(id);
        id
    }

    pub fn add_var_decl(&mut self, ty: TypeId) -> DeclId {
        self.push(DeclKind::Variable { ty })
    }

    pub fn add_fun_decl(&mut self, ty: TypeId) -> DeclId {
        self.push(DeclKind::Function { ty })
    }

    /// 型情報のない関数の宣言（引数なし、戻り値なし）
    pub fn add_generic_fun_decl(&mut self) -> DeclId {
        let ty = self.ast.types.function(None, Vec::new());
        self.push(DeclKind::GenericFunction { ty })
    }

    pub fn add_type_decl(&mut self, ty: TypeId) -> DeclId {
        self.push(DeclKind::Type { ty })
    }
}
