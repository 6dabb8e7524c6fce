//! 型システム
//!
//! 型はコンテキスト（[`TypeContext`]）ごとに登録され、[`TypeId`] で参照します。
//! 同じコンテキスト内で同一の型情報は同じ ID に集約されるため、
//! 型の同一性は「同じコンテキストかつ同じ ID」で判定できます。
//!
//! DWARF DIE からの型抽出（[`TypeInfoExtractor`]）と、
//! コンテキスト間の型コピー（[`copy_type`]）もここにあります。

use crate::utils::{die_name, die_type, die_udata};
use crate::Result;
use gimli::Reader;
use std::collections::HashMap;
use std::fmt;

/// DWARF抽出時の再帰の深さの上限
///
/// 自己参照する構造体（連結リストなど）は、この深さでポインタの参照先を打ち切る。
const MAX_EXTRACT_DEPTH: usize = 8;

/// 型コンテキストの識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

/// コンテキスト内の型の識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// コンテキスト付きの型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompilerType {
    pub context: ContextId,
    pub id: TypeId,
}

impl CompilerType {
    pub fn new(context: ContextId, id: TypeId) -> Self {
        Self { context, id }
    }
}

/// 基本型のエンコーディング
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Signed,
    Unsigned,
    Float,
    Boolean,
    Char,
}

/// 型情報
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeInfo {
    /// void
    Void,
    /// 基本型
    Primitive {
        name: String,
        size: u64,
        encoding: Encoding,
    },
    /// ポインタ型
    Pointer { pointee: Option<TypeId>, size: u64 },
    /// 参照型
    Reference { referent: Option<TypeId>, size: u64 },
    /// 配列型
    Array {
        element: Option<TypeId>,
        length: Option<u64>,
    },
    /// 構造体型
    Struct {
        name: String,
        size: u64,
        fields: Vec<FieldInfo>,
        methods: Vec<MethodInfo>,
    },
    /// 列挙型
    Enum { name: String, size: u64 },
    /// Union型
    Union {
        name: String,
        size: u64,
        members: Vec<FieldInfo>,
    },
    /// 関数型
    Function {
        return_type: Option<TypeId>,
        params: Vec<TypeId>,
    },
    /// 不明な型
    Unknown,
}

/// フィールド情報
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldInfo {
    /// フィールド名
    pub name: String,
    /// オフセット（バイト）
    pub offset: u64,
    pub ty: Option<TypeId>,
}

/// メソッド情報
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodInfo {
    pub name: String,
    /// 関数型
    pub ty: TypeId,
}

/// 型コンテキスト（型のアリーナ）
#[derive(Debug, Clone)]
pub struct TypeContext {
    id: ContextId,
    types: Vec<TypeInfo>,
    index: HashMap<TypeInfo, TypeId>,
}

impl TypeContext {
    /// 空の型コンテキストを作成する
    pub fn new(id: ContextId) -> Self {
        Self {
            id,
            types: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// コンテキストIDを取得する
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// 登録済みの型の数
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// 型を登録する。同じ型がすでにあればその ID を返す
    pub fn intern(&mut self, info: TypeInfo) -> TypeId {
        if let Some(&id) = self.index.get(&info) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(info.clone());
        self.index.insert(info, id);
        id
    }

    /// 型情報を取得する
    pub fn get(&self, id: TypeId) -> Option<&TypeInfo> {
        self.types.get(id.0 as usize)
    }

    /// このコンテキストの `CompilerType` を作る
    pub fn compiler_type(&self, id: TypeId) -> CompilerType {
        CompilerType::new(self.id, id)
    }

    /// 型がこのコンテキストに属するか
    pub fn owns(&self, ty: CompilerType) -> bool {
        ty.context == self.id && self.get(ty.id).is_some()
    }

    /// バイトサイズを取得する
    pub fn byte_size(&self, id: TypeId) -> Option<u64> {
        match self.get(id)? {
            TypeInfo::Primitive { size, .. }
            | TypeInfo::Pointer { size, .. }
            | TypeInfo::Reference { size, .. }
            | TypeInfo::Struct { size, .. }
            | TypeInfo::Enum { size, .. }
            | TypeInfo::Union { size, .. } => Some(*size),
            TypeInfo::Array { element, length } => {
                let element = self.byte_size((*element)?)?;
                Some(element * (*length)?)
            }
            TypeInfo::Void | TypeInfo::Function { .. } | TypeInfo::Unknown => None,
        }
    }

    /// ビット幅を取得する
    pub fn bit_width(&self, id: TypeId) -> Option<u64> {
        self.byte_size(id).map(|size| size * 8)
    }

    /// アラインメント（バイト）を取得する
    ///
    /// 基本型とポインタはサイズ、集約型はメンバの最大値。
    pub fn alignment(&self, id: TypeId) -> Option<u64> {
        match self.get(id)? {
            TypeInfo::Primitive { size, .. }
            | TypeInfo::Pointer { size, .. }
            | TypeInfo::Reference { size, .. }
            | TypeInfo::Enum { size, .. } => Some((*size).max(1)),
            TypeInfo::Array { element, .. } => self.alignment((*element)?),
            TypeInfo::Struct { fields, .. } | TypeInfo::Union { members: fields, .. } => Some(
                fields
                    .iter()
                    .filter_map(|f| f.ty.and_then(|ty| self.alignment(ty)))
                    .max()
                    .unwrap_or(1),
            ),
            TypeInfo::Void | TypeInfo::Function { .. } | TypeInfo::Unknown => None,
        }
    }

    /// ポインタ・参照の参照先を取得する
    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id)? {
            TypeInfo::Pointer { pointee, .. } => *pointee,
            TypeInfo::Reference { referent, .. } => *referent,
            _ => None,
        }
    }

    /// ポインタ型かどうか
    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.get(id), Some(TypeInfo::Pointer { .. }))
    }

    /// 集約型（構造体・Union）かどうか
    pub fn is_aggregate(&self, id: TypeId) -> bool {
        matches!(
            self.get(id),
            Some(TypeInfo::Struct { .. }) | Some(TypeInfo::Union { .. })
        )
    }

    /// 型名を取得する
    pub fn type_name(&self, id: TypeId) -> String {
        match self.get(id) {
            Some(TypeInfo::Void) => "()".to_string(),
            Some(TypeInfo::Primitive { name, .. })
            | Some(TypeInfo::Struct { name, .. })
            | Some(TypeInfo::Enum { name, .. })
            | Some(TypeInfo::Union { name, .. }) => name.clone(),
            Some(TypeInfo::Pointer { pointee, .. }) => {
                format!("*const {}", self.name_or_unknown(*pointee))
            }
            Some(TypeInfo::Reference { referent, .. }) => {
                format!("&{}", self.name_or_unknown(*referent))
            }
            Some(TypeInfo::Array { element, length }) => match length {
                Some(len) => format!("[{}; {}]", self.name_or_unknown(*element), len),
                None => format!("[{}]", self.name_or_unknown(*element)),
            },
            Some(TypeInfo::Function { return_type, params }) => {
                let params: Vec<String> = params.iter().map(|p| self.type_name(*p)).collect();
                match return_type {
                    Some(ret) => format!("fn({}) -> {}", params.join(", "), self.type_name(*ret)),
                    None => format!("fn({})", params.join(", ")),
                }
            }
            Some(TypeInfo::Unknown) | None => "<unknown>".to_string(),
        }
    }

    fn name_or_unknown(&self, id: Option<TypeId>) -> String {
        id.map(|id| self.type_name(id))
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    /// 名前で型を検索する（基本型・構造体・列挙型・Union）
    pub fn find_by_name(&self, name: &str) -> Option<TypeId> {
        self.types.iter().position(|info| match info {
            TypeInfo::Primitive { name: n, .. }
            | TypeInfo::Struct { name: n, .. }
            | TypeInfo::Enum { name: n, .. }
            | TypeInfo::Union { name: n, .. } => n == name,
            _ => false,
        })
        .map(|index| TypeId(index as u32))
    }

    /// エンコーディングとビット幅に対応する組み込み型を取得する
    pub fn builtin_for_encoding(&mut self, encoding: Encoding, bits: u64) -> TypeId {
        let name = match encoding {
            Encoding::Signed => format!("i{}", bits),
            Encoding::Unsigned => format!("u{}", bits),
            Encoding::Float => format!("f{}", bits),
            Encoding::Boolean => "bool".to_string(),
            Encoding::Char => "char".to_string(),
        };
        self.intern(TypeInfo::Primitive {
            name,
            size: bits.div_ceil(8),
            encoding,
        })
    }

    /// void 型
    pub fn void(&mut self) -> TypeId {
        self.intern(TypeInfo::Void)
    }

    /// void ポインタ型
    pub fn void_ptr(&mut self, pointer_size: u64) -> TypeId {
        let void = self.void();
        self.pointer_to(void, pointer_size)
    }

    /// ポインタ型
    pub fn pointer_to(&mut self, pointee: TypeId, pointer_size: u64) -> TypeId {
        self.intern(TypeInfo::Pointer {
            pointee: Some(pointee),
            size: pointer_size,
        })
    }

    /// 関数型
    pub fn function(&mut self, return_type: Option<TypeId>, params: Vec<TypeId>) -> TypeId {
        self.intern(TypeInfo::Function {
            return_type,
            params,
        })
    }

    /// 構造体にメソッドを追加した型を作る
    ///
    /// 同名のメソッドがすでにあれば元の型を返す。構造体以外には追加できない。
    pub fn add_method(&mut self, record: TypeId, name: &str, method_type: TypeId) -> Option<TypeId> {
        let mut info = self.get(record)?.clone();
        match &mut info {
            TypeInfo::Struct { methods, .. } => {
                if methods.iter().any(|m| m.name == name) {
                    return Some(record);
                }
                methods.push(MethodInfo {
                    name: name.to_string(),
                    ty: method_type,
                });
            }
            _ => return None,
        }
        Some(self.intern(info))
    }
}

impl fmt::Display for CompilerType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ctx{}#{}", self.context.0, self.id.0)
    }
}

/// 型をコンテキスト間でコピーする
///
/// 参照している型もすべて `dest` に登録する。コピー元に型がなければ `None`。
pub fn copy_type(dest: &mut TypeContext, src: &TypeContext, ty: TypeId) -> Option<TypeId> {
    if dest.id() == src.id() {
        return src.get(ty).map(|_| ty);
    }

    let copy = |dest: &mut TypeContext, id: Option<TypeId>| -> Option<Option<TypeId>> {
        match id {
            Some(id) => copy_type(dest, src, id).map(Some),
            None => Some(None),
        }
    };
    let copy_fields = |dest: &mut TypeContext, fields: &[FieldInfo]| -> Option<Vec<FieldInfo>> {
        fields
            .iter()
            .map(|f| {
                Some(FieldInfo {
                    name: f.name.clone(),
                    offset: f.offset,
                    ty: copy(dest, f.ty)?,
                })
            })
            .collect()
    };

    let copied = match src.get(ty)? {
        TypeInfo::Pointer { pointee, size } => TypeInfo::Pointer {
            pointee: copy(dest, *pointee)?,
            size: *size,
        },
        TypeInfo::Reference { referent, size } => TypeInfo::Reference {
            referent: copy(dest, *referent)?,
            size: *size,
        },
        TypeInfo::Array { element, length } => TypeInfo::Array {
            element: copy(dest, *element)?,
            length: *length,
        },
        TypeInfo::Struct {
            name,
            size,
            fields,
            methods,
        } => {
            let fields = copy_fields(dest, fields)?;
            let methods = methods
                .iter()
                .map(|m| {
                    Some(MethodInfo {
                        name: m.name.clone(),
                        ty: copy_type(dest, src, m.ty)?,
                    })
                })
                .collect::<Option<Vec<_>>>()?;
            TypeInfo::Struct {
                name: name.clone(),
                size: *size,
                fields,
                methods,
            }
        }
        TypeInfo::Union {
            name,
            size,
            members,
        } => TypeInfo::Union {
            name: name.clone(),
            size: *size,
            members: copy_fields(dest, members)?,
        },
        TypeInfo::Function {
            return_type,
            params,
        } => TypeInfo::Function {
            return_type: copy(dest, *return_type)?,
            params: params
                .iter()
                .map(|p| copy_type(dest, src, *p))
                .collect::<Option<Vec<_>>>()?,
        },
        leaf => leaf.clone(),
    };

    Some(dest.intern(copied))
}

/// DWARF DIE から型を抽出して型コンテキストに登録する
pub struct TypeInfoExtractor<'a, R: Reader> {
    dwarf: &'a gimli::Dwarf<R>,
    unit: &'a gimli::Unit<R>,
    pointer_size: u64,
}

impl<'a, R: Reader<Offset = usize>> TypeInfoExtractor<'a, R> {
    /// 新しい型情報抽出器を作成する
    pub fn new(dwarf: &'a gimli::Dwarf<R>, unit: &'a gimli::Unit<R>) -> Self {
        let pointer_size = unit.encoding().address_size as u64;
        Self {
            dwarf,
            unit,
            pointer_size,
        }
    }

    /// 型DIEから型を抽出する
    pub fn extract(&self, ctx: &mut TypeContext, offset: gimli::UnitOffset<R::Offset>) -> Result<TypeId> {
        self.extract_at(ctx, offset, 0)
    }

    fn extract_at(
        &self,
        ctx: &mut TypeContext,
        offset: gimli::UnitOffset<R::Offset>,
        depth: usize,
    ) -> Result<TypeId> {
        if depth > MAX_EXTRACT_DEPTH {
            return Ok(ctx.intern(TypeInfo::Unknown));
        }

        let entry = self.unit.entry(offset)?;
        let info = match entry.tag() {
            gimli::DW_TAG_base_type => self.base_type(&entry)?,
            gimli::DW_TAG_pointer_type => TypeInfo::Pointer {
                pointee: self.referenced(ctx, &entry, depth)?,
                size: die_udata(&entry, gimli::DW_AT_byte_size).unwrap_or(self.pointer_size),
            },
            gimli::DW_TAG_reference_type | gimli::DW_TAG_rvalue_reference_type => {
                TypeInfo::Reference {
                    referent: self.referenced(ctx, &entry, depth)?,
                    size: die_udata(&entry, gimli::DW_AT_byte_size).unwrap_or(self.pointer_size),
                }
            }
            gimli::DW_TAG_array_type => TypeInfo::Array {
                element: self.referenced(ctx, &entry, depth)?,
                length: self.array_length(offset)?,
            },
            gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type => TypeInfo::Struct {
                name: self.name_or(&entry, "<anonymous>"),
                size: die_udata(&entry, gimli::DW_AT_byte_size).unwrap_or(0),
                fields: self.fields(ctx, offset, depth)?,
                methods: Vec::new(),
            },
            gimli::DW_TAG_union_type => TypeInfo::Union {
                name: self.name_or(&entry, "<anonymous>"),
                size: die_udata(&entry, gimli::DW_AT_byte_size).unwrap_or(0),
                members: self.fields(ctx, offset, depth)?,
            },
            gimli::DW_TAG_enumeration_type => TypeInfo::Enum {
                name: self.name_or(&entry, "<anonymous>"),
                size: die_udata(&entry, gimli::DW_AT_byte_size).unwrap_or(0),
            },
            gimli::DW_TAG_subprogram | gimli::DW_TAG_subroutine_type => {
                self.function_type(ctx, offset, depth)?
            }
            // 修飾子と typedef は参照先の型として扱う
            gimli::DW_TAG_typedef
            | gimli::DW_TAG_const_type
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_restrict_type => {
                return match die_type(&entry) {
                    Some(target) => self.extract_at(ctx, target, depth + 1),
                    None => Ok(ctx.void()),
                };
            }
            _ => TypeInfo::Unknown,
        };

        Ok(ctx.intern(info))
    }

    fn base_type(&self, entry: &gimli::DebuggingInformationEntry<R>) -> Result<TypeInfo> {
        let size = die_udata(entry, gimli::DW_AT_byte_size).unwrap_or(0);
        let encoding = match entry.attr_value(gimli::DW_AT_encoding)? {
            Some(gimli::AttributeValue::Encoding(gimli::DW_ATE_signed)) => Encoding::Signed,
            Some(gimli::AttributeValue::Encoding(gimli::DW_ATE_float)) => Encoding::Float,
            Some(gimli::AttributeValue::Encoding(gimli::DW_ATE_boolean)) => Encoding::Boolean,
            Some(gimli::AttributeValue::Encoding(gimli::DW_ATE_UTF))
            | Some(gimli::AttributeValue::Encoding(gimli::DW_ATE_signed_char))
            | Some(gimli::AttributeValue::Encoding(gimli::DW_ATE_unsigned_char)) => Encoding::Char,
            _ => Encoding::Unsigned,
        };
        let name = die_name(self.dwarf, self.unit, entry).unwrap_or_else(|| match encoding {
            Encoding::Signed => format!("i{}", size * 8),
            Encoding::Float => format!("f{}", size * 8),
            Encoding::Boolean => "bool".to_string(),
            Encoding::Char => "char".to_string(),
            Encoding::Unsigned => format!("u{}", size * 8),
        });

        Ok(TypeInfo::Primitive {
            name,
            size,
            encoding,
        })
    }

    fn referenced(
        &self,
        ctx: &mut TypeContext,
        entry: &gimli::DebuggingInformationEntry<R>,
        depth: usize,
    ) -> Result<Option<TypeId>> {
        match die_type(entry) {
            Some(target) => Ok(Some(self.extract_at(ctx, target, depth + 1)?)),
            None => Ok(Some(ctx.void())),
        }
    }

    fn fields(
        &self,
        ctx: &mut TypeContext,
        offset: gimli::UnitOffset<R::Offset>,
        depth: usize,
    ) -> Result<Vec<FieldInfo>> {
        let mut fields = Vec::new();
        let mut tree = self.unit.entries_tree(Some(offset))?;
        let root = tree.root()?;

        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }

            let ty = match die_type(entry) {
                Some(target) => Some(self.extract_at(ctx, target, depth + 1)?),
                None => None,
            };
            fields.push(FieldInfo {
                name: self.name_or(entry, "<unnamed>"),
                offset: die_udata(entry, gimli::DW_AT_data_member_location).unwrap_or(0),
                ty,
            });
        }

        Ok(fields)
    }

    fn function_type(
        &self,
        ctx: &mut TypeContext,
        offset: gimli::UnitOffset<R::Offset>,
        depth: usize,
    ) -> Result<TypeInfo> {
        let entry = self.unit.entry(offset)?;
        let return_type = match die_type(&entry) {
            Some(target) => Some(self.extract_at(ctx, target, depth + 1)?),
            None => None,
        };

        let mut params = Vec::new();
        let mut tree = self.unit.entries_tree(Some(offset))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_formal_parameter {
                continue;
            }
            let param = match die_type(entry) {
                Some(target) => self.extract_at(ctx, target, depth + 1)?,
                None => ctx.intern(TypeInfo::Unknown),
            };
            params.push(param);
        }

        Ok(TypeInfo::Function {
            return_type,
            params,
        })
    }

    /// DW_TAG_subrange_type から配列長を取得する
    fn array_length(&self, offset: gimli::UnitOffset<R::Offset>) -> Result<Option<u64>> {
        let mut tree = self.unit.entries_tree(Some(offset))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_subrange_type {
                continue;
            }
            if let Some(count) = die_udata(entry, gimli::DW_AT_count) {
                return Ok(Some(count));
            }
            if let Some(upper) = die_udata(entry, gimli::DW_AT_upper_bound) {
                return Ok(Some(upper + 1));
            }
        }
        Ok(None)
    }

    fn name_or(&self, entry: &gimli::DebuggingInformationEntry<R>, fallback: &str) -> String {
        die_name(self.dwarf, self.unit, entry).unwrap_or_else(|| fallback.to_string())
    }
}
