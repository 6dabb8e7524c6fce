//! 名前解決と宣言の合成
//!
//! パーサが未知の名前に出会うたびに [`ExpressionDeclMap::get_decls`] が呼ばれ、
//! 停止中のフレームから変数・関数・永続変数・レジスタ・型を探して宣言を追加します。
//! 見つからなければ何もしません（未宣言の識別子としてパーサが報告する）。
//!
//! 検索の優先順位:
//!
//! 1. `$` で始まらない名前: フレームの変数、次に関数
//! 2. `$__hinoki_class` / `$__hinoki_objc_class`: `this` / `self` の指す型
//! 3. その他の `$` 名: 永続変数、次にレジスタ（`$` を除いた名前）
//! 4. 上で見つからなければ、同名の型

use crate::context::{ExecutionContext, FunctionKind, FunctionMatch, StackFrame};
use crate::decl::{DeclId, NameSearchContext};
use crate::decl_map::ExpressionDeclMap;
use crate::errors::{ExprError, ExprResult};
use crate::persistent::PersistentId;
use crate::variable::{ExpressionVariable, ValueLocation};
use hinoki_dwarf::{copy_type, CompilerType, Encoding, TypeContext, TypeId, Variable, VariableLocation};
use hinoki_target::{read_exact, RegisterEncoding, RegisterInfo};
use std::cell::Cell;
use tracing::debug;

/// `this` の指す型を問い合わせる名前
pub const CLASS_NAME: &str = "$__hinoki_class";
/// `self` の指す型を問い合わせる名前
pub const OBJC_CLASS_NAME: &str = "$__hinoki_objc_class";
/// 式本体として `this` の型に追加するメソッド名
pub const EXPR_METHOD_NAME: &str = "$__hinoki_expr";

/// 型コピー中フラグを戻すガード
struct ImportGuard<'a>(Option<&'a Cell<bool>>);

impl Drop for ImportGuard<'_> {
    fn drop(&mut self) {
        if let Some(flag) = self.0 {
            flag.set(false);
        }
    }
}

/// 名前検索を止めた状態で型をコピーする
pub fn guarded_copy_type(
    importing: Option<&Cell<bool>>,
    dest: &mut TypeContext,
    src: &TypeContext,
    ty: TypeId,
) -> Option<TypeId> {
    if let Some(flag) = importing {
        flag.set(true);
    }
    let _guard = ImportGuard(importing);
    copy_type(dest, src, ty)
}

/// フレームから変数を探す
///
/// ローカル変数、フレームのモジュールのグローバル変数、全モジュールのグローバル変数の順に探す。
/// `expected` を指定した場合、型コンテキストが異なるか、同じコンテキストで型が異なれば `None`。
/// 不一致のときに次の候補は探さない。
pub fn find_variable_in_scope(
    frame: &dyn StackFrame,
    name: &str,
    expected: Option<CompilerType>,
) -> Option<Variable> {
    let var = frame
        .find_local_variable(name)
        .or_else(|| frame.find_module_globals(name, 1).into_iter().next())
        .or_else(|| frame.find_program_globals(name, 1).into_iter().next())?;

    if let Some(expected) = expected {
        match var.ty {
            Some(ty) if ty.context == expected.context => {
                if ty.id != expected.id {
                    debug!("skipping {} because its type is {} instead of {}", name, ty, expected);
                    return None;
                }
            }
            _ => {
                debug!("skipping a candidate variable because of different type contexts");
                return None;
            }
        }
    }

    Some(var)
}

/// 変数の値の場所と型
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedValue {
    pub location: ValueLocation,
    pub user_type: CompilerType,
    pub byte_size: u64,
    /// パーサの型コンテキストにコピーした型
    pub parser_type: Option<TypeId>,
}

fn builtin_encoding(encoding: RegisterEncoding) -> Encoding {
    match encoding {
        RegisterEncoding::Sint => Encoding::Signed,
        RegisterEncoding::Ieee754 => Encoding::Float,
        RegisterEncoding::Uint | RegisterEncoding::Vector => Encoding::Unsigned,
    }
}

impl ExpressionDeclMap<'_> {
    fn importing_flag(&self) -> Option<&Cell<bool>> {
        self.parser.as_ref().map(|parser| &parser.importing)
    }

    /// 名前を解決し、見つかったものの宣言を `ctx` に追加する
    pub fn get_decls(&mut self, ctx: &mut NameSearchContext, exe_ctx: &ExecutionContext) {
        let Some(frame) = exe_ctx.frame else {
            return;
        };
        if self.importing_flag().map_or(false, Cell::get) {
            debug!("ignoring a query during an import");
            return;
        }

        let name = ctx.name().to_string();
        debug!("hunting for a definition for '{}'", name);

        if !name.starts_with('$') {
            if let Some(var) = find_variable_in_scope(frame, &name, None) {
                self.add_one_variable(ctx, exe_ctx, &var);
                return;
            }

            let functions = frame.find_functions_by_name(&name);
            let chosen = functions
                .iter()
                .find(|f| matches!(f.kind, FunctionKind::Function { .. }))
                .or_else(|| {
                    functions
                        .iter()
                        .find(|f| f.kind == FunctionKind::Symbol { external: true })
                })
                .or_else(|| {
                    functions
                        .iter()
                        .find(|f| f.kind == FunctionKind::Symbol { external: false })
                });
            if let Some(function) = chosen {
                self.add_one_function(ctx, frame, function);
                return;
            }
        } else if name == CLASS_NAME {
            self.add_object_type(ctx, frame, "this", true);
            return;
        } else if name == OBJC_CLASS_NAME {
            self.add_object_type(ctx, frame, "self", false);
            return;
        } else {
            if let Some(id) = self.session.persistent_variables().get_by_name(&name) {
                self.add_one_persistent(ctx, id);
                return;
            }

            let register = exe_ctx
                .registers
                .and_then(|registers| registers.register_info_by_name(&name[1..]));
            if let Some(register) = register {
                self.add_one_register(ctx, register);
                return;
            }
        }

        if let Some(ty) = frame.find_type_by_name(&name) {
            debug!("matching type found for '{}': {}", name, ty);
            self.add_one_type(ctx, frame, ty, false);
        }
    }

    /// 変数の場所を解決する
    ///
    /// `parser_types` を渡すと、型をパーサの型コンテキストにコピーする。
    /// 最適化で消えた変数や、場所を計算できない変数は `None`。
    pub fn get_variable_value(
        &self,
        exe_ctx: &ExecutionContext,
        var: &Variable,
        parser_types: Option<&mut TypeContext>,
    ) -> Option<ResolvedValue> {
        let frame = exe_ctx.frame?;
        let Some(user_type) = var.ty else {
            debug!("skipping {} because it has no type", var.name);
            return None;
        };
        let src = frame.type_context(user_type.context)?;

        let location = match var.location {
            VariableLocation::FrameOffset(offset) => {
                let Some(base) = frame.frame_base() else {
                    debug!("couldn't compute the frame base for {}", var.name);
                    return None;
                };
                ValueLocation::LoadAddress(base.wrapping_add_signed(offset))
            }
            VariableLocation::Address(file_addr) => {
                ValueLocation::LoadAddress(file_addr.wrapping_add(frame.load_bias()))
            }
            VariableLocation::Register(dwarf) => {
                let register = exe_ctx.registers?.register_info_by_dwarf(dwarf)?;
                ValueLocation::Register(register)
            }
            VariableLocation::OptimizedOut | VariableLocation::Unknown => {
                debug!("{} has no usable location", var.name);
                return None;
            }
        };

        let parser_type = match parser_types {
            Some(dest) => {
                let Some(copied) = guarded_copy_type(self.importing_flag(), dest, src, user_type.id) else {
                    debug!("couldn't copy the type of {} into the parser context", var.name);
                    return None;
                };
                Some(copied)
            }
            None => None,
        };

        Some(ResolvedValue {
            location,
            user_type,
            byte_size: src.byte_size(user_type.id).unwrap_or(0),
            parser_type,
        })
    }

    fn add_one_variable(&mut self, ctx: &mut NameSearchContext, exe_ctx: &ExecutionContext, var: &Variable) {
        let Some(value) = self.get_variable_value(exe_ctx, var, Some(ctx.types_mut())) else {
            return;
        };
        let Some(parser_type) = value.parser_type else {
            return;
        };

        let decl = ctx.add_var_decl(parser_type);
        let (byte_order, address_byte_size) = self.target_layout();
        let mut entity = ExpressionVariable::new(
            ctx.name(),
            Some(value.user_type),
            value.byte_size,
            byte_order,
            address_byte_size,
        );
        let parser_vars = entity.enable_parser_vars();
        parser_vars.parser_type = Some(parser_type);
        parser_vars.named_decl = Some(decl);
        parser_vars.location = Some(value.location.clone());
        self.found_entities.add(entity);

        debug!("found variable {} at {:?}, returned {:?}", var.name, value.location, decl);
    }

    fn add_one_persistent(&mut self, ctx: &mut NameSearchContext, id: PersistentId) {
        let Some(user_type) = self
            .session
            .persistent_variables()
            .get(id)
            .and_then(|var| var.user_type)
        else {
            return;
        };

        let importing = self.parser.as_ref().map(|parser| &parser.importing);
        let Some(parser_type) =
            guarded_copy_type(importing, ctx.types_mut(), self.session.scratch_types(), user_type.id)
        else {
            debug!("couldn't copy the type of {} into the parser context", ctx.name());
            return;
        };

        let decl = ctx.add_var_decl(parser_type);
        if let Some(var) = self.session.persistent_variables_mut().get_mut(id) {
            let parser_vars = var.enable_parser_vars();
            parser_vars.parser_type = Some(parser_type);
            parser_vars.named_decl = Some(decl);
            parser_vars.ir_value = None;
            parser_vars.location = None;
        }
        debug!("added persistent variable {}, returned {:?}", ctx.name(), decl);
    }

    fn add_one_register(&mut self, ctx: &mut NameSearchContext, register: RegisterInfo) {
        let bits = u64::from(register.byte_size) * 8;
        let ty = ctx
            .types_mut()
            .builtin_for_encoding(builtin_encoding(register.encoding), bits);
        let decl = ctx.add_var_decl(ty);

        let (byte_order, address_byte_size) = self.target_layout();
        debug!("added register {}, returned {:?}", register.name, decl);
        let mut entity = ExpressionVariable::for_register(ctx.name(), register, byte_order, address_byte_size);
        let parser_vars = entity.enable_parser_vars();
        parser_vars.parser_type = Some(ty);
        parser_vars.named_decl = Some(decl);
        self.found_entities.add(entity);
    }

    fn add_one_function(&mut self, ctx: &mut NameSearchContext, frame: &dyn StackFrame, function: &FunctionMatch) {
        let (byte_order, address_byte_size) = self.target_layout();

        let (decl, user_type, parser_type) = match &function.kind {
            FunctionKind::Function { ty } => {
                let Some(src) = frame.type_context(ty.context) else {
                    return;
                };
                let Some(copied) = guarded_copy_type(self.importing_flag(), ctx.types_mut(), src, ty.id) else {
                    debug!("couldn't copy the type of function {}", function.name);
                    return;
                };
                (ctx.add_fun_decl(copied), Some(*ty), Some(copied))
            }
            FunctionKind::Symbol { .. } => (ctx.add_generic_fun_decl(), None, None),
        };

        let load_addr = function.address.wrapping_add(frame.load_bias());
        let mut entity = ExpressionVariable::new(
            ctx.name(),
            user_type,
            u64::from(address_byte_size),
            byte_order,
            address_byte_size,
        );
        let parser_vars = entity.enable_parser_vars();
        parser_vars.parser_type = parser_type;
        parser_vars.named_decl = Some(decl);
        parser_vars.location = Some(ValueLocation::LoadAddress(load_addr));
        self.found_entities.add(entity);

        debug!("found function {} at 0x{:x}, returned {:?}", function.name, load_addr, decl);
    }

    fn add_one_type(
        &mut self,
        ctx: &mut NameSearchContext,
        frame: &dyn StackFrame,
        user_type: CompilerType,
        add_method: bool,
    ) -> Option<DeclId> {
        let src = frame.type_context(user_type.context)?;
        let mut copied = guarded_copy_type(self.importing_flag(), ctx.types_mut(), src, user_type.id)?;

        if add_method && ctx.types().is_aggregate(copied) {
            let (_, address_byte_size) = self.target_layout();
            let types = ctx.types_mut();
            let void_ptr = types.void_ptr(u64::from(address_byte_size));
            let method = types.function(None, vec![void_ptr]);
            if let Some(with_method) = types.add_method(copied, EXPR_METHOD_NAME, method) {
                copied = with_method;
            }
        }

        Some(ctx.add_type_decl(copied))
    }

    /// `this` / `self` の型を記録し、指す先の型を宣言する
    fn add_object_type(
        &mut self,
        ctx: &mut NameSearchContext,
        frame: &dyn StackFrame,
        object_name: &str,
        add_method: bool,
    ) {
        let Some(object_type) = frame.find_local_variable(object_name).and_then(|var| var.ty) else {
            return;
        };
        self.struct_vars.object_pointer_type = Some(object_type);

        let Some(src) = frame.type_context(object_type.context) else {
            return;
        };
        if !src.is_pointer(object_type.id) {
            return;
        }
        let Some(pointee) = src.pointee(object_type.id) else {
            return;
        };

        debug!("adding type for {}: {}", ctx.name(), src.type_name(pointee));
        self.add_one_type(
            ctx,
            frame,
            CompilerType::new(object_type.context, pointee),
            add_method,
        );
    }

    /// `this` / `self` のポインタ値をターゲットから読む
    pub fn get_object_pointer(
        &self,
        exe_ctx: &ExecutionContext,
        object_name: &str,
        suppress_type_check: bool,
    ) -> ExprResult<u64> {
        let (Some(frame), Some(process)) = (exe_ctx.frame, exe_ctx.process) else {
            return Err(ExprError::IncompleteContext(object_name.to_string()));
        };
        let pointer_type = self
            .struct_vars
            .object_pointer_type
            .ok_or_else(|| ExprError::UnknownObjectType(object_name.to_string()))?;

        let expected = (!suppress_type_check).then_some(pointer_type);
        let var = find_variable_in_scope(frame, object_name, expected)
            .ok_or_else(|| ExprError::ObjectNotFound(object_name.to_string()))?;

        let value = self
            .get_variable_value(exe_ctx, &var, None)
            .ok_or_else(|| ExprError::NoLocation(object_name.to_string()))?;

        match value.location {
            ValueLocation::LoadAddress(addr) => {
                let address_byte_size = process.address_byte_size();
                let bit_width = frame
                    .type_context(pointer_type.context)
                    .and_then(|types| types.bit_width(pointer_type.id));
                if bit_width != Some(u64::from(address_byte_size) * 8) {
                    return Err(ExprError::PointerSize(object_name.to_string()));
                }

                let mut data = vec![0u8; address_byte_size as usize];
                read_exact(process, addr, &mut data).map_err(|e| ExprError::ObjectRead {
                    name: object_name.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(process.byte_order().decode_u64(&data))
            }
            ValueLocation::Register(_) => Err(ExprError::NotInMemory(object_name.to_string())),
        }
    }
}
