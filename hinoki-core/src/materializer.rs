//! 引数構造体の実体化と逆実体化
//!
//! 実体化ではターゲットに構造体の領域を確保し、各メンバの値を本来の場所
//! （メモリ、レジスタ、永続変数のバッファ）から構造体にコピーします。
//! 逆実体化では逆向きにコピーしてから領域を解放します。
//!
//! 途中でメンバのコピーが失敗しても、それまでにコピーしたメンバは元に戻しません。
//! 逆実体化では、実体化を終えたメンバだけを書き戻します。

use crate::context::ExecutionContext;
use crate::decl_map::{EntityRef, ExpressionDeclMap, MaterialVars};
use crate::errors::{ExprError, ExprResult};
use crate::lookup::find_variable_in_scope;
use crate::persistent::PersistentId;
use crate::struct_layout::align_up;
use crate::variable::ValueLocation;
use hinoki_dwarf::CompilerType;
use hinoki_target::{read_exact, write_all, ByteOrder, Permissions, RegisterContext, RegisterInfo, TargetMemory};
use std::fmt;
use tracing::{debug, warn};

/// ダンプ1行あたりのバイト数
const DUMP_BYTES_PER_LINE: usize = 16;

/// コピーの向き
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// 本来の場所 → 構造体
    Materialize,
    /// 構造体 → 本来の場所
    Dematerialize,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Materialize => write!(f, "materializing"),
            Direction::Dematerialize => write!(f, "dematerializing"),
        }
    }
}

/// メンバの値の出どころ
enum MemberSource {
    /// `$reg` で参照されたレジスタ
    Register(RegisterInfo),
    /// フレームから見える変数（コピーのたびに探し直す）
    Variable { user_type: Option<CompilerType> },
    /// 永続変数
    Persistent { id: PersistentId, is_result: bool },
}

/// レジスタと構造体のスロットの間でコピーする
///
/// スロットがレジスタより小さければ、リトルエンディアンでは下位バイト、
/// ビッグエンディアンでは上位バイトを使う。レジスタへの書き戻しでは残りのバイトを保つ。
fn move_register(
    process: &dyn TargetMemory,
    registers: &dyn RegisterContext,
    name: &str,
    register: &RegisterInfo,
    slot_size: u64,
    addr: u64,
    direction: Direction,
) -> ExprResult<()> {
    let register_size = u64::from(register.byte_size);
    if slot_size > register_size {
        return Err(ExprError::RegisterTooSmall {
            value: name.to_string(),
            register: register.name.clone(),
        });
    }

    let offset = match process.byte_order() {
        ByteOrder::Little => 0,
        ByteOrder::Big => (register_size - slot_size) as usize,
    };
    let range = offset..offset + slot_size as usize;

    let read_register = || {
        let bytes = registers
            .read_register_bytes(register)
            .map_err(|e| ExprError::RegisterRead {
                value: name.to_string(),
                register: register.name.clone(),
                reason: e.to_string(),
            })?;
        if bytes.len() < range.end {
            return Err(ExprError::RegisterRead {
                value: name.to_string(),
                register: register.name.clone(),
                reason: format!("got {} bytes, expected {}", bytes.len(), register_size),
            });
        }
        Ok(bytes)
    };

    match direction {
        Direction::Materialize => {
            let bytes = read_register()?;
            write_all(process, addr, &bytes[range]).map_err(|e| ExprError::Write {
                what: name.to_string(),
                reason: e.to_string(),
            })?;
        }
        Direction::Dematerialize => {
            let mut slot = vec![0u8; slot_size as usize];
            read_exact(process, addr, &mut slot).map_err(|e| ExprError::Read {
                what: name.to_string(),
                reason: e.to_string(),
            })?;

            let mut bytes = if slot_size == register_size {
                vec![0u8; register_size as usize]
            } else {
                read_register()?
            };
            bytes[range].copy_from_slice(&slot);

            registers
                .write_register_bytes(register, &bytes)
                .map_err(|e| ExprError::RegisterWrite {
                    value: name.to_string(),
                    register: register.name.clone(),
                    reason: e.to_string(),
                })?;
        }
    }

    debug!("{} {} via {}", direction, name, register.name);
    Ok(())
}

/// バイト列を16進とASCIIでダンプする
fn dump_bytes(out: &mut String, bytes: &[u8], address: u64) {
    for (line, chunk) in bytes.chunks(DUMP_BYTES_PER_LINE).enumerate() {
        let line_address = address + (line * DUMP_BYTES_PER_LINE) as u64;
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!(
            "0x{:016x}: {:<width$}  {}\n",
            line_address,
            hex.join(" "),
            ascii,
            width = DUMP_BYTES_PER_LINE * 3 - 1
        ));
    }
}

impl ExpressionDeclMap<'_> {
    /// 構造体をターゲットに実体化し、そのアドレスを返す
    ///
    /// 構造体のサイズが0なら領域は確保せず `None` を返す。
    pub fn materialize(&mut self, exe_ctx: &ExecutionContext) -> ExprResult<Option<u64>> {
        if !self.struct_vars.laid_out {
            return Err(ExprError::NotLaidOut);
        }
        exe_ctx.require_frame()?;

        let size = self.struct_vars.size;
        let alignment = self.struct_vars.alignment;
        let material = self.material.get_or_insert_with(MaterialVars::default);
        material.materialized_count = 0;

        if size == 0 {
            debug!("not allocating a struct because no arguments are needed");
            return Ok(None);
        }

        let process = exe_ctx.require_process()?;

        if let Some(previous) = material.allocated_area.take() {
            material.materialized_location = None;
            if let Err(e) = process.deallocate_memory(previous) {
                warn!("couldn't release the previous struct at 0x{:x}: {}", previous, e);
            }
        }

        let alloc_size = alignment + size;
        let area = process
            .allocate_memory(alloc_size as usize, Permissions::READ_WRITE)
            .map_err(|e| ExprError::Allocation {
                size: alloc_size,
                reason: e.to_string(),
            })?;
        let location = align_up(area, alignment);
        material.allocated_area = Some(area);
        material.materialized_location = Some(location);
        debug!(
            "allocated {} bytes at 0x{:x}, struct at 0x{:x}",
            alloc_size, area, location
        );

        for index in 0..self.struct_vars.members.len() {
            self.move_member(exe_ctx, index, location, Direction::Materialize)?;
            if let Some(material) = self.material.as_mut() {
                material.materialized_count = index + 1;
            }
        }

        Ok(Some(location))
    }

    /// 構造体から値を書き戻し、領域を解放する
    ///
    /// 結果変数がメンバにあればその ID を返す。コピーに失敗しても領域は解放し、
    /// 最初のエラーを返す。実体化されていなければ何もしない。
    pub fn dematerialize(&mut self, exe_ctx: &ExecutionContext) -> ExprResult<Option<PersistentId>> {
        let Some(material) = &self.material else {
            return Ok(None);
        };
        let count = material.materialized_count;
        let location = material.materialized_location;

        let copied = match location {
            Some(location) => self.copy_back(exe_ctx, location, count),
            None => Ok(None),
        };
        let released = self.did_dematerialize(exe_ctx);

        let result = copied?;
        released?;
        Ok(result)
    }

    fn copy_back(&mut self, exe_ctx: &ExecutionContext, location: u64, count: usize) -> ExprResult<Option<PersistentId>> {
        if !self.struct_vars.laid_out {
            return Err(ExprError::NotLaidOut);
        }
        exe_ctx.require_frame()?;

        let mut result = None;
        for index in 0..count {
            if let Some(id) = self.move_member(exe_ctx, index, location, Direction::Dematerialize)? {
                result = Some(id);
            }
        }
        Ok(result)
    }

    /// 構造体の領域を解放し、実体化の状態とメンバのレイアウトを破棄する
    ///
    /// 解放に失敗した場合は状態を残すので、もう一度呼べば解放をやり直せる。
    pub fn did_dematerialize(&mut self, exe_ctx: &ExecutionContext) -> ExprResult<()> {
        let Some(material) = &self.material else {
            return Ok(());
        };

        if let Some(area) = material.allocated_area {
            let process = exe_ctx.require_process()?;
            process
                .deallocate_memory(area)
                .map_err(|e| ExprError::Deallocation {
                    addr: area,
                    reason: e.to_string(),
                })?;
            debug!("released struct area at 0x{:x}", area);
        }

        self.material = None;
        self.disable_struct_vars();
        Ok(())
    }

    /// メンバ1つをコピーする。逆実体化で結果変数を書き戻したらその ID を返す
    fn move_member(
        &mut self,
        exe_ctx: &ExecutionContext,
        index: usize,
        base: u64,
        direction: Direction,
    ) -> ExprResult<Option<PersistentId>> {
        let entity = self.struct_vars.members[index];
        let var = self
            .entity(entity)
            .ok_or_else(|| ExprError::UnexpectedVariable(format!("{:?}", entity)))?;
        let jit = var
            .jit_vars
            .ok_or_else(|| ExprError::MissingLayoutInfo(var.name.clone()))?;
        let name = var.name.clone();
        let addr = base + jit.offset;

        let source = match entity {
            EntityRef::Found(_) => match &var.register_info {
                Some(register) => MemberSource::Register(register.clone()),
                None => MemberSource::Variable {
                    user_type: var.user_type,
                },
            },
            EntityRef::Persistent(id) => MemberSource::Persistent {
                id,
                is_result: self.struct_vars.result_name.as_deref() == Some(name.as_str()),
            },
        };

        match source {
            MemberSource::Register(register) => {
                let process = exe_ctx.require_process()?;
                let registers = exe_ctx.require_registers(&name)?;
                move_register(process, registers, &name, &register, jit.size, addr, direction)?;
            }
            MemberSource::Variable { user_type } => {
                self.move_variable(exe_ctx, &name, user_type, addr, direction)?;
            }
            MemberSource::Persistent { id, is_result } => {
                if is_result {
                    if direction == Direction::Materialize {
                        return Ok(None);
                    }
                    debug!("found result member {} in the struct", name);
                }
                self.move_persistent(exe_ctx, id, addr, direction)?;
                if is_result {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    /// フレームの変数と構造体のスロットの間でコピーする
    fn move_variable(
        &self,
        exe_ctx: &ExecutionContext,
        name: &str,
        user_type: Option<CompilerType>,
        addr: u64,
        direction: Direction,
    ) -> ExprResult<()> {
        let frame = exe_ctx.require_frame()?;
        let process = exe_ctx.require_process()?;

        let var = find_variable_in_scope(frame, name, user_type)
            .ok_or_else(|| ExprError::VariableNotFound(name.to_string()))?;
        debug!("{} {}", direction, name);

        let value = self
            .get_variable_value(exe_ctx, &var, None)
            .ok_or_else(|| ExprError::NoValue(name.to_string()))?;

        match value.location {
            ValueLocation::LoadAddress(value_addr) => {
                let (src, dest) = match direction {
                    Direction::Materialize => (value_addr, addr),
                    Direction::Dematerialize => (addr, value_addr),
                };
                let mut data = vec![0u8; value.byte_size as usize];
                read_exact(process, src, &mut data).map_err(|e| ExprError::Read {
                    what: name.to_string(),
                    reason: e.to_string(),
                })?;
                write_all(process, dest, &data).map_err(|e| ExprError::Write {
                    what: name.to_string(),
                    reason: e.to_string(),
                })?;
                debug!("copied {} bytes from 0x{:x} to 0x{:x}", data.len(), src, dest);
            }
            ValueLocation::Register(register) => {
                let registers = exe_ctx.require_registers(name)?;
                move_register(process, registers, name, &register, value.byte_size, addr, direction)?;
            }
        }
        Ok(())
    }

    /// 永続変数のバッファと構造体のスロットの間でコピーする
    fn move_persistent(
        &mut self,
        exe_ctx: &ExecutionContext,
        id: PersistentId,
        addr: u64,
        direction: Direction,
    ) -> ExprResult<()> {
        let process = exe_ctx.require_process()?;
        let var = self
            .session
            .persistent_variables_mut()
            .get_mut(id)
            .ok_or_else(|| ExprError::UnexpectedVariable(format!("persistent #{}", id)))?;
        let name = var.name.clone();

        match direction {
            Direction::Materialize => {
                let bytes = var
                    .value_bytes()
                    .ok_or_else(|| ExprError::NoValue(name.clone()))?;
                write_all(process, addr, bytes).map_err(|e| ExprError::Write {
                    what: name.clone(),
                    reason: e.to_string(),
                })?;
            }
            Direction::Dematerialize => {
                let bytes = var
                    .value_bytes_mut()
                    .ok_or_else(|| ExprError::NoValue(name.clone()))?;
                read_exact(process, addr, bytes).map_err(|e| ExprError::Read {
                    what: name.clone(),
                    reason: e.to_string(),
                })?;
                var.flags.value_updated = true;
            }
        }
        debug!("{} persistent variable {}", direction, name);
        Ok(())
    }

    /// 実体化した構造体の内容をメンバごとにダンプする
    pub fn dump_materialized_struct(&self, exe_ctx: &ExecutionContext) -> ExprResult<String> {
        if !self.struct_vars.laid_out {
            return Err(ExprError::NotLaidOut);
        }
        let process = exe_ctx.require_process()?;
        let location = self
            .materialized_location()
            .ok_or(ExprError::NotMaterialized)?;

        let mut data = vec![0u8; self.struct_vars.size as usize];
        read_exact(process, location, &mut data).map_err(|e| ExprError::Read {
            what: "struct".to_string(),
            reason: e.to_string(),
        })?;

        let mut out = String::new();
        for &member in &self.struct_vars.members {
            let var = self
                .entity(member)
                .ok_or_else(|| ExprError::UnexpectedVariable(format!("{:?}", member)))?;
            out.push_str(&format!("[{}]\n", var.name));

            let jit = var
                .jit_vars
                .ok_or_else(|| ExprError::MissingLayoutInfo(var.name.clone()))?;
            let start = jit.offset as usize;
            let slot = data
                .get(start..start + jit.size as usize)
                .ok_or_else(|| ExprError::MissingLayoutInfo(var.name.clone()))?;
            dump_bytes(&mut out, slot, location + jit.offset);
            out.push('\n');
        }
        Ok(out)
    }
}
