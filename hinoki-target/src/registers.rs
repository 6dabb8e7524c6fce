//! レジスタアクセス機能（x86-64）

use crate::access::{RegisterContext, RegisterEncoding, RegisterInfo};
use crate::{Result, TargetError};
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

/// 汎用レジスタ表を生成する
///
/// レジスタ番号は表内の並び順。DWARF番号は System V x86-64 psABI に従う。
macro_rules! gpr_table {
    ($( $name:ident => $dwarf:expr ),* $(,)?) => {
        const GPRS: &[(&str, Option<u16>)] = &[ $( (stringify!($name), $dwarf) ),* ];

        fn get_gpr(regs: &user_regs_struct, name: &str) -> Option<u64> {
            match name {
                $( stringify!($name) => Some(regs.$name), )*
                _ => None,
            }
        }

        fn set_gpr(regs: &mut user_regs_struct, name: &str, value: u64) -> bool {
            match name {
                $( stringify!($name) => { regs.$name = value; true } )*
                _ => false,
            }
        }
    };
}

gpr_table! {
    rax => Some(0),
    rdx => Some(1),
    rcx => Some(2),
    rbx => Some(3),
    rsi => Some(4),
    rdi => Some(5),
    rbp => Some(6),
    rsp => Some(7),
    r8 => Some(8),
    r9 => Some(9),
    r10 => Some(10),
    r11 => Some(11),
    r12 => Some(12),
    r13 => Some(13),
    r14 => Some(14),
    r15 => Some(15),
    rip => Some(16),
    eflags => Some(49),
    es => Some(50),
    cs => Some(51),
    ss => Some(52),
    ds => Some(53),
    fs => Some(54),
    gs => Some(55),
    fs_base => Some(58),
    gs_base => Some(59),
    orig_rax => None,
}

/// 32ビットのサブレジスタ（下位4バイト）
const SUBREGISTERS: &[(&str, &str)] = &[
    ("eax", "rax"),
    ("ebx", "rbx"),
    ("ecx", "rcx"),
    ("edx", "rdx"),
    ("esi", "rsi"),
    ("edi", "rdi"),
    ("ebp", "rbp"),
    ("esp", "rsp"),
];

/// レジスタ情報
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.pid)?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        Ok(self.read()?.rip)
    }

    /// フレームベース（RBP）を取得する
    pub fn get_rbp(&self) -> Result<u64> {
        Ok(self.read()?.rbp)
    }

    /// レジスタ名を親の64ビットレジスタ名に解決する
    fn parent_of(name: &str) -> &str {
        SUBREGISTERS
            .iter()
            .find(|(sub, _)| *sub == name)
            .map(|(_, parent)| *parent)
            .unwrap_or(name)
    }
}

impl RegisterContext for Registers {
    fn register_info_by_name(&self, name: &str) -> Option<RegisterInfo> {
        if let Some(index) = GPRS.iter().position(|(n, _)| *n == name) {
            let (name, dwarf) = GPRS[index];
            return Some(RegisterInfo::new(name, index as u32, dwarf, 8, RegisterEncoding::Uint));
        }

        SUBREGISTERS
            .iter()
            .position(|(sub, _)| *sub == name)
            .map(|index| {
                RegisterInfo::new(
                    SUBREGISTERS[index].0,
                    (GPRS.len() + index) as u32,
                    None,
                    4,
                    RegisterEncoding::Uint,
                )
            })
    }

    fn register_info_by_dwarf(&self, regnum: u16) -> Option<RegisterInfo> {
        GPRS.iter()
            .find(|(_, dwarf)| *dwarf == Some(regnum))
            .and_then(|(name, _)| self.register_info_by_name(name))
    }

    fn read_register_bytes(&self, reg: &RegisterInfo) -> Result<Vec<u8>> {
        let regs = self.read()?;
        let value = get_gpr(&regs, Self::parent_of(&reg.name))
            .ok_or_else(|| TargetError::UnknownRegister(reg.name.clone()))?;

        let size = (reg.byte_size as usize).min(8);
        Ok(value.to_le_bytes()[..size].to_vec())
    }

    fn write_register_bytes(&self, reg: &RegisterInfo, bytes: &[u8]) -> Result<()> {
        if bytes.len() != reg.byte_size as usize || bytes.len() > 8 {
            return Err(TargetError::RegisterSize {
                register: reg.name.clone(),
                expected: reg.byte_size as usize,
                actual: bytes.len(),
            }
            .into());
        }

        let mut regs = self.read()?;
        let parent = Self::parent_of(&reg.name);
        let current = get_gpr(&regs, parent)
            .ok_or_else(|| TargetError::UnknownRegister(reg.name.clone()))?;

        // サブレジスタの場合は下位バイトのみ置き換える
        let mut value = current.to_le_bytes();
        value[..bytes.len()].copy_from_slice(bytes);
        set_gpr(&mut regs, parent, u64::from_le_bytes(value));

        self.write(regs)
    }
}
