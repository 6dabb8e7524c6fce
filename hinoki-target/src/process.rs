//! プロセス制御機能
//!
//! ptrace でトレース中のプロセスを [`TargetMemory`] / [`RegisterContext`] として公開します。
//! ターゲット内のメモリ確保は、停止中の PC に `syscall` 命令を一時的に書き込み、
//! `mmap` / `munmap` を1命令だけ実行させることで行います。

use crate::access::{
    read_exact, write_all, ByteOrder, Permissions, RegisterContext, RegisterInfo, TargetMemory,
};
use crate::{Memory, Registers, Result, TargetError};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;
use tracing::{debug, warn};

/// `syscall` 命令
const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];

const SYS_MMAP: u64 = 9;
const SYS_MUNMAP: u64 = 11;

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// ブレークポイントヒット（SIGTRAP）
    Breakpoint,
    /// ステップ実行完了（SIGTRAP）
    Step,
    /// シグナル受信
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// その他の停止
    Other,
}

/// デバッグ対象のプロセス
pub struct Process {
    pid: nix::unistd::Pid,
    memory: Memory,
    registers: Registers,
    /// 注入した mmap の領域（アドレス -> サイズ）
    allocations: RefCell<HashMap<u64, usize>>,
}

impl Process {
    fn from_pid(pid: nix::unistd::Pid) -> Self {
        Self {
            pid,
            memory: Memory::new(pid.as_raw()),
            registers: Registers::new(pid.as_raw()),
            allocations: RefCell::new(HashMap::new()),
        }
    }

    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// forkした子プロセスで PTRACE_TRACEME を設定してから execve します。
    /// execve 直後の停止から1ステップ進め、メモリマッピングが初期化された状態で返します。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        use nix::sys::ptrace;
        use nix::unistd::{execve, fork, ForkResult};

        let program_path = program
            .as_ref()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid program path"))?;
        let program_cstring = CString::new(program_path)?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str())?);
        }

        let env: Vec<CString> = std::env::vars()
            .map(|(key, val)| CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from))
            .collect::<Result<Vec<_>>>()?;

        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => {}
                    status => {
                        return Err(anyhow::anyhow!("Unexpected wait status after execve: {:?}", status));
                    }
                }

                ptrace::step(child, None)?;
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => {
                        debug!("spawned {} as pid {}", program_path, child);
                        Ok(Self::from_pid(child))
                    }
                    status => Err(anyhow::anyhow!("Unexpected wait status after step: {:?}", status)),
                }
            }
            ForkResult::Child => {
                ptrace::traceme()?;
                execve(&program_cstring, &cstring_args, &env)?;
                unreachable!("execve failed");
            }
        }
    }

    /// 既存のプロセスにアタッチし、停止するまで待つ
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = nix::unistd::Pid::from_raw(pid);
        nix::sys::ptrace::attach(pid)?;

        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, _) => Ok(Self::from_pid(pid)),
            status => Err(anyhow::anyhow!("Unexpected wait status after attach: {:?}", status)),
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// メモリアクセスを取得する
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// レジスタアクセスを取得する
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// プロセスを実行継続して停止イベントを待機する
    pub fn continue_and_wait(&self) -> Result<StopReason> {
        nix::sys::ptrace::cont(self.pid, None)?;
        self.wait_stop(StopReason::Breakpoint)
    }

    /// 1命令だけ実行して停止する（ステップイン）
    pub fn step(&self) -> Result<StopReason> {
        nix::sys::ptrace::step(self.pid, None)?;
        self.wait_stop(StopReason::Step)
    }

    /// 停止イベントを待機し、SIGTRAP を `on_trap` として報告する
    fn wait_stop(&self, on_trap: StopReason) -> Result<StopReason> {
        match waitpid(self.pid, None)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => Ok(on_trap),
            WaitStatus::Stopped(_, signal) => Ok(StopReason::Signal(signal)),
            WaitStatus::Exited(_, code) => Ok(StopReason::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Ok(StopReason::Signal(signal)),
            _ => Ok(StopReason::Other),
        }
    }

    /// 停止中の PC でシステムコールを1回だけ実行させる
    ///
    /// PC の2バイトとレジスタは、成功・失敗にかかわらず元に戻す。
    fn inject_syscall(&self, name: &'static str, number: u64, args: [u64; 6]) -> Result<u64> {
        let saved = self.registers.read()?;
        let pc = saved.rip;

        let mut regs = saved;
        regs.rax = number;
        regs.orig_rax = u64::MAX;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
        regs.rip = pc;

        let outcome = with_patched_code(self, pc, &SYSCALL_INSN, || {
            self.registers.write(regs)?;
            match self.step()? {
                StopReason::Step => Ok(self.registers.read()?.rax),
                other => Err(anyhow::anyhow!("{} injection stopped unexpectedly: {:?}", name, other)),
            }
        });
        // 命令の復元に失敗してもレジスタは戻す
        let restored = self.registers.write(saved);

        let ret = outcome?;
        restored?;
        let signed = ret as i64;
        if (-4095..0).contains(&signed) {
            return Err(TargetError::Syscall { name, errno: -signed }.into());
        }

        debug!("injected {} returned 0x{:x}", name, ret);
        Ok(ret)
    }
}

/// `addr` の命令を `patch` で置き換えて `body` を実行し、元の命令に戻す
///
/// 元の命令を読み切れなければ何も書き込まない。`body` が失敗しても命令は戻す。
pub(crate) fn with_patched_code<T>(
    memory: &dyn TargetMemory,
    addr: u64,
    patch: &[u8],
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let mut original = vec![0u8; patch.len()];
    read_exact(memory, addr, &mut original)?;
    write_all(memory, addr, patch)?;

    let outcome = body();
    let restored = write_all(memory, addr, &original);
    match (outcome, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore)) => {
            warn!("couldn't restore the code at 0x{:x}: {}", addr, restore);
            Err(e)
        }
    }
}

impl TargetMemory for Process {
    fn byte_order(&self) -> ByteOrder {
        ByteOrder::Little
    }

    fn address_byte_size(&self) -> u32 {
        8
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        self.memory.read(addr, buf)
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize> {
        self.memory.write(addr, data)
    }

    fn allocate_memory(&self, size: usize, permissions: Permissions) -> Result<u64> {
        use nix::libc::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};

        let mut prot = 0;
        if permissions.readable {
            prot |= PROT_READ;
        }
        if permissions.writable {
            prot |= PROT_WRITE;
        }
        if permissions.executable {
            prot |= PROT_EXEC;
        }

        let addr = self.inject_syscall(
            "mmap",
            SYS_MMAP,
            [0, size as u64, prot as u64, (MAP_PRIVATE | MAP_ANONYMOUS) as u64, u64::MAX, 0],
        )?;

        self.allocations.borrow_mut().insert(addr, size);
        Ok(addr)
    }

    fn deallocate_memory(&self, addr: u64) -> Result<()> {
        let size = self
            .allocations
            .borrow_mut()
            .remove(&addr)
            .ok_or(TargetError::UnknownAllocation(addr))?;

        self.inject_syscall("munmap", SYS_MUNMAP, [addr, size as u64, 0, 0, 0, 0])?;
        Ok(())
    }
}

impl RegisterContext for Process {
    fn register_info_by_name(&self, name: &str) -> Option<RegisterInfo> {
        self.registers.register_info_by_name(name)
    }

    fn register_info_by_dwarf(&self, regnum: u16) -> Option<RegisterInfo> {
        self.registers.register_info_by_dwarf(regnum)
    }

    fn read_register_bytes(&self, reg: &RegisterInfo) -> Result<Vec<u8>> {
        self.registers.read_register_bytes(reg)
    }

    fn write_register_bytes(&self, reg: &RegisterInfo, bytes: &[u8]) -> Result<()> {
        self.registers.write_register_bytes(reg, bytes)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = nix::sys::ptrace::detach(self.pid, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatedProcess;

    const CODE: u64 = 0x4000;

    fn target() -> SimulatedProcess {
        let process = SimulatedProcess::little_endian();
        process.map_region(CODE, vec![0x55, 0x48, 0x89, 0xe5]);
        process
    }

    #[test]
    fn test_patched_code_is_restored() {
        let process = target();
        let seen = with_patched_code(&process, CODE, &SYSCALL_INSN, || process.read_bytes(CODE, 2)).unwrap();

        assert_eq!(seen, SYSCALL_INSN.to_vec());
        assert_eq!(process.read_bytes(CODE, 4).unwrap(), vec![0x55, 0x48, 0x89, 0xe5]);
    }

    #[test]
    fn test_patched_code_is_restored_after_failure() {
        let process = target();
        let err = with_patched_code(&process, CODE, &SYSCALL_INSN, || -> Result<()> {
            Err(anyhow::anyhow!("step failed"))
        })
        .unwrap_err();

        assert_eq!(err.to_string(), "step failed");
        assert_eq!(process.read_bytes(CODE, 2).unwrap(), vec![0x55, 0x48]);
    }

    #[test]
    fn test_unreadable_code_is_not_patched() {
        let process = target();
        process.poison_read(CODE + 1);
        let mut ran = false;
        let result = with_patched_code(&process, CODE, &SYSCALL_INSN, || {
            ran = true;
            Ok(())
        });

        assert!(result.is_err());
        assert!(!ran);
        process.clear_poison();
        assert_eq!(process.read_bytes(CODE, 2).unwrap(), vec![0x55, 0x48]);
    }

    #[test]
    fn test_failed_restore_is_reported() {
        let process = target();
        let result = with_patched_code(&process, CODE, &SYSCALL_INSN, || {
            process.poison_write(CODE);
            Ok(0x7f00_0000u64)
        });

        assert!(result.is_err());
    }
}
