//! Hinoki ターゲットプロセスアクセス
//!
//! このクレートは、式の実体化がデバッグ対象に触れるためのケーパビリティ
//! （メモリ読み書き、メモリ確保、レジスタ読み書き）を定義し、
//! ptrace によるバックエンドと、テスト用のシミュレータを提供します。

pub mod access;
pub mod memory;
pub mod process;
pub mod registers;
pub mod simulated;

pub use access::{
    read_exact, write_all, ByteOrder, Permissions, RegisterContext, RegisterEncoding,
    RegisterInfo, TargetMemory,
};
pub use memory::Memory;
pub use process::{Process, StopReason};
pub use registers::Registers;
pub use simulated::{SimulatedProcess, SimulatedRegisters};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;

/// ターゲットアクセスのエラー
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("unknown register '{0}'")]
    UnknownRegister(String),

    #[error("register {register} is {expected} bytes, got {actual}")]
    RegisterSize {
        register: String,
        expected: usize,
        actual: usize,
    },

    #[error("address range 0x{addr:x}+{len} is not mapped")]
    Unmapped { addr: u64, len: usize },

    #[error("0x{0:x} was not returned by allocate_memory")]
    UnknownAllocation(u64),

    #[error("{name} failed with errno {errno}")]
    Syscall { name: &'static str, errno: i64 },

    #[error("injected failure: {0}")]
    Injected(&'static str),
}
