//! ターゲットアクセスのケーパビリティ
//!
//! 式の実体化（materialize）はこのトレイト経由でのみターゲットに触れます。
//! ptrace バックエンドでもシミュレータでも、すべての操作は失敗し得ます。

use crate::Result;

/// ターゲットのバイトオーダー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// ホストのバイトオーダー
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// 整数を `size` バイトに切り詰めてエンコードする
    pub fn encode_u64(self, value: u64, size: usize) -> Vec<u8> {
        let size = size.min(8);
        match self {
            ByteOrder::Little => value.to_le_bytes()[..size].to_vec(),
            ByteOrder::Big => value.to_be_bytes()[8 - size..].to_vec(),
        }
    }

    /// 最大8バイトの列を整数としてデコードする
    pub fn decode_u64(self, bytes: &[u8]) -> u64 {
        let bytes = &bytes[..bytes.len().min(8)];
        match self {
            ByteOrder::Little => bytes
                .iter()
                .rev()
                .fold(0u64, |acc, &b| (acc << 8) | b as u64),
            ByteOrder::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64),
        }
    }
}

/// メモリ確保時のパーミッション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl Permissions {
    /// 読み書き可能（実行不可）
    pub const READ_WRITE: Permissions = Permissions {
        readable: true,
        writable: true,
        executable: false,
    };
}

/// レジスタ値のエンコーディング
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterEncoding {
    Uint,
    Sint,
    Ieee754,
    Vector,
}

/// レジスタ記述子
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegisterInfo {
    /// レジスタ名（`rax` など）
    pub name: String,
    /// レジスタコンテキスト内の番号
    pub number: u32,
    /// DWARFレジスタ番号
    pub dwarf: Option<u16>,
    /// バイトサイズ
    pub byte_size: u32,
    pub encoding: RegisterEncoding,
}

impl RegisterInfo {
    pub fn new(name: &str, number: u32, dwarf: Option<u16>, byte_size: u32, encoding: RegisterEncoding) -> Self {
        Self {
            name: name.to_string(),
            number,
            dwarf,
            byte_size,
            encoding,
        }
    }
}

/// ターゲットプロセスのメモリ操作
///
/// 読み書きは実際に転送したバイト数を返します。呼び出し側は要求サイズとの一致を確認すること。
pub trait TargetMemory {
    /// ターゲットのバイトオーダー
    fn byte_order(&self) -> ByteOrder;

    /// アドレスのバイトサイズ
    fn address_byte_size(&self) -> u32;

    /// メモリを読み取る
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize>;

    /// メモリに書き込む
    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize>;

    /// ターゲット内にメモリを確保する
    ///
    /// 返されるアドレスのアラインメントは保証されない。
    fn allocate_memory(&self, size: usize, permissions: Permissions) -> Result<u64>;

    /// `allocate_memory` で確保した領域を解放する
    fn deallocate_memory(&self, addr: u64) -> Result<()>;
}

/// 現在のスレッドのレジスタ操作
pub trait RegisterContext {
    /// 名前からレジスタ記述子を検索する
    fn register_info_by_name(&self, name: &str) -> Option<RegisterInfo>;

    /// DWARFレジスタ番号からレジスタ記述子を検索する
    fn register_info_by_dwarf(&self, regnum: u16) -> Option<RegisterInfo>;

    /// レジスタの生バイト列を読み取る（ターゲットのバイトオーダー、`byte_size` バイト）
    fn read_register_bytes(&self, reg: &RegisterInfo) -> Result<Vec<u8>>;

    /// レジスタに生バイト列を書き込む
    fn write_register_bytes(&self, reg: &RegisterInfo, bytes: &[u8]) -> Result<()>;
}

/// 読み取りを要求サイズ分まで行い、足りなければエラーにする
pub fn read_exact(memory: &dyn TargetMemory, addr: u64, buf: &mut [u8]) -> Result<()> {
    let read = memory.read_memory(addr, buf)?;
    if read != buf.len() {
        return Err(anyhow::anyhow!(
            "short read at 0x{:x}: {} of {} bytes",
            addr,
            read,
            buf.len()
        ));
    }
    Ok(())
}

/// 書き込みを要求サイズ分まで行い、足りなければエラーにする
pub fn write_all(memory: &dyn TargetMemory, addr: u64, data: &[u8]) -> Result<()> {
    let written = memory.write_memory(addr, data)?;
    if written != data.len() {
        return Err(anyhow::anyhow!(
            "short write at 0x{:x}: {} of {} bytes",
            addr,
            written,
            data.len()
        ));
    }
    Ok(())
}
