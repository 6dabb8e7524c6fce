//! メモリ上のシミュレートされたターゲット
//!
//! 実プロセスを使わずに実体化の経路を検証するためのバックエンドです。
//! バイトオーダーとアドレス幅を設定でき、アラインメントをずらした確保や
//! 読み書き・確保の失敗注入ができます。

use crate::access::{ByteOrder, Permissions, RegisterContext, RegisterEncoding, RegisterInfo, TargetMemory};
use crate::{Result, TargetError};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// 確保領域を配置し始めるアドレス
const ALLOCATION_BASE: u64 = 0x7000_0000;
/// 確保領域同士の間隔
const ALLOCATION_STRIDE: u64 = 0x1_0000;

#[derive(Default)]
struct SimulatedMemory {
    /// 開始アドレス -> 内容
    regions: BTreeMap<u64, Vec<u8>>,
    /// allocate_memory が返したアドレス -> 領域の開始アドレス
    allocations: HashMap<u64, u64>,
    next_allocation: u64,
    allocation_count: usize,
    deallocation_count: usize,
    /// 最後に確保したサイズ
    last_allocation_size: Option<usize>,
}

impl SimulatedMemory {
    /// `[addr, addr + len)` を含む領域と、その領域内のオフセットを返す
    fn locate(&self, addr: u64, len: usize) -> Option<(u64, usize)> {
        let (&base, bytes) = self.regions.range(..=addr).next_back()?;
        let offset = (addr - base) as usize;
        (offset + len <= bytes.len()).then_some((base, offset))
    }
}

/// シミュレートされたプロセス
pub struct SimulatedProcess {
    byte_order: ByteOrder,
    address_byte_size: u32,
    memory: RefCell<SimulatedMemory>,
    /// allocate_memory が返すアドレスをずらすバイト数
    allocation_skew: Cell<u64>,
    fail_allocations: Cell<bool>,
    poisoned_reads: RefCell<Vec<u64>>,
    poisoned_writes: RefCell<Vec<u64>>,
}

impl SimulatedProcess {
    /// 空のアドレス空間を持つプロセスを作成する
    pub fn new(byte_order: ByteOrder, address_byte_size: u32) -> Self {
        Self {
            byte_order,
            address_byte_size,
            memory: RefCell::new(SimulatedMemory {
                next_allocation: ALLOCATION_BASE,
                ..Default::default()
            }),
            allocation_skew: Cell::new(0),
            fail_allocations: Cell::new(false),
            poisoned_reads: RefCell::new(Vec::new()),
            poisoned_writes: RefCell::new(Vec::new()),
        }
    }

    /// リトルエンディアン64ビットのプロセス
    pub fn little_endian() -> Self {
        Self::new(ByteOrder::Little, 8)
    }

    /// ビッグエンディアン64ビットのプロセス
    pub fn big_endian() -> Self {
        Self::new(ByteOrder::Big, 8)
    }

    /// 指定アドレスに初期内容を持つ領域をマップする
    pub fn map_region(&self, addr: u64, bytes: Vec<u8>) {
        self.memory.borrow_mut().regions.insert(addr, bytes);
    }

    /// 確保したアドレスを `skew` バイトずらして返すようにする
    pub fn set_allocation_skew(&self, skew: u64) {
        self.allocation_skew.set(skew);
    }

    /// 以降の allocate_memory を失敗させる
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.set(fail);
    }

    /// 指定アドレスを含む読み取りを失敗させる
    pub fn poison_read(&self, addr: u64) {
        self.poisoned_reads.borrow_mut().push(addr);
    }

    /// 指定アドレスを含む書き込みを失敗させる
    pub fn poison_write(&self, addr: u64) {
        self.poisoned_writes.borrow_mut().push(addr);
    }

    /// 失敗注入をすべて解除する
    pub fn clear_poison(&self) {
        self.poisoned_reads.borrow_mut().clear();
        self.poisoned_writes.borrow_mut().clear();
    }

    /// テスト用: 指定範囲を読み取る
    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_memory(addr, &mut buf)?;
        Ok(buf)
    }

    /// テスト用: 指定範囲に書き込む
    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.write_memory(addr, data)?;
        Ok(())
    }

    /// 解放されていない確保の数
    pub fn live_allocations(&self) -> usize {
        self.memory.borrow().allocations.len()
    }

    /// allocate_memory が成功した回数
    pub fn allocation_count(&self) -> usize {
        self.memory.borrow().allocation_count
    }

    /// deallocate_memory が成功した回数
    pub fn deallocation_count(&self) -> usize {
        self.memory.borrow().deallocation_count
    }

    /// 最後に確保を要求されたサイズ
    pub fn last_allocation_size(&self) -> Option<usize> {
        self.memory.borrow().last_allocation_size
    }

    fn check_poison(list: &RefCell<Vec<u64>>, addr: u64, len: usize) -> Result<()> {
        let end = addr.saturating_add(len as u64);
        if list.borrow().iter().any(|&p| p >= addr && p < end) {
            return Err(TargetError::Injected("memory access").into());
        }
        Ok(())
    }
}

impl Default for SimulatedProcess {
    fn default() -> Self {
        Self::little_endian()
    }
}

impl TargetMemory for SimulatedProcess {
    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn address_byte_size(&self) -> u32 {
        self.address_byte_size
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        Self::check_poison(&self.poisoned_reads, addr, buf.len())?;

        let memory = self.memory.borrow();
        let (base, offset) = memory
            .locate(addr, buf.len())
            .ok_or(TargetError::Unmapped { addr, len: buf.len() })?;
        buf.copy_from_slice(&memory.regions[&base][offset..offset + buf.len()]);
        Ok(buf.len())
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize> {
        Self::check_poison(&self.poisoned_writes, addr, data.len())?;

        let mut memory = self.memory.borrow_mut();
        let (base, offset) = memory
            .locate(addr, data.len())
            .ok_or(TargetError::Unmapped { addr, len: data.len() })?;
        if let Some(region) = memory.regions.get_mut(&base) {
            region[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(data.len())
    }

    fn allocate_memory(&self, size: usize, _permissions: Permissions) -> Result<u64> {
        if self.fail_allocations.get() {
            return Err(TargetError::Injected("allocation").into());
        }

        let skew = self.allocation_skew.get();
        let mut memory = self.memory.borrow_mut();
        let base = memory.next_allocation;
        let span = (size as u64 + skew).div_ceil(ALLOCATION_STRIDE).max(1) * ALLOCATION_STRIDE;
        memory.next_allocation += span;

        let addr = base + skew;
        memory.regions.insert(addr, vec![0u8; size]);
        memory.allocations.insert(addr, addr);
        memory.allocation_count += 1;
        memory.last_allocation_size = Some(size);

        trace!("simulated allocation of {} bytes at 0x{:x}", size, addr);
        Ok(addr)
    }

    fn deallocate_memory(&self, addr: u64) -> Result<()> {
        let mut memory = self.memory.borrow_mut();
        let region = memory
            .allocations
            .remove(&addr)
            .ok_or(TargetError::UnknownAllocation(addr))?;
        memory.regions.remove(&region);
        memory.deallocation_count += 1;
        Ok(())
    }
}

/// シミュレートされたレジスタコンテキスト
///
/// 値はターゲットのバイトオーダーで `byte_size` バイトの列として保持します。
pub struct SimulatedRegisters {
    byte_order: ByteOrder,
    registers: RefCell<Vec<(RegisterInfo, Vec<u8>)>>,
    fail_writes: Cell<bool>,
    write_count: Cell<usize>,
}

impl SimulatedRegisters {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self {
            byte_order,
            registers: RefCell::new(Vec::new()),
            fail_writes: Cell::new(false),
            write_count: Cell::new(0),
        }
    }

    /// x86-64 の汎用レジスタ一式（値はすべて0）
    pub fn x86_64() -> Self {
        let regs = Self::new(ByteOrder::Little);
        for (dwarf, name) in [
            "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15", "rip",
        ]
        .into_iter()
        .enumerate()
        {
            regs.add_register(name, Some(dwarf as u16), 8);
        }
        regs.add_register("eax", None, 4);
        regs
    }

    /// レジスタを追加して記述子を返す
    pub fn add_register(&self, name: &str, dwarf: Option<u16>, byte_size: u32) -> RegisterInfo {
        let mut registers = self.registers.borrow_mut();
        let info = RegisterInfo::new(
            name,
            registers.len() as u32,
            dwarf,
            byte_size,
            RegisterEncoding::Uint,
        );
        registers.push((info.clone(), vec![0u8; byte_size as usize]));
        info
    }

    /// レジスタの値を整数で設定する
    pub fn set_value(&self, name: &str, value: u64) {
        let mut registers = self.registers.borrow_mut();
        if let Some((info, bytes)) = registers.iter_mut().find(|(info, _)| info.name == name) {
            *bytes = self.byte_order.encode_u64(value, info.byte_size as usize);
        }
    }

    /// レジスタの値を整数で取得する
    pub fn value(&self, name: &str) -> Option<u64> {
        self.bytes(name).map(|bytes| self.byte_order.decode_u64(&bytes))
    }

    /// レジスタの生バイト列を取得する
    pub fn bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.registers
            .borrow()
            .iter()
            .find(|(info, _)| info.name == name)
            .map(|(_, bytes)| bytes.clone())
    }

    /// 以降のレジスタ書き込みを失敗させる
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    /// 成功したレジスタ書き込みの回数
    pub fn write_count(&self) -> usize {
        self.write_count.get()
    }
}

impl RegisterContext for SimulatedRegisters {
    fn register_info_by_name(&self, name: &str) -> Option<RegisterInfo> {
        self.registers
            .borrow()
            .iter()
            .find(|(info, _)| info.name == name)
            .map(|(info, _)| info.clone())
    }

    fn register_info_by_dwarf(&self, regnum: u16) -> Option<RegisterInfo> {
        self.registers
            .borrow()
            .iter()
            .find(|(info, _)| info.dwarf == Some(regnum))
            .map(|(info, _)| info.clone())
    }

    fn read_register_bytes(&self, reg: &RegisterInfo) -> Result<Vec<u8>> {
        self.bytes(&reg.name)
            .ok_or_else(|| TargetError::UnknownRegister(reg.name.clone()).into())
    }

    fn write_register_bytes(&self, reg: &RegisterInfo, bytes: &[u8]) -> Result<()> {
        if self.fail_writes.get() {
            return Err(TargetError::Injected("register write").into());
        }

        let mut registers = self.registers.borrow_mut();
        let (info, slot) = registers
            .iter_mut()
            .find(|(info, _)| info.name == reg.name)
            .ok_or_else(|| TargetError::UnknownRegister(reg.name.clone()))?;

        if bytes.len() != info.byte_size as usize {
            return Err(TargetError::RegisterSize {
                register: info.name.clone(),
                expected: info.byte_size as usize,
                actual: bytes.len(),
            }
            .into());
        }

        slot.copy_from_slice(bytes);
        self.write_count.set(self.write_count.get() + 1);
        Ok(())
    }
}
