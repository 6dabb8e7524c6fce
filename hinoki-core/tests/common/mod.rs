//! 結合テスト用のフレームとターゲット
//!
//! シミュレートされたプロセスとレジスタの上に、変数・関数・型を手で登録できるフレームを置きます。

#![allow(dead_code)]

use hinoki_core::{
    ExecutionContext, ExprResult, ExpressionRunner, FunctionKind, FunctionMatch, StackFrame,
    StructPlan,
};
use hinoki_dwarf::{
    CompilerType, ContextId, Encoding, TypeContext, TypeInfo, Variable, VariableLocation,
};
use hinoki_target::{ByteOrder, SimulatedProcess, SimulatedRegisters};

/// フレームの型コンテキスト
pub const FRAME_CONTEXT: ContextId = ContextId(100);
/// 別モジュールの型コンテキスト
pub const OTHER_CONTEXT: ContextId = ContextId(101);

/// スタック領域の先頭
pub const STACK_BASE: u64 = 0x1000;
pub const STACK_SIZE: usize = 0x100;
/// フレームベース（DW_OP_fbreg の基準）
pub const FRAME_BASE: u64 = 0x1080;
/// グローバル変数の領域（ファイルアドレス）
pub const DATA_BASE: u64 = 0x2000;
pub const DATA_SIZE: usize = 0x100;

/// 手で組み立てるフレーム
pub struct TestFrame {
    pub types: TypeContext,
    pub other_types: TypeContext,
    pub pc: u64,
    pub frame_base: Option<u64>,
    pub load_bias: u64,
    pub locals: Vec<Variable>,
    pub module_globals: Vec<Variable>,
    pub program_globals: Vec<Variable>,
    pub functions: Vec<FunctionMatch>,
    pub named_types: Vec<(String, CompilerType)>,
}

impl TestFrame {
    pub fn new() -> Self {
        Self {
            types: TypeContext::new(FRAME_CONTEXT),
            other_types: TypeContext::new(OTHER_CONTEXT),
            pc: 0x4000,
            frame_base: Some(FRAME_BASE),
            load_bias: 0,
            locals: Vec::new(),
            module_globals: Vec::new(),
            program_globals: Vec::new(),
            functions: Vec::new(),
            named_types: Vec::new(),
        }
    }

    pub fn int_type(&mut self, bits: u64) -> CompilerType {
        let id = self.types.builtin_for_encoding(Encoding::Signed, bits);
        self.types.compiler_type(id)
    }

    pub fn uint_type(&mut self, bits: u64) -> CompilerType {
        let id = self.types.builtin_for_encoding(Encoding::Unsigned, bits);
        self.types.compiler_type(id)
    }

    /// 名前付き構造体型
    pub fn struct_type(&mut self, name: &str, size: u64) -> CompilerType {
        let id = self.types.intern(TypeInfo::Struct {
            name: name.to_string(),
            size,
            fields: Vec::new(),
            methods: Vec::new(),
        });
        self.named_types
            .push((name.to_string(), self.types.compiler_type(id)));
        self.types.compiler_type(id)
    }

    pub fn pointer_to(&mut self, pointee: CompilerType, size: u64) -> CompilerType {
        let id = self.types.pointer_to(pointee.id, size);
        self.types.compiler_type(id)
    }

    pub fn add_local(&mut self, name: &str, ty: CompilerType, location: VariableLocation) {
        self.locals.push(Variable::new(name, Some(ty), location));
    }

    pub fn add_module_global(&mut self, name: &str, ty: CompilerType, file_addr: u64) {
        self.module_globals
            .push(Variable::new(name, Some(ty), VariableLocation::Address(file_addr)));
    }

    pub fn add_program_global(&mut self, name: &str, ty: CompilerType, file_addr: u64) {
        self.program_globals
            .push(Variable::new(name, Some(ty), VariableLocation::Address(file_addr)));
    }

    /// デバッグ情報のある関数
    pub fn add_function(&mut self, name: &str, address: u64) -> CompilerType {
        let int = self.types.builtin_for_encoding(Encoding::Signed, 32);
        let id = self.types.function(Some(int), vec![int]);
        let ty = self.types.compiler_type(id);
        self.functions.push(FunctionMatch {
            name: name.to_string(),
            address,
            kind: FunctionKind::Function { ty },
        });
        ty
    }

    pub fn add_symbol(&mut self, name: &str, address: u64, external: bool) {
        self.functions.push(FunctionMatch {
            name: name.to_string(),
            address,
            kind: FunctionKind::Symbol { external },
        });
    }
}

impl StackFrame for TestFrame {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn frame_base(&self) -> Option<u64> {
        self.frame_base
    }

    fn load_bias(&self) -> u64 {
        self.load_bias
    }

    fn find_local_variable(&self, name: &str) -> Option<Variable> {
        self.locals.iter().find(|var| var.name == name).cloned()
    }

    fn find_module_globals(&self, name: &str, max_matches: usize) -> Vec<Variable> {
        self.module_globals
            .iter()
            .filter(|var| var.name == name)
            .take(max_matches)
            .cloned()
            .collect()
    }

    fn find_program_globals(&self, name: &str, max_matches: usize) -> Vec<Variable> {
        self.program_globals
            .iter()
            .filter(|var| var.name == name)
            .take(max_matches)
            .cloned()
            .collect()
    }

    fn find_functions_by_name(&self, name: &str) -> Vec<FunctionMatch> {
        self.functions
            .iter()
            .filter(|f| f.name == name)
            .cloned()
            .collect()
    }

    fn find_type_by_name(&self, name: &str) -> Option<CompilerType> {
        self.named_types
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| *ty)
    }

    fn type_context(&self, id: ContextId) -> Option<&TypeContext> {
        if id == self.types.id() {
            Some(&self.types)
        } else if id == self.other_types.id() {
            Some(&self.other_types)
        } else {
            None
        }
    }
}

/// シミュレートされたターゲット一式
pub struct Target {
    pub process: SimulatedProcess,
    pub registers: SimulatedRegisters,
    pub frame: TestFrame,
}

impl Target {
    /// リトルエンディアン x86-64 のターゲット（スタックとデータ領域をマップ済み）
    pub fn little_endian() -> Self {
        Self::with(SimulatedProcess::little_endian(), SimulatedRegisters::x86_64())
    }

    /// ビッグエンディアン64ビットのターゲット（レジスタは `r0`..`r3` と32ビットの `w0`）
    pub fn big_endian() -> Self {
        let registers = SimulatedRegisters::new(ByteOrder::Big);
        for (dwarf, name) in ["r0", "r1", "r2", "r3"].into_iter().enumerate() {
            registers.add_register(name, Some(dwarf as u16), 8);
        }
        registers.add_register("w0", None, 4);
        Self::with(SimulatedProcess::big_endian(), registers)
    }

    fn with(process: SimulatedProcess, registers: SimulatedRegisters) -> Self {
        process.map_region(STACK_BASE, vec![0; STACK_SIZE]);
        process.map_region(DATA_BASE, vec![0; DATA_SIZE]);
        Self {
            process,
            registers,
            frame: TestFrame::new(),
        }
    }

    pub fn exe_ctx(&self) -> ExecutionContext<'_> {
        ExecutionContext::new(&self.process, &self.registers, &self.frame)
    }

    /// ターゲットのバイトオーダーで整数を書き込む
    pub fn write_int(&self, addr: u64, value: u64, size: usize) {
        let bytes = self.byte_order().encode_u64(value, size);
        self.process.write_bytes(addr, &bytes).unwrap();
    }

    pub fn read_int(&self, addr: u64, size: usize) -> u64 {
        let bytes = self.process.read_bytes(addr, size).unwrap();
        self.byte_order().decode_u64(&bytes)
    }

    fn byte_order(&self) -> ByteOrder {
        use hinoki_target::TargetMemory;
        self.process.byte_order()
    }
}

/// 指定したメンバのスロットに値を書き込む実行器
pub struct StoreRunner {
    pub stores: Vec<(String, Vec<u8>)>,
    /// 実行時に見えた構造体
    pub seen: Option<StructPlan>,
    /// 書き込む前のスロットの内容（`stores` と同じ順）
    pub before: Vec<Vec<u8>>,
}

impl StoreRunner {
    pub fn new(stores: Vec<(&str, Vec<u8>)>) -> Self {
        Self {
            stores: stores
                .into_iter()
                .map(|(name, bytes)| (name.to_string(), bytes))
                .collect(),
            seen: None,
            before: Vec::new(),
        }
    }
}

impl ExpressionRunner for StoreRunner {
    fn run(&mut self, exe_ctx: &ExecutionContext, plan: &StructPlan) -> ExprResult<()> {
        self.seen = Some(plan.clone());
        let (Some(address), Some(process)) = (plan.address, exe_ctx.process) else {
            return Ok(());
        };
        for (name, bytes) in &self.stores {
            let element = plan.element(name).expect("no such member");
            let mut slot = vec![0u8; bytes.len()];
            hinoki_target::read_exact(process, address + element.offset, &mut slot)
                .expect("read the struct");
            self.before.push(slot);
            hinoki_target::write_all(process, address + element.offset, bytes)
                .expect("store into the struct");
        }
        Ok(())
    }
}

/// 常に失敗する実行器
pub struct FailingRunner;

impl ExpressionRunner for FailingRunner {
    fn run(&mut self, _exe_ctx: &ExecutionContext, _plan: &StructPlan) -> ExprResult<()> {
        Err(hinoki_core::ExprError::Execution("trapped".to_string()))
    }
}
