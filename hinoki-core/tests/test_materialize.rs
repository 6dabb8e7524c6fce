//! 構造体の実体化と逆実体化のテスト
//!
//! シミュレートされたターゲット上で、変数・レジスタの値が構造体を経由して往復することを確認します。

mod common;

use common::{FailingRunner, StoreRunner, Target, DATA_BASE, FRAME_BASE};
use hinoki_core::{
    DeclId, DeclKind, ExecutionContext, ExprError, ExpressionDeclMap, ExpressionEvaluator,
    IdentifierFrontend, IrValue, NameSearchContext, NoopRunner, ParserAst, Session,
};
use hinoki_dwarf::{TypeId, TypeInfo, VariableLocation};

/// 名前を解決し、変数の宣言と型を返す
fn resolve(map: &mut ExpressionDeclMap, ast: &mut ParserAst, exe_ctx: &ExecutionContext, name: &str) -> (DeclId, TypeId) {
    let decl = {
        let mut ctx = NameSearchContext::new(ast, name);
        map.get_decls(&mut ctx, exe_ctx);
        ctx.decls()[0]
    };
    match ast.decl(decl).unwrap().kind {
        DeclKind::Variable { ty } => (decl, ty),
        ref other => panic!("{} resolved to {:?}", name, other),
    }
}

/// 名前を解決して構造体に追加し、レイアウトまで済ませる
fn prepare(map: &mut ExpressionDeclMap, ast: &mut ParserAst, exe_ctx: &ExecutionContext, names: &[&str]) {
    map.will_parse(exe_ctx);
    for (index, name) in names.iter().enumerate() {
        let (decl, ty) = resolve(map, ast, exe_ctx, name);
        let size = ast.types().byte_size(ty).unwrap();
        let alignment = ast.types().alignment(ty).unwrap();
        assert!(map.add_value_to_struct(decl, name, IrValue(index as u64), size, alignment));
    }
    map.do_struct_layout().unwrap();
    map.did_parse();
}

#[test]
fn test_variable_round_trip() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));
    target.write_int(FRAME_BASE - 4, 41, 4);

    let mut session = Session::new();
    let mut runner = StoreRunner::new(vec![("count", 42u32.to_le_bytes().to_vec())]);
    let outcome = ExpressionEvaluator::new(&mut session)
        .evaluate("count + 1", &mut IdentifierFrontend::new(), &mut runner, &target.exe_ctx())
        .unwrap();

    assert_eq!(outcome.result, None);
    assert_eq!(outcome.info.num_elements, 1);
    assert_eq!(runner.before, vec![41u32.to_le_bytes().to_vec()]);
    assert_eq!(target.read_int(FRAME_BASE - 4, 4), 42);

    let plan = runner.seen.unwrap();
    assert!(plan.address.is_some());
    assert_eq!(plan.element("count").unwrap().offset, 0);
    assert_eq!(target.process.allocation_count(), 1);
    assert_eq!(target.process.live_allocations(), 0);
}

#[test]
fn test_register_by_name_round_trip() {
    let target = Target::little_endian();
    target.registers.set_value("rax", 0x1122_3344_5566_7788);

    let mut session = Session::new();
    let mut runner = StoreRunner::new(vec![("$rax", 7u64.to_le_bytes().to_vec())]);
    ExpressionEvaluator::new(&mut session)
        .evaluate("$rax", &mut IdentifierFrontend::new(), &mut runner, &target.exe_ctx())
        .unwrap();

    assert_eq!(runner.before, vec![0x1122_3344_5566_7788u64.to_le_bytes().to_vec()]);
    assert_eq!(target.registers.value("rax"), Some(7));
}

#[test]
fn test_narrow_variable_in_register_little_endian() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    // DWARF 1 = rdx
    target.frame.add_local("narrow", int, VariableLocation::Register(1));
    target.registers.set_value("rdx", 0x1122_3344_5566_7788);

    let mut session = Session::new();
    let mut runner = StoreRunner::new(vec![("narrow", vec![1, 0, 0, 0])]);
    ExpressionEvaluator::new(&mut session)
        .evaluate("narrow", &mut IdentifierFrontend::new(), &mut runner, &target.exe_ctx())
        .unwrap();

    assert_eq!(runner.before, vec![vec![0x88, 0x77, 0x66, 0x55]]);
    assert_eq!(target.registers.value("rdx"), Some(0x1122_3344_0000_0001));
}

#[test]
fn test_narrow_variable_in_register_big_endian() {
    let mut target = Target::big_endian();
    let int = target.frame.int_type(32);
    target.frame.add_local("narrow", int, VariableLocation::Register(0));
    target.registers.set_value("r0", 0x1122_3344_5566_7788);

    let mut session = Session::new();
    let mut runner = StoreRunner::new(vec![("narrow", vec![0, 0, 0, 1])]);
    ExpressionEvaluator::new(&mut session)
        .evaluate("narrow", &mut IdentifierFrontend::new(), &mut runner, &target.exe_ctx())
        .unwrap();

    assert_eq!(runner.before, vec![vec![0x55, 0x66, 0x77, 0x88]]);
    assert_eq!(target.registers.value("r0"), Some(0x1122_3344_0000_0001));
}

#[test]
fn test_narrow_register_slot_keeps_next_member() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));
    target.write_int(FRAME_BASE - 4, 7, 4);
    target.registers.set_value("rax", 0xaaaa_bbbb_0000_0001);
    let exe_ctx = target.exe_ctx();

    let mut session = Session::new();
    let mut ast = ParserAst::new(session.allocate_context_id());
    let mut map = ExpressionDeclMap::new(&mut session);
    map.will_parse(&exe_ctx);
    let (rax, _) = resolve(&mut map, &mut ast, &exe_ctx, "$rax");
    let (count, _) = resolve(&mut map, &mut ast, &exe_ctx, "count");
    assert!(map.add_value_to_struct(rax, "$rax", IrValue(0), 4, 4));
    assert!(map.add_value_to_struct(count, "count", IrValue(1), 4, 4));
    map.do_struct_layout().unwrap();
    map.did_parse();

    // レジスタの下位4バイトだけがスロットに入る
    let location = map.materialize(&exe_ctx).unwrap().unwrap();
    assert_eq!(
        target.process.read_bytes(location, 8).unwrap(),
        vec![0x01, 0, 0, 0, 0x07, 0, 0, 0]
    );

    map.dematerialize(&exe_ctx).unwrap();
    assert_eq!(target.registers.value("rax"), Some(0xaaaa_bbbb_0000_0001));
    assert_eq!(target.read_int(FRAME_BASE - 4, 4), 7);
}

#[test]
fn test_value_too_big_for_register() {
    let mut target = Target::little_endian();
    target.registers.add_register("x16", Some(40), 4);
    let long = target.frame.int_type(64);
    target.frame.add_local("wide", long, VariableLocation::Register(40));

    let mut session = Session::new();
    let err = ExpressionEvaluator::new(&mut session)
        .evaluate("wide", &mut IdentifierFrontend::new(), &mut NoopRunner, &target.exe_ctx())
        .unwrap_err();

    assert_eq!(err.to_string(), "wide is too big to store in x16");
    assert_eq!(target.registers.write_count(), 0);
    assert_eq!(target.process.live_allocations(), 0);
}

#[test]
fn test_empty_struct_is_not_allocated() {
    let target = Target::little_endian();

    let mut session = Session::new();
    let mut runner = StoreRunner::new(Vec::new());
    let outcome = ExpressionEvaluator::new(&mut session)
        .evaluate("1 + 2", &mut IdentifierFrontend::new(), &mut runner, &target.exe_ctx())
        .unwrap();

    assert_eq!(outcome.info.size, 0);
    assert_eq!(outcome.info.alignment, 1);
    assert_eq!(runner.seen.unwrap().address, None);
    assert_eq!(target.process.allocation_count(), 0);
}

#[test]
fn test_materialize_requires_frame_even_when_empty() {
    let target = Target::little_endian();
    let exe_ctx = target.exe_ctx();

    let mut session = Session::new();
    let mut ast = ParserAst::new(session.allocate_context_id());
    let mut map = ExpressionDeclMap::new(&mut session);
    prepare(&mut map, &mut ast, &exe_ctx, &[]);

    assert_eq!(map.materialize(&exe_ctx.without_frame()), Err(ExprError::NullFrame));
    assert_eq!(map.materialize(&exe_ctx), Ok(None));
}

#[test]
fn test_materialize_before_layout() {
    let target = Target::little_endian();
    let mut session = Session::new();
    let mut map = ExpressionDeclMap::new(&mut session);
    map.add_value_to_struct(hinoki_core::DeclId(0), "x", IrValue(0), 4, 4);

    assert_eq!(map.materialize(&target.exe_ctx()), Err(ExprError::NotLaidOut));
    assert_eq!(
        map.dump_materialized_struct(&target.exe_ctx()),
        Err(ExprError::NotLaidOut)
    );
}

#[test]
fn test_second_dematerialize_is_a_no_op() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));
    let exe_ctx = target.exe_ctx();

    let mut session = Session::new();
    let mut ast = ParserAst::new(session.allocate_context_id());
    let mut map = ExpressionDeclMap::new(&mut session);
    prepare(&mut map, &mut ast, &exe_ctx, &["count"]);

    assert!(map.materialize(&exe_ctx).unwrap().is_some());
    assert_eq!(map.dematerialize(&exe_ctx), Ok(None));
    assert_eq!(map.dematerialize(&exe_ctx), Ok(None));
    assert_eq!(map.materialized_location(), None);
    assert_eq!(target.process.deallocation_count(), 1);
}

#[test]
fn test_rematerialize_releases_previous_area() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));
    let exe_ctx = target.exe_ctx();

    let mut session = Session::new();
    let mut ast = ParserAst::new(session.allocate_context_id());
    let mut map = ExpressionDeclMap::new(&mut session);
    prepare(&mut map, &mut ast, &exe_ctx, &["count"]);

    let first = map.materialize(&exe_ctx).unwrap().unwrap();
    let second = map.materialize(&exe_ctx).unwrap().unwrap();
    assert_ne!(first, second);
    assert_eq!(target.process.live_allocations(), 1);

    map.did_dematerialize(&exe_ctx).unwrap();
    assert_eq!(target.process.live_allocations(), 0);
}

#[test]
fn test_misaligned_allocation_is_rounded_up() {
    let mut target = Target::little_endian();
    let long = target.frame.int_type(64);
    let int = target.frame.int_type(32);
    target.frame.add_local("a", long, VariableLocation::FrameOffset(-16));
    target.frame.add_local("b", int, VariableLocation::FrameOffset(-4));
    target.write_int(FRAME_BASE - 16, 0xaabb, 8);
    target.write_int(FRAME_BASE - 4, 0xcc, 4);
    target.process.set_allocation_skew(3);
    let exe_ctx = target.exe_ctx();

    let mut session = Session::new();
    let mut ast = ParserAst::new(session.allocate_context_id());
    let mut map = ExpressionDeclMap::new(&mut session);
    prepare(&mut map, &mut ast, &exe_ctx, &["a", "b"]);

    let info = map.get_struct_info().unwrap();
    assert_eq!((info.size, info.alignment), (12, 8));

    let location = map.materialize(&exe_ctx).unwrap().unwrap();
    assert_eq!(location % 8, 0);
    assert_eq!(target.process.last_allocation_size(), Some(20));
    assert_eq!(target.read_int(location, 8), 0xaabb);
    assert_eq!(target.read_int(location + 8, 4), 0xcc);

    map.dematerialize(&exe_ctx).unwrap();
    assert_eq!(target.process.live_allocations(), 0);
}

#[test]
fn test_partial_materialize_writes_back_prefix_only() {
    let mut target = Target::little_endian();
    let long = target.frame.int_type(64);
    let int = target.frame.int_type(32);
    target.frame.add_local("a", long, VariableLocation::FrameOffset(-8));
    target.frame.add_module_global("b", int, DATA_BASE + 0x10);
    target.write_int(FRAME_BASE - 8, 1, 8);
    target.write_int(DATA_BASE + 0x10, 2, 4);
    let exe_ctx = target.exe_ctx();

    let mut session = Session::new();
    let mut ast = ParserAst::new(session.allocate_context_id());
    let mut map = ExpressionDeclMap::new(&mut session);
    prepare(&mut map, &mut ast, &exe_ctx, &["a", "b"]);

    target.process.poison_read(DATA_BASE + 0x10);
    let err = map.materialize(&exe_ctx).unwrap_err();
    assert!(matches!(err, ExprError::Read { ref what, .. } if what == "b"));
    target.process.clear_poison();

    // 実体化できた a のスロットだけが書き戻される
    let location = map.materialized_location().unwrap();
    target.write_int(location, 100, 8);
    target.write_int(location + 8, 200, 4);
    map.dematerialize(&exe_ctx).unwrap();

    assert_eq!(target.read_int(FRAME_BASE - 8, 8), 100);
    assert_eq!(target.read_int(DATA_BASE + 0x10, 4), 2);
    assert_eq!(target.process.live_allocations(), 0);
}

#[test]
fn test_allocation_failure() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));
    target.process.fail_allocations(true);

    let mut session = Session::new();
    let err = ExpressionEvaluator::new(&mut session)
        .evaluate("count", &mut IdentifierFrontend::new(), &mut NoopRunner, &target.exe_ctx())
        .unwrap_err();

    assert!(matches!(err, ExprError::Allocation { size: 8, .. }));
    assert!(err
        .to_string()
        .starts_with("Couldn't allocate 8 bytes for the materialized struct"));
}

#[test]
fn test_failed_run_still_dematerializes() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));

    let mut session = Session::new();
    let err = ExpressionEvaluator::new(&mut session)
        .evaluate("count", &mut IdentifierFrontend::new(), &mut FailingRunner, &target.exe_ctx())
        .unwrap_err();

    assert_eq!(err, ExprError::Execution("trapped".to_string()));
    assert_eq!(target.process.deallocation_count(), 1);
    assert_eq!(target.process.live_allocations(), 0);
}

#[test]
fn test_write_back_failure_still_releases() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));
    target.process.poison_write(FRAME_BASE - 4);

    let mut session = Session::new();
    let err = ExpressionEvaluator::new(&mut session)
        .evaluate("count", &mut IdentifierFrontend::new(), &mut NoopRunner, &target.exe_ctx())
        .unwrap_err();

    assert!(matches!(err, ExprError::Write { ref what, .. } if what == "count"));
    assert_eq!(target.process.live_allocations(), 0);
}

#[test]
fn test_variable_is_found_again_at_materialize() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    let long = target.frame.int_type(64);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));

    let mut session = Session::new();
    let mut ast = ParserAst::new(session.allocate_context_id());
    let mut map = ExpressionDeclMap::new(&mut session);
    prepare(&mut map, &mut ast, &target.exe_ctx(), &["count"]);

    // 同名でも型が違う変数には差し替えない
    target.frame.locals.clear();
    target
        .frame
        .add_local("count", long, VariableLocation::FrameOffset(-8));

    let err = map.materialize(&target.exe_ctx()).unwrap_err();
    assert_eq!(err, ExprError::VariableNotFound("count".to_string()));
    assert_eq!(err.to_string(), "Couldn't find count with appropriate type");

    map.dematerialize(&target.exe_ctx()).unwrap();
    assert_eq!(target.process.live_allocations(), 0);
}

#[test]
fn test_dump_materialized_struct() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));
    target.write_int(FRAME_BASE - 4, 0x4142_4344, 4);
    let exe_ctx = target.exe_ctx();

    let mut session = Session::new();
    let mut ast = ParserAst::new(session.allocate_context_id());
    let mut map = ExpressionDeclMap::new(&mut session);
    prepare(&mut map, &mut ast, &exe_ctx, &["count"]);

    assert_eq!(map.dump_materialized_struct(&exe_ctx), Err(ExprError::NotMaterialized));

    let location = map.materialize(&exe_ctx).unwrap().unwrap();
    let dump = map.dump_materialized_struct(&exe_ctx).unwrap();
    let mut lines = dump.lines();
    assert_eq!(lines.next(), Some("[count]"));
    let line = lines.next().unwrap();
    assert!(line.starts_with(&format!("0x{:016x}: 44 43 42 41", location)));
    assert!(line.ends_with("  DCBA"));

    map.dematerialize(&exe_ctx).unwrap();
}

#[test]
fn test_failed_release_can_be_retried() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));
    let exe_ctx = target.exe_ctx();

    let mut session = Session::new();
    let mut ast = ParserAst::new(session.allocate_context_id());
    let mut map = ExpressionDeclMap::new(&mut session);
    prepare(&mut map, &mut ast, &exe_ctx, &["count"]);

    let location = map.materialize(&exe_ctx).unwrap().unwrap();
    let no_process = ExecutionContext {
        process: None,
        ..exe_ctx
    };
    assert_eq!(map.dematerialize(&no_process), Err(ExprError::NoProcess));
    assert_eq!(map.materialized_location(), Some(location));
    assert_eq!(target.process.live_allocations(), 1);

    assert_eq!(map.dematerialize(&exe_ctx), Ok(None));
    assert_eq!(map.materialized_location(), None);
    assert_eq!(target.process.live_allocations(), 0);
}

#[test]
fn test_dematerialize_clears_member_layout() {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));
    let exe_ctx = target.exe_ctx();

    let mut session = Session::new();
    let mut ast = ParserAst::new(session.allocate_context_id());
    let mut map = ExpressionDeclMap::new(&mut session);
    prepare(&mut map, &mut ast, &exe_ctx, &["count"]);

    map.materialize(&exe_ctx).unwrap();
    map.dematerialize(&exe_ctx).unwrap();

    assert!(map.members().is_empty());
    assert!(!map.is_laid_out());
    assert!(map.found_entities().iter().all(|var| var.jit_vars.is_none()));
    assert_eq!(map.materialize(&exe_ctx), Err(ExprError::NotLaidOut));
}

#[test]
fn test_member_without_size_fails_layout() {
    let mut target = Target::little_endian();
    let unknown = target.frame.types.intern(TypeInfo::Unknown);
    let unknown = target.frame.types.compiler_type(unknown);
    target
        .frame
        .add_local("blob", unknown, VariableLocation::FrameOffset(-8));

    let mut session = Session::new();
    let err = ExpressionEvaluator::new(&mut session)
        .evaluate("blob", &mut IdentifierFrontend::new(), &mut NoopRunner, &target.exe_ctx())
        .unwrap_err();

    assert_eq!(err, ExprError::MissingLayoutInfo("blob".to_string()));
    assert_eq!(err.to_string(), "Couldn't lay out the struct: blob has no size or alignment");
    assert_eq!(target.process.allocation_count(), 0);
}
