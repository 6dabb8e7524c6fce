//! 評価パイプラインと永続変数、ブレークポイント条件のテスト

mod common;

use common::{StoreRunner, Target, FRAME_BASE};
use hinoki_core::{
    BreakpointCondition, CaptureRunner, ExprError, ExpressionDeclMap, ExpressionEvaluator,
    IdentifierFrontend, NoopRunner, ParserAst, Session,
};
use hinoki_dwarf::{Encoding, VariableLocation};
use hinoki_target::ByteOrder;

fn counter_target(value: u64) -> Target {
    let mut target = Target::little_endian();
    let int = target.frame.int_type(32);
    target
        .frame
        .add_local("count", int, VariableLocation::FrameOffset(-4));
    target.write_int(FRAME_BASE - 4, value, 4);
    target
}

#[test]
fn test_capture_creates_result_variable() {
    let target = counter_target(41);

    let mut session = Session::new();
    let outcome = ExpressionEvaluator::new(&mut session)
        .evaluate(
            "count",
            &mut IdentifierFrontend::with_result(),
            &mut CaptureRunner,
            &target.exe_ctx(),
        )
        .unwrap();

    assert_eq!(outcome.result_name.as_deref(), Some("$0"));
    assert_eq!(outcome.result_bytes, Some(41u32.to_le_bytes().to_vec()));
    assert_eq!(outcome.info.num_elements, 2);

    let id = outcome.result.unwrap();
    let var = session.persistent_variables().get(id).unwrap();
    assert!(var.flags.value_updated);
    assert!(var.parser_vars.is_none());
    assert_eq!(var.user_type.unwrap().context, session.scratch_types().id());
    // 変数そのものは書き換えない
    assert_eq!(target.read_int(FRAME_BASE - 4, 4), 41);
}

#[test]
fn test_persistent_variable_is_reused_by_later_expressions() {
    let target = counter_target(7);
    let mut session = Session::new();

    ExpressionEvaluator::new(&mut session)
        .evaluate(
            "count",
            &mut IdentifierFrontend::with_result(),
            &mut CaptureRunner,
            &target.exe_ctx(),
        )
        .unwrap();

    // $0 を構造体経由で読み、$1 に写す
    let outcome = ExpressionEvaluator::new(&mut session)
        .evaluate(
            "$0 + count",
            &mut IdentifierFrontend::with_result(),
            &mut CaptureRunner,
            &target.exe_ctx(),
        )
        .unwrap();
    assert_eq!(outcome.result_name.as_deref(), Some("$1"));
    assert_eq!(outcome.result_bytes, Some(7u32.to_le_bytes().to_vec()));
    assert_eq!(outcome.info.num_elements, 3);
    assert_eq!(session.persistent_variables().len(), 2);
    // 前の式の配置情報は残らない
    assert!(session
        .persistent_variables()
        .iter()
        .all(|var| var.jit_vars.is_none()));
}

#[test]
fn test_persistent_variable_is_written_back() {
    let target = counter_target(5);
    let mut session = Session::new();

    let first = ExpressionEvaluator::new(&mut session)
        .evaluate(
            "count",
            &mut IdentifierFrontend::with_result(),
            &mut CaptureRunner,
            &target.exe_ctx(),
        )
        .unwrap();

    let mut runner = StoreRunner::new(vec![("$0", 99u32.to_le_bytes().to_vec())]);
    ExpressionEvaluator::new(&mut session)
        .evaluate("$0", &mut IdentifierFrontend::new(), &mut runner, &target.exe_ctx())
        .unwrap();

    assert_eq!(runner.before, vec![5u32.to_le_bytes().to_vec()]);
    let var = session
        .persistent_variables()
        .get(first.result.unwrap())
        .unwrap();
    assert_eq!(var.value_bytes(), Some(&99u32.to_le_bytes()[..]));
}

#[test]
fn test_undeclared_identifier() {
    let target = counter_target(0);
    let mut session = Session::new();

    let err = ExpressionEvaluator::new(&mut session)
        .evaluate("count + nope", &mut IdentifierFrontend::new(), &mut NoopRunner, &target.exe_ctx())
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "Couldn't parse the expression: use of undeclared identifier 'nope'"
    );
    assert_eq!(target.process.allocation_count(), 0);
}

#[test]
fn test_result_needs_a_value() {
    let target = counter_target(0);
    let mut session = Session::new();

    let err = ExpressionEvaluator::new(&mut session)
        .evaluate("42", &mut IdentifierFrontend::with_result(), &mut CaptureRunner, &target.exe_ctx())
        .unwrap_err();
    assert_eq!(err, ExprError::NoResult);
    assert!(session.persistent_variables().is_empty());
}

#[test]
fn test_duplicate_persistent_variable() {
    let mut session = Session::new();
    let int = session
        .scratch_types_mut()
        .builtin_for_encoding(Encoding::Signed, 32);
    let ty = session.scratch_types().compiler_type(int);

    let store = session.persistent_variables_mut();
    store.create("$x", ty, 4, ByteOrder::Little, 8).unwrap();
    assert_eq!(
        store.create("$x", ty, 4, ByteOrder::Little, 8),
        Err(ExprError::DuplicatePersistent("$x".to_string()))
    );
}

#[test]
fn test_wide_integer_variable_keeps_value_in_low_bytes() {
    for (byte_order, expected_start) in [(ByteOrder::Little, 0usize), (ByteOrder::Big, 14)] {
        let target = match byte_order {
            ByteOrder::Little => Target::little_endian(),
            ByteOrder::Big => Target::big_endian(),
        };
        let mut session = Session::new();
        let mut ast = ParserAst::new(session.allocate_context_id());
        let wide = ast.types_mut().builtin_for_encoding(Encoding::Unsigned, 128);

        let mut map = ExpressionDeclMap::new(&mut session);
        map.will_parse(&target.exe_ctx());
        let id = map
            .build_integer_variable("$wide", &ast, wide, 0x0102)
            .unwrap();
        map.did_parse();
        drop(map);

        let bytes = session
            .persistent_variables()
            .get(id)
            .unwrap()
            .value_bytes()
            .unwrap()
            .to_vec();
        assert_eq!(bytes.len(), 16);
        let mut expected = vec![0u8; 16];
        let value = byte_order.encode_u64(0x0102, 2);
        expected[expected_start..expected_start + 2].copy_from_slice(&value);
        assert_eq!(bytes, expected);
    }
}

#[test]
fn test_condition_without_text_does_not_evaluate() {
    let target = counter_target(1);
    let mut session = Session::new();

    let condition = BreakpointCondition::new(None);
    let stop = condition
        .condition_says_stop(
            &mut session,
            &mut IdentifierFrontend::with_result(),
            &mut CaptureRunner,
            &target.exe_ctx(),
        )
        .unwrap();

    assert!(!stop);
    assert_eq!(target.process.allocation_count(), 0);
    assert!(session.persistent_variables().is_empty());
}

#[test]
fn test_condition_follows_value() {
    let target = counter_target(0);
    let mut session = Session::new();
    let condition = BreakpointCondition::new(Some("count"));

    let check = |session: &mut Session| {
        condition
            .condition_says_stop(
                session,
                &mut IdentifierFrontend::with_result(),
                &mut CaptureRunner,
                &target.exe_ctx(),
            )
            .unwrap()
    };

    assert!(!check(&mut session));
    target.write_int(FRAME_BASE - 4, 3, 4);
    assert!(check(&mut session));
    assert_eq!(session.persistent_variables().len(), 2);
}

#[test]
fn test_condition_error_is_reported() {
    let target = counter_target(0);
    let mut session = Session::new();
    let condition = BreakpointCondition::new(Some("missing"));

    let err = condition
        .condition_says_stop(
            &mut session,
            &mut IdentifierFrontend::with_result(),
            &mut CaptureRunner,
            &target.exe_ctx(),
        )
        .unwrap_err();
    assert!(matches!(err, ExprError::Parse(_)));
}

#[test]
fn test_condition_is_shared_across_threads() {
    let condition = BreakpointCondition::new(Some("count"));

    std::thread::scope(|scope| {
        for value in [0u64, 1] {
            let condition = &condition;
            scope.spawn(move || {
                let target = counter_target(value);
                let mut session = Session::new();
                let stop = condition
                    .condition_says_stop(
                        &mut session,
                        &mut IdentifierFrontend::with_result(),
                        &mut CaptureRunner,
                        &target.exe_ctx(),
                    )
                    .unwrap();
                assert_eq!(stop, value != 0);
            });
        }
    });
}
