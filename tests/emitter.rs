//! End-to-end scenarios driving the emitter the way a host would

use cilgen::cil::emit::Emitter;
use cilgen::cil::errors::ErrorKind;
use cilgen::cil::host::{BytecodeHost, HandlerKind};
use cilgen::cil::metadata::{
    CtorData, MethodAttributes, MethodData, MethodSig, SystemLibrary, TypeAttributes, TypeData,
    TypeFlavor, TypeGraph, TypeGraphArenas,
};
use cilgen::cil::names::{MemberName, Name, TypeName};
use cilgen::cil::types::CilType;
use cilgen::util::Offset;

type Emit<'g> = Emitter<'g, BytecodeHost<'g>>;

fn emitter<'g>(
    graph: &'g TypeGraph<'g>,
    system: &'g SystemLibrary<'g>,
    parameters: Vec<CilType<'g>>,
    return_type: Option<CilType<'g>>,
) -> Emit<'g> {
    Emitter::new(
        graph,
        system,
        MethodSig::new(parameters, return_type),
        BytecodeHost::new(),
    )
}

#[test]
fn new_array_of_int() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let int_array = CilType::Ref(graph.array_of(CilType::int32()));
    let mut emit = emitter(&graph, &system, vec![], Some(int_array.clone()));

    emit.load_constant_i32(5).unwrap();
    emit.new_array(CilType::int32()).unwrap();
    emit.ret().unwrap();

    let body = emit.create_delegate().unwrap();
    assert_eq!(body.return_type, Some(int_array));
    // ldc.i4 5, newarr <token>, ret
    assert_eq!(body.bytes[0], 0x20);
    assert_eq!(body.bytes[1..5], [5, 0, 0, 0]);
    assert_eq!(body.bytes[5], 0x8D);
    assert_eq!(*body.bytes.last().unwrap(), 0x2A);
    assert_eq!(body.max_stack, 1);
}

#[test]
fn new_array_underflows_an_empty_stack() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let error = emit.new_array(CilType::int32()).unwrap_err();

    assert_eq!(
        error.kind,
        ErrorKind::StackUnderflow {
            required: 1,
            have: 0
        }
    );
    assert_eq!(error.instruction, 0);
    assert!(error.stack.is_empty());
}

#[test]
fn new_array_rejects_a_reference_length() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    emit.load_constant_string("x").unwrap();
    let error = emit.new_array(CilType::int32()).unwrap_err();

    match error.kind {
        ErrorKind::TypeMismatch {
            opcode,
            position,
            expected,
            actual,
        } => {
            assert_eq!(opcode, "newarr");
            assert_eq!(position, 0);
            assert_eq!(expected, "int32 or native int");
            assert_eq!(actual, "System.String");
        }
        other => panic!("expected TypeMismatch, got {:?}", other),
    }
    assert_eq!(error.stack, vec!["System.String"]);
}

#[test]
fn new_object_rejects_value_types() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let point = graph.add_type(TypeData::new(
        TypeName::from_string(String::from("Acme.Point")).unwrap(),
        Some(system.value_type),
        TypeFlavor::ValueType,
        TypeAttributes::PUBLIC,
    ));
    let ctor = graph.add_constructor(CtorData {
        class: point,
        parameters: vec![],
    });

    let mut emit = emitter(&graph, &system, vec![], None);
    let error = emit.new_object(ctor).unwrap_err();

    assert_eq!(
        error.kind,
        ErrorKind::InvalidOperation {
            reason: String::from("cannot construct value type with new_object"),
        }
    );
}

#[test]
fn try_finally_happy_path() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let local = emit.declare_local(CilType::int32(), Some("scratch")).unwrap();
    let end = emit.define_label(Some("end")).unwrap();

    emit.begin_exception_block().unwrap();
    emit.load_constant_i32(0).unwrap();
    emit.store_local(local).unwrap();
    emit.branch(end).unwrap();
    emit.begin_finally_block().unwrap();
    emit.end_finally_block().unwrap();
    emit.end_exception_block().unwrap();
    emit.mark_label(end).unwrap();
    emit.ret().unwrap();

    let body = emit.create_delegate().unwrap();
    assert_eq!(body.exception_regions.len(), 1);
    assert_eq!(body.exception_regions[0].kind, HandlerKind::Finally);
    assert_eq!(body.locals, vec![CilType::int32()]);
}

#[test]
fn try_requires_a_handler() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    emit.begin_exception_block().unwrap();
    let error = emit.end_exception_block().unwrap_err();

    match error.kind {
        ErrorKind::ScopeError { reason, .. } => {
            assert_eq!(reason, "try requires at least one catch or finally");
        }
        other => panic!("expected ScopeError, got {:?}", other),
    }
}

#[test]
fn branch_to_mismatched_stack_fails_at_the_mark() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let label = emit.define_label(None).unwrap();
    emit.load_constant_i32(0).unwrap();
    emit.branch(label).unwrap();
    let error = emit.mark_label(label).unwrap_err();

    match error.kind {
        ErrorKind::LabelError { reason, .. } => {
            assert_eq!(
                reason,
                "stack at mark differs from incoming branch: have [int32], required []"
            );
        }
        other => panic!("expected LabelError, got {:?}", other),
    }
}

#[test]
fn forward_branch_is_backpatched() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let skip = emit.define_label(None).unwrap();
    emit.branch(skip).unwrap();
    emit.nop().unwrap();
    emit.mark_label(skip).unwrap();
    emit.ret().unwrap();

    let body = emit.create_delegate().unwrap();
    // br +1 (skipping the nop), nop, ret
    assert_eq!(body.bytes, vec![0x38, 1, 0, 0, 0, 0x00, 0x2A]);
}

#[test]
fn backward_branch_resolves_immediately() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let top = emit.define_label(None).unwrap();
    emit.mark_label(top).unwrap();
    emit.nop().unwrap();
    emit.branch(top).unwrap();

    let body = emit.create_delegate().unwrap();
    // nop, then br back over itself and the nop: -6
    assert_eq!(body.bytes, vec![0x00, 0x38, 0xFA, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn diverging_paths_must_agree_at_the_join() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(
        &graph,
        &system,
        vec![CilType::int32()],
        Some(CilType::int32()),
    );
    let then = emit.define_label(Some("then")).unwrap();
    let join = emit.define_label(Some("join")).unwrap();

    emit.load_argument(0).unwrap();
    emit.branch_if_true(then).unwrap();
    emit.load_constant_i32(1).unwrap();
    emit.branch(join).unwrap();
    emit.mark_label(then).unwrap();
    emit.load_constant_i32(2).unwrap();
    emit.mark_label(join).unwrap();
    emit.ret().unwrap();

    assert_eq!(emit.incoming_branches(then).unwrap(), 1);
    assert_eq!(emit.incoming_branches(join).unwrap(), 1);
    // The two edges carried different shapes: [] into `then`, [int32] into `join`
    assert_eq!(emit.recorded_branch_shapes(), 2);
    assert!(emit.create_delegate().is_ok());
}

#[test]
fn backward_branch_with_wrong_stack_is_rejected() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let top = emit.define_label(None).unwrap();
    emit.mark_label(top).unwrap();
    emit.load_constant_i32(7).unwrap();
    let error = emit.branch(top).unwrap_err();

    assert!(matches!(error.kind, ErrorKind::LabelError { .. }));
}

#[test]
fn switch_verifies_every_target() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(
        &graph,
        &system,
        vec![CilType::int32()],
        Some(CilType::int32()),
    );
    let case0 = emit.define_label(Some("case0")).unwrap();
    let case1 = emit.define_label(Some("case1")).unwrap();

    emit.load_argument(0).unwrap();
    emit.switch(&[case0, case1]).unwrap();
    emit.load_constant_i32(-1).unwrap();
    emit.ret().unwrap();
    emit.mark_label(case0).unwrap();
    emit.load_constant_i32(10).unwrap();
    emit.ret().unwrap();
    emit.mark_label(case1).unwrap();
    emit.load_constant_i32(11).unwrap();
    emit.ret().unwrap();

    assert!(emit.create_delegate().is_ok());
}

#[test]
fn switch_rejects_an_empty_table() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![CilType::int32()], None);
    emit.load_argument(0).unwrap();
    let error = emit.switch(&[]).unwrap_err();
    assert_eq!(error.kind, ErrorKind::ArgumentNull { param: "labels" });
}

#[test]
fn catch_handler_sees_the_exception() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let done = emit.define_label(Some("done")).unwrap();

    emit.begin_exception_block().unwrap();
    emit.branch(done).unwrap();
    emit.begin_catch_all_block().unwrap();
    assert_eq!(emit.stack_shape(), vec!["System.Exception"]);
    emit.pop().unwrap();
    emit.end_catch_block().unwrap();
    emit.end_exception_block().unwrap();
    emit.mark_label(done).unwrap();
    emit.ret().unwrap();

    let body = emit.create_delegate().unwrap();
    let region = &body.exception_regions[0];
    assert_eq!(region.kind, HandlerKind::Catch(system.exception));
    assert_eq!(region.try_start, Offset(0));
    assert_eq!(region.try_end, Offset(5));
    assert_eq!(region.handler_start, Offset(5));
    assert_eq!(region.handler_end, Offset(11));
}

#[test]
fn catch_type_must_be_an_exception() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    emit.begin_exception_block().unwrap();
    let error = emit.begin_catch_block(system.string).unwrap_err();

    match error.kind {
        ErrorKind::ScopeError { reason, .. } => {
            assert!(reason.contains("System.String"));
        }
        other => panic!("expected ScopeError, got {:?}", other),
    }
}

#[test]
fn throw_requires_an_exception_reference() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    emit.load_constant_string("not an exception").unwrap();
    let error = emit.throw().unwrap_err();
    assert!(matches!(error.kind, ErrorKind::TypeMismatch { .. }));
}

#[test]
fn throw_and_rethrow_inside_a_catch() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let done = emit.define_label(None).unwrap();

    emit.begin_exception_block().unwrap();
    emit.load_constant_string("boom").unwrap();
    emit.new_object(system.exception_ctor_message).unwrap();
    emit.throw().unwrap();
    emit.begin_catch_all_block().unwrap();
    emit.pop().unwrap();
    emit.rethrow().unwrap();
    emit.end_catch_block().unwrap();
    emit.end_exception_block().unwrap();
    emit.mark_label(done).unwrap();
    emit.ret().unwrap();

    assert!(emit.create_delegate().is_ok());
}

#[test]
fn rethrow_outside_a_catch_is_a_scope_error() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let error = emit.rethrow().unwrap_err();
    assert!(matches!(error.kind, ErrorKind::ScopeError { .. }));
}

#[test]
fn constructor_resolution_by_parameter_types() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(
        &graph,
        &system,
        vec![],
        Some(CilType::Ref(system.exception)),
    );
    emit.load_constant_string("boom").unwrap();
    emit.new_object_with_params(system.exception, &[CilType::Ref(system.string)])
        .unwrap();
    emit.ret().unwrap();
    assert!(emit.create_delegate().is_ok());
}

#[test]
fn missing_constructor_is_reported() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    emit.load_constant_i32(3).unwrap();
    let error = emit
        .new_object_with_params(system.exception, &[CilType::int32()])
        .unwrap_err();

    match error.kind {
        ErrorKind::NoSuchConstructor {
            type_name,
            parameters,
        } => {
            assert_eq!(type_name, "System.Exception");
            assert_eq!(parameters, vec!["int32"]);
        }
        other => panic!("expected NoSuchConstructor, got {:?}", other),
    }
}

#[test]
fn static_call_pops_arguments_and_pushes_the_return() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let util = graph.add_type(TypeData::new(
        TypeName::from_string(String::from("Acme.Util")).unwrap(),
        Some(system.object),
        TypeFlavor::Class,
        TypeAttributes::PUBLIC,
    ));
    let add2 = graph.add_method(MethodData {
        class: util,
        name: MemberName::from_string(String::from("Add2")).unwrap(),
        signature: MethodSig::new(
            vec![CilType::int32(), CilType::int32()],
            Some(CilType::int32()),
        ),
        attributes: MethodAttributes::PUBLIC | MethodAttributes::STATIC,
    });

    let mut emit = emitter(&graph, &system, vec![], Some(CilType::int32()));
    emit.load_constant_i32(1).unwrap();
    emit.load_constant_i32(2).unwrap();
    emit.call(add2).unwrap();
    assert_eq!(emit.stack_shape(), vec!["int32"]);
    emit.ret().unwrap();
    assert!(emit.create_delegate().is_ok());
}

#[test]
fn virtual_call_requires_an_instance_method() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let util = graph.add_type(TypeData::new(
        TypeName::from_string(String::from("Acme.Util")).unwrap(),
        Some(system.object),
        TypeFlavor::Class,
        TypeAttributes::PUBLIC,
    ));
    let helper = graph.add_method(MethodData {
        class: util,
        name: MemberName::from_string(String::from("Helper")).unwrap(),
        signature: MethodSig::new(vec![], None),
        attributes: MethodAttributes::PUBLIC | MethodAttributes::STATIC,
    });

    let mut emit = emitter(&graph, &system, vec![], None);
    let error = emit.call_virtual(helper).unwrap_err();
    assert!(matches!(error.kind, ErrorKind::InvalidOperation { .. }));
}

#[test]
fn locals_must_be_stored_before_loaded() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let local = emit.declare_local(CilType::int32(), Some("x")).unwrap();
    let error = emit.load_local(local).unwrap_err();

    match error.kind {
        ErrorKind::InvalidOperation { reason } => {
            assert!(reason.contains("before any store"));
        }
        other => panic!("expected InvalidOperation, got {:?}", other),
    }
}

#[test]
fn local_stores_check_assignability() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let local = emit.declare_local(CilType::int64(), None).unwrap();
    emit.load_constant_i32(1).unwrap();
    let error = emit.store_local(local).unwrap_err();
    assert!(matches!(error.kind, ErrorKind::TypeMismatch { .. }));
}

#[test]
fn tokens_from_another_emitter_are_rejected() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut first = emitter(&graph, &system, vec![], None);
    let mut second = emitter(&graph, &system, vec![], None);
    let foreign = first.define_label(None).unwrap();

    let error = second.branch(foreign).unwrap_err();
    assert!(matches!(error.kind, ErrorKind::OwnershipError { .. }));
}

#[test]
fn errors_poison_the_emitter() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let underflow = emit.add().unwrap_err();
    assert!(matches!(underflow.kind, ErrorKind::StackUnderflow { .. }));

    let poisoned = emit.nop().unwrap_err();
    match poisoned.kind {
        ErrorKind::InvalidOperation { reason } => {
            assert!(reason.contains("poisoned"));
        }
        other => panic!("expected InvalidOperation, got {:?}", other),
    }
}

#[test]
fn unmarked_labels_block_finalization() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let never = emit.define_label(Some("never")).unwrap();
    emit.load_constant_i32(1).unwrap();
    emit.branch_if_true(never).unwrap();
    emit.ret().unwrap();

    let error = emit.create_delegate().unwrap_err();
    match error.kind {
        ErrorKind::LabelError { reason, label } => {
            assert_eq!(reason, "label is never marked");
            assert_eq!(label, "never");
        }
        other => panic!("expected LabelError, got {:?}", other),
    }
}

#[test]
fn labels_cannot_be_marked_twice() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    let label = emit.define_label(None).unwrap();
    emit.mark_label(label).unwrap();
    let error = emit.mark_label(label).unwrap_err();
    assert!(matches!(error.kind, ErrorKind::LabelError { .. }));
}

#[test]
fn void_return_rejects_a_dirty_stack() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    emit.load_constant_i32(1).unwrap();
    let error = emit.ret().unwrap_err();
    assert!(matches!(error.kind, ErrorKind::InvalidOperation { .. }));
}

#[test]
fn return_type_is_checked() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], Some(CilType::int32()));
    emit.load_constant_i64(1).unwrap();
    let error = emit.ret().unwrap_err();
    assert!(matches!(error.kind, ErrorKind::TypeMismatch { .. }));
}

#[test]
fn arity_of_every_handler_matches_its_stack_effect() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    assert_eq!(emit.stack_shape().len(), 0);
    emit.load_constant_i32(1).unwrap();
    assert_eq!(emit.stack_shape().len(), 1);
    emit.load_constant_i32(2).unwrap();
    assert_eq!(emit.stack_shape().len(), 2);
    emit.add().unwrap();
    assert_eq!(emit.stack_shape().len(), 1);
    emit.duplicate().unwrap();
    assert_eq!(emit.stack_shape().len(), 2);
    emit.compare_equal().unwrap();
    assert_eq!(emit.stack_shape().len(), 1);
    emit.pop().unwrap();
    assert_eq!(emit.stack_shape().len(), 0);
}

#[test]
fn arithmetic_rejects_mixed_integer_widths() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    emit.load_constant_i32(1).unwrap();
    emit.load_constant_i64(2).unwrap();
    let error = emit.add().unwrap_err();
    assert!(matches!(error.kind, ErrorKind::TypeMismatch { .. }));
}

#[test]
fn array_elements_round_trip_through_the_verifier() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], Some(CilType::int32()));
    let arr = emit
        .declare_local(CilType::Ref(graph.array_of(CilType::int32())), Some("arr"))
        .unwrap();

    emit.load_constant_i32(3).unwrap();
    emit.new_array(CilType::int32()).unwrap();
    emit.store_local(arr).unwrap();

    emit.load_local(arr).unwrap();
    emit.load_constant_i32(0).unwrap();
    emit.load_constant_i32(42).unwrap();
    emit.store_element().unwrap();

    emit.load_local(arr).unwrap();
    emit.load_constant_i32(0).unwrap();
    emit.load_element().unwrap();
    emit.ret().unwrap();

    assert!(emit.create_delegate().is_ok());
}

#[test]
fn boxing_produces_a_reference() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(
        &graph,
        &system,
        vec![],
        Some(CilType::Ref(system.object)),
    );
    emit.load_constant_i32(7).unwrap();
    emit.box_value(&CilType::int32()).unwrap();
    assert_eq!(emit.stack_shape(), vec!["System.Int32"]);
    emit.ret().unwrap();
    assert!(emit.create_delegate().is_ok());
}

#[test]
fn determinism_identical_sequences_emit_identical_bytes() {
    fn build(bytes_out: &mut Vec<u8>) {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_library_types();

        let mut emit = emitter(&graph, &system, vec![CilType::int32()], Some(CilType::int32()));
        let then = emit.define_label(None).unwrap();
        let join = emit.define_label(None).unwrap();
        emit.load_argument(0).unwrap();
        emit.branch_if_true(then).unwrap();
        emit.load_constant_string("zero").unwrap();
        emit.pop().unwrap();
        emit.load_constant_i32(0).unwrap();
        emit.branch(join).unwrap();
        emit.mark_label(then).unwrap();
        emit.load_constant_i32(1).unwrap();
        emit.mark_label(join).unwrap();
        emit.ret().unwrap();

        *bytes_out = emit.create_delegate().unwrap().bytes.clone();
    }

    let mut first = vec![];
    let mut second = vec![];
    build(&mut first);
    build(&mut second);
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn create_delegate_is_idempotent() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    emit.ret().unwrap();

    let first = emit.create_delegate().unwrap().clone();
    let second = emit.create_delegate().unwrap().clone();
    assert_eq!(first, second);

    // And the instance is sealed against further mutation
    let error = emit.nop().unwrap_err();
    assert!(matches!(error.kind, ErrorKind::InvalidOperation { .. }));
}

#[test]
fn finalization_requires_a_terminated_body() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], None);
    emit.nop().unwrap();
    let error = emit.create_delegate().unwrap_err();
    assert!(matches!(error.kind, ErrorKind::InvalidOperation { .. }));
}

#[test]
fn max_stack_tracks_the_high_water_mark() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.insert_system_library_types();

    let mut emit = emitter(&graph, &system, vec![], Some(CilType::int32()));
    emit.load_constant_i32(1).unwrap();
    emit.load_constant_i32(2).unwrap();
    emit.load_constant_i32(3).unwrap();
    emit.add().unwrap();
    emit.add().unwrap();
    emit.ret().unwrap();

    let body = emit.create_delegate().unwrap();
    assert_eq!(body.max_stack, 3);
}
