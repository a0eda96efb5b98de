//! End-to-end exercises over synthetic class files.
//!
//! Inputs are assembled through the jclass model the same way the
//! compilers under consideration lay them out, serialized to bytes and
//! then pushed through the public grouping/detection/patching surface.

use std::collections::BTreeMap;
use std::error::Error;

use jclass::access_flags::{FieldAccessFlags, MethodAccessFlags};
use jclass::attributes::AttributeInfo;
use jclass::class_file::{ClassFile, FieldInfo, MethodInfo};
use jclass::code::{CodeBody, CodeItem, Insn, Operand};
use jclass::opcodes as op;

use lazyup::compare::{compare, ComparisonResult};
use lazyup::detect::{detect, DetectionResult, Family};
use lazyup::group::{group, ClassGroup};
use lazyup::patch::{patch, PatchResult};
use lazyup::view::ClassView;

const LAZY_VALS: &str = "scala/runtime/LazyVals$";
const EVALUATING: &str = "scala/runtime/LazyVals$Evaluating$";
const NULL_VALUE: &str = "scala/runtime/LazyVals$NullValue$";
const OBJ: &str = "Ljava/lang/Object;";
const VH: &str = "Ljava/lang/invoke/VarHandle;";

struct ClassBuilder {
    class: ClassFile,
}

impl ClassBuilder {
    fn new(name: &str) -> ClassBuilder {
        let mut pool = jclass::constants::Pool::default();
        let this_class = pool.ensure_class(name).unwrap();
        let super_class = pool.ensure_class("java/lang/Object").unwrap();
        ClassBuilder {
            class: ClassFile {
                minor_version: 0,
                major_version: 61,
                pool,
                access_flags: 0x0021,
                this_class,
                super_class,
                interfaces: vec![],
                fields: vec![],
                methods: vec![],
                attributes: vec![],
            },
        }
    }

    fn field(mut self, name: &str, descriptor: &str, flags: u16) -> Self {
        let name_index = self.class.pool.ensure_utf8(name).unwrap();
        let descriptor_index = self.class.pool.ensure_utf8(descriptor).unwrap();
        self.class.fields.push(FieldInfo {
            access_flags: flags,
            name_index,
            descriptor_index,
            attributes: vec![],
        });
        self
    }

    fn method(
        mut self,
        name: &str,
        descriptor: &str,
        flags: u16,
        max_stack: u16,
        max_locals: u16,
        build: impl FnOnce(&mut jclass::constants::Pool, &mut CodeBody),
    ) -> Self {
        let mut body = CodeBody::new();
        body.max_stack = max_stack;
        body.max_locals = max_locals;
        build(&mut self.class.pool, &mut body);
        let name_index = self.class.pool.ensure_utf8(name).unwrap();
        let descriptor_index = self.class.pool.ensure_utf8(descriptor).unwrap();
        self.class.methods.push(MethodInfo {
            access_flags: flags,
            name_index,
            descriptor_index,
            attributes: vec![AttributeInfo::Code(body)],
        });
        self
    }

    fn bytes(mut self) -> Vec<u8> {
        self.class.to_bytes().unwrap()
    }
}

fn push(body: &mut CodeBody, insn: Insn) {
    body.items.push(CodeItem::Insn(insn));
}

/// `GETSTATIC LazyVals$.MODULE$`.
fn module_load(pool: &mut jclass::constants::Pool) -> Insn {
    let index = pool
        .ensure_fieldref(LAZY_VALS, "MODULE$", "Lscala/runtime/LazyVals$;")
        .unwrap();
    Insn::cp(op::GETSTATIC, index)
}

/// The 3.3-3.7 `<clinit>` offset-lookup run for one storage field.
fn legacy_offset_lookup(
    pool: &mut jclass::constants::Pool,
    body: &mut CodeBody,
    holder: &str,
    lookup_class: &str,
    storage_name: &str,
    offset_name: &str,
) {
    let class_literal = pool.ensure_class(lookup_class).unwrap();
    let name_literal = pool.ensure_string(storage_name).unwrap();
    let get_field = pool
        .ensure_methodref(
            "java/lang/Class",
            "getDeclaredField",
            "(Ljava/lang/String;)Ljava/lang/reflect/Field;",
        )
        .unwrap();
    let get_offset = pool
        .ensure_methodref(LAZY_VALS, "getOffsetStatic", "(Ljava/lang/reflect/Field;)J")
        .unwrap();
    let offset_ref = pool.ensure_fieldref(holder, offset_name, "J").unwrap();
    push(body, module_load(pool));
    push(body, Insn::cp(op::LDC, class_literal));
    push(body, Insn::cp(op::LDC, name_literal));
    push(body, Insn::cp(op::INVOKEVIRTUAL, get_field));
    push(body, Insn::cp(op::INVOKEVIRTUAL, get_offset));
    push(body, Insn::cp(op::PUTSTATIC, offset_ref));
}

/// A complete standalone 3.3-3.7 module class with one string-typed
/// lazy val. `computed` differentiates otherwise-identical classes.
fn v3_7_class(name: &str, computed: &str) -> Vec<u8> {
    ClassBuilder::new(name)
        .field("value$lzy1", OBJ, 0x0042)
        .field("OFFSET$_m_0", "J", 0x001A)
        .method("<clinit>", "()V", 0x0008, 3, 0, |pool, body| {
            legacy_offset_lookup(pool, body, name, name, "value$lzy1", "OFFSET$_m_0");
            push(body, Insn::simple(op::RETURN));
        })
        .method(
            "value$lzyINIT1",
            "()Ljava/lang/Object;",
            0x0012,
            7,
            2,
            |pool, body| {
                let storage = pool.ensure_fieldref(name, "value$lzy1", OBJ).unwrap();
                let offset = pool.ensure_fieldref(name, "OFFSET$_m_0", "J").unwrap();
                let evaluating = pool
                    .ensure_fieldref(EVALUATING, "MODULE$", "Lscala/runtime/LazyVals$Evaluating$;")
                    .unwrap();
                let obj_cas = pool
                    .ensure_methodref(
                        LAZY_VALS,
                        "objCAS",
                        "(Ljava/lang/Object;JLjava/lang/Object;Ljava/lang/Object;)Z",
                    )
                    .unwrap();
                let computed_literal = pool.ensure_string(computed).unwrap();
                let l_retry = body.new_label();
                let l_published = body.new_label();
                body.items.push(CodeItem::Label(l_retry));
                push(body, Insn::var(op::ALOAD, 0));
                push(body, Insn::cp(op::GETFIELD, storage));
                push(body, Insn::var(op::ASTORE, 1));
                push(body, Insn::var(op::ALOAD, 1));
                push(body, Insn::jump(op::IFNONNULL, l_published));
                push(body, module_load(pool));
                push(body, Insn::var(op::ALOAD, 0));
                push(body, Insn::cp(op::GETSTATIC, offset));
                push(body, Insn::simple(op::ACONST_NULL));
                push(body, Insn::cp(op::GETSTATIC, evaluating));
                push(body, Insn::cp(op::INVOKEVIRTUAL, obj_cas));
                push(body, Insn::jump(op::IFEQ, l_retry));
                push(body, Insn::cp(op::LDC, computed_literal));
                push(body, Insn::simple(op::ARETURN));
                body.items.push(CodeItem::Label(l_published));
                push(body, Insn::var(op::ALOAD, 1));
                push(body, Insn::simple(op::ARETURN));
            },
        )
        .method("value", "()Ljava/lang/String;", 0x0001, 2, 2, |pool, body| {
            string_accessor(pool, body, name);
        })
        .bytes()
}

/// The 3.8-style accessor shared by the legacy and reference shapes.
fn string_accessor(pool: &mut jclass::constants::Pool, body: &mut CodeBody, owner: &str) {
    let storage = pool.ensure_fieldref(owner, "value$lzy1", OBJ).unwrap();
    let string_class = pool.ensure_class("java/lang/String").unwrap();
    let null_value = pool
        .ensure_fieldref(NULL_VALUE, "MODULE$", "Lscala/runtime/LazyVals$NullValue$;")
        .unwrap();
    let init_ref = pool
        .ensure_methodref(owner, "value$lzyINIT1", "()Ljava/lang/Object;")
        .unwrap();
    let l_check_null = body.new_label();
    let l_call_init = body.new_label();
    push(body, Insn::var(op::ALOAD, 0));
    push(body, Insn::cp(op::GETFIELD, storage));
    push(body, Insn::var(op::ASTORE, 1));
    push(body, Insn::var(op::ALOAD, 1));
    push(body, Insn::cp(op::INSTANCEOF, string_class));
    push(body, Insn::jump(op::IFEQ, l_check_null));
    push(body, Insn::var(op::ALOAD, 1));
    push(body, Insn::cp(op::CHECKCAST, string_class));
    push(body, Insn::simple(op::ARETURN));
    body.items.push(CodeItem::Label(l_check_null));
    push(body, Insn::var(op::ALOAD, 1));
    push(body, Insn::cp(op::GETSTATIC, null_value));
    push(body, Insn::jump(op::IF_ACMPNE, l_call_init));
    push(body, Insn::simple(op::ACONST_NULL));
    push(body, Insn::simple(op::ARETURN));
    body.items.push(CodeItem::Label(l_call_init));
    push(body, Insn::var(op::ALOAD, 0));
    push(body, Insn::cp(op::INVOKESPECIAL, init_ref));
    push(body, Insn::cp(op::CHECKCAST, string_class));
    push(body, Insn::simple(op::ARETURN));
}

/// The 3.8 reference rendition of [`v3_7_class`].
fn v3_8_class(name: &str, computed: &str) -> Vec<u8> {
    ClassBuilder::new(name)
        .field("value$lzy1", OBJ, 0x0042)
        .field("value$lzy1$lzyHandle", VH, 0x001A)
        .method("<clinit>", "()V", 0x0008, 4, 0, |pool, body| {
            let lookup = pool
                .ensure_methodref(
                    "java/lang/invoke/MethodHandles",
                    "lookup",
                    "()Ljava/lang/invoke/MethodHandles$Lookup;",
                )
                .unwrap();
            let class_literal = pool.ensure_class(name).unwrap();
            let name_literal = pool.ensure_string("value$lzy1").unwrap();
            let object_class = pool.ensure_class("java/lang/Object").unwrap();
            let find = pool
                .ensure_methodref(
                    "java/lang/invoke/MethodHandles$Lookup",
                    "findVarHandle",
                    "(Ljava/lang/Class;Ljava/lang/String;Ljava/lang/Class;)Ljava/lang/invoke/VarHandle;",
                )
                .unwrap();
            let handle_ref = pool
                .ensure_fieldref(name, "value$lzy1$lzyHandle", VH)
                .unwrap();
            push(body, Insn::cp(op::INVOKESTATIC, lookup));
            push(body, Insn::cp(op::LDC, class_literal));
            push(body, Insn::cp(op::LDC, name_literal));
            push(body, Insn::cp(op::LDC, object_class));
            push(body, Insn::cp(op::INVOKEVIRTUAL, find));
            push(body, Insn::cp(op::PUTSTATIC, handle_ref));
            push(body, Insn::simple(op::RETURN));
        })
        .method(
            "value$lzyINIT1",
            "()Ljava/lang/Object;",
            0x0012,
            5,
            2,
            |pool, body| {
                let storage = pool.ensure_fieldref(name, "value$lzy1", OBJ).unwrap();
                let handle_ref = pool
                    .ensure_fieldref(name, "value$lzy1$lzyHandle", VH)
                    .unwrap();
                let evaluating = pool
                    .ensure_fieldref(EVALUATING, "MODULE$", "Lscala/runtime/LazyVals$Evaluating$;")
                    .unwrap();
                let cas = pool
                    .ensure_methodref(
                        "java/lang/invoke/VarHandle",
                        "compareAndSet",
                        "(Ljava/lang/Object;Ljava/lang/Object;Ljava/lang/Object;)Z",
                    )
                    .unwrap();
                let computed_literal = pool.ensure_string(computed).unwrap();
                let l_retry = body.new_label();
                let l_published = body.new_label();
                body.items.push(CodeItem::Label(l_retry));
                push(body, Insn::var(op::ALOAD, 0));
                push(body, Insn::cp(op::GETFIELD, storage));
                push(body, Insn::var(op::ASTORE, 1));
                push(body, Insn::var(op::ALOAD, 1));
                push(body, Insn::jump(op::IFNONNULL, l_published));
                push(body, Insn::cp(op::GETSTATIC, handle_ref));
                push(body, Insn::var(op::ALOAD, 0));
                push(body, Insn::simple(op::ACONST_NULL));
                push(body, Insn::cp(op::GETSTATIC, evaluating));
                push(body, Insn::cp(op::INVOKEVIRTUAL, cas));
                push(body, Insn::jump(op::IFEQ, l_retry));
                push(body, Insn::cp(op::LDC, computed_literal));
                push(body, Insn::simple(op::ARETURN));
                body.items.push(CodeItem::Label(l_published));
                push(body, Insn::var(op::ALOAD, 1));
                push(body, Insn::simple(op::ARETURN));
            },
        )
        .method("value", "()Ljava/lang/String;", 0x0001, 2, 2, |pool, body| {
            string_accessor(pool, body, name);
        })
        .bytes()
}

fn parse(bytes: &[u8]) -> ClassView {
    ClassView::parse(bytes).expect("synthetic class parses")
}

fn patched_single(bytes: &[u8]) -> Vec<u8> {
    let view = parse(bytes);
    match patch(&ClassGroup::Single(view), None) {
        PatchResult::Patched { bytes, .. } => bytes,
        other => panic!("expected Patched, got {other:?}"),
    }
}

#[test]
fn detects_v3_7_standalone() -> Result<(), Box<dyn Error>> {
    let view = parse(&v3_7_class("pkg/Foo$", "alpha"));
    match detect(&view, None) {
        DetectionResult::LazyValsFound { family, instances } => {
            assert_eq!(family, Family::V33V37);
            assert_eq!(instances.len(), 1);
            let instance = &instances[0];
            assert_eq!(instance.display_name, "value");
            assert_eq!(instance.index, 1);
            assert_eq!(
                instance.offset_field.as_ref().map(|field| field.name.as_str()),
                Some("OFFSET$_m_0")
            );
            assert!(!instance.offset_in_companion);
            assert_eq!(instance.init_method.as_deref(), Some("value$lzyINIT1"));
            assert_eq!(instance.accessor.as_deref(), Some("value"));
        }
        other => panic!("expected detection, got {other:?}"),
    }
    Ok(())
}

#[test]
fn detects_v3_8_as_target_family() -> Result<(), Box<dyn Error>> {
    let view = parse(&v3_8_class("pkg/Foo$", "alpha"));
    match detect(&view, None) {
        DetectionResult::LazyValsFound { family, .. } => assert_eq!(family, Family::V38Plus),
        other => panic!("expected detection, got {other:?}"),
    }
    Ok(())
}

#[test]
fn patches_v3_7_standalone_to_handle_layout() -> Result<(), Box<dyn Error>> {
    let patched = patched_single(&v3_7_class("pkg/Foo$", "alpha"));
    let view = parse(&patched);

    assert!(view.field_named("OFFSET$_m_0").is_none());
    let handle = view
        .field_named("value$lzy1$lzyHandle")
        .expect("handle field added");
    assert_eq!(handle.descriptor, VH);
    assert!(FieldAccessFlags::is_set(handle.access_flags, FieldAccessFlags::AccPrivate));
    assert!(FieldAccessFlags::is_set(handle.access_flags, FieldAccessFlags::AccStatic));
    assert!(FieldAccessFlags::is_set(handle.access_flags, FieldAccessFlags::AccFinal));

    let clinit = view.static_initializer().expect("clinit survives");
    assert!(clinit.contains("findVarHandle"));
    assert!(clinit.contains("MethodHandles.lookup"));
    assert!(!clinit.contains("getOffsetStatic"));

    let init = view.method_named("value$lzyINIT1").expect("init survives");
    assert!(init.contains("VarHandle.compareAndSet"));
    assert!(!init.contains("objCAS"));
    assert!(!init.contains("OFFSET$_m_0"));

    match detect(&view, None) {
        DetectionResult::LazyValsFound { family, .. } => assert_eq!(family, Family::V38Plus),
        other => panic!("patched class should detect as 3.8+, got {other:?}"),
    }
    Ok(())
}

#[test]
fn patching_is_idempotent() -> Result<(), Box<dyn Error>> {
    let patched = patched_single(&v3_7_class("pkg/Foo$", "alpha"));
    let view = parse(&patched);
    match patch(&ClassGroup::Single(view), None) {
        PatchResult::NotApplicable => {}
        other => panic!("second pass must be a no-op, got {other:?}"),
    }
    Ok(())
}

#[test]
fn v3_8_input_passes_through() -> Result<(), Box<dyn Error>> {
    let view = parse(&v3_8_class("pkg/Foo$", "alpha"));
    match patch(&ClassGroup::Single(view), None) {
        PatchResult::NotApplicable => {}
        other => panic!("expected NotApplicable, got {other:?}"),
    }
    Ok(())
}

#[test]
fn patched_output_compares_identical_to_reference() -> Result<(), Box<dyn Error>> {
    let patched = parse(&patched_single(&v3_7_class("pkg/Foo$", "alpha")));
    // The reference computes a different constant: the comparison must
    // not care about the computed body.
    let reference = parse(&v3_8_class("pkg/Foo$", "beta"));
    assert_eq!(
        compare(&patched, &reference, None, None),
        ComparisonResult::Identical
    );
    Ok(())
}

#[test]
fn compare_laws_hold() -> Result<(), Box<dyn Error>> {
    let with_lazy = parse(&v3_7_class("pkg/Foo$", "alpha"));
    assert_eq!(
        compare(&with_lazy, &with_lazy, None, None),
        ComparisonResult::Identical
    );

    let plain = parse(
        &ClassBuilder::new("pkg/Plain")
            .field("count", "I", 0x0002)
            .bytes(),
    );
    assert_eq!(
        compare(&plain, &plain, None, None),
        ComparisonResult::BothNoLazyVals
    );
    assert_eq!(
        compare(&with_lazy, &plain, None, None),
        ComparisonResult::OnlyOneHasAny {
            first_count: 1,
            second_count: 0
        }
    );
    assert_eq!(
        compare(&plain, &with_lazy, None, None),
        ComparisonResult::OnlyOneHasAny {
            first_count: 0,
            second_count: 1
        }
    );
    Ok(())
}

#[test]
fn grouping_pairs_by_trailing_dollar() -> Result<(), Box<dyn Error>> {
    let mut batch = BTreeMap::new();
    batch.insert("pkg/Foo$".to_string(), v3_7_class("pkg/Foo$", "alpha"));
    batch.insert(
        "pkg/Foo".to_string(),
        ClassBuilder::new("pkg/Foo").bytes(),
    );
    batch.insert(
        "pkg/Lone".to_string(),
        ClassBuilder::new("pkg/Lone").bytes(),
    );
    let groups = group(&batch)?;
    assert_eq!(groups.len(), 2);
    let mut pairs = 0;
    let mut singles = 0;
    for class_group in &groups {
        match class_group {
            ClassGroup::Pair { module, companion } => {
                pairs += 1;
                assert_eq!(module.name, "pkg/Foo$");
                assert_eq!(companion.name, "pkg/Foo");
            }
            ClassGroup::Single(view) => {
                singles += 1;
                assert_eq!(view.name, "pkg/Lone");
            }
        }
    }
    assert_eq!((pairs, singles), (1, 1));
    Ok(())
}

#[test]
fn grouping_aggregates_parse_failures() {
    let mut batch = BTreeMap::new();
    batch.insert("pkg/Bad".to_string(), vec![0, 1, 2, 3]);
    batch.insert("pkg/AlsoBad".to_string(), vec![0xca, 0xfe]);
    let error = group(&batch).expect_err("garbage must not group");
    assert_eq!(error.failures.len(), 2);
}

#[test]
fn companion_pair_with_hoisted_offsets() -> Result<(), Box<dyn Error>> {
    // Outer pkg/Bar holds the offset field and its <clinit> lookup;
    // inner pkg/Bar$ holds storage, init method and accessor.
    let outer = ClassBuilder::new("pkg/Bar")
        .field("OFFSET$_m_0", "J", 0x001A)
        .method("<clinit>", "()V", 0x0008, 3, 0, |pool, body| {
            legacy_offset_lookup(pool, body, "pkg/Bar", "pkg/Bar$", "value$lzy1", "OFFSET$_m_0");
            push(body, Insn::simple(op::RETURN));
        })
        .bytes();
    let inner = ClassBuilder::new("pkg/Bar$")
        .field("value$lzy1", OBJ, 0x0042)
        .method(
            "value$lzyINIT1",
            "()Ljava/lang/Object;",
            0x0012,
            7,
            2,
            |pool, body| {
                let storage = pool.ensure_fieldref("pkg/Bar$", "value$lzy1", OBJ).unwrap();
                let offset = pool.ensure_fieldref("pkg/Bar", "OFFSET$_m_0", "J").unwrap();
                let evaluating = pool
                    .ensure_fieldref(EVALUATING, "MODULE$", "Lscala/runtime/LazyVals$Evaluating$;")
                    .unwrap();
                let obj_cas = pool
                    .ensure_methodref(
                        LAZY_VALS,
                        "objCAS",
                        "(Ljava/lang/Object;JLjava/lang/Object;Ljava/lang/Object;)Z",
                    )
                    .unwrap();
                let computed_literal = pool.ensure_string("alpha").unwrap();
                let l_retry = body.new_label();
                let l_published = body.new_label();
                body.items.push(CodeItem::Label(l_retry));
                push(body, Insn::var(op::ALOAD, 0));
                push(body, Insn::cp(op::GETFIELD, storage));
                push(body, Insn::var(op::ASTORE, 1));
                push(body, Insn::var(op::ALOAD, 1));
                push(body, Insn::jump(op::IFNONNULL, l_published));
                push(body, module_load(pool));
                push(body, Insn::var(op::ALOAD, 0));
                push(body, Insn::cp(op::GETSTATIC, offset));
                push(body, Insn::simple(op::ACONST_NULL));
                push(body, Insn::cp(op::GETSTATIC, evaluating));
                push(body, Insn::cp(op::INVOKEVIRTUAL, obj_cas));
                push(body, Insn::jump(op::IFEQ, l_retry));
                push(body, Insn::cp(op::LDC, computed_literal));
                push(body, Insn::simple(op::ARETURN));
                body.items.push(CodeItem::Label(l_published));
                push(body, Insn::var(op::ALOAD, 1));
                push(body, Insn::simple(op::ARETURN));
            },
        )
        .method("value", "()Ljava/lang/String;", 0x0001, 2, 2, |pool, body| {
            string_accessor(pool, body, "pkg/Bar$");
        })
        .bytes();

    let class_group = ClassGroup::Pair {
        module: parse(&inner),
        companion: parse(&outer),
    };
    let (module_bytes, companion_bytes) = match patch(&class_group, None) {
        PatchResult::PatchedPair {
            module_bytes,
            companion_bytes,
            ..
        } => (module_bytes, companion_bytes),
        other => panic!("expected PatchedPair, got {other:?}"),
    };

    let patched_outer = parse(&companion_bytes);
    assert!(patched_outer.field_named("OFFSET$_m_0").is_none());
    let outer_clinit = patched_outer.static_initializer().expect("clinit kept");
    assert!(!outer_clinit.contains("getOffsetStatic"));
    assert!(!outer_clinit.contains("findVarHandle"));

    let patched_inner = parse(&module_bytes);
    assert!(patched_inner.field_named("value$lzy1$lzyHandle").is_some());
    let inner_clinit = patched_inner
        .static_initializer()
        .expect("clinit synthesized");
    assert!(inner_clinit.contains("findVarHandle"));
    match detect(&patched_inner, Some(&patched_outer)) {
        DetectionResult::LazyValsFound { family, .. } => assert_eq!(family, Family::V38Plus),
        other => panic!("expected 3.8+ after patch, got {other:?}"),
    }
    Ok(())
}

#[test]
fn storage_shaped_field_without_evidence_is_not_a_lazy_val() -> Result<(), Box<dyn Error>> {
    let view = parse(
        &ClassBuilder::new("pkg/Case")
            .field("Inner$lzy1", "Lpkg/Case$Inner;", 0x0002)
            .bytes(),
    );
    assert!(matches!(detect(&view, None), DetectionResult::NoLazyVals));
    Ok(())
}

#[test]
fn unrecognized_clinit_with_bitmap_fails_cleanly() -> Result<(), Box<dyn Error>> {
    let bytes = ClassBuilder::new("pkg/Odd$")
        .field("value$lzy1", "I", 0x0009)
        .field("0bitmap$1", "J", 0x0001)
        .field("OFFSET$_m_0", "J", 0x001A)
        .method("<clinit>", "()V", 0x0008, 3, 0, |pool, body| {
            let class_literal = pool.ensure_class("pkg/Odd$").unwrap();
            let name_literal = pool.ensure_string("0bitmap$1").unwrap();
            let helper = pool
                .ensure_methodref(
                    LAZY_VALS,
                    "someFutureHelper",
                    "(Ljava/lang/Class;Ljava/lang/String;)J",
                )
                .unwrap();
            let offset_ref = pool.ensure_fieldref("pkg/Odd$", "OFFSET$_m_0", "J").unwrap();
            push(body, module_load(pool));
            push(body, Insn::cp(op::LDC, class_literal));
            push(body, Insn::cp(op::LDC, name_literal));
            push(body, Insn::cp(op::INVOKEVIRTUAL, helper));
            push(body, Insn::cp(op::PUTSTATIC, offset_ref));
            push(body, Insn::simple(op::RETURN));
        })
        .bytes();
    let view = parse(&bytes);
    match detect(&view, None) {
        DetectionResult::LazyValsFound { family, .. } => {
            assert!(matches!(family, Family::Unknown(_)));
        }
        other => panic!("expected unknown-family detection, got {other:?}"),
    }
    match patch(&ClassGroup::Single(parse(&bytes)), None) {
        PatchResult::Failed { diagnostic } => {
            assert!(diagnostic.contains("value$lzy1"));
            assert!(diagnostic.contains("0bitmap$1"));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    Ok(())
}

/// A standalone 3.0/3.1-shaped class with one int-typed lazy val whose
/// computation is `constant`.
fn v0_1_class(name: &str, constant: i8) -> Vec<u8> {
    ClassBuilder::new(name)
        .field("value$lzy1", "I", 0x0009)
        .field("0bitmap$1", "J", 0x0001)
        .field("OFFSET$_m_0", "J", 0x001A)
        .method("<init>", "()V", 0x0001, 3, 1, |pool, body| {
            let super_init = pool
                .ensure_methodref("java/lang/Object", "<init>", "()V")
                .unwrap();
            let bitmap_ref = pool.ensure_fieldref(name, "0bitmap$1", "J").unwrap();
            push(body, Insn::var(op::ALOAD, 0));
            push(body, Insn::cp(op::INVOKESPECIAL, super_init));
            push(body, Insn::var(op::ALOAD, 0));
            push(body, Insn::simple(op::LCONST_0));
            push(body, Insn::cp(op::PUTFIELD, bitmap_ref));
            push(body, Insn::simple(op::RETURN));
        })
        .method("<clinit>", "()V", 0x0008, 4, 0, |pool, body| {
            let class_literal = pool.ensure_class(name).unwrap();
            let name_literal = pool.ensure_string("0bitmap$1").unwrap();
            let get_offset = pool
                .ensure_methodref(LAZY_VALS, "getOffset", "(Ljava/lang/Class;Ljava/lang/String;)J")
                .unwrap();
            let offset_ref = pool.ensure_fieldref(name, "OFFSET$_m_0", "J").unwrap();
            push(body, module_load(pool));
            push(body, Insn::cp(op::LDC, class_literal));
            push(body, Insn::cp(op::LDC, name_literal));
            push(body, Insn::cp(op::INVOKEVIRTUAL, get_offset));
            push(body, Insn::cp(op::PUTSTATIC, offset_ref));
            push(body, Insn::simple(op::RETURN));
        })
        .method("value", "()I", 0x0001, 8, 6, |pool, body| {
            // A reduced rendition of the inline bitmap protocol: state
            // CAS, compute, store into the conventional slot, publish.
            let storage = pool.ensure_fieldref(name, "value$lzy1", "I").unwrap();
            let offset = pool.ensure_fieldref(name, "OFFSET$_m_0", "J").unwrap();
            let bitmap_ref = pool.ensure_fieldref(name, "0bitmap$1", "J").unwrap();
            let cas = pool
                .ensure_methodref(LAZY_VALS, "CAS", "(Ljava/lang/Object;JJI)Z")
                .unwrap();
            let set_flag = pool
                .ensure_methodref(LAZY_VALS, "setFlag", "(Ljava/lang/Object;JII)V")
                .unwrap();
            let l_retry = body.new_label();
            let l_init = body.new_label();
            body.items.push(CodeItem::Label(l_retry));
            push(body, Insn::var(op::ALOAD, 0));
            push(body, Insn::cp(op::GETFIELD, bitmap_ref));
            push(body, Insn::simple(op::LCONST_0));
            push(body, Insn::simple(op::LCMP));
            push(body, Insn::jump(op::IFNE, l_init));
            push(body, module_load(pool));
            push(body, Insn::var(op::ALOAD, 0));
            push(body, Insn::cp(op::GETSTATIC, offset));
            push(body, Insn::simple(op::LCONST_1));
            push(body, Insn::simple(op::ICONST_0));
            push(body, Insn::cp(op::INVOKEVIRTUAL, cas));
            push(body, Insn::jump(op::IFEQ, l_retry));
            push(body, Insn { opcode: op::BIPUSH, operand: Operand::Byte(constant) });
            push(body, Insn::var(op::ISTORE, 5));
            push(body, Insn::var(op::ALOAD, 0));
            push(body, Insn::var(op::ILOAD, 5));
            push(body, Insn::cp(op::PUTFIELD, storage));
            push(body, module_load(pool));
            push(body, Insn::var(op::ALOAD, 0));
            push(body, Insn::cp(op::GETSTATIC, offset));
            push(body, Insn::simple(op::ICONST_3));
            push(body, Insn::simple(op::ICONST_0));
            push(body, Insn::cp(op::INVOKEVIRTUAL, set_flag));
            push(body, Insn::var(op::ILOAD, 5));
            push(body, Insn::simple(op::IRETURN));
            body.items.push(CodeItem::Label(l_init));
            push(body, Insn::var(op::ALOAD, 0));
            push(body, Insn::cp(op::GETFIELD, storage));
            push(body, Insn::simple(op::IRETURN));
        })
        .bytes()
}

#[test]
fn detects_v0_1_family() -> Result<(), Box<dyn Error>> {
    let view = parse(&v0_1_class("pkg/Box$", 42));
    match detect(&view, None) {
        DetectionResult::LazyValsFound { family, instances } => {
            assert_eq!(family, Family::V30V31);
            assert_eq!(
                instances[0]
                    .bitmap_field
                    .as_ref()
                    .map(|field| field.name.as_str()),
                Some("0bitmap$1")
            );
        }
        other => panic!("expected 3.0-3.1 detection, got {other:?}"),
    }
    Ok(())
}

#[test]
fn rebuilds_v0_1_class_around_a_synthesized_initializer() -> Result<(), Box<dyn Error>> {
    let patched = patched_single(&v0_1_class("pkg/Box$", 42));
    let view = parse(&patched);

    // Legacy fields are gone, the storage field is retyped.
    assert!(view.field_named("0bitmap$1").is_none());
    assert!(view.field_named("OFFSET$_m_0").is_none());
    let storage = view.field_named("value$lzy1").expect("storage kept");
    assert_eq!(storage.descriptor, OBJ);
    assert!(FieldAccessFlags::is_set(storage.access_flags, FieldAccessFlags::AccPrivate));
    assert!(FieldAccessFlags::is_set(storage.access_flags, FieldAccessFlags::AccVolatile));
    assert!(!FieldAccessFlags::is_set(storage.access_flags, FieldAccessFlags::AccStatic));
    assert!(view.field_named("value$lzy1$lzyHandle").is_some());

    // The synthesized initializer: private final, state machine with
    // the boxed computation, recomputed stack map.
    let init = view.method_named("value$lzyINIT1").expect("init synthesized");
    assert_eq!(init.descriptor, "()Ljava/lang/Object;");
    assert!(MethodAccessFlags::is_set(init.access_flags, MethodAccessFlags::AccPrivate));
    assert!(init.contains("VarHandle.compareAndSet"));
    assert!(init.contains("boxToInteger"));
    assert!(init.contains("LazyVals$Waiting.countDown"));
    assert!(init.contains("LazyVals$Waiting.await"));
    assert!(init.contains("LazyVals$LazyValControlState"));
    assert!(init.contains("BIPUSH 42"));
    let init_body = view.class.methods[init.method_index]
        .code()
        .expect("init has code");
    assert!(!init_body.stack_map.is_empty());
    assert_eq!(init_body.max_stack, 5);
    assert!(init_body.max_locals >= 6);

    // The accessor shrank to the three-branch read path.
    let accessor = view.method_named("value").expect("accessor kept");
    assert!(accessor.contains("unboxToInt"));
    assert!(accessor.contains("value$lzyINIT1"));
    assert!(!accessor.contains("LazyVals$.CAS"));
    assert!(!accessor.contains("setFlag"));

    // The <clinit> installs the handle and the constructor lost its
    // bitmap store.
    let clinit = view.static_initializer().expect("clinit kept");
    assert!(clinit.contains("findVarHandle"));
    assert!(!clinit.contains("LazyVals$.getOffset ("));
    let constructor = view.method_named("<init>").expect("constructor kept");
    assert!(!constructor.contains("0bitmap$1"));

    match detect(&view, None) {
        DetectionResult::LazyValsFound { family, .. } => assert_eq!(family, Family::V38Plus),
        other => panic!("expected 3.8+ after patch, got {other:?}"),
    }
    Ok(())
}

#[test]
fn v0_1_outputs_are_equivalent_across_computations() -> Result<(), Box<dyn Error>> {
    // Two inputs differing only in the computed constant must patch to
    // semantically identical lazy vals.
    let first = parse(&patched_single(&v0_1_class("pkg/Box$", 42)));
    let second = parse(&patched_single(&v0_1_class("pkg/Box$", 7)));
    assert_eq!(
        compare(&first, &second, None, None),
        ComparisonResult::Identical
    );
    Ok(())
}

#[test]
fn v0_1_patching_is_idempotent() -> Result<(), Box<dyn Error>> {
    let patched = patched_single(&v0_1_class("pkg/Box$", 42));
    match patch(&ClassGroup::Single(parse(&patched)), None) {
        PatchResult::NotApplicable => {}
        other => panic!("second pass must be a no-op, got {other:?}"),
    }
    Ok(())
}

/// Like [`v0_1_class`] but with the 3.2 two-step reflective offset
/// lookup in `<clinit>`; everything else is shared with 3.0/3.1.
fn v2_class(name: &str, constant: i8) -> Vec<u8> {
    let mut bytes = v0_1_class(name, constant);
    // Rebuild with the alternative <clinit>: parse, swap the lookup.
    let mut class = ClassFile::from_bytes(&bytes).unwrap();
    let clinit_index = class
        .methods
        .iter()
        .position(|method| class.pool.utf8(method.name_index).as_deref() == Some("<clinit>"))
        .unwrap();
    let mut body = CodeBody::new();
    legacy_offset_lookup(&mut class.pool, &mut body, name, name, "0bitmap$1", "OFFSET$_m_0");
    body.items.push(CodeItem::Insn(Insn::simple(op::RETURN)));
    body.max_stack = 3;
    class.methods[clinit_index].attributes = vec![AttributeInfo::Code(body)];
    bytes = class.to_bytes().unwrap();
    bytes
}

#[test]
fn detects_and_patches_v2_like_v0_1() -> Result<(), Box<dyn Error>> {
    let view = parse(&v2_class("pkg/Two$", 9));
    match detect(&view, None) {
        DetectionResult::LazyValsFound { family, .. } => assert_eq!(family, Family::V32),
        other => panic!("expected 3.2 detection, got {other:?}"),
    }
    let patched = parse(&patched_single(&v2_class("pkg/Two$", 9)));
    match detect(&patched, None) {
        DetectionResult::LazyValsFound { family, .. } => assert_eq!(family, Family::V38Plus),
        other => panic!("expected 3.8+ after patch, got {other:?}"),
    }
    // Both legacy generations converge on the same target semantics.
    let from_v0_1 = parse(&patched_single(&v0_1_class("pkg/Two$", 5)));
    assert_eq!(
        compare(&patched, &from_v0_1, None, None),
        ComparisonResult::Identical
    );
    Ok(())
}

#[test]
fn unanchored_offset_store_is_a_hard_failure() -> Result<(), Box<dyn Error>> {
    // The MODULE$ anchor sits more than ten instructions before the
    // offset store: stripping must refuse rather than under-strip.
    let mut bytes = v0_1_class("pkg/Far$", 1);
    let mut class = ClassFile::from_bytes(&bytes).unwrap();
    let clinit_index = class
        .methods
        .iter()
        .position(|method| class.pool.utf8(method.name_index).as_deref() == Some("<clinit>"))
        .unwrap();
    let body = class.methods[clinit_index].code_mut().unwrap();
    // Pad between the helper call and the store.
    let store = body
        .items
        .iter()
        .position(|item| matches!(item, CodeItem::Insn(insn) if insn.opcode == op::PUTSTATIC))
        .unwrap();
    for _ in 0..8 {
        body.items.insert(store, CodeItem::Insn(Insn::simple(op::NOP)));
    }
    bytes = class.to_bytes().unwrap();

    let view = parse(&bytes);
    match detect(&view, None) {
        DetectionResult::LazyValsFound { family, .. } => assert_eq!(family, Family::V30V31),
        other => panic!("expected 3.0-3.1 detection, got {other:?}"),
    }
    match patch(&ClassGroup::Single(view), None) {
        PatchResult::Failed { diagnostic } => assert!(diagnostic.contains("MissingAnchor")),
        other => panic!("expected Failed, got {other:?}"),
    }
    Ok(())
}

#[test]
fn pair_halves_of_different_families_are_rejected() -> Result<(), Box<dyn Error>> {
    // Module half on the 3.3-3.7 layout, plain half on 3.0-3.1: the
    // same compiler never produces this, so it fails loudly.
    let module = v3_7_class("pkg/Mix$", "alpha");
    let companion = v0_1_class("pkg/Mix", 3);
    let class_group = ClassGroup::Pair {
        module: parse(&module),
        companion: parse(&companion),
    };
    match patch(&class_group, None) {
        PatchResult::Failed { diagnostic } => {
            assert!(diagnostic.contains("pkg/Mix$"));
            assert!(diagnostic.contains("family"));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    Ok(())
}
