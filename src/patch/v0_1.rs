//! Patcher for the 3.0–3.2 families.
//!
//! These compilers inlined the whole initialization protocol into the
//! accessor: a packed `long` bitmap holds the state, the storage field
//! is typed, and there is no initializer method. Patching is therefore
//! structural: the bitmap and offset fields go away, the storage field
//! is retyped to a volatile `Object`, a `$lzyINIT` method implementing
//! the object-sentinel state machine is synthesized around the original
//! computation (lifted out of the legacy accessor), and the accessor
//! shrinks to the three-branch read path of the target layout.
//!
//! The 3.2 family differs from 3.0/3.1 only in the `<clinit>` sequence
//! it emitted, and the anchored backward removal below handles both.

use std::collections::HashMap;

use tracing::debug;

use jclass::access_flags::{FieldAccessFlags, MethodAccessFlags};
use jclass::attributes::AttributeInfo;
use jclass::class_file::{ClassFile, MethodInfo};
use jclass::code::{CodeBody, CodeItem, ExceptionHandler, Insn, Label, Operand};
use jclass::constants::Pool;
use jclass::frames::{self, SuperTypeResolver};
use jclass::opcodes as op;

use crate::detect::{LazyValInstance, LONG_DESCRIPTOR};
use crate::errors::rewrite::{RewriteCause, RewriteError};
use crate::patch::rewrite::{
    self, dangling_member_use, ensure_handle_field, ensure_inner_class,
    ensure_lookup_inner_class, insn_member, is_module_getstatic, remove_fields, value_kind,
    ValueKind, COMPARE_AND_SET_DESCRIPTOR, OBJECT_DESCRIPTOR, VARHANDLE,
};
use crate::patch::v3_7::install_handles_at_clinit_start;
use crate::view::ClassView;

/// How far back from an offset `PUTSTATIC` the anchoring
/// `GETSTATIC LazyVals$.MODULE$` may sit. A longer legacy sequence
/// would silently under-strip, so not finding the anchor inside the
/// window is a hard error.
const ANCHOR_LOOKBACK: usize = 10;

/// Local-variable slots of the synthesized initializer.
const SLOT_READ: u16 = 1;
const SLOT_RESULT: u16 = 2;
const SLOT_VALUE: u16 = 3;
const SLOT_EXCEPTION: u16 = 4;
const SLOT_WAITING: u16 = 5;

fn rewrite_error(cause: RewriteCause) -> RewriteError {
    RewriteError::new(cause, "")
}

fn pattern_not_found(what: String) -> RewriteError {
    rewrite_error(RewriteCause::PatternNotFound(what))
}

struct RuntimeRefs {
    storage_ref: u16,
    handle_ref: u16,
    compare_and_set: u16,
    evaluating_module: u16,
    null_value_module: u16,
    waiting_class: u16,
    waiting_init: u16,
    waiting_await: u16,
    waiting_count_down: u16,
    control_state_class: u16,
}

impl RuntimeRefs {
    fn intern(
        pool: &mut Pool,
        owner: &str,
        storage_name: &str,
        handle_name: &str,
    ) -> Result<RuntimeRefs, RewriteError> {
        let evaluating = rewrite::lazy_vals_nested("Evaluating$");
        let null_value = rewrite::lazy_vals_nested("NullValue$");
        let waiting = rewrite::lazy_vals_nested("Waiting");
        let control_state = rewrite::lazy_vals_nested("LazyValControlState");
        Ok(RuntimeRefs {
            storage_ref: pool.ensure_fieldref(owner, storage_name, OBJECT_DESCRIPTOR)?,
            handle_ref: pool.ensure_fieldref(
                owner,
                handle_name,
                crate::detect::VARHANDLE_DESCRIPTOR,
            )?,
            compare_and_set: pool.ensure_methodref(
                VARHANDLE,
                "compareAndSet",
                COMPARE_AND_SET_DESCRIPTOR,
            )?,
            evaluating_module: pool.ensure_fieldref(
                &evaluating,
                "MODULE$",
                &format!("L{evaluating};"),
            )?,
            null_value_module: pool.ensure_fieldref(
                &null_value,
                "MODULE$",
                &format!("L{null_value};"),
            )?,
            waiting_class: pool.ensure_class(&waiting)?,
            waiting_init: pool.ensure_methodref(&waiting, "<init>", "()V")?,
            waiting_await: pool.ensure_methodref(&waiting, "await", "()V")?,
            waiting_count_down: pool.ensure_methodref(&waiting, "countDown", "()V")?,
            control_state_class: pool.ensure_class(&control_state)?,
        })
    }
}

/// The computation lifted out of a legacy accessor: the instructions
/// between the state CAS and the protocol's result store, plus any
/// try-catch records living entirely inside that range.
struct Extraction {
    items: Vec<CodeItem>,
    handlers: Vec<ExceptionHandler>,
    max_locals: u16,
}

fn store_into_slot(insn: &Insn, slot: u16) -> bool {
    matches!(
        insn.opcode,
        op::ISTORE | op::LSTORE | op::FSTORE | op::DSTORE | op::ASTORE
    ) && insn.operand == Operand::Var(slot)
}

/// Labels closing a try-catch whose handler belongs to the legacy
/// protocol (it calls `LazyVals$.setFlag`).
fn protocol_end_labels(pool: &Pool, body: &CodeBody) -> Vec<Label> {
    let module = rewrite::lazy_vals_module();
    let mut labels = Vec::new();
    for handler in &body.handlers {
        let Some(handler_item) = body.label_position(handler.handler) else {
            continue;
        };
        let calls_set_flag = body.items[handler_item..]
            .iter()
            .filter_map(|item| match item {
                CodeItem::Insn(insn) => Some(insn),
                CodeItem::Label(_) => None,
            })
            .take(40)
            .any(|insn| {
                insn.opcode == op::INVOKEVIRTUAL
                    && insn_member(pool, insn)
                        .map(|(owner, name, _)| owner == module && name == "setFlag")
                        .unwrap_or(false)
            });
        if calls_set_flag {
            labels.push(handler.end);
        }
    }
    labels
}

/// Locates and copies the computation out of the legacy accessor.
fn extract_computation(pool: &Pool, accessor: &CodeBody) -> Result<Extraction, RewriteError> {
    let module = rewrite::lazy_vals_module();
    let end_labels = protocol_end_labels(pool, accessor);

    let mut cas_item = None;
    for (index, item) in accessor.items.iter().enumerate() {
        if let CodeItem::Insn(insn) = item {
            if insn.opcode == op::INVOKEVIRTUAL
                && insn_member(pool, insn)
                    .map(|(owner, name, _)| owner == module && name == "CAS")
                    .unwrap_or(false)
            {
                cas_item = Some(index);
                break;
            }
        }
    }
    let cas_item = cas_item
        .ok_or_else(|| pattern_not_found("legacy accessor without a LazyVals$.CAS call".into()))?;

    // The CAS is followed by the retry branch; the computation starts
    // right after it.
    let mut branch_item = cas_item + 1;
    while branch_item < accessor.items.len()
        && matches!(accessor.items[branch_item], CodeItem::Label(_))
    {
        branch_item += 1;
    }
    let is_branch = matches!(
        accessor.items.get(branch_item),
        Some(CodeItem::Insn(insn)) if matches!(insn.opcode, op::IFEQ..=op::IF_ACMPNE)
    );
    if !is_branch {
        return Err(pattern_not_found(
            "no guard branch after the state CAS".into(),
        ));
    }

    let start = branch_item + 1;
    let mut end = None;
    for (index, item) in accessor.items.iter().enumerate().skip(start) {
        match item {
            CodeItem::Insn(insn) if store_into_slot(insn, 5) => {
                end = Some(index);
                break;
            }
            CodeItem::Label(label) if end_labels.contains(label) => {
                end = Some(index);
                break;
            }
            _ => {}
        }
    }
    let end = end.ok_or_else(|| {
        pattern_not_found("computation has neither a slot-5 store nor a protocol try end".into())
    })?;

    let items: Vec<CodeItem> = accessor.items[start..end].to_vec();
    let inside = |label: Label| {
        items
            .iter()
            .any(|item| matches!(item, CodeItem::Label(l) if *l == label))
    };
    let mut handlers = Vec::new();
    for handler in &accessor.handlers {
        let spans = [handler.start, handler.end, handler.handler];
        let contained = spans.iter().filter(|label| inside(**label)).count();
        if contained == spans.len() {
            handlers.push(handler.clone());
        } else if contained > 0 && !end_labels.contains(&handler.end) {
            return Err(pattern_not_found(
                "try-catch straddles the computation boundary".into(),
            ));
        }
    }
    Ok(Extraction {
        items,
        handlers,
        max_locals: accessor.max_locals,
    })
}

/// Clones extracted items into `target`, giving every label a fresh
/// identity so the two methods' label graphs stay disjoint.
fn clone_with_fresh_labels(
    extraction: &Extraction,
    target: &mut CodeBody,
) -> Result<(Vec<CodeItem>, Vec<ExceptionHandler>), RewriteError> {
    let mut mapping: HashMap<Label, Label> = HashMap::new();
    for item in &extraction.items {
        if let CodeItem::Label(label) = item {
            mapping.insert(*label, target.new_label());
        }
    }
    let map = |label: Label| -> Result<Label, RewriteError> {
        mapping.get(&label).copied().ok_or_else(|| {
            pattern_not_found("computation jumps outside the extracted range".into())
        })
    };
    let mut cloned = Vec::with_capacity(extraction.items.len());
    for item in &extraction.items {
        let rewritten = match item {
            CodeItem::Label(label) => CodeItem::Label(mapping[label]),
            CodeItem::Insn(insn) => {
                let operand = match &insn.operand {
                    Operand::Jump(target) => Operand::Jump(map(*target)?),
                    Operand::TableSwitch {
                        default,
                        low,
                        high,
                        targets,
                    } => Operand::TableSwitch {
                        default: map(*default)?,
                        low: *low,
                        high: *high,
                        targets: targets
                            .iter()
                            .map(|target| map(*target))
                            .collect::<Result<_, _>>()?,
                    },
                    Operand::LookupSwitch { default, pairs } => Operand::LookupSwitch {
                        default: map(*default)?,
                        pairs: pairs
                            .iter()
                            .map(|(key, target)| Ok((*key, map(*target)?)))
                            .collect::<Result<_, RewriteError>>()?,
                    },
                    other => other.clone(),
                };
                CodeItem::Insn(Insn {
                    opcode: insn.opcode,
                    operand,
                })
            }
        };
        cloned.push(rewritten);
    }
    let handlers = extraction
        .handlers
        .iter()
        .map(|handler| {
            Ok(ExceptionHandler {
                start: map(handler.start)?,
                end: map(handler.end)?,
                handler: map(handler.handler)?,
                catch_type: handler.catch_type,
            })
        })
        .collect::<Result<Vec<_>, RewriteError>>()?;
    Ok((cloned, handlers))
}

fn cas(refs: &RuntimeRefs, expected: Vec<CodeItem>, new_value: Vec<CodeItem>) -> Vec<CodeItem> {
    let mut items = vec![
        CodeItem::Insn(Insn::cp(op::GETSTATIC, refs.handle_ref)),
        CodeItem::Insn(Insn::var(op::ALOAD, 0)),
    ];
    items.extend(expected);
    items.extend(new_value);
    items.push(CodeItem::Insn(Insn::cp(
        op::INVOKEVIRTUAL,
        refs.compare_and_set,
    )));
    items
}

fn insn_item(insn: Insn) -> CodeItem {
    CodeItem::Insn(insn)
}

/// Publishes `t2` after a failed fast-path CAS: swing the Waiting node
/// over to the result and wake the threads parked on it.
fn publish_over_waiting(refs: &RuntimeRefs) -> Vec<CodeItem> {
    let mut items = vec![
        insn_item(Insn::var(op::ALOAD, 0)),
        insn_item(Insn::cp(op::GETFIELD, refs.storage_ref)),
        insn_item(Insn::cp(op::CHECKCAST, refs.waiting_class)),
        insn_item(Insn::var(op::ASTORE, SLOT_WAITING)),
    ];
    items.extend(cas(
        refs,
        vec![insn_item(Insn::var(op::ALOAD, SLOT_WAITING))],
        vec![insn_item(Insn::var(op::ALOAD, SLOT_RESULT))],
    ));
    items.push(insn_item(Insn::simple(op::POP)));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_WAITING)));
    items.push(insn_item(Insn::cp(
        op::INVOKEVIRTUAL,
        refs.waiting_count_down,
    )));
    items
}

/// Builds the `$lzyINIT` state machine around the cloned computation.
fn build_init_body(
    pool: &mut Pool,
    refs: &RuntimeRefs,
    extraction: &Extraction,
    kind: &ValueKind,
) -> Result<CodeBody, RewriteError> {
    let mut body = CodeBody::new();
    let l_start = body.new_label();
    let l_try_start = body.new_label();
    let l_have_value = body.new_label();
    let l_ex_handler = body.new_label();
    let l_rethrow = body.new_label();
    let l_success = body.new_label();
    let l_return = body.new_label();
    let l_nonnull = body.new_label();
    let l_check_waiting = body.new_label();
    let l_null_state = body.new_label();
    let l_return_value = body.new_label();

    let (computation, computation_handlers) = clone_with_fresh_labels(extraction, &mut body)?;

    let mut items: Vec<CodeItem> = Vec::with_capacity(computation.len() + 96);

    items.push(CodeItem::Label(l_start));
    items.push(insn_item(Insn::var(op::ALOAD, 0)));
    items.push(insn_item(Insn::cp(op::GETFIELD, refs.storage_ref)));
    items.push(insn_item(Insn::var(op::ASTORE, SLOT_READ)));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_READ)));
    items.push(insn_item(Insn::jump(op::IFNONNULL, l_nonnull)));
    items.extend(cas(
        refs,
        vec![insn_item(Insn::simple(op::ACONST_NULL))],
        vec![insn_item(Insn::cp(op::GETSTATIC, refs.evaluating_module))],
    ));
    items.push(insn_item(Insn::jump(op::IFEQ, l_start)));
    items.push(insn_item(Insn::simple(op::ACONST_NULL)));
    items.push(insn_item(Insn::var(op::ASTORE, SLOT_RESULT)));
    items.push(insn_item(Insn::simple(op::ACONST_NULL)));
    items.push(insn_item(Insn::var(op::ASTORE, SLOT_VALUE)));

    items.push(CodeItem::Label(l_try_start));
    items.extend(computation);
    if let ValueKind::Primitive(info) = kind {
        let box_call = pool.ensure_methodref(
            &rewrite::boxes_run_time(),
            info.box_method,
            info.box_descriptor,
        )?;
        items.push(insn_item(Insn::cp(op::INVOKESTATIC, box_call)));
    }
    items.push(insn_item(Insn::var(op::ASTORE, SLOT_VALUE)));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_VALUE)));
    items.push(insn_item(Insn::jump(op::IFNONNULL, l_have_value)));
    items.push(insn_item(Insn::cp(op::GETSTATIC, refs.null_value_module)));
    items.push(insn_item(Insn::var(op::ASTORE, SLOT_RESULT)));
    items.push(insn_item(Insn::jump(op::GOTO, l_success)));
    items.push(CodeItem::Label(l_have_value));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_VALUE)));
    items.push(insn_item(Insn::var(op::ASTORE, SLOT_RESULT)));
    items.push(insn_item(Insn::jump(op::GOTO, l_success)));

    items.push(CodeItem::Label(l_ex_handler));
    items.push(insn_item(Insn::var(op::ASTORE, SLOT_EXCEPTION)));
    items.extend(cas(
        refs,
        vec![insn_item(Insn::cp(op::GETSTATIC, refs.evaluating_module))],
        vec![insn_item(Insn::var(op::ALOAD, SLOT_RESULT))],
    ));
    items.push(insn_item(Insn::jump(op::IFNE, l_rethrow)));
    items.extend(publish_over_waiting(refs));
    items.push(CodeItem::Label(l_rethrow));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_EXCEPTION)));
    items.push(insn_item(Insn::simple(op::ATHROW)));

    items.push(CodeItem::Label(l_success));
    items.extend(cas(
        refs,
        vec![insn_item(Insn::cp(op::GETSTATIC, refs.evaluating_module))],
        vec![insn_item(Insn::var(op::ALOAD, SLOT_RESULT))],
    ));
    items.push(insn_item(Insn::jump(op::IFNE, l_return)));
    items.extend(publish_over_waiting(refs));
    items.push(CodeItem::Label(l_return));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_VALUE)));
    items.push(insn_item(Insn::simple(op::ARETURN)));

    items.push(CodeItem::Label(l_nonnull));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_READ)));
    items.push(insn_item(Insn::cp(op::INSTANCEOF, refs.control_state_class)));
    items.push(insn_item(Insn::jump(op::IFEQ, l_return_value)));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_READ)));
    items.push(insn_item(Insn::cp(op::GETSTATIC, refs.evaluating_module)));
    items.push(insn_item(Insn::jump(op::IF_ACMPNE, l_check_waiting)));
    items.extend(cas(
        refs,
        vec![insn_item(Insn::var(op::ALOAD, SLOT_READ))],
        vec![
            insn_item(Insn::cp(op::NEW, refs.waiting_class)),
            insn_item(Insn::simple(op::DUP)),
            insn_item(Insn::cp(op::INVOKESPECIAL, refs.waiting_init)),
        ],
    ));
    items.push(insn_item(Insn::simple(op::POP)));
    items.push(insn_item(Insn::jump(op::GOTO, l_start)));
    items.push(CodeItem::Label(l_check_waiting));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_READ)));
    items.push(insn_item(Insn::cp(op::INSTANCEOF, refs.waiting_class)));
    items.push(insn_item(Insn::jump(op::IFEQ, l_null_state)));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_READ)));
    items.push(insn_item(Insn::cp(op::CHECKCAST, refs.waiting_class)));
    items.push(insn_item(Insn::cp(op::INVOKEVIRTUAL, refs.waiting_await)));
    items.push(insn_item(Insn::jump(op::GOTO, l_start)));
    items.push(CodeItem::Label(l_null_state));
    items.push(insn_item(Insn::simple(op::ACONST_NULL)));
    items.push(insn_item(Insn::simple(op::ARETURN)));
    items.push(CodeItem::Label(l_return_value));
    items.push(insn_item(Insn::var(op::ALOAD, SLOT_READ)));
    items.push(insn_item(Insn::simple(op::ARETURN)));

    body.items = items;
    body.handlers = computation_handlers;
    body.handlers.push(ExceptionHandler {
        start: l_try_start,
        end: l_ex_handler,
        handler: l_ex_handler,
        catch_type: 0,
    });
    body.max_stack = 5;
    body.max_locals = (SLOT_WAITING + 1).max(extraction.max_locals);
    Ok(body)
}

/// Builds the three-branch replacement accessor.
fn build_accessor_body(
    pool: &mut Pool,
    refs: &RuntimeRefs,
    owner: &str,
    init_name: &str,
    kind: &ValueKind,
) -> Result<CodeBody, RewriteError> {
    let init_ref = pool.ensure_methodref(owner, init_name, crate::detect::INIT_METHOD_DESCRIPTOR)?;
    let mut body = CodeBody::new();
    let l_check_null = body.new_label();
    let l_call_init = body.new_label();

    let mut items: Vec<CodeItem> = Vec::with_capacity(24);
    items.push(insn_item(Insn::var(op::ALOAD, 0)));
    items.push(insn_item(Insn::cp(op::GETFIELD, refs.storage_ref)));
    items.push(insn_item(Insn::var(op::ASTORE, 1)));
    items.push(insn_item(Insn::var(op::ALOAD, 1)));

    match kind {
        ValueKind::Primitive(info) => {
            let boxed = pool.ensure_class(info.boxed)?;
            let unbox = pool.ensure_methodref(
                &rewrite::boxes_run_time(),
                info.unbox_method,
                info.unbox_descriptor,
            )?;
            items.push(insn_item(Insn::cp(op::INSTANCEOF, boxed)));
            items.push(insn_item(Insn::jump(op::IFEQ, l_check_null)));
            items.push(insn_item(Insn::var(op::ALOAD, 1)));
            items.push(insn_item(Insn::cp(op::INVOKESTATIC, unbox)));
            items.push(insn_item(Insn::simple(info.return_opcode)));
            items.push(CodeItem::Label(l_check_null));
            items.push(insn_item(Insn::var(op::ALOAD, 1)));
            items.push(insn_item(Insn::cp(op::GETSTATIC, refs.null_value_module)));
            items.push(insn_item(Insn::jump(op::IF_ACMPNE, l_call_init)));
            items.push(insn_item(Insn::simple(info.zero_opcode)));
            items.push(insn_item(Insn::simple(info.return_opcode)));
            items.push(CodeItem::Label(l_call_init));
            items.push(insn_item(Insn::var(op::ALOAD, 0)));
            items.push(insn_item(Insn::cp(op::INVOKESPECIAL, init_ref)));
            items.push(insn_item(Insn::cp(op::INVOKESTATIC, unbox)));
            items.push(insn_item(Insn::simple(info.return_opcode)));
        }
        ValueKind::Reference { cast_name } => {
            let cast = pool.ensure_class(cast_name)?;
            items.push(insn_item(Insn::cp(op::INSTANCEOF, cast)));
            items.push(insn_item(Insn::jump(op::IFEQ, l_check_null)));
            items.push(insn_item(Insn::var(op::ALOAD, 1)));
            items.push(insn_item(Insn::cp(op::CHECKCAST, cast)));
            items.push(insn_item(Insn::simple(op::ARETURN)));
            items.push(CodeItem::Label(l_check_null));
            items.push(insn_item(Insn::var(op::ALOAD, 1)));
            items.push(insn_item(Insn::cp(op::GETSTATIC, refs.null_value_module)));
            items.push(insn_item(Insn::jump(op::IF_ACMPNE, l_call_init)));
            items.push(insn_item(Insn::simple(op::ACONST_NULL)));
            items.push(insn_item(Insn::simple(op::ARETURN)));
            items.push(CodeItem::Label(l_call_init));
            items.push(insn_item(Insn::var(op::ALOAD, 0)));
            items.push(insn_item(Insn::cp(op::INVOKESPECIAL, init_ref)));
            items.push(insn_item(Insn::cp(op::CHECKCAST, cast)));
            items.push(insn_item(Insn::simple(op::ARETURN)));
        }
    }
    body.items = items;
    body.max_stack = 2;
    body.max_locals = 2;
    Ok(body)
}

/// Removes one anchored legacy offset sequence per offset field from a
/// `<clinit>`, walking back at most [`ANCHOR_LOOKBACK`] instructions.
fn strip_offset_slices(
    class: &mut ClassFile,
    clinit_index: usize,
    offset_fields: &[String],
) -> Result<(), RewriteError> {
    for offset_field in offset_fields {
        let span = {
            let pool = &class.pool;
            let Some(body) = class.methods[clinit_index].code() else {
                return Err(pattern_not_found("<clinit> has no code".into()));
            };
            let positions = body.insn_positions();
            let mut found = None;
            for (ordinal, item) in positions.iter().enumerate() {
                let CodeItem::Insn(insn) = &body.items[*item] else {
                    continue;
                };
                if insn.opcode != op::PUTSTATIC {
                    continue;
                }
                let Some((_, name, descriptor)) = insn_member(pool, insn) else {
                    continue;
                };
                if &name != offset_field || descriptor != LONG_DESCRIPTOR {
                    continue;
                }
                let window_start = ordinal.saturating_sub(ANCHOR_LOOKBACK);
                let anchor = positions[window_start..ordinal]
                    .iter()
                    .rev()
                    .find(|candidate| {
                        if let CodeItem::Insn(insn) = &body.items[**candidate] {
                            is_module_getstatic(pool, insn)
                        } else {
                            false
                        }
                    });
                let Some(anchor) = anchor else {
                    return Err(rewrite_error(RewriteCause::MissingAnchor(format!(
                        "no LazyVals$.MODULE$ load within {ANCHOR_LOOKBACK} instructions \
                         before the store of {offset_field}"
                    ))));
                };
                found = Some((*anchor, *item));
                break;
            }
            found.ok_or_else(|| {
                pattern_not_found(format!("no <clinit> store of {offset_field}"))
            })?
        };
        let body = class.methods[clinit_index].code_mut().expect("checked above");
        if body.items[span.0..=span.1]
            .iter()
            .any(|item| matches!(item, CodeItem::Label(_)))
        {
            return Err(pattern_not_found(format!(
                "branch target inside the offset sequence of {offset_field}"
            )));
        }
        body.items.drain(span.0..=span.1);
    }
    Ok(())
}

/// Strips `this.Nbitmap$M = 0` stores from constructors once the bitmap
/// fields are gone.
fn strip_bitmap_constructor_stores(
    class: &mut ClassFile,
    bitmap_fields: &[String],
) -> Result<(), RewriteError> {
    for method_index in 0..class.methods.len() {
        if class.pool.utf8(class.methods[method_index].name_index).as_deref() != Some("<init>") {
            continue;
        }
        loop {
            let span = {
                let pool = &class.pool;
                let Some(body) = class.methods[method_index].code() else {
                    break;
                };
                let positions = body.insn_positions();
                let mut found = None;
                for (ordinal, item) in positions.iter().enumerate() {
                    let CodeItem::Insn(insn) = &body.items[*item] else {
                        continue;
                    };
                    if insn.opcode != op::PUTFIELD {
                        continue;
                    }
                    let Some((_, name, _)) = insn_member(pool, insn) else {
                        continue;
                    };
                    if !bitmap_fields.contains(&name) {
                        continue;
                    }
                    if ordinal < 2 {
                        return Err(rewrite_error(RewriteCause::DanglingFieldUse(format!(
                            "unexpected constructor store of {name}"
                        ))));
                    }
                    let load_this = &body.items[positions[ordinal - 2]];
                    let zero = &body.items[positions[ordinal - 1]];
                    let shape_ok = matches!(
                        load_this,
                        CodeItem::Insn(insn) if insn.opcode == op::ALOAD && insn.operand == Operand::Var(0)
                    ) && matches!(
                        zero,
                        CodeItem::Insn(insn) if insn.opcode == op::LCONST_0
                    ) && item - positions[ordinal - 2] == 2;
                    if !shape_ok {
                        return Err(rewrite_error(RewriteCause::DanglingFieldUse(format!(
                            "constructor store of {name} does not match the expected shape"
                        ))));
                    }
                    found = Some((positions[ordinal - 2], *item));
                    break;
                }
                match found {
                    Some(span) => span,
                    None => break,
                }
            };
            let body = class.methods[method_index].code_mut().expect("checked above");
            body.items.drain(span.0..=span.1);
        }
    }
    Ok(())
}

/// Patches one class of the 3.0–3.2 families in place. `companion`
/// carries the other half when the offset fields live there.
pub fn patch(
    primary: &ClassView,
    instances: &[LazyValInstance],
    companion: Option<&ClassView>,
    resolver: &dyn SuperTypeResolver,
) -> Result<(Vec<u8>, Option<Vec<u8>>), RewriteError> {
    let mut class = primary.class.clone();
    let owner = primary.name.clone();

    // Per-instance groundwork recorded up front, before any surgery
    // shifts indices: the original typed descriptor and the extracted
    // computation.
    struct Plan {
        instance: LazyValInstance,
        original_descriptor: String,
        extraction: Extraction,
        accessor_index: usize,
    }
    let mut plans: Vec<Plan> = Vec::with_capacity(instances.len());
    for instance in instances {
        let accessor_name = instance.accessor.as_deref().ok_or_else(|| {
            pattern_not_found(format!(
                "lazy val {} has no accessor to lift the computation from",
                instance.display_name
            ))
        })?;
        let accessor_view = primary.method_named(accessor_name).ok_or_else(|| {
            pattern_not_found(format!("accessor {accessor_name} disappeared from the view"))
        })?;
        if MethodAccessFlags::is_set(accessor_view.access_flags, MethodAccessFlags::AccStatic) {
            return Err(pattern_not_found(format!(
                "accessor {accessor_name} is static; the target layout keeps instance state"
            )));
        }
        let accessor = class.methods[accessor_view.method_index]
            .code()
            .ok_or_else(|| pattern_not_found(format!("accessor {accessor_name} has no code")))?;
        let extraction = extract_computation(&class.pool, accessor)?;
        plans.push(Plan {
            instance: instance.clone(),
            original_descriptor: instance.storage_field.descriptor.clone(),
            extraction,
            accessor_index: accessor_view.method_index,
        });
    }

    // Field surgery: retype storage, drop bitmap and offset fields, add
    // handle fields.
    let object_descriptor = class.pool.ensure_utf8(OBJECT_DESCRIPTOR)?;
    for plan in &plans {
        let field = &mut class.fields[plan.instance.storage_field.field_index];
        field.descriptor_index = object_descriptor;
        field.access_flags = FieldAccessFlags::to_u16(&[
            FieldAccessFlags::AccPrivate,
            FieldAccessFlags::AccVolatile,
        ]);
    }
    let bitmap_fields: Vec<String> = plans
        .iter()
        .filter_map(|plan| {
            plan.instance
                .bitmap_field
                .as_ref()
                .map(|field| field.name.clone())
        })
        .collect();
    remove_fields(&mut class, &bitmap_fields);
    let local_offsets: Vec<String> = plans
        .iter()
        .filter(|plan| !plan.instance.offset_in_companion)
        .filter_map(|plan| {
            plan.instance
                .offset_field
                .as_ref()
                .map(|field| field.name.clone())
        })
        .collect();
    let companion_offsets: Vec<String> = plans
        .iter()
        .filter(|plan| plan.instance.offset_in_companion)
        .filter_map(|plan| {
            plan.instance
                .offset_field
                .as_ref()
                .map(|field| field.name.clone())
        })
        .collect();
    remove_fields(&mut class, &local_offsets);
    for plan in &plans {
        ensure_handle_field(&mut class, &plan.instance.handle_field_name())?;
    }

    // Legacy <clinit> slices out, handle installs in (always into the
    // primary, before any singleton-instance initialization).
    if !local_offsets.is_empty() {
        let clinit = clinit_index(&class).ok_or_else(|| {
            pattern_not_found(format!("{owner} declares offset fields but has no <clinit>"))
        })?;
        strip_offset_slices(&mut class, clinit, &local_offsets)?;
    }
    let mut companion_bytes = None;
    if !companion_offsets.is_empty() {
        let companion = companion.ok_or_else(|| {
            pattern_not_found("offset fields marked companion-side without a companion".into())
        })?;
        let mut companion_class = companion.class.clone();
        remove_fields(&mut companion_class, &companion_offsets);
        let clinit = clinit_index(&companion_class).ok_or_else(|| {
            pattern_not_found(format!(
                "{} holds offset fields but has no <clinit>",
                companion.name
            ))
        })?;
        strip_offset_slices(&mut companion_class, clinit, &companion_offsets)?;
        companion_bytes = Some(companion_class.to_bytes()?);
    }
    let installed: Vec<LazyValInstance> =
        plans.iter().map(|plan| plan.instance.clone()).collect();
    install_handles_at_clinit_start(&mut class, &owner, &installed)?;

    strip_bitmap_constructor_stores(&mut class, &bitmap_fields)?;

    // Synthesize the initializer and shrink the accessor, per instance.
    for plan in &plans {
        let kind = value_kind(&plan.original_descriptor);
        let refs = RuntimeRefs::intern(
            &mut class.pool,
            &owner,
            &plan.instance.storage_field.name,
            &plan.instance.handle_field_name(),
        )?;
        let init_name = plan.instance.init_method_name();

        let mut init_body = build_init_body(&mut class.pool, &refs, &plan.extraction, &kind)?;
        frames::compute_frames(
            &owner,
            &init_name,
            false,
            crate::detect::INIT_METHOD_DESCRIPTOR,
            &mut class.pool,
            &mut init_body,
            resolver,
        )?;
        let name_index = class.pool.ensure_utf8(&init_name)?;
        let descriptor_index = class.pool.ensure_utf8(crate::detect::INIT_METHOD_DESCRIPTOR)?;
        class.methods.push(MethodInfo {
            access_flags: MethodAccessFlags::to_u16(&[
                MethodAccessFlags::AccPrivate,
                MethodAccessFlags::AccFinal,
            ]),
            name_index,
            descriptor_index,
            attributes: vec![AttributeInfo::Code(init_body)],
        });

        let accessor_descriptor = format!("(){}", plan.original_descriptor);
        let mut accessor_body =
            build_accessor_body(&mut class.pool, &refs, &owner, &init_name, &kind)?;
        frames::compute_frames(
            &owner,
            &plan.instance.display_name,
            false,
            &accessor_descriptor,
            &mut class.pool,
            &mut accessor_body,
            resolver,
        )?;
        let accessor = &mut class.methods[plan.accessor_index];
        accessor.attributes = vec![AttributeInfo::Code(accessor_body)];
        debug!(
            lazy_val = %plan.instance.display_name,
            init = %init_name,
            "synthesized initializer and replaced accessor"
        );
    }

    // Inner-class references for everything the generated code names.
    ensure_lookup_inner_class(&mut class)?;
    let lazy_vals = rewrite::runtime_class("LazyVals");
    for (member, flags) in [
        ("Evaluating$", 0x0019u16),
        ("NullValue$", 0x0019),
        ("Waiting", 0x0009),
        ("LazyValControlState", 0x0609),
    ] {
        ensure_inner_class(
            &mut class,
            &rewrite::lazy_vals_nested(member),
            &lazy_vals,
            member,
            flags,
        )?;
    }

    // Nothing may still reach the members that no longer exist.
    let mut gone: Vec<(String, String)> = Vec::new();
    for name in bitmap_fields.iter().chain(&local_offsets).chain(&companion_offsets) {
        gone.push((name.clone(), LONG_DESCRIPTOR.to_string()));
    }
    for plan in &plans {
        if plan.original_descriptor != OBJECT_DESCRIPTOR {
            gone.push((
                plan.instance.storage_field.name.clone(),
                plan.original_descriptor.clone(),
            ));
        }
    }
    if let Some((method, member)) = dangling_member_use(&class, &gone) {
        return Err(rewrite_error(RewriteCause::DanglingFieldUse(format!(
            "{method} still references removed member {member}"
        ))));
    }

    Ok((class.to_bytes()?, companion_bytes))
}

fn clinit_index(class: &ClassFile) -> Option<usize> {
    class
        .methods
        .iter()
        .position(|method| class.pool.utf8(method.name_index).as_deref() == Some("<clinit>"))
}
