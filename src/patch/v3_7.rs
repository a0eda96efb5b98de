//! Patcher for the 3.3–3.7 family.
//!
//! A pure pattern-substitution rewrite: no method is synthesized. The
//! legacy offset fields disappear, VarHandle fields take their place,
//! the `<clinit>` offset-lookup runs become `findVarHandle` runs, and
//! every `LazyVals$.objCAS` call site inside the `$lzyINIT` methods is
//! re-anchored onto `VarHandle.compareAndSet`. Instructions between the
//! anchors — the pushes of the expected and new values — are left
//! untouched.

use std::collections::HashMap;

use tracing::debug;

use jclass::access_flags::MethodAccessFlags;
use jclass::attributes::AttributeInfo;
use jclass::class_file::{ClassFile, MethodInfo};
use jclass::code::{CodeBody, CodeItem, Insn, Operand};
use jclass::constants::{ConstantPool, Pool};
use jclass::opcodes as op;

use crate::detect::{init_method_regex, LazyValInstance, LONG_DESCRIPTOR};
use crate::errors::rewrite::{RewriteCause, RewriteError};
use crate::patch::rewrite::{
    self, ensure_handle_field, ensure_lookup_inner_class, handle_init_sequence, insn_member,
    is_module_getstatic, remove_fields, HANDLE_INIT_STACK,
};
use crate::view::ClassView;

/// Offset-field name → handle-field name, built while the offset fields
/// are removed. The pairing comes from detection order, which follows
/// the compiler's emission order.
fn offset_to_handle(instances: &[LazyValInstance]) -> HashMap<String, String> {
    instances
        .iter()
        .filter_map(|instance| {
            instance
                .offset_field
                .as_ref()
                .map(|offset| (offset.name.clone(), instance.handle_field_name()))
        })
        .collect()
}

fn pattern_not_found(what: String) -> RewriteError {
    RewriteError::new(RewriteCause::PatternNotFound(what), "")
}

/// Item index of every instruction, in order.
fn insn_items(body: &CodeBody) -> Vec<usize> {
    body.insn_positions()
}

fn insn<'b>(body: &'b CodeBody, item: usize) -> &'b Insn {
    match &body.items[item] {
        CodeItem::Insn(insn) => insn,
        CodeItem::Label(_) => unreachable!("insn_items only yields instruction items"),
    }
}

/// The matched six-instruction legacy offset-lookup run.
struct OffsetInitRun {
    /// Item range, inclusive of both anchors.
    first_item: usize,
    last_item: usize,
    class_literal: u16,
    field_name_literal: u16,
    offset_field: String,
}

/// Finds the `GETSTATIC MODULE$ … PUTSTATIC OFFSET$…` run that stores a
/// given offset field, as six contiguous instructions.
fn find_offset_init_run(
    pool: &Pool,
    body: &CodeBody,
    offset_field: &str,
) -> Result<OffsetInitRun, RewriteError> {
    let positions = insn_items(body);
    for (ordinal, item) in positions.iter().enumerate() {
        let candidate = insn(body, *item);
        if candidate.opcode != op::PUTSTATIC {
            continue;
        }
        let Some((_, name, descriptor)) = insn_member(pool, candidate) else {
            continue;
        };
        if name != offset_field || descriptor != LONG_DESCRIPTOR {
            continue;
        }
        if ordinal < 5 {
            break;
        }
        let run: Vec<usize> = positions[ordinal - 5..=ordinal].to_vec();
        // The run must be six adjacent items: a label inside would mean
        // a branch lands mid-sequence, which the compiler never emits.
        if run[5] - run[0] != 5 {
            break;
        }
        let module = insn(body, run[0]);
        let class_load = insn(body, run[1]);
        let name_load = insn(body, run[2]);
        let get_field = insn(body, run[3]);
        let get_offset = insn(body, run[4]);
        if !is_module_getstatic(pool, module) {
            break;
        }
        let (Operand::Cp(class_literal), Operand::Cp(field_name_literal)) =
            (&class_load.operand, &name_load.operand)
        else {
            break;
        };
        let class_ok = class_load.opcode == op::LDC
            && matches!(pool.get(*class_literal), Some(ConstantPool::Class { .. }));
        let name_ok = name_load.opcode == op::LDC
            && matches!(pool.get(*field_name_literal), Some(ConstantPool::String { .. }));
        let calls_ok = [get_field, get_offset]
            .iter()
            .zip(["getDeclaredField", "getOffsetStatic"])
            .all(|(call, wanted)| {
                call.opcode == op::INVOKEVIRTUAL
                    && insn_member(pool, call)
                        .map(|(_, name, _)| name == wanted)
                        .unwrap_or(false)
            });
        if !(class_ok && name_ok && calls_ok) {
            break;
        }
        return Ok(OffsetInitRun {
            first_item: run[0],
            last_item: *item,
            class_literal: *class_literal,
            field_name_literal: *field_name_literal,
            offset_field: offset_field.to_string(),
        });
    }
    Err(pattern_not_found(format!(
        "no offset-lookup run stores {offset_field}"
    )))
}

/// Replaces the legacy run in place with the handle-init sequence,
/// reusing the class and field-name constants of the original.
fn substitute_offset_init(
    class: &mut ClassFile,
    clinit_index: usize,
    owner: &str,
    offset_field: &str,
    handle_field: &str,
) -> Result<(), RewriteError> {
    let pool = &mut class.pool;
    let Some(body) = class.methods[clinit_index].code() else {
        return Err(pattern_not_found("<clinit> has no code".into()));
    };
    let run = find_offset_init_run(pool, body, offset_field)?;
    let replacement =
        handle_init_sequence(pool, run.class_literal, run.field_name_literal, owner, handle_field)?;
    let body = class.methods[clinit_index]
        .code_mut()
        .expect("checked above");
    body.items
        .splice(run.first_item..=run.last_item, replacement);
    body.max_stack = body.max_stack.max(HANDLE_INIT_STACK);
    debug!(offset = %run.offset_field, handle = %handle_field, "rewrote offset lookup");
    Ok(())
}

/// Cuts the legacy run out of a companion `<clinit>` without replacing
/// it; the handle installation happens in the other half.
fn strip_offset_init(
    class: &mut ClassFile,
    clinit_index: usize,
    offset_field: &str,
) -> Result<(), RewriteError> {
    let Some(body) = class.methods[clinit_index].code() else {
        return Err(pattern_not_found("<clinit> has no code".into()));
    };
    let run = find_offset_init_run(&class.pool, body, offset_field)?;
    let body = class.methods[clinit_index]
        .code_mut()
        .expect("checked above");
    body.items.drain(run.first_item..=run.last_item);
    Ok(())
}

fn clinit_index(class: &ClassFile) -> Option<usize> {
    class.methods.iter().position(|method| {
        class.pool.utf8(method.name_index).as_deref() == Some("<clinit>")
    })
}

/// Prepends freshly-minted handle-init sequences for every instance to
/// the class's `<clinit>`, synthesizing the method when absent.
pub(crate) fn install_handles_at_clinit_start(
    class: &mut ClassFile,
    owner: &str,
    instances: &[LazyValInstance],
) -> Result<(), RewriteError> {
    let mut sequences: Vec<CodeItem> = Vec::new();
    for instance in instances {
        let class_literal = class.pool.ensure_class(owner)?;
        let field_name_literal = class.pool.ensure_string(&instance.storage_field.name)?;
        sequences.extend(handle_init_sequence(
            &mut class.pool,
            class_literal,
            field_name_literal,
            owner,
            &instance.handle_field_name(),
        )?);
    }
    match clinit_index(class) {
        Some(index) => {
            let Some(body) = class.methods[index].code_mut() else {
                return Err(pattern_not_found("<clinit> has no code".into()));
            };
            body.items.splice(0..0, sequences);
            body.max_stack = body.max_stack.max(HANDLE_INIT_STACK);
        }
        None => {
            let mut body = CodeBody::new();
            body.items = sequences;
            body.items.push(CodeItem::Insn(Insn::simple(op::RETURN)));
            body.max_stack = HANDLE_INIT_STACK;
            body.max_locals = 0;
            let name_index = class.pool.ensure_utf8("<clinit>")?;
            let descriptor_index = class.pool.ensure_utf8("()V")?;
            class.methods.push(MethodInfo {
                access_flags: MethodAccessFlags::to_u16(&[MethodAccessFlags::AccStatic]),
                name_index,
                descriptor_index,
                attributes: vec![AttributeInfo::Code(body)],
            });
        }
    }
    Ok(())
}

/// Re-anchors one `objCAS` call run onto `VarHandle.compareAndSet`.
/// Returns false when the method holds no further run.
fn rewrite_one_cas(
    class: &mut ClassFile,
    method_index: usize,
    owner: &str,
    handles: &HashMap<String, String>,
) -> Result<bool, RewriteError> {
    let module_name = rewrite::lazy_vals_module();
    let (anchor, cas_item, handle_field) = {
        let pool = &class.pool;
        let Some(body) = class.methods[method_index].code() else {
            return Ok(false);
        };
        let positions = insn_items(body);
        let mut found = None;
        for (ordinal, item) in positions.iter().enumerate() {
            if ordinal + 2 >= positions.len() {
                break;
            }
            let module = insn(body, *item);
            if !is_module_getstatic(pool, module) {
                continue;
            }
            // Three adjacent instructions anchor the run.
            if positions[ordinal + 2] - item != 2 {
                continue;
            }
            let this_load = insn(body, positions[ordinal + 1]);
            if !(this_load.opcode == op::ALOAD && this_load.operand == Operand::Var(0)) {
                continue;
            }
            let offset_load = insn(body, positions[ordinal + 2]);
            if offset_load.opcode != op::GETSTATIC {
                continue;
            }
            let Some((_, offset_name, _)) = insn_member(pool, offset_load) else {
                continue;
            };
            let Some(handle_field) = handles.get(&offset_name) else {
                continue;
            };
            // Anything between the offset load and the call pushes the
            // expected and new objects; it stays as-is.
            let cas = positions[ordinal + 3..].iter().find(|candidate| {
                let call = insn(body, **candidate);
                call.opcode == op::INVOKEVIRTUAL
                    && insn_member(pool, call)
                        .map(|(call_owner, name, _)| {
                            call_owner == module_name && name == "objCAS"
                        })
                        .unwrap_or(false)
            });
            let Some(cas_item) = cas else {
                return Err(pattern_not_found(format!(
                    "offset load of {offset_name} without a matching objCAS call"
                )));
            };
            found = Some((*item, *cas_item, handle_field.clone()));
            break;
        }
        match found {
            Some(found) => found,
            None => return Ok(false),
        }
    };

    let handle_ref = class
        .pool
        .ensure_fieldref(owner, &handle_field, crate::detect::VARHANDLE_DESCRIPTOR)?;
    let compare_and_set = class.pool.ensure_methodref(
        rewrite::VARHANDLE,
        "compareAndSet",
        rewrite::COMPARE_AND_SET_DESCRIPTOR,
    )?;
    let body = class.methods[method_index].code_mut().expect("checked above");
    if let CodeItem::Insn(call) = &mut body.items[cas_item] {
        *call = Insn::cp(op::INVOKEVIRTUAL, compare_and_set);
    }
    if let CodeItem::Insn(module_load) = &mut body.items[anchor] {
        *module_load = Insn::cp(op::GETSTATIC, handle_ref);
    }
    // Drop the offset GETSTATIC (anchor + this-load sit before it).
    body.items.remove(anchor + 2);
    Ok(true)
}

/// Patches one class in place. `companion` carries the other half when
/// the offset fields live there; it is returned only when touched.
pub fn patch(
    primary: &ClassView,
    instances: &[LazyValInstance],
    companion: Option<&ClassView>,
) -> Result<(Vec<u8>, Option<Vec<u8>>), RewriteError> {
    let mut class = primary.class.clone();
    let owner = primary.name.clone();
    let handles = offset_to_handle(instances);

    let local_offsets: Vec<String> = instances
        .iter()
        .filter(|instance| !instance.offset_in_companion)
        .filter_map(|instance| instance.offset_field.as_ref().map(|field| field.name.clone()))
        .collect();
    let companion_offsets: Vec<String> = instances
        .iter()
        .filter(|instance| instance.offset_in_companion)
        .filter_map(|instance| instance.offset_field.as_ref().map(|field| field.name.clone()))
        .collect();

    // Field surgery first: offsets out, handles in.
    remove_fields(&mut class, &local_offsets);
    for instance in instances {
        ensure_handle_field(&mut class, &instance.handle_field_name())?;
    }

    // Local offsets: six-for-six substitution inside this <clinit>.
    if !local_offsets.is_empty() {
        let Some(clinit) = clinit_index(&class) else {
            return Err(pattern_not_found(format!(
                "{owner} declares offset fields but has no <clinit>"
            )));
        };
        for offset_field in &local_offsets {
            let handle_field = handles
                .get(offset_field)
                .ok_or_else(|| pattern_not_found(format!("unmapped offset {offset_field}")))?;
            substitute_offset_init(&mut class, clinit, &owner, offset_field, handle_field)?;
        }
    }

    // Companion-held offsets: strip there, install here.
    let mut companion_bytes = None;
    if !companion_offsets.is_empty() {
        let companion = companion.ok_or_else(|| {
            pattern_not_found("offset fields marked companion-side without a companion".into())
        })?;
        let mut companion_class = companion.class.clone();
        remove_fields(&mut companion_class, &companion_offsets);
        let Some(clinit) = clinit_index(&companion_class) else {
            return Err(pattern_not_found(format!(
                "{} holds offset fields but has no <clinit>",
                companion.name
            )));
        };
        for offset_field in &companion_offsets {
            strip_offset_init(&mut companion_class, clinit, offset_field)?;
        }
        let installed: Vec<LazyValInstance> = instances
            .iter()
            .filter(|instance| instance.offset_in_companion)
            .cloned()
            .collect();
        install_handles_at_clinit_start(&mut class, &owner, &installed)?;
        companion_bytes = Some(companion_class.to_bytes()?);
    }

    // Every $lzyINIT method: swap the CAS anchors.
    let init_regex = init_method_regex();
    for method_index in 0..class.methods.len() {
        let Some(name) = class.pool.utf8(class.methods[method_index].name_index) else {
            continue;
        };
        if !init_regex.is_match(&name) {
            continue;
        }
        let mut rewritten = 0usize;
        while rewrite_one_cas(&mut class, method_index, &owner, &handles)? {
            rewritten += 1;
        }
        debug!(method = %name, rewritten, "re-anchored CAS calls");
    }

    ensure_lookup_inner_class(&mut class)?;
    Ok((class.to_bytes()?, companion_bytes))
}
