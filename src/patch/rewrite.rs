//! Shared rewrite primitives: runtime-name construction, VarHandle
//! field and initialization plumbing, inner-class table maintenance and
//! the primitive-type dispatch used when retyping storage fields.

use jclass::access_flags::FieldAccessFlags;
use jclass::attributes::{AttributeInfo, InnerClassEntry};
use jclass::class_file::{ClassFile, FieldInfo};
use jclass::code::{CodeItem, Insn, Operand};
use jclass::constants::Pool;
use jclass::opcodes as op;

use crate::detect::VARHANDLE_DESCRIPTOR;
use crate::errors::rewrite::RewriteError;

/// Internal name under the runtime package of the source language.
///
/// Assembled from fragments: these strings are rewritten by relocation
/// ("shading") tools when they appear verbatim in a packaged artifact,
/// and a relocated name would no longer resolve at run time.
pub fn runtime_class(member: &str) -> String {
    let mut name = String::from("sc");
    name.push_str("ala/");
    name.push_str("runtime/");
    name.push_str(member);
    name
}

pub fn lazy_vals_module() -> String {
    runtime_class("LazyVals$")
}

pub fn lazy_vals_nested(member: &str) -> String {
    let mut name = runtime_class("LazyVals$");
    name.push_str(member);
    name
}

pub fn boxes_run_time() -> String {
    runtime_class("BoxesRunTime")
}

pub const METHOD_HANDLES: &str = "java/lang/invoke/MethodHandles";
pub const METHOD_HANDLES_LOOKUP: &str = "java/lang/invoke/MethodHandles$Lookup";
pub const VARHANDLE: &str = "java/lang/invoke/VarHandle";
pub const JAVA_LANG_OBJECT: &str = "java/lang/Object";
pub const OBJECT_DESCRIPTOR: &str = "Ljava/lang/Object;";

pub const LOOKUP_DESCRIPTOR: &str = "()Ljava/lang/invoke/MethodHandles$Lookup;";
pub const FIND_VARHANDLE_DESCRIPTOR: &str =
    "(Ljava/lang/Class;Ljava/lang/String;Ljava/lang/Class;)Ljava/lang/invoke/VarHandle;";
pub const COMPARE_AND_SET_DESCRIPTOR: &str =
    "(Ljava/lang/Object;Ljava/lang/Object;Ljava/lang/Object;)Z";

/// Adds `<storage>$lzyHandle` as a private static final `VarHandle`
/// field unless the class already declares it.
pub fn ensure_handle_field(class: &mut ClassFile, name: &str) -> Result<(), RewriteError> {
    let exists = class
        .fields
        .iter()
        .any(|field| class.pool.utf8(field.name_index).as_deref() == Some(name));
    if exists {
        return Ok(());
    }
    let name_index = class.pool.ensure_utf8(name)?;
    let descriptor_index = class.pool.ensure_utf8(VARHANDLE_DESCRIPTOR)?;
    class.fields.push(FieldInfo {
        access_flags: FieldAccessFlags::to_u16(&[
            FieldAccessFlags::AccPrivate,
            FieldAccessFlags::AccStatic,
            FieldAccessFlags::AccFinal,
        ]),
        name_index,
        descriptor_index,
        attributes: vec![],
    });
    Ok(())
}

/// Removes every field with one of the given names. Returns the names
/// actually removed.
pub fn remove_fields(class: &mut ClassFile, names: &[String]) -> Vec<String> {
    let pool = &class.pool;
    let mut removed = Vec::new();
    class.fields.retain(|field| {
        let keep = match pool.utf8(field.name_index) {
            Some(name) if names.contains(&name) => {
                removed.push(name);
                false
            }
            _ => true,
        };
        keep
    });
    removed
}

/// The six-instruction VarHandle installation sequence:
///
/// ```text
/// INVOKESTATIC  MethodHandles.lookup
/// LDC           <lookup class>
/// LDC           "<field name>"
/// LDC           Object.class
/// INVOKEVIRTUAL Lookup.findVarHandle
/// PUTSTATIC     <owner>.<handle field>
/// ```
///
/// `class_literal` and `field_name_literal` are existing pool indices
/// when a legacy sequence is rewritten in place, freshly interned ones
/// when the sequence is synthesized.
pub fn handle_init_sequence(
    pool: &mut Pool,
    class_literal: u16,
    field_name_literal: u16,
    owner: &str,
    handle_field: &str,
) -> Result<Vec<CodeItem>, RewriteError> {
    let lookup = pool.ensure_methodref(METHOD_HANDLES, "lookup", LOOKUP_DESCRIPTOR)?;
    let object_class = pool.ensure_class(JAVA_LANG_OBJECT)?;
    let find = pool.ensure_methodref(METHOD_HANDLES_LOOKUP, "findVarHandle", FIND_VARHANDLE_DESCRIPTOR)?;
    let target = pool.ensure_fieldref(owner, handle_field, VARHANDLE_DESCRIPTOR)?;
    Ok(vec![
        CodeItem::Insn(Insn::cp(op::INVOKESTATIC, lookup)),
        CodeItem::Insn(Insn::cp(op::LDC, class_literal)),
        CodeItem::Insn(Insn::cp(op::LDC, field_name_literal)),
        CodeItem::Insn(Insn::cp(op::LDC, object_class)),
        CodeItem::Insn(Insn::cp(op::INVOKEVIRTUAL, find)),
        CodeItem::Insn(Insn::cp(op::PUTSTATIC, target)),
    ])
}

/// Minimum operand stack the handle-init sequence needs: lookup, class,
/// string, class.
pub const HANDLE_INIT_STACK: u16 = 4;

/// Adds an entry to the `InnerClasses` table (creating the attribute if
/// absent) unless the inner class is already listed.
pub fn ensure_inner_class(
    class: &mut ClassFile,
    inner: &str,
    outer: &str,
    simple_name: &str,
    access_flags: u16,
) -> Result<(), RewriteError> {
    let inner_class_info = class.pool.ensure_class(inner)?;
    let outer_class_info = class.pool.ensure_class(outer)?;
    let inner_name = class.pool.ensure_utf8(simple_name)?;
    let entry = InnerClassEntry {
        inner_class_info,
        outer_class_info,
        inner_name,
        access_flags,
    };
    for attribute in class.attributes.iter_mut() {
        if let AttributeInfo::InnerClasses(entries) = attribute {
            if entries
                .iter()
                .any(|existing| existing.inner_class_info == inner_class_info)
            {
                return Ok(());
            }
            entries.push(entry);
            return Ok(());
        }
    }
    class
        .attributes
        .push(AttributeInfo::InnerClasses(vec![entry]));
    Ok(())
}

pub fn ensure_lookup_inner_class(class: &mut ClassFile) -> Result<(), RewriteError> {
    // public static final
    ensure_inner_class(class, METHOD_HANDLES_LOOKUP, METHOD_HANDLES, "Lookup", 0x0019)
}

/// Per-primitive emission record: how to box the computed value, unbox
/// a published one, push the zero value and return it.
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveInfo {
    pub boxed: &'static str,
    pub box_method: &'static str,
    pub box_descriptor: &'static str,
    pub unbox_method: &'static str,
    pub unbox_descriptor: &'static str,
    pub zero_opcode: u8,
    pub return_opcode: u8,
}

#[derive(Debug, Clone)]
pub enum ValueKind {
    Primitive(PrimitiveInfo),
    Reference {
        /// `checkcast` operand: internal name, or the full descriptor
        /// for array types.
        cast_name: String,
    },
}

pub fn value_kind(descriptor: &str) -> ValueKind {
    let primitive = |boxed,
                     box_method,
                     box_descriptor,
                     unbox_method,
                     unbox_descriptor,
                     zero_opcode,
                     return_opcode| {
        ValueKind::Primitive(PrimitiveInfo {
            boxed,
            box_method,
            box_descriptor,
            unbox_method,
            unbox_descriptor,
            zero_opcode,
            return_opcode,
        })
    };
    match descriptor {
        "I" => primitive(
            "java/lang/Integer",
            "boxToInteger",
            "(I)Ljava/lang/Integer;",
            "unboxToInt",
            "(Ljava/lang/Object;)I",
            op::ICONST_0,
            op::IRETURN,
        ),
        "J" => primitive(
            "java/lang/Long",
            "boxToLong",
            "(J)Ljava/lang/Long;",
            "unboxToLong",
            "(Ljava/lang/Object;)J",
            op::LCONST_0,
            op::LRETURN,
        ),
        "F" => primitive(
            "java/lang/Float",
            "boxToFloat",
            "(F)Ljava/lang/Float;",
            "unboxToFloat",
            "(Ljava/lang/Object;)F",
            op::FCONST_0,
            op::FRETURN,
        ),
        "D" => primitive(
            "java/lang/Double",
            "boxToDouble",
            "(D)Ljava/lang/Double;",
            "unboxToDouble",
            "(Ljava/lang/Object;)D",
            op::DCONST_0,
            op::DRETURN,
        ),
        "Z" => primitive(
            "java/lang/Boolean",
            "boxToBoolean",
            "(Z)Ljava/lang/Boolean;",
            "unboxToBoolean",
            "(Ljava/lang/Object;)Z",
            op::ICONST_0,
            op::IRETURN,
        ),
        "B" => primitive(
            "java/lang/Byte",
            "boxToByte",
            "(B)Ljava/lang/Byte;",
            "unboxToByte",
            "(Ljava/lang/Object;)B",
            op::ICONST_0,
            op::IRETURN,
        ),
        "S" => primitive(
            "java/lang/Short",
            "boxToShort",
            "(S)Ljava/lang/Short;",
            "unboxToShort",
            "(Ljava/lang/Object;)S",
            op::ICONST_0,
            op::IRETURN,
        ),
        "C" => primitive(
            "java/lang/Character",
            "boxToCharacter",
            "(C)Ljava/lang/Character;",
            "unboxToChar",
            "(Ljava/lang/Object;)C",
            op::ICONST_0,
            op::IRETURN,
        ),
        _ => {
            let cast_name = if let Some(stripped) = descriptor.strip_prefix('L') {
                stripped.trim_end_matches(';').to_string()
            } else {
                descriptor.to_string()
            };
            ValueKind::Reference { cast_name }
        }
    }
}

/// True when any instruction of any remaining method still references
/// one of the given `(name, descriptor)` members. Used as a final
/// consistency gate after fields have been removed or retyped.
pub fn dangling_member_use(
    class: &ClassFile,
    members: &[(String, String)],
) -> Option<(String, String)> {
    for method in &class.methods {
        let Some(body) = method.code() else { continue };
        for item in &body.items {
            let CodeItem::Insn(insn) = item else { continue };
            if !matches!(
                insn.opcode,
                op::GETSTATIC | op::PUTSTATIC | op::GETFIELD | op::PUTFIELD
            ) {
                continue;
            }
            let Operand::Cp(index) = insn.operand else { continue };
            let Some((_, name, descriptor)) = class.pool.member_ref(index) else {
                continue;
            };
            for (wanted_name, wanted_descriptor) in members {
                if &name == wanted_name && &descriptor == wanted_descriptor {
                    let method_name = class
                        .pool
                        .utf8(method.name_index)
                        .unwrap_or_else(|| "<?>".into());
                    return Some((method_name, name));
                }
            }
        }
    }
    None
}

/// `(owner, name, descriptor)` of a member-referencing instruction.
pub fn insn_member(pool: &Pool, insn: &Insn) -> Option<(String, String, String)> {
    match insn.operand {
        Operand::Cp(index) => pool.member_ref(index),
        Operand::CpCount { index, .. } => pool.member_ref(index),
        _ => None,
    }
}

/// `GETSTATIC scala/runtime/LazyVals$.MODULE$`, the anchor every legacy
/// offset sequence starts with.
pub fn is_module_getstatic(pool: &Pool, insn: &Insn) -> bool {
    insn.opcode == op::GETSTATIC
        && insn_member(pool, insn)
            .map(|(owner, name, _)| owner == lazy_vals_module() && name == "MODULE$")
            .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn runtime_names_assemble_to_real_internal_names() {
        assert_eq!(lazy_vals_module(), "scala/runtime/LazyVals$");
        assert_eq!(lazy_vals_nested("Waiting"), "scala/runtime/LazyVals$Waiting");
        assert_eq!(
            lazy_vals_nested("NullValue$"),
            "scala/runtime/LazyVals$NullValue$"
        );
        assert_eq!(boxes_run_time(), "scala/runtime/BoxesRunTime");
    }

    #[test]
    fn primitive_dispatch_covers_every_base_type() {
        for descriptor in ["I", "J", "F", "D", "Z", "B", "S", "C"] {
            assert!(matches!(
                value_kind(descriptor),
                ValueKind::Primitive(_)
            ));
        }
        match value_kind("Ljava/lang/String;") {
            ValueKind::Reference { cast_name } => assert_eq!(cast_name, "java/lang/String"),
            other => panic!("expected reference kind, got {other:?}"),
        }
        match value_kind("[I") {
            ValueKind::Reference { cast_name } => assert_eq!(cast_name, "[I"),
            other => panic!("expected reference kind, got {other:?}"),
        }
    }
}
