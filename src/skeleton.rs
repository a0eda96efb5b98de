//! Canonical synchronization skeletons.
//!
//! Two compilers never emit byte-identical methods, but for the same
//! lazy val they emit the same *synchronization shape*: the same order
//! of state loads, CAS attempts, monitor operations and guard
//! branches. The extractor walks a method and keeps at most one token
//! per instruction, dropping everything that belongs to the computed
//! value instead of the protocol. Comparing two lazy vals reduces to
//! comparing token sequences.

use jclass::opcodes as op;

use crate::detect::{Family, LazyValInstance};
use crate::view::{ClassView, InsnView, MethodView};
use crate::detect::{bitmap_field_regex, offset_field_regex, storage_field_regex};

/// How the legacy `<clinit>` resolved the field offset.
#[derive(Debug, Clone, PartialEq)]
pub enum OffsetInitPattern {
    /// `LazyVals.getOffset`, the one-step helper of 3.0/3.1.
    GetOffset,
    /// `getDeclaredField+getOffsetStatic`, the two-step sequence of 3.2.
    GetDeclaredFieldGetOffsetStatic,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LazyValCanonicalPattern {
    /// Families 3.0-3.1 and 3.2: everything inline in the accessor.
    Bitmap {
        has_offset_field: bool,
        has_bitmap_field: bool,
        storage_descriptor: String,
        has_init_method: bool,
        accessor_skeleton: Vec<String>,
        offset_init_pattern: Option<OffsetInitPattern>,
    },
    /// Family 3.3-3.7: object-sentinel state machine.
    Sentinel {
        has_offset_field: bool,
        storage_descriptor: String,
        has_init_method: bool,
        init_skeleton: Vec<String>,
        accessor_skeleton: Vec<String>,
    },
    /// Family 3.8+: VarHandle-based state machine.
    Handle {
        has_handle_field: bool,
        storage_descriptor: String,
        has_init_method: bool,
        init_skeleton: Vec<String>,
        accessor_skeleton: Vec<String>,
    },
    Unknown,
}

/// Member name out of a rendered field detail (`OWNER.NAME : DESC`).
fn field_detail_name(detail: &str) -> Option<&str> {
    let member = detail.split(" : ").next()?;
    member.rsplit('.').next()
}

/// Member name out of a rendered method detail (`OWNER.NAME (ARGS)RET`).
fn method_detail_name(detail: &str) -> Option<&str> {
    let member = detail.split(" (").next()?;
    member.rsplit('.').next()
}

fn field_token(insn: &InsnView) -> Option<String> {
    let name = field_detail_name(&insn.detail)?;
    if name.ends_with("$lzyHandle") || insn.detail.contains("Ljava/lang/invoke/VarHandle;") {
        return match insn.opcode {
            op::GETFIELD | op::GETSTATIC => Some("GETFIELD varhandle".into()),
            _ => None,
        };
    }
    if bitmap_field_regex().is_match(name) {
        return Some("GETFIELD bitmap".into());
    }
    if offset_field_regex().is_match(name) {
        return Some("GETFIELD OFFSET".into());
    }
    if storage_field_regex().is_match(name) {
        return match insn.opcode {
            op::GETFIELD | op::GETSTATIC => Some("GETFIELD storage".into()),
            op::PUTFIELD | op::PUTSTATIC => Some("PUTFIELD storage".into()),
            _ => None,
        };
    }
    None
}

fn is_field_access(opcode: u8) -> bool {
    matches!(
        opcode,
        op::GETSTATIC | op::PUTSTATIC | op::GETFIELD | op::PUTFIELD
    )
}

fn is_field_get(opcode: u8) -> bool {
    matches!(opcode, op::GETSTATIC | op::GETFIELD)
}

fn is_bitop(opcode: u8) -> bool {
    matches!(
        opcode,
        op::IAND | op::IOR | op::LAND | op::LOR | op::IXOR | op::LXOR
    )
}

fn is_conditional(opcode: u8) -> bool {
    matches!(opcode, op::IFEQ..=op::IF_ACMPNE | op::IFNULL | op::IFNONNULL)
}

/// Emits the protocol token for one instruction, or `None` when the
/// instruction belongs to the computed value rather than the protocol.
fn token(insn: &InsnView, previous_opcode: Option<u8>) -> Option<String> {
    match insn.opcode {
        op::GETSTATIC | op::PUTSTATIC | op::GETFIELD | op::PUTFIELD => field_token(insn),
        op::MONITORENTER => Some("MONITORENTER".into()),
        op::MONITOREXIT => Some("MONITOREXIT".into()),
        op::INVOKEVIRTUAL | op::INVOKESPECIAL | op::INVOKESTATIC | op::INVOKEINTERFACE => {
            let name = method_detail_name(&insn.detail)?;
            if name == "CAS" || name == "objCAS" || name == "compareAndSet" {
                return Some("CAS".into());
            }
            if insn.detail.contains("java/lang/invoke/VarHandle.") {
                return Some("VARHANDLE_OP".into());
            }
            None
        }
        opcode if is_bitop(opcode) => {
            if previous_opcode.is_some_and(is_field_get) {
                Some(format!("BITOP {}", insn.mnemonic))
            } else {
                None
            }
        }
        opcode if is_conditional(opcode) => {
            if previous_opcode.is_some_and(is_bitop) {
                Some(format!("CONDITIONAL {}", insn.mnemonic))
            } else {
                None
            }
        }
        op::ALOAD | op::ASTORE | op::DUP => {
            if previous_opcode.is_some_and(is_field_access) {
                Some(format!("STACK_SYNC {}", insn.mnemonic))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Walks a method and produces its protocol token sequence.
pub fn skeleton(method: &MethodView) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut previous: Option<u8> = None;
    for insn in &method.instructions {
        if let Some(tok) = token(insn, previous) {
            tokens.push(tok);
        }
        previous = Some(insn.opcode);
    }
    tokens
}

fn method_skeleton(view: &ClassView, name: Option<&str>) -> Vec<String> {
    name.and_then(|name| view.method_named(name))
        .map(skeleton)
        .unwrap_or_default()
}

/// Family-parameterized fingerprint of one lazy val.
pub fn extract(view: &ClassView, instance: &LazyValInstance) -> LazyValCanonicalPattern {
    let accessor_skeleton = method_skeleton(view, instance.accessor.as_deref());
    match &instance.family {
        Family::V30V31 | Family::V32 => LazyValCanonicalPattern::Bitmap {
            has_offset_field: instance.offset_field.is_some(),
            has_bitmap_field: instance.bitmap_field.is_some(),
            storage_descriptor: instance.storage_field.descriptor.clone(),
            has_init_method: instance.init_method.is_some(),
            accessor_skeleton,
            offset_init_pattern: Some(if instance.family == Family::V32 {
                OffsetInitPattern::GetDeclaredFieldGetOffsetStatic
            } else {
                OffsetInitPattern::GetOffset
            }),
        },
        Family::V33V37 => LazyValCanonicalPattern::Sentinel {
            has_offset_field: instance.offset_field.is_some(),
            storage_descriptor: instance.storage_field.descriptor.clone(),
            has_init_method: instance.init_method.is_some(),
            init_skeleton: method_skeleton(view, instance.init_method.as_deref()),
            accessor_skeleton,
        },
        Family::V38Plus => LazyValCanonicalPattern::Handle {
            has_handle_field: instance.handle_field.is_some(),
            storage_descriptor: instance.storage_field.descriptor.clone(),
            has_init_method: instance.init_method.is_some(),
            init_skeleton: method_skeleton(view, instance.init_method.as_deref()),
            accessor_skeleton,
        },
        Family::Unknown(_) => LazyValCanonicalPattern::Unknown,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::view::InsnView;

    fn insn(opcode: u8, mnemonic: &'static str, detail: &str) -> InsnView {
        InsnView {
            opcode,
            mnemonic,
            detail: detail.into(),
            item_index: 0,
        }
    }

    #[test]
    fn field_names_classify_into_tokens() {
        let storage = insn(op::GETFIELD, "GETFIELD", "pkg/A$.value$lzy1 : Ljava/lang/Object;");
        assert_eq!(token(&storage, None).as_deref(), Some("GETFIELD storage"));

        let offset = insn(op::GETSTATIC, "GETSTATIC", "pkg/A$.OFFSET$_m_0 : J");
        assert_eq!(token(&offset, None).as_deref(), Some("GETFIELD OFFSET"));

        let bitmap = insn(op::GETFIELD, "GETFIELD", "pkg/A$.0bitmap$1 : J");
        assert_eq!(token(&bitmap, None).as_deref(), Some("GETFIELD bitmap"));

        let handle = insn(
            op::GETSTATIC,
            "GETSTATIC",
            "pkg/A$.value$lzy1$lzyHandle : Ljava/lang/invoke/VarHandle;",
        );
        assert_eq!(token(&handle, None).as_deref(), Some("GETFIELD varhandle"));
    }

    #[test]
    fn cas_calls_collapse_to_one_token() {
        let unsafe_cas = insn(
            op::INVOKEVIRTUAL,
            "INVOKEVIRTUAL",
            "scala/runtime/LazyVals$.CAS (Ljava/lang/Object;JJI)Z",
        );
        let obj_cas = insn(
            op::INVOKEVIRTUAL,
            "INVOKEVIRTUAL",
            "scala/runtime/LazyVals$.objCAS (Ljava/lang/Object;JLjava/lang/Object;Ljava/lang/Object;)Z",
        );
        let handle_cas = insn(
            op::INVOKEVIRTUAL,
            "INVOKEVIRTUAL",
            "java/lang/invoke/VarHandle.compareAndSet (Ljava/lang/Object;Ljava/lang/Object;Ljava/lang/Object;)Z",
        );
        for cas in [&unsafe_cas, &obj_cas, &handle_cas] {
            assert_eq!(token(cas, None).as_deref(), Some("CAS"));
        }
    }

    #[test]
    fn context_dependent_tokens_need_their_predecessor() {
        let and = insn(op::LAND, "LAND", "");
        assert_eq!(token(&and, Some(op::GETFIELD)).as_deref(), Some("BITOP LAND"));
        assert_eq!(token(&and, Some(op::LDC)), None);

        let branch = insn(op::IFEQ, "IFEQ", "L3");
        assert_eq!(
            token(&branch, Some(op::LAND)).as_deref(),
            Some("CONDITIONAL IFEQ")
        );
        assert_eq!(token(&branch, Some(op::ALOAD)), None);

        let aload = insn(op::ALOAD, "ALOAD", "1");
        assert_eq!(
            token(&aload, Some(op::GETFIELD)).as_deref(),
            Some("STACK_SYNC ALOAD")
        );
        assert_eq!(token(&aload, Some(op::IFEQ)), None);
    }

    #[test]
    fn other_varhandle_calls_keep_their_own_token() {
        let set_release = insn(
            op::INVOKEVIRTUAL,
            "INVOKEVIRTUAL",
            "java/lang/invoke/VarHandle.setRelease (Ljava/lang/Object;Ljava/lang/Object;)V",
        );
        assert_eq!(token(&set_release, None).as_deref(), Some("VARHANDLE_OP"));
    }
}
