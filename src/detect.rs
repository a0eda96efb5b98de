//! Lazy-val detection and family classification.
//!
//! A lazy val leaves a constellation of members behind in the compiled
//! class: a storage field named `<name>$lzy<digits>`, and depending on
//! the emitting compiler generation some of: a static-final `long`
//! offset field, a `long` bitmap field, a `VarHandle` field, a
//! `<name>$lzyINIT<digits>` initializer method. The detector gathers
//! the constellation for every storage candidate and classifies it by
//! the evidence table in [`classify`].

use regex::Regex;
use tracing::debug;

use jclass::access_flags::FieldAccessFlags;
use jclass::code::{CodeItem, Operand};
use jclass::opcodes as op;

use crate::view::{ClassView, FieldView};

pub const OBJECT_DESCRIPTOR: &str = "Ljava/lang/Object;";
pub const VARHANDLE_DESCRIPTOR: &str = "Ljava/lang/invoke/VarHandle;";
pub const LONG_DESCRIPTOR: &str = "J";
pub const INIT_METHOD_DESCRIPTOR: &str = "()Ljava/lang/Object;";

pub fn storage_field_regex() -> Regex {
    Regex::new(r"^(.+)\$lzy(\d+)$").unwrap()
}

pub fn offset_field_regex() -> Regex {
    Regex::new(r"^OFFSET\$(?:_m_)?\d+$").unwrap()
}

pub fn bitmap_field_regex() -> Regex {
    Regex::new(r"^\d+bitmap\$\d+$").unwrap()
}

pub fn init_method_regex() -> Regex {
    Regex::new(r"^(.+)\$lzyINIT(\d+)$").unwrap()
}

/// Implementation generation of the compiler that emitted a lazy val.
#[derive(Debug, Clone, PartialEq)]
pub enum Family {
    /// 3.0/3.1: bitmap state inline in the accessor, offset resolved
    /// through the one-step runtime helper.
    V30V31,
    /// 3.2: bitmap state inline, offset resolved through the two-step
    /// reflective sequence.
    V32,
    /// 3.3–3.7: object-sentinel state machine, offset-based CAS.
    V33V37,
    /// 3.8+: VarHandle-based CAS. The target shape; never patched.
    V38Plus,
    /// Evidence did not line up; the reason is free-form prose.
    Unknown(String),
}

impl Family {
    /// Same generation, ignoring `Unknown` reasons.
    pub fn same_as(&self, other: &Family) -> bool {
        matches!(
            (self, other),
            (Family::V30V31, Family::V30V31)
                | (Family::V32, Family::V32)
                | (Family::V33V37, Family::V33V37)
                | (Family::V38Plus, Family::V38Plus)
                | (Family::Unknown(_), Family::Unknown(_))
        )
    }

    pub fn uses_bitmap(&self) -> bool {
        matches!(self, Family::V30V31 | Family::V32)
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V30V31 => write!(f, "3.0-3.1"),
            Family::V32 => write!(f, "3.2"),
            Family::V33V37 => write!(f, "3.3-3.7"),
            Family::V38Plus => write!(f, "3.8+"),
            Family::Unknown(reason) => write!(f, "unknown ({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LazyValInstance {
    pub display_name: String,
    pub index: u32,
    pub storage_field: FieldView,
    pub offset_field: Option<FieldView>,
    /// True when the offset field lives in the paired companion class
    /// rather than the class holding the storage field.
    pub offset_in_companion: bool,
    pub bitmap_field: Option<FieldView>,
    pub handle_field: Option<FieldView>,
    pub init_method: Option<String>,
    pub accessor: Option<String>,
    pub family: Family,
}

impl LazyValInstance {
    pub fn handle_field_name(&self) -> String {
        format!("{}$lzyHandle", self.storage_field.name)
    }

    pub fn init_method_name(&self) -> String {
        format!("{}$lzyINIT{}", self.display_name, self.index)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} (index {}, storage {} : {}, offset {}, bitmap {}, handle {}, init {}, accessor {}, family {})",
            self.display_name,
            self.index,
            self.storage_field.name,
            self.storage_field.descriptor,
            self.offset_field
                .as_ref()
                .map(|field| {
                    if self.offset_in_companion {
                        format!("{} [companion]", field.name)
                    } else {
                        field.name.clone()
                    }
                })
                .unwrap_or_else(|| "-".into()),
            self.bitmap_field
                .as_ref()
                .map(|field| field.name.clone())
                .unwrap_or_else(|| "-".into()),
            self.handle_field
                .as_ref()
                .map(|field| field.name.clone())
                .unwrap_or_else(|| "-".into()),
            self.init_method.as_deref().unwrap_or("-"),
            self.accessor.as_deref().unwrap_or("-"),
            self.family,
        )
    }
}

#[derive(Debug)]
pub enum DetectionResult {
    NoLazyVals,
    LazyValsFound {
        family: Family,
        instances: Vec<LazyValInstance>,
    },
    /// Instances of more than one family inside a single class file.
    MixedFamilies { instances: Vec<LazyValInstance> },
}

/// Where an offset binding was found.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Half {
    Primary,
    Companion,
}

/// One `PUTSTATIC OFFSET$…` in a `<clinit>`, bound to the name of the
/// field whose memory offset it stores.
#[derive(Debug)]
struct OffsetBinding {
    half: Half,
    field_name: String,
    target: String,
    claimed: bool,
}

/// Scans a `<clinit>` for `LDC "<field name>"` … `PUTSTATIC OFFSET$…`
/// pairs. The most recent remembered string wins; anything between the
/// load and the store is ignored.
fn scan_offset_bindings(view: &ClassView, half: Half, bindings: &mut Vec<OffsetBinding>) {
    let storage = storage_field_regex();
    let bitmap = bitmap_field_regex();
    let offset = offset_field_regex();
    let Some(clinit) = view.static_initializer() else {
        return;
    };
    let Some(body) = view.class.methods[clinit.method_index].code() else {
        return;
    };
    let mut remembered: Option<String> = None;
    for item in &body.items {
        let CodeItem::Insn(insn) = item else { continue };
        match insn.opcode {
            op::LDC => {
                if let Operand::Cp(index) = insn.operand {
                    if let Some(value) = view.class.pool.string_value(index) {
                        if storage.is_match(&value) || bitmap.is_match(&value) {
                            remembered = Some(value);
                        }
                    }
                }
            }
            op::PUTSTATIC => {
                if let Operand::Cp(index) = insn.operand {
                    if let Some((_, name, descriptor)) = view.class.pool.member_ref(index) {
                        if offset.is_match(&name) && descriptor == LONG_DESCRIPTOR {
                            if let Some(target) = remembered.take() {
                                bindings.push(OffsetBinding {
                                    half,
                                    field_name: name,
                                    target,
                                    claimed: false,
                                });
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn is_static_final_long(field: &FieldView) -> bool {
    field.descriptor == LONG_DESCRIPTOR
        && FieldAccessFlags::is_set(field.access_flags, FieldAccessFlags::AccStatic)
        && FieldAccessFlags::is_set(field.access_flags, FieldAccessFlags::AccFinal)
}

fn find_offset_field<'a>(
    bindings: &mut [OffsetBinding],
    primary: &'a ClassView,
    companion: Option<&'a ClassView>,
    storage_name: &str,
) -> Option<(FieldView, bool)> {
    let bitmap = bitmap_field_regex();
    // Exact storage binding first, then the next unclaimed bitmap
    // binding, trying the primary half before the companion.
    for wanted_half in [Half::Primary, Half::Companion] {
        for binding in bindings.iter_mut() {
            if binding.half != wanted_half || binding.claimed {
                continue;
            }
            if binding.target != storage_name {
                continue;
            }
            let Some(holder) = (match wanted_half {
                Half::Primary => Some(primary),
                Half::Companion => companion,
            }) else {
                continue;
            };
            if let Some(field) = holder.field_named(&binding.field_name) {
                if is_static_final_long(field) {
                    binding.claimed = true;
                    return Some((field.clone(), wanted_half == Half::Companion));
                }
            }
        }
    }
    for wanted_half in [Half::Primary, Half::Companion] {
        for binding in bindings.iter_mut() {
            if binding.half != wanted_half || binding.claimed {
                continue;
            }
            if !bitmap.is_match(&binding.target) {
                continue;
            }
            let Some(holder) = (match wanted_half {
                Half::Primary => Some(primary),
                Half::Companion => companion,
            }) else {
                continue;
            };
            if let Some(field) = holder.field_named(&binding.field_name) {
                if is_static_final_long(field) {
                    binding.claimed = true;
                    return Some((field.clone(), wanted_half == Half::Companion));
                }
            }
        }
    }
    None
}

fn classify(
    instance: &LazyValInstance,
    primary: &ClassView,
    companion: Option<&ClassView>,
) -> Family {
    if instance.handle_field.is_some() {
        return Family::V38Plus;
    }
    if instance.bitmap_field.is_some() {
        // The offset lookup lives in the <clinit> of whichever half
        // actually declares the offset field.
        let holder = if instance.offset_in_companion {
            companion
        } else {
            Some(primary)
        };
        let clinit_text = holder
            .and_then(|view| view.static_initializer())
            .map(|clinit| clinit.text.as_str())
            .unwrap_or("");
        if clinit_text.contains("getDeclaredField") && clinit_text.contains("getOffsetStatic") {
            return Family::V32;
        }
        if clinit_text.contains("LazyVals$.getOffset (") {
            return Family::V30V31;
        }
        return Family::Unknown(format!(
            "bitmap field {} present but <clinit> matches no known offset lookup",
            instance
                .bitmap_field
                .as_ref()
                .map(|field| field.name.as_str())
                .unwrap_or("?"),
        ));
    }
    let volatile_object_storage = instance.storage_field.descriptor == OBJECT_DESCRIPTOR
        && FieldAccessFlags::is_set(
            instance.storage_field.access_flags,
            FieldAccessFlags::AccVolatile,
        );
    if instance.offset_field.is_some() && instance.init_method.is_some() && volatile_object_storage
    {
        let init_text = instance
            .init_method
            .as_deref()
            .and_then(|name| primary.method_named(name))
            .map(|method| method.text.as_str())
            .unwrap_or("");
        if init_text.contains("LazyVals$.objCAS") {
            return Family::V33V37;
        }
    }
    Family::Unknown(format!(
        "storage field {} has no recognizable initialization protocol",
        instance.storage_field.name
    ))
}

/// Detects every lazy val of `primary`, consulting `companion` for
/// offset fields the compiler hoisted into the other half of the pair.
pub fn detect(primary: &ClassView, companion: Option<&ClassView>) -> DetectionResult {
    let storage = storage_field_regex();

    let mut bindings: Vec<OffsetBinding> = Vec::new();
    scan_offset_bindings(primary, Half::Primary, &mut bindings);
    if let Some(companion) = companion {
        scan_offset_bindings(companion, Half::Companion, &mut bindings);
    }

    let bitmap = bitmap_field_regex();
    let mut unclaimed_bitmaps: Vec<FieldView> = primary
        .fields
        .iter()
        .filter(|field| {
            bitmap.is_match(&field.name)
                && field.descriptor == LONG_DESCRIPTOR
                && !FieldAccessFlags::is_set(field.access_flags, FieldAccessFlags::AccStatic)
        })
        .cloned()
        .collect();

    let mut instances: Vec<LazyValInstance> = Vec::new();
    for field in &primary.fields {
        if field.name.ends_with("$lzyHandle") {
            continue;
        }
        let Some(captures) = storage.captures(&field.name) else {
            continue;
        };
        let display_name = captures[1].to_string();
        let Ok(index) = captures[2].parse::<u32>() else {
            continue;
        };

        let (offset_field, offset_in_companion) =
            match find_offset_field(&mut bindings, primary, companion, &field.name) {
                Some((offset, in_companion)) => (Some(offset), in_companion),
                None => (None, false),
            };
        let bitmap_field = if unclaimed_bitmaps.is_empty() {
            None
        } else {
            Some(unclaimed_bitmaps.remove(0))
        };
        let handle_name = format!("{}$lzyHandle", field.name);
        let handle_field = primary
            .field_named(&handle_name)
            .filter(|handle| {
                handle.descriptor == VARHANDLE_DESCRIPTOR
                    && FieldAccessFlags::is_set(handle.access_flags, FieldAccessFlags::AccPrivate)
                    && FieldAccessFlags::is_set(handle.access_flags, FieldAccessFlags::AccStatic)
                    && FieldAccessFlags::is_set(handle.access_flags, FieldAccessFlags::AccFinal)
            })
            .cloned();
        let init_name = format!("{display_name}$lzyINIT{index}");
        let init_method = primary
            .methods
            .iter()
            .find(|method| method.name == init_name && method.descriptor == INIT_METHOD_DESCRIPTOR)
            .map(|method| method.name.clone());
        let accessor = primary
            .method_named(&display_name)
            .map(|method| method.name.clone());

        let mut instance = LazyValInstance {
            display_name,
            index,
            storage_field: field.clone(),
            offset_field,
            offset_in_companion,
            bitmap_field,
            handle_field,
            init_method,
            accessor,
            family: Family::Unknown(String::new()),
        };

        // An eagerly-initialized companion reference of a nested case
        // class matches the storage naming shape but carries none of
        // the protocol members. Drop it silently.
        let volatile_flag = FieldAccessFlags::is_set(
            instance.storage_field.access_flags,
            FieldAccessFlags::AccVolatile,
        );
        if instance.offset_field.is_none()
            && instance.bitmap_field.is_none()
            && instance.handle_field.is_none()
            && instance.init_method.is_none()
            && !volatile_flag
        {
            debug!(
                class = %primary.name,
                field = %instance.storage_field.name,
                "dropping storage-shaped field with no supporting evidence"
            );
            continue;
        }

        instance.family = classify(&instance, primary, companion);
        debug!(
            class = %primary.name,
            lazy_val = %instance.display_name,
            family = %instance.family,
            "classified lazy val"
        );
        instances.push(instance);
    }

    if instances.is_empty() {
        return DetectionResult::NoLazyVals;
    }
    let family = instances[0].family.clone();
    if instances
        .iter()
        .all(|instance| instance.family.same_as(&family))
    {
        DetectionResult::LazyValsFound { family, instances }
    } else {
        DetectionResult::MixedFamilies { instances }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn storage_names_parse_display_and_index() {
        let regex = storage_field_regex();
        let captures = regex.captures("value$lzy1").unwrap();
        assert_eq!(&captures[1], "value");
        assert_eq!(&captures[2], "1");
        assert!(regex.is_match("a$b$lzy12"));
        assert!(!regex.is_match("value$lzy"));
        assert!(!regex.is_match("$lzy1"));
    }

    #[test]
    fn offset_names_allow_both_spellings() {
        let regex = offset_field_regex();
        assert!(regex.is_match("OFFSET$_m_0"));
        assert!(regex.is_match("OFFSET$12"));
        assert!(!regex.is_match("OFFSET$_m_"));
        assert!(!regex.is_match("OFFSET"));
    }

    #[test]
    fn bitmap_names_require_leading_index() {
        let regex = bitmap_field_regex();
        assert!(regex.is_match("0bitmap$1"));
        assert!(!regex.is_match("bitmap$1"));
        assert!(!regex.is_match("0bitmap"));
    }

    #[test]
    fn families_compare_by_generation() {
        assert!(Family::Unknown("a".into()).same_as(&Family::Unknown("b".into())));
        assert!(!Family::V30V31.same_as(&Family::V32));
    }
}
