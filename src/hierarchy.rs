//! Common-superclass resolution without class loading.
//!
//! Frame recomputation needs the join of two reference types. Asking a
//! class loader would be catastrophic under a load-time transformer
//! (it forces loading of classes this tool has not patched yet), so
//! supertypes are read straight out of class-file bytes supplied by a
//! resource-lookup callback, parsing only the header. Platform classes
//! are never patched and never on the callback's path; a small built-in
//! table covers the ones generated code actually touches.

use std::cell::RefCell;
use std::collections::HashMap;

use jclass::class_file::ClassHeader;
use jclass::frames::SuperTypeResolver;

const JAVA_LANG_OBJECT: &str = "java/lang/Object";

const PLATFORM_PREFIXES: [&str; 5] = ["java/", "javax/", "jdk/", "sun/", "com/sun/"];

/// Supertypes of the platform classes the rewriter's generated code can
/// put into a frame. Anything else from a platform package joins at
/// Object, which is always verification-safe.
fn platform_super(name: &str) -> Option<&'static str> {
    Some(match name {
        "java/lang/Integer" | "java/lang/Long" | "java/lang/Float" | "java/lang/Double"
        | "java/lang/Short" | "java/lang/Byte" => "java/lang/Number",
        "java/lang/Number" | "java/lang/Boolean" | "java/lang/Character"
        | "java/lang/String" | "java/lang/Class" | "java/lang/Throwable" => JAVA_LANG_OBJECT,
        "java/lang/Exception" | "java/lang/Error" => "java/lang/Throwable",
        "java/lang/RuntimeException" => "java/lang/Exception",
        _ => return None,
    })
}

#[derive(Clone, Debug)]
struct TypeRecord {
    super_name: Option<String>,
    interfaces: Vec<String>,
    is_interface: bool,
}

/// Resolves hierarchies from class-file bytes handed back by `lookup`
/// (keyed by internal name). Results are memoized per instance; an
/// instance is as shareable as its callback, and the core never holds
/// one across calls.
pub struct ClassHierarchy<'a> {
    lookup: Box<dyn Fn(&str) -> Option<Vec<u8>> + 'a>,
    cache: RefCell<HashMap<String, Option<TypeRecord>>>,
}

impl<'a> ClassHierarchy<'a> {
    pub fn new(lookup: impl Fn(&str) -> Option<Vec<u8>> + 'a) -> ClassHierarchy<'a> {
        ClassHierarchy {
            lookup: Box::new(lookup),
            cache: RefCell::new(HashMap::new()),
        }
    }

    fn resolve(&self, name: &str) -> Option<TypeRecord> {
        if let Some(cached) = self.cache.borrow().get(name) {
            return cached.clone();
        }
        let record = self.resolve_uncached(name);
        self.cache
            .borrow_mut()
            .insert(name.to_string(), record.clone());
        record
    }

    fn resolve_uncached(&self, name: &str) -> Option<TypeRecord> {
        if let Some(bytes) = (self.lookup)(name) {
            if let Ok(header) = ClassHeader::from_bytes(&bytes) {
                return Some(TypeRecord {
                    super_name: header.super_name.clone(),
                    interfaces: header.interfaces.clone(),
                    is_interface: header.is_interface(),
                });
            }
            return None;
        }
        if PLATFORM_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            let super_name = platform_super(name).unwrap_or(JAVA_LANG_OBJECT);
            return Some(TypeRecord {
                super_name: Some(super_name.to_string()),
                interfaces: Vec::new(),
                is_interface: false,
            });
        }
        None
    }

    /// Walks `sub`'s supertype graph looking for `sup`.
    fn is_assignable(&self, sup: &str, sub: &str) -> bool {
        if sup == JAVA_LANG_OBJECT {
            return true;
        }
        let mut pending = vec![sub.to_string()];
        let mut seen: Vec<String> = Vec::new();
        while let Some(current) = pending.pop() {
            if current == sup {
                return true;
            }
            if seen.contains(&current) {
                continue;
            }
            seen.push(current.clone());
            if let Some(record) = self.resolve(&current) {
                if let Some(super_name) = record.super_name {
                    pending.push(super_name);
                }
                pending.extend(record.interfaces);
            }
        }
        false
    }

    pub fn common_superclass(&self, a: &str, b: &str) -> String {
        if a == b {
            return a.to_string();
        }
        if a == JAVA_LANG_OBJECT || b == JAVA_LANG_OBJECT {
            return JAVA_LANG_OBJECT.to_string();
        }
        let (Some(record_a), Some(record_b)) = (self.resolve(a), self.resolve(b)) else {
            return JAVA_LANG_OBJECT.to_string();
        };
        if self.is_assignable(a, b) {
            return a.to_string();
        }
        if self.is_assignable(b, a) {
            return b.to_string();
        }
        if record_a.is_interface || record_b.is_interface {
            return JAVA_LANG_OBJECT.to_string();
        }
        let mut ancestor = record_a.super_name;
        while let Some(current) = ancestor {
            if self.is_assignable(&current, b) {
                return current;
            }
            ancestor = self.resolve(&current).and_then(|record| record.super_name);
        }
        JAVA_LANG_OBJECT.to_string()
    }
}

impl SuperTypeResolver for ClassHierarchy<'_> {
    fn common_superclass(&self, a: &str, b: &str) -> String {
        ClassHierarchy::common_superclass(self, a, b)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boxed_numbers_join_at_number() {
        let hierarchy = ClassHierarchy::new(|_| None);
        assert_eq!(
            hierarchy.common_superclass("java/lang/Integer", "java/lang/Long"),
            "java/lang/Number"
        );
    }

    #[test]
    fn unknown_types_join_at_object() {
        let hierarchy = ClassHierarchy::new(|_| None);
        assert_eq!(
            hierarchy.common_superclass("pkg/A", "pkg/B"),
            "java/lang/Object"
        );
    }

    #[test]
    fn resolves_through_supplied_bytes() {
        use jclass::constants::Pool;

        // pkg/Sub extends pkg/Base; pkg/Base extends java/lang/Object.
        let class_bytes = |name: &str, super_name: &str| {
            let mut pool = Pool::default();
            let this_class = pool.ensure_class(name).unwrap();
            let super_class = pool.ensure_class(super_name).unwrap();
            let mut class = jclass::class_file::ClassFile {
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
            };
            class.to_bytes().unwrap()
        };
        let sub = class_bytes("pkg/Sub", "pkg/Base");
        let base = class_bytes("pkg/Base", "java/lang/Object");
        let other = class_bytes("pkg/Other", "pkg/Base");
        let hierarchy = ClassHierarchy::new(move |name| match name {
            "pkg/Sub" => Some(sub.clone()),
            "pkg/Base" => Some(base.clone()),
            "pkg/Other" => Some(other.clone()),
            _ => None,
        });
        assert_eq!(hierarchy.common_superclass("pkg/Sub", "pkg/Base"), "pkg/Base");
        assert_eq!(hierarchy.common_superclass("pkg/Sub", "pkg/Other"), "pkg/Base");
        assert_eq!(
            hierarchy.common_superclass("pkg/Sub", "java/lang/String"),
            "java/lang/Object"
        );
    }
}
