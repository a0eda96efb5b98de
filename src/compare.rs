//! Semantic comparison of two classes' lazy vals.
//!
//! Byte-level diffs between compiler generations are meaningless; this
//! comparator asks only whether the two sides implement the same lazy
//! vals with the same synchronization shape, keyed by display name.

use std::collections::BTreeMap;

use crate::detect::{detect, DetectionResult, LazyValInstance};
use crate::skeleton::{extract, LazyValCanonicalPattern};
use crate::view::ClassView;

#[derive(Debug, PartialEq)]
pub enum ComparisonResult {
    Identical,
    Different { reasons: Vec<String> },
    BothNoLazyVals,
    OnlyOneHasAny {
        first_count: usize,
        second_count: usize,
    },
}

fn by_name(instances: Vec<LazyValInstance>) -> BTreeMap<String, LazyValInstance> {
    instances
        .into_iter()
        .map(|instance| (instance.display_name.clone(), instance))
        .collect()
}

fn side_instances(
    label: &str,
    view: &ClassView,
    companion: Option<&ClassView>,
    reasons: &mut Vec<String>,
) -> Vec<LazyValInstance> {
    match detect(view, companion) {
        DetectionResult::NoLazyVals => Vec::new(),
        DetectionResult::LazyValsFound { instances, .. } => instances,
        DetectionResult::MixedFamilies { instances } => {
            reasons.push(format!(
                "{label} class {} mixes lazy-val families",
                view.name
            ));
            instances
        }
    }
}

fn pattern_reasons(
    name: &str,
    first: &LazyValCanonicalPattern,
    second: &LazyValCanonicalPattern,
    reasons: &mut Vec<String>,
) {
    use LazyValCanonicalPattern::*;
    match (first, second) {
        (
            Bitmap {
                has_offset_field: offset1,
                has_bitmap_field: bitmap1,
                storage_descriptor: storage1,
                has_init_method: init1,
                accessor_skeleton: accessor1,
                offset_init_pattern: pattern1,
            },
            Bitmap {
                has_offset_field: offset2,
                has_bitmap_field: bitmap2,
                storage_descriptor: storage2,
                has_init_method: init2,
                accessor_skeleton: accessor2,
                offset_init_pattern: pattern2,
            },
        ) => {
            if storage1 != storage2 {
                reasons.push(format!(
                    "{name}: storage descriptor {storage1} vs {storage2}"
                ));
            }
            if pattern1 != pattern2 {
                reasons.push(format!("{name}: offset-init pattern differs"));
            }
            if (offset1, bitmap1, init1) != (offset2, bitmap2, init2)
                || accessor1 != accessor2
            {
                reasons.push(format!("{name}: synchronization skeleton differs"));
            }
        }
        (
            Sentinel {
                has_offset_field: offset1,
                storage_descriptor: storage1,
                has_init_method: init1,
                init_skeleton: init_skeleton1,
                accessor_skeleton: accessor1,
            },
            Sentinel {
                has_offset_field: offset2,
                storage_descriptor: storage2,
                has_init_method: init2,
                init_skeleton: init_skeleton2,
                accessor_skeleton: accessor2,
            },
        ) => {
            if storage1 != storage2 {
                reasons.push(format!(
                    "{name}: storage descriptor {storage1} vs {storage2}"
                ));
            }
            if (offset1, init1) != (offset2, init2)
                || init_skeleton1 != init_skeleton2
                || accessor1 != accessor2
            {
                reasons.push(format!("{name}: synchronization skeleton differs"));
            }
        }
        (
            Handle {
                has_handle_field: handle1,
                storage_descriptor: storage1,
                has_init_method: init1,
                init_skeleton: init_skeleton1,
                accessor_skeleton: accessor1,
            },
            Handle {
                has_handle_field: handle2,
                storage_descriptor: storage2,
                has_init_method: init2,
                init_skeleton: init_skeleton2,
                accessor_skeleton: accessor2,
            },
        ) => {
            if storage1 != storage2 {
                reasons.push(format!(
                    "{name}: storage descriptor {storage1} vs {storage2}"
                ));
            }
            if (handle1, init1) != (handle2, init2)
                || init_skeleton1 != init_skeleton2
                || accessor1 != accessor2
            {
                reasons.push(format!("{name}: synchronization skeleton differs"));
            }
        }
        _ => {
            // Shapes of two different families never compare equal;
            // report the family split directly instead of relying on
            // that accident.
            reasons.push(format!("{name}: implementation family differs"));
        }
    }
}

/// Are the lazy-val implementations of the two classes identical?
pub fn compare(
    first: &ClassView,
    second: &ClassView,
    first_companion: Option<&ClassView>,
    second_companion: Option<&ClassView>,
) -> ComparisonResult {
    let mut reasons = Vec::new();
    let first_instances = side_instances("first", first, first_companion, &mut reasons);
    let second_instances = side_instances("second", second, second_companion, &mut reasons);

    if first_instances.is_empty() && second_instances.is_empty() && reasons.is_empty() {
        return ComparisonResult::BothNoLazyVals;
    }
    if (first_instances.is_empty() || second_instances.is_empty()) && reasons.is_empty() {
        return ComparisonResult::OnlyOneHasAny {
            first_count: first_instances.len(),
            second_count: second_instances.len(),
        };
    }

    let first_by_name = by_name(first_instances);
    let second_by_name = by_name(second_instances);

    let only_first: Vec<&str> = first_by_name
        .keys()
        .filter(|name| !second_by_name.contains_key(*name))
        .map(String::as_str)
        .collect();
    if !only_first.is_empty() {
        reasons.push(format!("lazy vals only in first: {}", only_first.join(", ")));
    }
    let only_second: Vec<&str> = second_by_name
        .keys()
        .filter(|name| !first_by_name.contains_key(*name))
        .map(String::as_str)
        .collect();
    if !only_second.is_empty() {
        reasons.push(format!(
            "lazy vals only in second: {}",
            only_second.join(", ")
        ));
    }

    for (name, first_instance) in &first_by_name {
        let Some(second_instance) = second_by_name.get(name) else {
            continue;
        };
        if !first_instance.family.same_as(&second_instance.family) {
            reasons.push(format!(
                "{name}: family {} vs {}",
                first_instance.family, second_instance.family
            ));
            continue;
        }
        let first_pattern = extract(first, first_instance);
        let second_pattern = extract(second, second_instance);
        pattern_reasons(name, &first_pattern, &second_pattern, &mut reasons);
    }

    if reasons.is_empty() {
        ComparisonResult::Identical
    } else {
        ComparisonResult::Different { reasons }
    }
}
