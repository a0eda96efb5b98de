//! Patch dispatch.
//!
//! Runs detection over a class group, validates the cross-half family
//! invariant, hands the work to the family patcher and shapes the
//! outcome into a [`PatchResult`]. The companion two-pass flow lives
//! here: patching the module half may rewrite companion bytes (offset
//! fields hoisted into the other half), after which the companion is
//! re-parsed and patched for its own lazy vals.

pub mod rewrite;
pub mod v0_1;
pub mod v3_7;

use tracing::debug;

use jclass::frames::{ObjectResolver, SuperTypeResolver};

use crate::detect::{detect, DetectionResult, Family, LazyValInstance};
use crate::errors::rewrite::RewriteError;
use crate::group::ClassGroup;
use crate::view::ClassView;

#[derive(Debug)]
pub enum PatchResult {
    Patched {
        name: String,
        bytes: Vec<u8>,
    },
    PatchedPair {
        module_name: String,
        companion_name: String,
        module_bytes: Vec<u8>,
        companion_bytes: Vec<u8>,
    },
    /// Already on the target layout (or no lazy vals at all).
    NotApplicable,
    Failed {
        diagnostic: String,
    },
}

/// Everything a human needs to see when detection evidence is
/// inconsistent: every field, every method, every lazy-val record of
/// every involved class.
fn diagnostic_dump(reason: &str, views: &[&ClassView], detections: &[&DetectionResult]) -> String {
    let mut out = String::new();
    out.push_str(reason);
    out.push('\n');
    for view in views {
        out.push_str(&format!("class {}\n", view.name));
        for field in &view.fields {
            out.push_str(&format!(
                "  field {} : {} (flags {:#06x})\n",
                field.name, field.descriptor, field.access_flags
            ));
        }
        for method in &view.methods {
            out.push_str(&format!("  method {} {}\n", method.name, method.descriptor));
        }
    }
    for detection in detections {
        match detection {
            DetectionResult::NoLazyVals => out.push_str("detected: no lazy vals\n"),
            DetectionResult::LazyValsFound { family, instances } => {
                out.push_str(&format!("detected family {family}:\n"));
                for instance in instances {
                    out.push_str(&format!("  {}\n", instance.summary()));
                }
            }
            DetectionResult::MixedFamilies { instances } => {
                out.push_str("detected mixed families:\n");
                for instance in instances {
                    out.push_str(&format!("  {}\n", instance.summary()));
                }
            }
        }
    }
    out
}

fn run_family_patch(
    family: &Family,
    primary: &ClassView,
    instances: &[LazyValInstance],
    companion: Option<&ClassView>,
    resolver: &dyn SuperTypeResolver,
) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>, RewriteError> {
    match family {
        Family::V38Plus => Ok(None),
        Family::V33V37 => v3_7::patch(primary, instances, companion).map(Some),
        Family::V30V31 | Family::V32 => {
            v0_1::patch(primary, instances, companion, resolver).map(Some)
        }
        Family::Unknown(_) => unreachable!("unknown families fail before dispatch"),
    }
}

fn patch_standalone(view: &ClassView, resolver: &dyn SuperTypeResolver) -> PatchResult {
    let detection = detect(view, None);
    match &detection {
        DetectionResult::NoLazyVals => PatchResult::NotApplicable,
        DetectionResult::MixedFamilies { .. } => PatchResult::Failed {
            diagnostic: diagnostic_dump(
                &format!("{} mixes lazy-val families", view.name),
                &[view],
                &[&detection],
            ),
        },
        DetectionResult::LazyValsFound { family, instances } => match family {
            Family::Unknown(reason) => PatchResult::Failed {
                diagnostic: diagnostic_dump(
                    &format!("{}: unsupported lazy-val pattern: {reason}", view.name),
                    &[view],
                    &[&detection],
                ),
            },
            _ => match run_family_patch(family, view, instances, None, resolver) {
                Ok(None) => PatchResult::NotApplicable,
                Ok(Some((bytes, _))) => PatchResult::Patched {
                    name: view.name.clone(),
                    bytes,
                },
                Err(error) => PatchResult::Failed {
                    diagnostic: format!("{}: {error}", view.name),
                },
            },
        },
    }
}

fn detection_parts(detection: &DetectionResult) -> Option<(&Family, &[LazyValInstance])> {
    match detection {
        DetectionResult::LazyValsFound { family, instances } => {
            Some((family, instances.as_slice()))
        }
        _ => None,
    }
}

fn patch_pair(
    module: &ClassView,
    companion: &ClassView,
    resolver: &dyn SuperTypeResolver,
) -> PatchResult {
    let module_detection = detect(module, Some(companion));
    let companion_detection = detect(companion, Some(module));

    if matches!(module_detection, DetectionResult::MixedFamilies { .. })
        || matches!(companion_detection, DetectionResult::MixedFamilies { .. })
    {
        return PatchResult::Failed {
            diagnostic: diagnostic_dump(
                &format!("{} / {} mix lazy-val families", module.name, companion.name),
                &[module, companion],
                &[&module_detection, &companion_detection],
            ),
        };
    }
    let module_parts = detection_parts(&module_detection);
    let companion_parts = detection_parts(&companion_detection);

    // Both halves populated: same family or it is a compiler bug.
    if let (Some((module_family, _)), Some((companion_family, _))) =
        (&module_parts, &companion_parts)
    {
        if !module_family.same_as(companion_family) {
            return PatchResult::Failed {
                diagnostic: diagnostic_dump(
                    &format!(
                        "{} is family {} but {} is family {}",
                        module.name, module_family, companion.name, companion_family
                    ),
                    &[module, companion],
                    &[&module_detection, &companion_detection],
                ),
            };
        }
    }
    for (view, parts) in [(module, &module_parts), (companion, &companion_parts)] {
        if let Some((Family::Unknown(reason), _)) = parts {
            return PatchResult::Failed {
                diagnostic: diagnostic_dump(
                    &format!("{}: unsupported lazy-val pattern: {reason}", view.name),
                    &[module, companion],
                    &[&module_detection, &companion_detection],
                ),
            };
        }
    }

    match (module_parts, companion_parts) {
        (None, None) => PatchResult::NotApplicable,
        (Some((Family::V38Plus, _)), _) | (_, Some((Family::V38Plus, _))) => {
            PatchResult::NotApplicable
        }
        // Only the nested-singleton half has lazy vals.
        (Some((family, instances)), None) => {
            match run_family_patch(family, module, instances, Some(companion), resolver) {
                Ok(None) => PatchResult::NotApplicable,
                Ok(Some((module_bytes, Some(companion_bytes)))) => PatchResult::PatchedPair {
                    module_name: module.name.clone(),
                    companion_name: companion.name.clone(),
                    module_bytes,
                    companion_bytes,
                },
                Ok(Some((module_bytes, None))) => PatchResult::Patched {
                    name: module.name.clone(),
                    bytes: module_bytes,
                },
                Err(error) => PatchResult::Failed {
                    diagnostic: format!("{}: {error}", module.name),
                },
            }
        }
        // Only the plain half has them: its offsets are its own.
        (None, Some((family, instances))) => {
            match run_family_patch(family, companion, instances, Some(module), resolver) {
                Ok(None) => PatchResult::NotApplicable,
                Ok(Some((companion_bytes, Some(module_bytes)))) => PatchResult::PatchedPair {
                    module_name: module.name.clone(),
                    companion_name: companion.name.clone(),
                    module_bytes,
                    companion_bytes,
                },
                Ok(Some((companion_bytes, None))) => PatchResult::Patched {
                    name: companion.name.clone(),
                    bytes: companion_bytes,
                },
                Err(error) => PatchResult::Failed {
                    diagnostic: format!("{}: {error}", companion.name),
                },
            }
        }
        // Both halves: patch the module, re-parse the intermediate
        // companion bytes, then patch the companion for its own lazy
        // vals.
        (Some((family, instances)), Some(_)) => {
            let first_pass =
                match run_family_patch(family, module, instances, Some(companion), resolver) {
                    Ok(Some(result)) => result,
                    Ok(None) => return PatchResult::NotApplicable,
                    Err(error) => {
                        return PatchResult::Failed {
                            diagnostic: format!("{}: {error}", module.name),
                        }
                    }
                };
            let (module_bytes, intermediate) = first_pass;
            let companion_view = match intermediate {
                Some(bytes) => match ClassView::parse(&bytes) {
                    Ok(view) => view,
                    Err(error) => {
                        return PatchResult::Failed {
                            diagnostic: format!(
                                "{}: intermediate companion bytes unparseable: {error}",
                                companion.name
                            ),
                        }
                    }
                },
                None => companion.clone(),
            };
            debug!(
                module = %module.name,
                companion = %companion.name,
                "second pass over companion half"
            );
            match patch_standalone(&companion_view, resolver) {
                PatchResult::Patched { bytes, .. } => PatchResult::PatchedPair {
                    module_name: module.name.clone(),
                    companion_name: companion.name.clone(),
                    module_bytes,
                    companion_bytes: bytes,
                },
                PatchResult::NotApplicable => PatchResult::Failed {
                    diagnostic: format!(
                        "{}: lazy vals detected on the first pass vanished on the second",
                        companion.name
                    ),
                },
                PatchResult::Failed { diagnostic } => PatchResult::Failed { diagnostic },
                PatchResult::PatchedPair { .. } => PatchResult::Failed {
                    diagnostic: format!(
                        "{}: standalone second pass produced a pair result",
                        companion.name
                    ),
                },
            }
        }
    }
}

/// Patches one class group. `resolver` supplies common-superclass
/// answers for frame recomputation; when absent every reference join
/// falls back to `java/lang/Object`.
pub fn patch(group: &ClassGroup, resolver: Option<&dyn SuperTypeResolver>) -> PatchResult {
    let fallback = ObjectResolver;
    let resolver = resolver.unwrap_or(&fallback);
    match group {
        ClassGroup::Single(view) => patch_standalone(view, resolver),
        ClassGroup::Pair { module, companion } => patch_pair(module, companion, resolver),
    }
}
