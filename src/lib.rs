//! Rewrites class files produced by the 3.0–3.7 compilers so their
//! lazy vals run on the VarHandle protocol the 3.8 compiler emits,
//! without recompiling.
//!
//! The callable surface is four operations: [`group`] batches class
//! bytes into companion-aware groups, [`detect`] classifies the lazy
//! vals of one class, [`compare`] answers whether two classes implement
//! the same lazy vals, and [`patch`] rewrites a group. A load-time
//! embedder that only ever sees one class at a time can use
//! [`patch_single`] and buffer companion halves itself.

pub mod compare;
pub mod detect;
pub mod errors;
pub mod group;
pub mod hierarchy;
pub mod patch;
pub mod skeleton;
pub mod view;

pub use compare::{compare, ComparisonResult};
pub use detect::{detect, DetectionResult, Family, LazyValInstance};
pub use group::{group, ClassGroup};
pub use hierarchy::ClassHierarchy;
pub use patch::{patch, PatchResult};
pub use view::ClassView;

use jclass::frames::SuperTypeResolver;

/// Patches one class presented in isolation. Companion-aware flows
/// (a `Name$`/`Name` pair) need [`patch`] with a [`ClassGroup::Pair`];
/// an embedder that receives classes one at a time is expected to
/// buffer the first-arriving half keyed by the stripped name.
pub fn patch_single(
    bytes: &[u8],
    resolver: Option<&dyn SuperTypeResolver>,
) -> PatchResult {
    match ClassView::parse(bytes) {
        Ok(view) => patch(&ClassGroup::Single(view), resolver),
        Err(error) => PatchResult::Failed {
            diagnostic: error.to_string(),
        },
    }
}
