//! Companion-pair grouping.
//!
//! The source compiler splits a type with both instance and static lazy
//! vals across two class files: `Foo` and the nested singleton `Foo$`.
//! Grouping is purely by that name relation; no cross-class resolution
//! happens here.

use std::collections::{BTreeMap, BTreeSet};

use crate::errors::parse::{GroupError, ParseError};
use crate::view::ClassView;

#[derive(Debug)]
pub enum ClassGroup {
    Single(ClassView),
    /// `module` is the trailing-`$` nested singleton, `companion` the
    /// plain class of the same name.
    Pair {
        module: ClassView,
        companion: ClassView,
    },
}

impl ClassGroup {
    pub fn names(&self) -> Vec<&str> {
        match self {
            ClassGroup::Single(view) => vec![view.name.as_str()],
            ClassGroup::Pair { module, companion } => {
                vec![module.name.as_str(), companion.name.as_str()]
            }
        }
    }
}

/// Groups a batch of class files, pairing every `Name$` with `Name`
/// when both are present. Every input appears in exactly one group; any
/// parse failure fails the whole batch.
pub fn group(classes: &BTreeMap<String, Vec<u8>>) -> Result<Vec<ClassGroup>, GroupError> {
    let mut failures: Vec<ParseError> = Vec::new();
    let mut parsed: BTreeMap<&str, ClassView> = BTreeMap::new();
    for (name, bytes) in classes {
        match ClassView::parse(bytes) {
            Ok(view) => {
                parsed.insert(name.as_str(), view);
            }
            Err(error) => failures.push(ParseError::new(name, error.msg)),
        }
    }
    if !failures.is_empty() {
        return Err(GroupError { failures });
    }

    let mut paired: BTreeSet<String> = BTreeSet::new();
    let names: Vec<String> = parsed.keys().map(|name| name.to_string()).collect();
    let mut groups = Vec::new();
    for name in &names {
        let Some(stripped) = name.strip_suffix('$') else {
            continue;
        };
        if parsed.contains_key(stripped) {
            paired.insert(name.clone());
            paired.insert(stripped.to_string());
        }
    }
    let mut taken: BTreeSet<String> = BTreeSet::new();
    for name in &names {
        if taken.contains(name) {
            continue;
        }
        if let Some(stripped) = name.strip_suffix('$') {
            if paired.contains(name) && parsed.contains_key(stripped) {
                let module = parsed.remove(name.as_str()).expect("parsed above");
                let companion = parsed.remove(stripped).expect("parsed above");
                taken.insert(name.clone());
                taken.insert(stripped.to_string());
                groups.push(ClassGroup::Pair { module, companion });
                continue;
            }
        }
        if paired.contains(name) {
            // The plain half of a pair; emitted when its `$` twin comes up.
            continue;
        }
        let view = parsed.remove(name.as_str()).expect("parsed above");
        taken.insert(name.clone());
        groups.push(ClassGroup::Single(view));
    }
    Ok(groups)
}
