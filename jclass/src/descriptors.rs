//! [Descriptors](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf)
//!
//! Small string-level utilities over field and method descriptors. The
//! rewriter only needs splitting and slot arithmetic, never a full type
//! model.

/// Splits `(ARGS)RET` into the individual argument descriptors and the
/// return descriptor. `None` when the string is not a method descriptor.
pub fn split_method_descriptor(descriptor: &str) -> Option<(Vec<String>, String)> {
    let rest = descriptor.strip_prefix('(')?;
    let close = rest.find(')')?;
    let (args, ret) = (&rest[..close], &rest[close + 1..]);
    if ret.is_empty() {
        return None;
    }
    let mut parsed = Vec::new();
    let mut remaining = args;
    while !remaining.is_empty() {
        let len = field_descriptor_len(remaining)?;
        parsed.push(remaining[..len].to_string());
        remaining = &remaining[len..];
    }
    Some((parsed, ret.to_string()))
}

fn field_descriptor_len(descriptor: &str) -> Option<usize> {
    let bytes = descriptor.as_bytes();
    let mut at = 0;
    while at < bytes.len() && bytes[at] == b'[' {
        at += 1;
    }
    match bytes.get(at)? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => Some(at + 1),
        b'L' => {
            let end = descriptor[at..].find(';')?;
            Some(at + end + 1)
        }
        _ => None,
    }
}

/// long and double occupy two operand-stack and local-variable slots.
pub fn is_category2(descriptor: &str) -> bool {
    descriptor == "J" || descriptor == "D"
}

pub fn is_primitive(descriptor: &str) -> bool {
    matches!(
        descriptor,
        "B" | "C" | "D" | "F" | "I" | "J" | "S" | "Z"
    )
}

/// Local-variable slots consumed by the arguments of a method
/// descriptor, not counting a receiver.
pub fn arg_slot_count(descriptor: &str) -> Option<usize> {
    let (args, _) = split_method_descriptor(descriptor)?;
    Some(
        args.iter()
            .map(|arg| if is_category2(arg) { 2 } else { 1 })
            .sum(),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_mixed_arguments() {
        let (args, ret) =
            split_method_descriptor("(Ljava/lang/Class;Ljava/lang/String;J[IZ)Ljava/lang/Object;")
                .unwrap();
        assert_eq!(
            args,
            vec!["Ljava/lang/Class;", "Ljava/lang/String;", "J", "[I", "Z"]
        );
        assert_eq!(ret, "Ljava/lang/Object;");
    }

    #[test]
    fn slot_count_doubles_category2() {
        assert_eq!(arg_slot_count("(JDI)V"), Some(5));
        assert_eq!(arg_slot_count("()V"), Some(0));
    }

    #[test]
    fn rejects_field_descriptor() {
        assert!(split_method_descriptor("Ljava/lang/Object;").is_none());
    }
}
