pub mod access_flags;
/// [Attributes](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf)
pub mod attributes;
/// [Class File Format](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf)
pub mod class_file;
/// The `Code` attribute modelled as an instruction list with symbolic labels.
pub mod code;
/// [Constants](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf)
pub mod constants;
/// [Descriptors](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf)
pub mod descriptors;
pub mod errors;
/// StackMapTable recomputation for rewritten method bodies.
pub mod frames;
pub mod opcodes;
