#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// [Class Access Flags](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf#page=85)
pub enum ClassAccessFlags {
    /// Declared public; may be accessed from outside its package.
    AccPublic = 0x0001,
    /// Declared final; no subclasses allowed.
    AccFinal = 0x0010,
    /// Treat superclass methods specially when invoked by\
    /// the invokespecial instruction.
    AccSuper = 0x0020,
    /// Is an interface, not a class.
    AccInterface = 0x0200,
    /// Declared abstract; must not be instantiated.
    AccAbstract = 0x0400,
    /// Declared synthetic; not present in the source code.
    AccSynthetic = 0x1000,
    /// Declared as an annotation interface.
    AccAnnotation = 0x2000,
    /// Declared as an enum class.
    AccEnum = 0x4000,
    /// Is a module, not a class or interface.
    AccModule = 0x8000,
}

impl ClassAccessFlags {
    pub fn from_u16(value: u16) -> Vec<Self> {
        use ClassAccessFlags::*;
        [
            AccPublic,
            AccFinal,
            AccSuper,
            AccInterface,
            AccAbstract,
            AccSynthetic,
            AccAnnotation,
            AccEnum,
            AccModule,
        ]
        .into_iter()
        .filter(|flag| value & *flag as u16 == *flag as u16)
        .collect()
    }

    pub fn is_set(mask: u16, flag: ClassAccessFlags) -> bool {
        mask & flag as u16 == flag as u16
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// [Field Access Flags](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf#page=108)
pub enum FieldAccessFlags {
    /// Declared public; may be accessed from outside its package.
    AccPublic = 0x0001,
    /// Declared private; accessible only within the
    /// defining class and other classes belonging to the same
    /// nest (§5.4.4).
    AccPrivate = 0x0002,
    /// Declared protected; may be accessed within
    /// subclasses.
    AccProtected = 0x0004,
    /// Declared static.
    AccStatic = 0x0008,
    /// Declared final; never directly assigned to after
    /// object construction.
    AccFinal = 0x0010,
    /// Declared volatile; cannot be cached.
    AccVolatile = 0x0040,
    /// Declared transient; not written or read by a
    /// persistent object manager.
    AccTransient = 0x0080,
    /// Declared synthetic; not present in the source code.
    AccSynthetic = 0x1000,
    /// Declared as an element of an enum class.
    AccEnum = 0x4000,
}

impl FieldAccessFlags {
    pub fn from_u16(value: u16) -> Vec<Self> {
        use FieldAccessFlags::*;
        [
            AccPublic,
            AccPrivate,
            AccProtected,
            AccStatic,
            AccFinal,
            AccVolatile,
            AccTransient,
            AccSynthetic,
            AccEnum,
        ]
        .into_iter()
        .filter(|flag| value & *flag as u16 == *flag as u16)
        .collect()
    }

    pub fn to_u16(flags: &[FieldAccessFlags]) -> u16 {
        flags.iter().fold(0, |mask, flag| mask | *flag as u16)
    }

    pub fn is_set(mask: u16, flag: FieldAccessFlags) -> bool {
        mask & flag as u16 == flag as u16
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// [Method Access Flags](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf#page=112)
pub enum MethodAccessFlags {
    /// Declared public; may be accessed from outside its package.
    AccPublic = 0x0001,
    /// Declared private; accessible only within the
    /// defining class and other classes belonging to the same
    /// nest (§5.4.4).
    AccPrivate = 0x0002,
    /// Declared protected; may be accessed within
    /// subclasses.
    AccProtected = 0x0004,
    /// Declared static.
    AccStatic = 0x0008,
    /// Declared final; must not be overridden.
    AccFinal = 0x0010,
    /// Declared synchronized; invocation is wrapped
    /// by a monitor use.
    AccSynchronized = 0x0020,
    /// A bridge method, generated by the compiler.
    AccBridge = 0x0040,
    /// Declared with variable number of arguments.
    AccVarArgs = 0x0080,
    /// Declared native; implemented in a language other
    /// than the Java programming language.
    AccNative = 0x0100,
    /// Declared abstract; no implementation is provided.
    AccAbstract = 0x0400,
    /// In a class file whose major version number is at
    /// least 46 and at most 60: Declared strictfp.
    AccStrict = 0x0800,
    /// Declared synthetic; not present in the source code.
    AccSynthetic = 0x1000,
}

impl MethodAccessFlags {
    pub fn from_u16(value: u16) -> Vec<Self> {
        use MethodAccessFlags::*;
        [
            AccPublic,
            AccPrivate,
            AccProtected,
            AccStatic,
            AccFinal,
            AccSynchronized,
            AccBridge,
            AccVarArgs,
            AccNative,
            AccAbstract,
            AccStrict,
            AccSynthetic,
        ]
        .into_iter()
        .filter(|flag| value & *flag as u16 == *flag as u16)
        .collect()
    }

    pub fn to_u16(flags: &[MethodAccessFlags]) -> u16 {
        flags.iter().fold(0, |mask, flag| mask | *flag as u16)
    }

    pub fn is_set(mask: u16, flag: MethodAccessFlags) -> bool {
        mask & flag as u16 == flag as u16
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_flags_round_trip() {
        let mask = 0x0042;
        let flags = FieldAccessFlags::from_u16(mask);
        assert_eq!(
            flags,
            vec![FieldAccessFlags::AccPrivate, FieldAccessFlags::AccVolatile]
        );
        assert_eq!(FieldAccessFlags::to_u16(&flags), mask);
    }

    #[test]
    fn static_final_is_set() {
        let mask = 0x0019;
        assert!(FieldAccessFlags::is_set(mask, FieldAccessFlags::AccStatic));
        assert!(FieldAccessFlags::is_set(mask, FieldAccessFlags::AccFinal));
        assert!(!FieldAccessFlags::is_set(mask, FieldAccessFlags::AccPrivate));
    }
}
