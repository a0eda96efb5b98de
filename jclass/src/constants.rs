//! [The Constant Pool](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf)

use std::io::Cursor;
use std::str::from_utf8;

use byteorder::{ReadBytesExt, BE};

use crate::errors::class_loading::{LoadingCause, LoadingError};
use crate::errors::class_writing::{WritingCause, WritingError};

#[derive(Clone, Debug, PartialEq)]
pub enum ConstantPool {
    Utf8(Utf8),
    Integer(u32),
    Float(u32),
    Long { high: u32, low: u32 },
    Double { high: u32, low: u32 },
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
    /// Index 0 and the slot following a Long/Double entry.
    Unusable,
}

#[repr(u8)]
pub enum Tags {
    Utf8 = 1,
    Integer = 3,
    Float = 4,
    Long = 5,
    Double = 6,
    Class = 7,
    String = 8,
    Fieldref = 9,
    Methodref = 10,
    InterfaceMethodref = 11,
    NameAndType = 12,
    MethodHandle = 15,
    MethodType = 16,
    Dynamic = 17,
    InvokeDynamic = 18,
    Module = 19,
    Package = 20,
}

/// Modified-UTF8 payload kept as raw bytes so that constants this tool
/// never touches survive a rewrite byte-for-byte.
#[derive(Clone, PartialEq)]
pub struct Utf8 {
    pub bytes: Vec<u8>,
}

impl From<&str> for Utf8 {
    fn from(input: &str) -> Self {
        Utf8 {
            bytes: input.as_bytes().to_vec(),
        }
    }
}

impl From<&Utf8> for std::string::String {
    fn from(value: &Utf8) -> Self {
        std::string::String::from(from_utf8(&value.bytes).unwrap_or("<malformed utf8>"))
    }
}

impl std::fmt::Debug for Utf8 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\"", std::string::String::from(self))
    }
}

/// The pool table. Entry 0 is `Unusable`, as is the slot after every
/// Long/Double entry, so stored indices line up with file indices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pool {
    entries: Vec<ConstantPool>,
}

impl Pool {
    pub fn read(cursor: &mut Cursor<&[u8]>) -> Result<Pool, LoadingError> {
        let truncated =
            |_| LoadingError::new(LoadingCause::TruncatedCode, "constant pool ends early");
        let count = cursor.read_u16::<BE>().map_err(truncated)?;
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(ConstantPool::Unusable);
        while entries.len() < count as usize {
            let tag = cursor.read_u8().map_err(truncated)?;
            let entry = match tag {
                t if t == Tags::Utf8 as u8 => {
                    let length = cursor.read_u16::<BE>().map_err(truncated)?;
                    let mut bytes = vec![0u8; length as usize];
                    std::io::Read::read_exact(cursor, &mut bytes).map_err(truncated)?;
                    ConstantPool::Utf8(Utf8 { bytes })
                }
                t if t == Tags::Integer as u8 => {
                    ConstantPool::Integer(cursor.read_u32::<BE>().map_err(truncated)?)
                }
                t if t == Tags::Float as u8 => {
                    ConstantPool::Float(cursor.read_u32::<BE>().map_err(truncated)?)
                }
                t if t == Tags::Long as u8 => ConstantPool::Long {
                    high: cursor.read_u32::<BE>().map_err(truncated)?,
                    low: cursor.read_u32::<BE>().map_err(truncated)?,
                },
                t if t == Tags::Double as u8 => ConstantPool::Double {
                    high: cursor.read_u32::<BE>().map_err(truncated)?,
                    low: cursor.read_u32::<BE>().map_err(truncated)?,
                },
                t if t == Tags::Class as u8 => ConstantPool::Class {
                    name_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::String as u8 => ConstantPool::String {
                    string_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::Fieldref as u8 => ConstantPool::Fieldref {
                    class_index: cursor.read_u16::<BE>().map_err(truncated)?,
                    name_and_type_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::Methodref as u8 => ConstantPool::Methodref {
                    class_index: cursor.read_u16::<BE>().map_err(truncated)?,
                    name_and_type_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::InterfaceMethodref as u8 => ConstantPool::InterfaceMethodref {
                    class_index: cursor.read_u16::<BE>().map_err(truncated)?,
                    name_and_type_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::NameAndType as u8 => ConstantPool::NameAndType {
                    name_index: cursor.read_u16::<BE>().map_err(truncated)?,
                    descriptor_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::MethodHandle as u8 => ConstantPool::MethodHandle {
                    reference_kind: cursor.read_u8().map_err(truncated)?,
                    reference_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::MethodType as u8 => ConstantPool::MethodType {
                    descriptor_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::Dynamic as u8 => ConstantPool::Dynamic {
                    bootstrap_method_attr_index: cursor.read_u16::<BE>().map_err(truncated)?,
                    name_and_type_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::InvokeDynamic as u8 => ConstantPool::InvokeDynamic {
                    bootstrap_method_attr_index: cursor.read_u16::<BE>().map_err(truncated)?,
                    name_and_type_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::Module as u8 => ConstantPool::Module {
                    name_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                t if t == Tags::Package as u8 => ConstantPool::Package {
                    name_index: cursor.read_u16::<BE>().map_err(truncated)?,
                },
                other => {
                    return Err(LoadingError::new(
                        LoadingCause::InvalidConstantTag(other),
                        &format!("at pool entry {}", entries.len()),
                    ))
                }
            };
            let two_slots = matches!(
                entry,
                ConstantPool::Long { .. } | ConstantPool::Double { .. }
            );
            entries.push(entry);
            if two_slots {
                entries.push(ConstantPool::Unusable);
            }
        }
        Ok(Pool { entries })
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), WritingError> {
        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for entry in self.entries.iter().skip(1) {
            match entry {
                ConstantPool::Unusable => {}
                ConstantPool::Utf8(utf8) => {
                    out.push(Tags::Utf8 as u8);
                    out.extend_from_slice(&(utf8.bytes.len() as u16).to_be_bytes());
                    out.extend_from_slice(&utf8.bytes);
                }
                ConstantPool::Integer(bytes) => {
                    out.push(Tags::Integer as u8);
                    out.extend_from_slice(&bytes.to_be_bytes());
                }
                ConstantPool::Float(bytes) => {
                    out.push(Tags::Float as u8);
                    out.extend_from_slice(&bytes.to_be_bytes());
                }
                ConstantPool::Long { high, low } => {
                    out.push(Tags::Long as u8);
                    out.extend_from_slice(&high.to_be_bytes());
                    out.extend_from_slice(&low.to_be_bytes());
                }
                ConstantPool::Double { high, low } => {
                    out.push(Tags::Double as u8);
                    out.extend_from_slice(&high.to_be_bytes());
                    out.extend_from_slice(&low.to_be_bytes());
                }
                ConstantPool::Class { name_index } => {
                    out.push(Tags::Class as u8);
                    out.extend_from_slice(&name_index.to_be_bytes());
                }
                ConstantPool::String { string_index } => {
                    out.push(Tags::String as u8);
                    out.extend_from_slice(&string_index.to_be_bytes());
                }
                ConstantPool::Fieldref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.push(Tags::Fieldref as u8);
                    out.extend_from_slice(&class_index.to_be_bytes());
                    out.extend_from_slice(&name_and_type_index.to_be_bytes());
                }
                ConstantPool::Methodref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.push(Tags::Methodref as u8);
                    out.extend_from_slice(&class_index.to_be_bytes());
                    out.extend_from_slice(&name_and_type_index.to_be_bytes());
                }
                ConstantPool::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.push(Tags::InterfaceMethodref as u8);
                    out.extend_from_slice(&class_index.to_be_bytes());
                    out.extend_from_slice(&name_and_type_index.to_be_bytes());
                }
                ConstantPool::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    out.push(Tags::NameAndType as u8);
                    out.extend_from_slice(&name_index.to_be_bytes());
                    out.extend_from_slice(&descriptor_index.to_be_bytes());
                }
                ConstantPool::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    out.push(Tags::MethodHandle as u8);
                    out.push(*reference_kind);
                    out.extend_from_slice(&reference_index.to_be_bytes());
                }
                ConstantPool::MethodType { descriptor_index } => {
                    out.push(Tags::MethodType as u8);
                    out.extend_from_slice(&descriptor_index.to_be_bytes());
                }
                ConstantPool::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    out.push(Tags::Dynamic as u8);
                    out.extend_from_slice(&bootstrap_method_attr_index.to_be_bytes());
                    out.extend_from_slice(&name_and_type_index.to_be_bytes());
                }
                ConstantPool::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    out.push(Tags::InvokeDynamic as u8);
                    out.extend_from_slice(&bootstrap_method_attr_index.to_be_bytes());
                    out.extend_from_slice(&name_and_type_index.to_be_bytes());
                }
                ConstantPool::Module { name_index } => {
                    out.push(Tags::Module as u8);
                    out.extend_from_slice(&name_index.to_be_bytes());
                }
                ConstantPool::Package { name_index } => {
                    out.push(Tags::Package as u8);
                    out.extend_from_slice(&name_index.to_be_bytes());
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, index: u16) -> Option<&ConstantPool> {
        self.entries.get(index as usize)
    }

    pub fn utf8(&self, index: u16) -> Option<String> {
        match self.get(index)? {
            ConstantPool::Utf8(utf8) => Some(String::from(utf8)),
            _ => None,
        }
    }

    pub fn class_name(&self, index: u16) -> Option<String> {
        match self.get(index)? {
            ConstantPool::Class { name_index } => self.utf8(*name_index),
            _ => None,
        }
    }

    pub fn string_value(&self, index: u16) -> Option<String> {
        match self.get(index)? {
            ConstantPool::String { string_index } => self.utf8(*string_index),
            _ => None,
        }
    }

    pub fn name_and_type(&self, index: u16) -> Option<(String, String)> {
        match self.get(index)? {
            ConstantPool::NameAndType {
                name_index,
                descriptor_index,
            } => Some((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => None,
        }
    }

    /// Resolves any field/method/interface-method reference to
    /// `(owner, name, descriptor)`.
    pub fn member_ref(&self, index: u16) -> Option<(String, String, String)> {
        let (class_index, name_and_type_index) = match self.get(index)? {
            ConstantPool::Fieldref {
                class_index,
                name_and_type_index,
            }
            | ConstantPool::Methodref {
                class_index,
                name_and_type_index,
            }
            | ConstantPool::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index),
            _ => return None,
        };
        let owner = self.class_name(class_index)?;
        let (name, descriptor) = self.name_and_type(name_and_type_index)?;
        Some((owner, name, descriptor))
    }

    pub fn long_value(&self, index: u16) -> Option<i64> {
        match self.get(index)? {
            ConstantPool::Long { high, low } => {
                Some(((*high as u64) << 32 | *low as u64) as i64)
            }
            _ => None,
        }
    }

    fn push(&mut self, entry: ConstantPool) -> Result<u16, WritingError> {
        if self.entries.is_empty() {
            self.entries.push(ConstantPool::Unusable);
        }
        let index = self.entries.len();
        if index >= u16::MAX as usize {
            return Err(WritingError::new(
                WritingCause::ConstantPoolOverflow,
                "more than 65534 pool entries",
            ));
        }
        let two_slots = matches!(
            entry,
            ConstantPool::Long { .. } | ConstantPool::Double { .. }
        );
        self.entries.push(entry);
        if two_slots {
            self.entries.push(ConstantPool::Unusable);
        }
        Ok(index as u16)
    }

    fn find(&self, wanted: &ConstantPool) -> Option<u16> {
        self.entries
            .iter()
            .position(|entry| entry == wanted)
            .map(|index| index as u16)
    }

    fn ensure(&mut self, entry: ConstantPool) -> Result<u16, WritingError> {
        match self.find(&entry) {
            Some(index) => Ok(index),
            None => self.push(entry),
        }
    }

    pub fn ensure_utf8(&mut self, value: &str) -> Result<u16, WritingError> {
        self.ensure(ConstantPool::Utf8(Utf8::from(value)))
    }

    pub fn ensure_class(&mut self, name: &str) -> Result<u16, WritingError> {
        let name_index = self.ensure_utf8(name)?;
        self.ensure(ConstantPool::Class { name_index })
    }

    pub fn ensure_string(&mut self, value: &str) -> Result<u16, WritingError> {
        let string_index = self.ensure_utf8(value)?;
        self.ensure(ConstantPool::String { string_index })
    }

    pub fn ensure_name_and_type(
        &mut self,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, WritingError> {
        let name_index = self.ensure_utf8(name)?;
        let descriptor_index = self.ensure_utf8(descriptor)?;
        self.ensure(ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn ensure_fieldref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, WritingError> {
        let class_index = self.ensure_class(owner)?;
        let name_and_type_index = self.ensure_name_and_type(name, descriptor)?;
        self.ensure(ConstantPool::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn ensure_methodref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, WritingError> {
        let class_index = self.ensure_class(owner)?;
        let name_and_type_index = self.ensure_name_and_type(name, descriptor)?;
        self.ensure(ConstantPool::Methodref {
            class_index,
            name_and_type_index,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn long_entries_take_two_slots() {
        let mut pool = Pool::default();
        let long_index = pool.push(ConstantPool::Long { high: 0, low: 7 }).unwrap();
        let next = pool.ensure_utf8("after").unwrap();
        assert_eq!(long_index, 1);
        assert_eq!(next, 3);
        assert_eq!(pool.long_value(long_index), Some(7));
    }

    #[test]
    fn ensure_interns_existing_entries() {
        let mut pool = Pool::default();
        let first = pool.ensure_fieldref("pkg/Owner", "value", "I").unwrap();
        let second = pool.ensure_fieldref("pkg/Owner", "value", "I").unwrap();
        assert_eq!(first, second);
        assert_eq!(
            pool.member_ref(first),
            Some(("pkg/Owner".into(), "value".into(), "I".into()))
        );
    }

    #[test]
    fn round_trip_through_bytes() {
        let mut pool = Pool::default();
        pool.ensure_class("pkg/Thing").unwrap();
        pool.ensure_string("hello").unwrap();
        let mut out = Vec::new();
        pool.write(&mut out).unwrap();
        let parsed = Pool::read(&mut Cursor::new(out.as_slice())).unwrap();
        assert_eq!(parsed, pool);
    }
}
