//! [Class File Format](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf)

use std::io::Cursor;

use byteorder::{ReadBytesExt, BE};

use crate::attributes::{self, AttributeInfo};
use crate::constants::Pool;
use crate::errors::class_loading::{LoadingCause, LoadingError};
use crate::errors::class_writing::WritingError;

const MAGIC: u32 = 0xCAFEBABE;

#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

impl MethodInfo {
    pub fn code(&self) -> Option<&crate::code::CodeBody> {
        self.attributes.iter().find_map(|attribute| match attribute {
            AttributeInfo::Code(body) => Some(body),
            _ => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut crate::code::CodeBody> {
        self.attributes
            .iter_mut()
            .find_map(|attribute| match attribute {
                AttributeInfo::Code(body) => Some(body),
                _ => None,
            })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub pool: Pool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<AttributeInfo>,
}

fn truncated(_: std::io::Error) -> LoadingError {
    LoadingError::new(LoadingCause::TruncatedCode, "class file ends early")
}

impl ClassFile {
    pub fn from_bytes(bytes: &[u8]) -> Result<ClassFile, LoadingError> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_u32::<BE>().map_err(truncated)?;
        if magic != MAGIC {
            return Err(LoadingError::new(
                LoadingCause::IncorrectMagic(magic),
                "not a class file",
            ));
        }
        let minor_version = cursor.read_u16::<BE>().map_err(truncated)?;
        let major_version = cursor.read_u16::<BE>().map_err(truncated)?;
        let pool = Pool::read(&mut cursor)?;
        let access_flags = cursor.read_u16::<BE>().map_err(truncated)?;
        let this_class = cursor.read_u16::<BE>().map_err(truncated)?;
        let super_class = cursor.read_u16::<BE>().map_err(truncated)?;
        let interface_count = cursor.read_u16::<BE>().map_err(truncated)?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(cursor.read_u16::<BE>().map_err(truncated)?);
        }
        let field_count = cursor.read_u16::<BE>().map_err(truncated)?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let access_flags = cursor.read_u16::<BE>().map_err(truncated)?;
            let name_index = cursor.read_u16::<BE>().map_err(truncated)?;
            let descriptor_index = cursor.read_u16::<BE>().map_err(truncated)?;
            let attributes = attributes::read_attributes(&pool, &mut cursor)?;
            fields.push(FieldInfo {
                access_flags,
                name_index,
                descriptor_index,
                attributes,
            });
        }
        let method_count = cursor.read_u16::<BE>().map_err(truncated)?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            let access_flags = cursor.read_u16::<BE>().map_err(truncated)?;
            let name_index = cursor.read_u16::<BE>().map_err(truncated)?;
            let descriptor_index = cursor.read_u16::<BE>().map_err(truncated)?;
            let attributes = attributes::read_attributes(&pool, &mut cursor)?;
            methods.push(MethodInfo {
                access_flags,
                name_index,
                descriptor_index,
                attributes,
            });
        }
        let class_attributes = attributes::read_attributes(&pool, &mut cursor)?;
        if (cursor.position() as usize) < bytes.len() {
            return Err(LoadingError::new(
                LoadingCause::ExtraBytes,
                "class file has leftover bytes",
            ));
        }
        Ok(ClassFile {
            minor_version,
            major_version,
            pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes: class_attributes,
        })
    }

    /// Serializes back to class-file bytes. The tail of the file is
    /// rendered first so attribute writers can intern names into the
    /// pool before the pool itself is emitted.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, WritingError> {
        let mut tail: Vec<u8> = Vec::new();
        tail.extend_from_slice(&self.access_flags.to_be_bytes());
        tail.extend_from_slice(&self.this_class.to_be_bytes());
        tail.extend_from_slice(&self.super_class.to_be_bytes());
        tail.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for interface in &self.interfaces {
            tail.extend_from_slice(&interface.to_be_bytes());
        }
        tail.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        for field in &self.fields {
            tail.extend_from_slice(&field.access_flags.to_be_bytes());
            tail.extend_from_slice(&field.name_index.to_be_bytes());
            tail.extend_from_slice(&field.descriptor_index.to_be_bytes());
            attributes::write_attributes(&mut self.pool, &field.attributes, &mut tail)?;
        }
        tail.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            tail.extend_from_slice(&method.access_flags.to_be_bytes());
            tail.extend_from_slice(&method.name_index.to_be_bytes());
            tail.extend_from_slice(&method.descriptor_index.to_be_bytes());
            attributes::write_attributes(&mut self.pool, &method.attributes, &mut tail)?;
        }
        attributes::write_attributes(&mut self.pool, &self.attributes, &mut tail)?;

        let mut out: Vec<u8> = Vec::with_capacity(tail.len() + 256);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&self.minor_version.to_be_bytes());
        out.extend_from_slice(&self.major_version.to_be_bytes());
        self.pool.write(&mut out)?;
        out.extend_from_slice(&tail);
        Ok(out)
    }

    pub fn class_name(&self) -> Option<String> {
        self.pool.class_name(self.this_class)
    }

    pub fn super_name(&self) -> Option<String> {
        if self.super_class == 0 {
            return None;
        }
        self.pool.class_name(self.super_class)
    }

    pub fn field_name(&self, field: &FieldInfo) -> Option<String> {
        self.pool.utf8(field.name_index)
    }

    pub fn method_name(&self, method: &MethodInfo) -> Option<String> {
        self.pool.utf8(method.name_index)
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|method| {
            self.pool.utf8(method.name_index).as_deref() == Some(name)
                && self.pool.utf8(method.descriptor_index).as_deref() == Some(descriptor)
        })
    }
}

/// The part of a class file the hierarchy resolver needs: name, super
/// name, direct interfaces and the interface flag. Parsing stops right
/// after the interface table.
#[derive(Clone, Debug)]
pub struct ClassHeader {
    pub access_flags: u16,
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
}

impl ClassHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<ClassHeader, LoadingError> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_u32::<BE>().map_err(truncated)?;
        if magic != MAGIC {
            return Err(LoadingError::new(
                LoadingCause::IncorrectMagic(magic),
                "not a class file",
            ));
        }
        cursor.read_u16::<BE>().map_err(truncated)?;
        cursor.read_u16::<BE>().map_err(truncated)?;
        let pool = Pool::read(&mut cursor)?;
        let access_flags = cursor.read_u16::<BE>().map_err(truncated)?;
        let this_class = cursor.read_u16::<BE>().map_err(truncated)?;
        let super_class = cursor.read_u16::<BE>().map_err(truncated)?;
        let interface_count = cursor.read_u16::<BE>().map_err(truncated)?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            let index = cursor.read_u16::<BE>().map_err(truncated)?;
            interfaces.push(pool.class_name(index).ok_or_else(|| {
                LoadingError::new(LoadingCause::InvalidIndex(index), "interface entry")
            })?);
        }
        let name = pool.class_name(this_class).ok_or_else(|| {
            LoadingError::new(LoadingCause::InvalidIndex(this_class), "this_class entry")
        })?;
        let super_name = if super_class == 0 {
            None
        } else {
            Some(pool.class_name(super_class).ok_or_else(|| {
                LoadingError::new(LoadingCause::InvalidIndex(super_class), "super_class entry")
            })?)
        };
        Ok(ClassHeader {
            access_flags,
            name,
            super_name,
            interfaces,
        })
    }

    pub fn is_interface(&self) -> bool {
        crate::access_flags::ClassAccessFlags::is_set(
            self.access_flags,
            crate::access_flags::ClassAccessFlags::AccInterface,
        )
    }
}
