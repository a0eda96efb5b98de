//! [Attributes](https://docs.oracle.com/javase/specs/jvms/se17/jvms17.pdf)
//!
//! Only the attributes the rewriter edits are parsed into structure:
//! `Code` (instructions, exception table, stack map, line numbers) and
//! `InnerClasses`. Everything else round-trips as raw bytes under its
//! original name index — the pool is only ever appended to, so stored
//! indices stay valid.

use std::io::{Cursor, Read};

use byteorder::{ReadBytesExt, BE};

use crate::code::{self, CodeBody, ExceptionHandler, LocalVarEntry};
use crate::constants::Pool;
use crate::errors::class_loading::{LoadingCause, LoadingError};
use crate::errors::class_writing::WritingError;

#[derive(Clone, Debug, PartialEq)]
pub struct RawAttribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InnerClassEntry {
    pub inner_class_info: u16,
    pub outer_class_info: u16,
    pub inner_name: u16,
    pub access_flags: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttributeInfo {
    Code(CodeBody),
    InnerClasses(Vec<InnerClassEntry>),
    Raw(RawAttribute),
}

fn truncated(_: std::io::Error) -> LoadingError {
    LoadingError::new(LoadingCause::TruncatedCode, "attribute table ends early")
}

pub fn read_attributes(
    pool: &Pool,
    cursor: &mut Cursor<&[u8]>,
) -> Result<Vec<AttributeInfo>, LoadingError> {
    let count = cursor.read_u16::<BE>().map_err(truncated)?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = cursor.read_u16::<BE>().map_err(truncated)?;
        let length = cursor.read_u32::<BE>().map_err(truncated)?;
        let mut info = vec![0u8; length as usize];
        cursor.read_exact(&mut info).map_err(truncated)?;
        let attribute = match pool.utf8(name_index).as_deref() {
            Some("Code") => AttributeInfo::Code(read_code(pool, &info)?),
            Some("InnerClasses") => AttributeInfo::InnerClasses(read_inner_classes(&info)?),
            _ => AttributeInfo::Raw(RawAttribute { name_index, info }),
        };
        attributes.push(attribute);
    }
    Ok(attributes)
}

fn read_inner_classes(info: &[u8]) -> Result<Vec<InnerClassEntry>, LoadingError> {
    let mut cursor = Cursor::new(info);
    let count = cursor.read_u16::<BE>().map_err(truncated)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(InnerClassEntry {
            inner_class_info: cursor.read_u16::<BE>().map_err(truncated)?,
            outer_class_info: cursor.read_u16::<BE>().map_err(truncated)?,
            inner_name: cursor.read_u16::<BE>().map_err(truncated)?,
            access_flags: cursor.read_u16::<BE>().map_err(truncated)?,
        });
    }
    Ok(entries)
}

fn read_code(pool: &Pool, info: &[u8]) -> Result<CodeBody, LoadingError> {
    let mut cursor = Cursor::new(info);
    let max_stack = cursor.read_u16::<BE>().map_err(truncated)?;
    let max_locals = cursor.read_u16::<BE>().map_err(truncated)?;
    let code_length = cursor.read_u32::<BE>().map_err(truncated)?;
    let mut code_bytes = vec![0u8; code_length as usize];
    cursor.read_exact(&mut code_bytes).map_err(truncated)?;
    let (mut body, mut offsets, insn_offsets) =
        CodeBody::from_raw_code(max_stack, max_locals, &code_bytes)?;

    let handler_count = cursor.read_u16::<BE>().map_err(truncated)?;
    for _ in 0..handler_count {
        let start_pc = cursor.read_u16::<BE>().map_err(truncated)? as u32;
        let end_pc = cursor.read_u16::<BE>().map_err(truncated)? as u32;
        let handler_pc = cursor.read_u16::<BE>().map_err(truncated)? as u32;
        let catch_type = cursor.read_u16::<BE>().map_err(truncated)?;
        let start = body.label_for_offset(&mut offsets, &insn_offsets, start_pc, code_length)?;
        let end = body.label_for_offset(&mut offsets, &insn_offsets, end_pc, code_length)?;
        let handler =
            body.label_for_offset(&mut offsets, &insn_offsets, handler_pc, code_length)?;
        body.handlers.push(ExceptionHandler {
            start,
            end,
            handler,
            catch_type,
        });
    }

    let attribute_count = cursor.read_u16::<BE>().map_err(truncated)?;
    for _ in 0..attribute_count {
        let name_index = cursor.read_u16::<BE>().map_err(truncated)?;
        let length = cursor.read_u32::<BE>().map_err(truncated)?;
        let mut sub_info = vec![0u8; length as usize];
        cursor.read_exact(&mut sub_info).map_err(truncated)?;
        match pool.utf8(name_index).as_deref() {
            Some("StackMapTable") => {
                let parsed = {
                    let mut label_of = |offset: u32| {
                        body.label_for_offset(&mut offsets, &insn_offsets, offset, code_length)
                    };
                    code::read_stack_map(&sub_info, &mut label_of)?
                };
                body.stack_map = parsed;
            }
            Some("LineNumberTable") => {
                let mut sub = Cursor::new(sub_info.as_slice());
                let entries = sub.read_u16::<BE>().map_err(truncated)?;
                for _ in 0..entries {
                    let start_pc = sub.read_u16::<BE>().map_err(truncated)? as u32;
                    let line = sub.read_u16::<BE>().map_err(truncated)?;
                    let at =
                        body.label_for_offset(&mut offsets, &insn_offsets, start_pc, code_length)?;
                    body.line_numbers.push((at, line));
                }
            }
            Some(table @ ("LocalVariableTable" | "LocalVariableTypeTable")) => {
                let is_type_table = table == "LocalVariableTypeTable";
                let mut sub = Cursor::new(sub_info.as_slice());
                let entries = sub.read_u16::<BE>().map_err(truncated)?;
                for _ in 0..entries {
                    let start_pc = sub.read_u16::<BE>().map_err(truncated)? as u32;
                    let length = sub.read_u16::<BE>().map_err(truncated)? as u32;
                    let name_index = sub.read_u16::<BE>().map_err(truncated)?;
                    let descriptor_index = sub.read_u16::<BE>().map_err(truncated)?;
                    let slot = sub.read_u16::<BE>().map_err(truncated)?;
                    let start =
                        body.label_for_offset(&mut offsets, &insn_offsets, start_pc, code_length)?;
                    let end = body.label_for_offset(
                        &mut offsets,
                        &insn_offsets,
                        start_pc + length,
                        code_length,
                    )?;
                    let entry = LocalVarEntry {
                        start,
                        end,
                        name_index,
                        descriptor_index,
                        slot,
                    };
                    if is_type_table {
                        body.local_var_types.push(entry);
                    } else {
                        body.local_vars.push(entry);
                    }
                }
            }
            _ => body.other_attributes.push((name_index, sub_info)),
        }
    }
    Ok(body)
}

fn write_raw(out: &mut Vec<u8>, name_index: u16, payload: &[u8]) {
    out.extend_from_slice(&name_index.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

fn write_code(pool: &mut Pool, body: &CodeBody, out: &mut Vec<u8>) -> Result<(), WritingError> {
    let (label_offsets, _, code_length) = body.layout()?;
    let code_bytes = body.serialize_insns(&label_offsets)?;

    let mut payload: Vec<u8> = Vec::new();
    payload.extend_from_slice(&body.max_stack.to_be_bytes());
    payload.extend_from_slice(&body.max_locals.to_be_bytes());
    payload.extend_from_slice(&code_length.to_be_bytes());
    payload.extend_from_slice(&code_bytes);
    payload.extend_from_slice(&(body.handlers.len() as u16).to_be_bytes());
    for handler in &body.handlers {
        let start = CodeBody::resolve_label(&label_offsets, handler.start)?;
        let end = CodeBody::resolve_label(&label_offsets, handler.end)?;
        let target = CodeBody::resolve_label(&label_offsets, handler.handler)?;
        payload.extend_from_slice(&(start as u16).to_be_bytes());
        payload.extend_from_slice(&(end as u16).to_be_bytes());
        payload.extend_from_slice(&(target as u16).to_be_bytes());
        payload.extend_from_slice(&handler.catch_type.to_be_bytes());
    }

    let mut sub_attributes: Vec<(u16, Vec<u8>)> = Vec::new();
    if !body.line_numbers.is_empty() {
        let mut table = Vec::new();
        table.extend_from_slice(&(body.line_numbers.len() as u16).to_be_bytes());
        for (at, line) in &body.line_numbers {
            let offset = CodeBody::resolve_label(&label_offsets, *at)?;
            table.extend_from_slice(&(offset as u16).to_be_bytes());
            table.extend_from_slice(&line.to_be_bytes());
        }
        sub_attributes.push((pool.ensure_utf8("LineNumberTable")?, table));
    }
    for (name, entries) in [
        ("LocalVariableTable", &body.local_vars),
        ("LocalVariableTypeTable", &body.local_var_types),
    ] {
        if entries.is_empty() {
            continue;
        }
        let mut table = Vec::new();
        table.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        for entry in entries {
            let start = CodeBody::resolve_label(&label_offsets, entry.start)?;
            let end = CodeBody::resolve_label(&label_offsets, entry.end)?;
            table.extend_from_slice(&(start as u16).to_be_bytes());
            table.extend_from_slice(&((end - start) as u16).to_be_bytes());
            table.extend_from_slice(&entry.name_index.to_be_bytes());
            table.extend_from_slice(&entry.descriptor_index.to_be_bytes());
            table.extend_from_slice(&entry.slot.to_be_bytes());
        }
        sub_attributes.push((pool.ensure_utf8(name)?, table));
    }
    if !body.stack_map.is_empty() {
        let table = code::write_stack_map(&body.stack_map, &label_offsets)?;
        sub_attributes.push((pool.ensure_utf8("StackMapTable")?, table));
    }
    for (name_index, info) in &body.other_attributes {
        sub_attributes.push((*name_index, info.clone()));
    }

    payload.extend_from_slice(&(sub_attributes.len() as u16).to_be_bytes());
    for (name_index, info) in &sub_attributes {
        write_raw(&mut payload, *name_index, info);
    }

    let name_index = pool.ensure_utf8("Code")?;
    write_raw(out, name_index, &payload);
    Ok(())
}

pub fn write_attributes(
    pool: &mut Pool,
    attributes: &[AttributeInfo],
    out: &mut Vec<u8>,
) -> Result<(), WritingError> {
    out.extend_from_slice(&(attributes.len() as u16).to_be_bytes());
    for attribute in attributes {
        match attribute {
            AttributeInfo::Code(body) => write_code(pool, body, out)?,
            AttributeInfo::InnerClasses(entries) => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&(entries.len() as u16).to_be_bytes());
                for entry in entries {
                    payload.extend_from_slice(&entry.inner_class_info.to_be_bytes());
                    payload.extend_from_slice(&entry.outer_class_info.to_be_bytes());
                    payload.extend_from_slice(&entry.inner_name.to_be_bytes());
                    payload.extend_from_slice(&entry.access_flags.to_be_bytes());
                }
                let name_index = pool.ensure_utf8("InnerClasses")?;
                write_raw(out, name_index, &payload);
            }
            AttributeInfo::Raw(raw) => write_raw(out, raw.name_index, &raw.info),
        }
    }
    Ok(())
}
