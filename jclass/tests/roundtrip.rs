use std::error::Error;

use jclass::access_flags::{FieldAccessFlags, MethodAccessFlags};
use jclass::attributes::AttributeInfo;
use jclass::class_file::{ClassFile, ClassHeader, FieldInfo, MethodInfo};
use jclass::code::{CodeBody, CodeItem, Insn, Operand};
use jclass::constants::Pool;
use jclass::frames::{self, ObjectResolver};
use jclass::opcodes as op;

fn sample_class() -> Result<ClassFile, Box<dyn Error>> {
    let mut pool = Pool::default();
    let this_class = pool.ensure_class("pkg/Sample")?;
    let super_class = pool.ensure_class("java/lang/Object")?;
    let field_name = pool.ensure_utf8("count")?;
    let field_descriptor = pool.ensure_utf8("I")?;
    let method_name = pool.ensure_utf8("pick")?;
    let method_descriptor = pool.ensure_utf8("(Z)I")?;

    let mut body = CodeBody::new();
    let other = body.new_label();
    body.items = vec![
        CodeItem::Insn(Insn::var(op::ILOAD, 1)),
        CodeItem::Insn(Insn::jump(op::IFEQ, other)),
        CodeItem::Insn(Insn::simple(op::ICONST_1)),
        CodeItem::Insn(Insn::simple(op::IRETURN)),
        CodeItem::Label(other),
        CodeItem::Insn(Insn::simple(op::ICONST_0)),
        CodeItem::Insn(Insn::simple(op::IRETURN)),
    ];
    body.max_stack = 1;
    body.max_locals = 2;

    Ok(ClassFile {
        minor_version: 0,
        major_version: 61,
        pool,
        access_flags: 0x0021,
        this_class,
        super_class,
        interfaces: vec![],
        fields: vec![FieldInfo {
            access_flags: FieldAccessFlags::to_u16(&[
                FieldAccessFlags::AccPrivate,
                FieldAccessFlags::AccVolatile,
            ]),
            name_index: field_name,
            descriptor_index: field_descriptor,
            attributes: vec![],
        }],
        methods: vec![MethodInfo {
            access_flags: MethodAccessFlags::to_u16(&[MethodAccessFlags::AccPublic]),
            name_index: method_name,
            descriptor_index: method_descriptor,
            attributes: vec![AttributeInfo::Code(body)],
        }],
        attributes: vec![],
    })
}

#[test]
fn class_survives_serialize_and_reparse() -> Result<(), Box<dyn Error>> {
    let mut class = sample_class()?;
    let mut body = match &mut class.methods[0].attributes[0] {
        AttributeInfo::Code(body) => body.clone(),
        _ => unreachable!(),
    };
    frames::compute_frames(
        "pkg/Sample",
        "pick",
        false,
        "(Z)I",
        &mut class.pool,
        &mut body,
        &ObjectResolver,
    )?;
    class.methods[0].attributes[0] = AttributeInfo::Code(body);

    let bytes = class.to_bytes()?;
    let reparsed = ClassFile::from_bytes(&bytes)?;
    assert_eq!(reparsed.class_name().as_deref(), Some("pkg/Sample"));
    assert_eq!(reparsed.super_name().as_deref(), Some("java/lang/Object"));
    assert_eq!(reparsed.fields.len(), 1);
    assert_eq!(
        reparsed.pool.utf8(reparsed.fields[0].name_index).as_deref(),
        Some("count")
    );

    let method = &reparsed.methods[0];
    let body = method.code().expect("method keeps its code");
    // One branch target, so exactly one stack-map frame.
    assert_eq!(body.stack_map.len(), 1);
    assert_eq!(body.max_stack, 1);
    assert_eq!(body.max_locals, 2);

    // A second serialize from the reparsed model is byte-identical.
    let mut reparsed = reparsed;
    let again = reparsed.to_bytes()?;
    assert_eq!(again, bytes);
    Ok(())
}

#[test]
fn header_parse_stops_at_interfaces() -> Result<(), Box<dyn Error>> {
    let mut class = sample_class()?;
    let bytes = class.to_bytes()?;
    let header = ClassHeader::from_bytes(&bytes)?;
    assert_eq!(header.name, "pkg/Sample");
    assert_eq!(header.super_name.as_deref(), Some("java/lang/Object"));
    assert!(!header.is_interface());
    Ok(())
}

#[test]
fn rejects_non_class_bytes() {
    assert!(ClassFile::from_bytes(&[0xde, 0xad, 0xbe, 0xef, 0, 0]).is_err());
}
