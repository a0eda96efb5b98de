//! Structured view over a parsed class file.
//!
//! Detection works on two projections of each method: the typed
//! instruction list and a pre-rendered textual disassembly used for
//! substring predicates. The rendering is a contract:
//!
//! - string operands appear inside paired double quotes,
//! - field references render as `OWNER.NAME : DESC`,
//! - method references render as `OWNER.NAME (ARGS)RET`.
//!
//! Changing any of those shapes silently breaks pattern detection, so
//! they are pinned by unit tests below.

use jclass::attributes::AttributeInfo;
use jclass::class_file::ClassFile;
use jclass::code::{CodeBody, CodeItem, Operand};
use jclass::constants::ConstantPool;
use jclass::opcodes::{self as op, mnemonic};

use crate::errors::parse::ParseError;

#[derive(Debug, Clone)]
pub struct FieldView {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    /// Position in `ClassFile::fields`.
    pub field_index: usize,
}

#[derive(Debug, Clone)]
pub struct InsnView {
    pub opcode: u8,
    pub mnemonic: &'static str,
    pub detail: String,
    /// Position in the owning method's `CodeBody::items`.
    pub item_index: usize,
}

impl InsnView {
    pub fn render(&self) -> String {
        if self.detail.is_empty() {
            self.mnemonic.to_string()
        } else {
            format!("{} {}", self.mnemonic, self.detail)
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerView {
    /// Indices into `MethodView::instructions`; `end` is exclusive and
    /// may equal the instruction count.
    pub start: usize,
    pub end: usize,
    pub handler: usize,
    pub catch_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MethodView {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    pub instructions: Vec<InsnView>,
    pub handlers: Vec<HandlerView>,
    /// Pre-rendered disassembly, one instruction per line.
    pub text: String,
    /// Position in `ClassFile::methods`.
    pub method_index: usize,
}

impl MethodView {
    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }
}

#[derive(Debug, Clone)]
pub struct ClassView {
    /// Internal (slash-separated) name.
    pub name: String,
    pub fields: Vec<FieldView>,
    pub methods: Vec<MethodView>,
    pub nested_classes: Vec<String>,
    pub class: ClassFile,
}

impl ClassView {
    pub fn parse(bytes: &[u8]) -> Result<ClassView, ParseError> {
        let class = ClassFile::from_bytes(bytes)
            .map_err(|error| ParseError::new("<unknown>", error.to_string()))?;
        ClassView::of(class)
    }

    pub fn of(class: ClassFile) -> Result<ClassView, ParseError> {
        let name = class
            .class_name()
            .ok_or_else(|| ParseError::new("<unknown>", "this_class unresolvable".into()))?;

        let mut fields = Vec::with_capacity(class.fields.len());
        for (field_index, field) in class.fields.iter().enumerate() {
            let field_name = class.pool.utf8(field.name_index).ok_or_else(|| {
                ParseError::new(&name, format!("field {field_index} name unresolvable"))
            })?;
            let descriptor = class.pool.utf8(field.descriptor_index).ok_or_else(|| {
                ParseError::new(&name, format!("field {field_name} descriptor unresolvable"))
            })?;
            fields.push(FieldView {
                name: field_name,
                descriptor,
                access_flags: field.access_flags,
                field_index,
            });
        }

        let mut methods = Vec::with_capacity(class.methods.len());
        for (method_index, method) in class.methods.iter().enumerate() {
            let method_name = class.pool.utf8(method.name_index).ok_or_else(|| {
                ParseError::new(&name, format!("method {method_index} name unresolvable"))
            })?;
            let descriptor = class.pool.utf8(method.descriptor_index).ok_or_else(|| {
                ParseError::new(&name, format!("method {method_name} descriptor unresolvable"))
            })?;
            let (instructions, handlers, text) = match method.code() {
                Some(body) => render_method(&class, body),
                None => (Vec::new(), Vec::new(), String::new()),
            };
            methods.push(MethodView {
                name: method_name,
                descriptor,
                access_flags: method.access_flags,
                instructions,
                handlers,
                text,
                method_index,
            });
        }

        let mut nested_classes = Vec::new();
        for attribute in &class.attributes {
            if let AttributeInfo::InnerClasses(entries) = attribute {
                for entry in entries {
                    if let Some(inner) = class.pool.class_name(entry.inner_class_info) {
                        nested_classes.push(inner);
                    }
                }
            }
        }

        Ok(ClassView {
            name,
            fields,
            methods,
            nested_classes,
            class,
        })
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldView> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn method_named(&self, name: &str) -> Option<&MethodView> {
        self.methods.iter().find(|method| method.name == name)
    }

    pub fn static_initializer(&self) -> Option<&MethodView> {
        self.method_named("<clinit>")
    }
}

fn render_detail(class: &ClassFile, opcode: u8, operand: &Operand) -> String {
    let pool = &class.pool;
    match operand {
        Operand::None => String::new(),
        Operand::Var(var) => var.to_string(),
        Operand::Byte(value) => value.to_string(),
        Operand::Short(value) => value.to_string(),
        Operand::ArrayType(tag) => tag.to_string(),
        Operand::Iinc { var, delta } => format!("{var} {delta}"),
        Operand::Jump(target) => format!("L{target}"),
        Operand::TableSwitch {
            default, low, high, ..
        } => format!("[{low}..{high}] default L{default}"),
        Operand::LookupSwitch { default, pairs } => {
            format!("{} cases default L{default}", pairs.len())
        }
        Operand::CpDims { index, dims } => match pool.class_name(*index) {
            Some(name) => format!("{name} dims {dims}"),
            None => format!("#{index} dims {dims}"),
        },
        Operand::CpCount { index, .. } => {
            if opcode == op::INVOKEDYNAMIC {
                match pool.get(*index) {
                    Some(ConstantPool::InvokeDynamic {
                        name_and_type_index,
                        ..
                    }) => match pool.name_and_type(*name_and_type_index) {
                        Some((name, descriptor)) => format!("{name} {descriptor}"),
                        None => format!("#{index}"),
                    },
                    _ => format!("#{index}"),
                }
            } else {
                match pool.member_ref(*index) {
                    Some((owner, name, descriptor)) => format!("{owner}.{name} {descriptor}"),
                    None => format!("#{index}"),
                }
            }
        }
        Operand::Cp(index) => match opcode {
            op::GETSTATIC | op::PUTSTATIC | op::GETFIELD | op::PUTFIELD => {
                match pool.member_ref(*index) {
                    Some((owner, name, descriptor)) => format!("{owner}.{name} : {descriptor}"),
                    None => format!("#{index}"),
                }
            }
            op::INVOKEVIRTUAL | op::INVOKESPECIAL | op::INVOKESTATIC => {
                match pool.member_ref(*index) {
                    Some((owner, name, descriptor)) => format!("{owner}.{name} {descriptor}"),
                    None => format!("#{index}"),
                }
            }
            op::NEW | op::ANEWARRAY | op::CHECKCAST | op::INSTANCEOF => {
                match pool.class_name(*index) {
                    Some(name) => name,
                    None => format!("#{index}"),
                }
            }
            op::LDC | op::LDC2_W => match pool.get(*index) {
                Some(ConstantPool::String { .. }) => match pool.string_value(*index) {
                    Some(value) => format!("\"{value}\""),
                    None => format!("#{index}"),
                },
                Some(ConstantPool::Class { name_index }) => match pool.utf8(*name_index) {
                    Some(name) => format!("{name}.class"),
                    None => format!("#{index}"),
                },
                Some(ConstantPool::Integer(bits)) => (*bits as i32).to_string(),
                Some(ConstantPool::Float(bits)) => f32::from_bits(*bits).to_string(),
                Some(ConstantPool::Long { .. }) => match pool.long_value(*index) {
                    Some(value) => format!("{value}L"),
                    None => format!("#{index}"),
                },
                Some(ConstantPool::Double { high, low }) => {
                    f64::from_bits(((*high as u64) << 32) | *low as u64).to_string()
                }
                _ => format!("#{index}"),
            },
            _ => format!("#{index}"),
        },
    }
}

fn render_method(
    class: &ClassFile,
    body: &CodeBody,
) -> (Vec<InsnView>, Vec<HandlerView>, String) {
    let mut instructions = Vec::new();
    let mut text = String::new();
    for (item_index, item) in body.items.iter().enumerate() {
        match item {
            CodeItem::Label(label) => {
                text.push_str(&format!("L{label}:\n"));
            }
            CodeItem::Insn(insn) => {
                let view = InsnView {
                    opcode: insn.opcode,
                    mnemonic: mnemonic(insn.opcode),
                    detail: render_detail(class, insn.opcode, &insn.operand),
                    item_index,
                };
                text.push_str(&view.render());
                text.push('\n');
                instructions.push(view);
            }
        }
    }

    // Handler boundaries as instruction ordinals. A label placed at the
    // very end of the code maps to the instruction count.
    let ordinal_of_label = |label: jclass::code::Label| -> usize {
        let mut ordinal = 0;
        for item in &body.items {
            match item {
                CodeItem::Label(l) if *l == label => return ordinal,
                CodeItem::Insn(_) => ordinal += 1,
                _ => {}
            }
        }
        ordinal
    };
    let handlers = body
        .handlers
        .iter()
        .map(|handler| HandlerView {
            start: ordinal_of_label(handler.start),
            end: ordinal_of_label(handler.end),
            handler: ordinal_of_label(handler.handler),
            catch_type: if handler.catch_type == 0 {
                None
            } else {
                class.pool.class_name(handler.catch_type)
            },
        })
        .collect();

    (instructions, handlers, text)
}

#[cfg(test)]
mod test {
    use super::*;
    use jclass::code::Insn;
    use jclass::constants::Pool;

    fn empty_class(name: &str) -> ClassFile {
        let mut pool = Pool::default();
        let this_class = pool.ensure_class(name).unwrap();
        let super_class = pool.ensure_class("java/lang/Object").unwrap();
        ClassFile {
            minor_version: 0,
            major_version: 61,
            pool,
            access_flags: 0x0021,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            attributes: vec![],
        }
    }

    #[test]
    fn field_refs_render_with_colon() {
        let mut class = empty_class("pkg/Render");
        let index = class
            .pool
            .ensure_fieldref("scala/runtime/LazyVals$", "MODULE$", "Lscala/runtime/LazyVals$;")
            .unwrap();
        let detail = render_detail(&class, op::GETSTATIC, &Operand::Cp(index));
        assert_eq!(
            detail,
            "scala/runtime/LazyVals$.MODULE$ : Lscala/runtime/LazyVals$;"
        );
    }

    #[test]
    fn method_refs_render_with_descriptor_after_space() {
        let mut class = empty_class("pkg/Render");
        let index = class
            .pool
            .ensure_methodref(
                "scala/runtime/LazyVals$",
                "getOffset",
                "(Ljava/lang/Class;Ljava/lang/String;)J",
            )
            .unwrap();
        let detail = render_detail(&class, op::INVOKEVIRTUAL, &Operand::Cp(index));
        assert_eq!(
            detail,
            "scala/runtime/LazyVals$.getOffset (Ljava/lang/Class;Ljava/lang/String;)J"
        );
        assert!(detail.contains("LazyVals$.getOffset ("));
    }

    #[test]
    fn strings_render_quoted() {
        let mut class = empty_class("pkg/Render");
        let index = class.pool.ensure_string("value$lzy1").unwrap();
        let detail = render_detail(&class, op::LDC, &Operand::Cp(index));
        assert_eq!(detail, "\"value$lzy1\"");
    }

    #[test]
    fn class_literals_render_with_suffix() {
        let mut class = empty_class("pkg/Render");
        let index = class.pool.ensure_class("pkg/Render$").unwrap();
        let detail = render_detail(&class, op::LDC, &Operand::Cp(index));
        assert_eq!(detail, "pkg/Render$.class");
    }

    #[test]
    fn insn_render_joins_mnemonic_and_detail() {
        let class = empty_class("pkg/Render");
        let insn = Insn::var(op::ALOAD, 0);
        let detail = render_detail(&class, insn.opcode, &insn.operand);
        assert_eq!(detail, "0");
    }
}
