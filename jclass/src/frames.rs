//! Stack-map recomputation for rewritten method bodies.
//!
//! When a patch synthesizes a method body (or splices foreign
//! instructions into one) the original `StackMapTable` is useless. This
//! module re-derives it: a worklist walk over the instruction list
//! simulates the operand stack and local slots, merges states at branch
//! joins and handler entries, and emits a full frame at every jump
//! target. Reference-type joins are delegated to a
//! [`SuperTypeResolver`] so no class ever has to be loaded.

use std::collections::HashMap;

use crate::code::{
    CodeBody, CodeItem, FrameKind, Insn, Label, Operand, StackMapEntry, VerificationType,
};
use crate::constants::{ConstantPool, Pool};
use crate::descriptors;
use crate::errors::class_writing::{WritingCause, WritingError};
use crate::opcodes as op;

/// Answers "what is the most specific common ancestor of two class
/// names". Implementations must never answer by loading classes.
pub trait SuperTypeResolver {
    fn common_superclass(&self, a: &str, b: &str) -> String;
}

const JAVA_LANG_OBJECT: &str = "java/lang/Object";

#[derive(Clone, Debug, PartialEq)]
enum VType {
    Top,
    Int,
    Float,
    Long,
    Double,
    Null,
    UninitThis,
    Ref(String),
    Uninit(Label),
}

impl VType {
    fn is_category2(&self) -> bool {
        matches!(self, VType::Long | VType::Double)
    }

    fn width(&self) -> u16 {
        if self.is_category2() {
            2
        } else {
            1
        }
    }

    fn from_descriptor(descriptor: &str) -> VType {
        match descriptor.as_bytes().first() {
            Some(b'B' | b'C' | b'S' | b'Z' | b'I') => VType::Int,
            Some(b'F') => VType::Float,
            Some(b'J') => VType::Long,
            Some(b'D') => VType::Double,
            Some(b'L') => VType::Ref(descriptor[1..descriptor.len() - 1].to_string()),
            Some(b'[') => VType::Ref(descriptor.to_string()),
            _ => VType::Top,
        }
    }
}

fn err(msg: String) -> WritingError {
    WritingError::new(WritingCause::FrameComputation(msg), "")
}

fn merge(a: &VType, b: &VType, resolver: &dyn SuperTypeResolver) -> VType {
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (VType::Null, VType::Ref(_)) => b.clone(),
        (VType::Ref(_), VType::Null) => a.clone(),
        (VType::Ref(x), VType::Ref(y)) => {
            // Arrays join at Object; precise array covariance is never
            // needed for the frames this tool emits.
            if x.starts_with('[') || y.starts_with('[') {
                VType::Ref(JAVA_LANG_OBJECT.to_string())
            } else {
                VType::Ref(resolver.common_superclass(x, y))
            }
        }
        _ => VType::Top,
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Frame {
    locals: Vec<VType>,
    stack: Vec<VType>,
}

impl Frame {
    fn stack_height(&self) -> u16 {
        self.stack.iter().map(VType::width).sum()
    }

    fn merge_with(&mut self, other: &Frame, resolver: &dyn SuperTypeResolver) -> Result<bool, WritingError> {
        if self.stack.len() != other.stack.len() {
            return Err(err(format!(
                "operand stack height mismatch at join: {} vs {}",
                self.stack.len(),
                other.stack.len()
            )));
        }
        let mut changed = false;
        for (mine, theirs) in self.stack.iter_mut().zip(&other.stack) {
            let joined = merge(mine, theirs, resolver);
            if joined == VType::Top && *mine != VType::Top && *theirs != VType::Top {
                return Err(err("unmergeable operand stack entry".to_string()));
            }
            if joined != *mine {
                *mine = joined;
                changed = true;
            }
        }
        let longest = self.locals.len().max(other.locals.len());
        for slot in 0..longest {
            let theirs = other.locals.get(slot).unwrap_or(&VType::Top);
            let mine = self.locals.get(slot).unwrap_or(&VType::Top).clone();
            let joined = merge(&mine, theirs, resolver);
            if slot >= self.locals.len() {
                self.locals.resize(slot + 1, VType::Top);
            }
            if joined != self.locals[slot] {
                self.locals[slot] = joined;
                changed = true;
            }
        }
        Ok(changed)
    }

    fn pop(&mut self) -> Result<VType, WritingError> {
        self.stack
            .pop()
            .ok_or_else(|| err("pop from empty operand stack".to_string()))
    }

    fn push(&mut self, vtype: VType) {
        self.stack.push(vtype);
    }

    fn store(&mut self, slot: u16, vtype: VType) {
        let wide = vtype.is_category2();
        let needed = slot as usize + if wide { 2 } else { 1 };
        if self.locals.len() < needed {
            self.locals.resize(needed, VType::Top);
        }
        // Overwriting half of a category-2 value invalidates the pair.
        if slot > 0 {
            if let Some(previous) = self.locals.get(slot as usize - 1) {
                if previous.is_category2() {
                    self.locals[slot as usize - 1] = VType::Top;
                }
            }
        }
        self.locals[slot as usize] = vtype;
        if wide {
            self.locals[slot as usize + 1] = VType::Top;
        }
    }

    fn load(&self, slot: u16) -> Result<VType, WritingError> {
        self.locals
            .get(slot as usize)
            .cloned()
            .ok_or_else(|| err(format!("load from undefined local {slot}")))
    }
}

fn initial_frame(
    class_name: &str,
    method_name: &str,
    is_static: bool,
    descriptor: &str,
) -> Result<Frame, WritingError> {
    let mut frame = Frame {
        locals: Vec::new(),
        stack: Vec::new(),
    };
    let mut slot: u16 = 0;
    if !is_static {
        let receiver = if method_name == "<init>" {
            VType::UninitThis
        } else {
            VType::Ref(class_name.to_string())
        };
        frame.store(slot, receiver);
        slot += 1;
    }
    let (args, _) = descriptors::split_method_descriptor(descriptor)
        .ok_or_else(|| err(format!("malformed method descriptor {descriptor}")))?;
    for arg in args {
        let vtype = VType::from_descriptor(&arg);
        let width = vtype.width();
        frame.store(slot, vtype);
        slot += width;
    }
    Ok(frame)
}

fn array_element(array: &VType) -> VType {
    match array {
        VType::Null => VType::Null,
        VType::Ref(descriptor) if descriptor.starts_with('[') => {
            let element = &descriptor[1..];
            VType::from_descriptor(element)
        }
        _ => VType::Ref(JAVA_LANG_OBJECT.to_string()),
    }
}

fn ldc_type(pool: &Pool, index: u16) -> Result<VType, WritingError> {
    Ok(match pool.get(index) {
        Some(ConstantPool::Integer(_)) => VType::Int,
        Some(ConstantPool::Float(_)) => VType::Float,
        Some(ConstantPool::Long { .. }) => VType::Long,
        Some(ConstantPool::Double { .. }) => VType::Double,
        Some(ConstantPool::String { .. }) => VType::Ref("java/lang/String".to_string()),
        Some(ConstantPool::Class { .. }) => VType::Ref("java/lang/Class".to_string()),
        Some(ConstantPool::MethodType { .. }) => {
            VType::Ref("java/lang/invoke/MethodType".to_string())
        }
        Some(ConstantPool::MethodHandle { .. }) => {
            VType::Ref("java/lang/invoke/MethodHandle".to_string())
        }
        Some(ConstantPool::Dynamic {
            name_and_type_index,
            ..
        }) => {
            let (_, descriptor) = pool
                .name_and_type(*name_and_type_index)
                .ok_or_else(|| err("dangling dynamic constant".to_string()))?;
            VType::from_descriptor(&descriptor)
        }
        _ => return Err(err(format!("ldc of unloadable pool entry {index}"))),
    })
}

fn to_verification_type(
    vtype: &VType,
    pool: &mut Pool,
) -> Result<VerificationType, WritingError> {
    Ok(match vtype {
        VType::Top => VerificationType::Top,
        VType::Int => VerificationType::Integer,
        VType::Float => VerificationType::Float,
        VType::Long => VerificationType::Long,
        VType::Double => VerificationType::Double,
        VType::Null => VerificationType::Null,
        VType::UninitThis => VerificationType::UninitializedThis,
        VType::Ref(name) => VerificationType::Object(pool.ensure_class(name)?),
        VType::Uninit(label) => VerificationType::Uninitialized(*label),
    })
}

/// The continuation of one simulated instruction.
enum Flow {
    /// Falls through to the next instruction.
    Next,
    /// Conditional branch: falls through and jumps.
    Branch(Label),
    /// Unconditional jump.
    Jump(Label),
    /// Switch: jumps only.
    Spread(Vec<Label>),
    /// Return or throw.
    End,
}

struct Interpreter<'a> {
    pool: &'a Pool,
    class_name: &'a str,
    resolver: &'a dyn SuperTypeResolver,
}

impl<'a> Interpreter<'a> {
    fn member_ref(&self, index: u16) -> Result<(String, String, String), WritingError> {
        self.pool
            .member_ref(index)
            .ok_or_else(|| err(format!("dangling member reference {index}")))
    }

    fn invoke(
        &self,
        frame: &mut Frame,
        descriptor: &str,
    ) -> Result<(), WritingError> {
        let (args, ret) = descriptors::split_method_descriptor(descriptor)
            .ok_or_else(|| err(format!("malformed call descriptor {descriptor}")))?;
        for _ in 0..args.len() {
            frame.pop()?;
        }
        if ret != "V" {
            frame.push(VType::from_descriptor(&ret));
        }
        Ok(())
    }

    /// Simulates one instruction, mutating `frame` into the fall-through
    /// state, and reports where control continues.
    fn step(
        &self,
        insn: &Insn,
        insn_label: Option<Label>,
        frame: &mut Frame,
    ) -> Result<Flow, WritingError> {
        let opcode = insn.opcode;
        match opcode {
            op::NOP => {}
            op::ACONST_NULL => frame.push(VType::Null),
            op::ICONST_M1..=op::ICONST_5 => frame.push(VType::Int),
            op::LCONST_0 | op::LCONST_1 => frame.push(VType::Long),
            op::FCONST_0..=op::FCONST_2 => frame.push(VType::Float),
            op::DCONST_0 | op::DCONST_1 => frame.push(VType::Double),
            op::BIPUSH | op::SIPUSH => frame.push(VType::Int),
            op::LDC | op::LDC2_W => {
                if let Operand::Cp(index) = insn.operand {
                    frame.push(ldc_type(self.pool, index)?);
                }
            }
            op::ILOAD => frame.push(VType::Int),
            op::LLOAD => frame.push(VType::Long),
            op::FLOAD => frame.push(VType::Float),
            op::DLOAD => frame.push(VType::Double),
            op::ALOAD => {
                if let Operand::Var(var) = insn.operand {
                    frame.push(frame.load(var)?);
                }
            }
            op::IALOAD | op::BALOAD | op::CALOAD | op::SALOAD => {
                frame.pop()?;
                frame.pop()?;
                frame.push(VType::Int);
            }
            op::LALOAD => {
                frame.pop()?;
                frame.pop()?;
                frame.push(VType::Long);
            }
            op::FALOAD => {
                frame.pop()?;
                frame.pop()?;
                frame.push(VType::Float);
            }
            op::DALOAD => {
                frame.pop()?;
                frame.pop()?;
                frame.push(VType::Double);
            }
            op::AALOAD => {
                frame.pop()?;
                let array = frame.pop()?;
                frame.push(array_element(&array));
            }
            op::ISTORE | op::FSTORE | op::LSTORE | op::DSTORE | op::ASTORE => {
                if let Operand::Var(var) = insn.operand {
                    let value = frame.pop()?;
                    frame.store(var, value);
                }
            }
            op::IASTORE..=op::SASTORE => {
                frame.pop()?;
                frame.pop()?;
                frame.pop()?;
            }
            op::POP => {
                frame.pop()?;
            }
            op::POP2 => {
                let top = frame.pop()?;
                if !top.is_category2() {
                    frame.pop()?;
                }
            }
            op::DUP => {
                let top = frame.pop()?;
                frame.push(top.clone());
                frame.push(top);
            }
            op::DUP_X1 => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                frame.push(a.clone());
                frame.push(b);
                frame.push(a);
            }
            op::DUP_X2 => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                if b.is_category2() {
                    frame.push(a.clone());
                    frame.push(b);
                    frame.push(a);
                } else {
                    let c = frame.pop()?;
                    frame.push(a.clone());
                    frame.push(c);
                    frame.push(b);
                    frame.push(a);
                }
            }
            op::DUP2 => {
                let a = frame.pop()?;
                if a.is_category2() {
                    frame.push(a.clone());
                    frame.push(a);
                } else {
                    let b = frame.pop()?;
                    frame.push(b.clone());
                    frame.push(a.clone());
                    frame.push(b);
                    frame.push(a);
                }
            }
            op::DUP2_X1 => {
                let a = frame.pop()?;
                if a.is_category2() {
                    let b = frame.pop()?;
                    frame.push(a.clone());
                    frame.push(b);
                    frame.push(a);
                } else {
                    let b = frame.pop()?;
                    let c = frame.pop()?;
                    frame.push(b.clone());
                    frame.push(a.clone());
                    frame.push(c);
                    frame.push(b);
                    frame.push(a);
                }
            }
            op::DUP2_X2 => {
                let a = frame.pop()?;
                if a.is_category2() {
                    let b = frame.pop()?;
                    if b.is_category2() {
                        frame.push(a.clone());
                        frame.push(b);
                        frame.push(a);
                    } else {
                        let c = frame.pop()?;
                        frame.push(a.clone());
                        frame.push(c);
                        frame.push(b);
                        frame.push(a);
                    }
                } else {
                    let b = frame.pop()?;
                    let c = frame.pop()?;
                    if c.is_category2() {
                        frame.push(b.clone());
                        frame.push(a.clone());
                        frame.push(c);
                        frame.push(b);
                        frame.push(a);
                    } else {
                        let d = frame.pop()?;
                        frame.push(b.clone());
                        frame.push(a.clone());
                        frame.push(d);
                        frame.push(c);
                        frame.push(b);
                        frame.push(a);
                    }
                }
            }
            op::SWAP => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                frame.push(a);
                frame.push(b);
            }
            op::IADD | op::ISUB | op::IMUL | op::IDIV | op::IREM | op::ISHL | op::ISHR
            | op::IUSHR | op::IAND | op::IOR | op::IXOR => {
                frame.pop()?;
                frame.pop()?;
                frame.push(VType::Int);
            }
            op::LADD | op::LSUB | op::LMUL | op::LDIV | op::LREM | op::LAND | op::LOR
            | op::LXOR => {
                frame.pop()?;
                frame.pop()?;
                frame.push(VType::Long);
            }
            op::LSHL | op::LSHR | op::LUSHR => {
                frame.pop()?;
                frame.pop()?;
                frame.push(VType::Long);
            }
            op::FADD | op::FSUB | op::FMUL | op::FDIV | op::FREM => {
                frame.pop()?;
                frame.pop()?;
                frame.push(VType::Float);
            }
            op::DADD | op::DSUB | op::DMUL | op::DDIV | op::DREM => {
                frame.pop()?;
                frame.pop()?;
                frame.push(VType::Double);
            }
            op::INEG | op::LNEG | op::FNEG | op::DNEG => {}
            op::IINC => {}
            op::I2L | op::F2L | op::D2L => {
                frame.pop()?;
                frame.push(VType::Long);
            }
            op::I2F | op::L2F | op::D2F => {
                frame.pop()?;
                frame.push(VType::Float);
            }
            op::I2D | op::L2D | op::F2D => {
                frame.pop()?;
                frame.push(VType::Double);
            }
            op::L2I | op::F2I | op::D2I | op::I2B | op::I2C | op::I2S => {
                frame.pop()?;
                frame.push(VType::Int);
            }
            op::LCMP | op::FCMPL | op::FCMPG | op::DCMPL | op::DCMPG => {
                frame.pop()?;
                frame.pop()?;
                frame.push(VType::Int);
            }
            op::IFEQ..=op::IFLE | op::IFNULL | op::IFNONNULL => {
                frame.pop()?;
                if let Operand::Jump(target) = insn.operand {
                    return Ok(Flow::Branch(target));
                }
            }
            op::IF_ICMPEQ..=op::IF_ACMPNE => {
                frame.pop()?;
                frame.pop()?;
                if let Operand::Jump(target) = insn.operand {
                    return Ok(Flow::Branch(target));
                }
            }
            op::GOTO | op::GOTO_W => {
                if let Operand::Jump(target) = insn.operand {
                    return Ok(Flow::Jump(target));
                }
            }
            op::JSR | op::JSR_W | op::RET => {
                return Err(err("jsr/ret subroutines are not supported".to_string()))
            }
            op::TABLESWITCH => {
                frame.pop()?;
                if let Operand::TableSwitch {
                    default, targets, ..
                } = &insn.operand
                {
                    let mut all = targets.clone();
                    all.push(*default);
                    return Ok(Flow::Spread(all));
                }
            }
            op::LOOKUPSWITCH => {
                frame.pop()?;
                if let Operand::LookupSwitch { default, pairs } = &insn.operand {
                    let mut all: Vec<Label> = pairs.iter().map(|(_, target)| *target).collect();
                    all.push(*default);
                    return Ok(Flow::Spread(all));
                }
            }
            op::IRETURN | op::LRETURN | op::FRETURN | op::DRETURN | op::ARETURN => {
                frame.pop()?;
                return Ok(Flow::End);
            }
            op::RETURN => return Ok(Flow::End),
            op::GETSTATIC => {
                if let Operand::Cp(index) = insn.operand {
                    let (_, _, descriptor) = self.member_ref(index)?;
                    frame.push(VType::from_descriptor(&descriptor));
                }
            }
            op::PUTSTATIC => {
                frame.pop()?;
            }
            op::GETFIELD => {
                if let Operand::Cp(index) = insn.operand {
                    let (_, _, descriptor) = self.member_ref(index)?;
                    frame.pop()?;
                    frame.push(VType::from_descriptor(&descriptor));
                }
            }
            op::PUTFIELD => {
                frame.pop()?;
                frame.pop()?;
            }
            op::INVOKEVIRTUAL | op::INVOKESPECIAL | op::INVOKEINTERFACE => {
                let index = match insn.operand {
                    Operand::Cp(index) => index,
                    Operand::CpCount { index, .. } => index,
                    _ => return Err(err("invoke without pool operand".to_string())),
                };
                let (owner, name, descriptor) = self.member_ref(index)?;
                let (args, ret) = descriptors::split_method_descriptor(&descriptor)
                    .ok_or_else(|| err(format!("malformed call descriptor {descriptor}")))?;
                for _ in 0..args.len() {
                    frame.pop()?;
                }
                let receiver = frame.pop()?;
                if opcode == op::INVOKESPECIAL && name == "<init>" {
                    let initialized = match &receiver {
                        VType::UninitThis => VType::Ref(self.class_name.to_string()),
                        VType::Uninit(_) => VType::Ref(owner),
                        other => other.clone(),
                    };
                    for slot in frame.locals.iter_mut() {
                        if *slot == receiver {
                            *slot = initialized.clone();
                        }
                    }
                    for entry in frame.stack.iter_mut() {
                        if *entry == receiver {
                            *entry = initialized.clone();
                        }
                    }
                }
                if ret != "V" {
                    frame.push(VType::from_descriptor(&ret));
                }
            }
            op::INVOKESTATIC | op::INVOKEDYNAMIC => {
                let index = match insn.operand {
                    Operand::Cp(index) => index,
                    Operand::CpCount { index, .. } => index,
                    _ => return Err(err("invoke without pool operand".to_string())),
                };
                let descriptor = if opcode == op::INVOKEDYNAMIC {
                    match self.pool.get(index) {
                        Some(ConstantPool::InvokeDynamic {
                            name_and_type_index,
                            ..
                        }) => self
                            .pool
                            .name_and_type(*name_and_type_index)
                            .map(|(_, descriptor)| descriptor)
                            .ok_or_else(|| err("dangling invokedynamic".to_string()))?,
                        _ => return Err(err("dangling invokedynamic".to_string())),
                    }
                } else {
                    self.member_ref(index)?.2
                };
                self.invoke(frame, &descriptor)?;
            }
            op::NEW => {
                let label = insn_label
                    .ok_or_else(|| err("new instruction without a label".to_string()))?;
                frame.push(VType::Uninit(label));
            }
            op::NEWARRAY => {
                frame.pop()?;
                let descriptor = match insn.operand {
                    Operand::ArrayType(4) => "[Z",
                    Operand::ArrayType(5) => "[C",
                    Operand::ArrayType(6) => "[F",
                    Operand::ArrayType(7) => "[D",
                    Operand::ArrayType(8) => "[B",
                    Operand::ArrayType(9) => "[S",
                    Operand::ArrayType(10) => "[I",
                    Operand::ArrayType(11) => "[J",
                    _ => return Err(err("newarray with invalid type tag".to_string())),
                };
                frame.push(VType::Ref(descriptor.to_string()));
            }
            op::ANEWARRAY => {
                frame.pop()?;
                if let Operand::Cp(index) = insn.operand {
                    let name = self
                        .pool
                        .class_name(index)
                        .ok_or_else(|| err("dangling anewarray class".to_string()))?;
                    let descriptor = if name.starts_with('[') {
                        format!("[{name}")
                    } else {
                        format!("[L{name};")
                    };
                    frame.push(VType::Ref(descriptor));
                }
            }
            op::ARRAYLENGTH => {
                frame.pop()?;
                frame.push(VType::Int);
            }
            op::ATHROW => {
                frame.pop()?;
                return Ok(Flow::End);
            }
            op::CHECKCAST => {
                if let Operand::Cp(index) = insn.operand {
                    let name = self
                        .pool
                        .class_name(index)
                        .ok_or_else(|| err("dangling checkcast class".to_string()))?;
                    frame.pop()?;
                    frame.push(VType::Ref(name));
                }
            }
            op::INSTANCEOF => {
                frame.pop()?;
                frame.push(VType::Int);
            }
            op::MONITORENTER | op::MONITOREXIT => {
                frame.pop()?;
            }
            op::MULTIANEWARRAY => {
                if let Operand::CpDims { index, dims } = insn.operand {
                    for _ in 0..dims {
                        frame.pop()?;
                    }
                    let name = self
                        .pool
                        .class_name(index)
                        .ok_or_else(|| err("dangling multianewarray class".to_string()))?;
                    frame.push(VType::Ref(name));
                }
            }
            other => return Err(err(format!("unsimulated opcode {:#04x}", other))),
        }
        Ok(Flow::Next)
    }
}

/// Ensures every `new` instruction has a label directly in front of it,
/// so uninitialized types can name their allocation site.
fn label_new_sites(body: &mut CodeBody) {
    let mut at = 0;
    while at < body.items.len() {
        if let CodeItem::Insn(insn) = &body.items[at] {
            if insn.opcode == op::NEW {
                let labelled = at > 0 && matches!(body.items[at - 1], CodeItem::Label(_));
                if !labelled {
                    let label = body.new_label();
                    body.items.insert(at, CodeItem::Label(label));
                    at += 1;
                }
            }
        }
        at += 1;
    }
}

fn label_before(body: &CodeBody, insn_item: usize) -> Option<Label> {
    let mut at = insn_item;
    while at > 0 {
        match &body.items[at - 1] {
            CodeItem::Label(label) => return Some(*label),
            _ => break,
        }
    }
    None
}

/// Recomputes `max_stack`, `max_locals` and the `StackMapTable` of a
/// method body from scratch. Existing stack-map entries are discarded.
pub fn compute_frames(
    class_name: &str,
    method_name: &str,
    method_access_is_static: bool,
    descriptor: &str,
    pool: &mut Pool,
    body: &mut CodeBody,
    resolver: &dyn SuperTypeResolver,
) -> Result<(), WritingError> {
    label_new_sites(body);

    // Map labels to the item index of the instruction that follows them.
    let mut label_items: HashMap<Label, usize> = HashMap::new();
    for (index, item) in body.items.iter().enumerate() {
        if let CodeItem::Label(label) = item {
            let mut next = index + 1;
            while next < body.items.len() && matches!(body.items[next], CodeItem::Label(_)) {
                next += 1;
            }
            label_items.insert(*label, next);
        }
    }
    let resolve_target = |label: Label| -> Result<usize, WritingError> {
        label_items.get(&label).copied().ok_or_else(|| {
            WritingError::new(WritingCause::UnplacedLabel(label), "jump to unplaced label")
        })
    };

    let interpreter = Interpreter {
        pool,
        class_name,
        resolver,
    };

    let entry = initial_frame(class_name, method_name, method_access_is_static, descriptor)?;
    let mut states: HashMap<usize, Frame> = HashMap::new();
    let mut worklist: Vec<usize> = Vec::new();
    let first_insn = body
        .items
        .iter()
        .position(|item| matches!(item, CodeItem::Insn(_)))
        .ok_or_else(|| err("empty method body".to_string()))?;
    states.insert(first_insn, entry);
    worklist.push(first_insn);

    // Item ranges protected by each handler, resolved once.
    let mut handler_ranges: Vec<(usize, usize, usize, VType)> = Vec::new();
    for handler in &body.handlers {
        let start = resolve_target(handler.start)?;
        let end = match label_items.get(&handler.end) {
            Some(item) => *item,
            None => body.items.len(),
        };
        let target = resolve_target(handler.handler)?;
        let caught = if handler.catch_type == 0 {
            VType::Ref("java/lang/Throwable".to_string())
        } else {
            VType::Ref(pool.class_name(handler.catch_type).ok_or_else(|| {
                err(format!("dangling catch type {}", handler.catch_type))
            })?)
        };
        handler_ranges.push((start, end, target, caught));
    }

    let mut max_stack: u16 = 0;
    let mut jump_targets: Vec<usize> = Vec::new();

    let mut propagate = |states: &mut HashMap<usize, Frame>,
                         worklist: &mut Vec<usize>,
                         target: usize,
                         frame: &Frame|
     -> Result<(), WritingError> {
        match states.get_mut(&target) {
            Some(existing) => {
                if existing.merge_with(frame, resolver)? {
                    worklist.push(target);
                }
            }
            None => {
                states.insert(target, frame.clone());
                worklist.push(target);
            }
        }
        Ok(())
    };

    while let Some(mut at) = worklist.pop() {
        let mut frame = match states.get(&at) {
            Some(frame) => frame.clone(),
            None => continue,
        };
        loop {
            // Exception edges carry the state *before* the instruction.
            for (start, end, target, caught) in &handler_ranges {
                if at >= *start && at < *end {
                    let handler_frame = Frame {
                        locals: frame.locals.clone(),
                        stack: vec![caught.clone()],
                    };
                    propagate(&mut states, &mut worklist, *target, &handler_frame)?;
                }
            }
            let insn = match &body.items[at] {
                CodeItem::Insn(insn) => insn.clone(),
                CodeItem::Label(_) => {
                    at += 1;
                    if at >= body.items.len() {
                        break;
                    }
                    continue;
                }
            };
            let insn_label = label_before(body, at);
            let flow = interpreter.step(&insn, insn_label, &mut frame)?;
            max_stack = max_stack.max(frame.stack_height());
            match flow {
                Flow::Next => {
                    let next = at + 1;
                    if next >= body.items.len() {
                        return Err(err("control flow runs off method end".to_string()));
                    }
                    // Merging at a label keeps joined states canonical.
                    if matches!(body.items[next], CodeItem::Label(_)) {
                        let mut insn_item = next;
                        while insn_item < body.items.len()
                            && matches!(body.items[insn_item], CodeItem::Label(_))
                        {
                            insn_item += 1;
                        }
                        propagate(&mut states, &mut worklist, insn_item, &frame)?;
                        break;
                    }
                    at = next;
                }
                Flow::Branch(target) => {
                    let target_item = resolve_target(target)?;
                    jump_targets.push(target_item);
                    propagate(&mut states, &mut worklist, target_item, &frame)?;
                    let next = at + 1;
                    if next >= body.items.len() {
                        return Err(err("control flow runs off method end".to_string()));
                    }
                    if matches!(body.items[next], CodeItem::Label(_)) {
                        let mut insn_item = next;
                        while insn_item < body.items.len()
                            && matches!(body.items[insn_item], CodeItem::Label(_))
                        {
                            insn_item += 1;
                        }
                        propagate(&mut states, &mut worklist, insn_item, &frame)?;
                        break;
                    }
                    at = next;
                }
                Flow::Jump(target) => {
                    let target_item = resolve_target(target)?;
                    jump_targets.push(target_item);
                    propagate(&mut states, &mut worklist, target_item, &frame)?;
                    break;
                }
                Flow::Spread(targets) => {
                    for target in targets {
                        let target_item = resolve_target(target)?;
                        jump_targets.push(target_item);
                        propagate(&mut states, &mut worklist, target_item, &frame)?;
                    }
                    break;
                }
                Flow::End => break,
            }
        }
    }

    // Handler entries need frames exactly like jump targets.
    for (_, _, target, _) in &handler_ranges {
        jump_targets.push(*target);
    }
    jump_targets.sort_unstable();
    jump_targets.dedup();

    let mut stack_map = Vec::with_capacity(jump_targets.len());
    for target in jump_targets {
        let frame = states.get(&target).ok_or_else(|| {
            err("jump target is unreachable; refusing to emit a partial stack map".to_string())
        })?;
        // The nearest label in the run directly before the target insn.
        let mut label = None;
        let mut back = target;
        while back > 0 {
            match &body.items[back - 1] {
                CodeItem::Label(l) => {
                    label = Some(*l);
                    back -= 1;
                }
                _ => break,
            }
        }
        let label =
            label.ok_or_else(|| err("jump target lost its label".to_string()))?;
        let mut locals = Vec::with_capacity(frame.locals.len());
        let mut slot = 0;
        while slot < frame.locals.len() {
            let vtype = &frame.locals[slot];
            locals.push(to_verification_type(vtype, pool)?);
            slot += if vtype.is_category2() { 2 } else { 1 };
        }
        // Trailing Top slots are kept: they still describe real slots.
        let mut stack = Vec::with_capacity(frame.stack.len());
        for entry in &frame.stack {
            stack.push(to_verification_type(entry, pool)?);
        }
        stack_map.push(StackMapEntry {
            at: label,
            kind: FrameKind::Full { locals, stack },
        });
    }

    let mut max_locals: u16 = 0;
    for frame in states.values() {
        max_locals = max_locals.max(frame.locals.len() as u16);
    }

    body.stack_map = stack_map;
    body.max_stack = max_stack;
    body.max_locals = max_locals.max(body.max_locals);
    Ok(())
}

/// Joins everything at `java/lang/Object`; the conservative fallback
/// when no class-path context is available.
pub struct ObjectResolver;

impl SuperTypeResolver for ObjectResolver {
    fn common_superclass(&self, a: &str, b: &str) -> String {
        if a == b {
            a.to_string()
        } else {
            JAVA_LANG_OBJECT.to_string()
        }
    }
}
