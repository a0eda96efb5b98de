//! Instruction-list model of a method body.
//!
//! Bytecode is parsed into a list of [`CodeItem`]s where every branch
//! target, exception-table boundary and stack-map anchor is a symbolic
//! [`Label`]. Rewrites insert and remove items without tracking byte
//! offsets; serialization assigns offsets in a single forward pass and
//! re-encodes branches and stack-map deltas against the final layout.

use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{ReadBytesExt, BE};

use crate::errors::class_loading::{LoadingCause, LoadingError};
use crate::errors::class_writing::{WritingCause, WritingError};
use crate::opcodes as op;

pub type Label = usize;

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    None,
    /// Constant-pool reference (`ldc`/`ldc_w` are normalized to `LDC`).
    Cp(u16),
    /// `multianewarray`: pool reference plus dimension count.
    CpDims { index: u16, dims: u8 },
    /// `invokeinterface` (`count` preserved) and `invokedynamic` (`count` 0).
    CpCount { index: u16, count: u8 },
    /// Local-variable index; `wide` and `_0`..`_3` forms are normalized.
    Var(u16),
    Iinc { var: u16, delta: i16 },
    Byte(i8),
    Short(i16),
    /// `newarray` element type tag.
    ArrayType(u8),
    Jump(Label),
    TableSwitch {
        default: Label,
        low: i32,
        high: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Insn {
    pub opcode: u8,
    pub operand: Operand,
}

impl Insn {
    pub fn simple(opcode: u8) -> Insn {
        Insn {
            opcode,
            operand: Operand::None,
        }
    }

    pub fn cp(opcode: u8, index: u16) -> Insn {
        Insn {
            opcode,
            operand: Operand::Cp(index),
        }
    }

    pub fn var(opcode: u8, var: u16) -> Insn {
        Insn {
            opcode,
            operand: Operand::Var(var),
        }
    }

    pub fn jump(opcode: u8, target: Label) -> Insn {
        Insn {
            opcode,
            operand: Operand::Jump(target),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CodeItem {
    Label(Label),
    Insn(Insn),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExceptionHandler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// Pool index of the catch type; 0 catches everything.
    pub catch_type: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    Uninitialized(Label),
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameKind {
    Same,
    SameLocals1(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct StackMapEntry {
    pub at: Label,
    pub kind: FrameKind,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalVarEntry {
    pub start: Label,
    pub end: Label,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub slot: u16,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct CodeBody {
    pub max_stack: u16,
    pub max_locals: u16,
    pub items: Vec<CodeItem>,
    pub handlers: Vec<ExceptionHandler>,
    pub stack_map: Vec<StackMapEntry>,
    pub line_numbers: Vec<(Label, u16)>,
    pub local_vars: Vec<LocalVarEntry>,
    pub local_var_types: Vec<LocalVarEntry>,
    /// Code sub-attributes this tool does not model, raw.
    pub other_attributes: Vec<(u16, Vec<u8>)>,
    next_label: Label,
}

impl CodeBody {
    pub fn new() -> CodeBody {
        CodeBody::default()
    }

    pub fn new_label(&mut self) -> Label {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    /// Item index a label is attached to, if the label is placed.
    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.items
            .iter()
            .position(|item| matches!(item, CodeItem::Label(l) if *l == label))
    }

    /// Indices of `Insn` items, in order.
    pub fn insn_positions(&self) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| matches!(item, CodeItem::Insn(_)))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn insn_at(&self, item_index: usize) -> Option<&Insn> {
        match self.items.get(item_index) {
            Some(CodeItem::Insn(insn)) => Some(insn),
            _ => None,
        }
    }
}

struct LabelAllocator {
    by_offset: HashMap<u32, Label>,
    next: Label,
}

impl LabelAllocator {
    fn new() -> LabelAllocator {
        LabelAllocator {
            by_offset: HashMap::new(),
            next: 0,
        }
    }

    fn at(&mut self, offset: u32) -> Label {
        if let Some(label) = self.by_offset.get(&offset) {
            return *label;
        }
        let label = self.next;
        self.next += 1;
        self.by_offset.insert(offset, label);
        label
    }
}

fn branch_target(
    insn_offset: u32,
    relative: i32,
    code_len: u32,
) -> Result<u32, LoadingError> {
    let target = insn_offset as i64 + relative as i64;
    if target < 0 || target as u64 > code_len as u64 {
        return Err(LoadingError::new(
            LoadingCause::InvalidBranchTarget(insn_offset),
            &format!("branch to {target} outside method"),
        ));
    }
    Ok(target as u32)
}

/// First pass over raw code bytes: decode opcodes and operand widths,
/// allocating labels for every branch target.
fn decode_insns(
    bytes: &[u8],
    labels: &mut LabelAllocator,
) -> Result<Vec<(u32, Insn)>, LoadingError> {
    let code_len = bytes.len() as u32;
    let mut cursor = Cursor::new(bytes);
    let mut decoded = Vec::new();
    let truncated =
        |_| LoadingError::new(LoadingCause::TruncatedCode, "code attribute ends mid-instruction");
    while (cursor.position() as u32) < code_len {
        let at = cursor.position() as u32;
        let opcode = cursor.read_u8().map_err(truncated)?;
        let insn = match opcode {
            op::BIPUSH => Insn {
                opcode,
                operand: Operand::Byte(cursor.read_i8().map_err(truncated)?),
            },
            op::SIPUSH => Insn {
                opcode,
                operand: Operand::Short(cursor.read_i16::<BE>().map_err(truncated)?),
            },
            op::LDC => Insn::cp(op::LDC, cursor.read_u8().map_err(truncated)? as u16),
            op::LDC_W => Insn::cp(op::LDC, cursor.read_u16::<BE>().map_err(truncated)?),
            op::LDC2_W => Insn::cp(op::LDC2_W, cursor.read_u16::<BE>().map_err(truncated)?),
            op::ILOAD | op::LLOAD | op::FLOAD | op::DLOAD | op::ALOAD | op::ISTORE
            | op::LSTORE | op::FSTORE | op::DSTORE | op::ASTORE | op::RET => {
                Insn::var(opcode, cursor.read_u8().map_err(truncated)? as u16)
            }
            op::ILOAD_0..=op::ALOAD_3 => {
                let base = (opcode - op::ILOAD_0) / 4;
                let var = ((opcode - op::ILOAD_0) % 4) as u16;
                Insn::var(op::ILOAD + base, var)
            }
            op::ISTORE_0..=op::ASTORE_3 => {
                let base = (opcode - op::ISTORE_0) / 4;
                let var = ((opcode - op::ISTORE_0) % 4) as u16;
                Insn::var(op::ISTORE + base, var)
            }
            op::IINC => Insn {
                opcode,
                operand: Operand::Iinc {
                    var: cursor.read_u8().map_err(truncated)? as u16,
                    delta: cursor.read_i8().map_err(truncated)? as i16,
                },
            },
            op::IFEQ..=op::JSR | op::IFNULL | op::IFNONNULL => {
                let relative = cursor.read_i16::<BE>().map_err(truncated)? as i32;
                let target = branch_target(at, relative, code_len)?;
                Insn::jump(opcode, labels.at(target))
            }
            op::GOTO_W | op::JSR_W => {
                let relative = cursor.read_i32::<BE>().map_err(truncated)?;
                let target = branch_target(at, relative, code_len)?;
                Insn::jump(opcode, labels.at(target))
            }
            op::TABLESWITCH => {
                while cursor.position() % 4 != 0 {
                    cursor.read_u8().map_err(truncated)?;
                }
                let default = cursor.read_i32::<BE>().map_err(truncated)?;
                let low = cursor.read_i32::<BE>().map_err(truncated)?;
                let high = cursor.read_i32::<BE>().map_err(truncated)?;
                if high < low {
                    return Err(LoadingError::new(
                        LoadingCause::InvalidBranchTarget(at),
                        "tableswitch high below low",
                    ));
                }
                let mut targets = Vec::with_capacity((high - low + 1) as usize);
                for _ in low..=high {
                    let relative = cursor.read_i32::<BE>().map_err(truncated)?;
                    targets.push(labels.at(branch_target(at, relative, code_len)?));
                }
                Insn {
                    opcode,
                    operand: Operand::TableSwitch {
                        default: labels.at(branch_target(at, default, code_len)?),
                        low,
                        high,
                        targets,
                    },
                }
            }
            op::LOOKUPSWITCH => {
                while cursor.position() % 4 != 0 {
                    cursor.read_u8().map_err(truncated)?;
                }
                let default = cursor.read_i32::<BE>().map_err(truncated)?;
                let npairs = cursor.read_i32::<BE>().map_err(truncated)?;
                let mut pairs = Vec::with_capacity(npairs.max(0) as usize);
                for _ in 0..npairs {
                    let key = cursor.read_i32::<BE>().map_err(truncated)?;
                    let relative = cursor.read_i32::<BE>().map_err(truncated)?;
                    pairs.push((key, labels.at(branch_target(at, relative, code_len)?)));
                }
                Insn {
                    opcode,
                    operand: Operand::LookupSwitch {
                        default: labels.at(branch_target(at, default, code_len)?),
                        pairs,
                    },
                }
            }
            op::GETSTATIC..=op::INVOKESTATIC | op::NEW | op::ANEWARRAY | op::CHECKCAST
            | op::INSTANCEOF => Insn::cp(opcode, cursor.read_u16::<BE>().map_err(truncated)?),
            op::INVOKEINTERFACE => {
                let index = cursor.read_u16::<BE>().map_err(truncated)?;
                let count = cursor.read_u8().map_err(truncated)?;
                cursor.read_u8().map_err(truncated)?;
                Insn {
                    opcode,
                    operand: Operand::CpCount { index, count },
                }
            }
            op::INVOKEDYNAMIC => {
                let index = cursor.read_u16::<BE>().map_err(truncated)?;
                cursor.read_u16::<BE>().map_err(truncated)?;
                Insn {
                    opcode,
                    operand: Operand::CpCount { index, count: 0 },
                }
            }
            op::NEWARRAY => Insn {
                opcode,
                operand: Operand::ArrayType(cursor.read_u8().map_err(truncated)?),
            },
            op::MULTIANEWARRAY => Insn {
                opcode,
                operand: Operand::CpDims {
                    index: cursor.read_u16::<BE>().map_err(truncated)?,
                    dims: cursor.read_u8().map_err(truncated)?,
                },
            },
            op::WIDE => {
                let wide_op = cursor.read_u8().map_err(truncated)?;
                match wide_op {
                    op::ILOAD | op::LLOAD | op::FLOAD | op::DLOAD | op::ALOAD | op::ISTORE
                    | op::LSTORE | op::FSTORE | op::DSTORE | op::ASTORE | op::RET => {
                        Insn::var(wide_op, cursor.read_u16::<BE>().map_err(truncated)?)
                    }
                    op::IINC => Insn {
                        opcode: op::IINC,
                        operand: Operand::Iinc {
                            var: cursor.read_u16::<BE>().map_err(truncated)?,
                            delta: cursor.read_i16::<BE>().map_err(truncated)?,
                        },
                    },
                    other => {
                        return Err(LoadingError::new(
                            LoadingCause::UnknownOpcode(other),
                            "invalid wide form",
                        ))
                    }
                }
            }
            op::NOP..=op::DCONST_1
            | op::IALOAD..=op::SALOAD
            | op::IASTORE..=op::SWAP
            | op::IADD..=op::LXOR
            | op::I2L..=op::DCMPG
            | op::IRETURN..=op::RETURN
            | op::ARRAYLENGTH
            | op::ATHROW
            | op::MONITORENTER
            | op::MONITOREXIT => Insn::simple(opcode),
            other => {
                return Err(LoadingError::new(
                    LoadingCause::UnknownOpcode(other),
                    &format!("at code offset {at}"),
                ))
            }
        };
        decoded.push((at, insn));
    }
    Ok(decoded)
}

impl CodeBody {
    /// Builds the item list from the fixed-size fields and raw `code`
    /// bytes of a `Code` attribute. Exception-table entries and the
    /// label-anchored sub-attributes are wired up by the caller
    /// (`attributes::read_code`), which owns the surrounding layout.
    pub fn from_raw_code(
        max_stack: u16,
        max_locals: u16,
        bytes: &[u8],
    ) -> Result<(CodeBody, HashMap<u32, Label>, Vec<u32>), LoadingError> {
        let mut labels = LabelAllocator::new();
        let decoded = decode_insns(bytes, &mut labels)?;
        let mut body = CodeBody {
            max_stack,
            max_locals,
            ..CodeBody::default()
        };
        body.next_label = labels.next;
        let mut insn_offsets = Vec::with_capacity(decoded.len());
        for (offset, insn) in decoded {
            if let Some(label) = labels.by_offset.get(&offset) {
                body.items.push(CodeItem::Label(*label));
            }
            insn_offsets.push(offset);
            body.items.push(CodeItem::Insn(insn));
        }
        if let Some(label) = labels.by_offset.get(&(bytes.len() as u32)) {
            body.items.push(CodeItem::Label(*label));
        }
        Ok((body, labels.by_offset, insn_offsets))
    }

    /// Returns (or allocates and appends to the offset map) a label for
    /// a bytecode offset of the original method. Used while wiring the
    /// exception table and label-anchored attributes after
    /// `from_raw_code`, where every branch target already has a label
    /// but table boundaries may not.
    pub fn label_for_offset(
        &mut self,
        offsets: &mut HashMap<u32, Label>,
        insn_offsets: &[u32],
        offset: u32,
        code_len: u32,
    ) -> Result<Label, LoadingError> {
        if let Some(label) = offsets.get(&offset) {
            return Ok(*label);
        }
        let label = self.new_label();
        offsets.insert(offset, label);
        if offset == code_len {
            self.items.push(CodeItem::Label(label));
            return Ok(label);
        }
        // Insert the label item directly before the instruction at `offset`.
        let ordinal = insn_offsets
            .binary_search(&offset)
            .map_err(|_| {
                LoadingError::new(
                    LoadingCause::InvalidBranchTarget(offset),
                    "attribute offset does not start an instruction",
                )
            })?;
        let mut seen = 0usize;
        let mut insert_at = None;
        for (index, item) in self.items.iter().enumerate() {
            if matches!(item, CodeItem::Insn(_)) {
                if seen == ordinal {
                    insert_at = Some(index);
                    break;
                }
                seen += 1;
            }
        }
        match insert_at {
            Some(index) => {
                self.items.insert(index, CodeItem::Label(label));
                Ok(label)
            }
            None => Err(LoadingError::new(
                LoadingCause::InvalidBranchTarget(offset),
                "attribute offset beyond method end",
            )),
        }
    }

    fn insn_size(insn: &Insn, at: u32) -> usize {
        match (&insn.operand, insn.opcode) {
            (Operand::None, _) => 1,
            (Operand::Byte(_), _) | (Operand::ArrayType(_), _) => 2,
            (Operand::Short(_), _) => 3,
            (Operand::Cp(index), op::LDC) => {
                if *index <= u8::MAX as u16 {
                    2
                } else {
                    3
                }
            }
            (Operand::Cp(_), _) => 3,
            (Operand::CpDims { .. }, _) => 4,
            (Operand::CpCount { .. }, _) => 5,
            (Operand::Var(var), opcode) => {
                if *var <= 3 && opcode != op::RET {
                    1
                } else if *var <= u8::MAX as u16 {
                    2
                } else {
                    4
                }
            }
            (Operand::Iinc { var, delta }, _) => {
                if *var <= u8::MAX as u16 && *delta >= i8::MIN as i16 && *delta <= i8::MAX as i16 {
                    3
                } else {
                    6
                }
            }
            (Operand::Jump(_), op::GOTO_W | op::JSR_W) => 5,
            (Operand::Jump(_), _) => 3,
            (Operand::TableSwitch { targets, .. }, _) => {
                let pad = (4 - ((at as usize + 1) % 4)) % 4;
                1 + pad + 12 + targets.len() * 4
            }
            (Operand::LookupSwitch { pairs, .. }, _) => {
                let pad = (4 - ((at as usize + 1) % 4)) % 4;
                1 + pad + 8 + pairs.len() * 8
            }
        }
    }

    /// Assigns a bytecode offset to every instruction and placed label.
    pub fn layout(&self) -> Result<(HashMap<Label, u32>, Vec<u32>, u32), WritingError> {
        let mut label_offsets = HashMap::new();
        let mut insn_offsets = Vec::new();
        let mut at: u32 = 0;
        for item in &self.items {
            match item {
                CodeItem::Label(label) => {
                    label_offsets.insert(*label, at);
                }
                CodeItem::Insn(insn) => {
                    insn_offsets.push(at);
                    at += Self::insn_size(insn, at) as u32;
                }
            }
        }
        if at as usize > u16::MAX as usize {
            return Err(WritingError::new(
                WritingCause::CodeTooLarge(at as usize),
                "method exceeds 65535 code bytes",
            ));
        }
        Ok((label_offsets, insn_offsets, at))
    }

    pub fn resolve_label(
        label_offsets: &HashMap<Label, u32>,
        label: Label,
    ) -> Result<u32, WritingError> {
        label_offsets.get(&label).copied().ok_or_else(|| {
            WritingError::new(WritingCause::UnplacedLabel(label), "label never placed")
        })
    }

    /// Serializes the instruction items to raw code bytes.
    pub fn serialize_insns(
        &self,
        label_offsets: &HashMap<Label, u32>,
    ) -> Result<Vec<u8>, WritingError> {
        let mut out: Vec<u8> = Vec::new();
        for item in &self.items {
            let insn = match item {
                CodeItem::Label(_) => continue,
                CodeItem::Insn(insn) => insn,
            };
            let at = out.len() as u32;
            match (&insn.operand, insn.opcode) {
                (Operand::None, opcode) => out.push(opcode),
                (Operand::Byte(value), opcode) => {
                    out.push(opcode);
                    out.push(*value as u8);
                }
                (Operand::ArrayType(atype), opcode) => {
                    out.push(opcode);
                    out.push(*atype);
                }
                (Operand::Short(value), opcode) => {
                    out.push(opcode);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                (Operand::Cp(index), op::LDC) => {
                    if *index <= u8::MAX as u16 {
                        out.push(op::LDC);
                        out.push(*index as u8);
                    } else {
                        out.push(op::LDC_W);
                        out.extend_from_slice(&index.to_be_bytes());
                    }
                }
                (Operand::Cp(index), opcode) => {
                    out.push(opcode);
                    out.extend_from_slice(&index.to_be_bytes());
                }
                (Operand::CpDims { index, dims }, opcode) => {
                    out.push(opcode);
                    out.extend_from_slice(&index.to_be_bytes());
                    out.push(*dims);
                }
                (Operand::CpCount { index, count }, opcode) => {
                    out.push(opcode);
                    out.extend_from_slice(&index.to_be_bytes());
                    out.push(*count);
                    out.push(0);
                }
                (Operand::Var(var), opcode) => {
                    if *var <= 3 && opcode != op::RET {
                        let short_base = if (op::ILOAD..=op::ALOAD).contains(&opcode) {
                            op::ILOAD_0 + (opcode - op::ILOAD) * 4
                        } else {
                            op::ISTORE_0 + (opcode - op::ISTORE) * 4
                        };
                        out.push(short_base + *var as u8);
                    } else if *var <= u8::MAX as u16 {
                        out.push(opcode);
                        out.push(*var as u8);
                    } else {
                        out.push(op::WIDE);
                        out.push(opcode);
                        out.extend_from_slice(&var.to_be_bytes());
                    }
                }
                (Operand::Iinc { var, delta }, _) => {
                    if *var <= u8::MAX as u16
                        && *delta >= i8::MIN as i16
                        && *delta <= i8::MAX as i16
                    {
                        out.push(op::IINC);
                        out.push(*var as u8);
                        out.push(*delta as i8 as u8);
                    } else {
                        out.push(op::WIDE);
                        out.push(op::IINC);
                        out.extend_from_slice(&var.to_be_bytes());
                        out.extend_from_slice(&delta.to_be_bytes());
                    }
                }
                (Operand::Jump(target), opcode) => {
                    let target = Self::resolve_label(label_offsets, *target)?;
                    let relative = target as i64 - at as i64;
                    if opcode == op::GOTO_W || opcode == op::JSR_W {
                        out.push(opcode);
                        out.extend_from_slice(&(relative as i32).to_be_bytes());
                    } else {
                        if relative < i16::MIN as i64 || relative > i16::MAX as i64 {
                            return Err(WritingError::new(
                                WritingCause::BranchOffsetOverflow(relative),
                                "branch does not fit a 16-bit offset",
                            ));
                        }
                        out.push(opcode);
                        out.extend_from_slice(&(relative as i16).to_be_bytes());
                    }
                }
                (
                    Operand::TableSwitch {
                        default,
                        low,
                        high,
                        targets,
                    },
                    opcode,
                ) => {
                    out.push(opcode);
                    while out.len() % 4 != 0 {
                        out.push(0);
                    }
                    let default = Self::resolve_label(label_offsets, *default)?;
                    out.extend_from_slice(&(default as i64 - at as i64).to_be_bytes()[4..]);
                    out.extend_from_slice(&low.to_be_bytes());
                    out.extend_from_slice(&high.to_be_bytes());
                    for target in targets {
                        let target = Self::resolve_label(label_offsets, *target)?;
                        out.extend_from_slice(&(target as i64 - at as i64).to_be_bytes()[4..]);
                    }
                }
                (Operand::LookupSwitch { default, pairs }, opcode) => {
                    out.push(opcode);
                    while out.len() % 4 != 0 {
                        out.push(0);
                    }
                    let default = Self::resolve_label(label_offsets, *default)?;
                    out.extend_from_slice(&(default as i64 - at as i64).to_be_bytes()[4..]);
                    out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
                    for (key, target) in pairs {
                        out.extend_from_slice(&key.to_be_bytes());
                        let target = Self::resolve_label(label_offsets, *target)?;
                        out.extend_from_slice(&(target as i64 - at as i64).to_be_bytes()[4..]);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn write_verification_type(
    out: &mut Vec<u8>,
    vt: &VerificationType,
    label_offsets: &HashMap<Label, u32>,
) -> Result<(), WritingError> {
    match vt {
        VerificationType::Top => out.push(0),
        VerificationType::Integer => out.push(1),
        VerificationType::Float => out.push(2),
        VerificationType::Double => out.push(3),
        VerificationType::Long => out.push(4),
        VerificationType::Null => out.push(5),
        VerificationType::UninitializedThis => out.push(6),
        VerificationType::Object(index) => {
            out.push(7);
            out.extend_from_slice(&index.to_be_bytes());
        }
        VerificationType::Uninitialized(label) => {
            out.push(8);
            let offset = CodeBody::resolve_label(label_offsets, *label)?;
            out.extend_from_slice(&(offset as u16).to_be_bytes());
        }
    }
    Ok(())
}

fn read_verification_type(
    cursor: &mut Cursor<&[u8]>,
    label_of: &mut dyn FnMut(u32) -> Result<Label, LoadingError>,
) -> Result<VerificationType, LoadingError> {
    let truncated =
        |_| LoadingError::new(LoadingCause::TruncatedCode, "StackMapTable ends mid-entry");
    let tag = cursor.read_u8().map_err(truncated)?;
    Ok(match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(cursor.read_u16::<BE>().map_err(truncated)?),
        8 => {
            let offset = cursor.read_u16::<BE>().map_err(truncated)? as u32;
            VerificationType::Uninitialized(label_of(offset)?)
        }
        other => {
            return Err(LoadingError::new(
                LoadingCause::InvalidFrameType(other),
                "verification_type_info tag",
            ))
        }
    })
}

/// Parses a raw `StackMapTable` payload into label-anchored entries.
pub fn read_stack_map(
    bytes: &[u8],
    label_of: &mut dyn FnMut(u32) -> Result<Label, LoadingError>,
) -> Result<Vec<StackMapEntry>, LoadingError> {
    let truncated =
        |_| LoadingError::new(LoadingCause::TruncatedCode, "StackMapTable ends mid-entry");
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_u16::<BE>().map_err(truncated)?;
    let mut entries = Vec::with_capacity(count as usize);
    let mut offset: i64 = -1;
    for _ in 0..count {
        let frame_type = cursor.read_u8().map_err(truncated)?;
        let (delta, kind) = match frame_type {
            0..=63 => (frame_type as u16, FrameKind::Same),
            64..=127 => {
                let vt = read_verification_type(&mut cursor, label_of)?;
                ((frame_type - 64) as u16, FrameKind::SameLocals1(vt))
            }
            247 => {
                let delta = cursor.read_u16::<BE>().map_err(truncated)?;
                let vt = read_verification_type(&mut cursor, label_of)?;
                (delta, FrameKind::SameLocals1(vt))
            }
            248..=250 => {
                let delta = cursor.read_u16::<BE>().map_err(truncated)?;
                (delta, FrameKind::Chop(251 - frame_type))
            }
            251 => {
                let delta = cursor.read_u16::<BE>().map_err(truncated)?;
                (delta, FrameKind::Same)
            }
            252..=254 => {
                let delta = cursor.read_u16::<BE>().map_err(truncated)?;
                let mut appended = Vec::with_capacity((frame_type - 251) as usize);
                for _ in 0..frame_type - 251 {
                    appended.push(read_verification_type(&mut cursor, label_of)?);
                }
                (delta, FrameKind::Append(appended))
            }
            255 => {
                let delta = cursor.read_u16::<BE>().map_err(truncated)?;
                let n_locals = cursor.read_u16::<BE>().map_err(truncated)?;
                let mut locals = Vec::with_capacity(n_locals as usize);
                for _ in 0..n_locals {
                    locals.push(read_verification_type(&mut cursor, label_of)?);
                }
                let n_stack = cursor.read_u16::<BE>().map_err(truncated)?;
                let mut stack = Vec::with_capacity(n_stack as usize);
                for _ in 0..n_stack {
                    stack.push(read_verification_type(&mut cursor, label_of)?);
                }
                (delta, FrameKind::Full { locals, stack })
            }
            other => {
                return Err(LoadingError::new(
                    LoadingCause::InvalidFrameType(other),
                    "reserved frame_type",
                ))
            }
        };
        offset = offset + delta as i64 + 1;
        entries.push(StackMapEntry {
            at: label_of(offset as u32)?,
            kind,
        });
    }
    Ok(entries)
}

/// Serializes label-anchored stack-map entries, recomputing deltas and
/// widening compressed forms whose delta no longer fits.
pub fn write_stack_map(
    entries: &[StackMapEntry],
    label_offsets: &HashMap<Label, u32>,
) -> Result<Vec<u8>, WritingError> {
    let mut with_offsets: Vec<(u32, &StackMapEntry)> = entries
        .iter()
        .map(|entry| Ok((CodeBody::resolve_label(label_offsets, entry.at)?, entry)))
        .collect::<Result<_, WritingError>>()?;
    with_offsets.sort_by_key(|(offset, _)| *offset);
    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(&(with_offsets.len() as u16).to_be_bytes());
    let mut previous: i64 = -1;
    for (offset, entry) in with_offsets {
        let delta = (offset as i64 - previous - 1) as u16;
        previous = offset as i64;
        match &entry.kind {
            FrameKind::Same => {
                if delta <= 63 {
                    out.push(delta as u8);
                } else {
                    out.push(251);
                    out.extend_from_slice(&delta.to_be_bytes());
                }
            }
            FrameKind::SameLocals1(vt) => {
                if delta <= 63 {
                    out.push(64 + delta as u8);
                } else {
                    out.push(247);
                    out.extend_from_slice(&delta.to_be_bytes());
                }
                write_verification_type(&mut out, vt, label_offsets)?;
            }
            FrameKind::Chop(k) => {
                out.push(251 - k);
                out.extend_from_slice(&delta.to_be_bytes());
            }
            FrameKind::Append(appended) => {
                out.push(251 + appended.len() as u8);
                out.extend_from_slice(&delta.to_be_bytes());
                for vt in appended {
                    write_verification_type(&mut out, vt, label_offsets)?;
                }
            }
            FrameKind::Full { locals, stack } => {
                out.push(255);
                out.extend_from_slice(&delta.to_be_bytes());
                out.extend_from_slice(&(locals.len() as u16).to_be_bytes());
                for vt in locals {
                    write_verification_type(&mut out, vt, label_offsets)?;
                }
                out.extend_from_slice(&(stack.len() as u16).to_be_bytes());
                for vt in stack {
                    write_verification_type(&mut out, vt, label_offsets)?;
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::opcodes as op;

    #[test]
    fn decode_normalizes_short_forms() {
        // aload_0, iconst_0, istore_1, return
        let bytes = [0x2a, 0x03, 0x3c, 0xb1];
        let (body, _, _) = CodeBody::from_raw_code(1, 2, &bytes).unwrap();
        let insns: Vec<&Insn> = body
            .items
            .iter()
            .filter_map(|item| match item {
                CodeItem::Insn(insn) => Some(insn),
                _ => None,
            })
            .collect();
        assert_eq!(insns[0], &Insn::var(op::ALOAD, 0));
        assert_eq!(insns[1], &Insn::simple(op::ICONST_0));
        assert_eq!(insns[2], &Insn::var(op::ISTORE, 1));
        assert_eq!(insns[3], &Insn::simple(op::RETURN));
    }

    #[test]
    fn branch_round_trip() {
        // iload_0, ifeq +4 (to return), iconst_1, istore_1, return
        let bytes = [0x1a, 0x99, 0x00, 0x05, 0x04, 0x3c, 0xb1];
        let (body, _, _) = CodeBody::from_raw_code(1, 2, &bytes).unwrap();
        let (label_offsets, _, len) = body.layout().unwrap();
        assert_eq!(len, bytes.len() as u32);
        let out = body.serialize_insns(&label_offsets).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn lookupswitch_round_trip() {
        // 0: lookupswitch { 1 -> 16, default -> 18 }, 16: nop, 17: nop, 18: return
        let mut bytes = vec![0xab, 0, 0, 0];
        bytes.extend_from_slice(&18i32.to_be_bytes());
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.extend_from_slice(&16i32.to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x00, 0xb1]);
        let (body, _, _) = CodeBody::from_raw_code(1, 1, &bytes).unwrap();
        let (label_offsets, _, _) = body.layout().unwrap();
        let out = body.serialize_insns(&label_offsets).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn jump_out_of_range_is_rejected() {
        let bytes = [0xa7, 0x00, 0x7f];
        assert!(CodeBody::from_raw_code(0, 0, &bytes).is_err());
    }
}
