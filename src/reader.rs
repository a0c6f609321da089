use std::collections::BTreeSet;

use anyhow::{Context, Result};
use jclassfile::attributes::Attribute;
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;

use crate::ir::{CallKind, CallSite, Class, Constant, Instruction, InstructionKind, LineNumber, Method};
use crate::opcodes;

const CLASS_MAGIC: u32 = 0xCAFEBABE;
const MIN_SUPPORTED_MAJOR: u16 = 45;
/// Java 25.
const MAX_SUPPORTED_MAJOR: u16 = 69;

/// Parse one class file into its methods' decoded instruction streams.
///
/// The bytes are parsed with `jclassfile` first. Class files it rejects (for
/// example because of attributes it does not know) go through a minimal
/// reader that only understands the constant pool, `Code` and
/// `LineNumberTable`, skipping everything else by length.
pub(crate) fn parse_class(data: &[u8]) -> Result<Class> {
    check_header(data)?;
    match class_file::parse(data) {
        Ok(class_file) => {
            let constant_pool = class_file.constant_pool();
            let name =
                class_name(constant_pool, class_file.this_class()).context("resolve class name")?;
            let methods =
                parse_methods(constant_pool, class_file.methods()).context("parse methods")?;
            Ok(Class { name, methods })
        }
        Err(err) => {
            let primary = format!("{err}");
            parse_class_minimal(data)
                .with_context(|| format!("failed to parse class file bytes ({primary})"))
        }
    }
}

fn check_header(data: &[u8]) -> Result<()> {
    let mut cursor = ByteCursor::new(data);
    let magic = cursor.u32().context("read class header")?;
    if magic != CLASS_MAGIC {
        anyhow::bail!("invalid class file magic 0x{magic:08x}");
    }
    let _minor = cursor.u16().context("read class header")?;
    let major = cursor.u16().context("read class header")?;
    if !(MIN_SUPPORTED_MAJOR..=MAX_SUPPORTED_MAJOR).contains(&major) {
        anyhow::bail!("unsupported class file version {major}");
    }
    Ok(())
}

/// Constant pool lookups needed to decode bytecode.
pub(crate) trait ConstantPoolView {
    fn method_ref(&self, index: u16) -> Result<MethodRef>;
    /// String, Integer or Long constant at `index`; `None` for other loadable constants.
    fn loadable_constant(&self, index: u16) -> Result<Option<Constant>>;
}

/// Resolved constant pool method reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl ConstantPoolView for [ConstantPool] {
    fn method_ref(&self, index: u16) -> Result<MethodRef> {
        let (ConstantPool::Methodref {
            class_index,
            name_and_type_index,
        }
        | ConstantPool::InterfaceMethodref {
            class_index,
            name_and_type_index,
        }) = pool_entry(self, index)?
        else {
            anyhow::bail!("constant #{index} is not a method reference");
        };
        let ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        } = pool_entry(self, *name_and_type_index)?
        else {
            anyhow::bail!("constant #{name_and_type_index} is not a name and type");
        };
        Ok(MethodRef {
            owner: class_name(self, *class_index).context("resolve owner")?,
            name: utf8(self, *name_index).context("resolve method name")?,
            descriptor: utf8(self, *descriptor_index).context("resolve method descriptor")?,
        })
    }

    fn loadable_constant(&self, index: u16) -> Result<Option<Constant>> {
        let constant = match pool_entry(self, index)? {
            ConstantPool::String { string_index } => Constant::String(utf8(self, *string_index)?),
            ConstantPool::Integer { value } => Constant::Int(*value),
            ConstantPool::Long { value } => Constant::Long(*value),
            _ => return Ok(None),
        };
        Ok(Some(constant))
    }
}

fn pool_entry(pool: &[ConstantPool], index: u16) -> Result<&ConstantPool> {
    pool.get(usize::from(index))
        .with_context(|| format!("constant #{index} out of range"))
}

fn class_name(pool: &[ConstantPool], index: u16) -> Result<String> {
    match pool_entry(pool, index)? {
        ConstantPool::Class { name_index } => utf8(pool, *name_index),
        _ => anyhow::bail!("constant #{index} is not a class"),
    }
}

fn utf8(pool: &[ConstantPool], index: u16) -> Result<String> {
    match pool_entry(pool, index)? {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("constant #{index} is not UTF-8"),
    }
}

fn parse_methods(
    pool: &[ConstantPool],
    methods: &[jclassfile::methods::MethodInfo],
) -> Result<Vec<Method>> {
    let mut parsed = Vec::with_capacity(methods.len());
    for method in methods {
        // Abstract and native methods have no body to scan.
        let Some((code, exception_table, code_attributes)) =
            method.attributes().iter().find_map(|attribute| match attribute {
                Attribute::Code {
                    code,
                    exception_table,
                    attributes,
                    ..
                } => Some((code, exception_table, attributes)),
                _ => None,
            })
        else {
            continue;
        };
        let name = utf8(pool, method.name_index()).context("resolve method name")?;
        let descriptor =
            utf8(pool, method.descriptor_index()).context("resolve method descriptor")?;
        let handlers: Vec<u32> = exception_table
            .iter()
            .map(|entry| u32::from(entry.handler_pc()))
            .collect();
        let instructions = decode_bytecode(code, pool, &handlers)
            .with_context(|| format!("decode bytecode of {name}{descriptor}"))?;
        parsed.push(Method {
            name,
            descriptor,
            instructions,
            line_numbers: line_numbers(code_attributes),
        });
    }
    Ok(parsed)
}

fn line_numbers(attributes: &[Attribute]) -> Vec<LineNumber> {
    let mut entries: Vec<LineNumber> = attributes
        .iter()
        .filter_map(|attribute| match attribute {
            Attribute::LineNumberTable { line_number_table } => Some(line_number_table),
            _ => None,
        })
        .flatten()
        .map(|record| LineNumber {
            start_pc: u32::from(record.start_pc()),
            line: u32::from(record.line_number()),
        })
        .collect();
    entries.sort_by_key(|entry| entry.start_pc);
    entries
}

/// Constant pool entries kept by the minimal reader.
#[derive(Clone, Debug)]
enum PoolEntry {
    Utf8(String),
    Class(u16),
    String(u16),
    Integer(i32),
    Long(i64),
    NameAndType(u16, u16),
    MethodRef(u16, u16),
    Other,
}

/// Constant pool decoded by the minimal reader, indexed like the class file.
struct MinimalPool {
    entries: Vec<PoolEntry>,
}

impl MinimalPool {
    fn utf8(&self, index: u16) -> Result<String> {
        match self.entries.get(index as usize) {
            Some(PoolEntry::Utf8(value)) => Ok(value.clone()),
            _ => anyhow::bail!("missing utf8 entry {index}"),
        }
    }

    fn class_name(&self, index: u16) -> Result<String> {
        match self.entries.get(index as usize) {
            Some(PoolEntry::Class(name_index)) => self.utf8(*name_index),
            _ => anyhow::bail!("missing class entry {index}"),
        }
    }
}

impl ConstantPoolView for MinimalPool {
    fn method_ref(&self, index: u16) -> Result<MethodRef> {
        let Some(PoolEntry::MethodRef(class_index, name_and_type_index)) =
            self.entries.get(index as usize)
        else {
            anyhow::bail!("missing method ref entry {index}");
        };
        let owner = self.class_name(*class_index).context("resolve owner")?;
        let Some(PoolEntry::NameAndType(name_index, descriptor_index)) =
            self.entries.get(*name_and_type_index as usize)
        else {
            anyhow::bail!("missing name and type entry {name_and_type_index}");
        };
        Ok(MethodRef {
            owner,
            name: self.utf8(*name_index).context("resolve method name")?,
            descriptor: self
                .utf8(*descriptor_index)
                .context("resolve method descriptor")?,
        })
    }

    fn loadable_constant(&self, index: u16) -> Result<Option<Constant>> {
        match self.entries.get(index as usize) {
            Some(PoolEntry::String(utf8_index)) => {
                Ok(Some(Constant::String(self.utf8(*utf8_index)?)))
            }
            Some(PoolEntry::Integer(value)) => Ok(Some(Constant::Int(*value))),
            Some(PoolEntry::Long(value)) => Ok(Some(Constant::Long(*value))),
            Some(_) => Ok(None),
            None => anyhow::bail!("missing constant pool entry {index}"),
        }
    }
}

/// Big-endian reader over class file bytes.
struct ByteCursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .context("class file out of bounds")?;
        let slice = self
            .data
            .get(self.position..end)
            .with_context(|| format!("class file out of bounds at byte {}", self.position))?;
        self.position = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok((u64::from(self.u32()?) << 32) | u64::from(self.u32()?))
    }

    /// Attribute header: pool index of its name and its payload.
    fn attribute(&mut self) -> Result<(u16, &'a [u8])> {
        let name_index = self.u16()?;
        let len = self.u32()? as usize;
        Ok((name_index, self.take(len)?))
    }

    fn skip_attributes(&mut self) -> Result<()> {
        for _ in 0..self.u16()? {
            self.attribute()?;
        }
        Ok(())
    }
}

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_METHOD_REF: u8 = 10;
const TAG_INTERFACE_METHOD_REF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;

/// Payload size of constant pool entries the minimal reader does not keep.
fn skipped_entry_size(tag: u8) -> Option<usize> {
    match tag {
        // Float, Fieldref, Dynamic, InvokeDynamic
        4 | 9 | 17 | 18 => Some(4),
        // MethodHandle
        15 => Some(3),
        // MethodType, Module, Package
        16 | 19 | 20 => Some(2),
        _ => None,
    }
}

fn parse_class_minimal(data: &[u8]) -> Result<Class> {
    let mut cursor = ByteCursor::new(data);
    cursor.skip(8)?;
    let pool = parse_constant_pool_minimal(&mut cursor).context("parse constant pool")?;
    let _access_flags = cursor.u16()?;
    let name = pool
        .class_name(cursor.u16()?)
        .context("resolve class name")?;
    let _super_class = cursor.u16()?;

    let interface_count = cursor.u16()? as usize;
    cursor.skip(interface_count * 2)?;
    for _ in 0..cursor.u16()? {
        cursor.skip(6)?;
        cursor.skip_attributes().context("skip field attributes")?;
    }

    let mut methods = Vec::new();
    for _ in 0..cursor.u16()? {
        let _access_flags = cursor.u16()?;
        let method_name = pool.utf8(cursor.u16()?).context("resolve method name")?;
        let descriptor = pool
            .utf8(cursor.u16()?)
            .context("resolve method descriptor")?;
        let mut body = None;
        for _ in 0..cursor.u16()? {
            let (name_index, payload) = cursor.attribute()?;
            if pool.utf8(name_index)? == "Code" {
                body = Some(
                    parse_code_minimal(payload, &pool)
                        .with_context(|| format!("parse code of {method_name}{descriptor}"))?,
                );
            }
        }
        if let Some((instructions, line_numbers)) = body {
            methods.push(Method {
                name: method_name,
                descriptor,
                instructions,
                line_numbers,
            });
        }
    }

    Ok(Class { name, methods })
}

fn parse_constant_pool_minimal(cursor: &mut ByteCursor<'_>) -> Result<MinimalPool> {
    let count = cursor.u16()? as usize;
    // Slot 0 is unused; Long and Double occupy two slots.
    let mut entries = vec![PoolEntry::Other];
    while entries.len() < count {
        let tag = cursor.u8()?;
        let entry = match tag {
            TAG_UTF8 => {
                let len = cursor.u16()? as usize;
                PoolEntry::Utf8(String::from_utf8_lossy(cursor.take(len)?).into_owned())
            }
            TAG_INTEGER => PoolEntry::Integer(cursor.u32()? as i32),
            TAG_LONG | TAG_DOUBLE => {
                let bits = cursor.u64()?;
                let entry = if tag == TAG_LONG {
                    PoolEntry::Long(bits as i64)
                } else {
                    PoolEntry::Other
                };
                entries.push(entry);
                // The slot after a Long or Double is unusable.
                PoolEntry::Other
            }
            TAG_CLASS => PoolEntry::Class(cursor.u16()?),
            TAG_STRING => PoolEntry::String(cursor.u16()?),
            TAG_METHOD_REF | TAG_INTERFACE_METHOD_REF => {
                PoolEntry::MethodRef(cursor.u16()?, cursor.u16()?)
            }
            TAG_NAME_AND_TYPE => PoolEntry::NameAndType(cursor.u16()?, cursor.u16()?),
            _ => {
                let size = skipped_entry_size(tag)
                    .with_context(|| format!("unknown constant pool tag {tag}"))?;
                cursor.skip(size)?;
                PoolEntry::Other
            }
        };
        entries.push(entry);
    }
    Ok(MinimalPool { entries })
}

fn parse_code_minimal(
    payload: &[u8],
    pool: &MinimalPool,
) -> Result<(Vec<Instruction>, Vec<LineNumber>)> {
    let mut cursor = ByteCursor::new(payload);
    let _max_stack = cursor.u16()?;
    let _max_locals = cursor.u16()?;
    let code_length = cursor.u32()? as usize;
    let code = cursor.take(code_length)?;
    let mut handlers = Vec::new();
    for _ in 0..cursor.u16()? {
        // start_pc, end_pc, handler_pc, catch_type
        cursor.skip(4)?;
        handlers.push(u32::from(cursor.u16()?));
        cursor.skip(2)?;
    }

    let mut line_numbers = Vec::new();
    for _ in 0..cursor.u16()? {
        let (name_index, body) = cursor.attribute()?;
        if pool.utf8(name_index)? != "LineNumberTable" {
            continue;
        }
        let mut table = ByteCursor::new(body);
        for _ in 0..table.u16()? {
            line_numbers.push(LineNumber {
                start_pc: u32::from(table.u16()?),
                line: u32::from(table.u16()?),
            });
        }
    }
    line_numbers.sort_by_key(|entry| entry.start_pc);

    Ok((decode_bytecode(code, pool, &handlers)?, line_numbers))
}

/// Decode a method body into instructions, resolving invocations and literals.
///
/// Instructions reached by a branch, a switch, a `jsr` return or one of the
/// exception `handlers` are flagged as jump targets.
pub(crate) fn decode_bytecode<P>(
    code: &[u8],
    constant_pool: &P,
    handlers: &[u32],
) -> Result<Vec<Instruction>>
where
    P: ConstantPoolView + ?Sized,
{
    let mut instructions = Vec::new();
    let mut targets: BTreeSet<u32> = handlers.iter().copied().collect();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let start_offset = offset as u32;
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        let kind = match opcode {
            opcodes::INVOKEVIRTUAL
            | opcodes::INVOKESPECIAL
            | opcodes::INVOKESTATIC
            | opcodes::INVOKEINTERFACE => {
                let method_index = read_u16(code, offset + 1)?;
                let method_ref = constant_pool
                    .method_ref(method_index)
                    .with_context(|| format!("resolve method ref at offset {offset}"))?;
                let kind = match opcode {
                    opcodes::INVOKESPECIAL => CallKind::Special,
                    opcodes::INVOKESTATIC => CallKind::Static,
                    opcodes::INVOKEINTERFACE => CallKind::Interface,
                    _ => CallKind::Virtual,
                };
                InstructionKind::Invoke(CallSite {
                    owner: method_ref.owner,
                    name: method_ref.name,
                    descriptor: method_ref.descriptor,
                    kind,
                    offset: start_offset,
                })
            }
            opcodes::LDC | opcodes::LDC_W => {
                let index = if opcode == opcodes::LDC {
                    code[offset + 1] as u16
                } else {
                    read_u16(code, offset + 1)?
                };
                match constant_pool.loadable_constant(index)? {
                    Some(Constant::Long(_)) | None => InstructionKind::Push(opcode),
                    Some(constant) => InstructionKind::Constant(constant),
                }
            }
            opcodes::LDC2_W => {
                let index = read_u16(code, offset + 1)?;
                match constant_pool.loadable_constant(index)? {
                    Some(constant @ Constant::Long(_)) => InstructionKind::Constant(constant),
                    _ => InstructionKind::Push(opcode),
                }
            }
            opcodes::ICONST_M1..=opcodes::ICONST_5 => {
                InstructionKind::Constant(Constant::Int(opcode as i32 - opcodes::ICONST_0 as i32))
            }
            opcodes::BIPUSH => InstructionKind::Constant(Constant::Int(code[offset + 1] as i8 as i32)),
            opcodes::SIPUSH => {
                let value = read_u16(code, offset + 1)? as i16;
                InstructionKind::Constant(Constant::Int(value as i32))
            }
            opcodes::ACONST_NULL
            | opcodes::LCONST_0..=opcodes::DCONST_1
            | opcodes::ILOAD..=opcodes::ALOAD
            | opcodes::ILOAD_0..=opcodes::ALOAD_3
            | opcodes::GETSTATIC => InstructionKind::Push(opcode),
            opcodes::WIDE if matches!(code[offset + 1], opcodes::ILOAD..=opcodes::ALOAD) => {
                InstructionKind::Push(opcode)
            }
            _ => InstructionKind::Other(opcode),
        };
        branch_targets(code, offset, length, &mut targets)?;

        instructions.push(Instruction {
            offset: start_offset,
            kind,
            jump_target: false,
        });
        offset += length;
    }
    for instruction in &mut instructions {
        instruction.jump_target = targets.contains(&instruction.offset);
    }
    Ok(instructions)
}

/// Record every offset the instruction at `offset` can transfer control to,
/// other than its fall-through successor.
fn branch_targets(
    code: &[u8],
    offset: usize,
    length: usize,
    targets: &mut BTreeSet<u32>,
) -> Result<()> {
    let opcode = code[offset];
    match opcode {
        opcodes::IFEQ..=opcodes::JSR | opcodes::IFNULL | opcodes::IFNONNULL => {
            let delta = i32::from(read_u16(code, offset + 1)? as i16);
            targets.insert(relative_target(offset, delta)?);
        }
        opcodes::GOTO_W | opcodes::JSR_W => {
            targets.insert(relative_target(offset, read_i32(code, offset + 1)?)?);
        }
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => {
            for delta in switch_offsets(code, offset)? {
                targets.insert(relative_target(offset, delta)?);
            }
        }
        _ => {}
    }
    if matches!(opcode, opcodes::JSR | opcodes::JSR_W) {
        // `ret` resumes after the subroutine call.
        targets.insert((offset + length) as u32);
    }
    Ok(())
}

fn relative_target(offset: usize, delta: i32) -> Result<u32> {
    u32::try_from(offset as i64 + i64::from(delta))
        .with_context(|| format!("branch at offset {offset} jumps before the method start"))
}

/// Default and case jump offsets of a `tableswitch` or `lookupswitch`.
fn switch_offsets(code: &[u8], offset: usize) -> Result<Vec<i32>> {
    let operands = offset + 1 + (4 - (offset + 1) % 4) % 4;
    let mut offsets = vec![read_i32(code, operands)?];
    if code[offset] == opcodes::TABLESWITCH {
        let low = i64::from(read_i32(code, operands + 4)?);
        let high = i64::from(read_i32(code, operands + 8)?);
        for case in 0..(high - low + 1).max(0) as usize {
            offsets.push(read_i32(code, operands + 12 + case * 4)?);
        }
    } else {
        let pairs = read_i32(code, operands + 4)?.max(0) as usize;
        for pair in 0..pairs {
            offsets.push(read_i32(code, operands + 8 + pair * 8 + 4)?);
        }
    }
    Ok(offsets)
}

fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        opcodes::BIPUSH => 2,
        opcodes::SIPUSH => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        opcodes::IINC => 3,
        0x85..=0x98 => 1,
        0x99..=0xa6 => 3,
        opcodes::GOTO | opcodes::JSR => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => switch_length(code, offset)?,
        0xac..=0xb1 => 1,
        0xb2..=0xb5 => 3,
        opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        0xc5 => 4,
        0xc6 | 0xc7 => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        0xca => 1,
        0xfe | 0xff => 1,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

/// Length of a `tableswitch` or `lookupswitch`, including alignment padding.
fn switch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = (4 - (offset + 1) % 4) % 4;
    let operands = offset + 1 + padding;
    let (header, entries, entry_size) = if code[offset] == opcodes::TABLESWITCH {
        let low = read_i32(code, operands + 4)?;
        let high = read_i32(code, operands + 8)?;
        (12, i64::from(high) - i64::from(low) + 1, 4)
    } else {
        (8, i64::from(read_i32(code, operands + 4)?), 8)
    };
    let entries = usize::try_from(entries)
        .with_context(|| format!("invalid switch table size at offset {offset}"))?;
    Ok(1 + padding + header + entries * entry_size)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    match code.get(offset + 1) {
        Some(&opcodes::IINC) => Ok(6),
        Some(_) => Ok(4),
        None => anyhow::bail!("truncated wide instruction at offset {offset}"),
    }
}

fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode i32 out of bounds")?;
    Ok(i32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::{
        ClassFileBuilder, PathArgument, file_reader_class, high, low, plain_class,
        ternary_property_class,
    };

    fn calls(class: &Class) -> Vec<(String, String, String, u32)> {
        class
            .methods
            .iter()
            .flat_map(|method| method.instructions.iter())
            .filter_map(|instruction| match &instruction.kind {
                InstructionKind::Invoke(call) => Some((
                    call.owner.clone(),
                    call.name.clone(),
                    call.descriptor.clone(),
                    call.offset,
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn parses_methods_calls_and_lines() {
        let bytes = file_reader_class(
            "com/example/Reader",
            PathArgument::Literal("/tmp/x"),
            Some(12),
        );

        let class = parse_class(&bytes).expect("parse class");

        assert_eq!(class.name, "com/example/Reader");
        assert_eq!(class.methods.len(), 1);
        assert_eq!(class.methods[0].name, "read");
        assert_eq!(
            class.methods[0].line_numbers,
            vec![LineNumber {
                start_pc: 0,
                line: 12
            }]
        );
        assert_eq!(
            calls(&class),
            vec![(
                "java/io/FileInputStream".to_string(),
                "<init>".to_string(),
                "(Ljava/lang/String;)V".to_string(),
                6
            )]
        );
        assert_eq!(
            class.methods[0].instructions[2].kind,
            InstructionKind::Constant(Constant::String("/tmp/x".to_string()))
        );
    }

    #[test]
    fn minimal_reader_matches_primary_reader() {
        let bytes = file_reader_class("com/example/Reader", PathArgument::Computed, Some(3));

        let primary = parse_class(&bytes).expect("parse class");
        let minimal = parse_class_minimal(&bytes).expect("parse class minimally");

        assert_eq!(primary, minimal);
    }

    #[test]
    fn unknown_method_attribute_does_not_hide_calls() {
        let mut builder = ClassFileBuilder::new("com/example/Exit");
        let exit = builder.add_method_ref("java/lang/System", "exit", "(I)V");
        builder.add_method(
            "stop",
            "()V",
            vec![0x04, 0xb8, high(exit), low(exit), 0xb1],
            vec![(0, 7)],
        );
        builder.add_custom_method_attribute("com.example.FutureAttribute", vec![1, 2, 3, 4, 5]);
        let bytes = builder.finish();

        let class = parse_class(&bytes).expect("parse class");

        assert_eq!(
            calls(&class),
            vec![(
                "java/lang/System".to_string(),
                "exit".to_string(),
                "(I)V".to_string(),
                1
            )]
        );
        assert_eq!(
            class.methods[0].instructions[0].kind,
            InstructionKind::Constant(Constant::Int(1))
        );
    }

    #[test]
    fn rejects_invalid_magic() {
        let err = parse_class(b"nope, not a class").expect_err("invalid class");
        assert!(format!("{err:#}").contains("invalid class file magic"));
    }

    #[test]
    fn rejects_truncated_class() {
        let bytes = plain_class("com/example/Plain");
        let truncated = &bytes[..bytes.len() / 2];

        assert!(parse_class(&bytes[..6]).is_err());
        assert!(parse_class_minimal(truncated).is_err());
    }

    #[test]
    fn rejects_unsupported_version() {
        let bytes = ClassFileBuilder::new("com/example/Future")
            .major_version(99)
            .finish();

        let err = parse_class(&bytes).expect_err("unsupported version");

        assert!(format!("{err:#}").contains("unsupported class file version 99"));
    }

    fn jump_targets(class: &Class) -> Vec<u32> {
        class.methods[0]
            .instructions
            .iter()
            .filter(|instruction| instruction.jump_target)
            .map(|instruction| instruction.offset)
            .collect()
    }

    #[test]
    fn branch_destinations_are_jump_targets() {
        let bytes = ternary_property_class();

        let primary = parse_class(&bytes).expect("parse class");
        let minimal = parse_class_minimal(&bytes).expect("parse class minimally");

        assert_eq!(jump_targets(&primary), vec![9, 11]);
        assert_eq!(primary, minimal);
    }

    #[test]
    fn exception_handler_entry_is_a_jump_target() {
        let mut builder = ClassFileBuilder::new("com/example/Fallback");
        let first = builder.add_string("a.prop");
        let second = builder.add_string("b.prop");
        let get_property = builder.add_method_ref(
            "java/lang/System",
            "getProperty",
            "(Ljava/lang/String;)Ljava/lang/String;",
        );
        let code = vec![
            0x12, first as u8, // 0: ldc "a.prop"
            0xb8, high(get_property), low(get_property), // 2: invokestatic
            0x57, // 5: pop
            0xb1, // 6: return
            0x4c, // 7: astore_1
            0x12, second as u8, // 8: ldc "b.prop"
            0xb8, high(get_property), low(get_property), // 10: invokestatic
            0x57, // 13: pop
            0xb1, // 14: return
        ];
        builder.add_method("lookup", "()V", code, Vec::new());
        builder.add_exception_handler(0, 7, 7);
        let bytes = builder.finish();

        let primary = parse_class(&bytes).expect("parse class");
        let minimal = parse_class_minimal(&bytes).expect("parse class minimally");

        assert_eq!(jump_targets(&primary), vec![7]);
        assert_eq!(primary, minimal);
    }

    #[test]
    fn switch_cases_and_jsr_return_are_jump_targets() {
        let pool: Vec<ConstantPool> = vec![ConstantPool::Utf8 {
            value: String::new(),
        }];
        let code = vec![
            0x1a, // 0: iload_0
            0xab, 0x00, 0x00, // 1: lookupswitch, padded to offset 4
            0x00, 0x00, 0x00, 0x1b, // default 28
            0x00, 0x00, 0x00, 0x01, // one pair
            0x00, 0x00, 0x00, 0x07, // match 7
            0x00, 0x00, 0x00, 0x17, // 24
            0x00, 0x00, 0x00, // 20: nop padding
            0x00, // 23: nop
            0xa8, 0x00, 0x04, // 24: jsr 28
            0xb1, // 27: return
            0xb1, // 28: return
        ];

        let instructions = decode_bytecode(&code, pool.as_slice(), &[]).expect("decode");

        let targets: Vec<u32> = instructions
            .iter()
            .filter(|instruction| instruction.jump_target)
            .map(|instruction| instruction.offset)
            .collect();
        assert_eq!(targets, vec![24, 27, 28]);
    }

    #[test]
    fn integer_and_long_pool_constants_are_literals() {
        let mut builder = ClassFileBuilder::new("com/example/Server");
        let timeout = builder.add_long(30_000_000_000);
        let port = builder.add_integer(50_000);
        let socket_class = builder.add_class("java/net/ServerSocket");
        let socket_init = builder.add_method_ref("java/net/ServerSocket", "<init>", "(I)V");
        let code = vec![
            0x14, high(timeout), low(timeout), // ldc2_w 30000000000L
            0x58, // pop2
            0xbb, high(socket_class), low(socket_class), // new
            0x59, // dup
            0x12, port as u8, // ldc 50000
            0xb7, high(socket_init), low(socket_init), // invokespecial
            0x57, // pop
            0xb1,
        ];
        builder.add_method("listen", "()V", code, vec![(0, 9)]);
        let bytes = builder.finish();

        let primary = parse_class(&bytes).expect("parse class");
        let minimal = parse_class_minimal(&bytes).expect("parse class minimally");

        let instructions = &primary.methods[0].instructions;
        assert_eq!(
            instructions[0].kind,
            InstructionKind::Constant(Constant::Long(30_000_000_000))
        );
        assert_eq!(
            instructions[4].kind,
            InstructionKind::Constant(Constant::Int(50_000))
        );
        assert_eq!(primary, minimal);
    }

    #[test]
    fn decodes_integer_pushes_and_skips_switch_padding() {
        let pool: Vec<ConstantPool> = vec![ConstantPool::Utf8 {
            value: String::new(),
        }];
        let code = vec![
            0x10, 0xfe, // bipush -2
            0x11, 0x1f, 0x90, // sipush 8080
            0x2b, // aload_1
            0xaa, 0x00, // tableswitch, padded to offset 8
            0x00, 0x00, 0x00, 0x10, // default
            0x00, 0x00, 0x00, 0x00, // low
            0x00, 0x00, 0x00, 0x00, // high
            0x00, 0x00, 0x00, 0x10, // one jump offset
            0xb1,
        ];

        let instructions = decode_bytecode(&code, pool.as_slice(), &[]).expect("decode");

        let kinds: Vec<InstructionKind> = instructions.into_iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![
                InstructionKind::Constant(Constant::Int(-2)),
                InstructionKind::Constant(Constant::Int(8080)),
                InstructionKind::Push(0x2b),
                InstructionKind::Other(0xaa),
                InstructionKind::Other(0xb1),
            ]
        );
    }
}
