use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use zip::write::SimpleFileOptions;

/// Minimal class file writer for tests.
pub(crate) struct ClassFileBuilder {
    cp: Vec<CpEntry>,
    this_class: u16,
    super_class: u16,
    methods: Vec<MethodSpec>,
    code_index: u16,
    line_table_index: u16,
    major_version: u16,
}

impl ClassFileBuilder {
    pub(crate) fn new(class_name: &str) -> Self {
        let mut builder = Self {
            cp: Vec::new(),
            this_class: 0,
            super_class: 0,
            methods: Vec::new(),
            code_index: 0,
            line_table_index: 0,
            major_version: 52,
        };
        builder.code_index = builder.add_utf8("Code");
        builder.line_table_index = builder.add_utf8("LineNumberTable");
        builder.this_class = builder.add_class(class_name);
        builder.super_class = builder.add_class("java/lang/Object");
        builder
    }

    pub(crate) fn major_version(mut self, major_version: u16) -> Self {
        self.major_version = major_version;
        self
    }

    pub(crate) fn add_utf8(&mut self, value: &str) -> u16 {
        self.cp.push(CpEntry::Utf8(value.to_string()));
        self.cp.len() as u16
    }

    pub(crate) fn add_class(&mut self, name: &str) -> u16 {
        let name_index = self.add_utf8(name);
        self.cp.push(CpEntry::Class(name_index));
        self.cp.len() as u16
    }

    pub(crate) fn add_string(&mut self, value: &str) -> u16 {
        let utf8_index = self.add_utf8(value);
        self.cp.push(CpEntry::String(utf8_index));
        self.cp.len() as u16
    }

    pub(crate) fn add_integer(&mut self, value: i32) -> u16 {
        self.cp.push(CpEntry::Integer(value));
        self.cp.len() as u16
    }

    /// Longs take two pool slots; the returned index is the first.
    pub(crate) fn add_long(&mut self, value: i64) -> u16 {
        self.cp.push(CpEntry::Long(value));
        let index = self.cp.len() as u16;
        self.cp.push(CpEntry::Gap);
        index
    }

    pub(crate) fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.cp
            .push(CpEntry::NameAndType(name_index, descriptor_index));
        self.cp.len() as u16
    }

    pub(crate) fn add_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.add_class(class);
        let name_and_type = self.add_name_and_type(name, descriptor);
        self.cp
            .push(CpEntry::MethodRef(class_index, name_and_type));
        self.cp.len() as u16
    }

    /// Add a method; an empty `lines` list omits the LineNumberTable attribute.
    pub(crate) fn add_method(
        &mut self,
        name: &str,
        descriptor: &str,
        code: Vec<u8>,
        lines: Vec<(u16, u16)>,
    ) {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.methods.push(MethodSpec {
            name_index,
            descriptor_index,
            code,
            lines,
            handlers: Vec::new(),
            extra_attribute: None,
        });
    }

    /// Add a catch-all handler at `handler_pc` covering `start_pc..end_pc` of the last method.
    pub(crate) fn add_exception_handler(&mut self, start_pc: u16, end_pc: u16, handler_pc: u16) {
        if let Some(method) = self.methods.last_mut() {
            method.handlers.push((start_pc, end_pc, handler_pc));
        }
    }

    /// Attach an attribute no reader knows about to the most recently added method.
    pub(crate) fn add_custom_method_attribute(&mut self, name: &str, payload: Vec<u8>) {
        let name_index = self.add_utf8(name);
        if let Some(method) = self.methods.last_mut() {
            method.extra_attribute = Some((name_index, payload));
        }
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0xCAFEBABE);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, self.major_version);
        write_u16(&mut bytes, (self.cp.len() + 1) as u16);
        for entry in &self.cp {
            entry.write(&mut bytes);
        }
        write_u16(&mut bytes, 0x0021);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, self.methods.len() as u16);
        for method in &self.methods {
            write_u16(&mut bytes, 0x0001);
            write_u16(&mut bytes, method.name_index);
            write_u16(&mut bytes, method.descriptor_index);
            let attribute_count = if method.extra_attribute.is_some() { 2 } else { 1 };
            write_u16(&mut bytes, attribute_count);

            let mut code_attributes = Vec::new();
            let mut code_attribute_count = 0u16;
            if !method.lines.is_empty() {
                code_attribute_count += 1;
                write_u16(&mut code_attributes, self.line_table_index);
                write_u32(&mut code_attributes, 2 + 4 * method.lines.len() as u32);
                write_u16(&mut code_attributes, method.lines.len() as u16);
                for (start_pc, line) in &method.lines {
                    write_u16(&mut code_attributes, *start_pc);
                    write_u16(&mut code_attributes, *line);
                }
            }

            write_u16(&mut bytes, self.code_index);
            let attr_len = 12
                + method.code.len() as u32
                + 8 * method.handlers.len() as u32
                + code_attributes.len() as u32;
            write_u32(&mut bytes, attr_len);
            write_u16(&mut bytes, 8);
            write_u16(&mut bytes, 8);
            write_u32(&mut bytes, method.code.len() as u32);
            bytes.extend_from_slice(&method.code);
            write_u16(&mut bytes, method.handlers.len() as u16);
            for (start_pc, end_pc, handler_pc) in &method.handlers {
                write_u16(&mut bytes, *start_pc);
                write_u16(&mut bytes, *end_pc);
                write_u16(&mut bytes, *handler_pc);
                write_u16(&mut bytes, 0);
            }
            write_u16(&mut bytes, code_attribute_count);
            bytes.extend_from_slice(&code_attributes);

            if let Some((name_index, payload)) = &method.extra_attribute {
                write_u16(&mut bytes, *name_index);
                write_u32(&mut bytes, payload.len() as u32);
                bytes.extend_from_slice(payload);
            }
        }
        write_u16(&mut bytes, 0);
        bytes
    }
}

/// Method definition for generated class files.
struct MethodSpec {
    name_index: u16,
    descriptor_index: u16,
    code: Vec<u8>,
    lines: Vec<(u16, u16)>,
    handlers: Vec<(u16, u16, u16)>,
    extra_attribute: Option<(u16, Vec<u8>)>,
}

/// Constant pool entries needed by generated class files.
enum CpEntry {
    Utf8(String),
    Class(u16),
    String(u16),
    Integer(i32),
    Long(i64),
    /// Unusable slot after a Long.
    Gap,
    NameAndType(u16, u16),
    MethodRef(u16, u16),
}

impl CpEntry {
    fn write(&self, bytes: &mut Vec<u8>) {
        match self {
            CpEntry::Utf8(value) => {
                bytes.push(1);
                write_u16(bytes, value.len() as u16);
                bytes.extend_from_slice(value.as_bytes());
            }
            CpEntry::Class(name_index) => {
                bytes.push(7);
                write_u16(bytes, *name_index);
            }
            CpEntry::String(utf8_index) => {
                bytes.push(8);
                write_u16(bytes, *utf8_index);
            }
            CpEntry::Integer(value) => {
                bytes.push(3);
                bytes.extend_from_slice(&value.to_be_bytes());
            }
            CpEntry::Long(value) => {
                bytes.push(5);
                bytes.extend_from_slice(&value.to_be_bytes());
            }
            CpEntry::Gap => {}
            CpEntry::NameAndType(name_index, descriptor_index) => {
                bytes.push(12);
                write_u16(bytes, *name_index);
                write_u16(bytes, *descriptor_index);
            }
            CpEntry::MethodRef(class_index, name_and_type) => {
                bytes.push(10);
                write_u16(bytes, *class_index);
                write_u16(bytes, *name_and_type);
            }
        }
    }
}

fn write_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

fn write_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn high(value: u16) -> u8 {
    (value >> 8) as u8
}

pub(crate) fn low(value: u16) -> u8 {
    (value & 0xff) as u8
}

/// How the path argument of a generated `FileInputStream` call is produced.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PathArgument<'a> {
    Literal(&'a str),
    /// `path.trim()` on a local, so no literal precedes the call.
    Computed,
}

/// Build a class whose `read` method opens a `FileInputStream`.
///
/// The constructor call sits at bytecode offset 6 (literal) or 8 (computed).
/// With `line` set, the whole body is attributed to that source line.
pub(crate) fn file_reader_class(
    class_name: &str,
    argument: PathArgument<'_>,
    line: Option<u16>,
) -> Vec<u8> {
    let mut builder = ClassFileBuilder::new(class_name);
    let stream_class = builder.add_class("java/io/FileInputStream");
    let stream_init =
        builder.add_method_ref("java/io/FileInputStream", "<init>", "(Ljava/lang/String;)V");
    let mut code = vec![0xbb, high(stream_class), low(stream_class), 0x59];
    match argument {
        PathArgument::Literal(path) => {
            let path_index = builder.add_string(path);
            assert!(path_index < 256, "ldc index must fit in one byte");
            code.extend_from_slice(&[0x12, path_index as u8]);
        }
        PathArgument::Computed => {
            let trim = builder.add_method_ref("java/lang/String", "trim", "()Ljava/lang/String;");
            code.extend_from_slice(&[0x2b, 0xb6, high(trim), low(trim)]);
        }
    }
    code.extend_from_slice(&[0xb7, high(stream_init), low(stream_init), 0x57, 0xb1]);
    let lines = line.map(|line| vec![(0, line)]).unwrap_or_default();
    builder.add_method("read", "(Ljava/lang/String;)V", code, lines);
    builder.finish()
}

/// Build a class whose `lookup(Z)V` reads `System.getProperty(flag ? "a.prop" : "b.prop")`.
///
/// Branch destinations sit at offsets 9 and 11; the call is at 11.
pub(crate) fn ternary_property_class() -> Vec<u8> {
    let mut builder = ClassFileBuilder::new("com/example/Config");
    let first = builder.add_string("a.prop");
    let second = builder.add_string("b.prop");
    let get_property = builder.add_method_ref(
        "java/lang/System",
        "getProperty",
        "(Ljava/lang/String;)Ljava/lang/String;",
    );
    let code = vec![
        0x1a, // 0: iload_0
        0x99, 0x00, 0x08, // 1: ifeq 9
        0x12, first as u8, // 4: ldc "a.prop"
        0xa7, 0x00, 0x05, // 6: goto 11
        0x12, second as u8, // 9: ldc "b.prop"
        0xb8, high(get_property), low(get_property), // 11: invokestatic
        0x57, // 14: pop
        0xb1, // 15: return
    ];
    builder.add_method("lookup", "(Z)V", code, vec![(0, 5)]);
    builder.finish()
}

/// Build a class with a single method that calls nothing security sensitive.
pub(crate) fn plain_class(class_name: &str) -> Vec<u8> {
    let mut builder = ClassFileBuilder::new(class_name);
    let object_init = builder.add_method_ref("java/lang/Object", "<init>", "()V");
    let init_code = vec![0x2a, 0xb7, high(object_init), low(object_init), 0xb1];
    builder.add_method("<init>", "()V", init_code, vec![(0, 1)]);
    builder.finish()
}

/// Write a jar containing the given entries.
pub(crate) fn write_jar(path: &Path, entries: &[(&str, Vec<u8>)]) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    for (name, data) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .with_context(|| format!("start entry {name}"))?;
        writer
            .write_all(data)
            .with_context(|| format!("write entry {name}"))?;
    }
    writer.finish().context("finish jar")?;
    Ok(())
}
