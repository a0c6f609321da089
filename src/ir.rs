/// Intermediate representation for one parsed JVM class.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Class {
    pub(crate) name: String,
    pub(crate) methods: Vec<Method>,
}

/// Intermediate representation for a method and its decoded bytecode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) instructions: Vec<Instruction>,
    /// Sorted by `start_pc`; empty when the class carries no debug info.
    pub(crate) line_numbers: Vec<LineNumber>,
}

impl Method {
    /// Source line of the instruction at `offset`, if the line table covers it.
    pub(crate) fn line_for_offset(&self, offset: u32) -> Option<u32> {
        let index = self
            .line_numbers
            .partition_point(|entry| entry.start_pc <= offset);
        if index == 0 {
            return None;
        }
        Some(self.line_numbers[index - 1].line)
    }
}

/// Line number table entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct LineNumber {
    pub(crate) start_pc: u32,
    pub(crate) line: u32,
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    pub(crate) kind: InstructionKind,
    /// Reached by a branch, switch or exception handler as well as by fall-through.
    pub(crate) jump_target: bool,
}

/// Instruction kinds needed for call-site scanning.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum InstructionKind {
    Invoke(CallSite),
    /// Pushes a literal constant.
    Constant(Constant),
    /// Pushes exactly one value without consuming operands.
    Push(u8),
    Other(u8),
}

/// Literal constant pushed onto the operand stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Constant {
    String(String),
    Int(i32),
    Long(i64),
}

impl Constant {
    pub(crate) fn render(&self) -> String {
        match self {
            Constant::String(value) => value.clone(),
            Constant::Int(value) => value.to_string(),
            Constant::Long(value) => value.to_string(),
        }
    }
}

/// Call site extracted from bytecode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct CallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
    pub(crate) offset: u32,
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}
