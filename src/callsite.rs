use crate::descriptor::method_param_count;
use crate::ir::{CallSite, Constant, Instruction, InstructionKind, Method};

/// Invocation resolved to its static symbol, source line and literal arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ResolvedCall<'a> {
    pub(crate) call: &'a CallSite,
    /// `None` when the method has no line table entry covering the call.
    pub(crate) line: Option<u32>,
    /// One slot per declared parameter; `None` where no literal precedes the call.
    pub(crate) arguments: Vec<Option<Constant>>,
}

/// Lazy iterator over the invocations of one method, in bytecode order.
///
/// A clone resumes from the same position, so cloning an unstarted sequence
/// replays every call site.
#[derive(Clone, Debug)]
pub(crate) struct CallSites<'a> {
    method: &'a Method,
    position: usize,
}

pub(crate) fn call_sites(method: &Method) -> CallSites<'_> {
    CallSites {
        method,
        position: 0,
    }
}

impl<'a> Iterator for CallSites<'a> {
    type Item = ResolvedCall<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let instructions = &self.method.instructions;
        while self.position < instructions.len() {
            let index = self.position;
            self.position += 1;
            let InstructionKind::Invoke(call) = &instructions[index].kind else {
                continue;
            };
            return Some(ResolvedCall {
                call,
                line: self.method.line_for_offset(call.offset),
                arguments: literal_arguments(
                    &instructions[..index],
                    &instructions[index],
                    &call.descriptor,
                ),
            });
        }
        None
    }
}

/// Recover literal arguments from the instructions immediately preceding a call.
///
/// Walks backwards while every instruction pushes exactly one value; the last
/// such push is the last argument. Stops at anything else, and before crossing
/// a jump target, where the linear predecessor may not be the value on the stack.
fn literal_arguments(
    preceding: &[Instruction],
    invoke: &Instruction,
    descriptor: &str,
) -> Vec<Option<Constant>> {
    let Ok(count) = method_param_count(descriptor) else {
        return Vec::new();
    };
    let mut arguments = vec![None; count];
    let mut successor = invoke;
    for (slot, instruction) in (0..count).rev().zip(preceding.iter().rev()) {
        if successor.jump_target {
            break;
        }
        successor = instruction;
        match &instruction.kind {
            InstructionKind::Constant(constant) => arguments[slot] = Some(constant.clone()),
            InstructionKind::Push(_) => {}
            InstructionKind::Invoke(_) | InstructionKind::Other(_) => break,
        }
    }
    arguments
}
