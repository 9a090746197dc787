//! The VM's execution loop (§3 "VM machine", §4.4 "Execution").

use super::op;
use super::program::LinkedProgram;
use super::value::Value;
use super::{arg_len, truth_table_binary, truth_table_unary, VmError, CALL_STACK_CAPACITY, STACK_CAPACITY};
use std::collections::HashMap;

/// A call-stack frame: a return address plus a local-variable map keyed by
/// 32-bit index (§3). No opcode in this instruction set reads or writes
/// locals; the slot exists because the invariant names it, and `CALL`/`RET`
/// still need somewhere to hold the return address.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub return_addr: usize,
    pub locals: HashMap<u32, Value>,
}

/// The VM's mutable execution state (§3 "VM machine").
pub struct Machine<'p> {
    program: &'p LinkedProgram,
    stack: Vec<Value>,
    calls: Vec<Frame>,
    pc: usize,
    halted: bool,
}

impl<'p> Machine<'p> {
    pub fn new(program: &'p LinkedProgram) -> Self {
        Self {
            program,
            stack: Vec::with_capacity(STACK_CAPACITY),
            calls: Vec::with_capacity(CALL_STACK_CAPACITY),
            pc: 0,
            halted: false,
        }
    }

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() >= STACK_CAPACITY {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn pop_number(&mut self) -> Result<f64, VmError> {
        self.pop()?.as_number()
    }

    fn pop_bool(&mut self) -> Result<bool, VmError> {
        self.pop()?.as_bool()
    }

    fn read_u32_arg(&self, args: &[u8]) -> u32 {
        u32::from_le_bytes(args.try_into().unwrap())
    }

    fn read_f64_arg(&self, args: &[u8]) -> f64 {
        f64::from_le_bytes(args.try_into().unwrap())
    }

    fn cload(&mut self, idx: usize) -> Result<(), VmError> {
        let value = self
            .program
            .consts
            .get(idx)
            .cloned()
            .ok_or(VmError::UnsupportedConstant)?;
        self.push(value)
    }

    fn jump_target(&mut self) -> Result<usize, VmError> {
        let target = self.pop_number()?;
        if !target.is_finite() || target < 0.0 {
            return Err(VmError::Type);
        }
        Ok(target as usize)
    }

    fn do_call(&mut self, target: usize, return_addr: usize) -> Result<(), VmError> {
        if self.calls.len() >= CALL_STACK_CAPACITY {
            return Err(VmError::CallStackOverflow);
        }
        self.calls.push(Frame {
            return_addr,
            locals: HashMap::new(),
        });
        self.pc = target;
        Ok(())
    }

    /// Executes one decode-dispatch step. Returns `Ok(true)` if the machine
    /// should keep running, `Ok(false)` on normal or `HLT` termination.
    fn step(&mut self) -> Result<bool, VmError> {
        if self.halted || self.pc >= self.program.bytecode.len() {
            return Ok(false);
        }
        let opcode = self.program.bytecode[self.pc];
        let len = arg_len(opcode).ok_or(VmError::BadOpcode(opcode))?;
        let args_start = self.pc + 1;
        let args_end = args_start + len;
        if args_end > self.program.bytecode.len() {
            return Err(VmError::PrematureEnd);
        }
        let args = &self.program.bytecode[args_start..args_end];
        let next_pc = args_end;
        self.pc = next_pc;

        match opcode {
            op::NCONST => self.push(Value::Number(self.read_f64_arg(args)))?,
            op::NCONST_0 => self.push(Value::Number(0.0))?,
            op::NCONST_1 => self.push(Value::Number(1.0))?,
            op::NCONST_2 => self.push(Value::Number(2.0))?,
            op::BCONST_0 => self.push(Value::Bool(false))?,
            op::BCONST_1 => self.push(Value::Bool(true))?,
            op::NILCONST => self.push(Value::Nil)?,
            op::CLOAD => self.cload(self.read_u32_arg(args) as usize)?,

            op::ISNIL => {
                let top = self.stack.last().ok_or(VmError::StackUnderflow)?;
                let result = Value::Bool(top.is_nil());
                self.push(result)?;
            }
            op::KIND => {
                let top = self.stack.last().ok_or(VmError::StackUnderflow)?;
                let result = Value::Number(top.kind_tag());
                self.push(result)?;
            }

            op::DUP => {
                let top = self.stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                self.push(top)?;
            }
            op::DROP => {
                self.pop()?;
            }
            op::SWAP => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }
            op::OVER => {
                if self.stack.len() < 2 {
                    return Err(VmError::StackUnderflow);
                }
                let value = self.stack[self.stack.len() - 2].clone();
                self.push(value)?;
            }
            op::ROT => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(c)?;
                self.push(a)?;
            }

            op::CMP => {
                let b = self.pop()?;
                let a = self.pop()?;
                let ordering = a.spaceship(&b)?;
                self.push(Value::Number(ordering as f64))?;
            }
            op::LT => {
                let n = self.pop_number()?;
                self.push(Value::Bool(n == -1.0))?;
            }
            op::LE => {
                let n = self.pop_number()?;
                self.push(Value::Bool(n == -1.0 || n == 0.0))?;
            }
            op::EQ => {
                let n = self.pop_number()?;
                self.push(Value::Bool(n == 0.0))?;
            }
            op::GE => {
                let n = self.pop_number()?;
                self.push(Value::Bool(n == 0.0 || n == 1.0))?;
            }
            op::GT => {
                let n = self.pop_number()?;
                self.push(Value::Bool(n == 1.0))?;
            }
            op::NE => {
                let n = self.pop_number()?;
                self.push(Value::Bool(n != 0.0))?;
            }

            op::LAND => {
                let b = self.pop_bool()?;
                let a = self.pop_bool()?;
                self.push(Value::Bool(a && b))?;
            }
            op::LOR => {
                let b = self.pop_bool()?;
                let a = self.pop_bool()?;
                self.push(Value::Bool(a || b))?;
            }
            op::LXOR => {
                let b = self.pop_bool()?;
                let a = self.pop_bool()?;
                self.push(Value::Bool(a ^ b))?;
            }
            op::LNOT => {
                let a = self.pop_bool()?;
                self.push(Value::Bool(!a))?;
            }
            op::LTTBLB => {
                let mask = args[0] & 0x0f;
                let q = self.pop_bool()?;
                let p = self.pop_bool()?;
                self.push(Value::Bool(truth_table_binary(mask, p, q)))?;
            }
            op::LTTBLU => {
                let mask = args[0] & 0x0f;
                let p = self.pop_bool()?;
                self.push(Value::Bool(truth_table_unary(mask, p)))?;
            }

            op::ADD => self.binary_arith(|a, b| Ok(a + b))?,
            op::SUB => self.binary_arith(|a, b| Ok(a - b))?,
            op::MUL => self.binary_arith(|a, b| Ok(a * b))?,
            op::DIV => self.binary_arith(|a, b| Ok(a / b))?,
            op::FMOD => self.binary_arith(|a, b| Ok(a % b))?,
            op::POW => self.binary_arith(|a, b| Ok(a.powf(b)))?,
            op::SHL => self.shift(|a, b| a.checked_shl(b))?,
            op::SHR => self.shift(|a, b| a.checked_shr(b))?,
            op::SQRT => self.unary_arith(f64::sqrt)?,
            op::TRUNC => self.unary_arith(f64::trunc)?,
            op::FLOOR => self.unary_arith(f64::floor)?,
            op::CEIL => self.unary_arith(f64::ceil)?,

            op::JMP => self.pc = self.read_u32_arg(args) as usize,
            op::JMPT => {
                if self.pop_bool()? {
                    self.pc = self.read_u32_arg(args) as usize;
                }
            }
            op::JMPF => {
                if !self.pop_bool()? {
                    self.pc = self.read_u32_arg(args) as usize;
                }
            }
            op::CALL => {
                let target = self.read_u32_arg(args) as usize;
                self.do_call(target, self.pc)?;
            }
            op::DJMP => {
                self.pc = self.jump_target()?;
            }
            op::DJMPT => {
                let target = self.jump_target()?;
                if self.pop_bool()? {
                    self.pc = target;
                }
            }
            op::DJMPF => {
                let target = self.jump_target()?;
                if !self.pop_bool()? {
                    self.pc = target;
                }
            }
            op::DCALL => {
                let target = self.jump_target()?;
                self.do_call(target, self.pc)?;
            }
            op::RET => {
                let frame = self.calls.pop().ok_or(VmError::CallStackUnderflow)?;
                self.pc = frame.return_addr;
            }
            op::HLT => self.halted = true,
            op::NOP => {}

            other => return Err(VmError::BadOpcode(other)),
        }

        Ok(!self.halted && self.pc < self.program.bytecode.len())
    }

    fn binary_arith(&mut self, f: impl Fn(f64, f64) -> Result<f64, VmError>) -> Result<(), VmError> {
        let b = self.pop_number()?;
        let a = self.pop_number()?;
        self.push(Value::Number(f(a, b)?))
    }

    fn unary_arith(&mut self, f: impl Fn(f64) -> f64) -> Result<(), VmError> {
        let a = self.pop_number()?;
        self.push(Value::Number(f(a)))
    }

    fn shift(&mut self, f: impl Fn(i64, u32) -> Option<i64>) -> Result<(), VmError> {
        let b = self.pop_number()?;
        let a = self.pop_number()?;
        if b < 0.0 {
            return Err(VmError::Arithmetic);
        }
        let shift = b as u32;
        let lhs = a as i64;
        let result = f(lhs, shift).ok_or(VmError::Arithmetic)?;
        self.push(Value::Number(result as f64))
    }

    /// Runs to completion, returning the final top-of-stack value (the
    /// predicate's verdict, per §4.4: "a final truthy boolean left on top of
    /// stack is the predicate's verdict"). An empty stack at termination
    /// yields `Value::Nil`, which callers must treat as a non-boolean
    /// verdict (§8 S6: skip the agent).
    pub fn run(&mut self) -> Result<Value, VmError> {
        while self.step()? {}
        Ok(self.stack.last().cloned().unwrap_or(Value::Nil))
    }
}

/// Links nothing; just runs an already-[`LinkedProgram`] to its verdict.
pub fn execute(program: &LinkedProgram) -> Result<Value, VmError> {
    Machine::new(program).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::compile;
    use crate::vm::linker::link;
    use std::collections::HashMap;

    fn run_source(src: &str, facts: HashMap<String, Value>) -> Result<Value, Box<dyn std::error::Error>> {
        let built = compile(src)?;
        let linked = link(&built, &facts)?;
        Ok(execute(&linked)?)
    }

    #[test]
    fn simple_arithmetic_predicate() {
        let v = run_source("2 3 ADD 5 NCONST_0 ADD CMP ==", HashMap::new()).unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn isnil_and_kind_retain_their_operand_and_push_a_result() {
        let built = compile("1 NILCONST ISNIL").unwrap();
        let linked = link(&built, &HashMap::new()).unwrap();
        let mut m = Machine::new(&linked);
        let result = m.run().unwrap();
        assert_eq!(result, Value::Bool(true));
        // the leading `1`, the `NILCONST` operand ISNIL leaves in place, and its result
        assert_eq!(m.stack.len(), 3);
    }

    #[test]
    fn negative_shift_traps_arithmetic() {
        // push 1, push 0, push 1, SUB -> -1, SHL(1, -1) -> negative shift amount
        let built = compile("1 NCONST_0 1 SUB SHL").unwrap();
        let linked = link(&built, &HashMap::new()).unwrap();
        let mut m = Machine::new(&linked);
        assert_eq!(m.run(), Err(VmError::Arithmetic));
    }

    #[test]
    fn shift_by_too_many_bits_traps_arithmetic() {
        let built = compile("1 2 6 POW SHL").unwrap(); // shift by 2**6 = 64
        let linked = link(&built, &HashMap::new()).unwrap();
        assert_eq!(execute(&linked), Err(VmError::Arithmetic));
    }

    #[test]
    fn stack_overflow_triggers_at_capacity() {
        let src = "1 ".repeat(STACK_CAPACITY + 1);
        let built = compile(&src).unwrap();
        let linked = link(&built, &HashMap::new()).unwrap();
        assert_eq!(execute(&linked), Err(VmError::StackOverflow));
    }

    #[test]
    fn unsupported_constant_index_is_reported() {
        let program = LinkedProgram {
            bytecode: vec![op::CLOAD, 99, 0, 0, 0, op::HLT],
            consts: vec![Value::Nil; 5],
        };
        assert_eq!(execute(&program), Err(VmError::UnsupportedConstant));
    }
}
