// The virtual machine.
//
// A register-less stack machine over byte-encoded instructions.
//
// *Execution model*
//
// A linked program is two address spaces: a text image holding every
// sheet's instructions and a data image holding every sheet's data
// section. The VM copies the data image at startup, so the compiled
// sheets stay read-only and any number of VMs can run the same program
// as long as they do not share a stack. The data copy doubles as the
// heap: runtime-created strings are appended past the image.
//
// *Encoding*
//
// An instruction is a one-byte opcode followed by zero or more
// immediates. Immediates come in three widths: byte (i8), half (i16)
// and full (i64, fixed at eight bytes on every host). The layout is
// fixed per opcode. For most arithmetic/logical operations there are
// four variants: operands from the stack, or one operand from a byte,
// half or full immediate. Suffix F marks the float variant, which
// works on stack cells holding an f64 bit pattern.
//
// *Validity*
//
// The set of runtime errors is the Error enum in this file. All are
// non-recoverable. A valid program is one that terminates by returning
// from the outermost frame.
//
// *The stack*
//
// Cells are i64. A frame is (return address, frame pointer, arity);
// GET* reads slots relative to the frame pointer, so subroutine
// arguments sit in slots 0..arity.

use std::convert::TryFrom;
use std::io::Write;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::cfunc;


pub const BIMMEDIATE_SIZE: usize = 1;
pub const HIMMEDIATE_SIZE: usize = 2;
pub const FIMMEDIATE_SIZE: usize = 8;

const MAX_CALL_DEPTH: usize = 1 << 16;


#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Ret = 0,
    Retn,
    Add,
    AddF,
    AddBi,
    AddHi,
    AddFi,
    And,
    AndBi,
    AndHi,
    AndFi,
    Call,
    CallC,
    CallCi,
    CallI,
    CallR,
    CallRb,
    CallRh,
    CallRf,
    Ceq,
    CeqF,
    Cleq,
    CleqF,
    Clt,
    CltF,
    Cmeq,
    CmeqF,
    Cmt,
    CmtF,
    CvtF,
    CvtI,
    Deref,
    DerefI,
    DerefB,
    DerefBi,
    Div,
    DivF,
    DivBi,
    DivHi,
    DivFi,
    Get,
    GetBi,
    GetHi,
    GetFi,
    Inv,
    J,
    Jcon,
    JconI,
    Ji,
    Jr,
    JrBi,
    JrHi,
    JrFi,
    Jrcon,
    JrconBi,
    JrconHi,
    JrconFi,
    Mod,
    ModBi,
    ModHi,
    ModFi,
    Mul,
    MulF,
    MulBi,
    MulHi,
    MulFi,
    Not,
    Or,
    OrBi,
    OrHi,
    OrFi,
    Pop,
    PopB,
    PopH,
    PopF,
    PushB,
    PushH,
    PushF,
    PushNb,
    PushNh,
    PushNf,
    Setadr,
    SetadrB,
    Sub,
    SubF,
    SubBi,
    SubHi,
    SubFi,
    Syscall,
    Xor,
    XorBi,
    XorHi,
    XorFi,
}

pub const NUM_OPCODES: usize = 93;

// Index matches the opcode discriminant.
pub static MNEMONICS: [&str; NUM_OPCODES] = [
    "RET", "RETN", "ADD", "ADDF", "ADDBI", "ADDHI", "ADDFI", "AND", "ANDBI",
    "ANDHI", "ANDFI", "CALL", "CALLC", "CALLCI", "CALLI", "CALLR", "CALLRB",
    "CALLRH", "CALLRF", "CEQ", "CEQF", "CLEQ", "CLEQF", "CLT", "CLTF", "CMEQ",
    "CMEQF", "CMT", "CMTF", "CVTF", "CVTI", "DEREF", "DEREFI", "DEREFB",
    "DEREFBI", "DIV", "DIVF", "DIVBI", "DIVHI", "DIVFI", "GET", "GETBI",
    "GETHI", "GETFI", "INV", "J", "JCON", "JCONI", "JI", "JR", "JRBI", "JRHI",
    "JRFI", "JRCON", "JRCONBI", "JRCONHI", "JRCONFI", "MOD", "MODBI", "MODHI",
    "MODFI", "MUL", "MULF", "MULBI", "MULHI", "MULFI", "NOT", "OR", "ORBI",
    "ORHI", "ORFI", "POP", "POPB", "POPH", "POPF", "PUSHB", "PUSHH", "PUSHF",
    "PUSHNB", "PUSHNH", "PUSHNF", "SETADR", "SETADRB", "SUB", "SUBF", "SUBBI",
    "SUBHI", "SUBFI", "SYSCALL", "XOR", "XORBI", "XORHI", "XORFI",
];


// The immediate layout of an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImmLayout {
    None,
    Byte,
    Half,
    Full,
    ByteByte,
    HalfByte,
    FullByte,
}

impl ImmLayout {
    pub fn size(self) -> usize {
        match self {
            ImmLayout::None => 0,
            ImmLayout::Byte => BIMMEDIATE_SIZE,
            ImmLayout::Half => HIMMEDIATE_SIZE,
            ImmLayout::Full => FIMMEDIATE_SIZE,
            ImmLayout::ByteByte => 2 * BIMMEDIATE_SIZE,
            ImmLayout::HalfByte => HIMMEDIATE_SIZE + BIMMEDIATE_SIZE,
            ImmLayout::FullByte => FIMMEDIATE_SIZE + BIMMEDIATE_SIZE,
        }
    }
}

impl Opcode {
    pub fn layout(self) -> ImmLayout {
        use Opcode::*;
        match self {
            Retn | AddBi | AndBi | Call | CallC | CallR | DivBi | GetBi
            | JrBi | JrconBi | ModBi | MulBi | OrBi | PopB | PushB | PushNb
            | SubBi | Syscall | XorBi => ImmLayout::Byte,

            AddHi | AndHi | DivHi | GetHi | JrHi | JrconHi | ModHi | MulHi
            | OrHi | PopH | PushH | PushNh | SubHi | XorHi => ImmLayout::Half,

            AddFi | AndFi | DerefI | DerefBi | DivFi | GetFi | JconI | Ji
            | JrFi | JrconFi | ModFi | MulFi | OrFi | PopF | PushF | PushNf
            | SubFi | XorFi => ImmLayout::Full,

            CallRb => ImmLayout::ByteByte,
            CallRh => ImmLayout::HalfByte,
            CallCi | CallI | CallRf => ImmLayout::FullByte,

            _ => ImmLayout::None,
        }
    }

    pub fn size(self) -> usize {
        1 + self.layout().size()
    }

    pub fn mnemonic(self) -> &'static str {
        MNEMONICS[u8::from(self) as usize]
    }
}


// The syscall table.
pub const SYS_PRINT_INT: i64 = 0;
pub const SYS_PRINT_FLOAT: i64 = 1;
pub const SYS_PRINT_STR: i64 = 2;
pub const SYS_PRINT_BOOL: i64 = 3;
pub const SYS_PRINT_NEWLINE: i64 = 4;
pub const SYS_STR_EQ: i64 = 5;
pub const SYS_STR_CONCAT: i64 = 6;


// A linked, executable program.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Image {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    pub entry: usize,
}


#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    Underflow,
    Overflow,
    IllegalOpcode(u8),
    IllegalAddr(usize),
    DivideByZero(Opcode),
    BadSyscall(i64),
    BadCFunction(i64),
    Arity(usize, usize),
    Io(String),
    Halt,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Underflow => write!(f, "stack underflow"),
            Error::Overflow => write!(f, "stack overflow"),
            Error::IllegalOpcode(op) => write!(f, "illegal opcode 0x{:02x}", op),
            Error::IllegalAddr(addr) => write!(f, "illegal address 0x{:x}", addr),
            Error::DivideByZero(op) => {
                write!(f, "divide by zero in {}", op.mnemonic())
            }
            Error::BadSyscall(n) => write!(f, "unknown syscall {}", n),
            Error::BadCFunction(n) => write!(f, "unknown C function {}", n),
            Error::Arity(index, arity) => {
                write!(f, "argument {} requested of {}", index, arity)
            }
            Error::Io(message) => write!(f, "output failed: {}", message),
            Error::Halt => write!(f, "halt"),
        }
    }
}


pub type Result<T> = core::result::Result<T, Error>;


#[derive(Copy, Clone, Debug)]
struct StackFrame {
    return_address: usize,
    frame_pointer: usize,
    arity: usize,
}

const OUTER_FRAME: StackFrame = StackFrame {
    return_address: 0,
    frame_pointer: 0,
    arity: 0,
};


// What an instruction does to the program counter.
pub enum ControlFlow {
    Advance,
    Branch(usize),
}


fn as_float(cell: i64) -> f64 {
    f64::from_bits(cell as u64)
}

fn from_float(value: f64) -> i64 {
    value.to_bits() as i64
}


pub struct Vm {
    text: Vec<u8>,
    memory: Vec<u8>,
    entry: usize,
    stack: Vec<i64>,
    stack_limit: usize,
    call_stack: Vec<StackFrame>,
    cur_frame: StackFrame,
    pc: usize,
}

impl Vm {
    pub fn new(image: &Image, stack_limit: usize) -> Vm {
        Vm {
            text: image.text.clone(),
            memory: image.data.clone(),
            entry: image.entry,
            stack: Vec::new(),
            stack_limit,
            call_stack: Vec::new(),
            cur_frame: OUTER_FRAME,
            pc: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn pop(&mut self) -> Result<i64> {
        self.stack.pop().ok_or(Error::Underflow)
    }

    pub fn push(&mut self, value: i64) -> Result<()> {
        if self.stack.len() < self.stack_limit {
            self.stack.push(value);
            Ok(())
        } else {
            Err(Error::Overflow)
        }
    }

    // Run the program from its entry point until it returns from the
    // outermost frame.
    pub fn exec(&mut self, out: &mut dyn Write) -> Result<()> {
        self.pc = self.entry;
        self.stack.clear();
        self.call_stack.clear();
        self.cur_frame = OUTER_FRAME;
        loop {
            match self.step(out) {
                Err(Error::Halt) => return Ok(()),
                Err(e) => return Err(e),
                Ok(()) => continue,
            }
        }
    }

    // Single-step one instruction. Exposed for debuggers and tests.
    pub fn step(&mut self, out: &mut dyn Write) -> Result<()> {
        if self.pc == self.text.len() {
            return Err(Error::Halt);
        }
        let byte = *self.text.get(self.pc).ok_or(Error::IllegalAddr(self.pc))?;
        let op = Opcode::try_from(byte).map_err(|_| Error::IllegalOpcode(byte))?;
        let (imm1, imm2) = self.immediates(op)?;

        trace!("{:x} {} {:?} {:?}", self.pc, op.mnemonic(), imm1, self.stack);

        let next = self.pc + op.size();
        match self.dispatch(op, imm1, imm2, next, out)? {
            ControlFlow::Advance => self.pc = next,
            ControlFlow::Branch(addr) => self.pc = addr,
        }
        Ok(())
    }

    fn immediates(&self, op: Opcode) -> Result<(i64, i64)> {
        let at = self.pc + 1;
        Ok(match op.layout() {
            ImmLayout::None => (0, 0),
            ImmLayout::Byte => (self.imm_b(at)?, 0),
            ImmLayout::Half => (self.imm_h(at)?, 0),
            ImmLayout::Full => (self.imm_f(at)?, 0),
            ImmLayout::ByteByte => {
                (self.imm_b(at)?, self.imm_b(at + BIMMEDIATE_SIZE)?)
            }
            ImmLayout::HalfByte => {
                (self.imm_h(at)?, self.imm_b(at + HIMMEDIATE_SIZE)?)
            }
            ImmLayout::FullByte => {
                (self.imm_f(at)?, self.imm_b(at + FIMMEDIATE_SIZE)?)
            }
        })
    }

    fn imm_b(&self, at: usize) -> Result<i64> {
        let byte = *self.text.get(at).ok_or(Error::IllegalAddr(at))?;
        Ok(byte as i8 as i64)
    }

    fn imm_h(&self, at: usize) -> Result<i64> {
        let bytes = self
            .text
            .get(at..at + HIMMEDIATE_SIZE)
            .ok_or(Error::IllegalAddr(at))?;
        let mut buf = [0u8; HIMMEDIATE_SIZE];
        buf.copy_from_slice(bytes);
        Ok(i16::from_ne_bytes(buf) as i64)
    }

    fn imm_f(&self, at: usize) -> Result<i64> {
        let bytes = self
            .text
            .get(at..at + FIMMEDIATE_SIZE)
            .ok_or(Error::IllegalAddr(at))?;
        let mut buf = [0u8; FIMMEDIATE_SIZE];
        buf.copy_from_slice(bytes);
        Ok(i64::from_ne_bytes(buf))
    }

    fn mem_read8(&self, addr: usize) -> Result<i64> {
        let bytes = self
            .memory
            .get(addr..addr + 8)
            .ok_or(Error::IllegalAddr(addr))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(i64::from_ne_bytes(buf))
    }

    fn mem_write8(&mut self, addr: usize, value: i64) -> Result<()> {
        let bytes = self
            .memory
            .get_mut(addr..addr + 8)
            .ok_or(Error::IllegalAddr(addr))?;
        bytes.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    fn mem_read1(&self, addr: usize) -> Result<i64> {
        self.memory
            .get(addr)
            .map(|&b| b as i64)
            .ok_or(Error::IllegalAddr(addr))
    }

    fn mem_write1(&mut self, addr: usize, value: i64) -> Result<()> {
        match self.memory.get_mut(addr) {
            Some(slot) => {
                *slot = value as u8;
                Ok(())
            }
            None => Err(Error::IllegalAddr(addr)),
        }
    }

    fn read_cstr(&self, addr: usize) -> Result<String> {
        let tail = self.memory.get(addr..).ok_or(Error::IllegalAddr(addr))?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::IllegalAddr(addr))?;
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    // Append a NUL-terminated string to the heap; the heap is the
    // memory past the linked data image.
    pub fn alloc_str(&mut self, value: &str) -> usize {
        let addr = self.memory.len();
        self.memory.extend_from_slice(value.as_bytes());
        self.memory.push(0);
        addr
    }

    fn rel_target(&self, offset: i64) -> Result<usize> {
        let target = self.pc as i64 + offset;
        if target < 0 {
            Err(Error::IllegalAddr(self.pc))
        } else {
            Ok(target as usize)
        }
    }

    fn binop(&mut self, f: impl FnOnce(i64, i64) -> Result<i64>) -> Result<ControlFlow> {
        let b = self.pop()?;
        let a = self.pop()?;
        let r = f(a, b)?;
        self.push(r)?;
        Ok(ControlFlow::Advance)
    }

    fn immop(&mut self, imm: i64, f: impl FnOnce(i64, i64) -> Result<i64>) -> Result<ControlFlow> {
        let a = self.pop()?;
        let r = f(a, imm)?;
        self.push(r)?;
        Ok(ControlFlow::Advance)
    }

    fn unop(&mut self, f: impl FnOnce(i64) -> i64) -> Result<ControlFlow> {
        let a = self.pop()?;
        self.push(f(a))?;
        Ok(ControlFlow::Advance)
    }

    fn get_slot(&mut self, index: i64) -> Result<ControlFlow> {
        if index < 0 {
            return Err(Error::Underflow);
        }
        let at = self.cur_frame.frame_pointer + index as usize;
        match self.stack.get(at) {
            Some(&value) => {
                self.push(value)?;
                Ok(ControlFlow::Advance)
            }
            None => Err(Error::Underflow),
        }
    }

    fn call(&mut self, target: usize, arity: usize, next: usize) -> Result<ControlFlow> {
        if self.stack.len() < arity {
            return Err(Error::Underflow);
        }
        if self.call_stack.len() >= MAX_CALL_DEPTH {
            return Err(Error::Overflow);
        }
        self.call_stack.push(self.cur_frame);
        self.cur_frame = StackFrame {
            return_address: next,
            frame_pointer: self.stack.len() - arity,
            arity,
        };
        Ok(ControlFlow::Branch(target))
    }

    fn ret(&mut self) -> Result<ControlFlow> {
        match self.call_stack.pop() {
            None => Err(Error::Halt),
            Some(prev) => {
                let target = self.cur_frame.return_address;
                self.stack.truncate(self.cur_frame.frame_pointer);
                self.cur_frame = prev;
                Ok(ControlFlow::Branch(target))
            }
        }
    }

    fn retn(&mut self, count: usize) -> Result<ControlFlow> {
        if self.stack.len() < count {
            return Err(Error::Underflow);
        }
        match self.call_stack.pop() {
            None => Err(Error::Halt),
            Some(prev) => {
                let values = self.stack.split_off(self.stack.len() - count);
                let target = self.cur_frame.return_address;
                self.stack.truncate(self.cur_frame.frame_pointer);
                self.stack.extend(values);
                self.cur_frame = prev;
                Ok(ControlFlow::Branch(target))
            }
        }
    }

    // Invoke a registered native function: a temporary frame covers
    // the arguments so the native can read them with c_arg and push
    // outputs with c_return.
    fn call_c(&mut self, index: i64, arity: usize) -> Result<ControlFlow> {
        let cfunc = cfunc::get(index.max(0) as usize).ok_or(Error::BadCFunction(index))?;
        if self.stack.len() < arity {
            return Err(Error::Underflow);
        }
        if self.call_stack.len() >= MAX_CALL_DEPTH {
            return Err(Error::Overflow);
        }
        self.call_stack.push(self.cur_frame);
        self.cur_frame = StackFrame {
            return_address: 0,
            frame_pointer: self.stack.len() - arity,
            arity,
        };
        let result = (cfunc.function)(self);
        let frame = self.cur_frame;
        self.cur_frame = self.call_stack.pop().unwrap_or(OUTER_FRAME);
        result?;
        let outputs = self.stack.split_off(frame.frame_pointer + frame.arity);
        self.stack.truncate(frame.frame_pointer);
        for value in outputs {
            self.push(value)?;
        }
        Ok(ControlFlow::Advance)
    }

    // Marshalling accessors for native functions.
    pub fn c_arg(&self, index: usize) -> Result<i64> {
        if index >= self.cur_frame.arity {
            return Err(Error::Arity(index, self.cur_frame.arity));
        }
        self.stack
            .get(self.cur_frame.frame_pointer + index)
            .copied()
            .ok_or(Error::Underflow)
    }

    pub fn c_arg_float(&self, index: usize) -> Result<f64> {
        Ok(as_float(self.c_arg(index)?))
    }

    pub fn c_arg_str(&self, index: usize) -> Result<String> {
        let addr = self.c_arg(index)?;
        self.read_cstr(addr.max(0) as usize)
    }

    pub fn c_return(&mut self, value: i64) -> Result<()> {
        self.push(value)
    }

    pub fn c_return_float(&mut self, value: f64) -> Result<()> {
        self.push(from_float(value))
    }

    pub fn c_return_str(&mut self, value: &str) -> Result<()> {
        let addr = self.alloc_str(value);
        self.push(addr as i64)
    }

    fn syscall(&mut self, number: i64, out: &mut dyn Write) -> Result<ControlFlow> {
        let io = |e: std::io::Error| Error::Io(e.to_string());
        match number {
            SYS_PRINT_INT => {
                let v = self.pop()?;
                write!(out, "{}", v).map_err(io)?;
            }
            SYS_PRINT_FLOAT => {
                let v = as_float(self.pop()?);
                write!(out, "{:?}", v).map_err(io)?;
            }
            SYS_PRINT_STR => {
                let addr = self.pop()?;
                let s = self.read_cstr(addr.max(0) as usize)?;
                write!(out, "{}", s).map_err(io)?;
            }
            SYS_PRINT_BOOL => {
                let v = self.pop()?;
                write!(out, "{}", if v != 0 { "true" } else { "false" })
                    .map_err(io)?;
            }
            SYS_PRINT_NEWLINE => {
                writeln!(out).map_err(io)?;
            }
            SYS_STR_EQ => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = self.read_cstr(a.max(0) as usize)?
                    == self.read_cstr(b.max(0) as usize)?;
                self.push(eq as i64)?;
            }
            SYS_STR_CONCAT => {
                let b = self.pop()?;
                let a = self.pop()?;
                let mut joined = self.read_cstr(a.max(0) as usize)?;
                joined.push_str(&self.read_cstr(b.max(0) as usize)?);
                let addr = self.alloc_str(&joined);
                self.push(addr as i64)?;
            }
            n => return Err(Error::BadSyscall(n)),
        }
        Ok(ControlFlow::Advance)
    }

    fn dispatch(
        &mut self,
        op: Opcode,
        imm1: i64,
        imm2: i64,
        next: usize,
        out: &mut dyn Write,
    ) -> Result<ControlFlow> {
        use Opcode::*;
        match op {
            Ret => self.ret(),
            Retn => self.retn(imm1.max(0) as usize),

            Add => self.binop(|a, b| Ok(a.wrapping_add(b))),
            AddF => self.binop(|a, b| Ok(from_float(as_float(a) + as_float(b)))),
            AddBi | AddHi | AddFi => self.immop(imm1, |a, b| Ok(a.wrapping_add(b))),

            Sub => self.binop(|a, b| Ok(a.wrapping_sub(b))),
            SubF => self.binop(|a, b| Ok(from_float(as_float(a) - as_float(b)))),
            SubBi | SubHi | SubFi => self.immop(imm1, |a, b| Ok(a.wrapping_sub(b))),

            Mul => self.binop(|a, b| Ok(a.wrapping_mul(b))),
            MulF => self.binop(|a, b| Ok(from_float(as_float(a) * as_float(b)))),
            MulBi | MulHi | MulFi => self.immop(imm1, |a, b| Ok(a.wrapping_mul(b))),

            Div => self.binop(|a, b| int_div(op, a, b)),
            DivF => self.binop(|a, b| Ok(from_float(as_float(a) / as_float(b)))),
            DivBi | DivHi | DivFi => self.immop(imm1, |a, b| int_div(op, a, b)),

            Mod => self.binop(|a, b| int_mod(op, a, b)),
            ModBi | ModHi | ModFi => self.immop(imm1, |a, b| int_mod(op, a, b)),

            And => self.binop(|a, b| Ok(a & b)),
            AndBi | AndHi | AndFi => self.immop(imm1, |a, b| Ok(a & b)),
            Or => self.binop(|a, b| Ok(a | b)),
            OrBi | OrHi | OrFi => self.immop(imm1, |a, b| Ok(a | b)),
            Xor => self.binop(|a, b| Ok(a ^ b)),
            XorBi | XorHi | XorFi => self.immop(imm1, |a, b| Ok(a ^ b)),

            Not => self.unop(|a| (a == 0) as i64),
            Inv => self.unop(|a| a.wrapping_neg()),

            Ceq => self.binop(|a, b| Ok((a == b) as i64)),
            CeqF => self.binop(|a, b| Ok((as_float(a) == as_float(b)) as i64)),
            Cleq => self.binop(|a, b| Ok((a <= b) as i64)),
            CleqF => self.binop(|a, b| Ok((as_float(a) <= as_float(b)) as i64)),
            Clt => self.binop(|a, b| Ok((a < b) as i64)),
            CltF => self.binop(|a, b| Ok((as_float(a) < as_float(b)) as i64)),
            Cmeq => self.binop(|a, b| Ok((a >= b) as i64)),
            CmeqF => self.binop(|a, b| Ok((as_float(a) >= as_float(b)) as i64)),
            Cmt => self.binop(|a, b| Ok((a > b) as i64)),
            CmtF => self.binop(|a, b| Ok((as_float(a) > as_float(b)) as i64)),

            CvtF => self.unop(|a| from_float(a as f64)),
            CvtI => self.unop(|a| as_float(a) as i64),

            Deref => {
                let addr = self.pop()?;
                let value = self.mem_read8(addr.max(0) as usize)?;
                self.push(value)?;
                Ok(ControlFlow::Advance)
            }
            DerefI => {
                let value = self.mem_read8(imm1.max(0) as usize)?;
                self.push(value)?;
                Ok(ControlFlow::Advance)
            }
            DerefB => {
                let addr = self.pop()?;
                let value = self.mem_read1(addr.max(0) as usize)?;
                self.push(value)?;
                Ok(ControlFlow::Advance)
            }
            DerefBi => {
                let value = self.mem_read1(imm1.max(0) as usize)?;
                self.push(value)?;
                Ok(ControlFlow::Advance)
            }

            Setadr => {
                let addr = self.pop()?;
                let value = self.pop()?;
                self.mem_write8(addr.max(0) as usize, value)?;
                Ok(ControlFlow::Advance)
            }
            SetadrB => {
                let addr = self.pop()?;
                let value = self.pop()?;
                self.mem_write1(addr.max(0) as usize, value)?;
                Ok(ControlFlow::Advance)
            }

            Get => {
                let index = self.pop()?;
                self.get_slot(index)
            }
            GetBi | GetHi | GetFi => self.get_slot(imm1),

            J => {
                let addr = self.pop()?;
                Ok(ControlFlow::Branch(addr.max(0) as usize))
            }
            Ji => Ok(ControlFlow::Branch(imm1.max(0) as usize)),
            Jcon => {
                let addr = self.pop()?;
                let cond = self.pop()?;
                Ok(if cond != 0 {
                    ControlFlow::Branch(addr.max(0) as usize)
                } else {
                    ControlFlow::Advance
                })
            }
            JconI => {
                let cond = self.pop()?;
                Ok(if cond != 0 {
                    ControlFlow::Branch(imm1.max(0) as usize)
                } else {
                    ControlFlow::Advance
                })
            }
            Jr => {
                let offset = self.pop()?;
                Ok(ControlFlow::Branch(self.rel_target(offset)?))
            }
            JrBi | JrHi | JrFi => Ok(ControlFlow::Branch(self.rel_target(imm1)?)),
            Jrcon => {
                let offset = self.pop()?;
                let cond = self.pop()?;
                Ok(if cond != 0 {
                    ControlFlow::Branch(self.rel_target(offset)?)
                } else {
                    ControlFlow::Advance
                })
            }
            JrconBi | JrconHi | JrconFi => {
                let cond = self.pop()?;
                Ok(if cond != 0 {
                    ControlFlow::Branch(self.rel_target(imm1)?)
                } else {
                    ControlFlow::Advance
                })
            }

            Call => {
                let addr = self.pop()?;
                self.call(addr.max(0) as usize, imm1.max(0) as usize, next)
            }
            CallI => self.call(imm1.max(0) as usize, imm2.max(0) as usize, next),
            CallR => {
                let offset = self.pop()?;
                let target = self.rel_target(offset)?;
                self.call(target, imm1.max(0) as usize, next)
            }
            CallRb | CallRh | CallRf => {
                let target = self.rel_target(imm1)?;
                self.call(target, imm2.max(0) as usize, next)
            }
            CallC => {
                let index = self.pop()?;
                self.call_c(index, imm1.max(0) as usize)
            }
            CallCi => self.call_c(imm1, imm2.max(0) as usize),

            Pop => {
                self.pop()?;
                Ok(ControlFlow::Advance)
            }
            PopB | PopH | PopF => {
                for _ in 0..imm1.max(0) {
                    self.pop()?;
                }
                Ok(ControlFlow::Advance)
            }

            PushB | PushH | PushF => {
                self.push(imm1)?;
                Ok(ControlFlow::Advance)
            }
            PushNb | PushNh | PushNf => {
                for _ in 0..imm1.max(0) {
                    self.push(0)?;
                }
                Ok(ControlFlow::Advance)
            }

            Syscall => self.syscall(imm1, out),
        }
    }
}


fn int_div(op: Opcode, a: i64, b: i64) -> Result<i64> {
    if b == 0 {
        Err(Error::DivideByZero(op))
    } else {
        Ok(a.wrapping_div(b))
    }
}

fn int_mod(op: Opcode, a: i64, b: i64) -> Result<i64> {
    if b == 0 {
        Err(Error::DivideByZero(op))
    } else {
        Ok(a.wrapping_rem(b))
    }
}


// These tests are written against the behavior of the VM; any
// conforming implementation should pass them.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BCode;
    use crate::cfunc;
    use crate::sheet::SocketMeta;
    use crate::types::{self, DType, LitValue};

    enum I {
        Op(Opcode),
        OpB(Opcode, i8),
        OpH(Opcode, i16),
        OpF(Opcode, i64),
        OpFb(Opcode, i64, i8),
    }

    fn assemble(instructions: &[I]) -> Vec<u8> {
        let mut out = BCode::new();
        for ins in instructions {
            let mut b;
            match ins {
                I::Op(op) => {
                    b = BCode::ins(*op);
                }
                I::OpB(op, imm) => {
                    b = BCode::ins(*op);
                    b.set_byte(1, *imm as u8);
                }
                I::OpH(op, imm) => {
                    b = BCode::ins(*op);
                    let bytes = imm.to_ne_bytes();
                    b.set_byte(1, bytes[0]);
                    b.set_byte(2, bytes[1]);
                }
                I::OpF(op, imm) => {
                    b = BCode::ins(*op);
                    b.set_fimmediate(1, *imm);
                }
                I::OpFb(op, imm, byte) => {
                    b = BCode::ins(*op);
                    b.set_fimmediate(1, *imm);
                    b.set_byte(1 + FIMMEDIATE_SIZE, *byte as u8);
                }
            }
            out.concat(b);
        }
        out.code
    }

    fn image(instructions: &[I], data: &[u8]) -> Image {
        Image {
            text: assemble(instructions),
            data: data.to_vec(),
            entry: 0,
        }
    }

    // Run to completion and return the final top of stack.
    fn eval(
        stack_limit: usize,
        expected_final_depth: usize,
        image: Image,
    ) -> Result<i64> {
        let mut vm = Vm::new(&image, stack_limit);
        let mut out = Vec::new();
        match vm.exec(&mut out) {
            Err(e) => Err(e),
            Ok(()) => {
                assert_eq!(vm.depth(), expected_final_depth);
                vm.pop()
            }
        }
    }

    fn assert_evaluates_to(expected: Result<i64>, instructions: &[I]) {
        let depth = if expected.is_ok() { 1 } else { 0 };
        let result = eval(32, depth, image(instructions, &[]));
        match (&result, &expected) {
            (Ok(r), Ok(e)) => assert_eq!(r, e),
            (Err(r), Err(e)) => assert_eq!(r, e),
            (r, e) => panic!("{:?} != {:?}", r, e),
        }
    }

    #[test]
    fn test_offsets_of_encoding() {
        assert_eq!(Opcode::Ret.size(), 1);
        assert_eq!(Opcode::Syscall.size(), 2);
        assert_eq!(Opcode::AddHi.size(), 3);
        assert_eq!(Opcode::PushF.size(), 9);
        assert_eq!(Opcode::CallI.size(), 10);
        assert_eq!(Opcode::CallRb.size(), 3);
        assert_eq!(Opcode::CallRh.size(), 4);
        assert_eq!(Opcode::mnemonic(Opcode::JrconFi), "JRCONFI");
        assert_eq!(u8::from(Opcode::XorFi) as usize, NUM_OPCODES - 1);
    }

    #[test]
    fn test_simple_arithmetic() {
        use Opcode::*;
        assert_evaluates_to(
            Ok(3),
            &[I::OpF(PushF, 1), I::OpF(PushF, 2), I::Op(Add)],
        );
        assert_evaluates_to(
            Ok(-1),
            &[I::OpF(PushF, 1), I::OpF(PushF, 2), I::Op(Sub)],
        );
        assert_evaluates_to(
            Ok(42),
            &[I::OpF(PushF, 7), I::OpF(PushF, 6), I::Op(Mul)],
        );
        assert_evaluates_to(Ok(3), &[I::OpF(PushF, 7), I::OpB(DivBi, 2)]);
        assert_evaluates_to(Ok(1), &[I::OpF(PushF, 7), I::OpH(ModHi, 2)]);
        assert_evaluates_to(Ok(49), &[I::OpF(PushF, 7), I::OpF(AddFi, 42)]);
    }

    #[test]
    fn test_float_arithmetic() {
        use Opcode::*;
        let a = 7.0f64.to_bits() as i64;
        let b = 6.0f64.to_bits() as i64;
        let result = eval(
            8,
            1,
            image(&[I::OpF(PushF, a), I::OpF(PushF, b), I::Op(MulF)], &[]),
        )
        .unwrap();
        assert_eq!(f64::from_bits(result as u64), 42.0);
    }

    #[test]
    fn test_conversions() {
        use Opcode::*;
        let result = eval(8, 1, image(&[I::OpF(PushF, 21), I::Op(CvtF)], &[])).unwrap();
        assert_eq!(f64::from_bits(result as u64), 21.0);

        let bits = 21.9f64.to_bits() as i64;
        assert_evaluates_to(Ok(21), &[I::OpF(PushF, bits), I::Op(CvtI)]);
    }

    #[test]
    fn test_comparisons() {
        use Opcode::*;
        assert_evaluates_to(
            Ok(1),
            &[I::OpF(PushF, 2), I::OpF(PushF, 3), I::Op(Clt)],
        );
        assert_evaluates_to(
            Ok(0),
            &[I::OpF(PushF, 2), I::OpF(PushF, 3), I::Op(Cmt)],
        );
        assert_evaluates_to(
            Ok(1),
            &[I::OpF(PushF, 2), I::OpF(PushF, 2), I::Op(Ceq)],
        );
    }

    #[test]
    fn test_logic_and_unary() {
        use Opcode::*;
        assert_evaluates_to(
            Ok(2),
            &[I::OpF(PushF, 2), I::OpF(PushF, 3), I::Op(And)],
        );
        assert_evaluates_to(Ok(1), &[I::OpF(PushF, 0), I::Op(Not)]);
        assert_evaluates_to(Ok(0), &[I::OpF(PushF, 5), I::Op(Not)]);
        assert_evaluates_to(Ok(-5), &[I::OpF(PushF, 5), I::Op(Inv)]);
        assert_evaluates_to(Ok(!5), &[I::OpF(PushF, 5), I::OpF(XorFi, -1)]);
    }

    #[test]
    fn test_divide_by_zero_names_opcode() {
        use Opcode::*;
        assert_evaluates_to(
            Err(Error::DivideByZero(Div)),
            &[I::OpF(PushF, 10), I::OpF(PushF, 0), I::Op(Div)],
        );
        let e = Error::DivideByZero(Div);
        assert_eq!(format!("{}", e), "divide by zero in DIV");
    }

    #[test]
    fn test_stack_faults() {
        use Opcode::*;
        assert_evaluates_to(Err(Error::Underflow), &[I::Op(Add)]);
        let result = eval(
            1,
            0,
            image(&[I::OpF(PushF, 1), I::OpF(PushF, 2)], &[]),
        );
        assert_eq!(result, Err(Error::Overflow));
    }

    #[test]
    fn test_illegal_opcode() {
        let image = Image {
            text: vec![0xff],
            data: vec![],
            entry: 0,
        };
        let mut vm = Vm::new(&image, 8);
        let mut out = Vec::new();
        assert_eq!(vm.exec(&mut out), Err(Error::IllegalOpcode(0xff)));
    }

    #[test]
    fn test_memory_access() {
        use Opcode::*;
        let mut data = 7i64.to_ne_bytes().to_vec();
        data.extend_from_slice(&[0; 8]);
        // Load the 7, add 1, store it into the second slot, load it
        // back.
        let result = eval(
            8,
            1,
            image(
                &[
                    I::OpF(DerefI, 0),
                    I::OpF(AddFi, 1),
                    I::OpF(PushF, 8),
                    I::Op(Setadr),
                    I::OpF(DerefI, 8),
                ],
                &data,
            ),
        );
        assert_eq!(result, Ok(8));

        assert_evaluates_to(
            Err(Error::IllegalAddr(64)),
            &[I::OpF(DerefI, 64)],
        );
    }

    #[test]
    fn test_byte_memory_access() {
        use Opcode::*;
        let result = eval(
            8,
            1,
            image(
                &[
                    I::OpF(PushF, 1),
                    I::OpF(PushF, 0),
                    I::Op(SetadrB),
                    I::OpF(DerefBi, 0),
                ],
                &[0],
            ),
        );
        assert_eq!(result, Ok(1));
    }

    #[test]
    fn test_relative_branches() {
        use Opcode::*;
        // Skip over a PushF that would change the result.
        assert_evaluates_to(
            Ok(1),
            &[
                I::OpF(PushF, 1),
                I::OpF(JrFi, 9 + 9), // over this JRFI and the next PUSHF
                I::OpF(PushF, 2),
            ],
        );
        // Conditional: condition false falls through.
        assert_evaluates_to(
            Ok(2),
            &[
                I::OpF(PushF, 0),
                I::OpF(JrconFi, 9 + 9),
                I::OpF(PushF, 2),
            ],
        );
    }

    #[test]
    fn test_call_ret() {
        use Opcode::*;
        // main: CALLI f(21); halt by falling off the end of the frame.
        // f: double the argument, return one value.
        //
        // layout: 0 PUSHF 21 | 9 CALLI f, 1 | 19 RET | 20 f: GETFI 0
        //         | 29 GETFI 0 | 38 ADD | 39 RETN 1
        let program = &[
            I::OpF(PushF, 21),
            I::OpFb(CallI, 20, 1),
            I::Op(Ret),
            I::OpF(GetFi, 0),
            I::OpF(GetFi, 0),
            I::Op(Add),
            I::OpB(Retn, 1),
        ];
        assert_evaluates_to(Ok(42), program);
    }

    #[test]
    fn test_recursion() {
        use Opcode::*;
        // factorial(5) with an explicit byte layout:
        //   0 PUSHF 5
        //   9 CALLI fact, 1
        //  19 RET
        // fact:
        //  20 GETFI 0
        //  29 PUSHF 2
        //  38 CLT            ; n < 2 ?
        //  39 JRCONFI +49    ; -> base (39 + 49 = 88)
        //  48 GETFI 0
        //  57 GETFI 0
        //  66 SUBFI 1        ; n - 1 on top
        //  75 CALLI fact, 1
        //  85 MUL            ; n * fact(n - 1)
        //  86 RETN 1
        // base: the base case returns n itself:
        //  88 GETFI 0
        //  97 RETN 1
        let program = &[
            I::OpF(PushF, 5),
            I::OpFb(CallI, 20, 1),
            I::Op(Ret),
            // fact:
            I::OpF(GetFi, 0),
            I::OpF(PushF, 2),
            I::Op(Clt),
            I::OpF(JrconFi, 49),
            I::OpF(GetFi, 0),
            I::OpF(GetFi, 0),
            I::OpF(SubFi, 1),
            I::OpFb(CallI, 20, 1),
            I::Op(Mul),
            I::OpB(Retn, 1),
            // base:
            I::OpF(GetFi, 0),
            I::OpB(Retn, 1),
        ];
        assert_evaluates_to(Ok(120), program);
    }

    #[test]
    fn test_print_syscalls() {
        use Opcode::*;
        let mut data = Vec::new();
        data.extend_from_slice(b"hi\0");
        let image = Image {
            text: assemble(&[
                I::OpF(PushF, 0),
                I::OpB(Syscall, SYS_PRINT_STR as i8),
                I::OpF(PushF, 42),
                I::OpB(Syscall, SYS_PRINT_INT as i8),
                I::OpF(PushF, 1),
                I::OpB(Syscall, SYS_PRINT_BOOL as i8),
                I::OpB(Syscall, SYS_PRINT_NEWLINE as i8),
            ]),
            data,
            entry: 0,
        };
        let mut vm = Vm::new(&image, 8);
        let mut out = Vec::new();
        assert_eq!(vm.exec(&mut out), Ok(()));
        assert_eq!(String::from_utf8(out).unwrap(), "hi42true\n");
    }

    #[test]
    fn test_string_syscalls() {
        use Opcode::*;
        let mut data = Vec::new();
        data.extend_from_slice(b"ab\0cd\0");
        // Concat "ab" and "cd", then compare the result with "ab": not
        // equal.
        let image = Image {
            text: assemble(&[
                I::OpF(PushF, 0),
                I::OpF(PushF, 3),
                I::OpB(Syscall, SYS_STR_CONCAT as i8),
                I::OpF(PushF, 0),
                I::OpB(Syscall, SYS_STR_EQ as i8),
            ]),
            data,
            entry: 0,
        };
        let mut vm = Vm::new(&image, 8);
        let mut out = Vec::new();
        assert_eq!(vm.exec(&mut out), Ok(()));
        assert_eq!(vm.pop(), Ok(0));
    }

    fn native_double(vm: &mut Vm) -> Result<()> {
        let n = vm.c_arg(0)?;
        vm.c_return(n * 2)
    }

    #[test]
    fn test_c_function_bridge() {
        use Opcode::*;
        let index = cfunc::register_function(
            native_double,
            "VmTestDouble",
            "",
            vec![
                SocketMeta::new("n", types::single(DType::Int), LitValue::Int(0)),
                SocketMeta::new("out", types::single(DType::Int), LitValue::Int(0)),
            ],
            1,
        )
        .unwrap();
        assert_evaluates_to(
            Ok(42),
            &[
                I::OpF(PushF, 21),
                I::OpFb(CallCi, index as i64, 1),
            ],
        );
        assert_evaluates_to(
            Err(Error::BadCFunction(99999)),
            &[I::OpFb(CallCi, 99999, 0)],
        );
    }

    #[test]
    fn test_get_is_frame_relative() {
        use Opcode::*;
        // Call with two args; read the second.
        let program = &[
            I::OpF(PushF, 10),
            I::OpF(PushF, 20),
            I::OpFb(CallI, 29, 2),
            I::Op(Ret),
            I::OpF(GetFi, 1),
            I::OpB(Retn, 1),
        ];
        assert_evaluates_to(Ok(20), program);
    }

    #[test]
    fn test_halts_at_end_of_text() {
        use Opcode::*;
        // No RET; execution stops cleanly at the end of text.
        let result = eval(8, 1, image(&[I::OpF(PushF, 7)], &[]));
        assert_eq!(result, Ok(7));
    }
}
