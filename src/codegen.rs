// Code generation.
//
// Walks the graph from each entry point (Start and every function's
// Define) and lowers it to a stack-machine instruction stream plus a
// data section and relocation records.
//
// Stack slot assignment: every output socket that gets evaluated on the
// current entry's path is given a frame-relative stack position, and
// consumers fetch it with GETFI. Value nodes are generated lazily the
// first time a consumer needs them and memoized through the slot map;
// exclusive branches (IfThenElse) snapshot and restore the map so one
// branch cannot see slots the other materialized.
//
// Everything is emitted with full-width immediates; the size-reduction
// pass afterwards shrinks immediates and relative jumps to byte/half
// encodings, iterating to a fixed point and recomputing every offset
// it moved. Immediates that are relocation targets keep full width.

use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;

use crate::bytecode::{BCode, InsExecInfo, InsNodeInfo, InsValueInfo};
use crate::error::{Diagnostics, ErrorKind};
use crate::nodes::CoreNode;
use crate::sheet::{
    LinkMeta, LinkRef, LinkType, NameResolution, NodeSocket, Sheet, SheetId, SheetStore,
};
use crate::types::{self, DType, LitValue};
use crate::vm::{self, ImmLayout, Opcode};


#[derive(Copy, Clone, Debug)]
pub struct CodegenOptions {
    pub optimize: bool,
    pub debug: bool,
}

impl Default for CodegenOptions {
    fn default() -> CodegenOptions {
        CodegenOptions {
            optimize: true,
            debug: false,
        }
    }
}


struct GenFail {
    kind: ErrorKind,
    line: usize,
    message: String,
}

fn internal(line: usize, message: &str) -> GenFail {
    GenFail {
        kind: ErrorKind::Internal,
        line,
        message: String::from(message),
    }
}


// Compile a sheet and, first, everything it includes.
pub fn compile_sheet(
    store: &mut SheetStore,
    id: SheetId,
    opts: CodegenOptions,
    diags: &mut Diagnostics,
) {
    if store.get(id).is_compiled || store.get(id).has_errors {
        return;
    }
    let includes = store.get(id).includes.clone();
    for include in includes {
        compile_sheet(store, include, opts, diags);
    }

    let mut sheet = store.take(id);
    let result = Generator::new(&sheet, id, opts).run();
    match result {
        Ok(artifacts) => {
            sheet.text = artifacts.text.code;
            sheet.ins_link_list = artifacts.text.links;
            sheet.debug = artifacts.text.debug;
            sheet.data = artifacts.data;
            sheet.link = artifacts.link;
            sheet.main = artifacts.main;
            sheet.is_compiled = true;
        }
        Err(fail) => {
            diags.add(fail.kind, &sheet.file_path, fail.line, &fail.message);
            sheet.has_errors = true;
        }
    }
    store.put(id, sheet);
}


struct Artifacts {
    text: BCode,
    data: Vec<u8>,
    link: Vec<LinkMeta>,
    main: usize,
}


struct Generator<'a> {
    sheet: &'a Sheet,
    id: SheetId,
    opts: CodegenOptions,

    data: Vec<u8>,
    link: Vec<LinkMeta>,
    interned: HashMap<String, usize>,

    // Per-entry state.
    code: BCode,
    slots: HashMap<NodeSocket, i64>,
    generating: Vec<usize>,
    sp: i64,
}

impl<'a> Generator<'a> {
    fn new(sheet: &'a Sheet, id: SheetId, opts: CodegenOptions) -> Generator<'a> {
        Generator {
            sheet,
            id,
            opts,
            data: Vec::new(),
            link: Vec::new(),
            interned: HashMap::new(),
            code: BCode::new(),
            slots: HashMap::new(),
            generating: Vec::new(),
            sp: 0,
        }
    }

    fn run(mut self) -> Result<Artifacts, GenFail> {
        self.layout_variables()?;

        let mut text = BCode::new();
        for index in 0..self.sheet.functions.len() {
            // A sentinel RET so control cannot fall into the body.
            text.concat(BCode::ins(Opcode::Ret));
            let entry = text.len();
            let name = self.sheet.functions[index].def.name.clone();
            let meta =
                self.find_or_add_meta(LinkType::Function, name, LinkRef::Function(self.id, index));
            self.link[meta].ptr = Some(entry);
            let body = self.entry_body(Entry::Function(index))?;
            text.concat(body);
        }

        text.concat(BCode::ins(Opcode::Ret));
        let main = text.len();
        match self.sheet.start_node {
            Some(start) => {
                let body = self.entry_body(Entry::Start(start))?;
                text.concat(body);
            }
            None => {
                // Nothing to run; main still points at a valid
                // instruction.
                text.concat(BCode::ins(Opcode::Ret));
            }
        }

        let mut main = main;
        if self.opts.optimize {
            reduce(&mut text, &mut self.link, &mut main, self.id);
        }

        Ok(Artifacts {
            text,
            data: self.data,
            link: self.link,
            main,
        })
    }

    // ---- data section -------------------------------------------------

    fn intern(&mut self, value: &str) -> usize {
        if let Some(&offset) = self.interned.get(value) {
            return offset;
        }
        let offset = self.data.len();
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.interned.insert(String::from(value), offset);
        offset
    }

    fn layout_variables(&mut self) -> Result<(), GenFail> {
        for (index, var) in self.sheet.variables.iter().enumerate() {
            let refers = LinkRef::Variable(self.id, index);
            let name = var.meta.name.clone();
            match types::concrete(var.meta.typ) {
                Some(DType::Bool) => {
                    let offset = self.data.len();
                    let default = matches!(var.meta.default, LitValue::Bool(true));
                    self.data.push(default as u8);
                    self.link.push(LinkMeta {
                        kind: LinkType::Variable,
                        name,
                        refers,
                        ptr: Some(offset),
                    });
                }
                Some(DType::Str) => {
                    let text = match &var.meta.default {
                        LitValue::Str(s) => s.clone(),
                        _ => String::new(),
                    };
                    let default_offset = self.intern(&text);
                    let offset = self.data.len();
                    self.data.extend_from_slice(&[0u8; 8]);
                    self.link.push(LinkMeta {
                        kind: LinkType::VariablePointer,
                        name: name.clone(),
                        refers,
                        ptr: Some(offset),
                    });
                    self.link.push(LinkMeta {
                        kind: LinkType::VariableStringDefault,
                        name,
                        refers,
                        ptr: Some(default_offset),
                    });
                }
                Some(DType::Float) => {
                    let offset = self.data.len();
                    let default = match var.meta.default {
                        LitValue::Float(f) => f,
                        LitValue::Int(i) => i as f64,
                        _ => 0.0,
                    };
                    self.data.extend_from_slice(&default.to_bits().to_ne_bytes());
                    self.link.push(LinkMeta {
                        kind: LinkType::Variable,
                        name,
                        refers,
                        ptr: Some(offset),
                    });
                }
                Some(DType::Int) => {
                    let offset = self.data.len();
                    let default = match var.meta.default {
                        LitValue::Int(i) => i,
                        LitValue::Bool(b) => b as i64,
                        _ => 0,
                    };
                    self.data.extend_from_slice(&default.to_ne_bytes());
                    self.link.push(LinkMeta {
                        kind: LinkType::Variable,
                        name,
                        refers,
                        ptr: Some(offset),
                    });
                }
                _ => {
                    return Err(internal(0, "variable with a non-concrete type"));
                }
            }
        }
        Ok(())
    }

    fn find_or_add_meta(&mut self, kind: LinkType, name: String, refers: LinkRef) -> usize {
        if let Some(index) = self
            .link
            .iter()
            .position(|m| m.kind == kind && m.name == name)
        {
            return index;
        }
        let ptr = match refers {
            LinkRef::CFunction(index) => Some(index),
            _ => None,
        };
        self.link.push(LinkMeta {
            kind,
            name,
            refers,
            ptr,
        });
        self.link.len() - 1
    }

    // ---- emission helpers ---------------------------------------------

    fn emit(&mut self, op: Opcode) {
        self.code.concat(BCode::ins(op));
    }

    fn emit_f(&mut self, op: Opcode, imm: i64) -> usize {
        let pos = self.code.len();
        let mut ins = BCode::ins(op);
        ins.set_fimmediate(1, imm);
        self.code.concat(ins);
        pos
    }

    fn emit_b(&mut self, op: Opcode, imm: u8) {
        let mut ins = BCode::ins(op);
        ins.set_byte(1, imm);
        self.code.concat(ins);
    }

    fn emit_syscall(&mut self, number: i64) {
        self.emit_b(Opcode::Syscall, number as u8);
    }

    fn note_value(&mut self, pos: usize, slot: i64) {
        if self.opts.debug {
            self.code.debug.add_value_info(InsValueInfo {
                ins: pos,
                stack_index: slot,
            });
        }
    }

    // ---- entries ------------------------------------------------------

    fn entry_body(&mut self, entry: Entry) -> Result<BCode, GenFail> {
        self.code = BCode::new();
        self.slots.clear();
        self.generating.clear();

        match entry {
            Entry::Start(node) => {
                self.sp = 0;
                self.gen_chain(NodeSocket::new(node, 0))?;
            }
            Entry::Function(index) => {
                let func = &self.sheet.functions[index];
                let define = func.define_node.ok_or_else(|| {
                    internal(0, "function reached code generation without a Define")
                })?;
                let node = &self.sheet.nodes[define];
                let first_value_output =
                    node.start_output_index + func.is_subroutine as usize;
                let num_args = node.num_sockets() - first_value_output;
                for slot in 0..num_args {
                    self.slots.insert(
                        NodeSocket::new(define, first_value_output + slot),
                        slot as i64,
                    );
                }
                self.sp = num_args as i64;
                if func.is_subroutine {
                    self.gen_chain(NodeSocket::new(define, node.start_output_index))?;
                } else {
                    let ret = func.last_return_node.ok_or_else(|| {
                        internal(0, "function reached code generation without a Return")
                    })?;
                    self.gen_return(ret)?;
                }
            }
        }
        Ok(std::mem::take(&mut self.code))
    }

    // Follow the single execution wire out of a socket; an unconnected
    // execution output ends the chain.
    fn gen_chain(&mut self, socket: NodeSocket) -> Result<(), GenFail> {
        match self.sheet.wire_find_first(socket) {
            Some(index) => {
                let next = self.sheet.wires[index].to.node;
                self.gen_exec_node(next)
            }
            None => {
                self.emit(Opcode::Ret);
                Ok(())
            }
        }
    }

    fn gen_exec_node(&mut self, node_index: usize) -> Result<(), GenFail> {
        let node = &self.sheet.nodes[node_index];
        if self.opts.debug {
            self.code.debug.add_exec_info(InsExecInfo {
                ins: self.code.len(),
                line: node.line,
            });
            self.code.debug.add_node_info(InsNodeInfo {
                ins: self.code.len(),
                node: node_index,
            });
        }
        match node.resolution.clone() {
            NameResolution::VariableSet { sheet, var } => {
                self.gen_set(node_index, sheet, var)
            }
            NameResolution::FunctionCall { .. } | NameResolution::CFunctionCall { .. } => {
                self.gen_call(node_index, true)?;
                let node = &self.sheet.nodes[node_index];
                self.gen_chain(NodeSocket::new(node_index, node.start_output_index))
            }
            NameResolution::FunctionReturn { .. } => self.gen_return(node_index),
            NameResolution::Core(CoreNode::Print) => self.gen_print(node_index),
            NameResolution::Core(CoreNode::IfThenElse) => self.gen_if(node_index),
            _ => Err(internal(
                node.line,
                "a value node was reached through an execution wire",
            )),
        }
    }

    fn gen_print(&mut self, node_index: usize) -> Result<(), GenFail> {
        let inputs = self.sheet.nodes[node_index].start_output_index;
        for socket in 1..inputs {
            let at = NodeSocket::new(node_index, socket);
            let atom = self.concrete_type(at)?;
            self.gen_value_socket(at)?;
            let syscall = match atom {
                DType::Int => vm::SYS_PRINT_INT,
                DType::Float => vm::SYS_PRINT_FLOAT,
                DType::Str => vm::SYS_PRINT_STR,
                DType::Bool => vm::SYS_PRINT_BOOL,
                _ => {
                    let line = self.sheet.nodes[node_index].line;
                    return Err(internal(line, "unprintable socket type"));
                }
            };
            self.emit_syscall(syscall);
            self.sp -= 1;
        }
        self.emit_syscall(vm::SYS_PRINT_NEWLINE);
        self.gen_chain(NodeSocket::new(node_index, inputs))
    }

    fn gen_set(
        &mut self,
        node_index: usize,
        var_sheet: SheetId,
        var: usize,
    ) -> Result<(), GenFail> {
        let node = &self.sheet.nodes[node_index];
        let line = node.line;
        let name = match node
            .literals
            .as_ref()
            .and_then(|l| l.get(1).cloned().flatten())
        {
            Some(LitValue::Str(name)) => name,
            _ => return Err(internal(line, "Set without a variable name")),
        };

        let value_socket = NodeSocket::new(node_index, 2);
        let atom = self.concrete_type(value_socket)?;
        self.gen_value_socket(value_socket)?;

        let (kind, op) = match atom {
            DType::Bool => (LinkType::Variable, Opcode::SetadrB),
            DType::Str => (LinkType::VariablePointer, Opcode::Setadr),
            _ => (LinkType::Variable, Opcode::Setadr),
        };
        let meta = self.find_or_add_meta(kind, name, LinkRef::Variable(var_sheet, var));
        let pos = self.emit_f(Opcode::PushF, 0);
        self.code.add_link(pos, meta);
        self.sp += 1;
        self.emit(op);
        self.sp -= 2;

        self.gen_chain(NodeSocket::new(node_index, 3))
    }

    fn gen_if(&mut self, node_index: usize) -> Result<(), GenFail> {
        self.gen_value_socket(NodeSocket::new(node_index, 1))?;
        let jump = self.emit_f(Opcode::JrconFi, 0);
        self.sp -= 1;

        // The two branches are exclusive: each sees the same stack.
        let saved_sp = self.sp;
        let saved_slots = self.slots.clone();

        self.gen_chain(NodeSocket::new(node_index, 3))?; // else
        let then_offset = self.code.len();
        self.code
            .set_fimmediate(jump + 1, (then_offset - jump) as i64);

        self.sp = saved_sp;
        self.slots = saved_slots;
        self.gen_chain(NodeSocket::new(node_index, 2)) // then
    }

    fn gen_return(&mut self, node_index: usize) -> Result<(), GenFail> {
        let node = &self.sheet.nodes[node_index];
        let is_subroutine = match node.resolution {
            NameResolution::FunctionReturn { func } => {
                self.sheet.functions[func].is_subroutine
            }
            _ => return Err(internal(node.line, "Return without a function")),
        };
        let first_value = 1 + is_subroutine as usize;
        let count = node.start_output_index - first_value;
        for socket in first_value..node.start_output_index {
            self.gen_value_socket(NodeSocket::new(node_index, socket))?;
        }
        self.emit_b(Opcode::Retn, count as u8);
        self.sp -= count as i64;
        Ok(())
    }

    // Arguments, then the call itself, then slots for the outputs.
    fn gen_call(&mut self, node_index: usize, is_subroutine: bool) -> Result<(), GenFail> {
        let node = &self.sheet.nodes[node_index];
        let line = node.line;
        let first_arg = is_subroutine as usize;
        let inputs = node.start_output_index;
        let sp_before = self.sp;

        for socket in first_arg..inputs {
            self.gen_value_socket(NodeSocket::new(node_index, socket))?;
        }
        let num_args = (inputs - first_arg) as u8;

        let node = &self.sheet.nodes[node_index];
        let pos = self.code.len();
        match node.resolution {
            NameResolution::FunctionCall { sheet, func } => {
                let meta = self.find_or_add_meta(
                    LinkType::Function,
                    node.def.name.clone(),
                    LinkRef::Function(sheet, func),
                );
                let mut ins = BCode::ins(Opcode::CallI);
                ins.set_byte(1 + vm::FIMMEDIATE_SIZE, num_args);
                self.code.concat(ins);
                self.code.add_link(pos, meta);
            }
            NameResolution::CFunctionCall { index } => {
                let meta = self.find_or_add_meta(
                    LinkType::CFunction,
                    node.def.name.clone(),
                    LinkRef::CFunction(index),
                );
                let mut ins = BCode::ins(Opcode::CallCi);
                ins.set_byte(1 + vm::FIMMEDIATE_SIZE, num_args);
                self.code.concat(ins);
                self.code.add_link(pos, meta);
            }
            _ => return Err(internal(line, "call on a non-function node")),
        }

        let node = &self.sheet.nodes[node_index];
        let first_value_output = node.start_output_index + is_subroutine as usize;
        let num_outputs = node.num_sockets() - first_value_output;
        for k in 0..num_outputs {
            self.slots.insert(
                NodeSocket::new(node_index, first_value_output + k),
                sp_before + k as i64,
            );
        }
        self.sp = sp_before + num_outputs as i64;
        Ok(())
    }

    // ---- values -------------------------------------------------------

    fn concrete_type(&self, socket: NodeSocket) -> Result<DType, GenFail> {
        let t = self.sheet.socket_type(socket);
        types::concrete(t).ok_or_else(|| {
            internal(
                self.sheet.nodes[socket.node].line,
                "socket type survived reduction vague",
            )
        })
    }

    // Leave the value of an input socket on top of the stack.
    fn gen_value_socket(&mut self, socket: NodeSocket) -> Result<(), GenFail> {
        if let Some(wire) = self.sheet.wire_into(socket) {
            let producer = wire.from;
            if let Some(&slot) = self.slots.get(&producer) {
                let pos = self.emit_f(Opcode::GetFi, slot);
                self.note_value(pos, slot);
                self.sp += 1;
                return Ok(());
            }
            if self.is_pure_value(producer.node) {
                self.gen_value_node(producer.node)?;
                let slot = *self.slots.get(&producer).ok_or_else(|| {
                    internal(
                        self.sheet.nodes[socket.node].line,
                        "producer assigned no stack slot",
                    )
                })?;
                let pos = self.emit_f(Opcode::GetFi, slot);
                self.note_value(pos, slot);
                self.sp += 1;
                return Ok(());
            }
            // An execution node that never ran on this path; it was
            // already reported as redundant, so fall back to the
            // socket default.
        }
        self.push_default(socket)
    }

    fn is_pure_value(&self, node_index: usize) -> bool {
        let node = &self.sheet.nodes[node_index];
        match &node.resolution {
            NameResolution::VariableGet { .. } => true,
            NameResolution::FunctionCall { .. } | NameResolution::CFunctionCall { .. } => {
                !node.def.is_execution()
            }
            NameResolution::Core(core) => !matches!(
                core,
                CoreNode::Start | CoreNode::Print | CoreNode::IfThenElse | CoreNode::Set
            ),
            _ => false,
        }
    }

    fn gen_value_node(&mut self, node_index: usize) -> Result<(), GenFail> {
        if self.generating.contains(&node_index) {
            return Err(GenFail {
                kind: ErrorKind::CycleDetected,
                line: self.sheet.nodes[node_index].line,
                message: String::from("value wires form a cycle"),
            });
        }
        self.generating.push(node_index);
        if self.opts.debug {
            self.code.debug.add_node_info(InsNodeInfo {
                ins: self.code.len(),
                node: node_index,
            });
        }

        let result = match self.sheet.nodes[node_index].resolution.clone() {
            NameResolution::VariableGet { sheet, var } => {
                self.gen_getter(node_index, sheet, var)
            }
            NameResolution::FunctionCall { .. } | NameResolution::CFunctionCall { .. } => {
                self.gen_call(node_index, false)
            }
            NameResolution::Core(core) => self.gen_core_value(node_index, core),
            _ => Err(internal(
                self.sheet.nodes[node_index].line,
                "node cannot produce a value",
            )),
        };
        self.generating.pop();
        result
    }

    fn gen_getter(
        &mut self,
        node_index: usize,
        var_sheet: SheetId,
        var: usize,
    ) -> Result<(), GenFail> {
        let out = NodeSocket::new(node_index, 0);
        let atom = self.concrete_type(out)?;
        let name = self.sheet.nodes[node_index].def.name.clone();
        let (kind, op) = match atom {
            DType::Bool => (LinkType::Variable, Opcode::DerefBi),
            DType::Str => (LinkType::VariablePointer, Opcode::DerefI),
            _ => (LinkType::Variable, Opcode::DerefI),
        };
        let meta = self.find_or_add_meta(kind, name, LinkRef::Variable(var_sheet, var));
        let pos = self.emit_f(op, 0);
        self.code.add_link(pos, meta);
        self.slots.insert(out, self.sp);
        self.note_value(pos, self.sp);
        self.sp += 1;
        Ok(())
    }

    fn gen_core_value(&mut self, node_index: usize, core: CoreNode) -> Result<(), GenFail> {
        let node = &self.sheet.nodes[node_index];
        let inputs = node.start_output_index;
        let out = NodeSocket::new(node_index, inputs);
        let line = node.line;

        match core {
            CoreNode::Add
            | CoreNode::Subtract
            | CoreNode::Multiply
            | CoreNode::Divide
            | CoreNode::Mod
            | CoreNode::And
            | CoreNode::Or
            | CoreNode::Xor => {
                let atom = self.concrete_type(out)?;
                let op = arith_opcode(core, atom)
                    .ok_or_else(|| internal(line, "no opcode for this operand type"))?;
                self.gen_value_socket(NodeSocket::new(node_index, 0))?;
                for socket in 1..inputs {
                    self.gen_value_socket(NodeSocket::new(node_index, socket))?;
                    self.emit(op);
                    self.sp -= 1;
                }
            }
            CoreNode::Not => {
                let atom = self.concrete_type(out)?;
                self.gen_value_socket(NodeSocket::new(node_index, 0))?;
                match atom {
                    DType::Bool => self.emit(Opcode::Not),
                    // Bitwise complement.
                    _ => {
                        self.emit_f(Opcode::XorFi, -1);
                    }
                }
            }
            CoreNode::Equal | CoreNode::NotEqual => {
                let atom = self.concrete_type(NodeSocket::new(node_index, 0))?;
                self.gen_value_socket(NodeSocket::new(node_index, 0))?;
                self.gen_value_socket(NodeSocket::new(node_index, 1))?;
                match atom {
                    DType::Str => self.emit_syscall(vm::SYS_STR_EQ),
                    DType::Float => self.emit(Opcode::CeqF),
                    _ => self.emit(Opcode::Ceq),
                }
                self.sp -= 1;
                if core == CoreNode::NotEqual {
                    self.emit(Opcode::Not);
                }
            }
            CoreNode::LessThan
            | CoreNode::LessThanOrEqual
            | CoreNode::MoreThan
            | CoreNode::MoreThanOrEqual => {
                let atom = self.concrete_type(NodeSocket::new(node_index, 0))?;
                let op = comparison_opcode(core, atom)
                    .ok_or_else(|| internal(line, "no opcode for this operand type"))?;
                self.gen_value_socket(NodeSocket::new(node_index, 0))?;
                self.gen_value_socket(NodeSocket::new(node_index, 1))?;
                self.emit(op);
                self.sp -= 1;
            }
            CoreNode::Concat => {
                self.gen_value_socket(NodeSocket::new(node_index, 0))?;
                self.gen_value_socket(NodeSocket::new(node_index, 1))?;
                self.emit_syscall(vm::SYS_STR_CONCAT);
                self.sp -= 1;
            }
            _ => return Err(internal(line, "node cannot produce a value")),
        }

        self.slots.insert(out, self.sp - 1);
        Ok(())
    }

    // Push a socket's literal (or declared default) when nothing is
    // wired into it.
    fn push_default(&mut self, socket: NodeSocket) -> Result<(), GenFail> {
        let meta = self.sheet.socket_meta(socket);
        let atom = self.concrete_type(socket)?;
        match atom {
            DType::Int => {
                let value = match meta.default {
                    LitValue::Int(v) => v,
                    LitValue::Bool(b) => b as i64,
                    LitValue::Float(f) => f as i64,
                    LitValue::Str(_) => 0,
                };
                self.emit_f(Opcode::PushF, value);
            }
            DType::Float => {
                let value = match meta.default {
                    LitValue::Float(f) => f,
                    LitValue::Int(v) => v as f64,
                    _ => 0.0,
                };
                self.emit_f(Opcode::PushF, value.to_bits() as i64);
            }
            DType::Bool => {
                let value = matches!(meta.default, LitValue::Bool(true));
                self.emit_f(Opcode::PushF, value as i64);
            }
            DType::Str => {
                let text = match &meta.default {
                    LitValue::Str(s) => s.clone(),
                    _ => String::new(),
                };
                let offset = self.intern(&text);
                let meta_index = self.find_or_add_meta(
                    LinkType::DataStringLiteral,
                    text,
                    LinkRef::None,
                );
                self.link[meta_index].ptr = Some(offset);
                let pos = self.emit_f(Opcode::PushF, 0);
                self.code.add_link(pos, meta_index);
            }
            _ => {
                return Err(internal(
                    self.sheet.nodes[socket.node].line,
                    "socket has no pushable value",
                ))
            }
        }
        self.sp += 1;
        Ok(())
    }
}


enum Entry {
    Start(usize),
    Function(usize),
}


fn arith_opcode(core: CoreNode, atom: DType) -> Option<Opcode> {
    use Opcode::*;
    Some(match (core, atom) {
        (CoreNode::Add, DType::Float) => AddF,
        (CoreNode::Add, _) => Add,
        (CoreNode::Subtract, DType::Float) => SubF,
        (CoreNode::Subtract, _) => Sub,
        (CoreNode::Multiply, DType::Float) => MulF,
        (CoreNode::Multiply, _) => Mul,
        (CoreNode::Divide, DType::Float) => DivF,
        (CoreNode::Divide, _) => Div,
        (CoreNode::Mod, DType::Float) => return None,
        (CoreNode::Mod, _) => Mod,
        (CoreNode::And, DType::Float) => return None,
        (CoreNode::And, _) => And,
        (CoreNode::Or, DType::Float) => return None,
        (CoreNode::Or, _) => Or,
        (CoreNode::Xor, DType::Float) => return None,
        (CoreNode::Xor, _) => Xor,
        _ => return None,
    })
}

fn comparison_opcode(core: CoreNode, atom: DType) -> Option<Opcode> {
    use Opcode::*;
    Some(match (core, atom) {
        (CoreNode::LessThan, DType::Float) => CltF,
        (CoreNode::LessThan, _) => Clt,
        (CoreNode::LessThanOrEqual, DType::Float) => CleqF,
        (CoreNode::LessThanOrEqual, _) => Cleq,
        (CoreNode::MoreThan, DType::Float) => CmtF,
        (CoreNode::MoreThan, _) => Cmt,
        (CoreNode::MoreThanOrEqual, DType::Float) => CmeqF,
        (CoreNode::MoreThanOrEqual, _) => Cmeq,
        _ => return None,
    })
}


// ---- size reduction ----------------------------------------------------

// (full, half, byte, displacement-relative)
fn shrink_family(op: Opcode) -> Option<(Opcode, Opcode, Opcode, bool)> {
    use Opcode::*;
    Some(match op {
        AddFi | AddHi | AddBi => (AddFi, AddHi, AddBi, false),
        AndFi | AndHi | AndBi => (AndFi, AndHi, AndBi, false),
        DivFi | DivHi | DivBi => (DivFi, DivHi, DivBi, false),
        GetFi | GetHi | GetBi => (GetFi, GetHi, GetBi, false),
        ModFi | ModHi | ModBi => (ModFi, ModHi, ModBi, false),
        MulFi | MulHi | MulBi => (MulFi, MulHi, MulBi, false),
        OrFi | OrHi | OrBi => (OrFi, OrHi, OrBi, false),
        PopF | PopH | PopB => (PopF, PopH, PopB, false),
        PushF | PushH | PushB => (PushF, PushH, PushB, false),
        PushNf | PushNh | PushNb => (PushNf, PushNh, PushNb, false),
        SubFi | SubHi | SubBi => (SubFi, SubHi, SubBi, false),
        XorFi | XorHi | XorBi => (XorFi, XorHi, XorBi, false),
        JrFi | JrHi | JrBi => (JrFi, JrHi, JrBi, true),
        JrconFi | JrconHi | JrconBi => (JrconFi, JrconHi, JrconBi, true),
        CallRf | CallRh | CallRb => (CallRf, CallRh, CallRb, true),
        _ => return None,
    })
}

fn tier(op: Opcode, family: (Opcode, Opcode, Opcode, bool)) -> usize {
    if op == family.2 {
        0
    } else if op == family.1 {
        1
    } else {
        2
    }
}

fn pick(value: i64, family: (Opcode, Opcode, Opcode, bool)) -> (Opcode, usize) {
    if value >= i8::MIN as i64 && value <= i8::MAX as i64 {
        (family.2, 0)
    } else if value >= i16::MIN as i64 && value <= i16::MAX as i64 {
        (family.1, 1)
    } else {
        (family.0, 2)
    }
}

struct Decoded {
    op: Opcode,
    imm1: i64,
    imm2: i64,
    // Instruction index of a relative jump's destination.
    target: Option<usize>,
    reloc: bool,
}

fn read_imm(code: &[u8], at: usize, size: usize) -> Option<i64> {
    let bytes = code.get(at..at + size)?;
    Some(match size {
        1 => bytes[0] as i8 as i64,
        2 => {
            let mut buf = [0u8; 2];
            buf.copy_from_slice(bytes);
            i16::from_ne_bytes(buf) as i64
        }
        _ => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            i64::from_ne_bytes(buf)
        }
    })
}

fn write_imm(out: &mut Vec<u8>, value: i64, size: usize) {
    match size {
        1 => out.push(value as i8 as u8),
        2 => out.extend_from_slice(&(value as i16).to_ne_bytes()),
        _ => out.extend_from_slice(&value.to_ne_bytes()),
    }
}

// Shrink full immediates to byte/half encodings where they fit,
// re-targeting relative jumps and recomputing every sidecar offset.
// Runs to a fixed point: shrinking one jump may let another shrink.
// Relocated immediates are left full-width for the linker.
pub(crate) fn reduce(text: &mut BCode, link: &mut [LinkMeta], main: &mut usize, id: SheetId) {
    let reloc: HashSet<usize> = text.links.iter().map(|l| l.ins).collect();

    // Decode.
    let mut instructions = Vec::new();
    let mut offsets = Vec::new();
    let mut index_of = HashMap::new();
    let mut at = 0;
    while at < text.code.len() {
        let op = match Opcode::try_from(text.code[at]) {
            Ok(op) => op,
            Err(_) => return, // not our encoding; leave untouched
        };
        let (imm1, imm2) = match op.layout() {
            ImmLayout::None => (0, 0),
            ImmLayout::Byte => (read_imm(&text.code, at + 1, 1).unwrap_or(0), 0),
            ImmLayout::Half => (read_imm(&text.code, at + 1, 2).unwrap_or(0), 0),
            ImmLayout::Full => (read_imm(&text.code, at + 1, 8).unwrap_or(0), 0),
            ImmLayout::ByteByte => (
                read_imm(&text.code, at + 1, 1).unwrap_or(0),
                read_imm(&text.code, at + 2, 1).unwrap_or(0),
            ),
            ImmLayout::HalfByte => (
                read_imm(&text.code, at + 1, 2).unwrap_or(0),
                read_imm(&text.code, at + 3, 1).unwrap_or(0),
            ),
            ImmLayout::FullByte => (
                read_imm(&text.code, at + 1, 8).unwrap_or(0),
                read_imm(&text.code, at + 9, 1).unwrap_or(0),
            ),
        };
        index_of.insert(at, instructions.len());
        offsets.push(at);
        instructions.push(Decoded {
            op,
            imm1,
            imm2,
            target: None,
            reloc: reloc.contains(&at),
        });
        at += op.size();
    }

    // Resolve relative-jump targets to instruction indices. A target
    // off an instruction boundary would be unfixable, so bail.
    for index in 0..instructions.len() {
        if let Some(family) = shrink_family(instructions[index].op) {
            if family.3 {
                let absolute = offsets[index] as i64 + instructions[index].imm1;
                match index_of.get(&(absolute.max(0) as usize)) {
                    Some(&target) if absolute >= 0 => {
                        instructions[index].target = Some(target)
                    }
                    _ => return,
                }
            }
        }
    }

    // Shrink to a fixed point.
    let mut ops: Vec<Opcode> = instructions.iter().map(|i| i.op).collect();
    loop {
        let mut new_offsets = Vec::with_capacity(ops.len());
        let mut cursor = 0;
        for op in &ops {
            new_offsets.push(cursor);
            cursor += op.size();
        }

        let mut changed = false;
        for index in 0..ops.len() {
            if instructions[index].reloc {
                continue;
            }
            let family = match shrink_family(ops[index]) {
                Some(f) => f,
                None => continue,
            };
            let value = match instructions[index].target {
                Some(target) => new_offsets[target] as i64 - new_offsets[index] as i64,
                None => instructions[index].imm1,
            };
            let (desired, desired_tier) = pick(value, family);
            if desired_tier < tier(ops[index], family) {
                ops[index] = desired;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Re-emit.
    let mut final_offsets = Vec::with_capacity(ops.len());
    let mut cursor = 0;
    for op in &ops {
        final_offsets.push(cursor);
        cursor += op.size();
    }

    let mut new_code = Vec::with_capacity(cursor);
    for (index, ins) in instructions.iter().enumerate() {
        let op = ops[index];
        new_code.push(u8::from(op));
        let imm1 = match ins.target {
            Some(target) => final_offsets[target] as i64 - final_offsets[index] as i64,
            None => ins.imm1,
        };
        match op.layout() {
            ImmLayout::None => {}
            ImmLayout::Byte => write_imm(&mut new_code, imm1, 1),
            ImmLayout::Half => write_imm(&mut new_code, imm1, 2),
            ImmLayout::Full => write_imm(&mut new_code, imm1, 8),
            ImmLayout::ByteByte => {
                write_imm(&mut new_code, imm1, 1);
                write_imm(&mut new_code, ins.imm2, 1);
            }
            ImmLayout::HalfByte => {
                write_imm(&mut new_code, imm1, 2);
                write_imm(&mut new_code, ins.imm2, 1);
            }
            ImmLayout::FullByte => {
                write_imm(&mut new_code, imm1, 8);
                write_imm(&mut new_code, ins.imm2, 1);
            }
        }
    }
    text.code = new_code;

    // Remap every record that names an instruction offset.
    let remap = |offset: usize| -> usize {
        index_of
            .get(&offset)
            .map(|&index| final_offsets[index])
            .unwrap_or(offset)
    };
    for record in &mut text.links {
        record.ins = remap(record.ins);
    }
    for info in &mut text.debug.value_info {
        info.ins = remap(info.ins);
    }
    for info in &mut text.debug.exec_info {
        info.ins = remap(info.ins);
    }
    for info in &mut text.debug.node_info {
        info.ins = remap(info.ins);
    }
    for meta in link.iter_mut() {
        if meta.kind == LinkType::Function {
            if let LinkRef::Function(sheet, _) = meta.refers {
                if sheet == id {
                    if let Some(ptr) = meta.ptr {
                        meta.ptr = Some(remap(ptr));
                    }
                }
            }
        }
    }
    *main = remap(*main);
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes;
    use crate::sheet::Node;
    use crate::types::TypeSet;
    use std::convert::TryInto;
    use std::path::PathBuf;

    // ---- reduction ----------------------------------------------------

    fn emit_f_into(code: &mut BCode, op: Opcode, imm: i64) -> usize {
        let pos = code.len();
        let mut ins = BCode::ins(op);
        ins.set_fimmediate(1, imm);
        code.concat(ins);
        pos
    }

    #[test]
    fn test_reduce_shrinks_small_immediates() {
        let mut text = BCode::new();
        emit_f_into(&mut text, Opcode::PushF, 5);
        emit_f_into(&mut text, Opcode::PushF, 300);
        emit_f_into(&mut text, Opcode::PushF, 1 << 40);
        text.concat(BCode::ins(Opcode::Ret));

        let mut main = 0;
        reduce(&mut text, &mut [], &mut main, SheetId(0));

        assert_eq!(
            text.code[0..2],
            [u8::from(Opcode::PushB), 5u8],
        );
        assert_eq!(text.code[2], u8::from(Opcode::PushH));
        assert_eq!(text.code[5], u8::from(Opcode::PushF));
        assert_eq!(*text.code.last().unwrap(), u8::from(Opcode::Ret));
    }

    #[test]
    fn test_reduce_keeps_relocated_immediates() {
        let mut text = BCode::new();
        let pos = emit_f_into(&mut text, Opcode::PushF, 0);
        text.add_link(pos, 0);
        let mut main = 0;
        reduce(&mut text, &mut [], &mut main, SheetId(0));
        assert_eq!(text.code[0], u8::from(Opcode::PushF));
    }

    #[test]
    fn test_reduce_retargets_jumps() {
        // JRFI jumps over one shrinkable PUSHF to a RET.
        let mut text = BCode::new();
        emit_f_into(&mut text, Opcode::JrFi, 9 + 9);
        emit_f_into(&mut text, Opcode::PushF, 1);
        text.concat(BCode::ins(Opcode::Ret));

        let mut main = 0;
        reduce(&mut text, &mut [], &mut main, SheetId(0));

        // Both shrank to byte forms; the displacement is now 2 + 2.
        assert_eq!(text.code[0], u8::from(Opcode::JrBi));
        assert_eq!(text.code[1] as i8, 4);
        assert_eq!(text.code[2], u8::from(Opcode::PushB));
        assert_eq!(text.code[4], u8::from(Opcode::Ret));
    }

    #[test]
    fn test_reduce_remaps_sidecars_and_main() {
        let mut text = BCode::new();
        emit_f_into(&mut text, Opcode::PushF, 1); // shrinks 9 -> 2
        let ret_at = text.len();
        text.concat(BCode::ins(Opcode::Ret));
        text.debug.add_exec_info(crate::bytecode::InsExecInfo {
            ins: ret_at,
            line: 9,
        });

        let mut main = ret_at;
        reduce(&mut text, &mut [], &mut main, SheetId(0));
        assert_eq!(main, 2);
        assert_eq!(text.debug.exec_info[0].ins, 2);
    }

    #[test]
    fn test_reduce_is_idempotent() {
        let mut text = BCode::new();
        emit_f_into(&mut text, Opcode::JrFi, 18);
        emit_f_into(&mut text, Opcode::PushF, 77);
        emit_f_into(&mut text, Opcode::GetFi, 1000);
        text.concat(BCode::ins(Opcode::Ret));

        let mut main = 0;
        reduce(&mut text, &mut [], &mut main, SheetId(0));
        let once = text.clone();
        reduce(&mut text, &mut [], &mut main, SheetId(0));
        assert_eq!(text.code, once.code);
        assert_eq!(text.debug, once.debug);
    }

    // ---- generation over a hand-built graph ---------------------------

    fn make_node(core: CoreNode, reduced: Vec<TypeSet>, literals: Vec<Option<LitValue>>) -> Node {
        let def = core.definition();
        let inputs = literals.len();
        Node {
            def: def.clone(),
            line: 1,
            start_output_index: if def.infinite_inputs {
                inputs
            } else {
                def.start_output_index
            },
            reduced: Some(reduced),
            literals: Some(literals),
            resolution: NameResolution::Core(core),
        }
    }

    // Start -> Print(42 * 6).
    fn print_sheet(factor: LitValue, number: TypeSet) -> Sheet {
        let mut sheet = Sheet::new(PathBuf::from("test.dc"));
        let start = sheet.add_node(make_node(CoreNode::Start, vec![types::execution()], vec![]));
        let mul = sheet.add_node(make_node(
            CoreNode::Multiply,
            vec![number, number, number],
            vec![Some(LitValue::Int(42)), Some(factor)],
        ));
        let print = sheet.add_node(make_node(
            CoreNode::Print,
            vec![types::execution(), number, types::execution()],
            vec![None, None],
        ));
        sheet.start_node = Some(start);
        sheet.num_starts = 1;
        sheet
            .add_wire(crate::sheet::Wire {
                from: NodeSocket::new(start, 0),
                to: NodeSocket::new(print, 0),
            })
            .unwrap();
        sheet
            .add_wire(crate::sheet::Wire {
                from: NodeSocket::new(mul, 2),
                to: NodeSocket::new(print, 1),
            })
            .unwrap();
        sheet
    }

    fn compile_one(sheet: Sheet, opts: CodegenOptions) -> Sheet {
        let mut store = SheetStore::new();
        let id = store.alloc(sheet);
        let mut diags = Diagnostics::new();
        compile_sheet(&mut store, id, opts, &mut diags);
        assert!(!diags.has_errors(), "codegen failed: {:?}", diags);
        store.take(id)
    }

    fn opcodes_of(text: &[u8]) -> Vec<Opcode> {
        let mut out = Vec::new();
        let mut at = 0;
        while at < text.len() {
            let op = Opcode::try_from(text[at]).unwrap();
            out.push(op);
            at += op.size();
        }
        out
    }

    #[test]
    fn test_integer_multiply_lowering() {
        let sheet = compile_one(
            print_sheet(LitValue::Int(6), types::single(DType::Int)),
            CodegenOptions {
                optimize: false,
                debug: false,
            },
        );
        assert!(sheet.is_compiled);
        let ops = opcodes_of(&sheet.text);
        assert!(ops.contains(&Opcode::Mul));
        assert!(!ops.contains(&Opcode::MulF));
        assert!(ops.contains(&Opcode::Syscall));
        // main skips the function-less preamble: a single RET sentinel.
        assert_eq!(sheet.main, 1);
        assert_eq!(sheet.text[0], u8::from(Opcode::Ret));
        assert!(sheet.ins_link_list.is_empty());
    }

    #[test]
    fn test_float_multiply_lowering() {
        let sheet = compile_one(
            print_sheet(LitValue::Float(6.0), types::single(DType::Float)),
            CodegenOptions {
                optimize: false,
                debug: false,
            },
        );
        let ops = opcodes_of(&sheet.text);
        assert!(ops.contains(&Opcode::MulF));
        assert!(!ops.contains(&Opcode::Mul));
    }

    #[test]
    fn test_string_literal_gets_reloc() {
        let mut sheet = Sheet::new(PathBuf::from("test.dc"));
        let start = sheet.add_node(make_node(CoreNode::Start, vec![types::execution()], vec![]));
        let print = sheet.add_node(make_node(
            CoreNode::Print,
            vec![
                types::execution(),
                types::single(DType::Str),
                types::execution(),
            ],
            vec![None, Some(LitValue::Str(String::from("hello")))],
        ));
        sheet.start_node = Some(start);
        sheet
            .add_wire(crate::sheet::Wire {
                from: NodeSocket::new(start, 0),
                to: NodeSocket::new(print, 0),
            })
            .unwrap();

        let sheet = compile_one(sheet, CodegenOptions::default());
        assert_eq!(sheet.ins_link_list.len(), 1);
        let meta = &sheet.link[sheet.ins_link_list[0].link];
        assert_eq!(meta.kind, LinkType::DataStringLiteral);
        assert_eq!(meta.name, "hello");
        let offset = meta.ptr.unwrap();
        assert_eq!(&sheet.data[offset..offset + 6], b"hello\0");
        // The relocated PUSHF survived size reduction at full width.
        let ins = sheet.ins_link_list[0].ins;
        assert_eq!(sheet.text[ins], u8::from(Opcode::PushF));
    }

    #[test]
    fn test_debug_sidecars_populated() {
        let sheet = compile_one(
            print_sheet(LitValue::Int(6), types::single(DType::Int)),
            CodegenOptions {
                optimize: true,
                debug: true,
            },
        );
        assert!(!sheet.debug.exec_info.is_empty());
        assert!(!sheet.debug.node_info.is_empty());
        assert!(!sheet.debug.value_info.is_empty());
    }

    #[test]
    fn test_variable_layout() {
        let mut sheet = Sheet::new(PathBuf::from("test.dc"));
        let meta = crate::sheet::SocketMeta::new(
            "count",
            types::single(DType::Int),
            LitValue::Int(420),
        );
        sheet.variables.push(crate::sheet::SheetVariable {
            getter: nodes::getter_def("count", &meta),
            meta,
            sheet: SheetId(0),
        });
        let smeta = crate::sheet::SocketMeta::new(
            "greeting",
            types::single(DType::Str),
            LitValue::Str(String::from("hi")),
        );
        sheet.variables.push(crate::sheet::SheetVariable {
            getter: nodes::getter_def("greeting", &smeta),
            meta: smeta,
            sheet: SheetId(0),
        });

        let sheet = compile_one(sheet, CodegenOptions::default());
        let kinds: Vec<LinkType> = sheet.link.iter().map(|m| m.kind).collect();
        assert!(kinds.contains(&LinkType::Variable));
        assert!(kinds.contains(&LinkType::VariablePointer));
        assert!(kinds.contains(&LinkType::VariableStringDefault));
        // Int default landed in data.
        let int_meta = sheet
            .link
            .iter()
            .find(|m| m.kind == LinkType::Variable)
            .unwrap();
        let at = int_meta.ptr.unwrap();
        assert_eq!(
            i64::from_ne_bytes(sheet.data[at..at + 8].try_into().unwrap()),
            420
        );
    }
}
