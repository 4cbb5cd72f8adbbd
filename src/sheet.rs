// The graph IR.
//
// A sheet is one compilation unit: nodes wired together, plus the
// variables, functions and includes its source declared, plus the
// compiled artifacts once code generation and linking have run.
//
// Everything here is pure data addressed by index: sheets live in a
// SheetStore and refer to each other by SheetId, nodes and wires are
// indices into their owning sheet. Cross-sheet references are
// (SheetId, local index) pairs. All mutation beyond simple insertion
// happens in the semantic/codegen/link passes.

use std::fmt::Write as _;
use std::path::PathBuf;

use crate::ast::Def;
use crate::bytecode::DebugInfo;
use crate::nodes::CoreNode;
use crate::types::{self, DType, LitValue, TypeSet};


#[derive(Clone, Debug, PartialEq)]
pub struct SocketMeta {
    pub name: String,
    pub description: String,
    pub typ: TypeSet,
    pub default: LitValue,
}

impl SocketMeta {
    pub fn new(name: &str, typ: TypeSet, default: LitValue) -> SocketMeta {
        SocketMeta {
            name: String::from(name),
            description: String::new(),
            typ,
            default,
        }
    }
}


#[derive(Clone, Debug, PartialEq)]
pub struct NodeDefinition {
    pub name: String,
    pub description: String,
    pub sockets: Vec<SocketMeta>,
    // Any socket before this index is an input, the rest are outputs.
    pub start_output_index: usize,
    // The input list may be extended per instance; the last declared
    // input repeats.
    pub infinite_inputs: bool,
}

impl NodeDefinition {
    pub fn num_inputs(&self) -> usize {
        self.start_output_index
    }

    pub fn num_outputs(&self) -> usize {
        self.sockets.len() - self.start_output_index
    }

    pub fn is_execution(&self) -> bool {
        self.sockets
            .iter()
            .any(|s| s.typ.contains(DType::Execution))
    }
}


// An index of a node's socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeSocket {
    pub node: usize,
    pub socket: usize,
}

impl NodeSocket {
    pub fn new(node: usize, socket: usize) -> NodeSocket {
        NodeSocket { node, socket }
    }
}


// A directed edge from an output socket to an input socket. Wires are
// kept sorted lexicographically so lookup is a binary search.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Wire {
    pub from: NodeSocket,
    pub to: NodeSocket,
}


#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SheetId(pub usize);


// What a node's name resolved to during semantic analysis.
#[derive(Clone, Debug, PartialEq)]
pub enum NameResolution {
    Core(CoreNode),
    VariableGet { sheet: SheetId, var: usize },
    VariableSet { sheet: SheetId, var: usize },
    FunctionCall { sheet: SheetId, func: usize },
    FunctionDefine { func: usize },
    FunctionReturn { func: usize },
    CFunctionCall { index: usize },
}


#[derive(Clone, Debug)]
pub struct Node {
    pub def: Def,
    pub line: usize,
    // Socket types after reduction; None until reduction has run.
    pub reduced: Option<Vec<TypeSet>>,
    // Literal arguments overriding socket defaults, one slot per input.
    pub literals: Option<Vec<Option<LitValue>>>,
    // Matches the definition's except when infinite inputs expanded.
    pub start_output_index: usize,
    pub resolution: NameResolution,
}

impl Node {
    pub fn num_inputs(&self) -> usize {
        self.start_output_index
    }

    pub fn num_outputs(&self) -> usize {
        self.def.num_outputs()
    }

    pub fn num_sockets(&self) -> usize {
        self.start_output_index + self.def.num_outputs()
    }

    // The declared metadata of a socket, with the trailing declared
    // input repeating for expanded variadic instances.
    pub fn declared_socket(&self, socket: usize) -> &SocketMeta {
        if socket < self.start_output_index {
            if socket < self.def.start_output_index {
                &self.def.sockets[socket]
            } else {
                &self.def.sockets[self.def.start_output_index - 1]
            }
        } else {
            &self.def.sockets[self.def.start_output_index + (socket - self.start_output_index)]
        }
    }
}


// The kind of object a link meta points to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkType {
    DataStringLiteral,
    Variable,
    VariablePointer,
    VariableStringDefault,
    Function,
    CFunction,
}

// The defining object behind a link meta, once known.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkRef {
    None,
    Variable(SheetId, usize),
    Function(SheetId, usize),
    CFunction(usize),
}

// A symbol to resolve at link time. `ptr` is the offset into the owning
// sheet's section while the object is local, the final absolute address
// once an external reference has been precalculated, and None while
// unresolved.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkMeta {
    pub kind: LinkType,
    pub name: String,
    pub refers: LinkRef,
    pub ptr: Option<usize>,
}

// A text-section instruction whose full immediate must be rewritten at
// link time. `ins` is the byte offset of the instruction itself; the
// immediate starts one byte later.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InstructionToLink {
    pub ins: usize,
    pub link: usize,
}


#[derive(Clone, Debug)]
pub struct SheetVariable {
    pub meta: SocketMeta,
    pub getter: Def,
    pub sheet: SheetId,
}

#[derive(Clone, Debug)]
pub struct SheetFunction {
    // The call interface (execution sockets included for subroutines).
    pub def: Def,
    pub define_def: Def,
    pub return_def: Def,
    pub is_subroutine: bool,
    pub sheet: SheetId,

    // Filled in by semantic analysis.
    pub define_node: Option<usize>,
    pub num_defines: usize,
    pub last_return_node: Option<usize>,
    pub num_returns: usize,
}


#[derive(Clone, Debug, Default)]
pub struct Sheet {
    pub file_path: PathBuf,
    // The argument of the Include property that loaded this sheet.
    pub include_path: Option<String>,
    pub has_errors: bool,

    pub includes: Vec<SheetId>,
    pub variables: Vec<SheetVariable>,
    pub functions: Vec<SheetFunction>,
    pub nodes: Vec<Node>,
    pub wires: Vec<Wire>,

    pub start_node: Option<usize>,
    pub num_starts: usize,

    // Compiled artifacts.
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    pub link: Vec<LinkMeta>,
    pub ins_link_list: Vec<InstructionToLink>,
    pub debug: DebugInfo,
    // Byte offset of the first real instruction of Start, not the RET
    // sentinel one before.
    pub main: usize,

    pub is_compiled: bool,
    pub is_linked: bool,
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddWireError {
    BadEndpoint,
    NotOutputToInput,
    TypeIncompatible,
    Duplicate,
}

impl Sheet {
    pub fn new(file_path: PathBuf) -> Sheet {
        Sheet {
            file_path,
            ..Sheet::default()
        }
    }

    pub fn add_node(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn is_node_valid(&self, node: usize) -> bool {
        node < self.nodes.len()
    }

    pub fn is_socket_valid(&self, socket: NodeSocket) -> bool {
        self.is_node_valid(socket.node)
            && socket.socket < self.nodes[socket.node].num_sockets()
    }

    pub fn is_input_socket(&self, socket: NodeSocket) -> bool {
        socket.socket < self.nodes[socket.node].start_output_index
    }

    // The socket's metadata with reductions and literal overrides
    // applied.
    pub fn socket_meta(&self, socket: NodeSocket) -> SocketMeta {
        let node = &self.nodes[socket.node];
        let mut meta = node.declared_socket(socket.socket).clone();
        if let Some(reduced) = &node.reduced {
            meta.typ = reduced[socket.socket];
        }
        if socket.socket < node.start_output_index {
            if let Some(literals) = &node.literals {
                if let Some(value) = &literals[socket.socket] {
                    meta.default = value.clone();
                }
            }
        }
        meta
    }

    pub fn socket_type(&self, socket: NodeSocket) -> TypeSet {
        let node = &self.nodes[socket.node];
        match &node.reduced {
            Some(reduced) => reduced[socket.socket],
            None => node.declared_socket(socket.socket).typ,
        }
    }

    // The lowest wire index originating from the given socket.
    pub fn wire_find_first(&self, socket: NodeSocket) -> Option<usize> {
        let index = self.wires.partition_point(|w| w.from < socket);
        if index < self.wires.len() && self.wires[index].from == socket {
            Some(index)
        } else {
            None
        }
    }

    fn is_wire_from(&self, index: usize, socket: NodeSocket) -> bool {
        index < self.wires.len() && self.wires[index].from == socket
    }

    // How many wires leave the given output socket.
    pub fn num_connections(&self, socket: NodeSocket) -> usize {
        match self.wire_find_first(socket) {
            None => 0,
            Some(first) => {
                let mut count = 0;
                while self.is_wire_from(first + count, socket) {
                    count += 1;
                }
                count
            }
        }
    }

    // The single wire arriving at an input socket, if any.
    pub fn wire_into(&self, socket: NodeSocket) -> Option<Wire> {
        self.wires.iter().find(|w| w.to == socket).copied()
    }

    pub fn add_wire(&mut self, wire: Wire) -> Result<(), AddWireError> {
        if !self.is_socket_valid(wire.from) || !self.is_socket_valid(wire.to) {
            return Err(AddWireError::BadEndpoint);
        }
        if self.is_input_socket(wire.from) || !self.is_input_socket(wire.to) {
            return Err(AddWireError::NotOutputToInput);
        }
        let from = self.socket_type(wire.from);
        let to = self.socket_type(wire.to);
        if (from & to).is_empty() {
            return Err(AddWireError::TypeIncompatible);
        }
        match self.wires.binary_search(&wire) {
            Ok(_) => Err(AddWireError::Duplicate),
            Err(index) => {
                self.wires.insert(index, wire);
                Ok(())
            }
        }
    }

    pub fn add_variable(&mut self, var: SheetVariable) -> usize {
        self.variables.push(var);
        self.variables.len() - 1
    }

    pub fn add_function(&mut self, func: SheetFunction) -> usize {
        self.functions.push(func);
        self.functions.len() - 1
    }

    pub fn add_include(&mut self, include: SheetId) {
        self.includes.push(include);
    }

    pub fn variable_by_name(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.meta.name == name)
    }

    pub fn function_by_name(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.def.name == name)
    }

    pub fn variables_dump(&self) -> String {
        let mut out = String::new();
        for var in &self.variables {
            let _ = writeln!(
                out,
                "{} {}",
                types::describe(var.meta.typ),
                var.meta.name
            );
        }
        out
    }

    pub fn functions_dump(&self) -> String {
        let mut out = String::new();
        for func in &self.functions {
            let sockets: Vec<String> = func
                .def
                .sockets
                .iter()
                .map(|s| format!("{} {}", types::describe(s.typ), s.name))
                .collect();
            let (inputs, outputs) = sockets.split_at(func.def.start_output_index);
            let _ = writeln!(
                out,
                "{}({}) -> ({})",
                func.def.name,
                inputs.join(", "),
                outputs.join(", ")
            );
        }
        out
    }
}


#[derive(Debug, Default)]
pub struct SheetStore {
    sheets: Vec<Sheet>,
}

impl SheetStore {
    pub fn new() -> SheetStore {
        SheetStore::default()
    }

    pub fn alloc(&mut self, sheet: Sheet) -> SheetId {
        self.sheets.push(sheet);
        SheetId(self.sheets.len() - 1)
    }

    pub fn get(&self, id: SheetId) -> &Sheet {
        &self.sheets[id.0]
    }

    pub fn get_mut(&mut self, id: SheetId) -> &mut Sheet {
        &mut self.sheets[id.0]
    }

    // Take a sheet out for mutation while other sheets stay readable,
    // leaving a default in its slot. Pair with put.
    pub fn take(&mut self, id: SheetId) -> Sheet {
        std::mem::take(&mut self.sheets[id.0])
    }

    pub fn put(&mut self, id: SheetId, sheet: Sheet) {
        self.sheets[id.0] = sheet;
    }

    pub fn len(&self) -> usize {
        self.sheets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = SheetId> {
        (0..self.sheets.len()).map(SheetId)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes;
    use crate::types::single;
    use std::sync::Arc;

    fn value_def(name: &str, typ: TypeSet) -> Def {
        Arc::new(NodeDefinition {
            name: String::from(name),
            description: String::new(),
            sockets: vec![
                SocketMeta::new("a", typ, LitValue::Int(0)),
                SocketMeta::new("b", typ, LitValue::Int(0)),
                SocketMeta::new("out", typ, LitValue::Int(0)),
            ],
            start_output_index: 2,
            infinite_inputs: false,
        })
    }

    fn test_node(def: &Def) -> Node {
        Node {
            def: def.clone(),
            line: 1,
            reduced: None,
            literals: None,
            start_output_index: def.start_output_index,
            resolution: NameResolution::Core(nodes::CoreNode::Add),
        }
    }

    fn two_node_sheet() -> Sheet {
        let def = value_def("Add", types::number());
        let mut sheet = Sheet::new(PathBuf::from("test.dc"));
        sheet.add_node(test_node(&def));
        sheet.add_node(test_node(&def));
        sheet
    }

    #[test]
    fn test_definition_socket_counts() {
        let def = value_def("Add", types::number());
        assert_eq!(def.num_inputs(), 2);
        assert_eq!(def.num_outputs(), 1);
        assert_eq!(def.num_inputs() + def.num_outputs(), def.sockets.len());
        assert!(!def.is_execution());
    }

    #[test]
    fn test_add_wire_sorted_and_deduped() {
        let mut sheet = two_node_sheet();
        let w1 = Wire {
            from: NodeSocket::new(0, 2),
            to: NodeSocket::new(1, 0),
        };
        let w2 = Wire {
            from: NodeSocket::new(0, 2),
            to: NodeSocket::new(1, 1),
        };
        assert_eq!(sheet.add_wire(w2), Ok(()));
        assert_eq!(sheet.add_wire(w1), Ok(()));
        assert_eq!(sheet.wires, vec![w1, w2]);
        assert_eq!(sheet.add_wire(w1), Err(AddWireError::Duplicate));
        assert_eq!(sheet.wires.len(), 2);
    }

    #[test]
    fn test_add_wire_validation() {
        let mut sheet = two_node_sheet();
        // Nonexistent node.
        assert_eq!(
            sheet.add_wire(Wire {
                from: NodeSocket::new(7, 2),
                to: NodeSocket::new(1, 0),
            }),
            Err(AddWireError::BadEndpoint)
        );
        // Input on the from side.
        assert_eq!(
            sheet.add_wire(Wire {
                from: NodeSocket::new(0, 0),
                to: NodeSocket::new(1, 0),
            }),
            Err(AddWireError::NotOutputToInput)
        );
    }

    #[test]
    fn test_add_wire_type_incompatible() {
        let int_def = value_def("Add", types::number());
        let str_def = value_def("Concat", single(DType::Str));
        let mut sheet = Sheet::new(PathBuf::from("test.dc"));
        sheet.add_node(test_node(&int_def));
        sheet.add_node(test_node(&str_def));
        assert_eq!(
            sheet.add_wire(Wire {
                from: NodeSocket::new(0, 2),
                to: NodeSocket::new(1, 0),
            }),
            Err(AddWireError::TypeIncompatible)
        );
    }

    #[test]
    fn test_wire_find_first_and_connections() {
        let mut sheet = two_node_sheet();
        let socket = NodeSocket::new(0, 2);
        assert_eq!(sheet.wire_find_first(socket), None);
        assert_eq!(sheet.num_connections(socket), 0);
        sheet
            .add_wire(Wire {
                from: socket,
                to: NodeSocket::new(1, 0),
            })
            .unwrap();
        sheet
            .add_wire(Wire {
                from: socket,
                to: NodeSocket::new(1, 1),
            })
            .unwrap();
        assert_eq!(sheet.wire_find_first(socket), Some(0));
        assert_eq!(sheet.num_connections(socket), 2);
        assert_eq!(sheet.num_connections(NodeSocket::new(1, 2)), 0);
    }

    #[test]
    fn test_variadic_socket_meta_repeats() {
        let def = Arc::new(NodeDefinition {
            name: String::from("Print"),
            description: String::new(),
            sockets: vec![
                SocketMeta::new("exec", types::execution(), LitValue::Int(0)),
                SocketMeta::new("value", types::var_any(), LitValue::Str(String::new())),
                SocketMeta::new("then", types::execution(), LitValue::Int(0)),
            ],
            start_output_index: 2,
            infinite_inputs: true,
        });
        let mut node = test_node(&def);
        node.start_output_index = 4; // expanded by two extra inputs
        assert_eq!(node.num_inputs(), 4);
        assert_eq!(node.num_outputs(), 1);
        assert_eq!(node.declared_socket(3).name, "value");
        assert_eq!(node.declared_socket(4).name, "then");
    }
}
