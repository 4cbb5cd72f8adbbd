// Semantic analysis.
//
// Three phases over the parsed syntax tree, run in order by the
// driver:
//
//   1. Property scan: variables, functions, subroutines and includes.
//      Include loading itself lives in the driver (it owns the sheet
//      store and the priors chain); this phase hands back the requests.
//   2. Node scan: instantiate nodes, resolve their names, emit wires.
//   3. Type reduction, then loop detection.
//
// Phases report into the diagnostic sink and keep going where
// possible.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{Arg, Def, NodeStmt, SyntaxTree};
use crate::cfunc;
use crate::error::{Diagnostics, ErrorKind};
use crate::nodes::{self, CoreNode};
use crate::sheet::{
    AddWireError, NameResolution, Node, NodeSocket, Sheet, SheetFunction, SheetId,
    SheetStore, SheetVariable, SocketMeta, Wire,
};
use crate::types::{self, DType, LitValue, TypeSet};


pub struct IncludeRequest {
    pub path: String,
    pub line: usize,
}


struct FunctionDecl {
    inputs: Vec<SocketMeta>,
    outputs: Vec<SocketMeta>,
    is_subroutine: bool,
}


fn arg_name(arg: Option<&Arg>) -> Option<&str> {
    match arg {
        Some(Arg::Name(name)) => Some(name),
        _ => None,
    }
}

fn arg_type(arg: Option<&Arg>) -> Option<TypeSet> {
    match arg {
        Some(Arg::Type(t)) => Some(*t),
        _ => None,
    }
}


// ---- phase 1: properties ------------------------------------------------

pub fn scan_properties(
    sheet: &mut Sheet,
    id: SheetId,
    tree: &SyntaxTree,
    diags: &mut Diagnostics,
) -> Vec<IncludeRequest> {
    let path = sheet.file_path.clone();
    let mut includes = Vec::new();
    let mut order: Vec<String> = Vec::new();
    let mut decls: HashMap<String, FunctionDecl> = HashMap::new();

    for prop in &tree.properties {
        let line = prop.line;
        match prop.name.as_str() {
            "Variable" => {
                let name = match arg_name(prop.args.get(0)) {
                    Some(name) => String::from(name),
                    None => {
                        diags.add(ErrorKind::Syntax, &path, line, "Variable needs a name");
                        continue;
                    }
                };
                let typ = match arg_type(prop.args.get(1)) {
                    Some(t) if !t.contains(DType::Execution) => t,
                    _ => {
                        diags.add(
                            ErrorKind::Syntax,
                            &path,
                            line,
                            "Variable needs a value type",
                        );
                        continue;
                    }
                };
                if sheet.variable_by_name(&name).is_some() {
                    diags.add(
                        ErrorKind::RedefinedName,
                        &path,
                        line,
                        &format!("variable '{}' is already defined", name),
                    );
                    continue;
                }
                let atom = match types::concrete(typ) {
                    Some(atom) => atom,
                    None => {
                        diags.add(
                            ErrorKind::Syntax,
                            &path,
                            line,
                            "variables need a concrete type",
                        );
                        continue;
                    }
                };
                let default = match prop.args.get(2) {
                    Some(Arg::Literal(value)) => {
                        if (value.seed() & typ).is_empty() {
                            diags.add(
                                ErrorKind::TypeMismatch,
                                &path,
                                line,
                                &format!(
                                    "default value does not fit a {} variable",
                                    types::describe(typ)
                                ),
                            );
                            continue;
                        }
                        coerce_literal(value, atom)
                    }
                    _ => LitValue::zero_of(atom),
                };
                let mut meta = SocketMeta::new(&name, typ, default);
                if let Some(Arg::Literal(LitValue::Str(desc))) = prop.args.get(3) {
                    meta.description = desc.clone();
                }
                let getter = nodes::getter_def(&name, &meta);
                sheet.add_variable(SheetVariable {
                    meta,
                    getter,
                    sheet: id,
                });
            }
            "Function" | "Subroutine" => {
                let name = match arg_name(prop.args.get(0)) {
                    Some(name) => String::from(name),
                    None => {
                        diags.add(
                            ErrorKind::Syntax,
                            &path,
                            line,
                            &format!("{} needs a name", prop.name),
                        );
                        continue;
                    }
                };
                if decls.contains_key(&name) {
                    diags.add(
                        ErrorKind::RedefinedName,
                        &path,
                        line,
                        &format!("function '{}' is already defined", name),
                    );
                    continue;
                }
                order.push(name.clone());
                decls.insert(
                    name,
                    FunctionDecl {
                        inputs: Vec::new(),
                        outputs: Vec::new(),
                        is_subroutine: prop.name == "Subroutine",
                    },
                );
            }
            "FunctionInput" | "FunctionOutput" => {
                let func = match arg_name(prop.args.get(0)) {
                    Some(name) => String::from(name),
                    None => {
                        diags.add(
                            ErrorKind::Syntax,
                            &path,
                            line,
                            &format!("{} needs a function name", prop.name),
                        );
                        continue;
                    }
                };
                let socket = match arg_name(prop.args.get(1)) {
                    Some(name) => String::from(name),
                    None => {
                        diags.add(
                            ErrorKind::Syntax,
                            &path,
                            line,
                            &format!("{} needs a socket name", prop.name),
                        );
                        continue;
                    }
                };
                let typ = match arg_type(prop.args.get(2)) {
                    Some(t) if !t.contains(DType::Execution) => t,
                    _ => {
                        diags.add(
                            ErrorKind::Syntax,
                            &path,
                            line,
                            &format!("{} needs a value type", prop.name),
                        );
                        continue;
                    }
                };
                let atom = match types::concrete(typ) {
                    Some(atom) => atom,
                    None => {
                        diags.add(
                            ErrorKind::Syntax,
                            &path,
                            line,
                            "function sockets need a concrete type",
                        );
                        continue;
                    }
                };
                let default = match prop.args.get(3) {
                    Some(Arg::Literal(value)) => coerce_literal(value, atom),
                    _ => LitValue::zero_of(atom),
                };
                match decls.get_mut(&func) {
                    None => {
                        diags.add(
                            ErrorKind::NameNotFound,
                            &path,
                            line,
                            &format!("function '{}' is not declared", func),
                        );
                    }
                    Some(decl) => {
                        let meta = SocketMeta::new(&socket, typ, default);
                        if prop.name == "FunctionInput" {
                            decl.inputs.push(meta);
                        } else {
                            decl.outputs.push(meta);
                        }
                    }
                }
            }
            "Include" => match prop.args.get(0) {
                Some(Arg::Literal(LitValue::Str(include))) => {
                    includes.push(IncludeRequest {
                        path: include.clone(),
                        line,
                    });
                }
                _ => {
                    diags.add(
                        ErrorKind::Syntax,
                        &path,
                        line,
                        "Include needs a string path",
                    );
                }
            },
            other => {
                diags.add(
                    ErrorKind::NameNotFound,
                    &path,
                    line,
                    &format!("unknown property '{}'", other),
                );
            }
        }
    }

    for name in order {
        if let Some(decl) = decls.remove(&name) {
            let (def, define_def, return_def) =
                nodes::function_defs(&name, &decl.inputs, &decl.outputs, decl.is_subroutine);
            sheet.add_function(SheetFunction {
                def,
                define_def,
                return_def,
                is_subroutine: decl.is_subroutine,
                sheet: id,
                define_node: None,
                num_defines: 0,
                last_return_node: None,
                num_returns: 0,
            });
        }
    }

    includes
}

fn coerce_literal(value: &LitValue, atom: DType) -> LitValue {
    match (value, atom) {
        (LitValue::Int(v), DType::Float) => LitValue::Float(*v as f64),
        _ => value.clone(),
    }
}


// ---- phase 2: nodes -----------------------------------------------------

enum Found {
    Variable(usize),
    Function(usize),
}

// Depth-first search through the include graph for an exported name.
fn find_in_includes(store: &SheetStore, sheet: &Sheet, name: &str) -> Option<(SheetId, Found)> {
    for &include in &sheet.includes {
        let included = store.get(include);
        if let Some(var) = included.variable_by_name(name) {
            return Some((include, Found::Variable(var)));
        }
        if let Some(func) = included.function_by_name(name) {
            return Some((include, Found::Function(func)));
        }
        if let Some(found) = find_in_includes(store, included, name) {
            return Some(found);
        }
    }
    None
}

fn resolve_variable(
    sheet: &Sheet,
    id: SheetId,
    store: &SheetStore,
    name: &str,
) -> Option<(SheetId, usize)> {
    if let Some(var) = sheet.variable_by_name(name) {
        return Some((id, var));
    }
    match find_in_includes(store, sheet, name) {
        Some((sid, Found::Variable(var))) => Some((sid, var)),
        _ => None,
    }
}

// Resolve a node statement's name: the sheet's variables, then its
// functions, then included sheets' exports, then the builtin and
// C-function registries.
fn resolve(
    sheet: &Sheet,
    id: SheetId,
    store: &SheetStore,
    stmt: &NodeStmt,
    diags: &mut Diagnostics,
) -> Option<(Def, NameResolution)> {
    let path = &sheet.file_path;
    match stmt.name.as_str() {
        "Define" | "Return" => {
            let func_name = match arg_name(stmt.args.get(0)) {
                Some(name) => name,
                None => {
                    diags.add(
                        ErrorKind::Syntax,
                        path,
                        stmt.line,
                        &format!("{} needs a function name", stmt.name),
                    );
                    return None;
                }
            };
            let func = match sheet.function_by_name(func_name) {
                Some(func) => func,
                None => {
                    diags.add(
                        ErrorKind::NameNotFound,
                        path,
                        stmt.line,
                        &format!("function '{}' is not defined in this sheet", func_name),
                    );
                    return None;
                }
            };
            if stmt.name == "Define" {
                Some((
                    sheet.functions[func].define_def.clone(),
                    NameResolution::FunctionDefine { func },
                ))
            } else {
                Some((
                    sheet.functions[func].return_def.clone(),
                    NameResolution::FunctionReturn { func },
                ))
            }
        }
        "Set" => {
            let var_name = match arg_name(stmt.args.get(1)) {
                Some(name) => name,
                None => {
                    diags.add(
                        ErrorKind::Syntax,
                        path,
                        stmt.line,
                        "Set needs a variable name",
                    );
                    return None;
                }
            };
            let (sid, var) = match resolve_variable(sheet, id, store, var_name) {
                Some(found) => found,
                None => {
                    diags.add(
                        ErrorKind::NameNotFound,
                        path,
                        stmt.line,
                        &format!("variable '{}' is not defined", var_name),
                    );
                    return None;
                }
            };
            let var_meta = if sid == id {
                sheet.variables[var].meta.clone()
            } else {
                store.get(sid).variables[var].meta.clone()
            };
            // Specialize the value socket to the variable's type.
            let mut def = (*CoreNode::Set.definition()).clone();
            def.sockets[2].typ = var_meta.typ;
            def.sockets[2].default = var_meta.default;
            Some((
                Arc::new(def),
                NameResolution::VariableSet { sheet: sid, var },
            ))
        }
        name => {
            if let Some(var) = sheet.variable_by_name(name) {
                return Some((
                    sheet.variables[var].getter.clone(),
                    NameResolution::VariableGet { sheet: id, var },
                ));
            }
            if let Some(func) = sheet.function_by_name(name) {
                return Some((
                    sheet.functions[func].def.clone(),
                    NameResolution::FunctionCall { sheet: id, func },
                ));
            }
            match find_in_includes(store, sheet, name) {
                Some((sid, Found::Variable(var))) => {
                    return Some((
                        store.get(sid).variables[var].getter.clone(),
                        NameResolution::VariableGet { sheet: sid, var },
                    ));
                }
                Some((sid, Found::Function(func))) => {
                    return Some((
                        store.get(sid).functions[func].def.clone(),
                        NameResolution::FunctionCall { sheet: sid, func },
                    ));
                }
                None => {}
            }
            if let Some(core) = CoreNode::from_name(name) {
                return Some((core.definition(), NameResolution::Core(core)));
            }
            if let Some((index, def)) = cfunc::lookup(name) {
                return Some((def, NameResolution::CFunctionCall { index }));
            }
            diags.add(
                ErrorKind::NameNotFound,
                path,
                stmt.line,
                &format!("name '{}' is not defined", name),
            );
            None
        }
    }
}

pub fn scan_nodes(
    sheet: &mut Sheet,
    id: SheetId,
    store: &SheetStore,
    tree: &SyntaxTree,
    diags: &mut Diagnostics,
) {
    let path = sheet.file_path.clone();
    let mut wire_names: HashMap<String, NodeSocket> = HashMap::new();
    let mut node_of_stmt: Vec<Option<usize>> = Vec::new();

    // First pass: instantiate nodes and record declared outputs.
    for stmt in &tree.nodes {
        let resolved = resolve(sheet, id, store, stmt, diags);
        let (def, resolution) = match resolved {
            Some(found) => found,
            None => {
                node_of_stmt.push(None);
                continue;
            }
        };

        let num_inputs = if def.infinite_inputs {
            if stmt.args.len() < def.num_inputs() {
                diags.add(
                    ErrorKind::Syntax,
                    &path,
                    stmt.line,
                    &format!(
                        "'{}' takes at least {} arguments",
                        stmt.name,
                        def.num_inputs()
                    ),
                );
                node_of_stmt.push(None);
                continue;
            }
            stmt.args.len()
        } else {
            if stmt.args.len() != def.num_inputs() {
                diags.add(
                    ErrorKind::Syntax,
                    &path,
                    stmt.line,
                    &format!(
                        "'{}' takes {} arguments, got {}",
                        stmt.name,
                        def.num_inputs(),
                        stmt.args.len()
                    ),
                );
                node_of_stmt.push(None);
                continue;
            }
            def.num_inputs()
        };
        if stmt.outputs.len() > def.num_outputs() {
            diags.add(
                ErrorKind::Syntax,
                &path,
                stmt.line,
                &format!(
                    "'{}' has only {} outputs",
                    stmt.name,
                    def.num_outputs()
                ),
            );
            node_of_stmt.push(None);
            continue;
        }

        let literals = stmt.args[..num_inputs]
            .iter()
            .map(|arg| match arg {
                Arg::Literal(value) => Some(value.clone()),
                Arg::Name(name) => Some(LitValue::Str(name.clone())),
                _ => None,
            })
            .collect();

        let node = Node {
            def,
            line: stmt.line,
            reduced: None,
            literals: Some(literals),
            start_output_index: num_inputs,
            resolution: resolution.clone(),
        };

        // Name arguments only fit Name sockets, and vice versa.
        let mut bad_args = false;
        for (socket, arg) in stmt.args.iter().enumerate() {
            let declared = node.declared_socket(socket).typ;
            let is_name_socket = declared.contains(DType::Name);
            match arg {
                Arg::Name(name) if !is_name_socket => {
                    diags.add(
                        ErrorKind::NameNotFound,
                        &path,
                        stmt.line,
                        &format!("'{}' is not a value here", name),
                    );
                    bad_args = true;
                }
                Arg::Wire(_) | Arg::Literal(_) if is_name_socket => {
                    diags.add(
                        ErrorKind::Syntax,
                        &path,
                        stmt.line,
                        "expected a name argument",
                    );
                    bad_args = true;
                }
                Arg::Type(_) => {
                    diags.add(
                        ErrorKind::Syntax,
                        &path,
                        stmt.line,
                        "type keywords are only valid in properties",
                    );
                    bad_args = true;
                }
                _ => {}
            }
        }
        if bad_args {
            node_of_stmt.push(None);
            continue;
        }

        let index = sheet.add_node(node);
        node_of_stmt.push(Some(index));

        // Bookkeeping for entry-point invariants.
        match resolution {
            NameResolution::Core(CoreNode::Start) => {
                sheet.num_starts += 1;
                if sheet.num_starts > 1 {
                    diags.add(
                        ErrorKind::RedefinedName,
                        &path,
                        stmt.line,
                        "a sheet can only have one Start node",
                    );
                } else {
                    sheet.start_node = Some(index);
                }
            }
            NameResolution::FunctionDefine { func } => {
                let function = &mut sheet.functions[func];
                function.num_defines += 1;
                if function.num_defines > 1 {
                    diags.add(
                        ErrorKind::RedefinedName,
                        &path,
                        stmt.line,
                        &format!("function '{}' has more than one Define", function.def.name),
                    );
                } else {
                    function.define_node = Some(index);
                }
            }
            NameResolution::FunctionReturn { func } => {
                let function = &mut sheet.functions[func];
                function.num_returns += 1;
                function.last_return_node = Some(index);
            }
            _ => {}
        }

        for (k, output) in stmt.outputs.iter().enumerate() {
            let socket = NodeSocket::new(index, sheet.nodes[index].start_output_index + k);
            if wire_names.contains_key(output) {
                diags.add(
                    ErrorKind::RedefinedName,
                    &path,
                    stmt.line,
                    &format!("wire '#{}' is already declared", output),
                );
            } else {
                wire_names.insert(output.clone(), socket);
            }
        }
    }

    // Second pass: emit wires.
    for (stmt, node) in tree.nodes.iter().zip(&node_of_stmt) {
        let to_node = match node {
            Some(index) => *index,
            None => continue,
        };
        let num_inputs = sheet.nodes[to_node].start_output_index;
        for (socket, arg) in stmt.args.iter().take(num_inputs).enumerate() {
            let wire = match arg {
                Arg::Wire(name) => name,
                _ => continue,
            };
            let from = match wire_names.get(wire) {
                Some(&socket) => socket,
                None => {
                    diags.add(
                        ErrorKind::NameNotFound,
                        &path,
                        stmt.line,
                        &format!("wire '#{}' is not declared", wire),
                    );
                    continue;
                }
            };
            // Execution flow must be linear: one wire per execution
            // output.
            if sheet.socket_type(from).contains(DType::Execution)
                && sheet.num_connections(from) > 0
            {
                diags.add(
                    ErrorKind::RedefinedName,
                    &path,
                    stmt.line,
                    &format!("execution wire '#{}' is already connected", wire),
                );
                continue;
            }
            let result = sheet.add_wire(Wire {
                from,
                to: NodeSocket::new(to_node, socket),
            });
            match result {
                Ok(()) => {}
                Err(AddWireError::TypeIncompatible) => {
                    let from_t = sheet.socket_type(from);
                    let to_t = sheet.socket_type(NodeSocket::new(to_node, socket));
                    diags.add(
                        ErrorKind::TypeMismatch,
                        &path,
                        stmt.line,
                        &format!(
                            "cannot wire {} into {}",
                            types::describe(from_t),
                            types::describe(to_t)
                        ),
                    );
                }
                Err(AddWireError::Duplicate) => {
                    diags.add(
                        ErrorKind::RedefinedName,
                        &path,
                        stmt.line,
                        &format!("wire '#{}' is connected here twice", wire),
                    );
                }
                Err(_) => {
                    diags.add(
                        ErrorKind::Syntax,
                        &path,
                        stmt.line,
                        &format!("wire '#{}' cannot connect these sockets", wire),
                    );
                }
            }
        }
    }

    // Per-function invariants.
    for func in &sheet.functions {
        if func.num_defines == 0 {
            diags.add(
                ErrorKind::Syntax,
                &path,
                1,
                &format!("function '{}' has no Define node", func.def.name),
            );
        }
        if func.num_returns == 0 {
            diags.add(
                ErrorKind::Syntax,
                &path,
                1,
                &format!("function '{}' has no Return node", func.def.name),
            );
        }
        if !func.is_subroutine && func.num_returns > 1 {
            diags.add(
                ErrorKind::RedefinedName,
                &path,
                1,
                &format!(
                    "pure function '{}' can only have one Return node",
                    func.def.name
                ),
            );
        }
    }
}


// ---- phase 3: type reduction -------------------------------------------

// The sockets of a node that must reduce together.
fn reduction_groups(node: &Node) -> Vec<Vec<usize>> {
    if let NameResolution::Core(core) = &node.resolution {
        if core.is_arithmetic() || core.is_logical() {
            return vec![(0..node.num_sockets()).collect()];
        }
        if core.is_comparison() {
            return vec![vec![0, 1]];
        }
    }
    Vec::new()
}

pub fn reduce_types(sheet: &mut Sheet, diags: &mut Diagnostics) {
    let path = sheet.file_path.clone();

    // Start from declared types.
    for node in &mut sheet.nodes {
        let reduced: Vec<TypeSet> = (0..node.num_sockets())
            .map(|socket| node.declared_socket(socket).typ)
            .collect();
        node.reduced = Some(reduced);
    }

    // Seed literal arguments. An integer literal seeds Number, which
    // is what lets one Float input drag a whole arithmetic node to the
    // float path.
    for index in 0..sheet.nodes.len() {
        let node = &sheet.nodes[index];
        let line = node.line;
        let literals = match &node.literals {
            Some(literals) => literals.clone(),
            None => continue,
        };
        for (socket, literal) in literals.iter().enumerate() {
            let value = match literal {
                Some(value) => value,
                None => continue,
            };
            let declared = sheet.nodes[index].declared_socket(socket).typ;
            if declared.contains(DType::Name) {
                continue;
            }
            let current = sheet.nodes[index].reduced.as_ref().map(|r| r[socket]);
            let current = current.unwrap_or(declared);
            let seeded = current & value.seed();
            if seeded.is_empty() {
                diags.add(
                    ErrorKind::TypeMismatch,
                    &path,
                    line,
                    &format!(
                        "literal does not fit a {} socket",
                        types::describe(current)
                    ),
                );
                return;
            }
            if let Some(reduced) = &mut sheet.nodes[index].reduced {
                reduced[socket] = seeded;
            }
        }
    }

    let wires = sheet.wires.clone();
    let groups: Vec<(usize, Vec<Vec<usize>>)> = sheet
        .nodes
        .iter()
        .enumerate()
        .map(|(index, node)| (index, reduction_groups(node)))
        .collect();

    // Iterate to a fixed point: wires intersect their endpoints,
    // grouped sockets intersect each other.
    loop {
        let mut changed = false;

        for wire in &wires {
            let from_t = sheet.socket_type(wire.from);
            let to_t = sheet.socket_type(wire.to);
            let narrowed = from_t & to_t;
            if narrowed.is_empty() {
                diags.add(
                    ErrorKind::TypeMismatch,
                    &path,
                    sheet.nodes[wire.to.node].line,
                    &format!(
                        "cannot reconcile {} with {}",
                        types::describe(from_t),
                        types::describe(to_t)
                    ),
                );
                return;
            }
            if narrowed != from_t {
                set_reduced(sheet, wire.from, narrowed);
                changed = true;
            }
            if narrowed != to_t {
                set_reduced(sheet, wire.to, narrowed);
                changed = true;
            }
        }

        for (index, node_groups) in &groups {
            for group in node_groups {
                let mut narrowed = types::var_any() | DType::Execution | DType::Name;
                for &socket in group {
                    narrowed &= sheet.socket_type(NodeSocket::new(*index, socket));
                }
                if narrowed.is_empty() {
                    diags.add(
                        ErrorKind::TypeMismatch,
                        &path,
                        sheet.nodes[*index].line,
                        "the node's sockets cannot agree on a type",
                    );
                    return;
                }
                for &socket in group {
                    let at = NodeSocket::new(*index, socket);
                    if sheet.socket_type(at) != narrowed {
                        set_reduced(sheet, at, narrowed);
                        changed = true;
                    }
                }
            }
        }

        if changed {
            continue;
        }

        // Convergence: arithmetic sockets still reading Number default
        // to Integer.
        let mut defaulted = false;
        for (index, node_groups) in &groups {
            for group in node_groups {
                for &socket in group {
                    let at = NodeSocket::new(*index, socket);
                    if sheet.socket_type(at) == types::number() {
                        set_reduced(sheet, at, types::single(DType::Int));
                        defaulted = true;
                    }
                }
            }
        }
        if !defaulted {
            break;
        }
    }

    // Whatever is still vague cannot be compiled.
    for (index, node) in sheet.nodes.iter().enumerate() {
        for socket in 0..node.num_sockets() {
            let t = sheet.socket_type(NodeSocket::new(index, socket));
            if types::is_vague(t) {
                diags.add(
                    ErrorKind::AmbiguousType,
                    &path,
                    node.line,
                    &format!(
                        "socket '{}' is still {} after reduction",
                        node.declared_socket(socket).name,
                        types::describe(t)
                    ),
                );
            }
        }
    }
}

fn set_reduced(sheet: &mut Sheet, socket: NodeSocket, t: TypeSet) {
    if let Some(reduced) = &mut sheet.nodes[socket.node].reduced {
        reduced[socket.socket] = t;
    }
}


// ---- phase 4: loop detection -------------------------------------------

fn entries(sheet: &Sheet) -> Vec<usize> {
    let mut out = Vec::new();
    if let Some(start) = sheet.start_node {
        out.push(start);
    }
    for func in &sheet.functions {
        if let Some(define) = func.define_node {
            out.push(define);
        }
    }
    out
}

// Colored depth-first search; returns the node where a back edge was
// found.
fn find_cycle(adjacency: &[Vec<usize>], roots: &[usize]) -> Option<usize> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;
    let mut color = vec![WHITE; adjacency.len()];

    for &root in roots {
        if color[root] != WHITE {
            continue;
        }
        // (node, next child index)
        let mut stack = vec![(root, 0usize)];
        color[root] = GRAY;
        loop {
            let step = match stack.last_mut() {
                None => break,
                Some(top) => {
                    let node = top.0;
                    if top.1 < adjacency[node].len() {
                        let next = adjacency[node][top.1];
                        top.1 += 1;
                        Some(next)
                    } else {
                        None
                    }
                }
            };
            match step {
                Some(next) => match color[next] {
                    GRAY => return Some(next),
                    WHITE => {
                        color[next] = GRAY;
                        stack.push((next, 0));
                    }
                    _ => {}
                },
                None => {
                    if let Some((node, _)) = stack.pop() {
                        color[node] = BLACK;
                    }
                }
            }
        }
    }
    None
}

pub fn detect_loops(sheet: &mut Sheet, diags: &mut Diagnostics) {
    let path = sheet.file_path.clone();
    let count = sheet.nodes.len();
    let mut exec_adj = vec![Vec::new(); count];
    let mut value_adj = vec![Vec::new(); count];
    for wire in &sheet.wires {
        if sheet.socket_type(wire.from).contains(DType::Execution) {
            exec_adj[wire.from.node].push(wire.to.node);
        } else {
            value_adj[wire.from.node].push(wire.to.node);
        }
    }

    // Rooting at every node also flags loops that no entry reaches.
    let all: Vec<usize> = (0..count).collect();
    if let Some(node) = find_cycle(&exec_adj, &all) {
        diags.add(
            ErrorKind::CycleDetected,
            &path,
            sheet.nodes[node].line,
            "execution wires form a loop",
        );
    }
    if let Some(node) = find_cycle(&value_adj, &all) {
        diags.add(
            ErrorKind::CycleDetected,
            &path,
            sheet.nodes[node].line,
            "value wires form a loop",
        );
    }

    // Reachability: executed nodes, plus value producers feeding them,
    // transitively. A pure function's Return is its live sink. The
    // rest are dead weight.
    let mut live = vec![false; count];
    let mut queue = entries(sheet);
    for func in &sheet.functions {
        if !func.is_subroutine {
            if let Some(ret) = func.last_return_node {
                queue.push(ret);
            }
        }
    }
    for &root in &queue {
        live[root] = true;
    }
    while let Some(node) = queue.pop() {
        for &next in &exec_adj[node] {
            if !live[next] {
                live[next] = true;
                queue.push(next);
            }
        }
    }
    loop {
        let mut changed = false;
        for wire in &sheet.wires {
            if live[wire.to.node] && !live[wire.from.node] {
                live[wire.from.node] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    for (index, node) in sheet.nodes.iter().enumerate() {
        if !live[index] {
            diags.add(
                ErrorKind::RedundantNode,
                &path,
                node.line,
                &format!("'{}' is never used", node.def.name),
            );
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer;
    use crate::parser;
    use std::path::PathBuf;

    fn scan_source(source: &str) -> (SheetStore, SheetId, Diagnostics) {
        let mut diags = Diagnostics::new();
        let path = PathBuf::from("test.dc");
        let lexemes = lexer::lex(source, &path, &mut diags);
        let tree = parser::parse(&lexemes, &path, &mut diags);
        let mut store = SheetStore::new();
        let id = store.alloc(Sheet::new(path));
        let mut sheet = store.take(id);
        let includes = scan_properties(&mut sheet, id, &tree, &mut diags);
        assert!(includes.is_empty());
        scan_nodes(&mut sheet, id, &store, &tree, &mut diags);
        reduce_types(&mut sheet, &mut diags);
        detect_loops(&mut sheet, &mut diags);
        store.put(id, sheet);
        (store, id, diags)
    }

    fn scan_ok(source: &str) -> (SheetStore, SheetId) {
        let (store, id, diags) = scan_source(source);
        assert!(!diags.has_errors(), "unexpected errors: {:?}", diags);
        (store, id)
    }

    #[test]
    fn test_variable_property() {
        let (store, id) = scan_ok("[Variable(count, Integer, 420, \"a counter\")]\n");
        let sheet = store.get(id);
        assert_eq!(sheet.variables.len(), 1);
        let var = &sheet.variables[0];
        assert_eq!(var.meta.name, "count");
        assert_eq!(var.meta.typ, types::single(DType::Int));
        assert_eq!(var.meta.default, LitValue::Int(420));
        assert_eq!(var.getter.num_outputs(), 1);
    }

    #[test]
    fn test_redefined_variable() {
        let (_, _, diags) =
            scan_source("[Variable(x, Integer)]\n[Variable(x, Float)]\n");
        assert!(diags.contains_kind(ErrorKind::RedefinedName));
    }

    #[test]
    fn test_function_declaration() {
        let (store, id) = scan_ok(
            "[Function(Double)]\n\
             [FunctionInput(Double, n, Integer, 0)]\n\
             [FunctionOutput(Double, out, Integer)]\n\
             Define(Double)~#n\n\
             Multiply(#n, 2)~#m\n\
             Return(Double, #m)\n",
        );
        let sheet = store.get(id);
        assert_eq!(sheet.functions.len(), 1);
        let func = &sheet.functions[0];
        assert!(!func.is_subroutine);
        assert_eq!(func.def.num_inputs(), 1);
        assert_eq!(func.def.num_outputs(), 1);
        assert_eq!(func.num_defines, 1);
        assert_eq!(func.num_returns, 1);
    }

    #[test]
    fn test_missing_return_is_an_error() {
        let (_, _, diags) = scan_source(
            "[Function(Broken)]\n\
             [FunctionOutput(Broken, out, Integer)]\n\
             Define(Broken)\n",
        );
        assert!(diags.has_errors());
    }

    #[test]
    fn test_unknown_name() {
        let (_, _, diags) = scan_source("Start~#1\nFrobnicate(#1)\n");
        assert!(diags.contains_kind(ErrorKind::NameNotFound));
    }

    #[test]
    fn test_undeclared_wire() {
        let (_, _, diags) = scan_source("Print(#nope, 1)\n");
        assert!(diags.contains_kind(ErrorKind::NameNotFound));
    }

    #[test]
    fn test_two_starts_rejected() {
        let (_, _, diags) = scan_source("Start~#1\nStart~#2\n");
        assert!(diags.contains_kind(ErrorKind::RedefinedName));
    }

    #[test]
    fn test_integer_inference() {
        let (store, id) = scan_ok("Start~#1\nMultiply(7, 6)~#m\nPrint(#1, #m)\n");
        let sheet = store.get(id);
        // Node 1 is the Multiply; its output socket reduced to Integer.
        let out = NodeSocket::new(1, 2);
        assert_eq!(sheet.socket_type(out), types::single(DType::Int));
    }

    #[test]
    fn test_float_promotion() {
        let (store, id) = scan_ok("Start~#1\nMultiply(7, 6.0)~#m\nPrint(#1, #m)\n");
        let sheet = store.get(id);
        let out = NodeSocket::new(1, 2);
        assert_eq!(sheet.socket_type(out), types::single(DType::Float));
        // The integer literal's socket promoted too.
        assert_eq!(
            sheet.socket_type(NodeSocket::new(1, 0)),
            types::single(DType::Float)
        );
    }

    #[test]
    fn test_string_into_add_is_mismatch() {
        let (_, _, diags) = scan_source("Start~#1\nAdd(\"oops\", 5)~#s\nPrint(#1, #s)\n");
        assert!(diags.contains_kind(ErrorKind::TypeMismatch));
    }

    #[test]
    fn test_getter_types_flow() {
        let (store, id) = scan_ok(
            "[Variable(scale, Float, 2.0)]\n\
             Start~#1\n\
             scale()~#s\n\
             Multiply(#s, 3)~#m\n\
             Print(#1, #m)\n",
        );
        let sheet = store.get(id);
        let mul_out = NodeSocket::new(2, 2);
        assert_eq!(sheet.socket_type(mul_out), types::single(DType::Float));
    }

    #[test]
    fn test_set_specializes_to_variable_type() {
        let (store, id) = scan_ok(
            "[Variable(count, Integer, 0)]\n\
             Start~#1\n\
             Set(#1, count, 9)~#2\n",
        );
        let sheet = store.get(id);
        let set_value = NodeSocket::new(1, 2);
        assert_eq!(sheet.socket_type(set_value), types::single(DType::Int));
        assert!(matches!(
            sheet.nodes[1].resolution,
            NameResolution::VariableSet { var: 0, .. }
        ));
    }

    #[test]
    fn test_exec_cycle_detected() {
        let (_, _, diags) = scan_source("Start~#1\nIfThenElse(#2, true)~#2\n");
        assert!(diags.contains_kind(ErrorKind::CycleDetected));
    }

    #[test]
    fn test_value_cycle_detected() {
        let (_, _, diags) = scan_source("Add(#x, 1)~#x\n");
        assert!(diags.contains_kind(ErrorKind::CycleDetected));
    }

    #[test]
    fn test_redundant_node_is_a_warning() {
        let (_, _, diags) = scan_source("Start~#1\nPrint(#1, 1)\nMultiply(2, 3)~#m\n");
        assert!(!diags.has_errors());
        assert!(diags.contains_kind(ErrorKind::RedundantNode));
    }

    #[test]
    fn test_ambiguous_type_reported() {
        // Hand-built: a Print input that nothing constrains.
        let mut sheet = Sheet::new(PathBuf::from("test.dc"));
        let def = CoreNode::Print.definition();
        sheet.add_node(Node {
            def,
            line: 1,
            reduced: None,
            literals: Some(vec![None, None]),
            start_output_index: 2,
            resolution: NameResolution::Core(CoreNode::Print),
        });
        let mut diags = Diagnostics::new();
        reduce_types(&mut sheet, &mut diags);
        assert!(diags.contains_kind(ErrorKind::AmbiguousType));
    }
}
