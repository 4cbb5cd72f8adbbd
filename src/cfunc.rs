// Native functions callable from sheets.
//
// A process-wide registry, populated at startup by the embedding code,
// maps names to a native function plus the node definition describing
// its socket interface. Semantic analysis resolves node names against
// it last; the VM calls through it on CALLC/CALLCI, with the registry
// index as the call immediate.

use std::sync::Mutex;

use crate::ast::Def;
use crate::nodes;
use crate::sheet::SocketMeta;
use crate::vm::{self, Vm};


pub type NativeFn = fn(&mut Vm) -> vm::Result<()>;

#[derive(Clone)]
pub struct CFunction {
    pub function: NativeFn,
    pub definition: Def,
}


lazy_static! {
    static ref REGISTRY: Mutex<Vec<CFunction>> = Mutex::new(Vec::new());
}


fn register(
    function: NativeFn,
    name: &str,
    description: &str,
    sockets: Vec<SocketMeta>,
    num_inputs: usize,
    is_subroutine: bool,
) -> Option<usize> {
    let (inputs, outputs) = sockets.split_at(num_inputs);
    let (interface, _, _) = nodes::function_defs(name, inputs, outputs, is_subroutine);
    let mut described = (*interface).clone();
    described.description = String::from(description);
    let mut registry = REGISTRY.lock().ok()?;
    registry.push(CFunction {
        function,
        definition: std::sync::Arc::new(described),
    });
    Some(registry.len() - 1)
}

// Register a pure native function. Returns the registry index.
pub fn register_function(
    function: NativeFn,
    name: &str,
    description: &str,
    sockets: Vec<SocketMeta>,
    num_inputs: usize,
) -> Option<usize> {
    register(function, name, description, sockets, num_inputs, false)
}

// Register a native subroutine. The sockets must not include the
// execution pair; it is added automatically.
pub fn register_subroutine(
    function: NativeFn,
    name: &str,
    description: &str,
    sockets: Vec<SocketMeta>,
    num_inputs: usize,
) -> Option<usize> {
    register(function, name, description, sockets, num_inputs, true)
}

pub fn lookup(name: &str) -> Option<(usize, Def)> {
    let registry = REGISTRY.lock().ok()?;
    registry
        .iter()
        .enumerate()
        .rev()
        .find(|(_, c)| c.definition.name == name)
        .map(|(i, c)| (i, c.definition.clone()))
}

pub fn get(index: usize) -> Option<CFunction> {
    let registry = REGISTRY.lock().ok()?;
    registry.get(index).cloned()
}
