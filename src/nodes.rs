// Core node definitions.
//
// The process-wide table of graph nodes built into the language. Names
// are resolved against it after a sheet's own variables, functions and
// includes. The definitions are immutable and shared; variadic nodes
// expand per instance, never here.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::Def;
use crate::sheet::{NodeDefinition, SocketMeta};
use crate::types::{self, LitValue, TypeSet};


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoreNode {
    Start,
    Print,
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    And,
    Or,
    Xor,
    Not,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    MoreThan,
    MoreThanOrEqual,
    Concat,
    IfThenElse,
    Set,
}

impl CoreNode {
    pub fn from_name(name: &str) -> Option<CoreNode> {
        DEFINITIONS.get(name).map(|entry| entry.0)
    }

    pub fn definition(self) -> Def {
        DEFINITIONS
            .values()
            .find(|entry| entry.0 == self)
            .map(|entry| entry.1.clone())
            .unwrap_or_else(|| panic!("core node without a definition"))
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            CoreNode::Add
                | CoreNode::Subtract
                | CoreNode::Multiply
                | CoreNode::Divide
                | CoreNode::Mod
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(
            self,
            CoreNode::And | CoreNode::Or | CoreNode::Xor | CoreNode::Not
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            CoreNode::Equal
                | CoreNode::NotEqual
                | CoreNode::LessThan
                | CoreNode::LessThanOrEqual
                | CoreNode::MoreThan
                | CoreNode::MoreThanOrEqual
        )
    }
}


fn sock(name: &str, typ: TypeSet, default: LitValue) -> SocketMeta {
    SocketMeta::new(name, typ, default)
}

fn exec(name: &str) -> SocketMeta {
    sock(name, types::execution(), LitValue::Int(0))
}

fn num(name: &str) -> SocketMeta {
    sock(name, types::number(), LitValue::Int(0))
}

fn int_bool(name: &str) -> SocketMeta {
    sock(name, types::int_bool(), LitValue::Bool(false))
}

fn integer(name: &str) -> SocketMeta {
    sock(name, types::single(types::DType::Int), LitValue::Int(0))
}

fn boolean(name: &str) -> SocketMeta {
    sock(name, types::single(types::DType::Bool), LitValue::Bool(false))
}

fn string(name: &str) -> SocketMeta {
    sock(
        name,
        types::single(types::DType::Str),
        LitValue::Str(String::new()),
    )
}

fn any(name: &str) -> SocketMeta {
    sock(name, types::var_any(), LitValue::Str(String::new()))
}

fn name_sock(name: &str) -> SocketMeta {
    sock(
        name,
        types::single(types::DType::Name),
        LitValue::Str(String::new()),
    )
}

fn def(
    name: &str,
    description: &str,
    sockets: Vec<SocketMeta>,
    start_output_index: usize,
    infinite_inputs: bool,
) -> Def {
    Arc::new(NodeDefinition {
        name: String::from(name),
        description: String::from(description),
        sockets,
        start_output_index,
        infinite_inputs,
    })
}

fn binary(name: &str, description: &str, socket: fn(&str) -> SocketMeta, variadic: bool) -> Def {
    def(
        name,
        description,
        vec![socket("a"), socket("b"), socket("result")],
        2,
        variadic,
    )
}

fn comparison(name: &str, description: &str, socket: fn(&str) -> SocketMeta) -> Def {
    def(
        name,
        description,
        vec![socket("a"), socket("b"), boolean("result")],
        2,
        false,
    )
}


lazy_static! {
    static ref DEFINITIONS: HashMap<&'static str, (CoreNode, Def)> = {
        use CoreNode::*;
        let mut table = HashMap::new();
        let mut add = |name: &'static str, core: CoreNode, d: Def| {
            table.insert(name, (core, d));
        };

        add("Start", Start, def(
            "Start", "The entry point of the sheet.",
            vec![exec("begin")], 0, false));
        add("Print", Print, def(
            "Print", "Print the inputs, then a newline.",
            vec![exec("before"), any("value"), exec("after")], 2, true));
        add("Add", Add, binary("Add", "The sum of the inputs.", num, true));
        add("Subtract", Subtract,
            binary("Subtract", "The first input minus the second.", num, false));
        add("Multiply", Multiply,
            binary("Multiply", "The product of the inputs.", num, true));
        add("Divide", Divide,
            binary("Divide", "The first input divided by the second.", num, false));
        // No float remainder in the instruction set, so Mod is
        // integer-only.
        add("Mod", Mod,
            binary("Mod", "The remainder of dividing the inputs.", integer, false));
        add("And", And, binary("And", "Logical or bitwise and.", int_bool, true));
        add("Or", Or, binary("Or", "Logical or bitwise or.", int_bool, true));
        add("Xor", Xor, binary("Xor", "Logical or bitwise xor.", int_bool, true));
        add("Not", Not, def(
            "Not", "Logical or bitwise complement.",
            vec![int_bool("in"), int_bool("out")], 1, false));
        add("Equal", Equal, def(
            "Equal", "Are the inputs equal?",
            vec![any("a"), any("b"), boolean("result")], 2, false));
        add("NotEqual", NotEqual, def(
            "NotEqual", "Are the inputs unequal?",
            vec![any("a"), any("b"), boolean("result")], 2, false));
        add("LessThan", LessThan,
            comparison("LessThan", "Is the first input smaller?", num));
        add("LessThanOrEqual", LessThanOrEqual,
            comparison("LessThanOrEqual", "Is the first input no bigger?", num));
        add("MoreThan", MoreThan,
            comparison("MoreThan", "Is the first input bigger?", num));
        add("MoreThanOrEqual", MoreThanOrEqual,
            comparison("MoreThanOrEqual", "Is the first input no smaller?", num));
        add("Concat", Concat, def(
            "Concat", "Join two strings.",
            vec![string("a"), string("b"), string("result")], 2, false));
        add("IfThenElse", IfThenElse, def(
            "IfThenElse", "Branch on a condition.",
            vec![exec("before"), boolean("condition"), exec("then"), exec("else")],
            2, false));
        add("Set", Set, def(
            "Set", "Store a value into a variable.",
            vec![exec("before"), name_sock("variable"), any("value"), exec("after")],
            3, false));

        table
    };
}


// Synthesize the call/Define/Return definitions for a sheet function.
// Subroutines get an implicit Execution socket on each side of the
// call interface; pure functions get none.
pub fn function_defs(
    name: &str,
    inputs: &[SocketMeta],
    outputs: &[SocketMeta],
    is_subroutine: bool,
) -> (Def, Def, Def) {
    let mut call_sockets = Vec::new();
    if is_subroutine {
        call_sockets.push(exec("before"));
    }
    call_sockets.extend_from_slice(inputs);
    let start_output = call_sockets.len();
    if is_subroutine {
        call_sockets.push(exec("after"));
    }
    call_sockets.extend_from_slice(outputs);
    let call = Arc::new(NodeDefinition {
        name: String::from(name),
        description: String::new(),
        sockets: call_sockets,
        start_output_index: start_output,
        infinite_inputs: false,
    });

    let mut define_sockets = vec![name_sock("function")];
    if is_subroutine {
        define_sockets.push(exec("begin"));
    }
    define_sockets.extend_from_slice(inputs);
    let define = Arc::new(NodeDefinition {
        name: String::from("Define"),
        description: String::new(),
        sockets: define_sockets,
        start_output_index: 1,
        infinite_inputs: false,
    });

    let mut return_sockets = vec![name_sock("function")];
    if is_subroutine {
        return_sockets.push(exec("before"));
    }
    return_sockets.extend_from_slice(outputs);
    let num_return_inputs = return_sockets.len();
    let ret = Arc::new(NodeDefinition {
        name: String::from("Return"),
        description: String::new(),
        sockets: return_sockets,
        start_output_index: num_return_inputs,
        infinite_inputs: false,
    });

    (call, define, ret)
}

// The getter definition for a variable: a pure node named after the
// variable with a single typed output.
pub fn getter_def(name: &str, meta: &SocketMeta) -> Def {
    Arc::new(NodeDefinition {
        name: String::from(name),
        description: String::new(),
        sockets: vec![SocketMeta::new("value", meta.typ, meta.default.clone())],
        start_output_index: 0,
        infinite_inputs: false,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    #[test]
    fn test_lookup() {
        assert_eq!(CoreNode::from_name("Print"), Some(CoreNode::Print));
        assert_eq!(CoreNode::from_name("Frobnicate"), None);
    }

    #[test]
    fn test_start_shape() {
        let d = CoreNode::Start.definition();
        assert_eq!(d.num_inputs(), 0);
        assert_eq!(d.num_outputs(), 1);
        assert!(d.is_execution());
    }

    #[test]
    fn test_print_is_variadic() {
        let d = CoreNode::Print.definition();
        assert!(d.infinite_inputs);
        assert_eq!(d.num_inputs(), 2);
    }

    #[test]
    fn test_function_defs_pure() {
        let inputs = [SocketMeta::new(
            "n",
            types::single(DType::Int),
            LitValue::Int(0),
        )];
        let outputs = [SocketMeta::new(
            "out",
            types::single(DType::Int),
            LitValue::Int(0),
        )];
        let (call, define, ret) = function_defs("Double", &inputs, &outputs, false);
        assert_eq!(call.num_inputs(), 1);
        assert_eq!(call.num_outputs(), 1);
        assert!(!call.is_execution());
        // Define: Name in, function inputs out.
        assert_eq!(define.num_inputs(), 1);
        assert_eq!(define.num_outputs(), 1);
        // Return: Name plus function outputs in, nothing out.
        assert_eq!(ret.num_inputs(), 2);
        assert_eq!(ret.num_outputs(), 0);
    }

    #[test]
    fn test_function_defs_subroutine() {
        let (call, define, ret) = function_defs("Go", &[], &[], true);
        assert_eq!(call.num_inputs(), 1);
        assert_eq!(call.num_outputs(), 1);
        assert!(call.is_execution());
        assert_eq!(define.num_outputs(), 1); // the begin Execution socket
        assert_eq!(ret.num_inputs(), 2); // Name plus Execution
    }
}
