use std::sync::Arc;

use crate::sheet::NodeDefinition;
use crate::types::{LitValue, TypeSet};


// Definitions are shared between process-wide tables, sheets and node
// instances, so they ride behind an Arc.
pub type Def = Arc<NodeDefinition>;


// One argument of a statement.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    // 42, 4.2, "str", true
    Literal(LitValue),
    // #name, referencing an output declared by another statement
    Wire(String),
    // a bare identifier, filling a Name-typed socket
    Name(String),
    // a type keyword, only meaningful in properties
    Type(TypeSet),
}


// NodeName(arg, ...)~#out1, #out2
#[derive(Clone, Debug, PartialEq)]
pub struct NodeStmt {
    pub name: String,
    pub args: Vec<Arg>,
    pub outputs: Vec<String>,
    pub line: usize,
}


// [PropertyName(arg, ...)]
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyStmt {
    pub name: String,
    pub args: Vec<Arg>,
    pub line: usize,
}


#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyntaxTree {
    pub properties: Vec<PropertyStmt>,
    pub nodes: Vec<NodeStmt>,
}
