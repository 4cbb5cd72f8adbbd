// The type lattice.
//
// Types are bit-sets over a fixed atom set. A set with more than one
// variable atom is "vague" (e.g. Integer | Float, which sockets declare
// as Number) and must be reduced to a single atom before code
// generation. Execution and Name are control/metadata atoms and never
// count towards vagueness.
//
// The lattice is a lower-semilattice under bit-AND: intersecting two
// sets yields the types permissible to both.

use enumflags2::BitFlags;

use crate::lexer::Token;


#[derive(BitFlags, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DType {
    Execution = 0b000001,
    Int       = 0b000010,
    Float     = 0b000100,
    Str       = 0b001000,
    Bool      = 0b010000,
    Name      = 0b100000,
}


pub type TypeSet = BitFlags<DType>;

const VAR_ATOMS: [DType; 4] = [DType::Int, DType::Float, DType::Str, DType::Bool];


// The two named vague types.
pub fn number() -> TypeSet {
    DType::Int | DType::Float
}

pub fn var_any() -> TypeSet {
    DType::Int | DType::Float | DType::Str | DType::Bool
}

// And | Or | Xor | Not operate on this one, which has no surface name.
pub fn int_bool() -> TypeSet {
    DType::Int | DType::Bool
}

pub fn execution() -> TypeSet {
    BitFlags::from_flag(DType::Execution)
}

pub fn single(atom: DType) -> TypeSet {
    BitFlags::from_flag(atom)
}


fn num_var_atoms(t: TypeSet) -> usize {
    VAR_ATOMS.iter().filter(|a| t.contains(**a)).count()
}

// Vague means more than one variable atom, e.g. Integer | Float.
pub fn is_vague(t: TypeSet) -> bool {
    num_var_atoms(t) >= 2
}

// The single atom of a fully-reduced set, if it is fully reduced.
pub fn concrete(t: TypeSet) -> Option<DType> {
    let mut found = None;
    for atom in &[
        DType::Execution,
        DType::Int,
        DType::Float,
        DType::Str,
        DType::Bool,
        DType::Name,
    ] {
        if t.contains(*atom) {
            if found.is_some() {
                return None;
            }
            found = Some(*atom);
        }
    }
    found
}

// Canonical name for single atoms plus the two named vague types.
// Other combinations have no name.
pub fn type_name(t: TypeSet) -> Option<&'static str> {
    if let Some(atom) = concrete(t) {
        return Some(match atom {
            DType::Execution => "Execution",
            DType::Int => "Integer",
            DType::Float => "Float",
            DType::Str => "String",
            DType::Bool => "Boolean",
            DType::Name => "Name",
        });
    }
    if t == number() {
        Some("Number")
    } else if t == var_any() {
        Some("Variable")
    } else {
        None
    }
}

// Rough description used in diagnostics, where unnamed combinations
// still need to be printable.
pub fn describe(t: TypeSet) -> String {
    if t.is_empty() {
        return String::from("(none)");
    }
    if let Some(name) = type_name(t) {
        return String::from(name);
    }
    let mut parts = Vec::new();
    for atom in &VAR_ATOMS {
        if t.contains(*atom) {
            parts.push(type_name(single(*atom)).unwrap_or("?"));
        }
    }
    if t.contains(DType::Execution) {
        parts.insert(0, "Execution");
    }
    parts.join("|")
}


// Map a declared-type token into the lattice.
pub fn from_lex(tok: &Token) -> Option<TypeSet> {
    match tok {
        Token::KwExecution => Some(execution()),
        Token::KwInteger => Some(single(DType::Int)),
        Token::KwFloat => Some(single(DType::Float)),
        Token::KwString => Some(single(DType::Str)),
        Token::KwBoolean => Some(single(DType::Bool)),
        _ => None,
    }
}

// Map a literal token into the lattice.
pub fn from_lex_literal(tok: &Token) -> Option<TypeSet> {
    match tok {
        Token::IntLit(_) => Some(single(DType::Int)),
        Token::FloatLit(_) => Some(single(DType::Float)),
        Token::StrLit(_) => Some(single(DType::Str)),
        Token::BoolLit(_) => Some(single(DType::Bool)),
        _ => None,
    }
}


// A tagged literal value, used for socket defaults and for literal
// arguments overriding them.
#[derive(Clone, Debug, PartialEq)]
pub enum LitValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl LitValue {
    // The types a literal is allowed to reduce a socket to. An integer
    // literal can feed either numeric atom; this is what makes one
    // Float input drag a whole arithmetic node to the Float path.
    pub fn seed(&self) -> TypeSet {
        match self {
            LitValue::Int(_) => number(),
            LitValue::Float(_) => single(DType::Float),
            LitValue::Str(_) => single(DType::Str),
            LitValue::Bool(_) => single(DType::Bool),
        }
    }

    pub fn zero_of(t: DType) -> LitValue {
        match t {
            DType::Float => LitValue::Float(0.0),
            DType::Str => LitValue::Str(String::new()),
            DType::Bool => LitValue::Bool(false),
            _ => LitValue::Int(0),
        }
    }
}
