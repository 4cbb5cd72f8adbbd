// Compile-phase diagnostics.
//
// Every phase appends to one Diagnostics sink and keeps going where it
// can; the driver refuses to advance to the next phase while the sink
// holds an error. RedundantNode is the only warning kind.

use std::fmt;
use std::path::{Path, PathBuf};


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Lex,
    Syntax,
    NameNotFound,
    CircularInclude,
    RedefinedName,
    TypeMismatch,
    AmbiguousType,
    CycleDetected,
    RedundantNode,
    UnresolvedSymbol,
    Runtime,
    // A compiler invariant broke; never caused by the sheet itself.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Lex => "LexError",
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::NameNotFound => "NameNotFound",
            ErrorKind::CircularInclude => "CircularInclude",
            ErrorKind::RedefinedName => "RedefinedName",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::AmbiguousType => "AmbiguousType",
            ErrorKind::CycleDetected => "CycleDetected",
            ErrorKind::RedundantNode => "RedundantNode",
            ErrorKind::UnresolvedSymbol => "UnresolvedSymbol",
            ErrorKind::Runtime => "Runtime",
            ErrorKind::Internal => "Internal",
        }
    }

    pub fn is_warning(self) -> bool {
        self == ErrorKind::RedundantNode
    }
}


#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub path: PathBuf,
    pub line: usize,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let severity = if self.kind.is_warning() {
            "warning"
        } else {
            "error"
        };
        write!(
            f,
            "{}:{}: {}: {}: {}",
            self.path.display(),
            self.line,
            severity,
            self.kind.as_str(),
            self.message
        )
    }
}


#[derive(Debug, Default)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics { list: Vec::new() }
    }

    pub fn add(&mut self, kind: ErrorKind, path: &Path, line: usize, message: &str) {
        self.list.push(Diagnostic {
            kind,
            path: path.to_path_buf(),
            line,
            message: String::from(message),
        });
    }

    pub fn has_errors(&self) -> bool {
        self.list.iter().any(|d| !d.kind.is_warning())
    }

    pub fn error_count(&self) -> usize {
        self.list.iter().filter(|d| !d.kind.is_warning()).count()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.list.iter()
    }

    pub fn contains_kind(&self, kind: ErrorKind) -> bool {
        self.list.iter().any(|d| d.kind == kind)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_format() {
        let d = Diagnostic {
            kind: ErrorKind::TypeMismatch,
            path: PathBuf::from("foo.dc"),
            line: 3,
            message: String::from("Integer is not String"),
        };
        assert_eq!(
            format!("{}", d),
            "foo.dc:3: error: TypeMismatch: Integer is not String"
        );
    }

    #[test]
    fn test_warnings_are_not_errors() {
        let mut diags = Diagnostics::new();
        diags.add(
            ErrorKind::RedundantNode,
            Path::new("foo.dc"),
            1,
            "node is never executed",
        );
        assert!(!diags.has_errors());
        assert_eq!(diags.len(), 1);
        diags.add(ErrorKind::Syntax, Path::new("foo.dc"), 2, "unexpected token");
        assert!(diags.has_errors());
        assert_eq!(diags.error_count(), 1);
    }
}
