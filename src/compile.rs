// The build driver.
//
// Source on disk -> lex -> parse -> semantic scan (loading includes
// recursively, with a priors chain to refuse cycles) -> code
// generation -> link -> run. Each boundary checks the diagnostic sink
// and refuses to advance past errors, so later phases only ever see
// well-formed input.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::codegen::{self, CodegenOptions};
use crate::error::{Diagnostics, ErrorKind};
use crate::lexer;
use crate::link;
use crate::parser;
use crate::semantic;
use crate::sheet::{Sheet, SheetId, SheetStore};
use crate::vm::{self, Image, Vm};


pub const DEFAULT_STACK_DEPTH: usize = 1 << 16;


#[derive(Copy, Clone, Debug)]
pub struct Options {
    pub optimize: bool,
    pub debug: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            optimize: true,
            debug: false,
        }
    }
}


// Which stage a build gave up in.
#[derive(Clone, Debug, PartialEq)]
pub enum Failure {
    Compile,
    Link,
    Runtime(vm::Error),
}


fn resolve_include(from: &Path, include: &str) -> PathBuf {
    match from.parent() {
        Some(dir) => dir.join(include),
        None => PathBuf::from(include),
    }
}

// Load one sheet and, recursively, everything it includes. The priors
// chain holds every sheet above this one in the include tree; loading
// a path that is already on it is a circular include.
pub fn load_sheet(
    store: &mut SheetStore,
    path: &Path,
    include_path: Option<String>,
    priors: &mut Vec<PathBuf>,
    diags: &mut Diagnostics,
) -> Option<SheetId> {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            diags.add(
                ErrorKind::NameNotFound,
                path,
                0,
                &format!("cannot open sheet: {}", error),
            );
            return None;
        }
    };
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    let lexemes = lexer::lex(&source, path, diags);
    let tree = parser::parse(&lexemes, path, diags);

    let id = store.alloc(Sheet::new(path.to_path_buf()));
    let mut sheet = store.take(id);
    sheet.include_path = include_path;

    let includes = semantic::scan_properties(&mut sheet, id, &tree, diags);
    priors.push(canonical);
    for request in includes {
        let target = resolve_include(path, &request.path);
        let target_canonical = target.canonicalize().unwrap_or_else(|_| target.clone());
        if priors.contains(&target_canonical) {
            diags.add(
                ErrorKind::CircularInclude,
                path,
                request.line,
                &format!("including '{}' would form a cycle", request.path),
            );
            continue;
        }
        if let Some(included) =
            load_sheet(store, &target, Some(request.path), priors, diags)
        {
            sheet.add_include(included);
        }
    }
    priors.pop();

    semantic::scan_nodes(&mut sheet, id, store, &tree, diags);
    semantic::reduce_types(&mut sheet, diags);
    semantic::detect_loops(&mut sheet, diags);
    sheet.has_errors = diags.has_errors();
    store.put(id, sheet);
    Some(id)
}

// The front half of the pipeline: a source path to compiled sheets.
pub fn compile_file(
    store: &mut SheetStore,
    path: &Path,
    options: Options,
    diags: &mut Diagnostics,
) -> Option<SheetId> {
    let mut priors = Vec::new();
    let id = load_sheet(store, path, None, &mut priors, diags)?;
    if diags.has_errors() {
        return None;
    }
    if store.get(id).start_node.is_none() {
        diags.add(
            ErrorKind::RedundantNode,
            path,
            0,
            "sheet has no Start node; running it will do nothing",
        );
    }
    codegen::compile_sheet(
        store,
        id,
        CodegenOptions {
            optimize: options.optimize,
            debug: options.debug,
        },
        diags,
    );
    if diags.has_errors() {
        None
    } else {
        Some(id)
    }
}

pub fn link_file(
    store: &mut SheetStore,
    id: SheetId,
    diags: &mut Diagnostics,
) -> Option<Image> {
    link::link_program(store, id, diags)
}

pub fn run_image(image: &Image, out: &mut dyn Write) -> vm::Result<()> {
    Vm::new(image, DEFAULT_STACK_DEPTH).exec(out)
}

// Compile, link and execute a sheet in one go.
pub fn run_file(
    path: &Path,
    options: Options,
    out: &mut dyn Write,
    diags: &mut Diagnostics,
) -> Result<(), Failure> {
    let mut store = SheetStore::new();
    let id = match compile_file(&mut store, path, options, diags) {
        Some(id) => id,
        None => return Err(Failure::Compile),
    };
    let image = match link_file(&mut store, id, diags) {
        Some(image) => image,
        None => return Err(Failure::Link),
    };
    run_image(&image, out).map_err(Failure::Runtime)
}
