// The linker.
//
// Addresses are offsets into a program-wide address space laid out
// here: every sheet's data section gets a base in the data space and
// every text section a base in the text space. Linking a sheet means
// rewriting each relocated full immediate with the final address of
// the object it names, in this sheet or an included one, and writing
// string variables' default-value pointers into the data section.
// Afterwards the sections are stitched into the executable image in
// layout order.
//
// All writes go to memory the compiler already allocated; linking a
// sheet twice is a no-op thanks to the is_linked flag.

use std::collections::HashMap;

use crate::error::{Diagnostics, ErrorKind};
use crate::sheet::{LinkMeta, LinkRef, LinkType, Sheet, SheetId, SheetStore};
use crate::vm::{Image, FIMMEDIATE_SIZE};


pub struct Layout {
    pub order: Vec<SheetId>,
    pub data_base: HashMap<SheetId, usize>,
    pub text_base: HashMap<SheetId, usize>,
}

impl Layout {
    // Depth-first preorder over the include graph, root first.
    pub fn of(store: &SheetStore, root: SheetId) -> Layout {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if order.contains(&id) {
                continue;
            }
            order.push(id);
            for &include in store.get(id).includes.iter().rev() {
                stack.push(include);
            }
        }

        let mut data_base = HashMap::new();
        let mut text_base = HashMap::new();
        let mut data_cursor = 0;
        let mut text_cursor = 0;
        for &id in &order {
            data_base.insert(id, data_cursor);
            text_base.insert(id, text_cursor);
            data_cursor += store.get(id).data.len();
            text_cursor += store.get(id).text.len();
        }
        Layout {
            order,
            data_base,
            text_base,
        }
    }
}


// Bind a meta to the sheet object defining it, searching the include
// graph recursively.
fn recursive_find_link_meta(
    store: &SheetStore,
    sheet: &Sheet,
    kind: LinkType,
    name: &str,
) -> Option<LinkRef> {
    for &include in &sheet.includes {
        let included = store.get(include);
        for meta in &included.link {
            if meta.kind != kind || meta.name != name || meta.ptr.is_none() {
                continue;
            }
            // Only the defining sheet counts, not another reference.
            let local = match meta.refers {
                LinkRef::Variable(sid, _) | LinkRef::Function(sid, _) => sid == include,
                _ => false,
            };
            if !local {
                continue;
            }
            match kind {
                LinkType::Variable | LinkType::VariablePointer => {
                    if let Some(var) = included.variable_by_name(name) {
                        return Some(LinkRef::Variable(include, var));
                    }
                }
                LinkType::Function => {
                    if let Some(func) = included.function_by_name(name) {
                        return Some(LinkRef::Function(include, func));
                    }
                }
                _ => {}
            }
        }
        if let Some(found) = recursive_find_link_meta(store, included, kind, name) {
            return Some(found);
        }
    }
    None
}

// Resolve metas that know neither their object nor its address, which
// happens for sheets restored from object files.
pub fn find_included(store: &mut SheetStore, id: SheetId, diags: &mut Diagnostics) {
    if !store.get(id).is_compiled {
        return;
    }
    let mut sheet = store.take(id);
    for index in 0..sheet.link.len() {
        let meta = sheet.link[index].clone();
        let unresolved = meta.ptr.is_none() && meta.refers == LinkRef::None;
        let searchable = matches!(
            meta.kind,
            LinkType::Variable | LinkType::VariablePointer | LinkType::Function
        );
        if !(unresolved && searchable) {
            continue;
        }
        match recursive_find_link_meta(store, &sheet, meta.kind, &meta.name) {
            Some(refers) => sheet.link[index].refers = refers,
            None => {
                diags.add(
                    ErrorKind::UnresolvedSymbol,
                    &sheet.file_path,
                    0,
                    &format!("cannot find '{}' in any included sheet", meta.name),
                );
            }
        }
    }
    store.put(id, sheet);
}

// Compute the final addresses of external variables and functions.
pub fn precalculate_ptr(
    store: &mut SheetStore,
    id: SheetId,
    layout: &Layout,
    diags: &mut Diagnostics,
) {
    if !store.get(id).is_compiled {
        return;
    }
    let mut sheet = store.take(id);
    for meta in &mut sheet.link {
        if meta.ptr.is_some() {
            continue;
        }
        let resolved = match meta.refers {
            LinkRef::Variable(sid, _) => {
                store.get(sid).link.iter().find_map(|external| {
                    if external.kind == meta.kind
                        && external.name == meta.name
                        && external.ptr.is_some()
                    {
                        Some(layout.data_base[&sid] + external.ptr.unwrap_or(0))
                    } else {
                        None
                    }
                })
            }
            LinkRef::Function(sid, _) => {
                store.get(sid).link.iter().find_map(|external| {
                    if external.kind == LinkType::Function
                        && external.name == meta.name
                        && external.ptr.is_some()
                    {
                        Some(layout.text_base[&sid] + external.ptr.unwrap_or(0))
                    } else {
                        None
                    }
                })
            }
            LinkRef::CFunction(index) => Some(index),
            LinkRef::None => None,
        };
        match resolved {
            Some(address) => meta.ptr = Some(address),
            None => {
                diags.add(
                    ErrorKind::UnresolvedSymbol,
                    &sheet.file_path,
                    0,
                    &format!("'{}' has no address", meta.name),
                );
            }
        }
    }
    store.put(id, sheet);
}

fn final_addr(meta: &LinkMeta, id: SheetId, layout: &Layout) -> Option<usize> {
    let local_data = |ptr: Option<usize>| Some(layout.data_base[&id] + ptr?);
    match meta.kind {
        LinkType::DataStringLiteral => local_data(meta.ptr),
        LinkType::Variable | LinkType::VariablePointer => match meta.refers {
            LinkRef::Variable(sid, _) if sid != id => meta.ptr,
            _ => local_data(meta.ptr),
        },
        LinkType::Function => match meta.refers {
            LinkRef::Function(sid, _) if sid != id => meta.ptr,
            _ => Some(layout.text_base[&id] + meta.ptr?),
        },
        LinkType::CFunction => meta.ptr,
        LinkType::VariableStringDefault => None,
    }
}

// Rewrite this sheet's relocated immediates and initialize string
// variables' default pointers.
pub fn link_self(store: &mut SheetStore, id: SheetId, layout: &Layout, diags: &mut Diagnostics) {
    if !store.get(id).is_compiled || store.get(id).is_linked {
        return;
    }
    let mut sheet = store.take(id);

    for index in 0..sheet.ins_link_list.len() {
        let record = sheet.ins_link_list[index];
        let meta = sheet.link[record.link].clone();
        match final_addr(&meta, id, layout) {
            Some(address) => {
                let at = record.ins + 1;
                if at + FIMMEDIATE_SIZE <= sheet.text.len() {
                    sheet.text[at..at + FIMMEDIATE_SIZE]
                        .copy_from_slice(&(address as i64).to_ne_bytes());
                }
            }
            None => {
                diags.add(
                    ErrorKind::UnresolvedSymbol,
                    &sheet.file_path,
                    0,
                    &format!("'{}' never resolved", meta.name),
                );
            }
        }
    }

    // String variables hold a pointer to their default bytes; nothing
    // in the instruction stream references it, so it is written here.
    for index in 0..sheet.link.len() {
        let meta = sheet.link[index].clone();
        if meta.kind != LinkType::VariableStringDefault {
            continue;
        }
        let slot = sheet
            .link
            .iter()
            .find(|m| m.kind == LinkType::VariablePointer && m.name == meta.name)
            .and_then(|m| m.ptr);
        if let (Some(slot), Some(default)) = (slot, meta.ptr) {
            let address = (layout.data_base[&id] + default) as i64;
            if slot + FIMMEDIATE_SIZE <= sheet.data.len() {
                sheet.data[slot..slot + FIMMEDIATE_SIZE]
                    .copy_from_slice(&address.to_ne_bytes());
            }
        }
    }

    sheet.is_linked = true;
    store.put(id, sheet);
}

// Walk the include tree, linking every compiled sheet that is not
// linked yet.
pub fn link_includes_recursive(
    store: &mut SheetStore,
    id: SheetId,
    layout: &Layout,
    diags: &mut Diagnostics,
) {
    let includes = store.get(id).includes.clone();
    for include in includes {
        link_self(store, include, layout, diags);
        link_includes_recursive(store, include, layout, diags);
    }
}

// The whole dance: resolve, precalculate, rewrite, then stitch the
// executable image together in layout order.
pub fn link_program(
    store: &mut SheetStore,
    root: SheetId,
    diags: &mut Diagnostics,
) -> Option<Image> {
    let errors_before = diags.error_count();
    let layout = Layout::of(store, root);

    for &id in &layout.order {
        find_included(store, id, diags);
    }
    if diags.error_count() > errors_before {
        return None;
    }
    for &id in &layout.order {
        precalculate_ptr(store, id, &layout, diags);
    }
    if diags.error_count() > errors_before {
        return None;
    }

    link_self(store, root, &layout, diags);
    link_includes_recursive(store, root, &layout, diags);
    if diags.error_count() > errors_before {
        return None;
    }

    let mut image = Image::default();
    for &id in &layout.order {
        image.data.extend_from_slice(&store.get(id).data);
    }
    for &id in &layout.order {
        image.text.extend_from_slice(&store.get(id).text);
    }
    image.entry = layout.text_base[&root] + store.get(root).main;
    Some(image)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{self, CodegenOptions};
    use crate::lexer;
    use crate::parser;
    use crate::semantic;
    use std::convert::TryInto;
    use std::path::PathBuf;

    // Build a sheet from source, optionally seeing other sheets as
    // includes.
    fn build_sheet(
        store: &mut SheetStore,
        source: &str,
        name: &str,
        includes: &[SheetId],
    ) -> SheetId {
        let mut diags = Diagnostics::new();
        let path = PathBuf::from(name);
        let lexemes = lexer::lex(source, &path, &mut diags);
        let tree = parser::parse(&lexemes, &path, &mut diags);
        let id = store.alloc(Sheet::new(path));
        let mut sheet = store.take(id);
        semantic::scan_properties(&mut sheet, id, &tree, &mut diags);
        for &include in includes {
            sheet.add_include(include);
        }
        semantic::scan_nodes(&mut sheet, id, store, &tree, &mut diags);
        semantic::reduce_types(&mut sheet, &mut diags);
        semantic::detect_loops(&mut sheet, &mut diags);
        store.put(id, sheet);
        assert!(!diags.has_errors(), "build failed: {:?}", diags);
        codegen::compile_sheet(store, id, CodegenOptions::default(), &mut diags);
        assert!(!diags.has_errors(), "codegen failed: {:?}", diags);
        id
    }

    fn imm_at(text: &[u8], ins: usize) -> i64 {
        i64::from_ne_bytes(text[ins + 1..ins + 1 + 8].try_into().unwrap())
    }

    #[test]
    fn test_string_literal_resolves_in_sheet() {
        let mut store = SheetStore::new();
        let id = build_sheet(
            &mut store,
            "Start~#1\nPrint(#1, \"hello\")\n",
            "a.dc",
            &[],
        );
        let mut diags = Diagnostics::new();
        let image = link_program(&mut store, id, &mut diags).unwrap();
        assert!(!diags.has_errors());

        let sheet = store.get(id);
        assert!(sheet.is_linked);
        // No meta keeps the unresolved sentinel after a clean link.
        assert!(sheet.link.iter().all(|m| m.ptr.is_some()));
        let record = sheet.ins_link_list[0];
        let address = imm_at(&sheet.text, record.ins) as usize;
        assert_eq!(&image.data[address..address + 6], b"hello\0");
    }

    #[test]
    fn test_string_variable_default_initialized() {
        let mut store = SheetStore::new();
        let id = build_sheet(
            &mut store,
            "[Variable(greeting, String, \"hi\")]\n\
             Start~#1\n\
             greeting()~#g\n\
             Print(#1, #g)\n",
            "a.dc",
            &[],
        );
        let mut diags = Diagnostics::new();
        let image = link_program(&mut store, id, &mut diags).unwrap();
        assert!(!diags.has_errors());

        let sheet = store.get(id);
        let slot = sheet
            .link
            .iter()
            .find(|m| m.kind == LinkType::VariablePointer)
            .unwrap()
            .ptr
            .unwrap();
        let pointer = i64::from_ne_bytes(
            sheet.data[slot..slot + 8].try_into().unwrap(),
        ) as usize;
        assert_eq!(&image.data[pointer..pointer + 3], b"hi\0");
    }

    #[test]
    fn test_cross_sheet_function_call() {
        let mut store = SheetStore::new();
        let lib = build_sheet(
            &mut store,
            "[Function(Double)]\n\
             [FunctionInput(Double, n, Integer, 0)]\n\
             [FunctionOutput(Double, out, Integer)]\n\
             Define(Double)~#n\n\
             Multiply(#n, 2)~#m\n\
             Return(Double, #m)\n",
            "lib.dc",
            &[],
        );
        let main = build_sheet(
            &mut store,
            "Start~#1\nDouble(21)~#d\nPrint(#1, #d)\n",
            "main.dc",
            &[lib],
        );

        let mut diags = Diagnostics::new();
        let image = link_program(&mut store, main, &mut diags).unwrap();
        assert!(!diags.has_errors());

        let layout = Layout::of(&store, main);
        let sheet = store.get(main);
        let call = sheet
            .ins_link_list
            .iter()
            .find(|r| sheet.link[r.link].kind == LinkType::Function)
            .unwrap();
        let target = imm_at(&sheet.text, call.ins) as usize;
        let lib_meta = store
            .get(lib)
            .link
            .iter()
            .find(|m| m.kind == LinkType::Function && m.name == "Double")
            .unwrap();
        assert_eq!(
            target,
            layout.text_base[&lib] + lib_meta.ptr.unwrap()
        );
        assert_eq!(image.entry, layout.text_base[&main] + sheet.main);
    }

    #[test]
    fn test_unresolved_symbol() {
        let mut store = SheetStore::new();
        let mut sheet = Sheet::new(PathBuf::from("orphan.dc"));
        sheet.is_compiled = true;
        sheet.link.push(LinkMeta {
            kind: LinkType::Function,
            name: String::from("Missing"),
            refers: LinkRef::None,
            ptr: None,
        });
        let id = store.alloc(sheet);
        let mut diags = Diagnostics::new();
        assert!(link_program(&mut store, id, &mut diags).is_none());
        assert!(diags.contains_kind(ErrorKind::UnresolvedSymbol));
    }

    #[test]
    fn test_linking_is_idempotent() {
        let mut store = SheetStore::new();
        let id = build_sheet(
            &mut store,
            "Start~#1\nPrint(#1, \"once\")\n",
            "a.dc",
            &[],
        );
        let mut diags = Diagnostics::new();
        let first = link_program(&mut store, id, &mut diags).unwrap();
        let second = link_program(&mut store, id, &mut diags).unwrap();
        assert!(!diags.has_errors());
        assert_eq!(first, second);
    }
}
