// Compiled object files.
//
// Sections in order, each prefixed by its byte length: .text, .main,
// .data, .lmeta, .link, .func, .var, .incl. Byte order is native, and
// full immediates are a fixed eight bytes, so objects move between
// machines of the same endianness only. Objects are written before
// linking; link metas are stored with their local offsets and external
// references fully unresolved, which is exactly the state the linker's
// find_included pass expects.

use std::convert::TryInto;
use std::path::Path;

use crate::nodes;
use crate::sheet::{
    InstructionToLink, LinkMeta, LinkRef, LinkType, Sheet, SheetFunction, SheetId,
    SheetStore, SheetVariable, SocketMeta,
};
use crate::types::LitValue;

use enumflags2::BitFlags;


const UNRESOLVED: u64 = u64::MAX;


pub struct ObjectData {
    pub sheet: Sheet,
    pub include_paths: Vec<String>,
}


fn kind_tag(kind: LinkType) -> u8 {
    match kind {
        LinkType::DataStringLiteral => 0,
        LinkType::Variable => 1,
        LinkType::VariablePointer => 2,
        LinkType::VariableStringDefault => 3,
        LinkType::Function => 4,
        LinkType::CFunction => 5,
    }
}

fn kind_from_tag(tag: u8) -> Option<LinkType> {
    Some(match tag {
        0 => LinkType::DataStringLiteral,
        1 => LinkType::Variable,
        2 => LinkType::VariablePointer,
        3 => LinkType::VariableStringDefault,
        4 => LinkType::Function,
        5 => LinkType::CFunction,
        _ => return None,
    })
}


fn put_cstr(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(text.as_bytes());
    out.push(0);
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_ne_bytes());
}

fn put_socket(out: &mut Vec<u8>, meta: &SocketMeta) {
    put_cstr(out, &meta.name);
    out.push(meta.typ.bits());
    match &meta.default {
        LitValue::Int(v) => {
            out.push(0);
            out.extend_from_slice(&v.to_ne_bytes());
        }
        LitValue::Float(v) => {
            out.push(1);
            out.extend_from_slice(&v.to_bits().to_ne_bytes());
        }
        LitValue::Str(v) => {
            out.push(2);
            put_cstr(out, v);
        }
        LitValue::Bool(v) => {
            out.push(3);
            out.push(*v as u8);
        }
    }
}

fn put_section(out: &mut Vec<u8>, payload: &[u8]) {
    put_u64(out, payload.len() as u64);
    out.extend_from_slice(payload);
}


pub fn write(store: &SheetStore, id: SheetId) -> Vec<u8> {
    let sheet = store.get(id);
    let mut out = Vec::new();

    put_section(&mut out, &sheet.text);

    let mut main = Vec::new();
    put_u64(&mut main, sheet.main as u64);
    put_section(&mut out, &main);

    put_section(&mut out, &sheet.data);

    let mut lmeta = Vec::new();
    for meta in &sheet.link {
        lmeta.push(kind_tag(meta.kind));
        put_cstr(&mut lmeta, &meta.name);
        put_u64(
            &mut lmeta,
            meta.ptr.map(|p| p as u64).unwrap_or(UNRESOLVED),
        );
    }
    put_section(&mut out, &lmeta);

    let mut link = Vec::new();
    for record in &sheet.ins_link_list {
        put_u64(&mut link, record.ins as u64);
        put_u64(&mut link, record.link as u64);
    }
    put_section(&mut out, &link);

    let mut func = Vec::new();
    for function in &sheet.functions {
        put_cstr(&mut func, &function.def.name);
        func.push(function.is_subroutine as u8);
        let skip = function.is_subroutine as usize;
        let inputs = &function.def.sockets[skip..function.def.start_output_index];
        let outputs = &function.def.sockets[function.def.start_output_index + skip..];
        put_u64(&mut func, inputs.len() as u64);
        put_u64(&mut func, outputs.len() as u64);
        for socket in inputs.iter().chain(outputs) {
            put_socket(&mut func, socket);
        }
    }
    put_section(&mut out, &func);

    let mut var = Vec::new();
    for variable in &sheet.variables {
        put_socket(&mut var, &variable.meta);
    }
    put_section(&mut out, &var);

    let mut incl = Vec::new();
    for &include in &sheet.includes {
        let included = store.get(include);
        match &included.include_path {
            Some(path) => put_cstr(&mut incl, path),
            None => put_cstr(&mut incl, &included.file_path.to_string_lossy()),
        }
    }
    put_section(&mut out, &incl);

    out
}


struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, String> {
        let byte = *self
            .bytes
            .get(self.at)
            .ok_or_else(|| String::from("truncated object"))?;
        self.at += 1;
        Ok(byte)
    }

    fn u64(&mut self) -> Result<u64, String> {
        let bytes = self
            .bytes
            .get(self.at..self.at + 8)
            .ok_or_else(|| String::from("truncated object"))?;
        self.at += 8;
        Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        let bytes = self
            .bytes
            .get(self.at..self.at + len)
            .ok_or_else(|| String::from("truncated object"))?;
        self.at += len;
        Ok(bytes)
    }

    fn cstr(&mut self) -> Result<String, String> {
        let tail = &self.bytes[self.at..];
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| String::from("unterminated name in object"))?;
        let text = String::from_utf8_lossy(&tail[..end]).into_owned();
        self.at += end + 1;
        Ok(text)
    }

    fn done(&self) -> bool {
        self.at >= self.bytes.len()
    }

    fn section(&mut self) -> Result<Cursor<'a>, String> {
        let len = self.u64()? as usize;
        let bytes = self.take(len)?;
        Ok(Cursor { bytes, at: 0 })
    }
}

fn read_socket(cursor: &mut Cursor) -> Result<SocketMeta, String> {
    let name = cursor.cstr()?;
    let bits = cursor.u8()?;
    let typ = BitFlags::from_bits_truncate(bits);
    let default = match cursor.u8()? {
        0 => LitValue::Int(i64::from_ne_bytes(cursor.take(8)?.try_into().unwrap())),
        1 => LitValue::Float(f64::from_bits(u64::from_ne_bytes(
            cursor.take(8)?.try_into().unwrap(),
        ))),
        2 => LitValue::Str(cursor.cstr()?),
        3 => LitValue::Bool(cursor.u8()? != 0),
        _ => return Err(String::from("unknown default-value tag")),
    };
    Ok(SocketMeta {
        name,
        description: String::new(),
        typ,
        default,
    })
}


pub fn read(bytes: &[u8], path: &Path) -> Result<ObjectData, String> {
    let mut cursor = Cursor { bytes, at: 0 };
    let mut sheet = Sheet::new(path.to_path_buf());

    sheet.text = cursor.section()?.bytes.to_vec();
    sheet.main = cursor.section()?.u64()? as usize;
    sheet.data = cursor.section()?.bytes.to_vec();

    let mut lmeta = cursor.section()?;
    while !lmeta.done() {
        let kind = kind_from_tag(lmeta.u8()?)
            .ok_or_else(|| String::from("unknown link-meta type"))?;
        let name = lmeta.cstr()?;
        let raw = lmeta.u64()?;
        sheet.link.push(LinkMeta {
            kind,
            name,
            refers: LinkRef::None,
            ptr: if raw == UNRESOLVED {
                None
            } else {
                Some(raw as usize)
            },
        });
    }

    let mut link = cursor.section()?;
    while !link.done() {
        sheet.ins_link_list.push(InstructionToLink {
            ins: link.u64()? as usize,
            link: link.u64()? as usize,
        });
    }

    let mut func = cursor.section()?;
    while !func.done() {
        let name = func.cstr()?;
        let is_subroutine = func.u8()? != 0;
        let num_inputs = func.u64()? as usize;
        let num_outputs = func.u64()? as usize;
        let mut inputs = Vec::with_capacity(num_inputs);
        for _ in 0..num_inputs {
            inputs.push(read_socket(&mut func)?);
        }
        let mut outputs = Vec::with_capacity(num_outputs);
        for _ in 0..num_outputs {
            outputs.push(read_socket(&mut func)?);
        }
        let (def, define_def, return_def) =
            nodes::function_defs(&name, &inputs, &outputs, is_subroutine);
        sheet.functions.push(SheetFunction {
            def,
            define_def,
            return_def,
            is_subroutine,
            sheet: SheetId(0),
            define_node: None,
            num_defines: 0,
            last_return_node: None,
            num_returns: 0,
        });
    }

    let mut var = cursor.section()?;
    while !var.done() {
        let meta = read_socket(&mut var)?;
        sheet.variables.push(SheetVariable {
            getter: nodes::getter_def(&meta.name, &meta),
            meta,
            sheet: SheetId(0),
        });
    }

    let mut incl = cursor.section()?;
    let mut include_paths = Vec::new();
    while !incl.done() {
        include_paths.push(incl.cstr()?);
    }

    sheet.is_compiled = true;
    Ok(ObjectData {
        sheet,
        include_paths,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{self, CodegenOptions};
    use crate::error::Diagnostics;
    use crate::lexer;
    use crate::parser;
    use crate::semantic;
    use std::path::PathBuf;

    fn compiled_sheet(source: &str) -> (SheetStore, SheetId) {
        let mut diags = Diagnostics::new();
        let path = PathBuf::from("test.dc");
        let lexemes = lexer::lex(source, &path, &mut diags);
        let tree = parser::parse(&lexemes, &path, &mut diags);
        let mut store = SheetStore::new();
        let id = store.alloc(Sheet::new(path));
        let mut sheet = store.take(id);
        semantic::scan_properties(&mut sheet, id, &tree, &mut diags);
        semantic::scan_nodes(&mut sheet, id, &store, &tree, &mut diags);
        semantic::reduce_types(&mut sheet, &mut diags);
        semantic::detect_loops(&mut sheet, &mut diags);
        store.put(id, sheet);
        codegen::compile_sheet(&mut store, id, CodegenOptions::default(), &mut diags);
        assert!(!diags.has_errors(), "build failed: {:?}", diags);
        (store, id)
    }

    #[test]
    fn test_round_trip() {
        let (store, id) = compiled_sheet(
            "[Variable(count, Integer, 7)]\n\
             [Function(Double)]\n\
             [FunctionInput(Double, n, Integer, 0)]\n\
             [FunctionOutput(Double, out, Integer)]\n\
             Define(Double)~#n\n\
             Multiply(#n, 2)~#m\n\
             Return(Double, #m)\n\
             Start~#1\n\
             count()~#c\n\
             Double(#c)~#d\n\
             Print(#1, #d)\n",
        );
        let bytes = write(&store, id);
        let object = read(&bytes, Path::new("test.dco")).unwrap();
        let original = store.get(id);
        let restored = &object.sheet;

        assert_eq!(restored.text, original.text);
        assert_eq!(restored.data, original.data);
        assert_eq!(restored.main, original.main);
        assert_eq!(restored.ins_link_list, original.ins_link_list);
        assert_eq!(restored.link.len(), original.link.len());
        for (a, b) in restored.link.iter().zip(&original.link) {
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.name, b.name);
            assert_eq!(a.ptr, b.ptr);
        }
        assert_eq!(restored.functions.len(), 1);
        assert_eq!(restored.functions[0].def.name, "Double");
        assert_eq!(
            restored.functions[0].def.sockets,
            original.functions[0].def.sockets
        );
        assert_eq!(restored.variables.len(), 1);
        assert_eq!(restored.variables[0].meta, original.variables[0].meta);
        assert!(restored.is_compiled);
        assert!(object.include_paths.is_empty());
    }

    #[test]
    fn test_truncated_object_is_an_error() {
        let (store, id) = compiled_sheet("Start~#1\nPrint(#1, 1)\n");
        let bytes = write(&store, id);
        assert!(read(&bytes[..bytes.len() / 2], Path::new("t.dco")).is_err());
    }
}
