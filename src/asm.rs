// The disassembler.
//
// Pure functions from compiled artifacts to human-readable text; the
// CLI prints them under -d. Nothing here is on an execution path.

use std::convert::TryFrom;
use std::fmt::Write as _;

use crate::sheet::{InstructionToLink, LinkMeta, Sheet};
use crate::vm::{ImmLayout, Opcode, BIMMEDIATE_SIZE, FIMMEDIATE_SIZE};


const DATA_DUMP_NUM_COLS: usize = 16;


// Walk the text section, one line per instruction: offset, raw bytes,
// mnemonic, immediates.
pub fn text_dump(code: &[u8]) -> String {
    let mut out = String::new();
    let max_ins_size = 1 + FIMMEDIATE_SIZE + BIMMEDIATE_SIZE;

    let mut at = 0;
    while at < code.len() {
        let byte = code[at];
        let (mnemonic, size, layout) = match Opcode::try_from(byte) {
            Ok(op) => (op.mnemonic(), op.size(), op.layout()),
            Err(_) => ("UNDEFINED", 0, ImmLayout::None),
        };

        let _ = write!(out, "{:8x}\t", at);
        for column in 0..max_ins_size {
            if column < size && at + column < code.len() {
                let _ = write!(out, "{:02x} ", code[at + column]);
            } else {
                out.push_str("   ");
            }
        }
        let _ = write!(out, "\t{} ", mnemonic);

        match layout {
            ImmLayout::None => {}
            ImmLayout::Byte => {
                let v = read_b(code, at + 1);
                let _ = write!(out, "0x{:x} ({})", v, v);
            }
            ImmLayout::Half => {
                let v = read_h(code, at + 1);
                let _ = write!(out, "0x{:x} ({})", v, v);
            }
            ImmLayout::Full => {
                let v = read_f(code, at + 1);
                let _ = write!(out, "0x{:x} ({})", v, v);
            }
            ImmLayout::ByteByte => {
                let a = read_b(code, at + 1);
                let b = read_b(code, at + 2);
                let _ = write!(out, "0x{:x} ({}), 0x{:x} ({})", a, a, b, b);
            }
            ImmLayout::HalfByte => {
                let a = read_h(code, at + 1);
                let b = read_b(code, at + 3);
                let _ = write!(out, "0x{:x} ({}), 0x{:x} ({})", a, a, b, b);
            }
            ImmLayout::FullByte => {
                let a = read_f(code, at + 1);
                let b = read_b(code, at + 1 + FIMMEDIATE_SIZE);
                let _ = write!(out, "0x{:x} ({}), 0x{:x} ({})", a, a, b, b);
            }
        }
        out.push('\n');

        // A borked text section should not loop forever.
        if size == 0 {
            break;
        }
        at += size;
    }
    out
}

fn read_b(code: &[u8], at: usize) -> i64 {
    code.get(at).map(|&b| b as i8 as i64).unwrap_or(0)
}

fn read_h(code: &[u8], at: usize) -> i64 {
    match code.get(at..at + 2) {
        Some(bytes) => {
            let mut buf = [0u8; 2];
            buf.copy_from_slice(bytes);
            i16::from_ne_bytes(buf) as i64
        }
        None => 0,
    }
}

fn read_f(code: &[u8], at: usize) -> i64 {
    match code.get(at..at + 8) {
        Some(bytes) => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            i64::from_ne_bytes(buf)
        }
        None => 0,
    }
}


// Hex view of the data section, sixteen columns with an ASCII gutter.
pub fn data_dump(data: &[u8]) -> String {
    let mut out = String::from("           ");
    for column in 0..DATA_DUMP_NUM_COLS {
        let _ = write!(out, "{:x}  ", column);
    }
    out.push('\n');

    for (row, chunk) in data.chunks(DATA_DUMP_NUM_COLS).enumerate() {
        let _ = write!(out, "0x{:08x} ", row * DATA_DUMP_NUM_COLS);
        for &byte in chunk {
            let _ = write!(out, "{:02x} ", byte);
        }
        for _ in chunk.len()..DATA_DUMP_NUM_COLS {
            out.push_str("   ");
        }
        for &byte in chunk {
            if byte.is_ascii_alphanumeric() {
                out.push(byte as char);
            } else {
                out.push('.');
            }
        }
        out.push('\n');
    }
    out
}


pub fn lmeta_dump(metas: &[LinkMeta]) -> String {
    let mut out = String::new();
    for (index, meta) in metas.iter().enumerate() {
        let pointer = match meta.ptr {
            Some(ptr) => format!("0x{:x}", ptr),
            None => String::from("(unresolved)"),
        };
        let _ = writeln!(
            out,
            "{:08}: Type: {:?} Name: {} Pointer: {}",
            index, meta.kind, meta.name, pointer
        );
    }
    out
}


pub fn link_dump(records: &[InstructionToLink]) -> String {
    let mut out = String::new();
    for record in records {
        let _ = writeln!(out, "INS {:8x} -> LINK {:8}", record.ins, record.link);
    }
    out
}


// Every section of a compiled sheet.
pub fn dump_all(sheet: &Sheet, include_paths: &[String]) -> String {
    let mut out = String::new();
    out.push_str("\n.text:\n");
    out.push_str(&text_dump(&sheet.text));
    let _ = write!(out, "\n.main:\n{:08x}\n", sheet.main);
    out.push_str("\n.data:\n");
    out.push_str(&data_dump(&sheet.data));
    out.push_str("\n.lmeta:\n");
    out.push_str(&lmeta_dump(&sheet.link));
    out.push_str("\n.link:\n");
    out.push_str(&link_dump(&sheet.ins_link_list));
    out.push_str("\n.func:\n");
    out.push_str(&sheet.functions_dump());
    out.push_str("\n.var:\n");
    out.push_str(&sheet.variables_dump());
    out.push_str("\n.incl:\n");
    for path in include_paths {
        out.push_str(path);
        out.push('\n');
    }
    out.push('\n');
    out
}
