// The growable bytecode buffer.
//
// Code generation only ever writes single bytes and full-width
// immediates: inserting bytecode mid-stream while smaller immediates
// are in flight would force re-encoding whenever one overflowed, so
// everything is emitted full-width and shrunk afterwards by the
// size-reduction pass.
//
// The buffer carries sidecar lists whose records point at instruction
// offsets: the relocation list plus three kinds of debug info. The one
// structural operation is concatenation, which shifts every appended
// record by the base buffer's length.

use crate::sheet::InstructionToLink;
use crate::vm::{Opcode, FIMMEDIATE_SIZE};


// Which stack slot an instruction's value landed in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InsValueInfo {
    pub ins: usize,
    pub stack_index: i64,
}

// Which source line an execution node's code starts at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InsExecInfo {
    pub ins: usize,
    pub line: usize,
}

// Which node an instruction was generated for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InsNodeInfo {
    pub ins: usize,
    pub node: usize,
}


#[derive(Clone, Debug, Default, PartialEq)]
pub struct DebugInfo {
    pub value_info: Vec<InsValueInfo>,
    pub exec_info: Vec<InsExecInfo>,
    pub node_info: Vec<InsNodeInfo>,
}

impl DebugInfo {
    pub fn add_value_info(&mut self, info: InsValueInfo) {
        self.value_info.push(info);
    }

    pub fn add_exec_info(&mut self, info: InsExecInfo) {
        self.exec_info.push(info);
    }

    pub fn add_node_info(&mut self, info: InsNodeInfo) {
        self.node_info.push(info);
    }
}


#[derive(Clone, Debug, Default)]
pub struct BCode {
    pub code: Vec<u8>,
    pub links: Vec<InstructionToLink>,
    pub debug: DebugInfo,
}

impl BCode {
    pub fn new() -> BCode {
        BCode::default()
    }

    // A zeroed buffer of the given size.
    pub fn with_size(size: usize) -> BCode {
        BCode {
            code: vec![0; size],
            links: Vec::new(),
            debug: DebugInfo::default(),
        }
    }

    // Bytecode the size of one instruction, with the opcode in place
    // and zeroed immediates.
    pub fn ins(opcode: Opcode) -> BCode {
        let mut out = BCode::with_size(opcode.size());
        out.set_byte(0, opcode.into());
        out
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn set_byte(&mut self, index: usize, byte: u8) {
        if index < self.code.len() {
            self.code[index] = byte;
        }
    }

    // Store a full-width immediate. There are deliberately no byte or
    // half variants; see the module comment.
    pub fn set_fimmediate(&mut self, index: usize, fimmediate: i64) {
        if index + FIMMEDIATE_SIZE <= self.code.len() {
            self.code[index..index + FIMMEDIATE_SIZE]
                .copy_from_slice(&fimmediate.to_ne_bytes());
        }
    }

    pub fn add_link(&mut self, ins: usize, link: usize) {
        self.links.push(InstructionToLink { ins, link });
    }

    // Append `after`, shifting each of its sidecar records by our
    // current length.
    pub fn concat(&mut self, after: BCode) {
        if after.code.is_empty() {
            return;
        }
        let base = self.code.len();
        self.code.extend_from_slice(&after.code);

        for link in after.links {
            self.links.push(InstructionToLink {
                ins: link.ins + base,
                link: link.link,
            });
        }
        for info in after.debug.value_info {
            self.debug.add_value_info(InsValueInfo {
                ins: info.ins + base,
                ..info
            });
        }
        for info in after.debug.exec_info {
            self.debug.add_exec_info(InsExecInfo {
                ins: info.ins + base,
                ..info
            });
        }
        for info in after.debug.node_info {
            self.debug.add_node_info(InsNodeInfo {
                ins: info.ins + base,
                ..info
            });
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn test_ins_sets_opcode() {
        let b = BCode::ins(Opcode::PushF);
        assert_eq!(b.len(), Opcode::PushF.size());
        assert_eq!(b.code[0], u8::from(Opcode::PushF));
        assert!(b.code[1..].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_set_fimmediate() {
        let mut b = BCode::ins(Opcode::PushF);
        b.set_fimmediate(1, -42);
        assert_eq!(
            i64::from_ne_bytes(b.code[1..9].try_into().unwrap()),
            -42
        );
        // Out-of-range stores are ignored, matching set_byte.
        b.set_fimmediate(5, 1);
        assert_eq!(
            i64::from_ne_bytes(b.code[1..9].try_into().unwrap()),
            -42
        );
    }

    #[test]
    fn test_concat_shifts_sidecars() {
        let mut a = BCode::ins(Opcode::PushF);
        a.add_link(0, 0);

        let mut b = BCode::ins(Opcode::PushF);
        b.add_link(0, 1);
        b.debug.add_value_info(InsValueInfo {
            ins: 0,
            stack_index: 3,
        });
        b.debug.add_exec_info(InsExecInfo { ins: 0, line: 7 });
        b.debug.add_node_info(InsNodeInfo { ins: 0, node: 2 });

        let base = a.len();
        a.concat(b);
        assert_eq!(a.len(), 2 * Opcode::PushF.size());
        assert_eq!(a.links[0], InstructionToLink { ins: 0, link: 0 });
        assert_eq!(a.links[1], InstructionToLink { ins: base, link: 1 });
        assert_eq!(a.debug.value_info[0].ins, base);
        assert_eq!(a.debug.exec_info[0].line, 7);
        assert_eq!(a.debug.exec_info[0].ins, base);
        assert_eq!(a.debug.node_info[0].ins, base);
    }

    #[test]
    fn test_concat_empty_is_noop() {
        let mut a = BCode::ins(Opcode::Ret);
        a.concat(BCode::new());
        assert_eq!(a.len(), 1);
    }
}
