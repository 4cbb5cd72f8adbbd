// Decision: a node-and-wire visual scripting language.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

extern crate clap;
extern crate enumflags2;
extern crate num_enum;
extern crate regex;
#[macro_use]
extern crate lazy_static;

pub mod asm;
pub mod ast;
pub mod bytecode;
pub mod cfunc;
pub mod codegen;
pub mod compile;
pub mod error;
pub mod lexer;
pub mod link;
pub mod nodes;
pub mod obj;
pub mod parser;
pub mod semantic;
pub mod sheet;
pub mod types;
#[macro_use]
pub mod util;
pub mod vm;
