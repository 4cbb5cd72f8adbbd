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

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;

use clap::Parser;

use decision::asm;
use decision::compile::{self, Options};
use decision::error::Diagnostics;
use decision::obj;
use decision::sheet::SheetStore;


// Exit codes: 0 success, 1 compile error, 2 link error, 3 runtime
// error, 4 usage error.
#[derive(Parser)]
#[command(
    name = "decision",
    version,
    about = "Compile and run Decision sheets."
)]
struct Cli {
    /// The sheet to build, or with -d a compiled object.
    source: PathBuf,

    /// Compile only; write an object instead of running.
    #[arg(short = 'c')]
    compile_only: bool,

    /// Disassemble a compiled object.
    #[arg(short = 'd')]
    disassemble: bool,

    /// Where to write the compiled object.
    #[arg(short = 'o')]
    output: Option<PathBuf>,

    /// Optimization level; 0 keeps every immediate full-width.
    #[arg(short = 'O', default_value_t = 1)]
    opt_level: u8,

    /// Keep debug info in the compiled sheets.
    #[arg(short = 'D')]
    debug: bool,
}


fn print_diags(diags: &Diagnostics) {
    for diagnostic in diags.iter() {
        eprintln!("{}", diagnostic);
    }
}

fn disassemble(cli: &Cli) -> i32 {
    let bytes = match fs::read(&cli.source) {
        Ok(bytes) => bytes,
        Err(error) => {
            eprintln!("{}: {}", cli.source.display(), error);
            return 4;
        }
    };
    match obj::read(&bytes, &cli.source) {
        Ok(object) => {
            print!("{}", asm::dump_all(&object.sheet, &object.include_paths));
            0
        }
        Err(message) => {
            eprintln!("{}: {}", cli.source.display(), message);
            1
        }
    }
}

fn build(cli: &Cli) -> i32 {
    let options = Options {
        optimize: cli.opt_level > 0,
        debug: cli.debug,
    };
    let mut diags = Diagnostics::new();
    let mut store = SheetStore::new();

    let id = match compile::compile_file(&mut store, &cli.source, options, &mut diags) {
        Some(id) => id,
        None => {
            print_diags(&diags);
            return 1;
        }
    };

    if cli.compile_only || cli.output.is_some() {
        let out_path = cli
            .output
            .clone()
            .unwrap_or_else(|| cli.source.with_extension("dco"));
        if let Err(error) = fs::write(&out_path, obj::write(&store, id)) {
            eprintln!("{}: {}", out_path.display(), error);
            print_diags(&diags);
            return 1;
        }
        if cli.compile_only {
            print_diags(&diags);
            return 0;
        }
    }

    let image = match compile::link_file(&mut store, id, &mut diags) {
        Some(image) => image,
        None => {
            print_diags(&diags);
            return 2;
        }
    };
    print_diags(&diags);

    let stdout = io::stdout();
    match compile::run_image(&image, &mut stdout.lock()) {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("runtime error: {}", error);
            3
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            use clap::error::ErrorKind;
            let code = match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 4,
            };
            let _ = error.print();
            process::exit(code);
        }
    };
    let code = if cli.disassemble {
        disassemble(&cli)
    } else {
        build(&cli)
    };
    process::exit(code);
}
