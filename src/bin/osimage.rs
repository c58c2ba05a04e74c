//! osimage CLI tool
//!
//! Inspect and edit bzImage kernel images.

use std::fs;
use std::io::{self, Write};
use std::process;

use osimage::{BzImage, KernelDesc};

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args: Vec<String> = std::env::args().collect();
    let program = args.remove(0);

    // The JSON flag may appear anywhere before the verb's arguments.
    let json = match args.iter().position(|a| a == "-j") {
        Some(i) => {
            args.remove(i);
            true
        }
        None => false,
    };

    match args.first().map(String::as_str) {
        Some("dump") if args.len() == 2 => cmd_dump(&args[1]),
        Some("ver") if args.len() == 2 => cmd_ver(&args[1], json),
        Some("initramfs") if args.len() == 4 => cmd_initramfs(&args[1], &args[2], &args[3]),
        Some("help") | Some("--help") | Some("-h") => {
            print_usage(&program);
            Ok(())
        }
        _ => {
            print_usage(&program);
            process::exit(1);
        }
    }
}

fn print_usage(program: &str) {
    eprintln!(
        r#"Usage: {} [-j] <command> [args...]

COMMANDS:
    dump <image>                            Print the setup header fields
    ver <image>                             Print the kernel version (-j for JSON)
    initramfs <in> <initramfs-file> <out>   Replace the embedded initramfs
"#,
        program
    );
}

fn cmd_dump(image: &str) -> Result<(), Box<dyn std::error::Error>> {
    let b = BzImage::parse(&fs::read(image)?)?;
    let stdout = io::stdout();
    b.dump(&mut stdout.lock())?;
    Ok(())
}

fn cmd_ver(image: &str, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let b = BzImage::parse(&fs::read(image)?)?;
    let kver = b.kver()?;
    if json {
        let desc = KernelDesc::parse(&kver)?;
        println!("{}", serde_json::to_string_pretty(&desc)?);
    } else {
        println!("{}", kver);
    }
    Ok(())
}

fn cmd_initramfs(
    input: &str,
    initramfs: &str,
    output: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut b = BzImage::parse(&fs::read(input)?)?;
    let new = fs::read(initramfs)?;
    b.replace_initramfs(&new)?;

    let mut out = fs::File::create(output)?;
    out.write_all(&b.to_bytes())?;
    Ok(())
}
