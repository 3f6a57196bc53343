extern crate glob;

use self::glob::glob;
use anyhow::{anyhow, Result};
use flate2::bufread::GzEncoder;
use flate2::Compression;
use std::env;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use vergen_gitcl::{BuildBuilder, CargoBuilder, Emitter, GitclBuilder, RustcBuilder};

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=./migrations");
    println!("cargo:rerun-if-changed=./templates");

    compress_static_files()?;
    vergen()?;
    Ok(())
}

fn vergen() -> Result<()> {
    let build = BuildBuilder::all_build()?;
    let cargo = CargoBuilder::all_cargo()?;
    let git = GitclBuilder::all_git()?;
    let rustc = RustcBuilder::all_rustc()?;

    Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&cargo)?
        .add_instructions(&git)?
        .add_instructions(&rustc)?
        .emit()?;

    Ok(())
}

/// Copies `static/*` into `OUT_DIR/static`, gzipping scripts and stylesheets.
fn compress_static_files() -> Result<()> {
    println!("cargo:rerun-if-changed=./static");
    let out_path = Path::new(&env::var("OUT_DIR")?).to_owned();
    let target_dir = out_path.join("static");
    fs::create_dir_all(&target_dir)?;

    for path in glob("static/*")?.flatten() {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("Invalid static file name: {:?}", path))?;
        let target = target_dir.join(file_name);

        if file_name.ends_with(".js") || file_name.ends_with(".css") {
            let input = BufReader::new(File::open(&path)?);
            let mut output = BufWriter::new(File::create(target_dir.join(format!("{}.gz", file_name)))?);
            let mut gz = GzEncoder::new(input, Compression::default());
            let mut buffer = Vec::new();
            gz.read_to_end(&mut buffer)?;
            output.write_all(&buffer)?;
            output.flush()?;
        } else {
            fs::copy(&path, target)?;
        }
    }

    println!(
        "cargo:rustc-env=PROCESSED_STATIC_PATH={}",
        target_dir.to_string_lossy()
    );

    Ok(())
}
