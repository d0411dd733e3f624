use std::{env, fs, path::PathBuf};

// Copies the bundled service descriptors and catalog data into OUT_DIR so
// the `swapi` module can embed them.
fn main() {
    println!("cargo:rerun-if-changed=schemas");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_schemas = out_dir.join("schemas");
    println!("cargo:rustc-env=OUT_SCHEMAS={}", out_schemas.display());
    fs::create_dir_all(&out_schemas).unwrap();

    for entry in fs::read_dir("schemas").unwrap() {
        let path = entry.unwrap().path();
        let embedded = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "json")
        );
        if !path.is_file() || !embedded {
            continue;
        }
        println!("cargo:rerun-if-changed={}", path.display());
        let file_name = path.file_name().unwrap();
        fs::copy(&path, out_schemas.join(file_name)).unwrap();
    }
}
