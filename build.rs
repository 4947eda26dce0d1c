// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: [(&str, &str); 2] = [
    ("shaders/blit.vert", "shaders/blit.vert.spv"),
    ("shaders/blit.frag", "shaders/blit.frag.spv"),
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/blit.vert");
    println!("cargo:rerun-if-changed=shaders/blit.frag");

    for (input, output) in SHADERS {
        compile_shader(input, output);
    }
}

// The library never loads these; only the demo binary does, at runtime.
// A missing compiler is a warning, not a build failure.
fn compile_shader(input: &str, output: &str) {
    let result = Command::new("glslc")
        .arg(Path::new(input))
        .arg("-o")
        .arg(Path::new(output))
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!(
                "cargo:warning=glslc failed on {} (exit code {:?})",
                input,
                status.code()
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), shaders were not compiled", e);
            println!("cargo:warning=compile manually: glslc {} -o {}", input, output);
        }
    }
}
