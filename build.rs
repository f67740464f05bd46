// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &["shaders/triangle.vert", "shaders/triangle.frag"];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    for input in SHADERS {
        compile_shader(input, &format!("{input}.spv"));
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // glslc ships with the Vulkan SDK
    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!(
                "cargo:warning=Failed to compile {}: exit code {:?}",
                input,
                status.code()
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({e}); {output} was not rebuilt");
            println!("cargo:warning=  glslc {} -o {}", input, output);
        }
    }
}
