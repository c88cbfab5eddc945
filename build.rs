// Build script to compile the demo's GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &[
    "triangle.vert",
    "triangle.frag",
    "gbuffer.frag",
    "fullscreen.vert",
    "lighting.frag",
    "post.frag",
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    for shader in SHADERS {
        let input = format!("shaders/{}", shader);
        let output = format!("shaders/{}.spv", shader);
        compile_shader(&input, &output);
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
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            // The library and its tests don't need the shaders, only the demo does
            println!("cargo:warning=glslc not found ({}), {} not compiled", e, input);
        }
    }
}
