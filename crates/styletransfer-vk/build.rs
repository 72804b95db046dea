use std::{env, fs, io, path};

use shaderc::{CompileOptions, Compiler, ShaderKind};

#[derive(Debug)]
enum BuildError {
    Io(io::Error),
    Shader(shaderc::Error),
}

/// One compiled module: a compute source plus the macro values pinning its
/// channel shape and declared parameter-block size. The block sizes must
/// stay in step with the weight-family table in `src/plan.rs`.
struct ModuleSource {
    source: &'static str,
    output: &'static str,
    defines: &'static [(&'static str, &'static str)],
}

const MODULES: &[ModuleSource] = &[
    ModuleSource {
        source: "from_image.comp",
        output: "from_image",
        defines: &[],
    },
    ModuleSource {
        source: "to_image.comp",
        output: "to_image",
        defines: &[],
    },
    ModuleSource {
        source: "conv_down.comp",
        output: "conv_down_low",
        defines: &[("OUT_PER_GROUP", "5"), ("BLOB_VEC4S", "38")],
    },
    ModuleSource {
        source: "conv_down.comp",
        output: "conv_down_high",
        defines: &[("OUT_PER_GROUP", "4"), ("BLOB_VEC4S", "160")],
    },
    ModuleSource {
        source: "conv_up.comp",
        output: "conv_up_low",
        defines: &[("IN_PER_GROUP", "5"), ("FUSE_RELU", "0"), ("BLOB_VEC4S", "38")],
    },
    ModuleSource {
        source: "conv_up.comp",
        output: "conv_up_high",
        defines: &[("IN_PER_GROUP", "4"), ("FUSE_RELU", "1"), ("BLOB_VEC4S", "160")],
    },
    ModuleSource {
        source: "shuffle.comp",
        output: "shuffle_low",
        defines: &[("BLOB_VEC4S", "64")],
    },
    ModuleSource {
        source: "shuffle.comp",
        output: "shuffle_high",
        defines: &[("BLOB_VEC4S", "1040")],
    },
    ModuleSource {
        source: "norm_sum.comp",
        output: "norm_sum",
        defines: &[],
    },
    ModuleSource {
        source: "norm_coeff.comp",
        output: "norm_coeff",
        defines: &[],
    },
    ModuleSource {
        source: "norm_scale.comp",
        output: "norm_scale",
        defines: &[("BLOB_VEC4S", "8")],
    },
];

fn main() -> Result<(), BuildError> {
    let mut compiler = Compiler::new().unwrap();

    let target_dir = env::var_os("OUT_DIR").unwrap();
    let target_dir = path::Path::new(&target_dir).join("spirv");
    fs::create_dir_all(&target_dir)?;

    for module in MODULES {
        let source_path = path::Path::new("src/shaders").join(module.source);
        println!("cargo:rerun-if-changed={}", source_path.display());
        let source = fs::read_to_string(&source_path)?;

        let mut options = CompileOptions::new().unwrap();
        for &(name, value) in module.defines {
            options.add_macro_definition(name, Some(value));
        }

        let binary = compiler.compile_into_spirv(
            &source,
            ShaderKind::Compute,
            module.source,
            "main",
            Some(&options),
        )?;

        fs::write(
            target_dir.join(format!("{}.spv", module.output)),
            binary.as_binary_u8(),
        )?;
    }

    Ok(())
}

impl From<io::Error> for BuildError {
    fn from(err: io::Error) -> Self {
        BuildError::Io(err)
    }
}

impl From<shaderc::Error> for BuildError {
    fn from(err: shaderc::Error) -> Self {
        BuildError::Shader(err)
    }
}
