//! Conversion pipeline against a stubbed llama.cpp checkout.
//!
//! The converter script and quantizer binary are replaced with small shell
//! stubs so the subprocess plumbing, rename choreography, and degrade
//! policy can be exercised without a real toolchain.

#![cfg(unix)]

use afinar::backend::Capabilities;
use afinar::convert::{self, f16_temp_path, ConvertError, QuantScheme, Toolchain};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Mimics convert_hf_to_gguf.py: records and writes the --outfile payload.
const FAKE_CONVERTER: &str = r#"
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--outfile" ]; then out="$arg"; fi
  prev="$arg"
done
printf '%s' "$out" > "$(dirname "$0")/outfile.txt"
printf 'F16GGUF' > "$out"
"#;

const FAILING_CONVERTER: &str = r#"
echo "missing tensor: rope.freqs" >&2
exit 1
"#;

/// Quantizer stub: records its positional arguments and writes the output.
const WORKING_QUANTIZER: &str = r#"#!/bin/sh
printf '%s\n%s\n%s\n' "$1" "$2" "$3" > "$(dirname "$0")/quantize-args.txt"
printf 'QUANTIZED' > "$2"
"#;

const FAILING_QUANTIZER: &str = r#"#!/bin/sh
echo "unsupported tensor layout" >&2
exit 1
"#;

fn fake_toolchain(dir: &Path, converter: &str) -> Toolchain {
    std::fs::write(dir.join("convert_hf_to_gguf.py"), converter).unwrap();
    Toolchain::new(dir.to_path_buf()).with_python("/bin/sh")
}

fn install_quantizer(dir: &Path, script: &str) {
    let path = dir.join("llama-quantize");
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
}

#[test]
fn f16_scheme_renames_intermediate_and_skips_quantizer() {
    let toolchain_dir = tempfile::tempdir().unwrap();
    let toolchain = fake_toolchain(toolchain_dir.path(), FAKE_CONVERTER);
    // A quantizer is present; it must not be invoked for f16.
    install_quantizer(toolchain_dir.path(), WORKING_QUANTIZER);

    let out_dir = tempfile::tempdir().unwrap();
    let model_dir = tempfile::tempdir().unwrap();
    let output = out_dir.path().join("model.gguf");

    convert::run_with_toolchain(&toolchain, model_dir.path(), &output, QuantScheme::F16).unwrap();

    assert_eq!(std::fs::read(&output).unwrap(), b"F16GGUF");
    assert!(!f16_temp_path(&output).exists());
    assert!(!toolchain_dir.path().join("quantize-args.txt").exists());

    // The converter subprocess received the _f16.gguf intermediate path.
    let seen = std::fs::read_to_string(toolchain_dir.path().join("outfile.txt")).unwrap();
    assert_eq!(Path::new(&seen), f16_temp_path(&output));
    assert!(seen.ends_with("_f16.gguf"));
}

#[test]
fn quantization_replaces_intermediate_with_final_artifact() {
    let toolchain_dir = tempfile::tempdir().unwrap();
    let toolchain = fake_toolchain(toolchain_dir.path(), FAKE_CONVERTER);
    install_quantizer(toolchain_dir.path(), WORKING_QUANTIZER);

    let out_dir = tempfile::tempdir().unwrap();
    let model_dir = tempfile::tempdir().unwrap();
    let output = out_dir.path().join("model.gguf");

    convert::run_with_toolchain(&toolchain, model_dir.path(), &output, QuantScheme::Q4KM).unwrap();

    assert_eq!(std::fs::read(&output).unwrap(), b"QUANTIZED");
    assert!(!f16_temp_path(&output).exists());

    let args = std::fs::read_to_string(toolchain_dir.path().join("quantize-args.txt")).unwrap();
    let lines: Vec<&str> = args.lines().collect();
    assert_eq!(Path::new(lines[0]), f16_temp_path(&output));
    assert_eq!(Path::new(lines[1]), output);
    assert_eq!(lines[2], "Q4_K_M");
}

#[test]
fn missing_quantizer_degrades_to_f16_under_requested_name() {
    let toolchain_dir = tempfile::tempdir().unwrap();
    let toolchain = fake_toolchain(toolchain_dir.path(), FAKE_CONVERTER);
    // No quantizer, and `make llama-quantize` has nothing to build here.

    let out_dir = tempfile::tempdir().unwrap();
    let model_dir = tempfile::tempdir().unwrap();

    // Every non-f16 scheme degrades to the same bytes an f16-only
    // conversion would have produced.
    let schemes = [
        QuantScheme::F32,
        QuantScheme::Q4_0,
        QuantScheme::Q4_1,
        QuantScheme::Q4KM,
        QuantScheme::Q4KS,
        QuantScheme::Q5_0,
        QuantScheme::Q5_1,
        QuantScheme::Q5KM,
        QuantScheme::Q6K,
        QuantScheme::Q8_0,
    ];
    for (idx, scheme) in schemes.into_iter().enumerate() {
        let output = out_dir.path().join(format!("model-{idx}.gguf"));
        convert::run_with_toolchain(&toolchain, model_dir.path(), &output, scheme).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"F16GGUF");
        assert!(!f16_temp_path(&output).exists());
    }
}

#[test]
fn failing_quantizer_degrades_to_f16_under_requested_name() {
    let toolchain_dir = tempfile::tempdir().unwrap();
    let toolchain = fake_toolchain(toolchain_dir.path(), FAKE_CONVERTER);
    install_quantizer(toolchain_dir.path(), FAILING_QUANTIZER);

    let out_dir = tempfile::tempdir().unwrap();
    let model_dir = tempfile::tempdir().unwrap();
    let output = out_dir.path().join("model.gguf");

    convert::run_with_toolchain(&toolchain, model_dir.path(), &output, QuantScheme::Q8_0).unwrap();

    assert_eq!(std::fs::read(&output).unwrap(), b"F16GGUF");
    assert!(!f16_temp_path(&output).exists());
}

#[test]
fn converter_failure_is_reported_with_captured_stderr() {
    let toolchain_dir = tempfile::tempdir().unwrap();
    let toolchain = fake_toolchain(toolchain_dir.path(), FAILING_CONVERTER);

    let out_dir = tempfile::tempdir().unwrap();
    let model_dir = tempfile::tempdir().unwrap();
    let output = out_dir.path().join("model.gguf");

    let err =
        convert::run_with_toolchain(&toolchain, model_dir.path(), &output, QuantScheme::F16)
            .unwrap_err();
    match err {
        ConvertError::ConverterFailed { stderr } => {
            assert!(stderr.contains("missing tensor"), "stderr was: {stderr}")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!output.exists());
}

#[test]
fn no_toolchain_and_no_native_exporter_fails_without_touching_output() {
    let out_dir = tempfile::tempdir().unwrap();
    let model_dir = tempfile::tempdir().unwrap();
    let output = out_dir.path().join("model.gguf");

    let err = convert::run_with(
        None,
        model_dir.path(),
        &output,
        QuantScheme::Q4KM,
        Capabilities {
            fused: false,
            native_gguf: false,
        },
    )
    .unwrap_err();
    assert!(matches!(err, ConvertError::NoToolchain));
    assert!(!output.exists());
}
