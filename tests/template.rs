use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use conn_pipeline::error::ConnError;
use conn_pipeline::template::{LiteralTemplate, ScriptTemplate, Substitutions};

fn workdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

#[test]
fn writes_rendered_script() {
    let (_temp, root) = workdir();
    let template = root.join("batch_conn_04_denoise.m");
    fs::write(
        &template,
        "PROJECT_DIR     = '/path/to/project/directory';\nGENERATE_QA_PLOTS = true;\n",
    )
    .unwrap();
    let output = root.join("project/batch_conn_04_denoise.m");
    let subs = Substitutions::new()
        .with(
            "PROJECT_DIR     = '/path/to/project/directory'",
            "PROJECT_DIR     = '/data/conn'",
        )
        .with("GENERATE_QA_PLOTS = true", "GENERATE_QA_PLOTS = false");

    LiteralTemplate.write_script(&template, &output, &subs).unwrap();

    assert_eq!(
        fs::read_to_string(&output).unwrap(),
        "PROJECT_DIR     = '/data/conn';\nGENERATE_QA_PLOTS = false;\n"
    );
    assert!(fs::read_to_string(&template).unwrap().contains("/path/to/project/directory"));
}

#[test]
fn unreadable_template_writes_nothing() {
    let (_temp, root) = workdir();
    let output = root.join("batch_conn_01_setup.m");

    let err = LiteralTemplate
        .write_script(
            Utf8Path::new("/nonexistent/batch_conn_01_project_setup.m"),
            &output,
            &Substitutions::new(),
        )
        .unwrap_err();

    assert_matches!(err, ConnError::TemplateRead { .. });
    assert!(!output.exists());
}

#[test]
fn unwritable_output_is_reported() {
    let (_temp, root) = workdir();
    let template = root.join("template.m");
    fs::write(&template, "NSUBJECTS           = 30;").unwrap();
    // A regular file where the output directory should be.
    fs::write(root.join("blocked"), "").unwrap();

    let err = LiteralTemplate
        .write_script(&template, &root.join("blocked/out.m"), &Substitutions::new())
        .unwrap_err();

    assert_matches!(err, ConnError::TemplateWrite { .. });
}
