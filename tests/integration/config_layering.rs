//! Configuration layering: defaults, global file, workspace files, environment.

use crate::integration::test_utils::with_env;
use draftbench::config::ConfigLoader;
use std::fs;
use tempfile::TempDir;

const CLEARED: [&str; 4] = [
    "DRAFTBENCH__LIMITS__MAX_FILES",
    "DRAFTBENCH__AGENT__LOOP_WINDOW",
    "DRAFTBENCH__CHECKPOINTS__MAX_MANUAL",
    "DRAFTBENCH__PROVIDERS__OPENAI__MODEL",
];

fn env<'a>(
    xdg: &'a str,
    extra: &[(&'a str, Option<&'a str>)],
) -> Vec<(&'a str, Option<&'a str>)> {
    let mut vars: Vec<(&str, Option<&str>)> = vec![
        ("XDG_CONFIG_HOME", Some(xdg)),
        ("DRAFTBENCH_ENV", None),
        ("DRAFTBENCH__LIMITS__MAX_FILE_SIZE", None),
    ];
    vars.extend(CLEARED.iter().map(|k| (*k, None)));
    vars.extend_from_slice(extra);
    vars
}

#[test]
fn test_layers_in_order() {
    let dir = TempDir::new().unwrap();
    let xdg = dir.path().join("xdg");
    fs::create_dir_all(xdg.join("draftbench")).unwrap();
    fs::write(
        xdg.join("draftbench").join("config.toml"),
        "[limits]\nmax_files = 5\n\n[agent]\nloop_window = 12\n",
    )
    .unwrap();

    let root = dir.path().join("project");
    fs::create_dir_all(root.join("config")).unwrap();
    fs::write(
        root.join("config").join("config.toml"),
        "[limits]\nmax_files = 7\n\n[checkpoints]\nmax_manual = 9\n",
    )
    .unwrap();

    let xdg_str = xdg.to_string_lossy().into_owned();
    let config = with_env(
        &env(&xdg_str, &[("DRAFTBENCH__CHECKPOINTS__MAX_MANUAL", Some("4"))]),
        || ConfigLoader::load(&root).unwrap(),
    );

    assert_eq!(config.limits.max_files, 7);
    assert_eq!(config.agent.loop_window, 12);
    assert_eq!(config.checkpoints.max_manual, 4);
    assert_eq!(config.limits.max_file_size, 25 * 1024 * 1024);
    assert_eq!(config.checkpoints.max_auto, 200);
    assert!(config.validate().is_ok());
}

#[test]
fn test_environment_specific_workspace_file() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("project");
    fs::create_dir_all(root.join("config")).unwrap();
    fs::write(root.join("config").join("config.toml"), "[limits]\nmax_files = 7\n").unwrap();
    fs::write(root.join("config").join("ci.toml"), "[limits]\nmax_files = 3\n").unwrap();

    let xdg = dir.path().join("empty-xdg");
    let xdg_str = xdg.to_string_lossy().into_owned();
    let config = with_env(&env(&xdg_str, &[("DRAFTBENCH_ENV", Some("ci"))]), || {
        ConfigLoader::load(&root).unwrap()
    });
    assert_eq!(config.limits.max_files, 3);
}

#[test]
fn test_invalid_values_are_all_reported() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("bad.toml");
    fs::write(
        &file,
        "[limits]\nmax_files = 0\n\n[agent]\nloop_warn_threshold = 6\nloop_stop_threshold = 5\n\n[providers.openai]\nmodel = \"\"\n",
    )
    .unwrap();

    let xdg = dir.path().join("empty-xdg");
    let xdg_str = xdg.to_string_lossy().into_owned();
    let config = with_env(&env(&xdg_str, &[]), || {
        ConfigLoader::load_from_file(&file).unwrap()
    });
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 3);
}

#[test]
fn test_missing_explicit_file() {
    let dir = TempDir::new().unwrap();
    assert!(ConfigLoader::load_from_file(&dir.path().join("nope.toml")).is_err());
}
