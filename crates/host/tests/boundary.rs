//! Boundary helpers used by front ends before anything is launched.

use std::fs;

use hbldr_common::DecoyConfig;
use hbldr_host::decoy;
use hbldr_host::{split_args, Launch, LaunchState};
use tempfile::TempDir;

#[test]
fn test_query_strings_split_like_a_shell_line() {
    let argv = split_args(r"/data/homebrew/ftpsrv.elf --root /data\ dir  -p 2121");
    assert_eq!(argv, vec!["/data/homebrew/ftpsrv.elf", "--root", "/data dir", "-p", "2121"]);
    assert_eq!(split_args("HOME=/data LANG=C"), vec!["HOME=/data", "LANG=C"]);
}

#[test]
fn test_decoy_is_created_once() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("eboot.src");
    fs::write(&base, [0x7f, b'E', b'L', b'F', 2, 1, 1]).unwrap();
    let config = DecoyConfig {
        root: dir.path().join("FAKE00000"),
        base_executable: base.clone(),
        title_name: "Loader Test".to_string(),
        ..DecoyConfig::default()
    };

    decoy::ensure(&config, || unreachable!()).unwrap();
    let param = fs::read_to_string(config.root.join("sce_sys/param.json")).unwrap();
    assert!(param.contains("\"titleName\": \"Loader Test\""));

    fs::write(&base, b"changed").unwrap();
    decoy::ensure(&config, || unreachable!()).unwrap();
    assert_eq!(fs::read(config.root.join("eboot.bin")).unwrap(), [0x7f, b'E', b'L', b'F', 2, 1, 1]);
}

#[test]
fn test_launch_cannot_run_before_patch() {
    let mut launch = Launch::new();
    launch.advance(LaunchState::Spawned).unwrap();
    launch.advance(LaunchState::StoppedAtEntry).unwrap();
    assert!(launch.advance(LaunchState::Running).is_err());
    launch.fail();
    assert_eq!(launch.state(), LaunchState::Failed);
}
