//! Decoy application
//!
//! Launching a title makes the supervisor fork a fresh application process,
//! which is what the hijack pathway captures. The decoy is a minimal title
//! on the system application partition: a `sce_sys/param.json` and an
//! `eboot.bin` copied from a stock system executable.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use hbldr_common::{create_logger, log, log_fail, DecoyConfig, Error, Result};
use indoc::formatdoc;

/// Application metadata for the decoy.
pub fn param_json(config: &DecoyConfig) -> String {
    formatdoc! {r#"
        {{
          "applicationCategoryType": 0,
          "attribute": 1,
          "attribute2": 0,
          "attribute3": 4,
          "titleId": "{title_id}",
          "contentId": "{content_id}",
          "localizedParameters": {{
            "defaultLanguage": "en-US",
            "en-US": {{
              "titleName": "{title_name}"
            }}
          }}
        }}
        "#,
        title_id = config.title_id,
        content_id = config.content_id,
        title_name = config.title_name,
    }
}

fn create_dir(path: &Path) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    DirBuilder::new().mode(0o755).create(path)
}

fn create_file(path: &Path, mode: u32, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).mode(mode).open(path)?;
    file.write_all(contents)
}

/// Create whatever part of the decoy is missing. Existing files are left
/// alone, so the base executable is only read the first time.
pub fn create_if_missing(config: &DecoyConfig) -> io::Result<()> {
    let root = &config.root;
    let sce_sys = root.join("sce_sys");
    create_dir(root)?;
    create_dir(&sce_sys)?;

    let param = sce_sys.join("param.json");
    if !param.exists() {
        create_file(&param, 0o644, param_json(config).as_bytes())?;
    }

    let eboot = root.join("eboot.bin");
    if !eboot.exists() {
        let image = fs::read(&config.base_executable)?;
        create_file(&eboot, 0o755, &image)?;
    }
    Ok(())
}

/// Make sure the decoy exists. When creating it fails, `remount` is given
/// one chance to make the partition writable before a second attempt.
pub fn ensure(config: &DecoyConfig, remount: impl FnOnce() -> io::Result<()>) -> Result<()> {
    let log = create_logger("decoy");
    let Err(first) = create_if_missing(config) else {
        return Ok(());
    };
    log!(log, "creating {} failed ({}), remounting", config.root.display(), first);
    remount().map_err(|e| Error::host("remount system partition", e))?;
    create_if_missing(config).map_err(|e| {
        log_fail!(log, "decoy still missing after remount: {}", e);
        Error::host("create decoy", e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn decoy_in(dir: &TempDir) -> DecoyConfig {
        let base = dir.path().join("base.bin");
        fs::write(&base, b"\x7fELF base").unwrap();
        DecoyConfig { root: dir.path().join("FAKE00000"), base_executable: base, ..DecoyConfig::default() }
    }

    #[test]
    fn test_param_json_fields() {
        let json = param_json(&DecoyConfig::default());
        assert!(json.starts_with("{\n  \"applicationCategoryType\": 0,\n"));
        assert!(json.contains("\"attribute3\": 4,"));
        assert!(json.contains("\"titleId\": \"FAKE00000\","));
        assert!(json.contains("\"contentId\": \"IV9999-FAKE00000_00-HOMEBREWLOADER00\","));
        assert!(json.contains("      \"titleName\": \"Homebrew Loader\"\n"));
        assert!(json.ends_with("}\n"));
    }

    #[test]
    fn test_create_layout() {
        let dir = TempDir::new().unwrap();
        let config = decoy_in(&dir);
        create_if_missing(&config).unwrap();

        let param = config.root.join("sce_sys/param.json");
        assert_eq!(fs::read_to_string(&param).unwrap(), param_json(&config));
        let eboot = config.root.join("eboot.bin");
        assert_eq!(fs::read(&eboot).unwrap(), b"\x7fELF base");
        assert_eq!(fs::metadata(&eboot).unwrap().permissions().mode() & 0o111, 0o111);
    }

    #[test]
    fn test_existing_files_untouched() {
        let dir = TempDir::new().unwrap();
        let config = decoy_in(&dir);
        create_if_missing(&config).unwrap();
        fs::write(config.root.join("eboot.bin"), b"patched").unwrap();
        // the base executable is not needed once the decoy exists
        fs::remove_file(&config.base_executable).unwrap();

        create_if_missing(&config).unwrap();
        assert_eq!(fs::read(config.root.join("eboot.bin")).unwrap(), b"patched");
    }

    #[test]
    fn test_ensure_without_remount() {
        let dir = TempDir::new().unwrap();
        let config = decoy_in(&dir);
        ensure(&config, || panic!("remount not expected")).unwrap();
        assert!(config.root.join("eboot.bin").exists());
    }

    #[test]
    fn test_ensure_remounts_once() {
        let dir = TempDir::new().unwrap();
        let mut config = decoy_in(&dir);
        let parent = dir.path().join("system_ex");
        config.root = parent.join("FAKE00000");

        let remounts = Cell::new(0);
        ensure(&config, || {
            remounts.set(remounts.get() + 1);
            fs::create_dir(&parent)
        })
        .unwrap();
        assert_eq!(remounts.get(), 1);
        assert!(config.root.join("sce_sys/param.json").exists());
    }

    #[test]
    fn test_ensure_gives_up() {
        let dir = TempDir::new().unwrap();
        let mut config = decoy_in(&dir);
        config.root = dir.path().join("missing/FAKE00000");

        let err = ensure(&config, || Ok(())).unwrap_err();
        assert!(matches!(err, Error::HostAcquisition { stage: "create decoy", .. }));

        let err = ensure(&config, || Err(io::Error::from_raw_os_error(libc::EPERM))).unwrap_err();
        assert!(matches!(err, Error::HostAcquisition { stage: "remount system partition", .. }));
        assert_eq!(err.raw_os_error(), libc::EPERM);
    }
}
