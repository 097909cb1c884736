//! Redirects the game's settings drives (`d:\`, `e:\`, `f:\`) into a local
//! directory so the host never touches real partitions.

use crate::iohook::{
    Capability, DeviceDescriptor, DeviceEmulator, IoError, OpenParams, Opened, OsDevice,
};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

pub struct SettingsRedirect {
    root: PathBuf,
    /// Lowercase drive letters.
    drives: Vec<char>,
}

impl SettingsRedirect {
    /// `drives` are prefixes such as `d:\`; only their letter matters.
    pub fn new(root: impl Into<PathBuf>, drives: &[String]) -> Self {
        let drives = drives
            .iter()
            .filter_map(|d| d.chars().next())
            .filter(char::is_ascii_alphabetic)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self {
            root: root.into(),
            drives,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check if a path should be redirected, and return the new path.
    pub fn redirect(&self, path: &str) -> Option<PathBuf> {
        let mut chars = path.chars();
        let letter = chars.next()?.to_ascii_lowercase();
        if chars.next()? != ':' || !self.drives.contains(&letter) {
            return None;
        }
        let rest = chars.as_str();
        let rest = rest.strip_prefix(['\\', '/'])?;

        let relative: PathBuf = rest.split(['\\', '/']).filter(|s| !s.is_empty()).collect();
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }

        Some(self.root.join(letter.to_string()).join(relative))
    }
}

impl DeviceEmulator for SettingsRedirect {
    type State = ();

    fn name(&self) -> &'static str {
        "settings"
    }

    fn claims(&self, desc: &DeviceDescriptor) -> bool {
        desc.has(Capability::File) && self.redirect(&desc.path).is_some()
    }

    fn open(
        &self,
        desc: &DeviceDescriptor,
        params: &OpenParams,
        os: &dyn OsDevice,
    ) -> Result<Opened<()>, IoError> {
        let target = self.redirect(&desc.path).ok_or(IoError::NotFound)?;
        debug!("settings: {} -> {}", desc.path, target.display());

        if let Some(parent) = target.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("settings: cannot create {}: {}", parent.display(), e);
            }
        }

        let handle = os.open(&target.to_string_lossy(), params)?;
        Ok(Opened::Redirected(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iohook::Handle;
    use std::sync::Mutex;

    fn drives() -> Vec<String> {
        vec![r"d:\".into(), r"e:\".into(), r"f:\".into()]
    }

    #[test]
    fn maps_drive_paths() {
        let redirect = SettingsRedirect::new("/tmp/settings", &drives());
        assert_eq!(
            redirect.redirect(r"D:\001\config.bin"),
            Some(PathBuf::from("/tmp/settings/d/001/config.bin"))
        );
        assert_eq!(
            redirect.redirect("e:/score.dat"),
            Some(PathBuf::from("/tmp/settings/e/score.dat"))
        );
        assert_eq!(redirect.redirect(r"C:\windows\win.ini"), None);
        assert_eq!(redirect.redirect("d:relative"), None);
        assert_eq!(redirect.redirect(r"f:\..\..\etc\passwd"), None);
    }

    struct RecordingOs {
        opened: Mutex<Vec<String>>,
    }

    impl OsDevice for RecordingOs {
        fn open(&self, path: &str, _: &OpenParams) -> Result<Handle, IoError> {
            self.opened.lock().unwrap().push(path.to_string());
            Ok(Handle(0x40))
        }
        fn open_null(&self) -> Result<Handle, IoError> {
            Ok(Handle(1))
        }
        fn read(&self, _: Handle, _: &mut [u8]) -> Result<usize, IoError> {
            Ok(0)
        }
        fn write(&self, _: Handle, buf: &[u8]) -> Result<usize, IoError> {
            Ok(buf.len())
        }
        fn control(&self, _: Handle, _: u32, _: &[u8], _: &mut [u8]) -> Result<usize, IoError> {
            Err(IoError::NotSupported)
        }
        fn close(&self, _: Handle) -> Result<(), IoError> {
            Ok(())
        }
    }

    #[test]
    fn open_creates_drive_directory_and_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let redirect = SettingsRedirect::new(dir.path(), &drives());
        let os = RecordingOs {
            opened: Mutex::new(Vec::new()),
        };

        let desc = DeviceDescriptor::from_path(r"d:\001\settings.bin");
        assert!(redirect.claims(&desc));
        let opened = redirect.open(&desc, &OpenParams::default(), &os).unwrap();
        assert!(matches!(opened, Opened::Redirected(Handle(0x40))));

        assert!(dir.path().join("d").join("001").is_dir());
        let opened = os.opened.lock().unwrap();
        assert_eq!(
            PathBuf::from(&opened[0]),
            dir.path().join("d").join("001").join("settings.bin")
        );
    }
}
