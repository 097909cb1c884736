//! In-memory stand-in for the real OS file API.

#![allow(dead_code)]

use devhook::{Handle, IoError, OpenParams, OsDevice};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

enum OpenFile {
    Null,
    File { path: String, pos: usize },
}

#[derive(Default)]
struct State {
    files: HashMap<String, Vec<u8>>,
    open: HashMap<Handle, OpenFile>,
    next: usize,
}

/// Files live in a map; handles are allocated like Win32 ones, multiples of
/// four starting at 0x100.
#[derive(Default)]
pub struct FakeOs {
    state: Mutex<State>,
    no_null_device: bool,
}

impl FakeOs {
    pub fn with_file(path: &str, contents: &[u8]) -> Self {
        let os = Self::default();
        os.lock().files.insert(path.to_string(), contents.to_vec());
        os
    }

    /// An OS whose null device cannot be opened.
    pub fn without_null_device() -> Self {
        Self {
            no_null_device: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn allocate(state: &mut State, file: OpenFile) -> Handle {
        let handle = Handle(0x100 + state.next * 4);
        state.next += 1;
        state.open.insert(handle, file);
        handle
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_null(&self, handle: Handle) -> bool {
        matches!(self.lock().open.get(&handle), Some(OpenFile::Null))
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }
}

impl OsDevice for FakeOs {
    fn open(&self, path: &str, _params: &OpenParams) -> Result<Handle, IoError> {
        let mut state = self.lock();
        if !state.files.contains_key(path) {
            return Err(IoError::NotFound);
        }
        let file = OpenFile::File {
            path: path.to_string(),
            pos: 0,
        };
        Ok(Self::allocate(&mut state, file))
    }

    fn open_null(&self) -> Result<Handle, IoError> {
        if self.no_null_device {
            return Err(IoError::NotFound);
        }
        Ok(Self::allocate(&mut self.lock(), OpenFile::Null))
    }

    fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, IoError> {
        let mut state = self.lock();
        let State { files, open, .. } = &mut *state;
        match open.get_mut(&handle) {
            Some(OpenFile::Null) => Ok(0),
            Some(OpenFile::File { path, pos }) => {
                let data = &files[path.as_str()];
                let n = buf.len().min(data.len().saturating_sub(*pos));
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            None => Err(IoError::InvalidHandle),
        }
    }

    fn write(&self, handle: Handle, buf: &[u8]) -> Result<usize, IoError> {
        let mut state = self.lock();
        let State { files, open, .. } = &mut *state;
        match open.get_mut(&handle) {
            Some(OpenFile::Null) => Ok(buf.len()),
            Some(OpenFile::File { path, pos }) => {
                let data = files.entry(path.clone()).or_default();
                data.truncate(*pos);
                data.extend_from_slice(buf);
                *pos += buf.len();
                Ok(buf.len())
            }
            None => Err(IoError::InvalidHandle),
        }
    }

    fn control(
        &self,
        handle: Handle,
        _code: u32,
        _input: &[u8],
        _output: &mut [u8],
    ) -> Result<usize, IoError> {
        if self.lock().open.contains_key(&handle) {
            Err(IoError::NotSupported)
        } else {
            Err(IoError::InvalidHandle)
        }
    }

    fn close(&self, handle: Handle) -> Result<(), IoError> {
        self.lock()
            .open
            .remove(&handle)
            .map(|_| ())
            .ok_or(IoError::InvalidHandle)
    }
}
