//! Accumulates a device's console text, detects the bootloader prompt,
//! and wakes waiters. Single writer (the driver's interrupt handler), any
//! number of readers.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

/// The literal U-Boot prompt this tool watches for.
const PROMPT: &str = "=>";

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("failed to open console log at {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

struct Shared {
    buffer: String,
    prompt_signaled: bool,
    shutdown: bool,
}

/// A device's console stream: appended to by the driver, read and waited
/// on by anyone holding a reference.
pub struct Console {
    shared: Mutex<Shared>,
    condvar: Condvar,
    log_file: Mutex<File>,
}

impl Console {
    /// Bind to `<temp_dir>/console-<device>.log`.
    pub fn new(temp_dir: &Path, device_name: &str) -> Result<Self, ConsoleError> {
        let log_path = temp_dir.join(format!("console-{device_name}.log"));
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| ConsoleError::Io(log_path, e))?;

        Ok(Console {
            shared: Mutex::new(Shared {
                buffer: String::new(),
                prompt_signaled: false,
                shutdown: false,
            }),
            condvar: Condvar::new(),
            log_file: Mutex::new(log_file),
        })
    }

    /// Append `chunk` to the in-memory buffer and the on-disk log. If the
    /// trimmed tail equals the literal prompt, wakes every waiter.
    pub fn append(&self, chunk: &str) {
        trace!("console append: {chunk:?}");

        let mut guard = self.shared.lock();
        guard.buffer.push_str(chunk);

        let is_prompt = guard.buffer.trim_end().ends_with(PROMPT);
        if is_prompt {
            debug!("U-Boot prompt detected");
            guard.prompt_signaled = true;
            self.condvar.notify_all();
        }
        drop(guard);

        let _ = self.log_file.lock().write_all(chunk.as_bytes());
    }

    /// Block until the prompt is next signalled or the console is shut
    /// down. Returns `false` on shutdown, `true` on prompt.
    pub fn wait_for_prompt(&self) -> bool {
        let mut guard = self.shared.lock();
        loop {
            if guard.shutdown {
                return false;
            }
            if guard.prompt_signaled {
                guard.prompt_signaled = false;
                return true;
            }
            self.condvar.wait(&mut guard);
        }
    }

    /// A snapshot of the accumulated buffer.
    pub fn get(&self) -> String {
        self.shared.lock().buffer.clone()
    }

    /// Set the shutdown flag and wake every waiter.
    pub fn shutdown(&self) {
        let mut guard = self.shared.lock();
        guard.shutdown = true;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn prompt_detected_after_trimming_trailing_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let console = Console::new(dir.path(), "test").unwrap();
        console.append("U-Boot 2021.01\n=>  \n");
        assert!(console.shared.lock().prompt_signaled);
    }

    #[test]
    fn non_prompt_append_does_not_signal() {
        let dir = tempfile::tempdir().unwrap();
        let console = Console::new(dir.path(), "test").unwrap();
        console.append("booting...\n");
        assert!(!console.shared.lock().prompt_signaled);
    }

    #[test]
    fn wait_for_prompt_returns_false_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let console = Arc::new(Console::new(dir.path(), "test").unwrap());
        let waiter = Arc::clone(&console);
        let handle = std::thread::spawn(move || waiter.wait_for_prompt());
        std::thread::sleep(std::time::Duration::from_millis(50));
        console.shutdown();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn wait_for_prompt_returns_true_on_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let console = Arc::new(Console::new(dir.path(), "test").unwrap());
        let waiter = Arc::clone(&console);
        let handle = std::thread::spawn(move || waiter.wait_for_prompt());
        std::thread::sleep(std::time::Duration::from_millis(50));
        console.append("=>");
        assert!(handle.join().unwrap());
    }

    #[test]
    fn get_returns_full_accumulated_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let console = Console::new(dir.path(), "test").unwrap();
        console.append("hello ");
        console.append("world");
        assert_eq!(console.get(), "hello world");
    }
}
