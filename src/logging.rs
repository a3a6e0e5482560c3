// src/logging.rs
//
// `tlog!`: local-time stamped lines on stderr, mirrored into a log file once
// `init_file_logging` has been called.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Log one line, e.g. `tlog!("[worker] Started on {}", device)`.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::emit(format_args!($($arg)*))
    };
}

/// Name of the link pointing at the newest log file
const LATEST_LINK: &str = "canlab.log";

static LOG_FILE: Mutex<Option<File>> = Mutex::new(None);

fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Start mirroring log lines into `<dir>/<YYYYmmdd-HHMMSS>-canlab.log`.
/// Returns the path of the new file.
pub fn init_file_logging(dir: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-canlab.log")
        .to_string();
    let path = dir.join(&filename);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    #[cfg(unix)]
    {
        let link = dir.join(LATEST_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            eprintln!("{} [logging] No {} link: {}", stamp(), LATEST_LINK, e);
        }
    }

    match LOG_FILE.lock() {
        Ok(mut guard) => *guard = Some(file),
        Err(poisoned) => *poisoned.into_inner() = Some(file),
    }
    tlog!("[logging] Writing log to {}", path.display());
    Ok(path)
}

/// Close the mirror file; stderr logging continues.
pub fn stop_file_logging() {
    let closed = match LOG_FILE.lock() {
        Ok(mut guard) => guard.take().is_some(),
        Err(poisoned) => poisoned.into_inner().take().is_some(),
    };
    if closed {
        tlog!("[logging] File logging stopped");
    }
}

#[doc(hidden)]
pub fn emit(args: std::fmt::Arguments<'_>) {
    let line = format!("{} {}", stamp(), args);
    eprintln!("{}", line);
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }
}
