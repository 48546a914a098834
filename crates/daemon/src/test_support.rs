//! Helpers shared by the unit tests: stand-in tool scripts and media fixtures.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Write an executable `/bin/sh` script named `name` into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    {
        let mut file = std::fs::File::create(&path).expect("create script");
        writeln!(file, "#!/bin/sh").expect("write script");
        writeln!(file, "{}", body).expect("write script");
        file.sync_all().expect("sync script");
    }
    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// Create a non-empty file standing in for a video.
pub fn write_media(dir: &Path, name: &str, bytes: usize) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, vec![0u8; bytes]).expect("write media fixture");
    path
}

/// Backdate the modification time of `path` by `age`.
pub fn set_age(path: &Path, age: Duration) {
    let when = SystemTime::now() - age;
    let file = std::fs::File::options()
        .write(!path.is_dir())
        .read(true)
        .open(path)
        .expect("open for mtime");
    file.set_modified(when).expect("set mtime");
}

/// Probe answering from the file name alone: container from the extension, the rest
/// fixed. Files named `*.bad.*` come back unknown.
pub struct KnownProbe;

#[async_trait::async_trait]
impl crate::probe::MediaProbe for KnownProbe {
    async fn probe(&self, path: &Path) -> crate::probe::ProbeResult {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let mut result = crate::probe::ProbeResult::unknown(path, size);
        if path.to_string_lossy().contains(".bad.") {
            return result;
        }
        result.duration_secs = Some(10.0);
        result.codec = Some("h264".to_string());
        result.resolution = Some(crate::probe::Resolution {
            width: 1280,
            height: 720,
        });
        result.frame_rate = Some(30.0);
        result
    }
}

/// Stand-in ffmpeg that records its arguments next to its output and writes the output.
#[cfg(unix)]
pub fn write_fake_ffmpeg(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "ffmpeg",
        "for last; do :; done\necho \"$@\" >> \"$(dirname \"$last\")/ffmpeg-args.log\"\nprintf merged > \"$last\"",
    )
}
