// Warden - Peer identification
//
// Identifies the process on the other end of a Unix domain socket from
// its peer credentials. On Linux the calling binary is additionally
// resolved through /proc/<pid>/exe and fingerprinted with SHA-256 for
// the audit trail.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tokio::net::UnixStream;

/// Information about the process that connected to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerInfo {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<u32>,
    /// Resolved path to the caller's executable, when readable.
    pub exe_path: Option<PathBuf>,
    /// SHA-256 hex digest of the caller's executable, when readable.
    pub exe_hash: Option<String>,
}

impl CallerInfo {
    /// Read peer credentials from a connected stream. The executable
    /// fingerprint is filled in separately by [`CallerInfo::fingerprint`].
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
            exe_path: None,
            exe_hash: None,
        })
    }

    /// Resolve and hash the caller's executable. Blocking; failures leave
    /// the fingerprint empty.
    pub fn fingerprint(mut self) -> Self {
        if let Some(pid) = self.pid {
            match exe_fingerprint(pid) {
                Ok((path, hash)) => {
                    self.exe_path = Some(path);
                    self.exe_hash = Some(hash);
                }
                Err(e) => tracing::debug!(pid, error = %e, "Could not fingerprint caller"),
            }
        }
        self
    }

    /// Short descriptor for logs and the connection's remote endpoint.
    pub fn descriptor(&self) -> String {
        let mut out = format!("uid:{}", self.uid);
        if let Some(pid) = self.pid {
            out.push_str(&format!(" pid:{}", pid));
        }
        if let Some(path) = &self.exe_path {
            out.push_str(&format!(" exe:{}", path.display()));
        }
        if let Some(hash) = &self.exe_hash {
            out.push_str(&format!(" hash:{}", short_hash(hash)));
        }
        out
    }
}

impl fmt::Display for CallerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor())
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}

#[cfg(target_os = "linux")]
fn exe_fingerprint(pid: u32) -> io::Result<(PathBuf, String)> {
    let exe_path = fs::read_link(format!("/proc/{}/exe", pid))?;
    let binary = fs::read(&exe_path)?;
    Ok((exe_path, hex::encode(Sha256::digest(&binary))))
}

#[cfg(not(target_os = "linux"))]
fn exe_fingerprint(_pid: u32) -> io::Result<(PathBuf, String)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "executable fingerprinting requires /proc",
    ))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peer_credentials_match_current_process() {
        let (a, _b) = UnixStream::pair().unwrap();
        let info = CallerInfo::from_stream(&a).unwrap();
        if cfg!(target_os = "linux") {
            assert_eq!(info.pid, Some(std::process::id()));
            let info = info.fingerprint();
            assert_eq!(info.exe_hash.as_ref().map(String::len), Some(64));
        }
    }

    #[test]
    fn test_descriptor_format() {
        let info = CallerInfo {
            uid: 1000,
            gid: 1000,
            pid: Some(42),
            exe_path: Some(PathBuf::from("/usr/bin/agent")),
            exe_hash: Some(
                "abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789".to_string(),
            ),
        };
        let descriptor = info.descriptor();
        assert_eq!(
            descriptor,
            "uid:1000 pid:42 exe:/usr/bin/agent hash:abcdef0123456789"
        );
        assert_eq!(info.to_string(), descriptor);
    }

    #[test]
    fn test_descriptor_without_process_details() {
        let info = CallerInfo {
            uid: 0,
            gid: 0,
            pid: None,
            exe_path: None,
            exe_hash: None,
        };
        assert_eq!(info.descriptor(), "uid:0");
    }

    #[test]
    fn test_fingerprint_of_missing_pid_is_empty() {
        let info = CallerInfo {
            uid: 0,
            gid: 0,
            pid: Some(0),
            exe_path: None,
            exe_hash: None,
        }
        .fingerprint();
        assert!(info.exe_hash.is_none());
    }
}
