//! Keep-alive bindings that watch the client process through procfs.
//!
//! A binding is alive while `<proc_root>/<pid>` exists and its command line
//! names the target package. A watcher thread polls the directory and fires the
//! death notice once when it disappears.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use custom_tabs_core::collab::DeathNotice;
use custom_tabs_core::{KeepAliveConnection, KeepAliveConnector, KeepAliveError, KeepAliveTarget, PackageIdentity};
use tracing::{debug, info};

pub struct ProcessKeepAlive {
    proc_root: PathBuf,
    poll: Duration,
}

impl ProcessKeepAlive {
    pub fn new(proc_root: impl Into<PathBuf>, poll: Duration) -> Self {
        Self {
            proc_root: proc_root.into(),
            poll,
        }
    }
}

/// First NUL-separated token of `/proc/<pid>/cmdline`.
fn process_name(proc_dir: &Path) -> Option<String> {
    let raw = std::fs::read(proc_dir.join("cmdline")).ok()?;
    let first = raw.split(|b| *b == 0).next()?;
    let name = String::from_utf8_lossy(first).trim().to_string();
    (!name.is_empty()).then_some(name)
}

struct Watch {
    stop: Arc<AtomicBool>,
}

impl KeepAliveConnection for Watch {
    fn release(self: Box<Self>) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl KeepAliveConnector for ProcessKeepAlive {
    fn bind(
        &self,
        package: &PackageIdentity,
        target: &KeepAliveTarget,
        on_death: DeathNotice,
    ) -> Result<Box<dyn KeepAliveConnection>, KeepAliveError> {
        let pid = target
            .pid
            .ok_or_else(|| KeepAliveError::Unreachable(format!("{} has no pid", target.service)))?;
        let proc_dir = self.proc_root.join(pid.to_string());
        if !proc_dir.is_dir() {
            return Err(KeepAliveError::Unreachable(format!("pid {pid} is not running")));
        }
        if let Some(name) = process_name(&proc_dir) {
            let expected = package.as_str();
            if name != expected && !name.starts_with(&format!("{expected}:")) {
                return Err(KeepAliveError::Refused(format!(
                    "pid {pid} runs {name}, not {expected}"
                )));
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let watcher_stop = Arc::clone(&stop);
        let poll = self.poll;
        let service = target.service.clone();
        thread::Builder::new()
            .name(format!("keep-alive-{pid}"))
            .spawn(move || {
                while !watcher_stop.load(Ordering::SeqCst) {
                    if !proc_dir.is_dir() {
                        info!(pid, %service, "keep-alive target exited");
                        on_death();
                        return;
                    }
                    thread::sleep(poll);
                }
                debug!(pid, "keep-alive watch released");
            })
            .map_err(|err| KeepAliveError::Refused(format!("watcher thread: {err}")))?;
        Ok(Box::new(Watch { stop }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn fake_process(root: &Path, pid: u32, cmdline: &str) -> PathBuf {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).expect("proc dir");
        std::fs::write(dir.join("cmdline"), format!("{cmdline}\0--flag\0")).expect("cmdline");
        dir
    }

    fn target(pid: Option<u32>) -> KeepAliveTarget {
        KeepAliveTarget {
            package: "com.example.app".into(),
            service: "KeepAliveService".into(),
            pid,
        }
    }

    #[test_timeout::timeout]
    fn death_fires_once_the_process_directory_vanishes() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = fake_process(root.path(), 4242, "com.example.app:remote");
        let connector = ProcessKeepAlive::new(root.path(), Duration::from_millis(5));
        let (tx, rx) = mpsc::channel();
        let binding = connector
            .bind(
                &PackageIdentity::new("com.example.app"),
                &target(Some(4242)),
                Box::new(move || {
                    let _ = tx.send(());
                }),
            )
            .expect("bound");

        std::fs::remove_dir_all(&dir).expect("kill");
        rx.recv_timeout(Duration::from_secs(5)).expect("death notice");
        binding.release();
    }

    #[test_timeout::timeout]
    fn released_binding_stays_quiet() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = fake_process(root.path(), 7, "com.example.app");
        let connector = ProcessKeepAlive::new(root.path(), Duration::from_millis(5));
        let (tx, rx) = mpsc::channel();
        let binding = connector
            .bind(
                &PackageIdentity::new("com.example.app"),
                &target(Some(7)),
                Box::new(move || {
                    let _ = tx.send(());
                }),
            )
            .expect("bound");
        binding.release();
        thread::sleep(Duration::from_millis(30));
        std::fs::remove_dir_all(&dir).expect("kill");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test_timeout::timeout]
    fn bind_rejects_missing_or_foreign_processes() {
        let root = tempfile::tempdir().expect("tempdir");
        fake_process(root.path(), 9, "org.other");
        let connector = ProcessKeepAlive::new(root.path(), Duration::from_millis(5));
        let package = PackageIdentity::new("com.example.app");

        assert!(matches!(
            connector.bind(&package, &target(None), Box::new(|| {})),
            Err(KeepAliveError::Unreachable(_))
        ));
        assert!(matches!(
            connector.bind(&package, &target(Some(10)), Box::new(|| {})),
            Err(KeepAliveError::Unreachable(_))
        ));
        assert!(matches!(
            connector.bind(&package, &target(Some(9)), Box::new(|| {})),
            Err(KeepAliveError::Refused(_))
        ));
    }
}
