//! Live preview of a running generation.
//!
//! The denoising call blocks until the image is done and exposes no progress
//! callback to the job driver; the only visible progress is the composite
//! image the backend rewrites after every step. [`PreviewCoordinator`] runs
//! one background thread per job that polls the job folder for that file and
//! hands it to a [`PreviewDisplay`] whenever its size changes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::workdir::find_file_with_suffix;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const COMPOSITE_SUFFIX: &str = "_composite.png";

const PREVIEW_TITLE: &str = "stepwise composite img";

/// Shows an image to the operator. Fire-and-forget: implementations must not
/// block for long and must not panic.
pub trait PreviewDisplay: Send + Sync {
    fn show(&self, path: &Path, title: &str);
}

/// Opens the image with the platform's default viewer.
///
/// Only the most recent viewer process is kept. It is reaped, or killed when
/// still running, before the next one is spawned and when the viewer is
/// dropped, so repeated updates leave no zombies behind.
#[derive(Debug, Default)]
pub struct SystemViewer {
    program: Option<OsString>,
    last: Mutex<Option<Child>>,
}

impl SystemViewer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `program <path>` instead of the platform viewer.
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: Some(program.into()),
            last: Mutex::new(None),
        }
    }

    fn command(&self, path: &Path) -> Command {
        if let Some(program) = &self.program {
            let mut cmd = Command::new(program);
            cmd.arg(path);
            return cmd;
        }
        #[cfg(target_os = "macos")]
        {
            let mut cmd = Command::new("open");
            cmd.arg(path);
            cmd
        }
        #[cfg(target_os = "windows")]
        {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", "start", ""]).arg(path);
            cmd
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            let mut cmd = Command::new("xdg-open");
            cmd.arg(path);
            cmd
        }
    }

    fn reap(child: &mut Child) {
        match child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                let _ = child.kill();
                if let Err(e) = child.wait() {
                    tracing::debug!(error = %e, "could not reap preview viewer");
                }
            }
        }
    }
}

impl PreviewDisplay for SystemViewer {
    fn show(&self, path: &Path, title: &str) {
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if let Some(mut previous) = last.take() {
            Self::reap(&mut previous);
        }
        let spawned = self
            .command(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                tracing::debug!(path = %path.display(), title, "opened preview");
                *last = Some(child);
            }
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "could not open preview"),
        }
    }
}

impl Drop for SystemViewer {
    fn drop(&mut self) {
        let last = match self.last.get_mut() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(mut child) = last.take() {
            Self::reap(&mut child);
        }
    }
}

/// Headless display: reports the preview path in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnly;

impl PreviewDisplay for LogOnly {
    fn show(&self, path: &Path, title: &str) {
        tracing::info!(path = %path.display(), "{title} updated");
    }
}

/// Starts and stops the per-job preview poller.
///
/// At most one poller runs at a time. `stop` joins the thread, and so does
/// `Drop`, so the poller never outlives the job it watches.
pub struct PreviewCoordinator {
    display: Arc<dyn PreviewDisplay>,
    suffix: String,
    interval: Duration,
    cancelled: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PreviewCoordinator {
    pub fn new(display: Arc<dyn PreviewDisplay>) -> Self {
        Self::with_options(display, COMPOSITE_SUFFIX, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_options(
        display: Arc<dyn PreviewDisplay>,
        suffix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            display,
            suffix: suffix.into(),
            interval,
            cancelled: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Begins polling `folder`. A poller left over from a previous job is
    /// stopped first; the last seen size always starts out empty.
    pub fn start(&mut self, folder: &Path) -> std::io::Result<()> {
        self.stop();
        self.cancelled.store(false, Ordering::Release);

        let poller = Poller {
            folder: folder.to_path_buf(),
            suffix: self.suffix.clone(),
            interval: self.interval,
            cancelled: Arc::clone(&self.cancelled),
            display: Arc::clone(&self.display),
            last_size: None,
        };
        let handle = thread::Builder::new()
            .name("stepwise-preview".to_string())
            .spawn(move || poller.run())?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Signals the poller and waits for it to exit. No-op when idle.
    pub fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.cancelled.store(true, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            tracing::warn!("preview poller panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for PreviewCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Poller {
    folder: PathBuf,
    suffix: String,
    interval: Duration,
    cancelled: Arc<AtomicBool>,
    display: Arc<dyn PreviewDisplay>,
    last_size: Option<u64>,
}

impl Poller {
    fn run(mut self) {
        while !self.cancelled.load(Ordering::Acquire) {
            self.poll_once();
            // unpark() from stop() cuts the wait short
            thread::park_timeout(self.interval);
        }
    }

    fn poll_once(&mut self) {
        // The backend may be replacing the file right now; skip this round.
        let Ok(Some(path)) = find_file_with_suffix(&self.folder, &self.suffix) else {
            return;
        };
        let Ok(metadata) = std::fs::metadata(&path) else {
            return;
        };
        let size = metadata.len();
        if self.last_size != Some(size) {
            self.display.show(&path, PREVIEW_TITLE);
            self.last_size = Some(size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;

    const TICK: Duration = Duration::from_millis(10);

    #[derive(Default)]
    struct Recorder(Mutex<Vec<PathBuf>>);

    impl Recorder {
        fn calls(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    impl PreviewDisplay for Recorder {
        fn show(&self, path: &Path, _title: &str) {
            self.0.lock().unwrap().push(path.to_path_buf());
        }
    }

    fn coordinator(recorder: &Arc<Recorder>) -> PreviewCoordinator {
        PreviewCoordinator::with_options(recorder.clone(), COMPOSITE_SUFFIX, TICK)
    }

    /// Replaces the composite in one rename so the poller never sees a
    /// truncated file.
    fn publish(dir: &Path, bytes: &[u8]) {
        let tmp = dir.join(".composite.partial");
        fs::write(&tmp, bytes).unwrap();
        fs::rename(&tmp, dir.join("seed_1_composite.png")).unwrap();
    }

    fn wait_for_calls(recorder: &Recorder, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.calls() < expected {
            assert!(Instant::now() < deadline, "display was never called");
            thread::sleep(TICK);
        }
    }

    #[test]
    fn nothing_shown_without_a_composite() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("seed_1_step1of4.png"), b"frame").unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut preview = coordinator(&recorder);

        preview.start(dir.path()).unwrap();
        thread::sleep(TICK * 10);
        preview.stop();

        assert_eq!(recorder.calls(), 0);
    }

    #[test]
    fn shows_once_per_size_change() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut preview = coordinator(&recorder);
        preview.start(dir.path()).unwrap();

        publish(dir.path(), b"abc");
        wait_for_calls(&recorder, 1);
        thread::sleep(TICK * 10);
        assert_eq!(recorder.calls(), 1);

        publish(dir.path(), b"abcde");
        wait_for_calls(&recorder, 2);

        // same size, different bytes: treated as unchanged
        publish(dir.path(), b"vwxyz");
        thread::sleep(TICK * 10);
        preview.stop();

        assert_eq!(recorder.calls(), 2);
    }

    #[test]
    fn nothing_shown_after_stop_returns() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut preview = coordinator(&recorder);
        preview.start(dir.path()).unwrap();

        publish(dir.path(), b"a");
        wait_for_calls(&recorder, 1);
        preview.stop();
        assert!(!preview.is_running());

        let seen = recorder.calls();
        for len in 2..8 {
            publish(dir.path(), &vec![b'x'; len]);
            thread::sleep(TICK);
        }
        assert_eq!(recorder.calls(), seen);
    }

    #[test]
    fn immediate_stop_does_not_hang() {
        let recorder = Arc::new(Recorder::default());
        let mut preview = PreviewCoordinator::with_options(
            recorder.clone(),
            COMPOSITE_SUFFIX,
            Duration::from_secs(60),
        );
        let empty = tempfile::tempdir().unwrap();
        let with_file = tempfile::tempdir().unwrap();
        publish(with_file.path(), b"ready");

        let started = Instant::now();
        for _ in 0..20 {
            preview.start(empty.path()).unwrap();
            preview.stop();
            preview.start(with_file.path()).unwrap();
            preview.stop();
        }
        // the long interval must not be waited out
        assert!(started.elapsed() < Duration::from_secs(30));
        preview.stop();
    }

    #[test]
    fn missing_folder_is_tolerated() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut preview = coordinator(&recorder);

        preview.start(&root.path().join("not-created-yet")).unwrap();
        thread::sleep(TICK * 5);
        preview.stop();
        assert_eq!(recorder.calls(), 0);
    }

    #[test]
    fn restart_forgets_the_previous_size() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        publish(first.path(), b"same");
        publish(second.path(), b"size");
        let recorder = Arc::new(Recorder::default());
        let mut preview = coordinator(&recorder);

        preview.start(first.path()).unwrap();
        wait_for_calls(&recorder, 1);
        preview.start(second.path()).unwrap();
        wait_for_calls(&recorder, 2);
        preview.stop();

        let shown = recorder.0.lock().unwrap().clone();
        assert_eq!(shown[0].parent(), Some(first.path()));
        assert_eq!(shown[1].parent(), Some(second.path()));
    }

    #[test]
    fn drop_joins_the_poller() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        {
            let mut preview = coordinator(&recorder);
            preview.start(dir.path()).unwrap();
        }
        let seen = recorder.calls();
        publish(dir.path(), b"late");
        thread::sleep(TICK * 5);
        assert_eq!(recorder.calls(), seen);
        // only the test holds the display now
        assert_eq!(Arc::strong_count(&recorder), 1);
    }

    /// Children of this process that exited but were never waited for.
    #[cfg(target_os = "linux")]
    fn zombie_children() -> usize {
        let me = std::process::id().to_string();
        fs::read_dir("/proc")
            .unwrap()
            .filter_map(|entry| fs::read_to_string(entry.ok()?.path().join("stat")).ok())
            .filter(|stat| {
                // "<pid> (<comm>) <state> <ppid> ..."
                let Some((_, rest)) = stat.rsplit_once(')') else {
                    return false;
                };
                let mut fields = rest.split_whitespace();
                fields.next() == Some("Z") && fields.next() == Some(me.as_str())
            })
            .count()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn system_viewer_reaps_every_viewer_process() {
        let dir = tempfile::tempdir().unwrap();
        publish(dir.path(), b"img");
        let image = dir.path().join("seed_1_composite.png");

        let viewer = SystemViewer::with_program("true");
        for _ in 0..20 {
            viewer.show(&image, PREVIEW_TITLE);
            thread::sleep(Duration::from_millis(5));
        }
        // at most the latest viewer is still pending
        assert!(zombie_children() <= 1);

        drop(viewer);
        assert_eq!(zombie_children(), 0);
    }
}
